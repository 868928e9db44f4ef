//! Canonical object hashing and object signatures.
//!
//! Objects are hashed through their JSON value form. The encoding is tagged
//! and length-prefixed, object keys are visited in sorted order, and numbers
//! are reduced to one textual form so `1` and `1.0` hash alike. An absent key
//! and a key holding `null` hash differently.

use crate::crypto::{verify_encoded, KeyPair, Sha256Hash};
use crate::error::ChainError;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use serde_json::{Map, Number, Value};
use sha2::{Digest, Sha256};

/// A rule removing top-level fields before hashing.
#[derive(Debug, Clone)]
pub enum Exclude {
    Name(&'static str),
    Pattern(Regex),
}

impl Exclude {
    pub fn matches(&self, field: &str) -> bool {
        match self {
            Exclude::Name(name) => *name == field,
            Exclude::Pattern(pattern) => pattern.is_match(field),
        }
    }
}

/// Fields left out of an object's identity hash.
pub static DEFAULT_EXCLUSIONS: Lazy<Vec<Exclude>> = Lazy::new(|| {
    vec![
        Exclude::Name("signature"),
        Exclude::Name("signatures"),
        Exclude::Name("hash"),
        Exclude::Name("compliment"),
    ]
});

/// Fields left out of a block's `hash`. `signatures` is not listed:
/// a block carrying it is rejected as having an unsupported field.
pub static BLOCK_HASH_EXCLUSIONS: Lazy<Vec<Exclude>> = Lazy::new(|| {
    vec![
        Exclude::Name("signature"),
        Exclude::Name("hash"),
        Exclude::Name("compliment"),
    ]
});

/// Fields left out of the digest that signatures are made over.
pub static SIGNATURE_EXCLUSIONS: Lazy<Vec<Exclude>> = Lazy::new(|| {
    vec![Exclude::Pattern(
        Regex::new("^signatures?$").expect("signature field pattern is valid"),
    )]
});

/// Hashes any serializable object after removing the excluded top-level fields.
pub fn hash<T: Serialize + ?Sized>(
    object: &T,
    exclude: &[Exclude],
) -> Result<Sha256Hash, ChainError> {
    let value = serde_json::to_value(object)?;
    hash_value(&value, exclude)
}

/// Hashes an object with the default exclusions.
pub fn hash_default<T: Serialize + ?Sized>(object: &T) -> Result<Sha256Hash, ChainError> {
    hash(object, &DEFAULT_EXCLUSIONS)
}

pub fn hash_value(value: &Value, exclude: &[Exclude]) -> Result<Sha256Hash, ChainError> {
    let Value::Object(map) = value else {
        return Err(ChainError::SerializationError(
            "only objects can be hashed".to_string(),
        ));
    };

    let retained: Map<String, Value> = map
        .iter()
        .filter(|(key, _)| !exclude.iter().any(|rule| rule.matches(key)))
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect();

    let mut hasher = Sha256::new();
    feed_object(&mut hasher, &retained);
    Ok(hasher.finalize().into())
}

fn feed_len(hasher: &mut Sha256, len: usize) {
    hasher.update((len as u64).to_be_bytes());
}

fn feed_str(hasher: &mut Sha256, s: &str) {
    feed_len(hasher, s.len());
    hasher.update(s.as_bytes());
}

fn feed_object(hasher: &mut Sha256, map: &Map<String, Value>) {
    let mut keys: Vec<&String> = map.keys().collect();
    keys.sort();

    hasher.update(b"o");
    feed_len(hasher, keys.len());
    for key in keys {
        feed_str(hasher, key);
        feed(hasher, &map[key.as_str()]);
    }
}

fn feed(hasher: &mut Sha256, value: &Value) {
    match value {
        Value::Null => hasher.update(b"z"),
        Value::Bool(b) => {
            hasher.update(b"b");
            hasher.update([*b as u8]);
        }
        Value::Number(n) => {
            hasher.update(b"n");
            feed_str(hasher, &canonical_number(n));
        }
        Value::String(s) => {
            hasher.update(b"s");
            feed_str(hasher, s);
        }
        Value::Array(items) => {
            hasher.update(b"a");
            feed_len(hasher, items.len());
            for item in items {
                feed(hasher, item);
            }
        }
        Value::Object(map) => feed_object(hasher, map),
    }
}

fn canonical_number(n: &Number) -> String {
    if let Some(i) = n.as_i64() {
        return i.to_string();
    }
    if let Some(u) = n.as_u64() {
        return u.to_string();
    }
    let f = n.as_f64().unwrap_or(f64::NAN);
    if f.fract() == 0.0 && f.abs() < 9.0e15 {
        (f as i64).to_string()
    } else {
        f.to_string()
    }
}

/// Objects that carry `signature` / `signatures` fields.
pub trait Signed: Serialize + Clone {
    fn signature(&self) -> Option<&str>;

    fn signatures(&self) -> Option<&[String]>;

    /// Replaces both signature fields.
    fn set_signatures(&mut self, signature: Option<String>, signatures: Option<Vec<String>>);

    /// Keys checked when `verify` is given none.
    fn default_signers(&self) -> Vec<String>;

    /// The signatures to check: the array if present and non-empty, else the scalar.
    fn collected_signatures(&self) -> Vec<&str> {
        match self.signatures() {
            Some(many) if !many.is_empty() => many.iter().map(String::as_str).collect(),
            _ => self.signature().into_iter().collect(),
        }
    }
}

/// Digest every signature of `object` is made over.
pub fn signing_hash<T: Signed>(object: &T) -> Result<Sha256Hash, ChainError> {
    hash(object, &SIGNATURE_EXCLUSIONS)
}

/// Signs `object` with every key. One key fills `signature`, several keys
/// fill `signatures` in key order. Existing signatures are discarded first.
pub fn sign<T: Signed>(object: &T, keys: &[KeyPair]) -> Result<T, ChainError> {
    if keys.is_empty() {
        return Err(ChainError::CryptoError(
            "must specify at least one key".to_string(),
        ));
    }

    let mut signed = object.clone();
    signed.set_signatures(None, None);
    let digest = signing_hash(&signed)?;

    let mut signatures: Vec<String> = keys
        .iter()
        .map(|key| crate::crypto::encode(key.sign_hash(&digest)))
        .collect();

    if signatures.len() == 1 {
        signed.set_signatures(signatures.pop(), None);
    } else {
        signed.set_signatures(None, Some(signatures));
    }
    Ok(signed)
}

/// Checks that every public key has produced at least one of the object's
/// signatures. Without explicit keys the object's own signers are used.
/// Unsigned objects, and an empty key list, never verify.
pub fn verify<T: Signed>(object: &T, public_keys: Option<&[String]>) -> bool {
    let signatures = object.collected_signatures();
    if signatures.is_empty() {
        return false;
    }

    let digest = match signing_hash(object) {
        Ok(digest) => digest,
        Err(_) => return false,
    };

    let keys = match public_keys {
        Some(keys) => keys.to_vec(),
        None => object.default_signers(),
    };
    if keys.is_empty() {
        return false;
    }

    keys.iter().all(|key| {
        signatures
            .iter()
            .any(|signature| verify_encoded(&digest, signature, key))
    })
}
