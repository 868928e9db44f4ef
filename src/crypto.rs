//! Cryptographic primitives for BYOB
//!
//! Keys live on secp256k1. Private keys are 32-byte scalars, public keys are
//! the 33-byte compressed point encoding. Everything that crosses the wire
//! is unpadded base64url.

use crate::error::ChainError;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use once_cell::sync::Lazy;
use rand::rngs::OsRng;
use secp256k1::{
    constants::{PUBLIC_KEY_SIZE, SECRET_KEY_SIZE},
    ecdsa::Signature,
    All, Message, PublicKey, Secp256k1, SecretKey,
};

/// A thread-safe, lazily initialized Secp256k1 context.
/// This prevents repeated, unnecessary context creation.
static SECP256K1_CONTEXT: Lazy<Secp256k1<All>> = Lazy::new(Secp256k1::new);

pub type Sha256Hash = [u8; 32];

/// Length of an encoded 32-byte value (hashes, private keys, compliments).
pub const ENCODED_HASH_LEN: usize = 43;

/// Length of an encoded compressed public key.
pub const ENCODED_PUBLIC_KEY_LEN: usize = 44;

/// Encodes bytes as unpadded base64url.
pub fn encode(bytes: impl AsRef<[u8]>) -> String {
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Decodes base64. Both the url-safe and the standard alphabet are accepted,
/// with or without padding.
pub fn decode(encoded: &str) -> Result<Vec<u8>, ChainError> {
    let normalized: String = encoded
        .trim_end_matches('=')
        .chars()
        .map(|c| match c {
            '+' => '-',
            '/' => '_',
            other => other,
        })
        .collect();

    URL_SAFE_NO_PAD
        .decode(normalized)
        .map_err(|e| ChainError::CryptoError(format!("Invalid base64: {}", e)))
}

/// Decodes base64 into a fixed-size array.
pub fn decode_array<const N: usize>(encoded: &str) -> Result<[u8; N], ChainError> {
    let bytes = decode(encoded)?;
    let len = bytes.len();
    bytes
        .try_into()
        .map_err(|_| ChainError::CryptoError(format!("Expected {} bytes, got {}", N, len)))
}

/// Shortens a public key or hash for display.
pub fn abbreviate(encoded: &str) -> String {
    if encoded.is_empty() {
        return "<na>".to_string();
    }

    let chars: Vec<char> = encoded.chars().collect();
    if chars.len() <= ENCODED_HASH_LEN {
        chars.iter().take(10).collect()
    } else {
        let head: String = chars[..4].iter().collect();
        let tail: String = chars[chars.len() - 4..].iter().collect();
        format!("{}..{}", head, tail)
    }
}

/// Checks that every character belongs to a base64 alphabet.
///
/// Both the url-safe and the standard alphabet pass, with or without
/// padding, since [`decode`] accepts both. Hash-shaped fields such as
/// `compliment` are therefore sniffed leniently.
pub fn is_valid_base64(s: &str) -> bool {
    s.trim_end_matches('=')
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '+' | '/'))
}

/// Checks that `key` is an encoded compressed secp256k1 public key.
///
/// The leading `A` check is only a cheap format sniff: a compressed point
/// starts with 0x02 or 0x03, both of which encode to `A`.
pub fn is_valid_public_key(key: &str) -> bool {
    key.len() == ENCODED_PUBLIC_KEY_LEN
        && key.starts_with('A')
        && is_valid_base64(key)
        && decode(key)
            .map(|bytes| is_valid_public_key_bytes(&bytes))
            .unwrap_or(false)
}

pub fn is_valid_public_key_bytes(bytes: &[u8]) -> bool {
    bytes.len() == PUBLIC_KEY_SIZE
        && (bytes[0] == 2 || bytes[0] == 3)
        && PublicKey::from_slice(bytes).is_ok()
}

/// Checks that `key` is an encoded private key (a scalar below the curve order).
pub fn is_valid_private_key(key: &str) -> bool {
    key.len() == ENCODED_HASH_LEN
        && is_valid_base64(key)
        && decode(key)
            .map(|bytes| bytes.len() == SECRET_KEY_SIZE && SecretKey::from_slice(&bytes).is_ok())
            .unwrap_or(false)
}

/// Checks that `hash` is an encoded 32-byte value.
pub fn is_valid_hash(hash: &str) -> bool {
    hash.len() == ENCODED_HASH_LEN
        && is_valid_base64(hash)
        && decode(hash).map(|bytes| bytes.len() == 32).unwrap_or(false)
}

#[derive(Debug, Clone)]
pub struct KeyPair {
    pub secret_key: SecretKey,
    pub public_key: PublicKey,
}

impl KeyPair {
    /// Generates a new random KeyPair using the OS random number generator.
    pub fn generate() -> Self {
        let secret_key = SecretKey::new(&mut OsRng);
        Self::from_secret_key(secret_key)
    }

    /// Creates a KeyPair from an existing SecretKey.
    pub fn from_secret_key(secret_key: SecretKey) -> Self {
        let public_key = PublicKey::from_secret_key(&SECP256K1_CONTEXT, &secret_key);
        KeyPair {
            secret_key,
            public_key,
        }
    }

    /// Creates a KeyPair from raw secret key bytes.
    pub fn from_secret_bytes(bytes: &[u8]) -> Result<Self, ChainError> {
        let secret_key = SecretKey::from_slice(bytes).map_err(|e| {
            if bytes.len() != SECRET_KEY_SIZE {
                ChainError::CryptoError(format!(
                    "Secret key must be {} bytes, got {}",
                    SECRET_KEY_SIZE,
                    bytes.len()
                ))
            } else {
                ChainError::CryptoError(format!("Invalid secret key bytes: {}", e))
            }
        })?;

        Ok(Self::from_secret_key(secret_key))
    }

    /// Creates a KeyPair from an encoded private key.
    pub fn from_encoded(private_key: &str) -> Result<Self, ChainError> {
        Self::from_secret_bytes(&decode(private_key)?)
    }

    /// Returns the KeyPair's public key as a compressed byte array.
    pub fn public_key_bytes(&self) -> [u8; PUBLIC_KEY_SIZE] {
        self.public_key.serialize()
    }

    /// The public key in its wire form.
    pub fn public_key_encoded(&self) -> String {
        encode(self.public_key_bytes())
    }

    /// The private key in its wire form.
    pub fn secret_key_encoded(&self) -> String {
        encode(self.secret_key.secret_bytes())
    }

    /// Signs a 32-byte digest and returns the DER encoded signature.
    pub fn sign_hash(&self, hash: &Sha256Hash) -> Vec<u8> {
        let message = Message::from_digest(*hash);
        let signature = SECP256K1_CONTEXT.sign_ecdsa(&message, &self.secret_key);
        signature.serialize_der().to_vec()
    }
}

/// Generates a fresh private key.
pub fn generate_key() -> KeyPair {
    KeyPair::generate()
}

/// Derives the encoded public key for an encoded private key.
pub fn public_key_from_private_key(private_key: &str) -> Result<String, ChainError> {
    Ok(KeyPair::from_encoded(private_key)?.public_key_encoded())
}

/// Verifies a DER encoded ECDSA signature over a 32-byte digest.
pub fn verify_signature(
    public_key_bytes: &[u8],
    hash: &Sha256Hash,
    signature_bytes: &[u8],
) -> Result<(), ChainError> {
    if public_key_bytes.len() != PUBLIC_KEY_SIZE {
        return Err(ChainError::CryptoError(format!(
            "Public key must be exactly {} bytes (compressed), got {}",
            PUBLIC_KEY_SIZE,
            public_key_bytes.len()
        )));
    }

    let public_key = PublicKey::from_slice(public_key_bytes)
        .map_err(|e| ChainError::CryptoError(format!("Invalid public key: {}", e)))?;

    let mut signature = Signature::from_der(signature_bytes)
        .map_err(|e| ChainError::CryptoError(format!("Invalid signature: {}", e)))?;
    // Signatures from other implementations may carry a high S value.
    signature.normalize_s();

    let message = Message::from_digest(*hash);
    SECP256K1_CONTEXT
        .verify_ecdsa(&message, &signature, &public_key)
        .map_err(|_| ChainError::CryptoError("Signature verification failed".to_string()))
}

/// Verifies an encoded signature against an encoded public key. Malformed
/// input is reported as a failed verification.
pub fn verify_encoded(hash: &Sha256Hash, signature: &str, public_key: &str) -> bool {
    match (decode(public_key), decode(signature)) {
        (Ok(key), Ok(sig)) => verify_signature(&key, hash, &sig).is_ok(),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sha2::{Digest, Sha256};

    fn digest(data: &[u8]) -> Sha256Hash {
        Sha256::digest(data).into()
    }

    #[test]
    fn test_key_generation() {
        let keypair = KeyPair::generate();
        assert_eq!(keypair.public_key_bytes().len(), PUBLIC_KEY_SIZE);
        assert_eq!(keypair.secret_key.as_ref().len(), SECRET_KEY_SIZE);
        assert_eq!(keypair.public_key_encoded().len(), ENCODED_PUBLIC_KEY_LEN);
        assert_eq!(keypair.secret_key_encoded().len(), ENCODED_HASH_LEN);
    }

    #[test]
    fn test_public_key_derivation_is_stable() {
        let keypair = KeyPair::generate();
        let derived = public_key_from_private_key(&keypair.secret_key_encoded()).unwrap();
        assert_eq!(derived, keypair.public_key_encoded());
    }

    #[test]
    fn test_encode_decode() {
        let bytes = [1u8, 2, 3, 4, 250, 251, 252];
        let encoded = encode(bytes);
        assert!(!encoded.contains('='));
        assert_eq!(decode(&encoded).unwrap(), bytes.to_vec());
        assert_ne!(encode([1u8, 2, 3, 4]), encode([2u8, 3, 4, 5]));
    }

    #[test]
    fn test_decode_accepts_standard_alphabet() {
        let bytes = [0xfbu8, 0xff, 0xbf];
        assert_eq!(decode("+/+/").unwrap(), bytes.to_vec());
        assert_eq!(decode("-_-_").unwrap(), bytes.to_vec());
        assert_eq!(decode("AQID").unwrap(), decode("AQID==").unwrap());
    }

    #[test]
    fn test_signing_and_verification() {
        let keypair = KeyPair::generate();
        let hash = digest(b"Hello, BYOB!");

        let signature = keypair.sign_hash(&hash);
        let result = verify_signature(&keypair.public_key_bytes(), &hash, &signature);
        assert!(result.is_ok());
        assert!(verify_encoded(
            &hash,
            &encode(&signature),
            &keypair.public_key_encoded()
        ));
    }

    #[test]
    fn test_invalid_signature() {
        let keypair1 = KeyPair::generate();
        let keypair2 = KeyPair::generate();
        let hash = digest(b"Test message");

        let signature = keypair1.sign_hash(&hash);
        let result = verify_signature(&keypair2.public_key_bytes(), &hash, &signature);
        assert_eq!(
            result.unwrap_err().to_string(),
            "Cryptographic error: Signature verification failed"
        );
    }

    #[test]
    fn test_tampered_hash() {
        let keypair = KeyPair::generate();
        let signature = keypair.sign_hash(&digest(b"Original message"));
        let result = verify_signature(
            &keypair.public_key_bytes(),
            &digest(b"Tampered message"),
            &signature,
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_verify_encoded_rejects_garbage() {
        let keypair = KeyPair::generate();
        let hash = digest(b"x");
        assert!(!verify_encoded(&hash, "%%%", &keypair.public_key_encoded()));
        assert!(!verify_encoded(&hash, "AAAA", &keypair.public_key_encoded()));
    }

    #[test]
    fn test_from_secret_bytes_invalid_length() {
        let short_bytes = [0u8; SECRET_KEY_SIZE - 1];
        let result = KeyPair::from_secret_bytes(&short_bytes);
        assert!(result
            .unwrap_err()
            .to_string()
            .contains("Secret key must be"));
    }

    #[test]
    fn test_abbreviate() {
        let keypair = KeyPair::generate();
        let public = keypair.public_key_encoded();
        let private = keypair.secret_key_encoded();

        let short_pub = abbreviate(&public);
        assert_eq!(short_pub.len(), 10);
        assert_eq!(&short_pub[..4], &public[..4]);
        assert_eq!(&short_pub[6..], &public[40..]);

        assert_eq!(abbreviate(&private), private[..10].to_string());
        assert_eq!(abbreviate(""), "<na>");
    }

    #[test]
    fn test_format_checks() {
        let keypair = KeyPair::generate();
        let public = keypair.public_key_encoded();
        let private = keypair.secret_key_encoded();

        assert!(is_valid_base64("blahdiblah"));
        assert!(!is_valid_base64("%(*^$^"));

        assert!(is_valid_public_key(&public));
        assert!(!is_valid_public_key("A"));
        assert!(!is_valid_public_key(&format!("B{}", &public[1..])));
        assert!(!is_valid_public_key(&format!("{}#{}", &public[..6], &public[7..])));

        assert!(is_valid_private_key(&private));
        assert!(!is_valid_private_key(&private[..38]));
        assert!(!is_valid_private_key(&encode([0xffu8; 32])));

        assert!(is_valid_hash(&encode([7u8; 32])));
        assert!(!is_valid_hash(&encode([7u8; 31])));
        assert!(!is_valid_hash("2o#57mhaLjzkp4Pnr0xk_JCb7-Ehs3NzN73gjohOr2s"));
    }

    #[test]
    fn test_hash_sniff_accepts_both_alphabets() {
        let url_safe = encode([0xfbu8; 32]);
        assert!(url_safe.contains('-') || url_safe.contains('_'));
        let standard = url_safe.replace('-', "+").replace('_', "/");

        assert!(is_valid_base64(&standard));
        assert!(is_valid_hash(&url_safe));
        assert!(is_valid_hash(&standard));
        assert_eq!(decode(&standard).unwrap(), decode(&url_safe).unwrap());
    }
}
