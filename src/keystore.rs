//! Private key storage and signing
//!
//! A key store maps encoded public keys to encoded private keys. The node
//! only ever asks it for the public keys it holds and for a [`Signer`]
//! bound to some of them.

use crate::canonical::{self, Signed};
use crate::crypto::{abbreviate, is_valid_private_key, KeyPair};
use crate::error::ChainError;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Signs objects with a fixed set of keys.
#[derive(Debug, Clone)]
pub struct Signer {
    keys: Vec<KeyPair>,
}

impl Signer {
    pub fn new(keys: Vec<KeyPair>) -> Self {
        Signer { keys }
    }

    pub fn public_keys(&self) -> Vec<String> {
        self.keys.iter().map(KeyPair::public_key_encoded).collect()
    }

    pub fn sign<T: Signed>(&self, object: &T) -> Result<T, ChainError> {
        canonical::sign(object, &self.keys)
    }
}

pub trait KeyStore: Send + Sync {
    /// Public keys with a stored private key, in a stable order.
    fn public_keys(&self) -> Vec<String>;

    /// Stores an encoded private key and returns its public key.
    fn add_private_key(&self, private_key: &str) -> Result<String, ChainError>;

    /// A signer for `public_keys`. Fails on the first key with no stored
    /// private key.
    fn signer(&self, public_keys: &[String]) -> Result<Signer, ChainError>;

    fn is_empty(&self) -> bool {
        self.public_keys().is_empty()
    }

    /// Generates, stores and returns a fresh key.
    fn generate_key(&self) -> Result<String, ChainError> {
        let key = KeyPair::generate();
        self.add_private_key(&key.secret_key_encoded())
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct KeyFile {
    #[serde(default)]
    keys: BTreeMap<String, String>,
}

fn checked_pair(private_key: &str) -> Result<KeyPair, ChainError> {
    if !is_valid_private_key(private_key) {
        return Err(ChainError::CryptoError("Invalid private key".to_string()));
    }
    KeyPair::from_encoded(private_key)
}

fn signer_from(keys: &BTreeMap<String, String>, public_keys: &[String]) -> Result<Signer, ChainError> {
    let pairs = public_keys
        .iter()
        .map(|public| {
            let private = keys
                .get(public)
                .ok_or_else(|| ChainError::MissingPrivateKey(abbreviate(public)))?;
            KeyPair::from_encoded(private)
        })
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Signer::new(pairs))
}

/// Keys held only in memory.
#[derive(Debug, Default)]
pub struct MemoryKeyStore {
    keys: RwLock<BTreeMap<String, String>>,
}

impl MemoryKeyStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyStore for MemoryKeyStore {
    fn public_keys(&self) -> Vec<String> {
        self.keys.read().keys().cloned().collect()
    }

    fn add_private_key(&self, private_key: &str) -> Result<String, ChainError> {
        let public = checked_pair(private_key)?.public_key_encoded();
        self.keys.write().insert(public.clone(), private_key.to_string());
        Ok(public)
    }

    fn signer(&self, public_keys: &[String]) -> Result<Signer, ChainError> {
        signer_from(&self.keys.read(), public_keys)
    }
}

/// Keys kept in a JSON file of the form `{"keys": {public: private}}`.
/// Every change rewrites the file.
#[derive(Debug)]
pub struct FileKeyStore {
    path: PathBuf,
    keys: RwLock<BTreeMap<String, String>>,
}

impl FileKeyStore {
    /// Opens `path`, starting empty if it does not exist yet.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, ChainError> {
        let path = path.as_ref().to_path_buf();
        let keys = if path.exists() {
            let contents = fs::read_to_string(&path)?;
            let file: KeyFile = serde_json::from_str(&contents)?;
            debug!("Loaded {} keys from {}", file.keys.len(), path.display());
            file.keys
        } else {
            BTreeMap::new()
        };

        Ok(FileKeyStore {
            path,
            keys: RwLock::new(keys),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn save(&self, keys: &BTreeMap<String, String>) -> Result<(), ChainError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let json = serde_json::to_string_pretty(&KeyFile { keys: keys.clone() })?;

        // write to a temporary file, then rename over the old one
        let temp_path = self.path.with_extension("tmp");
        let mut file = File::create(&temp_path)?;
        restrict_permissions(&temp_path)?;
        file.write_all(json.as_bytes())?;
        file.sync_all()?;
        drop(file);

        fs::rename(&temp_path, &self.path)?;
        Ok(())
    }
}

#[cfg(unix)]
fn restrict_permissions(path: &Path) -> Result<(), ChainError> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
    Ok(())
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path) -> Result<(), ChainError> {
    Ok(())
}

impl KeyStore for FileKeyStore {
    fn public_keys(&self) -> Vec<String> {
        self.keys.read().keys().cloned().collect()
    }

    fn add_private_key(&self, private_key: &str) -> Result<String, ChainError> {
        let public = checked_pair(private_key)?.public_key_encoded();
        let mut keys = self.keys.write();
        if keys.insert(public.clone(), private_key.to_string()).is_none() {
            self.save(&keys)?;
            info!("Stored key {} in {}", abbreviate(&public), self.path.display());
        }
        Ok(public)
    }

    fn signer(&self, public_keys: &[String]) -> Result<Signer, ChainError> {
        signer_from(&self.keys.read(), public_keys)
    }
}
