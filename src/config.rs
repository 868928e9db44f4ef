//! Configuration management for BYOB
//!
//! Settings come from an optional TOML file, then from `BYOB_*` environment
//! variables, then fall back to defaults.

use crate::crypto::decode_array;
use crate::error::ChainError;
use crate::miner::Target;
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

pub const DEFAULT_TARGET: &str = "AAABrX8pq8r0hXh6ZSDsCNI2mRlBGaXDc4e3GQZhQxA";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub chain: ChainConfig,
    pub storage: StorageConfig,
    pub node: NodeConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ChainConfig {
    pub block_reward: f64,
    /// Base64url encoded 32-byte big-endian target.
    pub target: String,
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self {
            block_reward: 1.0,
            target: DEFAULT_TARGET.to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub keys_file: PathBuf,
    pub db_file: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            keys_file: default_keys_file(),
            db_file: PathBuf::from("./byob.db"),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub mining: bool,
    pub sync_debounce_ms: u64,
    /// Forks whose tip falls this far below the highest block are removed.
    /// Zero keeps every fork.
    pub prune_depth: u64,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            mining: true,
            sync_debounce_ms: 1000,
            prune_depth: 0,
        }
    }
}

/// The validated values the ledger runs with.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChainParams {
    pub block_reward: f64,
    pub target: Target,
}

impl Config {
    pub fn from_toml(contents: &str) -> Result<Self, ChainError> {
        Ok(toml::from_str(contents)?)
    }

    /// Applies `BYOB_*` overrides read through `lookup`.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ChainError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(reward) = lookup("BYOB_BLOCK_REWARD") {
            self.chain.block_reward = reward.trim().parse().map_err(|_| {
                ChainError::ConfigError(format!("BYOB_BLOCK_REWARD is not a number: {}", reward))
            })?;
        }
        if let Some(target) = lookup("BYOB_TARGET") {
            self.chain.target = target;
        }
        if let Some(keys_file) = lookup("BYOB_KEYS_FILE") {
            self.storage.keys_file = PathBuf::from(keys_file);
        }
        if let Some(db_file) = lookup("BYOB_DB_FILE") {
            self.storage.db_file = PathBuf::from(db_file);
        }
        Ok(())
    }

    pub fn params(&self) -> Result<ChainParams, ChainError> {
        let reward = self.chain.block_reward;
        if !reward.is_finite() || reward < 0.0 {
            return Err(ChainError::ConfigError(format!(
                "block_reward must be a non-negative number, got {}",
                reward
            )));
        }

        let target = decode_array::<32>(&self.chain.target).map_err(|e| {
            ChainError::ConfigError(format!("target must encode 32 bytes: {}", e))
        })?;

        Ok(ChainParams {
            block_reward: reward,
            target,
        })
    }
}

/// Loads `path` if given (a missing file is an error), applies the process
/// environment and validates the result.
pub fn load_config(path: Option<&Path>) -> Result<Config, ChainError> {
    let mut config = match path {
        Some(path) => {
            let contents = fs::read_to_string(path).map_err(|e| {
                ChainError::ConfigError(format!("Failed to read {}: {}", path.display(), e))
            })?;
            Config::from_toml(&contents)?
        }
        None => Config::default(),
    };

    config.apply_overrides(|name| std::env::var(name).ok())?;
    config.params()?;
    Ok(config)
}

fn default_keys_file() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".byobkeys.json")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.chain.block_reward, 1.0);
        assert!(config.node.mining);
        assert_eq!(config.node.sync_debounce_ms, 1000);
        assert!(config.storage.keys_file.ends_with(".byobkeys.json"));

        let params = config.params().unwrap();
        assert_eq!(&params.target[..3], &[0x00, 0x00, 0x01]);
    }

    #[test]
    fn test_partial_toml() {
        let config = Config::from_toml(
            r#"
            [chain]
            block_reward = 2.5

            [node]
            mining = false
            "#,
        )
        .unwrap();
        assert_eq!(config.chain.block_reward, 2.5);
        assert_eq!(config.chain.target, DEFAULT_TARGET);
        assert!(!config.node.mining);
        assert_eq!(config.node.prune_depth, 0);
    }

    #[test]
    fn test_env_overrides() {
        let mut config = Config::default();
        config
            .apply_overrides(lookup(&[
                ("BYOB_BLOCK_REWARD", "3"),
                ("BYOB_DB_FILE", "/tmp/other.db"),
            ]))
            .unwrap();
        assert_eq!(config.chain.block_reward, 3.0);
        assert_eq!(config.storage.db_file, PathBuf::from("/tmp/other.db"));

        assert!(config
            .apply_overrides(lookup(&[("BYOB_BLOCK_REWARD", "lots")]))
            .is_err());
    }

    #[test]
    fn test_invalid_params() {
        let mut config = Config::default();
        config.chain.target = "short".to_string();
        assert!(config.params().is_err());

        let mut config = Config::default();
        config.chain.block_reward = -1.0;
        assert!(config.params().is_err());
    }

    #[test]
    fn test_load_config_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[storage]\nkeys_file = \"/tmp/keys.json\"").unwrap();
        let config = load_config(Some(file.path())).unwrap();
        assert_eq!(config.storage.keys_file, PathBuf::from("/tmp/keys.json"));

        assert!(load_config(Some(Path::new("/definitely/not/here.toml"))).is_err());
    }
}
