//! Error types for the BYOB ledger
//!
//! Validation failures are not errors: validators return a list of messages.
//! `ChainError` is reserved for faults the caller cannot simply discard, such
//! as store integrity violations or a missing signing key.

use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum ChainError {
    #[error("Cryptographic error: {0}")]
    CryptoError(String),

    #[error("Invalid block: {0}")]
    InvalidBlock(String),

    #[error("Orphan block: parent {0} is not stored")]
    OrphanBlock(String),

    #[error("Invalid block height. Expected {expected}, but got {actual}")]
    HeightMismatch { expected: u64, actual: u64 },

    #[error("Broken ancestry: {0}")]
    BrokenAncestry(String),

    #[error("Cannot sign for {0}. No corresponding private key is stored")]
    MissingPrivateKey(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Database error: {0}")]
    DatabaseError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("Solver error: {0}")]
    SolverError(String),

    #[error("IO error: {0}")]
    IoError(String),
}

impl From<std::io::Error> for ChainError {
    fn from(err: std::io::Error) -> Self {
        ChainError::IoError(err.to_string())
    }
}

impl From<serde_json::Error> for ChainError {
    fn from(err: serde_json::Error) -> Self {
        ChainError::SerializationError(err.to_string())
    }
}

impl From<rusqlite::Error> for ChainError {
    fn from(err: rusqlite::Error) -> Self {
        ChainError::DatabaseError(err.to_string())
    }
}

impl From<toml::de::Error> for ChainError {
    fn from(err: toml::de::Error) -> Self {
        ChainError::ConfigError(err.to_string())
    }
}

/// Convenience alias used across the crate
pub type Result<T> = std::result::Result<T, ChainError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_key_message() {
        let err = ChainError::MissingPrivateKey("AmId..ocbb".to_string());
        assert_eq!(
            err.to_string(),
            "Cannot sign for AmId..ocbb. No corresponding private key is stored"
        );
    }

    #[test]
    fn test_height_mismatch_message() {
        let err = ChainError::HeightMismatch {
            expected: 4,
            actual: 7,
        };
        assert_eq!(err.to_string(), "Invalid block height. Expected 4, but got 7");
    }

    #[test]
    fn test_io_error_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err: ChainError = io.into();
        assert!(matches!(err, ChainError::IoError(_)));
    }
}
