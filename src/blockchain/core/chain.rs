use crate::canonical::{self, Signed, BLOCK_HASH_EXCLUSIONS};
use crate::crypto::{abbreviate, decode_array, encode, Sha256Hash};
use crate::error::ChainError;
use crate::keystore::Signer;
use crate::miner::Compliment;
use crate::transaction::Transaction;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::validation::validate_block_unsigned;

/// Largest height a block may carry. Heights travel as JSON numbers, so
/// anything past the exactly representable integers is refused.
pub const MAX_SAFE_HEIGHT: u64 = (1 << 53) - 1;

fn unusable_height() -> u64 {
    u64::MAX
}

fn lenient_height<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    let height = match value.as_u64() {
        Some(height) => Some(height),
        None => value
            .as_f64()
            .filter(|h| h.fract() == 0.0 && *h >= 0.0 && *h <= MAX_SAFE_HEIGHT as f64)
            .map(|h| h as u64),
    };
    Ok(height.unwrap_or_else(unusable_height))
}

/// A block as it travels between nodes and is kept in the store.
///
/// Like transactions, optional fields and `extra` let the validator describe
/// a malformed block instead of the decoder rejecting it outright.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Block {
    #[serde(default)]
    pub transactions: Vec<Transaction>,
    /// Missing or unusable heights decode as `u64::MAX` so validation
    /// reports them.
    #[serde(default = "unusable_height", deserialize_with = "lenient_height")]
    pub height: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compliment: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signatures: Option<Vec<String>>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Block {
    /// Creates an unsolved, unsigned block. The compliment is all zeros, so the
    /// block still needs a proof of work and a signature before it is accepted.
    pub fn new(
        transactions: Vec<Transaction>,
        height: u64,
        parent: Option<String>,
        author: impl Into<String>,
    ) -> Result<Self, ChainError> {
        let block = Block {
            transactions,
            height,
            parent,
            author: Some(author.into()),
            compliment: Some(encode([0u8; 32])),
            ..Default::default()
        }
        .hashed()?;

        let errors = validate_block_unsigned(&block);
        if !errors.is_empty() {
            return Err(ChainError::InvalidBlock(errors.join(". ")));
        }
        Ok(block)
    }

    /// Creates a block in the same position as `self` holding `transactions`.
    pub fn recreate(&self, transactions: Vec<Transaction>) -> Result<Self, ChainError> {
        let author = self
            .author
            .clone()
            .ok_or_else(|| ChainError::InvalidBlock("author is required".to_string()))?;
        Block::new(transactions, self.height, self.parent.clone(), author)
    }

    /// Sets the solved compliment and signs the block.
    pub fn finalize(&self, compliment: &Compliment, signer: &Signer) -> Result<Self, ChainError> {
        let solved = Block {
            compliment: Some(encode(compliment)),
            ..self.clone()
        };
        signer.sign(&solved)
    }

    /// Hash over everything but `signature`, `hash` and `compliment`.
    pub fn compute_hash(&self) -> Result<Sha256Hash, ChainError> {
        canonical::hash(self, &BLOCK_HASH_EXCLUSIONS)
    }

    /// Returns the block with `hash` set from its contents.
    pub fn hashed(mut self) -> Result<Self, ChainError> {
        self.hash = Some(encode(self.compute_hash()?));
        Ok(self)
    }

    /// The stored hash as raw bytes.
    pub fn hash_bytes(&self) -> Result<Sha256Hash, ChainError> {
        let hash = self
            .hash
            .as_deref()
            .ok_or_else(|| ChainError::InvalidBlock("hash is required".to_string()))?;
        decode_array(hash)
    }

    pub fn compliment_bytes(&self) -> Result<Compliment, ChainError> {
        let compliment = self
            .compliment
            .as_deref()
            .ok_or_else(|| ChainError::InvalidBlock("compliment is required".to_string()))?;
        decode_array(compliment)
    }

    /// Short label used in logs.
    pub fn label(&self) -> String {
        format!(
            "#{} {}",
            self.height,
            abbreviate(self.hash.as_deref().unwrap_or_default())
        )
    }
}

impl Signed for Block {
    fn signature(&self) -> Option<&str> {
        self.signature.as_deref()
    }

    fn signatures(&self) -> Option<&[String]> {
        self.signatures.as_deref()
    }

    fn set_signatures(&mut self, signature: Option<String>, signatures: Option<Vec<String>>) {
        self.signature = signature;
        self.signatures = signatures;
    }

    fn default_signers(&self) -> Vec<String> {
        self.author.iter().cloned().collect()
    }
}
