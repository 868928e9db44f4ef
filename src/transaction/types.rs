/// Transaction types for BYOB
use crate::canonical::{self, Signed};
use crate::crypto::{abbreviate, encode, KeyPair, Sha256Hash};
use crate::error::ChainError;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Smallest magnitude a split amount may have.
pub const MIN_AMOUNT: f64 = 1e-15;

/// One ledger movement. Positive amounts credit the account, negative
/// amounts debit it.
///
/// Fields are optional so that malformed splits received from peers can be
/// reported by the validator instead of failing to decode. Unknown fields are
/// kept in `extra` for the same reason.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Split {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub amount: Option<f64>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Split {
    pub fn new(account: impl Into<String>, amount: f64) -> Self {
        Split {
            account: Some(account.into()),
            amount: Some(amount),
            extra: Map::new(),
        }
    }

    pub fn is_debit(&self) -> bool {
        self.amount.map(|a| a < 0.0).unwrap_or(false)
    }
}

/// A set of splits signed by every debited account.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Transaction {
    #[serde(default)]
    pub splits: Vec<Split>,
    /// Distinguishes otherwise identical transactions. Signed, never checked.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signatures: Option<Vec<String>>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Transaction {
    /// Creates an unsigned transaction.
    pub fn new(splits: Vec<Split>) -> Self {
        Transaction {
            splits,
            ..Default::default()
        }
    }

    pub fn with_nonce(mut self, nonce: impl Into<String>) -> Self {
        self.nonce = Some(nonce.into());
        self
    }

    /// Creates a transfer of `amount` from `from` to `to`, leaving `charge`
    /// for the block author. Unsigned.
    pub fn transfer(from: &str, to: &str, amount: f64, charge: f64) -> Self {
        Transaction::new(vec![
            Split::new(from, -(amount + charge)),
            Split::new(to, amount),
        ])
    }

    /// Signs with every key, replacing existing signatures.
    pub fn signed(&self, keys: &[KeyPair]) -> Result<Self, ChainError> {
        canonical::sign(self, keys)
    }

    /// Identity hash: excludes signature fields.
    pub fn hash(&self) -> Result<Sha256Hash, ChainError> {
        canonical::hash_default(self)
    }

    pub fn hash_str(&self) -> Result<String, ChainError> {
        Ok(encode(self.hash()?))
    }

    /// Short label used in logs and namespaced validation errors.
    pub fn label(&self) -> String {
        self.hash_str()
            .map(|h| abbreviate(&h))
            .unwrap_or_else(|_| "<unhashable>".to_string())
    }

    /// Distinct debited accounts, in order of first appearance.
    pub fn debit_accounts(&self) -> Vec<String> {
        let mut accounts: Vec<String> = Vec::new();
        for split in self.splits.iter().filter(|s| s.is_debit()) {
            if let Some(account) = &split.account {
                if !accounts.contains(account) {
                    accounts.push(account.clone());
                }
            }
        }
        accounts
    }

    /// The excess of debits over credits, paid to the block author.
    pub fn charge(&self) -> f64 {
        -self.splits.iter().filter_map(|s| s.amount).sum::<f64>()
    }
}

impl Signed for Transaction {
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

    /// Transactions name no author, so verifying one always takes
    /// explicit keys.
    fn default_signers(&self) -> Vec<String> {
        Vec::new()
    }
}
