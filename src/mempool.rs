//! Pending transaction pool

use crate::blockchain::Accounts;
use crate::transaction::{exclude_invalid_transactions, validate_transactions_deep, Transaction};
use std::collections::HashSet;
use tracing::debug;

/// Transactions waiting for a block, in arrival order, unique by hash.
#[derive(Debug, Clone, Default)]
pub struct Mempool {
    transactions: Vec<Transaction>,
    hashes: HashSet<String>,
}

impl Mempool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.transactions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transactions.is_empty()
    }

    pub fn contains(&self, hash: &str) -> bool {
        self.hashes.contains(hash)
    }

    pub fn transactions(&self) -> &[Transaction] {
        &self.transactions
    }

    /// Adds `transaction` if the pool including it still applies to
    /// `accounts`. Returns the deep validation errors otherwise. Adding a
    /// transaction that is already pooled does nothing.
    pub fn add(&mut self, transaction: Transaction, accounts: &Accounts) -> Result<bool, Vec<String>> {
        let hash = transaction
            .hash_str()
            .map_err(|e| vec![e.to_string()])?;
        if self.hashes.contains(&hash) {
            return Ok(false);
        }

        let mut candidate = self.transactions.clone();
        candidate.push(transaction);
        let errors = validate_transactions_deep(&candidate, accounts);
        if !errors.is_empty() {
            return Err(errors);
        }

        self.transactions = candidate;
        self.hashes.insert(hash);
        Ok(true)
    }

    /// Drops the transactions contained in `included`.
    pub fn remove_included(&mut self, included: &[Transaction]) {
        let gone: HashSet<String> = included.iter().filter_map(|t| t.hash_str().ok()).collect();
        self.transactions
            .retain(|t| t.hash_str().map(|h| !gone.contains(&h)).unwrap_or(false));
        self.rebuild_index();
    }

    /// Keeps only the transactions that still apply, in order, to `accounts`.
    pub fn retain_valid(&mut self, accounts: &Accounts) {
        let before = self.transactions.len();
        self.transactions = exclude_invalid_transactions(&self.transactions, accounts);
        self.rebuild_index();
        if self.transactions.len() != before {
            debug!(
                "Dropped {} transactions that no longer apply",
                before - self.transactions.len()
            );
        }
    }

    fn rebuild_index(&mut self) {
        self.hashes = self
            .transactions
            .iter()
            .filter_map(|t| t.hash_str().ok())
            .collect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transaction::Split;

    fn tx(splits: &[(&str, f64)]) -> Transaction {
        Transaction::new(splits.iter().map(|(a, v)| Split::new(*a, *v)).collect())
    }

    fn accounts(entries: &[(&str, f64)]) -> Accounts {
        entries.iter().map(|(a, v)| (a.to_string(), *v)).collect()
    }

    #[test]
    fn test_add_and_dedupe() {
        let mut pool = Mempool::new();
        let funds = accounts(&[("a", 5.0)]);
        let t = tx(&[("a", -1.0), ("b", 0.9)]);

        assert_eq!(pool.add(t.clone(), &funds), Ok(true));
        assert_eq!(pool.add(t.clone(), &funds), Ok(false));
        assert_eq!(pool.len(), 1);
        assert!(pool.contains(&t.hash_str().unwrap()));
    }

    #[test]
    fn test_add_checks_whole_pool() {
        let mut pool = Mempool::new();
        let funds = accounts(&[("a", 1.0)]);
        assert!(pool.add(tx(&[("a", -0.8), ("b", 0.7)]), &funds).is_ok());

        let errors = pool.add(tx(&[("a", -0.5), ("c", 0.4)]), &funds).unwrap_err();
        assert_eq!(errors.len(), 1);
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn test_remove_included() {
        let mut pool = Mempool::new();
        let funds = accounts(&[("a", 5.0)]);
        let first = tx(&[("a", -1.0), ("b", 0.9)]);
        let second = tx(&[("a", -2.0), ("b", 1.9)]);
        pool.add(first.clone(), &funds).unwrap();
        pool.add(second.clone(), &funds).unwrap();

        pool.remove_included(&[first.clone()]);
        assert_eq!(pool.transactions(), &[second]);
        assert!(!pool.contains(&first.hash_str().unwrap()));
    }

    #[test]
    fn test_retain_valid() {
        let mut pool = Mempool::new();
        let rich = accounts(&[("a", 5.0)]);
        let first = tx(&[("a", -3.0), ("b", 2.9)]);
        let second = tx(&[("a", -2.0), ("c", 1.9)]);
        pool.add(first.clone(), &rich).unwrap();
        pool.add(second.clone(), &rich).unwrap();

        pool.retain_valid(&accounts(&[("a", 2.5)]));
        assert_eq!(pool.transactions(), &[second]);
    }
}
