use crate::crypto::abbreviate;
use crate::error::ChainError;
use std::collections::{HashMap, HashSet, VecDeque};
use tracing::debug;

use super::chain::Block;
use super::state::{apply_block_transactions, merge_accounts, Accounts};

/// A block together with its memoized accounting.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredBlock {
    pub block: Block,
    /// What this block's transactions and reward produce, see
    /// [`apply_block_transactions`].
    pub balances: Option<Accounts>,
    /// Full accounts after this block.
    pub accounts: Option<Accounts>,
}

impl StoredBlock {
    pub fn new(block: Block) -> Self {
        StoredBlock {
            block,
            balances: None,
            accounts: None,
        }
    }

    pub fn hash(&self) -> &str {
        self.block.hash.as_deref().unwrap_or_default()
    }

    pub fn height(&self) -> u64 {
        self.block.height
    }
}

/// Every known block by hash. Forks live side by side; the chain is whatever
/// `highest` currently returns.
#[derive(Debug, Clone)]
pub struct ChainStore {
    blocks: HashMap<String, StoredBlock>,
    block_reward: f64,
}

impl ChainStore {
    pub fn new(block_reward: f64) -> Self {
        ChainStore {
            blocks: HashMap::new(),
            block_reward,
        }
    }

    pub fn block_reward(&self) -> f64 {
        self.block_reward
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn contains(&self, hash: &str) -> bool {
        self.blocks.contains_key(hash)
    }

    pub fn get(&self, hash: &str) -> Option<&StoredBlock> {
        self.blocks.get(hash)
    }

    pub fn iter(&self) -> impl Iterator<Item = &StoredBlock> {
        self.blocks.values()
    }

    /// Stores a block after checking its position, and memoizes its accounts.
    /// Storing a block that is already present returns the stored copy.
    pub fn store(&mut self, block: Block) -> Result<&StoredBlock, ChainError> {
        let hash = block
            .hash
            .clone()
            .ok_or_else(|| ChainError::InvalidBlock("hash is required".to_string()))?;
        if block.author.is_none() {
            return Err(ChainError::InvalidBlock("author is required".to_string()));
        }

        if !self.blocks.contains_key(&hash) {
            self.check_position(&block)?;
            self.blocks.insert(hash.clone(), StoredBlock::new(block));
            self.accounts(&hash)?;
            debug!("Stored block {}", abbreviate(&hash));
        }

        self.blocks
            .get(&hash)
            .ok_or_else(|| ChainError::BrokenAncestry(abbreviate(&hash)))
    }

    /// Puts back a previously stored block, keeping whatever memoized
    /// accounts it carries. Positions are checked like `store`.
    pub fn restore(&mut self, stored: StoredBlock) -> Result<(), ChainError> {
        let hash = stored.hash().to_string();
        if hash.is_empty() {
            return Err(ChainError::InvalidBlock("hash is required".to_string()));
        }
        if !self.blocks.contains_key(&hash) {
            self.check_position(&stored.block)?;
            self.blocks.insert(hash, stored);
        }
        Ok(())
    }

    fn check_position(&self, block: &Block) -> Result<(), ChainError> {
        match &block.parent {
            None if block.height != 0 => Err(ChainError::HeightMismatch {
                expected: 0,
                actual: block.height,
            }),
            None => Ok(()),
            Some(_) if block.height == 0 => Err(ChainError::InvalidBlock(
                "A block at height 0 cannot have a parent".to_string(),
            )),
            Some(parent) => {
                let stored = self
                    .blocks
                    .get(parent)
                    .ok_or_else(|| ChainError::OrphanBlock(abbreviate(parent)))?;
                if stored.height() + 1 != block.height {
                    return Err(ChainError::HeightMismatch {
                        expected: stored.height() + 1,
                        actual: block.height,
                    });
                }
                Ok(())
            }
        }
    }

    /// Full accounts after the block `hash`.
    ///
    /// Walks up to the nearest ancestor with memoized accounts (or the
    /// genesis block), then fills in every block on the way back down.
    pub fn accounts(&mut self, hash: &str) -> Result<Accounts, ChainError> {
        let mut pending: Vec<String> = Vec::new();
        let mut cursor = hash.to_string();

        let mut base = loop {
            let stored = self
                .blocks
                .get(&cursor)
                .ok_or_else(|| ChainError::BrokenAncestry(format!("block {} is not stored", abbreviate(&cursor))))?;

            if let Some(accounts) = &stored.accounts {
                break accounts.clone();
            }
            pending.push(cursor.clone());

            match &stored.block.parent {
                Some(parent) => cursor = parent.clone(),
                None if stored.height() == 0 => break Accounts::new(),
                None => {
                    return Err(ChainError::BrokenAncestry(format!(
                        "block {} at height {} has no parent",
                        abbreviate(&cursor),
                        stored.height()
                    )))
                }
            }
        };

        while let Some(current) = pending.pop() {
            let stored = self
                .blocks
                .get_mut(&current)
                .ok_or_else(|| ChainError::BrokenAncestry(abbreviate(&current)))?;

            let balances = match &stored.balances {
                Some(balances) => balances.clone(),
                None => apply_block_transactions(
                    &stored.block.transactions,
                    stored.block.author.as_deref().unwrap_or_default(),
                    &base,
                    self.block_reward,
                ),
            };
            let accounts = merge_accounts(&base, &balances);

            stored.balances = Some(balances);
            stored.accounts = Some(accounts.clone());
            base = accounts;
        }

        Ok(base)
    }

    /// The block with the greatest height; ties go to the greatest hash.
    pub fn highest(&self) -> Option<&StoredBlock> {
        self.blocks
            .values()
            .max_by(|a, b| (a.height(), a.hash()).cmp(&(b.height(), b.hash())))
    }

    /// Stored blocks that no stored block names as parent.
    pub fn leaves(&self) -> Vec<&StoredBlock> {
        let parents: HashSet<&str> = self
            .blocks
            .values()
            .filter_map(|s| s.block.parent.as_deref())
            .collect();
        let mut leaves: Vec<&StoredBlock> = self
            .blocks
            .values()
            .filter(|s| !parents.contains(s.hash()))
            .collect();
        leaves.sort_by(|a, b| (b.height(), b.hash()).cmp(&(a.height(), a.hash())));
        leaves
    }

    /// Removes `hash` and every block descending from it. Returns the removed
    /// blocks, closest to `hash` first.
    pub fn remove(&mut self, hash: &str) -> Vec<StoredBlock> {
        if !self.blocks.contains_key(hash) {
            return Vec::new();
        }

        let mut children: HashMap<&str, Vec<&str>> = HashMap::new();
        for stored in self.blocks.values() {
            if let Some(parent) = stored.block.parent.as_deref() {
                children.entry(parent).or_default().push(stored.hash());
            }
        }

        let mut doomed: Vec<String> = Vec::new();
        let mut queue: VecDeque<&str> = VecDeque::from([hash]);
        while let Some(current) = queue.pop_front() {
            doomed.push(current.to_string());
            if let Some(kids) = children.get(current) {
                queue.extend(kids.iter().copied());
            }
        }

        doomed
            .iter()
            .filter_map(|h| self.blocks.remove(h))
            .collect()
    }

    /// Blocks from genesis up to and including `hash`.
    pub fn chain_to(&self, hash: &str) -> Result<Vec<&StoredBlock>, ChainError> {
        let mut chain = Vec::new();
        let mut cursor = Some(hash.to_string());
        while let Some(current) = cursor {
            let stored = self
                .blocks
                .get(&current)
                .ok_or_else(|| ChainError::BrokenAncestry(format!("block {} is not stored", abbreviate(&current))))?;
            cursor = stored.block.parent.clone();
            chain.push(stored);
        }
        chain.reverse();
        Ok(chain)
    }

    /// Removes every fork whose tip is more than `depth` blocks below the
    /// highest block. Each fork is cut where it leaves the highest chain.
    pub fn prune_forks(&mut self, depth: u64) -> Vec<StoredBlock> {
        let Some(highest) = self.highest() else {
            return Vec::new();
        };
        let highest_height = highest.height();

        let main: HashSet<String> = match self.chain_to(highest.hash()) {
            Ok(chain) => chain.iter().map(|s| s.hash().to_string()).collect(),
            Err(_) => return Vec::new(),
        };

        let stale_tips: Vec<String> = self
            .leaves()
            .into_iter()
            .filter(|leaf| !main.contains(leaf.hash()))
            .filter(|leaf| highest_height.saturating_sub(leaf.height()) > depth)
            .map(|leaf| leaf.hash().to_string())
            .collect();

        let mut removed = Vec::new();
        for tip in stale_tips {
            let fork_root = self.fork_root(&tip, &main);
            if let Some(root) = fork_root {
                removed.extend(self.remove(&root));
            }
        }
        removed
    }

    /// First block on the way up from `tip` whose parent is on `main`.
    fn fork_root(&self, tip: &str, main: &HashSet<String>) -> Option<String> {
        let mut cursor = self.blocks.get(tip)?;
        loop {
            match cursor.block.parent.as_deref() {
                Some(parent) if main.contains(parent) => return Some(cursor.hash().to_string()),
                Some(parent) => cursor = self.blocks.get(parent)?,
                // a separate genesis
                None => return Some(cursor.hash().to_string()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{encode, KeyPair};
    use crate::keystore::Signer;
    use crate::transaction::Transaction;

    const REWARD: f64 = 1.0;

    struct Builder {
        key: KeyPair,
        signer: Signer,
    }

    impl Builder {
        fn new() -> Self {
            let key = KeyPair::generate();
            let signer = Signer::new(vec![key.clone()]);
            Builder { key, signer }
        }

        fn block(&self, parent: Option<&Block>, txs: Vec<Transaction>) -> Block {
            let height = parent.map(|p| p.height + 1).unwrap_or(0);
            Block::new(txs, height, parent.and_then(|p| p.hash.clone()), self.key.public_key_encoded())
                .unwrap()
                .finalize(&[0u8; 32], &self.signer)
                .unwrap()
        }

        fn chain(&self, len: usize) -> Vec<Block> {
            let mut blocks: Vec<Block> = Vec::new();
            for _ in 0..len {
                let block = self.block(blocks.last(), vec![]);
                blocks.push(block);
            }
            blocks
        }
    }

    fn hash(block: &Block) -> String {
        block.hash.clone().unwrap()
    }

    #[test]
    fn test_store_and_accounts() {
        let builder = Builder::new();
        let mut store = ChainStore::new(REWARD);
        let blocks = builder.chain(3);
        for block in &blocks {
            store.store(block.clone()).unwrap();
        }

        let me = builder.key.public_key_encoded();
        let accounts = store.accounts(&hash(&blocks[2])).unwrap();
        assert_eq!(accounts.get(&me), Some(&3.0));

        let stored = store.get(&hash(&blocks[0])).unwrap();
        assert_eq!(stored.accounts, stored.balances);
    }

    #[test]
    fn test_store_is_idempotent() {
        let builder = Builder::new();
        let mut store = ChainStore::new(REWARD);
        let genesis = builder.chain(1).remove(0);
        store.store(genesis.clone()).unwrap();
        store.store(genesis).unwrap();
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_store_rejects_bad_heights() {
        let builder = Builder::new();
        let mut store = ChainStore::new(REWARD);

        let orphan = Block {
            height: 3,
            author: Some(builder.key.public_key_encoded()),
            ..Default::default()
        }
        .hashed()
        .unwrap();
        assert!(matches!(
            store.store(orphan),
            Err(ChainError::HeightMismatch { expected: 0, actual: 3 })
        ));

        let genesis = builder.chain(1).remove(0);
        store.store(genesis.clone()).unwrap();

        let skipping = Block {
            height: 2,
            parent: genesis.hash.clone(),
            author: Some(builder.key.public_key_encoded()),
            ..Default::default()
        }
        .hashed()
        .unwrap();
        assert!(matches!(
            store.store(skipping),
            Err(ChainError::HeightMismatch { expected: 1, actual: 2 })
        ));

        let unknown_parent = Block {
            height: 1,
            parent: Some(encode([9u8; 32])),
            author: Some(builder.key.public_key_encoded()),
            ..Default::default()
        }
        .hashed()
        .unwrap();
        assert!(matches!(
            store.store(unknown_parent),
            Err(ChainError::OrphanBlock(_))
        ));
    }

    #[test]
    fn test_highest_and_leaves() {
        let builder = Builder::new();
        let mut store = ChainStore::new(REWARD);
        assert!(store.highest().is_none());

        let blocks = builder.chain(4);
        for block in &blocks {
            store.store(block.clone()).unwrap();
        }
        let fork = Builder::new().block(Some(&blocks[1]), vec![]);
        store.store(fork.clone()).unwrap();

        assert_eq!(store.highest().unwrap().hash(), hash(&blocks[3]));

        let mut leaves: Vec<String> = store.leaves().iter().map(|s| s.hash().to_string()).collect();
        leaves.sort();
        let mut expected = vec![hash(&blocks[3]), hash(&fork)];
        expected.sort();
        assert_eq!(leaves, expected);
    }

    #[test]
    fn test_remove_cascades() {
        let builder = Builder::new();
        let mut store = ChainStore::new(REWARD);
        let blocks = builder.chain(4);
        for block in &blocks {
            store.store(block.clone()).unwrap();
        }

        let removed = store.remove(&hash(&blocks[1]));
        assert_eq!(removed.len(), 3);
        assert_eq!(removed[0].hash(), hash(&blocks[1]));
        assert!(store.contains(&hash(&blocks[0])));
        for block in &blocks[1..] {
            assert!(!store.contains(&hash(block)));
        }
        assert!(store.remove("missing").is_empty());
    }

    #[test]
    fn test_accounts_walks_long_chains() {
        let builder = Builder::new();
        let mut store = ChainStore::new(REWARD);
        let blocks = builder.chain(2000);
        for block in &blocks {
            store
                .restore(StoredBlock::new(block.clone()))
                .unwrap();
        }

        let me = builder.key.public_key_encoded();
        let accounts = store.accounts(&hash(&blocks[1999])).unwrap();
        assert_eq!(accounts.get(&me), Some(&2000.0));
        assert!(store.get(&hash(&blocks[1000])).unwrap().accounts.is_some());
    }

    #[test]
    fn test_accounts_reports_gaps() {
        let builder = Builder::new();
        let mut store = ChainStore::new(REWARD);
        let blocks = builder.chain(3);
        store.restore(StoredBlock::new(blocks[0].clone())).unwrap();
        store.restore(StoredBlock::new(blocks[1].clone())).unwrap();
        store.restore(StoredBlock::new(blocks[2].clone())).unwrap();
        store.blocks.remove(&hash(&blocks[1]));

        assert!(matches!(
            store.accounts(&hash(&blocks[2])),
            Err(ChainError::BrokenAncestry(_))
        ));
    }

    #[test]
    fn test_chain_to() {
        let builder = Builder::new();
        let mut store = ChainStore::new(REWARD);
        let blocks = builder.chain(3);
        for block in &blocks {
            store.store(block.clone()).unwrap();
        }
        let chain: Vec<u64> = store
            .chain_to(&hash(&blocks[2]))
            .unwrap()
            .iter()
            .map(|s| s.height())
            .collect();
        assert_eq!(chain, vec![0, 1, 2]);
    }

    #[test]
    fn test_prune_forks() {
        let builder = Builder::new();
        let mut store = ChainStore::new(REWARD);
        let blocks = builder.chain(6);
        for block in &blocks {
            store.store(block.clone()).unwrap();
        }
        let rival = Builder::new();
        let stale = rival.block(Some(&blocks[1]), vec![]);
        let stale_child = rival.block(Some(&stale), vec![]);
        let recent = rival.block(Some(&blocks[3]), vec![]);
        for block in [&stale, &stale_child, &recent] {
            store.store(block.clone()).unwrap();
        }

        // tips at heights 3 and 4 against a highest block at height 5
        let removed = store.prune_forks(1);
        let removed: HashSet<String> = removed.iter().map(|s| s.hash().to_string()).collect();
        assert_eq!(removed, HashSet::from([hash(&stale), hash(&stale_child)]));
        assert!(store.contains(&hash(&recent)));
        assert_eq!(store.len(), 7);
    }

    #[test]
    fn test_prune_forks_with_huge_depth_keeps_everything() {
        let builder = Builder::new();
        let mut store = ChainStore::new(REWARD);
        let blocks = builder.chain(4);
        for block in &blocks {
            store.store(block.clone()).unwrap();
        }
        let rival = Builder::new();
        store.store(rival.block(Some(&blocks[0]), vec![])).unwrap();

        assert!(store.prune_forks(u64::MAX).is_empty());
        assert_eq!(store.len(), 5);
        assert_eq!(store.prune_forks(1).len(), 1);
    }
}
