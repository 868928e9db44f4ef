//! Database persistence layer for BYOB
//!
//! Blocks are kept by hash, with their memoized balances and accounts in a
//! side table keyed by the same hash.

use crate::blockchain::{Accounts, Block, ChainStore, StoredBlock};
use crate::error::ChainError;
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

/// Abstraction for persistence backends.
pub trait Persistence: Send + Sync {
    /// Saves a block and whatever accounting it carries. Saving a block twice
    /// overwrites the first copy.
    fn save_block(&self, stored: &StoredBlock) -> Result<(), ChainError>;

    fn remove_blocks(&self, hashes: &[String]) -> Result<(), ChainError>;

    /// Every saved block, lowest height first.
    fn load_blocks(&self) -> Result<Vec<StoredBlock>, ChainError>;
}

/// Loads every persisted block into `store`. Blocks whose parent is missing
/// are skipped. Returns the number of blocks restored.
pub fn restore_chain(persistence: &dyn Persistence, store: &mut ChainStore) -> Result<usize, ChainError> {
    let mut restored = 0;
    for stored in persistence.load_blocks()? {
        let hash = stored.hash().to_string();
        match store.restore(stored) {
            Ok(()) => restored += 1,
            Err(e) => warn!("Skipping persisted block {}: {}", hash, e),
        }
    }

    let leaves: Vec<String> = store.leaves().iter().map(|s| s.hash().to_string()).collect();
    for leaf in leaves {
        store.accounts(&leaf)?;
    }

    info!("Restored {} blocks", restored);
    Ok(restored)
}

fn lock_poisoned<T>(_: T) -> ChainError {
    ChainError::DatabaseError("Mutex poisoned".to_string())
}

pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    pub fn open(path: &str) -> Result<Self, ChainError> {
        let conn = Connection::open(path)
            .map_err(|e| ChainError::DatabaseError(format!("Failed to open database: {}", e)))?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS blocks (
                hash TEXT PRIMARY KEY,
                height INTEGER NOT NULL,
                parent TEXT,
                data TEXT NOT NULL
            )",
            [],
        )
        .map_err(|e| ChainError::DatabaseError(format!("Failed to create blocks table: {}", e)))?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS accounts (
                hash TEXT PRIMARY KEY,
                balances TEXT NOT NULL,
                accounts TEXT NOT NULL
            )",
            [],
        )
        .map_err(|e| ChainError::DatabaseError(format!("Failed to create accounts table: {}", e)))?;

        debug!("Opened database {}", path);
        Ok(Database {
            conn: Mutex::new(conn),
        })
    }

    /// Memoized accounts of a single block, if saved.
    pub fn load_accounts(&self, hash: &str) -> Result<Option<Accounts>, ChainError> {
        let conn = self.conn.lock().map_err(lock_poisoned)?;
        let json: Option<String> = conn
            .query_row(
                "SELECT accounts FROM accounts WHERE hash = ?1",
                params![hash],
                |row| row.get(0),
            )
            .optional()?;
        json.map(|j| serde_json::from_str(&j).map_err(ChainError::from))
            .transpose()
    }
}

impl Persistence for Database {
    fn save_block(&self, stored: &StoredBlock) -> Result<(), ChainError> {
        let data = serde_json::to_string(&stored.block)?;
        let conn = self.conn.lock().map_err(lock_poisoned)?;
        let tx = conn.unchecked_transaction()?;

        tx.execute(
            "INSERT OR REPLACE INTO blocks (hash, height, parent, data) VALUES (?1, ?2, ?3, ?4)",
            params![
                stored.hash(),
                stored.height() as i64,
                stored.block.parent,
                data
            ],
        )
        .map_err(|e| ChainError::DatabaseError(format!("Failed to save block: {}", e)))?;

        if let (Some(balances), Some(accounts)) = (&stored.balances, &stored.accounts) {
            tx.execute(
                "INSERT OR REPLACE INTO accounts (hash, balances, accounts) VALUES (?1, ?2, ?3)",
                params![
                    stored.hash(),
                    serde_json::to_string(balances)?,
                    serde_json::to_string(accounts)?
                ],
            )
            .map_err(|e| ChainError::DatabaseError(format!("Failed to save accounts: {}", e)))?;
        }

        tx.commit()?;
        Ok(())
    }

    fn remove_blocks(&self, hashes: &[String]) -> Result<(), ChainError> {
        let conn = self.conn.lock().map_err(lock_poisoned)?;
        let tx = conn.unchecked_transaction()?;
        for hash in hashes {
            tx.execute("DELETE FROM blocks WHERE hash = ?1", params![hash])?;
            tx.execute("DELETE FROM accounts WHERE hash = ?1", params![hash])?;
        }
        tx.commit()?;
        Ok(())
    }

    fn load_blocks(&self) -> Result<Vec<StoredBlock>, ChainError> {
        let conn = self.conn.lock().map_err(lock_poisoned)?;
        let mut stmt = conn.prepare(
            "SELECT b.data, a.balances, a.accounts
             FROM blocks b LEFT JOIN accounts a ON a.hash = b.hash
             ORDER BY b.height ASC, b.hash ASC",
        )?;

        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, Option<String>>(1)?,
                row.get::<_, Option<String>>(2)?,
            ))
        })?;

        let mut blocks = Vec::new();
        for row in rows {
            let (data, balances, accounts) = row?;
            let block: Block = serde_json::from_str(&data)?;
            let balances: Option<Accounts> = balances.map(|j| serde_json::from_str(&j)).transpose()?;
            let accounts: Option<Accounts> = accounts.map(|j| serde_json::from_str(&j)).transpose()?;
            blocks.push(StoredBlock {
                block,
                balances,
                accounts,
            });
        }
        Ok(blocks)
    }
}

/// Simple in-memory persistence implementation useful for tests and ephemeral runs.
#[derive(Clone, Default)]
pub struct InMemoryPersistence {
    pub blocks: Arc<Mutex<HashMap<String, StoredBlock>>>,
}

impl InMemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.blocks.lock().map(|b| b.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Persistence for InMemoryPersistence {
    fn save_block(&self, stored: &StoredBlock) -> Result<(), ChainError> {
        let mut blocks = self.blocks.lock().map_err(lock_poisoned)?;
        blocks.insert(stored.hash().to_string(), stored.clone());
        Ok(())
    }

    fn remove_blocks(&self, hashes: &[String]) -> Result<(), ChainError> {
        let mut blocks = self.blocks.lock().map_err(lock_poisoned)?;
        for hash in hashes {
            blocks.remove(hash);
        }
        Ok(())
    }

    fn load_blocks(&self) -> Result<Vec<StoredBlock>, ChainError> {
        let blocks = self.blocks.lock().map_err(lock_poisoned)?;
        let mut all: Vec<StoredBlock> = blocks.values().cloned().collect();
        all.sort_by(|a, b| (a.height(), a.hash()).cmp(&(b.height(), b.hash())));
        Ok(all)
    }
}
