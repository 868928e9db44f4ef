//! BYOB - A minimal proof-of-work ledger with double-entry accounted transactions
//!
//! # Architecture
//!
//! The crate is organized into logical modules:
//!
//! ## Core Ledger
//! - [`blockchain`] - Blocks, accounting, validation and the block store
//! - [`transaction`] - Transactions, splits and their validation
//! - [`mempool`] - Pending transactions
//!
//! ## Consensus
//! - [`miner`] - Proof-of-work solver
//!
//! ## Cryptography
//! - [`crypto`] - Keys, encodings and signatures (secp256k1)
//! - [`canonical`] - Canonical hashing and multi-signing of objects
//! - [`keystore`] - Private key storage
//!
//! ## State Management
//! - [`persistence`] - Database layer (SQLite)
//!
//! ## Networking
//! - [`network`] - Message envelopes and transports
//! - [`sync`] - Chain synchronization
//! - [`node`] - The node coordinator
//!
//! ## Configuration & Utilities
//! - [`config`] - Configuration management
//! - [`error`] - Error types

#![forbid(unsafe_code)]

// ============================================================================
// Core Ledger
// ============================================================================
pub mod blockchain;
pub mod mempool;
pub mod transaction;

// ============================================================================
// Consensus & Mining
// ============================================================================
pub mod miner;

// ============================================================================
// Cryptography & Security
// ============================================================================
pub mod canonical;
pub mod crypto;
pub mod keystore;

// ============================================================================
// State Management
// ============================================================================
pub mod persistence;

// ============================================================================
// Networking
// ============================================================================
pub mod network;
pub mod node;
pub mod sync;

// ============================================================================
// Configuration & Utilities
// ============================================================================
pub mod config;
pub mod error;
