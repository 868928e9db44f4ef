// Thin re-export module: implementation is in `blockchain/core.rs`, split into
// the block model, the accounting engine, block validation and the chain store.

pub mod core;
pub use core::*;
