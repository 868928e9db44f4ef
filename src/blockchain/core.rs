// core.rs splits the ledger into its block model, accounting, validation and store.
pub mod chain;
pub mod state;
pub mod store;
pub mod validation;

pub use chain::*;
pub use state::*;
pub use store::*;
pub use validation::*;
