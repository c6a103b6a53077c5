//! PostgreSQL implementations for production storage
//!
//! The event ledger and wallet store share one pool; each owns its tables.

mod event_ledger;
mod wallet_store;

pub use event_ledger::*;
pub use wallet_store::*;
