//! Infrastructure layer for the distribution service
//!
//! Contains the storage contracts and their implementations:
//! - Event ledger and wallet store (PostgreSQL, SQLite, in-memory)
//! - Retry with backoff for optimistic commits
//! - Error types shared by every layer below the API

mod error;
mod memory;
pub mod postgres;
mod retry;
pub mod sqlite;
mod traits;

pub use error::*;
pub use memory::MemoryStore;
pub use postgres::{PgEventLedger, PgWalletStore};
pub use retry::{is_serialization_failure, is_transient_db_error, Retry, RetryConfig, RetryResult};
pub use sqlite::SqliteLedger;
pub use traits::*;
