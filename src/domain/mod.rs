//! Domain models for the distribution service
//!
//! Ledger events, wallet balances and reward instructions.

mod event;
mod types;
mod wallet;

pub use event::*;
pub use types::*;
pub use wallet::*;
