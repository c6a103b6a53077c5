//! SQLite implementation for single-node deployments and tests

mod ledger;

pub use ledger::*;
