//! Theras Distribution Library
//!
//! Ledger-backed wallet and reward distribution: an append-only event
//! ledger, a declarative reward rule engine, and a wallet ledger that
//! applies every event exactly once.
//!
//! ## Modules
//!
//! - [`domain`] - Core domain types (events, wallets, distributions)
//! - [`rules`] - Reward rule configuration and evaluation
//! - [`infra`] - Storage backends (PostgreSQL, SQLite, in-memory), errors, retry
//! - [`distributor`] - Exactly-once application of rewards and manual distributions
//! - [`api`] - REST API routes
//! - [`metrics`] - Counters, gauges and latency histograms
//! - [`telemetry`] - Logging and OpenTelemetry integration

pub mod api;
pub mod distributor;
pub mod domain;
pub mod infra;
pub mod metrics;
pub mod migrations;
pub mod rules;
pub mod server;
pub mod telemetry;

// Re-export commonly used types
pub use distributor::{ApplyReceipt, Distributor, DistributorConfig, IngestReceipt};
pub use domain::{
    Balances, DistributionRequest, Event, EventType, NewEvent, ProjectKey, Token, UserId,
    WalletEntry,
};
pub use infra::{LedgerError, Result};
pub use rules::RuleEngine;
