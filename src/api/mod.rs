//! HTTP API for the distribution service
//!
//! JSON over REST; every error is an [`ApiError`] body with a stable kind.

mod error;
mod health;
mod rest;
mod types;

pub use error::{ApiError, ErrorKind};
pub use health::{HealthResponse, HealthStatus, ReadinessResponse};
pub use rest::router;
pub use types::*;
