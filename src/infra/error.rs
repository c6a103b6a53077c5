//! Error types for the ledger and distributor

use thiserror::Error;
use uuid::Uuid;

use crate::domain::{ProjectKey, RewardClaim, Token, UserId, ValidationError};

/// Errors that can occur while recording events or moving balances
#[derive(Error, Debug)]
pub enum LedgerError {
    /// Database error
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Request field failed validation
    #[error("validation error: {0}")]
    Validation(#[from] ValidationError),

    /// Event not found
    #[error("event not found: {0}")]
    EventNotFound(Uuid),

    /// Applying a debit would take a balance below zero
    #[error("insufficient funds for {project_key}/{user_id}/{token}: balance {balance}, change {amount}")]
    InsufficientFunds {
        project_key: ProjectKey,
        user_id: UserId,
        token: Token,
        balance: i64,
        amount: i64,
    },

    /// Idempotency key already used with different parameters
    #[error("idempotency key reused with different parameters: {project_key}/{idempotency_key}")]
    IdempotencyKeyReused {
        project_key: ProjectKey,
        idempotency_key: String,
    },

    /// Wallet row changed between read and write
    #[error("version conflict for {project_key}/{user_id}/{token}: expected {expected}")]
    VersionConflict {
        project_key: ProjectKey,
        user_id: UserId,
        token: Token,
        expected: u64,
    },

    /// Another event committed the same once-per-window reward first
    #[error("reward already claimed: {0}")]
    ClaimTaken(RewardClaim),

    /// Event was recorded but applying its rewards failed
    #[error("event {event_id} recorded but not applied: {source}")]
    NotApplied {
        event_id: Uuid,
        #[source]
        source: Box<LedgerError>,
    },

    /// Storage did not answer in time or refused the connection
    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),

    /// Configuration error
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Internal error
    #[error("internal error: {0}")]
    Internal(String),
}

impl LedgerError {
    /// Optimistic concurrency failure that a fresh read can resolve.
    pub fn is_conflict(&self) -> bool {
        match self {
            LedgerError::VersionConflict { .. } | LedgerError::ClaimTaken(_) => true,
            LedgerError::NotApplied { source, .. } => source.is_conflict(),
            LedgerError::Database(err) => super::retry::is_serialization_failure(err),
            _ => false,
        }
    }

    /// Whether the caller may retry the same request unchanged.
    pub fn is_retryable(&self) -> bool {
        match self {
            LedgerError::StorageUnavailable(_) => true,
            LedgerError::NotApplied { source, .. } => source.is_retryable(),
            LedgerError::Database(err) if super::retry::is_transient_db_error(err) => true,
            _ => self.is_conflict(),
        }
    }
}

/// Result type for ledger operations
pub type Result<T> = std::result::Result<T, LedgerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_conflict_is_conflict() {
        let err = LedgerError::VersionConflict {
            project_key: "p1".into(),
            user_id: "u1".into(),
            token: Token::tgem(),
            expected: 3,
        };
        assert!(err.is_conflict());
        assert!(err.is_retryable());
    }

    #[test]
    fn test_claim_taken_is_conflict() {
        let err = LedgerError::ClaimTaken(RewardClaim {
            project_key: "p1".into(),
            user_id: "u1".into(),
            event_type: "daily_login".into(),
            window_start: chrono::NaiveDate::from_ymd_opt(2026, 10, 19).unwrap(),
        });
        assert!(err.is_conflict());
        assert_eq!(
            err.to_string(),
            "reward already claimed: p1/u1/daily_login@2026-10-19"
        );
    }

    #[test]
    fn test_validation_not_retryable() {
        let err = LedgerError::from(ValidationError::new("userId", "must not be empty"));
        assert!(!err.is_conflict());
        assert!(!err.is_retryable());
        assert_eq!(err.to_string(), "validation error: userId: must not be empty");
    }

    #[test]
    fn test_not_applied_delegates_to_source() {
        let err = LedgerError::NotApplied {
            event_id: Uuid::new_v4(),
            source: Box::new(LedgerError::StorageUnavailable("timed out".into())),
        };
        assert!(err.is_retryable());
        assert!(!err.is_conflict());
    }

    #[test]
    fn test_storage_unavailable_retryable_but_not_conflict() {
        let err = LedgerError::StorageUnavailable("timed out".into());
        assert!(err.is_retryable());
        assert!(!err.is_conflict());
    }
}
