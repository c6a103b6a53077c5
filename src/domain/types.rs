//! Core identifier types for the distribution service
//!
//! Every identifier is a thin string wrapper so the compiler keeps project
//! keys, user ids and token names from being mixed up at call sites.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Maximum project key length (matches the on-chain project account)
pub const MAX_PROJECT_KEY_LEN: usize = 32;

/// Maximum user identifier length
pub const MAX_USER_ID_LEN: usize = 128;

/// Maximum event type length
pub const MAX_EVENT_TYPE_LEN: usize = 64;

/// Maximum token name length
pub const MAX_TOKEN_LEN: usize = 32;

/// Maximum idempotency key length
pub const MAX_IDEMPOTENCY_KEY_LEN: usize = 128;

/// A request field failed validation
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{field}: {message}")]
pub struct ValidationError {
    pub field: &'static str,
    pub message: String,
}

impl ValidationError {
    pub fn new(field: &'static str, message: impl Into<String>) -> Self {
        Self {
            field,
            message: message.into(),
        }
    }
}

/// Check that a string field is non-blank and within `max` characters.
pub fn validate_text(field: &'static str, value: &str, max: usize) -> Result<(), ValidationError> {
    if value.trim().is_empty() {
        return Err(ValidationError::new(field, "must not be empty"));
    }
    if value.chars().count() > max {
        return Err(ValidationError::new(
            field,
            format!("must be at most {max} characters"),
        ));
    }
    Ok(())
}

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident, $field:literal, $max:expr) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }

            pub fn validate(&self) -> Result<(), ValidationError> {
                validate_text($field, &self.0, $max)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }
    };
}

string_id!(
    /// Project (integrating application) key
    ProjectKey,
    "projectKey",
    MAX_PROJECT_KEY_LEN
);

string_id!(
    /// End user identifier within a project
    UserId,
    "userId",
    MAX_USER_ID_LEN
);

string_id!(
    /// Named token balance (tgem, partner, ...)
    Token,
    "token",
    MAX_TOKEN_LEN
);

string_id!(
    /// Kind of user action recorded in the ledger
    EventType,
    "eventType",
    MAX_EVENT_TYPE_LEN
);

impl Token {
    pub fn tgem() -> Self {
        Self("tgem".to_string())
    }

    pub fn partner() -> Self {
        Self("partner".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_text_rejects_blank() {
        let err = validate_text("userId", "   ", 10).unwrap_err();
        assert_eq!(err.field, "userId");
        assert_eq!(err.message, "must not be empty");
    }

    #[test]
    fn test_validate_text_counts_chars_not_bytes() {
        assert!(validate_text("userId", "ééééé", 5).is_ok());
        assert!(validate_text("userId", "éééééé", 5).is_err());
    }

    #[test]
    fn test_project_key_limit() {
        assert!(ProjectKey::from("p1").validate().is_ok());
        assert!(ProjectKey::from("x".repeat(33)).validate().is_err());
    }

    #[test]
    fn test_ids_serialize_transparently() {
        let json = serde_json::to_string(&Token::tgem()).unwrap();
        assert_eq!(json, "\"tgem\"");
    }
}
