//! Structured API error responses
//!
//! Every failure is rendered as
//! `{"ok": false, "error": "<kind>", "message": "..."}` with a stable kind
//! that clients can switch on.

use axum::extract::rejection::{JsonRejection, PathRejection, QueryRejection};
use axum::http::{HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::infra::LedgerError;

/// Stable error kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Malformed request or a field outside its limits
    ValidationError,
    /// Referenced event does not exist
    NotFound,
    /// A debit would overdraw a token that forbids it
    InsufficientFunds,
    /// Idempotency key reused with different parameters
    IdempotencyKeyReused,
    /// Concurrent update kept winning after internal retries
    Conflict,
    /// Storage timed out or is unreachable; retry later
    StorageUnavailable,
    InternalError,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::ValidationError => "validation_error",
            ErrorKind::NotFound => "not_found",
            ErrorKind::InsufficientFunds => "insufficient_funds",
            ErrorKind::IdempotencyKeyReused => "idempotency_key_reused",
            ErrorKind::Conflict => "conflict",
            ErrorKind::StorageUnavailable => "storage_unavailable",
            ErrorKind::InternalError => "internal_error",
        }
    }

    pub fn http_status(&self) -> StatusCode {
        match self {
            ErrorKind::ValidationError => StatusCode::BAD_REQUEST,
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::InsufficientFunds => StatusCode::UNPROCESSABLE_ENTITY,
            ErrorKind::IdempotencyKeyReused => StatusCode::UNPROCESSABLE_ENTITY,
            ErrorKind::Conflict => StatusCode::CONFLICT,
            ErrorKind::StorageUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            ErrorKind::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Whether the same request may succeed later unchanged
    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorKind::Conflict | ErrorKind::StorageUnavailable)
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error response body
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiError {
    /// Always false
    pub ok: bool,

    pub error: ErrorKind,

    pub message: String,

    /// Event that was recorded even though applying it failed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_id: Option<Uuid>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl ApiError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            ok: false,
            error: kind,
            message: message.into(),
            event_id: None,
            details: None,
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ValidationError, message)
    }

    pub fn with_event_id(mut self, event_id: Uuid) -> Self {
        self.event_id = Some(event_id);
        self
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn status(&self) -> StatusCode {
        self.error.http_status()
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let kind = self.error.as_str();
        let mut response = (status, Json(self)).into_response();

        response.headers_mut().insert(
            HeaderName::from_static("x-error-kind"),
            HeaderValue::from_static(kind),
        );

        response
    }
}

impl From<LedgerError> for ApiError {
    fn from(err: LedgerError) -> Self {
        match err {
            LedgerError::Validation(e) => ApiError::validation(e.to_string())
                .with_details(serde_json::json!({ "field": e.field })),
            LedgerError::EventNotFound(id) => {
                ApiError::new(ErrorKind::NotFound, format!("event not found: {id}"))
            }
            LedgerError::InsufficientFunds {
                ref token,
                balance,
                amount,
                ..
            } => ApiError::new(ErrorKind::InsufficientFunds, err.to_string()).with_details(
                serde_json::json!({
                    "token": token,
                    "balance": balance,
                    "amount": amount,
                }),
            ),
            LedgerError::IdempotencyKeyReused { .. } => {
                ApiError::new(ErrorKind::IdempotencyKeyReused, err.to_string())
            }
            LedgerError::VersionConflict { .. } | LedgerError::ClaimTaken(_) => {
                ApiError::new(ErrorKind::Conflict, err.to_string())
            }
            LedgerError::NotApplied { event_id, source } => {
                ApiError::from(*source).with_event_id(event_id)
            }
            LedgerError::StorageUnavailable(msg) => {
                ApiError::new(ErrorKind::StorageUnavailable, msg)
            }
            LedgerError::Database(ref db) if err.is_conflict() => {
                ApiError::new(ErrorKind::Conflict, format!("concurrent update: {db}"))
            }
            LedgerError::Database(ref db) if err.is_retryable() => {
                tracing::warn!(error = %db, "Storage unavailable");
                ApiError::new(ErrorKind::StorageUnavailable, "storage unavailable")
            }
            LedgerError::Database(db) => {
                tracing::error!(error = %db, "Database error");
                ApiError::new(ErrorKind::InternalError, "internal error")
            }
            LedgerError::Configuration(msg) | LedgerError::Internal(msg) => {
                tracing::error!(error = %msg, "Internal error");
                ApiError::new(ErrorKind::InternalError, "internal error")
            }
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::validation(rejection.body_text())
    }
}

impl From<QueryRejection> for ApiError {
    fn from(rejection: QueryRejection) -> Self {
        ApiError::validation(rejection.body_text())
    }
}

impl From<PathRejection> for ApiError {
    fn from(rejection: PathRejection) -> Self {
        ApiError::validation(rejection.body_text())
    }
}
