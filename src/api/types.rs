//! Request and response bodies for the REST handlers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::distributor::{IngestReceipt, DEFAULT_PAGE_SIZE};
use crate::domain::{
    DistributionReceipt, DistributionRequest, Event, EventType, NewEvent, ProjectKey, Properties,
    Token, UserId, ValidationError, WalletEntry,
};

// ============================================================================
// Events
// ============================================================================

/// Client timestamp: epoch milliseconds (as the SDK sends) or RFC 3339.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum ClientTimestamp {
    Millis(i64),
    Rfc3339(DateTime<Utc>),
}

impl ClientTimestamp {
    pub fn to_utc(self) -> Result<DateTime<Utc>, ValidationError> {
        match self {
            ClientTimestamp::Millis(ms) => DateTime::from_timestamp_millis(ms)
                .ok_or_else(|| ValidationError::new("ts", "out of range")),
            ClientTimestamp::Rfc3339(ts) => Ok(ts),
        }
    }
}

/// Body of `POST /events`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackEventRequest {
    pub project_key: ProjectKey,
    pub user_id: UserId,
    pub event: EventType,
    #[serde(default)]
    pub props: Properties,
    #[serde(default)]
    pub idempotency_key: Option<String>,
    #[serde(default)]
    pub ts: Option<ClientTimestamp>,
}

impl TrackEventRequest {
    pub fn into_new_event(self) -> Result<NewEvent, ValidationError> {
        let mut event = NewEvent::new(self.project_key, self.user_id, self.event)
            .with_properties(self.props);
        if let Some(key) = self.idempotency_key {
            event = event.with_idempotency_key(key);
        }
        if let Some(ts) = self.ts {
            event = event.with_client_ts(ts.to_utc()?);
        }
        Ok(event)
    }
}

/// Success body of `POST /events`.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackEventResponse {
    pub ok: bool,
    pub event_id: Uuid,
    pub sequence: u64,
    /// Event was already in the ledger
    pub duplicate: bool,
    /// Wallet rows the event touched, after application
    pub entries: Vec<WalletEntry>,
}

impl From<IngestReceipt> for TrackEventResponse {
    fn from(receipt: IngestReceipt) -> Self {
        Self {
            ok: true,
            event_id: receipt.event.id,
            sequence: receipt.event.sequence,
            duplicate: receipt.duplicate,
            entries: receipt.applied.entries,
        }
    }
}

/// Success body of `POST /events/:event_id/apply`.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplyEventResponse {
    pub ok: bool,
    pub event_id: Uuid,
    pub replayed: bool,
    pub entries: Vec<WalletEntry>,
}

/// Query of `GET /events`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListEventsQuery {
    pub project_key: ProjectKey,
    pub user_id: UserId,
    #[serde(default)]
    pub cursor: Option<u64>,
    #[serde(default = "default_limit")]
    pub limit: u32,
}

fn default_limit() -> u32 {
    DEFAULT_PAGE_SIZE
}

/// Success body of `GET /events`.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListEventsResponse {
    pub ok: bool,
    pub events: Vec<Event>,
    pub next_cursor: Option<u64>,
}

// ============================================================================
// Distributions and wallets
// ============================================================================

/// Body of `POST /distribute`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DistributeRequest {
    pub project_key: ProjectKey,
    pub user_id: UserId,
    pub token: Token,
    pub amount: i64,
    pub idempotency_key: String,
}

impl From<DistributeRequest> for DistributionRequest {
    fn from(req: DistributeRequest) -> Self {
        Self {
            project_key: req.project_key,
            user_id: req.user_id,
            token: req.token,
            amount: req.amount,
            idempotency_key: req.idempotency_key,
        }
    }
}

/// Success body of `POST /distribute`.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DistributeResponse {
    pub ok: bool,
    pub idempotency_key: String,
    pub token: Token,
    pub amount: i64,
    /// Balance after the distribution
    pub balance: i64,
    /// Key had already been applied; nothing changed
    pub replayed: bool,
}

impl From<DistributionReceipt> for DistributeResponse {
    fn from(receipt: DistributionReceipt) -> Self {
        Self {
            ok: true,
            idempotency_key: receipt.record.idempotency_key,
            token: receipt.record.token,
            amount: receipt.record.amount,
            balance: receipt.entry.balance,
            replayed: receipt.replayed,
        }
    }
}

/// Query of `GET /wallet`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WalletQuery {
    pub project_key: ProjectKey,
    pub user_id: UserId,
}
