//! Wallet balances, reward instructions and manual distributions

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

use super::{
    validate_text, EventType, ProjectKey, Token, UserId, ValidationError,
    MAX_IDEMPOTENCY_KEY_LEN,
};

/// Token balances of one user, keyed by token name.
pub type Balances = BTreeMap<Token, i64>;

/// Identity of one balance row: (project, user, token).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WalletKey {
    pub project_key: ProjectKey,
    pub user_id: UserId,
    pub token: Token,
}

impl WalletKey {
    pub fn new(
        project_key: impl Into<ProjectKey>,
        user_id: impl Into<UserId>,
        token: impl Into<Token>,
    ) -> Self {
        Self {
            project_key: project_key.into(),
            user_id: user_id.into(),
            token: token.into(),
        }
    }
}

/// A balance row.
///
/// A row that has never been written is equivalent to `balance = 0,
/// version = 0`; `version` increments on every committed mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WalletEntry {
    #[serde(flatten)]
    pub key: WalletKey,
    pub balance: i64,
    pub version: u64,
}

impl WalletEntry {
    pub fn empty(key: WalletKey) -> Self {
        Self {
            key,
            balance: 0,
            version: 0,
        }
    }
}

/// A signed change to one balance derived from an event.
///
/// Never stored; recomputable from the event and the rule set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DistributionInstruction {
    pub event_id: Uuid,
    pub project_key: ProjectKey,
    pub user_id: UserId,
    pub token: Token,
    /// Positive credits, negative debits
    pub amount: i64,
}

impl DistributionInstruction {
    pub fn wallet_key(&self) -> WalletKey {
        WalletKey {
            project_key: self.project_key.clone(),
            user_id: self.user_id.clone(),
            token: self.token.clone(),
        }
    }
}

/// Manual credit or debit that bypasses the rule engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DistributionRequest {
    pub project_key: ProjectKey,
    pub user_id: UserId,
    pub token: Token,
    pub amount: i64,
    pub idempotency_key: String,
}

impl DistributionRequest {
    pub fn validate(&self) -> Result<(), ValidationError> {
        self.project_key.validate()?;
        self.user_id.validate()?;
        self.token.validate()?;
        validate_text(
            "idempotencyKey",
            &self.idempotency_key,
            MAX_IDEMPOTENCY_KEY_LEN,
        )?;
        if self.amount == 0 {
            return Err(ValidationError::new("amount", "must not be zero"));
        }
        Ok(())
    }

    pub fn wallet_key(&self) -> WalletKey {
        WalletKey {
            project_key: self.project_key.clone(),
            user_id: self.user_id.clone(),
            token: self.token.clone(),
        }
    }
}

/// Stored idempotency record of an applied distribution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DistributionRecord {
    pub project_key: ProjectKey,
    pub idempotency_key: String,
    pub user_id: UserId,
    pub token: Token,
    pub amount: i64,
    pub created_at: DateTime<Utc>,
}

impl DistributionRecord {
    pub fn from_request(request: &DistributionRequest, created_at: DateTime<Utc>) -> Self {
        Self {
            project_key: request.project_key.clone(),
            idempotency_key: request.idempotency_key.clone(),
            user_id: request.user_id.clone(),
            token: request.token.clone(),
            amount: request.amount,
            created_at,
        }
    }

    /// Whether a retried request carries the same parameters.
    pub fn matches(&self, request: &DistributionRequest) -> bool {
        self.project_key == request.project_key
            && self.idempotency_key == request.idempotency_key
            && self.user_id == request.user_id
            && self.token == request.token
            && self.amount == request.amount
    }

    pub fn wallet_key(&self) -> WalletKey {
        WalletKey {
            project_key: self.project_key.clone(),
            user_id: self.user_id.clone(),
            token: self.token.clone(),
        }
    }
}

/// Slot for a reward that is earned at most once per window.
///
/// Only the event holding the claim is credited; the claim is committed
/// together with that event's processed marker.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RewardClaim {
    pub project_key: ProjectKey,
    pub user_id: UserId,
    pub event_type: EventType,
    /// First UTC day of the window
    pub window_start: NaiveDate,
}

impl fmt::Display for RewardClaim {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}@{}",
            self.project_key, self.user_id, self.event_type, self.window_start
        )
    }
}

/// Outcome of a distribution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DistributionReceipt {
    pub record: DistributionRecord,

    /// Balance row after the distribution (current row on a replay)
    pub entry: WalletEntry,

    /// True when the idempotency key had already been applied
    pub replayed: bool,
}
