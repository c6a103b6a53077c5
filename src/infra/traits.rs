//! Storage contracts for the event ledger and wallet ledger

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use uuid::Uuid;

use crate::domain::{
    AppendReceipt, Balances, DistributionRecord, Event, EventPage, NewEvent, ProjectKey,
    RewardClaim, UserId, WalletEntry, WalletKey,
};

use super::{LedgerError, Result};

/// Append-only record of user actions.
///
/// Invariant: no update or delete exists; an accepted event never changes.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait EventLedger: Send + Sync {
    /// Persist an event and assign its sequence position
    ///
    /// - Validates required fields and limits
    /// - Assigns `id` and `received_at` when absent
    /// - A known `id` or `(project_key, idempotency_key)` returns the stored
    ///   event with `duplicate = true`
    async fn append(&self, event: NewEvent) -> Result<AppendReceipt>;

    /// Read one event by id
    async fn get(&self, event_id: Uuid) -> Result<Option<Event>>;

    /// Events of one user strictly after `cursor`, in sequence order
    async fn list_since(
        &self,
        project_key: &ProjectKey,
        user_id: &UserId,
        cursor: Option<u64>,
        limit: u32,
    ) -> Result<EventPage>;

    /// Events of every user in a project strictly after `cursor`
    async fn scan_project(
        &self,
        project_key: &ProjectKey,
        cursor: Option<u64>,
        limit: u32,
    ) -> Result<EventPage>;
}

/// Balance rows plus the exactly-once markers that guard them.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait WalletStore: Send + Sync {
    /// Current rows for `keys`, in the same order; missing rows come back
    /// as `balance = 0, version = 0`
    async fn load(&self, keys: &[WalletKey]) -> Result<Vec<WalletEntry>>;

    /// All token balances of one user
    async fn balances(&self, project_key: &ProjectKey, user_id: &UserId) -> Result<Balances>;

    /// Whether an event's instructions have been applied
    async fn is_event_processed(&self, event_id: Uuid) -> Result<bool>;

    /// Idempotency record of a manual distribution
    async fn find_distribution(
        &self,
        project_key: &ProjectKey,
        idempotency_key: &str,
    ) -> Result<Option<DistributionRecord>>;

    /// Event holding a once-per-window reward claim
    async fn claim_holder(&self, claim: &RewardClaim) -> Result<Option<Uuid>>;

    /// Apply writes and record the marker in one atomic step
    ///
    /// Every write is compared against its row's current version. Any
    /// mismatch fails the whole commit with `VersionConflict`; an existing
    /// marker returns `AlreadyApplied` without touching a row. A claim held
    /// by another event fails the commit with `ClaimTaken`.
    ///
    /// Writes must name distinct rows.
    async fn commit(&self, mutation: WalletMutation) -> Result<CommitOutcome>;

    /// Every row in a project
    async fn entries(&self, project_key: &ProjectKey) -> Result<Vec<WalletEntry>>;

    /// Every distribution recorded in a project
    async fn distributions(&self, project_key: &ProjectKey) -> Result<Vec<DistributionRecord>>;
}

/// Exactly-once marker committed together with the balance writes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommitMarker {
    /// Row for `processed_events`
    Event(Uuid),
    /// Row for `distributions`
    Distribution(DistributionRecord),
}

/// New balance for one row, guarded by the version it was computed from
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalletWrite {
    pub key: WalletKey,
    pub expected_version: u64,
    pub new_balance: i64,
}

/// One atomic wallet update
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalletMutation {
    pub marker: CommitMarker,
    /// Reward claim recorded for the event marker
    pub claim: Option<RewardClaim>,
    pub writes: Vec<WalletWrite>,
}

impl WalletMutation {
    /// Mutation guarded by the processed marker of `event_id`
    pub fn for_event(event_id: Uuid, writes: Vec<WalletWrite>) -> Self {
        Self {
            marker: CommitMarker::Event(event_id),
            claim: None,
            writes,
        }
    }

    /// Mutation guarded by a distribution's idempotency record
    pub fn for_distribution(record: DistributionRecord, writes: Vec<WalletWrite>) -> Self {
        Self {
            marker: CommitMarker::Distribution(record),
            claim: None,
            writes,
        }
    }

    pub fn with_claim(mut self, claim: Option<RewardClaim>) -> Self {
        self.claim = claim;
        self
    }

    /// Reject writes that name the same row twice.
    pub fn ensure_distinct_rows(&self) -> Result<()> {
        let mut seen = std::collections::HashSet::new();
        match self.writes.iter().map(|w| &w.key).find(|key| !seen.insert(*key)) {
            Some(key) => Err(LedgerError::Internal(format!(
                "wallet row {}/{}/{} written twice in one commit",
                key.project_key, key.user_id, key.token
            ))),
            None => Ok(()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommitOutcome {
    /// Rows after the commit, in write order
    Committed(Vec<WalletEntry>),
    /// The marker already existed; nothing was written
    AlreadyApplied,
}

/// Health of a storage backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ComponentHealth {
    Healthy,
    Unhealthy { reason: String },
}

impl ComponentHealth {
    pub fn is_healthy(&self) -> bool {
        matches!(self, ComponentHealth::Healthy)
    }
}

/// Health check trait
#[cfg_attr(test, automock)]
#[async_trait]
pub trait HealthCheck: Send + Sync {
    /// Round trip to the backing storage
    async fn check_health(&self) -> ComponentHealth;
}
