//! Wallet ledger and distributor
//!
//! Turns ledger events into balance changes exactly once, and applies manual
//! distributions idempotently.
//!
//! # Exactly-once application
//!
//! Every apply reads the current rows, computes new balances and commits
//! them together with a marker (`processed_events` or `distributions`).
//! The store compares each row's version inside the commit:
//!
//! - a version that moved is a conflict, retried here with backoff
//! - a marker that already exists means another request won; the current
//!   rows are returned as a replay
//!
//! # Once-per-window rewards
//!
//! Events of a rule limited to one reward per window also commit a
//! [`RewardClaim`]. An event whose claim is held by another event is still
//! marked processed, with no balance change. Two events racing for the
//! same claim see `ClaimTaken` on the losing commit, which retries and then
//! finds the claim held.

use chrono::Utc;
use futures::stream::{self, Stream, TryStreamExt};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::domain::{
    AppendReceipt, Balances, DistributionInstruction, DistributionReceipt, DistributionRecord,
    DistributionRequest, Event, EventPage, NewEvent, ProjectKey, RewardClaim, UserId,
    ValidationError, WalletEntry, WalletKey,
};
use crate::infra::{
    CommitOutcome, EventLedger, LedgerError, Result, Retry, RetryConfig, WalletMutation,
    WalletStore, WalletWrite,
};
use crate::metrics::{metric_names, timed, MetricsRegistry};
use crate::rules::RuleEngine;

/// Largest page a ledger scan may request
pub const MAX_PAGE_SIZE: u32 = 500;

/// Page size used when the caller does not pick one
pub const DEFAULT_PAGE_SIZE: u32 = 100;

/// Tunables for the distributor
#[derive(Debug, Clone)]
pub struct DistributorConfig {
    /// Backoff for version conflicts
    pub retry: RetryConfig,
    /// Bound on every single storage call
    pub operation_timeout: Duration,
}

impl Default for DistributorConfig {
    fn default() -> Self {
        Self {
            retry: RetryConfig::conflicts(),
            operation_timeout: Duration::from_secs(5),
        }
    }
}

/// Result of applying one event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplyReceipt {
    pub event_id: Uuid,

    /// Rows the event touches, after application
    pub entries: Vec<WalletEntry>,

    /// True when the event had already been applied
    pub replayed: bool,
}

/// Result of recording and applying a new event
#[derive(Debug, Clone, PartialEq)]
pub struct IngestReceipt {
    pub event: Event,
    pub duplicate: bool,
    pub applied: ApplyReceipt,
}

/// Applies reward rules and manual distributions to wallets
pub struct Distributor {
    ledger: Arc<dyn EventLedger>,
    wallets: Arc<dyn WalletStore>,
    rules: Arc<RuleEngine>,
    retry: Retry,
    operation_timeout: Duration,
    metrics: Arc<MetricsRegistry>,
}

impl Distributor {
    pub fn new(
        ledger: Arc<dyn EventLedger>,
        wallets: Arc<dyn WalletStore>,
        rules: Arc<RuleEngine>,
        config: DistributorConfig,
        metrics: Arc<MetricsRegistry>,
    ) -> Self {
        Self {
            ledger,
            wallets,
            rules,
            retry: Retry::new(config.retry),
            operation_timeout: config.operation_timeout,
            metrics,
        }
    }

    pub fn rules(&self) -> &RuleEngine {
        &self.rules
    }

    pub fn metrics(&self) -> &Arc<MetricsRegistry> {
        &self.metrics
    }

    /// Record an event in the ledger without applying it
    #[instrument(skip(self, event), fields(project_key = %event.project_key, user_id = %event.user_id, event_type = %event.event_type))]
    pub async fn append(&self, event: NewEvent) -> Result<AppendReceipt> {
        let receipt = self.bounded("append", self.ledger.append(event)).await?;

        let counter = if receipt.duplicate {
            metric_names::EVENTS_DUPLICATE
        } else {
            metric_names::EVENTS_APPENDED
        };
        self.metrics.inc_counter(counter).await;

        Ok(receipt)
    }

    /// Record an event and apply its rewards.
    ///
    /// A failure after the event is recorded comes back as `NotApplied`
    /// carrying the event id; resubmitting the same event (or calling
    /// [`Distributor::apply_event`]) finishes the work.
    pub async fn ingest(&self, event: NewEvent) -> Result<IngestReceipt> {
        let AppendReceipt { event, duplicate } = self.append(event).await?;

        match self.apply_event(event.id).await {
            Ok(applied) => Ok(IngestReceipt {
                event,
                duplicate,
                applied,
            }),
            Err(source) => Err(LedgerError::NotApplied {
                event_id: event.id,
                source: Box::new(source),
            }),
        }
    }

    /// Apply an event's instructions exactly once
    #[instrument(skip(self), fields(event_id = %event_id))]
    pub async fn apply_event(&self, event_id: Uuid) -> Result<ApplyReceipt> {
        let event = self
            .bounded("get_event", self.ledger.get(event_id))
            .await?
            .ok_or(LedgerError::EventNotFound(event_id))?;

        let instructions = self.rules.evaluate(&event);
        let claim = if instructions.is_empty() {
            None
        } else {
            self.rules.claim_for(&event)
        };

        let outcome = timed(
            &self.metrics,
            metric_names::APPLY_LATENCY,
            self.retry.run_with_predicate(
                || self.try_apply(&event, &instructions, claim.as_ref()),
                LedgerError::is_conflict,
            ),
        )
        .await;
        self.record_retries(outcome.attempts).await;

        let receipt = match outcome.into_result() {
            Ok(receipt) => receipt,
            Err(err) => return Err(self.note_failure(err).await),
        };

        let counter = if receipt.replayed {
            metric_names::EVENTS_REPLAYED
        } else {
            metric_names::EVENTS_APPLIED
        };
        self.metrics.inc_counter(counter).await;

        Ok(receipt)
    }

    async fn try_apply(
        &self,
        event: &Event,
        instructions: &[DistributionInstruction],
        claim: Option<&RewardClaim>,
    ) -> Result<ApplyReceipt> {
        let taken = match claim {
            Some(claim) => self.claimed_by_other(claim, event.id).await?,
            None => false,
        };
        let (instructions, claim) = if taken {
            info!(event_id = %event.id, "Reward window already claimed");
            (&[][..], None)
        } else {
            (instructions, claim.cloned())
        };

        let keys: Vec<WalletKey> = instructions
            .iter()
            .map(DistributionInstruction::wallet_key)
            .collect();

        if self
            .bounded("is_event_processed", self.wallets.is_event_processed(event.id))
            .await?
        {
            return self.replayed_apply(event.id, &keys).await;
        }

        let current = self.bounded("load", self.wallets.load(&keys)).await?;
        let writes = current
            .into_iter()
            .zip(instructions)
            .map(|(entry, instruction)| self.plan_write(entry, instruction.amount))
            .collect::<Result<Vec<_>>>()?;

        let mutation = WalletMutation::for_event(event.id, writes).with_claim(claim);

        match self.bounded("commit", self.wallets.commit(mutation)).await? {
            CommitOutcome::Committed(entries) => {
                info!(
                    event_id = %event.id,
                    instructions = instructions.len(),
                    "Applied event"
                );
                Ok(ApplyReceipt {
                    event_id: event.id,
                    entries,
                    replayed: false,
                })
            }
            CommitOutcome::AlreadyApplied => self.replayed_apply(event.id, &keys).await,
        }
    }

    /// Whether an event other than `event_id` holds `claim`
    async fn claimed_by_other(&self, claim: &RewardClaim, event_id: Uuid) -> Result<bool> {
        let holder = self
            .bounded("claim_holder", self.wallets.claim_holder(claim))
            .await?;
        Ok(holder.is_some_and(|holder| holder != event_id))
    }

    async fn replayed_apply(&self, event_id: Uuid, keys: &[WalletKey]) -> Result<ApplyReceipt> {
        let entries = self.bounded("load", self.wallets.load(keys)).await?;
        Ok(ApplyReceipt {
            event_id,
            entries,
            replayed: true,
        })
    }

    /// Manual credit or debit, idempotent on `(project_key, idempotency_key)`
    #[instrument(
        skip(self, request),
        fields(
            project_key = %request.project_key,
            user_id = %request.user_id,
            token = %request.token,
            amount = request.amount,
        )
    )]
    pub async fn distribute(&self, request: DistributionRequest) -> Result<DistributionReceipt> {
        request.validate()?;

        let outcome = timed(
            &self.metrics,
            metric_names::DISTRIBUTE_LATENCY,
            self.retry
                .run_with_predicate(|| self.try_distribute(&request), LedgerError::is_conflict),
        )
        .await;
        self.record_retries(outcome.attempts).await;

        let receipt = match outcome.into_result() {
            Ok(receipt) => receipt,
            Err(err) => return Err(self.note_failure(err).await),
        };

        let counter = if receipt.replayed {
            metric_names::DISTRIBUTIONS_REPLAYED
        } else {
            metric_names::DISTRIBUTIONS_APPLIED
        };
        self.metrics.inc_counter(counter).await;

        Ok(receipt)
    }

    async fn try_distribute(&self, request: &DistributionRequest) -> Result<DistributionReceipt> {
        if let Some(record) = self.find_distribution(request).await? {
            return self.replayed_distribution(record, request).await;
        }

        let key = request.wallet_key();
        let loaded = self
            .bounded("load", self.wallets.load(std::slice::from_ref(&key)))
            .await?;
        let current = loaded
            .into_iter()
            .next()
            .unwrap_or_else(|| WalletEntry::empty(key));
        let write = self.plan_write(current, request.amount)?;

        let record = DistributionRecord::from_request(request, Utc::now());
        let mutation = WalletMutation::for_distribution(record.clone(), vec![write]);

        match self.bounded("commit", self.wallets.commit(mutation)).await? {
            CommitOutcome::Committed(mut entries) => {
                let entry = entries.pop().ok_or_else(|| {
                    LedgerError::Internal("commit returned no wallet row".to_string())
                })?;
                info!(
                    idempotency_key = %record.idempotency_key,
                    balance = entry.balance,
                    "Applied distribution"
                );
                Ok(DistributionReceipt {
                    record,
                    entry,
                    replayed: false,
                })
            }
            CommitOutcome::AlreadyApplied => {
                let record = self.find_distribution(request).await?.ok_or_else(|| {
                    LedgerError::Internal(format!(
                        "distribution {} reported applied but not found",
                        request.idempotency_key
                    ))
                })?;
                self.replayed_distribution(record, request).await
            }
        }
    }

    async fn find_distribution(
        &self,
        request: &DistributionRequest,
    ) -> Result<Option<DistributionRecord>> {
        self.bounded(
            "find_distribution",
            self.wallets
                .find_distribution(&request.project_key, &request.idempotency_key),
        )
        .await
    }

    async fn replayed_distribution(
        &self,
        record: DistributionRecord,
        request: &DistributionRequest,
    ) -> Result<DistributionReceipt> {
        if !record.matches(request) {
            return Err(LedgerError::IdempotencyKeyReused {
                project_key: request.project_key.clone(),
                idempotency_key: request.idempotency_key.clone(),
            });
        }

        let key = record.wallet_key();
        let loaded = self
            .bounded("load", self.wallets.load(std::slice::from_ref(&key)))
            .await?;
        let entry = loaded
            .into_iter()
            .next()
            .unwrap_or_else(|| WalletEntry::empty(key));

        Ok(DistributionReceipt {
            record,
            entry,
            replayed: true,
        })
    }

    /// New balance for `entry` after `amount`, honoring the overdraft policy
    fn plan_write(&self, entry: WalletEntry, amount: i64) -> Result<WalletWrite> {
        let new_balance = entry.balance.checked_add(amount).ok_or_else(|| {
            ValidationError::new("amount", "balance would overflow a 64-bit integer")
        })?;

        if amount < 0 && new_balance < 0 && !self.rules.allows_overdraft(&entry.key.token) {
            return Err(LedgerError::InsufficientFunds {
                project_key: entry.key.project_key,
                user_id: entry.key.user_id,
                token: entry.key.token,
                balance: entry.balance,
                amount,
            });
        }

        Ok(WalletWrite {
            key: entry.key,
            expected_version: entry.version,
            new_balance,
        })
    }

    /// Every token balance of one user; unknown users have none
    pub async fn get_balance(&self, project_key: &ProjectKey, user_id: &UserId) -> Result<Balances> {
        project_key.validate()?;
        user_id.validate()?;
        self.bounded("balances", self.wallets.balances(project_key, user_id))
            .await
    }

    /// One page of a user's events after `cursor`
    pub async fn list_since(
        &self,
        project_key: &ProjectKey,
        user_id: &UserId,
        cursor: Option<u64>,
        limit: u32,
    ) -> Result<EventPage> {
        project_key.validate()?;
        user_id.validate()?;
        let cursor = check_cursor(cursor)?;
        let limit = clamp_page_size(limit)?;
        self.bounded(
            "list_since",
            self.ledger.list_since(project_key, user_id, cursor, limit),
        )
        .await
    }

    /// A user's events after `after`, fetched lazily page by page
    pub fn replay(
        &self,
        project_key: ProjectKey,
        user_id: UserId,
        after: Option<u64>,
        page_size: u32,
    ) -> impl Stream<Item = Result<Event>> + '_ {
        paginate(after, move |cursor| {
            let project_key = project_key.clone();
            let user_id = user_id.clone();
            async move {
                self.list_since(&project_key, &user_id, cursor, page_size)
                    .await
            }
        })
    }

    /// A project's events after `after`, fetched lazily page by page
    pub fn replay_project(
        &self,
        project_key: ProjectKey,
        after: Option<u64>,
        page_size: u32,
    ) -> impl Stream<Item = Result<Event>> + '_ {
        paginate(after, move |cursor| {
            let project_key = project_key.clone();
            async move { self.scan_project(&project_key, cursor, page_size).await }
        })
    }

    /// One page of a project's events after `cursor`
    pub async fn scan_project(
        &self,
        project_key: &ProjectKey,
        cursor: Option<u64>,
        limit: u32,
    ) -> Result<EventPage> {
        project_key.validate()?;
        let cursor = check_cursor(cursor)?;
        let limit = clamp_page_size(limit)?;
        self.bounded(
            "scan_project",
            self.ledger.scan_project(project_key, cursor, limit),
        )
        .await
    }

    /// Recompute a project's balances from processed events and distributions
    /// and report every row that disagrees with the stored balance.
    pub async fn verify_balances(&self, project_key: &ProjectKey) -> Result<Vec<BalanceDrift>> {
        let mut expected: std::collections::BTreeMap<WalletKey, i64> = Default::default();

        let mut events = Box::pin(self.replay_project(
            project_key.clone(),
            None,
            MAX_PAGE_SIZE,
        ));
        while let Some(event) = events.try_next().await? {
            if !self
                .bounded("is_event_processed", self.wallets.is_event_processed(event.id))
                .await?
            {
                continue;
            }
            let instructions = self.rules.evaluate(&event);
            if instructions.is_empty() {
                continue;
            }
            if let Some(claim) = self.rules.claim_for(&event) {
                if self.claimed_by_other(&claim, event.id).await? {
                    continue;
                }
            }
            for instruction in instructions {
                *expected.entry(instruction.wallet_key()).or_insert(0) += instruction.amount;
            }
        }

        let distributions = self
            .bounded("distributions", self.wallets.distributions(project_key))
            .await?;
        for record in distributions {
            *expected.entry(record.wallet_key()).or_insert(0) += record.amount;
        }

        let stored = self
            .bounded("entries", self.wallets.entries(project_key))
            .await?;

        let mut drift = Vec::new();
        for entry in stored {
            let want = expected.remove(&entry.key).unwrap_or(0);
            if want != entry.balance {
                drift.push(BalanceDrift {
                    key: entry.key,
                    stored: entry.balance,
                    expected: want,
                });
            }
        }
        drift.extend(
            expected
                .into_iter()
                .filter(|(_, want)| *want != 0)
                .map(|(key, want)| BalanceDrift {
                    key,
                    stored: 0,
                    expected: want,
                }),
        );
        Ok(drift)
    }

    async fn note_failure(&self, err: LedgerError) -> LedgerError {
        if matches!(err, LedgerError::InsufficientFunds { .. }) {
            warn!(error = %err, "Balance change rejected");
            self.metrics
                .inc_counter(metric_names::INSUFFICIENT_FUNDS)
                .await;
        }
        err
    }

    async fn record_retries(&self, attempts: u32) {
        if attempts > 1 {
            self.metrics
                .add_counter(metric_names::CONFLICTS_RETRIED, u64::from(attempts - 1))
                .await;
        }
    }

    /// Run one storage call under the operation timeout
    async fn bounded<T>(&self, operation: &'static str, fut: impl Future<Output = Result<T>>) -> Result<T> {
        match tokio::time::timeout(self.operation_timeout, fut).await {
            Ok(result) => result,
            Err(_) => {
                self.metrics
                    .inc_counter(metric_names::STORAGE_TIMEOUTS)
                    .await;
                Err(LedgerError::StorageUnavailable(format!(
                    "{operation} timed out after {}ms",
                    self.operation_timeout.as_millis()
                )))
            }
        }
    }
}

/// A stored balance that disagrees with its recomputed value
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BalanceDrift {
    pub key: WalletKey,
    pub stored: i64,
    pub expected: i64,
}

/// Cursors are stored as signed 64-bit integers
fn check_cursor(cursor: Option<u64>) -> Result<Option<u64>> {
    match cursor {
        Some(c) if c > i64::MAX as u64 => {
            Err(ValidationError::new("cursor", "must be at most 9223372036854775807").into())
        }
        other => Ok(other),
    }
}

fn clamp_page_size(limit: u32) -> Result<u32> {
    if limit == 0 {
        return Err(ValidationError::new("limit", "must be at least 1").into());
    }
    Ok(limit.min(MAX_PAGE_SIZE))
}

/// Flatten cursor pages after `start` into a stream of events.
fn paginate<'a, F, Fut>(start: Option<u64>, fetch: F) -> impl Stream<Item = Result<Event>> + 'a
where
    F: Fn(Option<u64>) -> Fut + 'a,
    Fut: Future<Output = Result<EventPage>> + 'a,
{
    // State: `None` once the last page has been read
    stream::try_unfold(Some(start), move |state: Option<Option<u64>>| {
        let next = state.map(&fetch);
        async move {
            match next {
                None => Ok(None),
                Some(page) => page
                    .await
                    .map(|page| Some((page.events, page.next_cursor.map(Some)))),
            }
        }
    })
    .map_ok(|events| stream::iter(events.into_iter().map(Ok::<Event, LedgerError>)))
    .try_flatten()
}
