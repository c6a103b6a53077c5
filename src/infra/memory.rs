//! In-memory ledger and wallet store
//!
//! Used when `DATABASE_URL=memory` and by tests. Commits lock only the
//! wallet rows they touch, always in key order, so disjoint users never wait
//! on each other.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use tracing::instrument;
use uuid::Uuid;

use crate::domain::{
    AppendReceipt, Balances, DistributionRecord, Event, EventPage, NewEvent, ProjectKey,
    RewardClaim, UserId, WalletEntry, WalletKey,
};
use crate::infra::{
    CommitMarker, CommitOutcome, ComponentHealth, EventLedger, HealthCheck, LedgerError, Result,
    WalletMutation, WalletStore,
};

#[derive(Debug, Default)]
struct EventLog {
    events: Vec<Event>,
    by_id: HashMap<Uuid, usize>,
    by_idempotency_key: HashMap<(ProjectKey, String), usize>,
}

impl EventLog {
    fn existing(&self, event: &NewEvent) -> Option<&Event> {
        let by_id = event.id.and_then(|id| self.by_id.get(&id));
        let by_key = || {
            event.idempotency_key.as_ref().and_then(|key| {
                self.by_idempotency_key
                    .get(&(event.project_key.clone(), key.clone()))
            })
        };
        by_id.or_else(by_key).map(|idx| &self.events[*idx])
    }

    fn page(
        &self,
        filter: impl Fn(&Event) -> bool,
        cursor: Option<u64>,
        limit: u32,
    ) -> EventPage {
        // sequence == index + 1
        let start = cursor.unwrap_or(0) as usize;
        let events: Vec<Event> = self
            .events
            .iter()
            .skip(start)
            .filter(|e| filter(e))
            .take(limit as usize)
            .cloned()
            .collect();

        let next_cursor = if events.len() == limit as usize {
            events.last().map(|e| e.sequence)
        } else {
            None
        };
        EventPage {
            events,
            next_cursor,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct WalletRow {
    balance: i64,
    version: u64,
}

#[derive(Debug, Default)]
struct Markers {
    processed: HashSet<Uuid>,
    distributions: HashMap<(ProjectKey, String), DistributionRecord>,
    claims: HashMap<RewardClaim, Uuid>,
}

/// Process-local implementation of [`EventLedger`] and [`WalletStore`]
#[derive(Debug, Default)]
pub struct MemoryStore {
    log: RwLock<EventLog>,
    rows: RwLock<HashMap<WalletKey, Arc<Mutex<WalletRow>>>>,
    markers: Mutex<Markers>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Row handles for `keys`, created on first use.
    async fn row_handles(&self, keys: &[WalletKey]) -> Vec<Arc<Mutex<WalletRow>>> {
        let mut rows = self.rows.write().await;
        keys.iter()
            .map(|key| rows.entry(key.clone()).or_default().clone())
            .collect()
    }

    async fn snapshot(&self, key: &WalletKey) -> WalletEntry {
        let handle = self.rows.read().await.get(key).cloned();
        match handle {
            Some(row) => {
                let row = *row.lock().await;
                WalletEntry {
                    key: key.clone(),
                    balance: row.balance,
                    version: row.version,
                }
            }
            None => WalletEntry::empty(key.clone()),
        }
    }

    async fn collect_entries(&self, keep: impl Fn(&WalletKey) -> bool) -> Vec<WalletEntry> {
        let handles: Vec<(WalletKey, Arc<Mutex<WalletRow>>)> = self
            .rows
            .read()
            .await
            .iter()
            .filter(|(key, _)| keep(key))
            .map(|(key, row)| (key.clone(), row.clone()))
            .collect();

        let mut entries = Vec::with_capacity(handles.len());
        for (key, row) in handles {
            let row = *row.lock().await;
            // Version 0 rows were created by a commit that never landed
            if row.version > 0 {
                entries.push(WalletEntry {
                    key,
                    balance: row.balance,
                    version: row.version,
                });
            }
        }
        entries.sort_by(|a, b| a.key.cmp(&b.key));
        entries
    }
}

#[async_trait]
impl EventLedger for MemoryStore {
    #[instrument(skip(self, event), fields(project_key = %event.project_key, user_id = %event.user_id))]
    async fn append(&self, event: NewEvent) -> Result<AppendReceipt> {
        event.validate()?;

        let mut log = self.log.write().await;
        if let Some(existing) = log.existing(&event) {
            return Ok(AppendReceipt {
                event: existing.clone(),
                duplicate: true,
            });
        }

        let mut stored = event.into_event(Utc::now())?;
        stored.sequence = log.events.len() as u64 + 1;

        let idx = log.events.len();
        log.by_id.insert(stored.id, idx);
        if let Some(key) = &stored.idempotency_key {
            log.by_idempotency_key
                .insert((stored.project_key.clone(), key.clone()), idx);
        }
        log.events.push(stored.clone());

        Ok(AppendReceipt {
            event: stored,
            duplicate: false,
        })
    }

    async fn get(&self, event_id: Uuid) -> Result<Option<Event>> {
        let log = self.log.read().await;
        Ok(log.by_id.get(&event_id).map(|idx| log.events[*idx].clone()))
    }

    async fn list_since(
        &self,
        project_key: &ProjectKey,
        user_id: &UserId,
        cursor: Option<u64>,
        limit: u32,
    ) -> Result<EventPage> {
        let log = self.log.read().await;
        Ok(log.page(
            |e| &e.project_key == project_key && &e.user_id == user_id,
            cursor,
            limit,
        ))
    }

    async fn scan_project(
        &self,
        project_key: &ProjectKey,
        cursor: Option<u64>,
        limit: u32,
    ) -> Result<EventPage> {
        let log = self.log.read().await;
        Ok(log.page(|e| &e.project_key == project_key, cursor, limit))
    }
}

#[async_trait]
impl WalletStore for MemoryStore {
    async fn load(&self, keys: &[WalletKey]) -> Result<Vec<WalletEntry>> {
        let mut entries = Vec::with_capacity(keys.len());
        for key in keys {
            entries.push(self.snapshot(key).await);
        }
        Ok(entries)
    }

    async fn balances(&self, project_key: &ProjectKey, user_id: &UserId) -> Result<Balances> {
        let entries = self
            .collect_entries(|k| &k.project_key == project_key && &k.user_id == user_id)
            .await;
        Ok(entries
            .into_iter()
            .map(|entry| (entry.key.token, entry.balance))
            .collect())
    }

    async fn is_event_processed(&self, event_id: Uuid) -> Result<bool> {
        Ok(self.markers.lock().await.processed.contains(&event_id))
    }

    async fn find_distribution(
        &self,
        project_key: &ProjectKey,
        idempotency_key: &str,
    ) -> Result<Option<DistributionRecord>> {
        let markers = self.markers.lock().await;
        Ok(markers
            .distributions
            .get(&(project_key.clone(), idempotency_key.to_string()))
            .cloned())
    }

    async fn claim_holder(&self, claim: &RewardClaim) -> Result<Option<Uuid>> {
        Ok(self.markers.lock().await.claims.get(claim).copied())
    }

    #[instrument(skip(self, mutation), fields(writes = mutation.writes.len()))]
    async fn commit(&self, mutation: WalletMutation) -> Result<CommitOutcome> {
        // A row locked twice would wait on itself
        mutation.ensure_distinct_rows()?;

        let mut order: Vec<usize> = (0..mutation.writes.len()).collect();
        order.sort_by(|a, b| mutation.writes[*a].key.cmp(&mutation.writes[*b].key));

        let sorted_keys: Vec<WalletKey> = order
            .iter()
            .map(|i| mutation.writes[*i].key.clone())
            .collect();
        let handles = self.row_handles(&sorted_keys).await;

        // Rows first (key order), then markers
        let mut guards: Vec<OwnedMutexGuard<WalletRow>> = Vec::with_capacity(handles.len());
        for handle in handles {
            guards.push(handle.lock_owned().await);
        }
        let mut markers = self.markers.lock().await;

        let already = match &mutation.marker {
            CommitMarker::Event(id) => markers.processed.contains(id),
            CommitMarker::Distribution(record) => markers.distributions.contains_key(&(
                record.project_key.clone(),
                record.idempotency_key.clone(),
            )),
        };
        if already {
            return Ok(CommitOutcome::AlreadyApplied);
        }

        if let (CommitMarker::Event(id), Some(claim)) = (&mutation.marker, &mutation.claim) {
            if markers.claims.get(claim).is_some_and(|holder| holder != id) {
                return Err(LedgerError::ClaimTaken(claim.clone()));
            }
        }

        for (guard, idx) in guards.iter().zip(&order) {
            let write = &mutation.writes[*idx];
            if guard.version != write.expected_version {
                return Err(LedgerError::VersionConflict {
                    project_key: write.key.project_key.clone(),
                    user_id: write.key.user_id.clone(),
                    token: write.key.token.clone(),
                    expected: write.expected_version,
                });
            }
        }

        let mut committed = vec![None; mutation.writes.len()];
        for (guard, idx) in guards.iter_mut().zip(&order) {
            let write = &mutation.writes[*idx];
            guard.balance = write.new_balance;
            guard.version = write.expected_version + 1;
            committed[*idx] = Some(WalletEntry {
                key: write.key.clone(),
                balance: guard.balance,
                version: guard.version,
            });
        }

        match mutation.marker {
            CommitMarker::Event(id) => {
                markers.processed.insert(id);
                if let Some(claim) = mutation.claim {
                    markers.claims.insert(claim, id);
                }
            }
            CommitMarker::Distribution(record) => {
                markers.distributions.insert(
                    (record.project_key.clone(), record.idempotency_key.clone()),
                    record,
                );
            }
        }

        Ok(CommitOutcome::Committed(committed.into_iter().flatten().collect()))
    }

    async fn entries(&self, project_key: &ProjectKey) -> Result<Vec<WalletEntry>> {
        Ok(self.collect_entries(|k| &k.project_key == project_key).await)
    }

    async fn distributions(&self, project_key: &ProjectKey) -> Result<Vec<DistributionRecord>> {
        let markers = self.markers.lock().await;
        let mut records: Vec<DistributionRecord> = markers
            .distributions
            .values()
            .filter(|r| &r.project_key == project_key)
            .cloned()
            .collect();
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(records)
    }
}

#[async_trait]
impl HealthCheck for MemoryStore {
    async fn check_health(&self) -> ComponentHealth {
        ComponentHealth::Healthy
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Token;
    use crate::infra::WalletWrite;
    use serde_json::json;

    fn key(user: &str) -> WalletKey {
        WalletKey::new("p1", user, Token::tgem())
    }

    fn write(user: &str, expected_version: u64, new_balance: i64) -> WalletWrite {
        WalletWrite {
            key: key(user),
            expected_version,
            new_balance,
        }
    }

    #[tokio::test]
    async fn test_append_assigns_increasing_sequence() {
        let store = MemoryStore::new();
        let a = store.append(NewEvent::new("p1", "u1", "daily_login")).await.unwrap();
        let b = store.append(NewEvent::new("p1", "u2", "daily_login")).await.unwrap();

        assert!(!a.duplicate);
        assert_eq!(a.event.sequence, 1);
        assert_eq!(b.event.sequence, 2);
        assert_eq!(store.get(a.event.id).await.unwrap(), Some(a.event));
    }

    #[tokio::test]
    async fn test_append_dedupes_by_id_and_idempotency_key() {
        let store = MemoryStore::new();
        let id = Uuid::new_v4();
        let first = store
            .append(NewEvent::new("p1", "u1", "purchase").with_id(id))
            .await
            .unwrap();
        let again = store
            .append(
                NewEvent::new("p1", "u1", "purchase")
                    .with_id(id)
                    .with_property("amount", json!(99)),
            )
            .await
            .unwrap();
        assert!(again.duplicate);
        assert_eq!(again.event, first.event);

        let keyed = store
            .append(NewEvent::new("p1", "u1", "referral").with_idempotency_key("k1"))
            .await
            .unwrap();
        let retried = store
            .append(NewEvent::new("p1", "u1", "referral").with_idempotency_key("k1"))
            .await
            .unwrap();
        assert!(retried.duplicate);
        assert_eq!(retried.event.id, keyed.event.id);

        // Same key in another project is a different event
        let other = store
            .append(NewEvent::new("p2", "u1", "referral").with_idempotency_key("k1"))
            .await
            .unwrap();
        assert!(!other.duplicate);
    }

    #[tokio::test]
    async fn test_append_rejects_empty_user() {
        let store = MemoryStore::new();
        let err = store.append(NewEvent::new("p1", "", "purchase")).await.unwrap_err();
        assert!(matches!(err, LedgerError::Validation(_)));
    }

    #[tokio::test]
    async fn test_list_since_pages() {
        let store = MemoryStore::new();
        for _ in 0..3 {
            store.append(NewEvent::new("p1", "u1", "daily_login")).await.unwrap();
            store.append(NewEvent::new("p1", "u2", "daily_login")).await.unwrap();
        }

        let user: UserId = "u1".into();
        let project: ProjectKey = "p1".into();
        let first = store.list_since(&project, &user, None, 2).await.unwrap();
        assert_eq!(first.events.len(), 2);
        assert_eq!(first.next_cursor, Some(3));

        let second = store
            .list_since(&project, &user, first.next_cursor, 2)
            .await
            .unwrap();
        assert_eq!(second.events.len(), 1);
        assert_eq!(second.events[0].sequence, 5);
        assert_eq!(second.next_cursor, None);
    }

    #[tokio::test]
    async fn test_commit_checks_versions_atomically() {
        let store = MemoryStore::new();
        store
            .commit(WalletMutation {
                marker: CommitMarker::Event(Uuid::new_v4()),
                claim: None,
                writes: vec![write("u1", 0, 10)],
            })
            .await
            .unwrap();

        // Second write is stale, so neither row may change
        let err = store
            .commit(WalletMutation {
                marker: CommitMarker::Event(Uuid::new_v4()),
                claim: None,
                writes: vec![write("u2", 0, 5), write("u1", 0, 20)],
            })
            .await
            .unwrap_err();
        assert!(err.is_conflict());

        let rows = store.load(&[key("u1"), key("u2")]).await.unwrap();
        assert_eq!(rows[0].balance, 10);
        assert_eq!(rows[0].version, 1);
        assert_eq!(rows[1], WalletEntry::empty(key("u2")));
    }

    #[tokio::test]
    async fn test_commit_marker_applies_once() {
        let store = MemoryStore::new();
        let id = Uuid::new_v4();
        let mutation = WalletMutation {
            marker: CommitMarker::Event(id),
            claim: None,
            writes: vec![write("u1", 0, 10)],
        };

        let first = store.commit(mutation.clone()).await.unwrap();
        assert!(matches!(first, CommitOutcome::Committed(ref rows) if rows[0].version == 1));
        assert_eq!(store.commit(mutation).await.unwrap(), CommitOutcome::AlreadyApplied);
        assert!(store.is_event_processed(id).await.unwrap());
    }

    #[tokio::test]
    async fn test_commit_rejects_repeated_row() {
        let store = MemoryStore::new();
        let id = Uuid::new_v4();

        let commit = store.commit(WalletMutation::for_event(
            id,
            vec![write("u1", 0, 10), write("u1", 0, 20)],
        ));
        let err = tokio::time::timeout(std::time::Duration::from_secs(1), commit)
            .await
            .expect("commit must not wait on its own row")
            .unwrap_err();

        assert!(matches!(err, LedgerError::Internal(ref msg) if msg.contains("twice")));
        assert!(!store.is_event_processed(id).await.unwrap());
        assert_eq!(store.load(&[key("u1")]).await.unwrap()[0].version, 0);
    }

    #[tokio::test]
    async fn test_claim_held_by_other_event_fails_commit() {
        let store = MemoryStore::new();
        let claim = RewardClaim {
            project_key: "p1".into(),
            user_id: "u1".into(),
            event_type: "daily_login".into(),
            window_start: Utc::now().date_naive(),
        };
        let (first, second) = (Uuid::new_v4(), Uuid::new_v4());

        let mutation =
            WalletMutation::for_event(first, vec![write("u1", 0, 5)]).with_claim(Some(claim.clone()));
        store.commit(mutation).await.unwrap();
        assert_eq!(store.claim_holder(&claim).await.unwrap(), Some(first));

        let mutation =
            WalletMutation::for_event(second, vec![write("u1", 1, 10)]).with_claim(Some(claim));
        let err = store.commit(mutation).await.unwrap_err();
        assert!(matches!(err, LedgerError::ClaimTaken(_)));
        assert!(err.is_conflict());
        assert!(!store.is_event_processed(second).await.unwrap());
        assert_eq!(store.load(&[key("u1")]).await.unwrap()[0].balance, 5);
    }

    #[tokio::test]
    async fn test_balances_skip_unwritten_rows() {
        let store = MemoryStore::new();
        let _ = store
            .commit(WalletMutation {
                marker: CommitMarker::Event(Uuid::new_v4()),
                claim: None,
                writes: vec![write("u1", 3, 10)],
            })
            .await;

        let balances = store.balances(&"p1".into(), &"u1".into()).await.unwrap();
        assert!(balances.is_empty());
    }
}
