//! SQLite ledger for single-node deployments and tests
//!
//! Implements both the event ledger and the wallet store over one pool.
//! A commit runs in a single write transaction; SQLite serializes writers,
//! and a writer that loses the lock surfaces as a retryable conflict.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::{FromRow, Sqlite, Transaction};
use std::str::FromStr;
use std::time::Duration;
use tracing::instrument;
use uuid::Uuid;

use crate::domain::{
    AppendReceipt, Balances, DistributionRecord, Event, EventPage, NewEvent, Properties,
    ProjectKey, RewardClaim, Token, UserId, WalletEntry, WalletKey,
};
use crate::infra::{
    CommitMarker, CommitOutcome, ComponentHealth, EventLedger, HealthCheck, LedgerError, Result,
    WalletMutation, WalletStore, WalletWrite,
};

const EVENT_COLUMNS: &str = "seq, id, project_key, user_id, event_type, properties, received_at, client_ts, idempotency_key";

/// SQLite-backed event ledger and wallet store
#[derive(Debug, Clone)]
pub struct SqliteLedger {
    pool: SqlitePool,
}

impl SqliteLedger {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Open a database from a `sqlite:` URL.
    ///
    /// In-memory databases live as long as their connection, so they get a
    /// single connection that is never recycled.
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(url)?
            .create_if_missing(true)
            .busy_timeout(Duration::from_secs(5));

        let in_memory = url.contains(":memory:") || url.contains("mode=memory");
        let pool_options = if in_memory {
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(max_connections.max(1))
        };

        let pool = pool_options.connect_with(options).await?;
        Ok(Self::new(pool))
    }

    /// Fresh in-memory database with the schema applied
    pub async fn in_memory() -> Result<Self> {
        let ledger = Self::connect("sqlite::memory:", 1).await?;
        ledger.initialize().await?;
        Ok(ledger)
    }

    /// Apply embedded migrations
    pub async fn initialize(&self) -> Result<()> {
        crate::migrations::run_sqlite(&self.pool).await
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn find_existing(&self, event: &NewEvent) -> Result<Option<Event>> {
        let sql = format!(
            "SELECT {EVENT_COLUMNS} FROM events \
             WHERE id = ? OR (project_key = ? AND idempotency_key = ?) \
             ORDER BY seq LIMIT 1"
        );
        let row: Option<EventRow> = sqlx::query_as(&sql)
            .bind(event.id.map(|id| id.to_string()))
            .bind(event.project_key.as_str())
            .bind(event.idempotency_key.as_deref())
            .fetch_optional(&self.pool)
            .await?;
        row.map(EventRow::into_event).transpose()
    }

    async fn page(&self, sql: &str, binds: &[&str], cursor: Option<u64>, limit: u32) -> Result<EventPage> {
        let mut query = sqlx::query_as::<_, EventRow>(sql);
        for value in binds {
            query = query.bind(*value);
        }
        let rows = query
            .bind(cursor.unwrap_or(0) as i64)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?;

        let events = rows
            .into_iter()
            .map(EventRow::into_event)
            .collect::<Result<Vec<_>>>()?;
        let next_cursor = if events.len() == limit as usize {
            events.last().map(|e| e.sequence)
        } else {
            None
        };
        Ok(EventPage {
            events,
            next_cursor,
        })
    }

    async fn insert_marker(tx: &mut Transaction<'_, Sqlite>, marker: &CommitMarker) -> Result<bool> {
        let result = match marker {
            CommitMarker::Event(event_id) => {
                sqlx::query(
                    "INSERT INTO processed_events (event_id, processed_at) VALUES (?, ?) \
                     ON CONFLICT (event_id) DO NOTHING",
                )
                .bind(event_id.to_string())
                .bind(Utc::now().to_rfc3339())
                .execute(&mut **tx)
                .await?
            }
            CommitMarker::Distribution(record) => {
                sqlx::query(
                    r#"
                    INSERT INTO distributions (
                        project_key, idempotency_key, user_id, token, amount, created_at
                    ) VALUES (?, ?, ?, ?, ?, ?)
                    ON CONFLICT (project_key, idempotency_key) DO NOTHING
                    "#,
                )
                .bind(record.project_key.as_str())
                .bind(&record.idempotency_key)
                .bind(record.user_id.as_str())
                .bind(record.token.as_str())
                .bind(record.amount)
                .bind(record.created_at.to_rfc3339())
                .execute(&mut **tx)
                .await?
            }
        };
        Ok(result.rows_affected() == 1)
    }

    async fn insert_claim(
        tx: &mut Transaction<'_, Sqlite>,
        event_id: Uuid,
        claim: &RewardClaim,
    ) -> Result<()> {
        let result = sqlx::query(
            r#"
            INSERT INTO reward_claims (
                project_key, user_id, event_type, window_start, event_id, claimed_at
            ) VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT (project_key, user_id, event_type, window_start) DO NOTHING
            "#,
        )
        .bind(claim.project_key.as_str())
        .bind(claim.user_id.as_str())
        .bind(claim.event_type.as_str())
        .bind(claim.window_start.to_string())
        .bind(event_id.to_string())
        .bind(Utc::now().to_rfc3339())
        .execute(&mut **tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(LedgerError::ClaimTaken(claim.clone()));
        }
        Ok(())
    }

    async fn apply_write(tx: &mut Transaction<'_, Sqlite>, write: &WalletWrite) -> Result<WalletEntry> {
        let now = Utc::now().to_rfc3339();
        let result = if write.expected_version == 0 {
            sqlx::query(
                r#"
                INSERT INTO wallet_entries (project_key, user_id, token, balance, version, updated_at)
                VALUES (?, ?, ?, ?, 1, ?)
                ON CONFLICT (project_key, user_id, token) DO NOTHING
                "#,
            )
            .bind(write.key.project_key.as_str())
            .bind(write.key.user_id.as_str())
            .bind(write.key.token.as_str())
            .bind(write.new_balance)
            .bind(&now)
            .execute(&mut **tx)
            .await?
        } else {
            sqlx::query(
                r#"
                UPDATE wallet_entries
                SET balance = ?, version = version + 1, updated_at = ?
                WHERE project_key = ? AND user_id = ? AND token = ? AND version = ?
                "#,
            )
            .bind(write.new_balance)
            .bind(&now)
            .bind(write.key.project_key.as_str())
            .bind(write.key.user_id.as_str())
            .bind(write.key.token.as_str())
            .bind(write.expected_version as i64)
            .execute(&mut **tx)
            .await?
        };

        if result.rows_affected() == 0 {
            return Err(LedgerError::VersionConflict {
                project_key: write.key.project_key.clone(),
                user_id: write.key.user_id.clone(),
                token: write.key.token.clone(),
                expected: write.expected_version,
            });
        }

        Ok(WalletEntry {
            key: write.key.clone(),
            balance: write.new_balance,
            version: write.expected_version + 1,
        })
    }
}

#[async_trait]
impl EventLedger for SqliteLedger {
    #[instrument(skip(self, event), fields(project_key = %event.project_key, user_id = %event.user_id))]
    async fn append(&self, event: NewEvent) -> Result<AppendReceipt> {
        event.validate()?;

        if let Some(existing) = self.find_existing(&event).await? {
            return Ok(AppendReceipt {
                event: existing,
                duplicate: true,
            });
        }

        let lookup = event.clone();
        let mut stored = event.into_event(Utc::now())?;
        let properties = serde_json::to_string(&stored.properties)
            .map_err(|e| LedgerError::Internal(e.to_string()))?;

        let result = sqlx::query(
            r#"
            INSERT INTO events (
                id, project_key, user_id, event_type, properties,
                received_at, client_ts, idempotency_key
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(stored.id.to_string())
        .bind(stored.project_key.as_str())
        .bind(stored.user_id.as_str())
        .bind(stored.event_type.as_str())
        .bind(&properties)
        .bind(stored.received_at.to_rfc3339())
        .bind(stored.client_ts.map(|ts| ts.to_rfc3339()))
        .bind(stored.idempotency_key.as_deref())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            // Lost a race with an identical append
            let existing = self.find_existing(&lookup).await?.ok_or_else(|| {
                LedgerError::Internal(format!("event {} rejected without a match", stored.id))
            })?;
            return Ok(AppendReceipt {
                event: existing,
                duplicate: true,
            });
        }

        stored.sequence = result.last_insert_rowid() as u64;
        Ok(AppendReceipt {
            event: stored,
            duplicate: false,
        })
    }

    async fn get(&self, event_id: Uuid) -> Result<Option<Event>> {
        let sql = format!("SELECT {EVENT_COLUMNS} FROM events WHERE id = ?");
        let row: Option<EventRow> = sqlx::query_as(&sql)
            .bind(event_id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.map(EventRow::into_event).transpose()
    }

    async fn list_since(
        &self,
        project_key: &ProjectKey,
        user_id: &UserId,
        cursor: Option<u64>,
        limit: u32,
    ) -> Result<EventPage> {
        let sql = format!(
            "SELECT {EVENT_COLUMNS} FROM events \
             WHERE project_key = ? AND user_id = ? AND seq > ? ORDER BY seq LIMIT ?"
        );
        self.page(&sql, &[project_key.as_str(), user_id.as_str()], cursor, limit)
            .await
    }

    async fn scan_project(
        &self,
        project_key: &ProjectKey,
        cursor: Option<u64>,
        limit: u32,
    ) -> Result<EventPage> {
        let sql = format!(
            "SELECT {EVENT_COLUMNS} FROM events \
             WHERE project_key = ? AND seq > ? ORDER BY seq LIMIT ?"
        );
        self.page(&sql, &[project_key.as_str()], cursor, limit).await
    }
}

#[async_trait]
impl WalletStore for SqliteLedger {
    async fn load(&self, keys: &[WalletKey]) -> Result<Vec<WalletEntry>> {
        let mut entries = Vec::with_capacity(keys.len());
        for key in keys {
            let row: Option<(i64, i64)> = sqlx::query_as(
                "SELECT balance, version FROM wallet_entries \
                 WHERE project_key = ? AND user_id = ? AND token = ?",
            )
            .bind(key.project_key.as_str())
            .bind(key.user_id.as_str())
            .bind(key.token.as_str())
            .fetch_optional(&self.pool)
            .await?;

            entries.push(match row {
                Some((balance, version)) => WalletEntry {
                    key: key.clone(),
                    balance,
                    version: version as u64,
                },
                None => WalletEntry::empty(key.clone()),
            });
        }
        Ok(entries)
    }

    async fn balances(&self, project_key: &ProjectKey, user_id: &UserId) -> Result<Balances> {
        let rows: Vec<(String, i64)> = sqlx::query_as(
            "SELECT token, balance FROM wallet_entries WHERE project_key = ? AND user_id = ?",
        )
        .bind(project_key.as_str())
        .bind(user_id.as_str())
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(token, balance)| (Token::from(token), balance))
            .collect())
    }

    async fn is_event_processed(&self, event_id: Uuid) -> Result<bool> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT event_id FROM processed_events WHERE event_id = ?")
                .bind(event_id.to_string())
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.is_some())
    }

    async fn find_distribution(
        &self,
        project_key: &ProjectKey,
        idempotency_key: &str,
    ) -> Result<Option<DistributionRecord>> {
        let row: Option<DistributionRow> = sqlx::query_as(
            r#"
            SELECT project_key, idempotency_key, user_id, token, amount, created_at
            FROM distributions
            WHERE project_key = ? AND idempotency_key = ?
            "#,
        )
        .bind(project_key.as_str())
        .bind(idempotency_key)
        .fetch_optional(&self.pool)
        .await?;
        row.map(DistributionRow::into_record).transpose()
    }

    async fn claim_holder(&self, claim: &RewardClaim) -> Result<Option<Uuid>> {
        let holder: Option<String> = sqlx::query_scalar(
            "SELECT event_id FROM reward_claims \
             WHERE project_key = ? AND user_id = ? AND event_type = ? AND window_start = ?",
        )
        .bind(claim.project_key.as_str())
        .bind(claim.user_id.as_str())
        .bind(claim.event_type.as_str())
        .bind(claim.window_start.to_string())
        .fetch_optional(&self.pool)
        .await?;

        holder
            .map(|id| {
                Uuid::parse_str(&id)
                    .map_err(|e| LedgerError::Internal(format!("invalid claim holder {id}: {e}")))
            })
            .transpose()
    }

    #[instrument(skip(self, mutation), fields(writes = mutation.writes.len()))]
    async fn commit(&self, mutation: WalletMutation) -> Result<CommitOutcome> {
        mutation.ensure_distinct_rows()?;
        let mut tx = self.pool.begin().await?;

        if !Self::insert_marker(&mut tx, &mutation.marker).await? {
            tx.rollback().await?;
            return Ok(CommitOutcome::AlreadyApplied);
        }

        if let (CommitMarker::Event(event_id), Some(claim)) = (&mutation.marker, &mutation.claim) {
            if let Err(err) = Self::insert_claim(&mut tx, *event_id, claim).await {
                tx.rollback().await?;
                return Err(err);
            }
        }

        let mut committed = Vec::with_capacity(mutation.writes.len());
        for write in &mutation.writes {
            match Self::apply_write(&mut tx, write).await {
                Ok(entry) => committed.push(entry),
                Err(err) => {
                    tx.rollback().await?;
                    return Err(err);
                }
            }
        }

        tx.commit().await?;
        Ok(CommitOutcome::Committed(committed))
    }

    async fn entries(&self, project_key: &ProjectKey) -> Result<Vec<WalletEntry>> {
        let rows: Vec<(String, String, i64, i64)> = sqlx::query_as(
            "SELECT user_id, token, balance, version FROM wallet_entries \
             WHERE project_key = ? ORDER BY user_id, token",
        )
        .bind(project_key.as_str())
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(user_id, token, balance, version)| WalletEntry {
                key: WalletKey::new(project_key.clone(), user_id, token),
                balance,
                version: version as u64,
            })
            .collect())
    }

    async fn distributions(&self, project_key: &ProjectKey) -> Result<Vec<DistributionRecord>> {
        let rows: Vec<DistributionRow> = sqlx::query_as(
            r#"
            SELECT project_key, idempotency_key, user_id, token, amount, created_at
            FROM distributions
            WHERE project_key = ?
            ORDER BY created_at
            "#,
        )
        .bind(project_key.as_str())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(DistributionRow::into_record).collect()
    }
}

#[async_trait]
impl HealthCheck for SqliteLedger {
    async fn check_health(&self) -> ComponentHealth {
        match sqlx::query("SELECT 1").execute(&self.pool).await {
            Ok(_) => ComponentHealth::Healthy,
            Err(e) => ComponentHealth::Unhealthy {
                reason: e.to_string(),
            },
        }
    }
}

#[derive(Debug, FromRow)]
struct EventRow {
    seq: i64,
    id: String,
    project_key: String,
    user_id: String,
    event_type: String,
    properties: String,
    received_at: String,
    client_ts: Option<String>,
    idempotency_key: Option<String>,
}

impl EventRow {
    fn into_event(self) -> Result<Event> {
        let id = Uuid::parse_str(&self.id)
            .map_err(|e| LedgerError::Internal(format!("invalid event id {}: {e}", self.id)))?;
        let properties: Properties = serde_json::from_str(&self.properties)
            .map_err(|e| LedgerError::Internal(format!("invalid properties for {id}: {e}")))?;

        Ok(Event {
            id,
            sequence: self.seq as u64,
            project_key: self.project_key.into(),
            user_id: self.user_id.into(),
            event_type: self.event_type.into(),
            properties,
            received_at: parse_timestamp(&self.received_at)?,
            client_ts: self.client_ts.as_deref().map(parse_timestamp).transpose()?,
            idempotency_key: self.idempotency_key,
        })
    }
}

#[derive(Debug, FromRow)]
struct DistributionRow {
    project_key: String,
    idempotency_key: String,
    user_id: String,
    token: String,
    amount: i64,
    created_at: String,
}

impl DistributionRow {
    fn into_record(self) -> Result<DistributionRecord> {
        Ok(DistributionRecord {
            project_key: self.project_key.into(),
            idempotency_key: self.idempotency_key,
            user_id: self.user_id.into(),
            token: self.token.into(),
            amount: self.amount,
            created_at: parse_timestamp(&self.created_at)?,
        })
    }
}

fn parse_timestamp(value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| LedgerError::Internal(format!("invalid timestamp {value}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_append_and_read_back() {
        let ledger = SqliteLedger::in_memory().await.unwrap();
        let receipt = ledger
            .append(
                NewEvent::new("p1", "u1", "purchase")
                    .with_property("amount", json!(10))
                    .with_client_ts(Utc::now()),
            )
            .await
            .unwrap();

        assert!(!receipt.duplicate);
        assert_eq!(receipt.event.sequence, 1);

        let stored = ledger.get(receipt.event.id).await.unwrap().unwrap();
        assert_eq!(stored.integer_property("amount"), Some(10));
        assert_eq!(stored.sequence, 1);
        assert!(stored.client_ts.is_some());
    }

    #[tokio::test]
    async fn test_duplicate_idempotency_key_returns_original() {
        let ledger = SqliteLedger::in_memory().await.unwrap();
        let first = ledger
            .append(NewEvent::new("p1", "u1", "referral").with_idempotency_key("k1"))
            .await
            .unwrap();
        let second = ledger
            .append(NewEvent::new("p1", "u1", "referral").with_idempotency_key("k1"))
            .await
            .unwrap();

        assert!(second.duplicate);
        assert_eq!(second.event.id, first.event.id);
    }

    #[tokio::test]
    async fn test_stale_write_rolls_back_whole_commit() {
        let ledger = SqliteLedger::in_memory().await.unwrap();
        let a = WalletKey::new("p1", "u1", "tgem");
        let b = WalletKey::new("p1", "u1", "partner");

        ledger
            .commit(WalletMutation {
                marker: CommitMarker::Event(Uuid::new_v4()),
                claim: None,
                writes: vec![WalletWrite {
                    key: b.clone(),
                    expected_version: 0,
                    new_balance: 3,
                }],
            })
            .await
            .unwrap();

        let marker = Uuid::new_v4();
        let err = ledger
            .commit(WalletMutation {
                marker: CommitMarker::Event(marker),
                claim: None,
                writes: vec![
                    WalletWrite {
                        key: a.clone(),
                        expected_version: 0,
                        new_balance: 10,
                    },
                    WalletWrite {
                        key: b.clone(),
                        expected_version: 0,
                        new_balance: 7,
                    },
                ],
            })
            .await
            .unwrap_err();
        assert!(err.is_conflict());

        let rows = ledger.load(&[a.clone(), b]).await.unwrap();
        assert_eq!(rows[0], WalletEntry::empty(a));
        assert_eq!(rows[1].balance, 3);
        assert!(!ledger.is_event_processed(marker).await.unwrap());
    }
}
