//! PostgreSQL event ledger
//!
//! Append-only storage for user actions.
//!
//! # Ordering
//!
//! `seq` is allocated per project from `event_sequences` inside the insert
//! transaction:
//! ```sql
//! BEGIN;
//! INSERT INTO event_sequences (project_key, last_seq) VALUES ($1, 1)
//!     ON CONFLICT (project_key) DO UPDATE SET last_seq = event_sequences.last_seq + 1
//!     RETURNING last_seq;
//! INSERT INTO events (seq, ...) VALUES ($seq, ...);
//! COMMIT;
//! ```
//!
//! The counter row stays locked until commit, so a project's events become
//! visible in `seq` order and a reader resuming after `nextCursor` never
//! skips a later commit. A rolled back append releases its number.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{postgres::PgPool, types::Json, FromRow, Postgres, Transaction};
use tracing::instrument;
use uuid::Uuid;

use crate::domain::{AppendReceipt, Event, EventPage, NewEvent, Properties, ProjectKey, UserId};
use crate::infra::{ComponentHealth, EventLedger, HealthCheck, LedgerError, Result};

/// PostgreSQL-based event ledger
#[derive(Debug, Clone)]
pub struct PgEventLedger {
    pool: PgPool,
}

impl PgEventLedger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn find_existing(&self, event: &NewEvent) -> Result<Option<Event>> {
        let row: Option<EventRow> = sqlx::query_as(
            r#"
            SELECT seq, id, project_key, user_id, event_type, properties,
                   received_at, client_ts, idempotency_key
            FROM events
            WHERE id = $1 OR (project_key = $2 AND idempotency_key = $3)
            ORDER BY seq
            LIMIT 1
            "#,
        )
        .bind(event.id)
        .bind(event.project_key.as_str())
        .bind(event.idempotency_key.as_deref())
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(EventRow::into_event))
    }

    /// Next sequence of `project_key`, holding its counter row until the
    /// transaction ends.
    async fn next_sequence(
        tx: &mut Transaction<'_, Postgres>,
        project_key: &ProjectKey,
    ) -> Result<i64> {
        let seq: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO event_sequences (project_key, last_seq)
            VALUES ($1, 1)
            ON CONFLICT (project_key)
            DO UPDATE SET last_seq = event_sequences.last_seq + 1
            RETURNING last_seq
            "#,
        )
        .bind(project_key.as_str())
        .fetch_one(&mut **tx)
        .await?;
        Ok(seq)
    }
}

#[async_trait]
impl EventLedger for PgEventLedger {
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

        let mut tx = self.pool.begin().await?;
        let next = Self::next_sequence(&mut tx, &stored.project_key).await?;

        let seq: Option<i64> = sqlx::query_scalar(
            r#"
            INSERT INTO events (
                seq, id, project_key, user_id, event_type, properties,
                received_at, client_ts, idempotency_key
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT DO NOTHING
            RETURNING seq
            "#,
        )
        .bind(next)
        .bind(stored.id)
        .bind(stored.project_key.as_str())
        .bind(stored.user_id.as_str())
        .bind(stored.event_type.as_str())
        .bind(Json(&stored.properties))
        .bind(stored.received_at)
        .bind(stored.client_ts)
        .bind(stored.idempotency_key.as_deref())
        .fetch_optional(&mut *tx)
        .await?;

        match seq {
            Some(seq) => {
                tx.commit().await?;
                stored.sequence = seq as u64;
                Ok(AppendReceipt {
                    event: stored,
                    duplicate: false,
                })
            }
            None => {
                // Lost a race with an identical append
                tx.rollback().await?;
                let existing = self.find_existing(&lookup).await?.ok_or_else(|| {
                    LedgerError::Internal(format!("event {} rejected without a match", stored.id))
                })?;
                Ok(AppendReceipt {
                    event: existing,
                    duplicate: true,
                })
            }
        }
    }

    async fn get(&self, event_id: Uuid) -> Result<Option<Event>> {
        let row: Option<EventRow> = sqlx::query_as(
            r#"
            SELECT seq, id, project_key, user_id, event_type, properties,
                   received_at, client_ts, idempotency_key
            FROM events
            WHERE id = $1
            "#,
        )
        .bind(event_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(EventRow::into_event))
    }

    #[instrument(skip(self))]
    async fn list_since(
        &self,
        project_key: &ProjectKey,
        user_id: &UserId,
        cursor: Option<u64>,
        limit: u32,
    ) -> Result<EventPage> {
        let rows: Vec<EventRow> = sqlx::query_as(
            r#"
            SELECT seq, id, project_key, user_id, event_type, properties,
                   received_at, client_ts, idempotency_key
            FROM events
            WHERE project_key = $1 AND user_id = $2 AND seq > $3
            ORDER BY seq
            LIMIT $4
            "#,
        )
        .bind(project_key.as_str())
        .bind(user_id.as_str())
        .bind(cursor.unwrap_or(0) as i64)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        Ok(into_page(rows, limit))
    }

    #[instrument(skip(self))]
    async fn scan_project(
        &self,
        project_key: &ProjectKey,
        cursor: Option<u64>,
        limit: u32,
    ) -> Result<EventPage> {
        let rows: Vec<EventRow> = sqlx::query_as(
            r#"
            SELECT seq, id, project_key, user_id, event_type, properties,
                   received_at, client_ts, idempotency_key
            FROM events
            WHERE project_key = $1 AND seq > $2
            ORDER BY seq
            LIMIT $3
            "#,
        )
        .bind(project_key.as_str())
        .bind(cursor.unwrap_or(0) as i64)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        Ok(into_page(rows, limit))
    }
}

#[async_trait]
impl HealthCheck for PgEventLedger {
    async fn check_health(&self) -> ComponentHealth {
        match sqlx::query("SELECT 1").execute(&self.pool).await {
            Ok(_) => ComponentHealth::Healthy,
            Err(e) => ComponentHealth::Unhealthy {
                reason: e.to_string(),
            },
        }
    }
}

fn into_page(rows: Vec<EventRow>, limit: u32) -> EventPage {
    let events: Vec<Event> = rows.into_iter().map(EventRow::into_event).collect();
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

#[derive(Debug, FromRow)]
struct EventRow {
    seq: i64,
    id: Uuid,
    project_key: String,
    user_id: String,
    event_type: String,
    properties: Json<Properties>,
    received_at: DateTime<Utc>,
    client_ts: Option<DateTime<Utc>>,
    idempotency_key: Option<String>,
}

impl EventRow {
    fn into_event(self) -> Event {
        Event {
            id: self.id,
            sequence: self.seq as u64,
            project_key: self.project_key.into(),
            user_id: self.user_id.into(),
            event_type: self.event_type.into(),
            properties: self.properties.0,
            received_at: self.received_at,
            client_ts: self.client_ts,
            idempotency_key: self.idempotency_key,
        }
    }
}
