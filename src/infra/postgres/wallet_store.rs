//! PostgreSQL wallet store
//!
//! # Atomicity
//!
//! A commit is one transaction: the exactly-once marker is inserted first,
//! then every balance row is compare-and-swapped on its `version`:
//! ```sql
//! BEGIN;
//! INSERT INTO processed_events (event_id) VALUES ($1) ON CONFLICT DO NOTHING;
//! UPDATE wallet_entries SET balance = $b, version = version + 1
//!     WHERE project_key = $p AND user_id = $u AND token = $t AND version = $v;
//! COMMIT;
//! ```
//!
//! A concurrent commit of the same marker blocks on the unique index and
//! then inserts nothing, which is reported as `AlreadyApplied`. A row whose
//! version moved matches zero rows and rolls the whole transaction back.
//! Once-per-window claims go into `reward_claims` after the marker; losing
//! that insert rolls back as `ClaimTaken`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPool;
use sqlx::{FromRow, Postgres, Transaction};
use tracing::instrument;
use uuid::Uuid;

use crate::domain::{
    Balances, DistributionRecord, ProjectKey, RewardClaim, Token, UserId, WalletEntry, WalletKey,
};
use crate::infra::{
    CommitMarker, CommitOutcome, LedgerError, Result, WalletMutation, WalletStore, WalletWrite,
};

/// PostgreSQL-based wallet store
#[derive(Debug, Clone)]
pub struct PgWalletStore {
    pool: PgPool,
}

impl PgWalletStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn insert_marker(tx: &mut Transaction<'_, Postgres>, marker: &CommitMarker) -> Result<bool> {
        let result = match marker {
            CommitMarker::Event(event_id) => {
                sqlx::query(
                    r#"
                    INSERT INTO processed_events (event_id, processed_at)
                    VALUES ($1, NOW())
                    ON CONFLICT (event_id) DO NOTHING
                    "#,
                )
                .bind(event_id)
                .execute(&mut **tx)
                .await?
            }
            CommitMarker::Distribution(record) => {
                sqlx::query(
                    r#"
                    INSERT INTO distributions (
                        project_key, idempotency_key, user_id, token, amount, created_at
                    ) VALUES ($1, $2, $3, $4, $5, $6)
                    ON CONFLICT (project_key, idempotency_key) DO NOTHING
                    "#,
                )
                .bind(record.project_key.as_str())
                .bind(&record.idempotency_key)
                .bind(record.user_id.as_str())
                .bind(record.token.as_str())
                .bind(record.amount)
                .bind(record.created_at)
                .execute(&mut **tx)
                .await?
            }
        };
        Ok(result.rows_affected() == 1)
    }

    async fn insert_claim(
        tx: &mut Transaction<'_, Postgres>,
        event_id: Uuid,
        claim: &RewardClaim,
    ) -> Result<()> {
        let result = sqlx::query(
            r#"
            INSERT INTO reward_claims (
                project_key, user_id, event_type, window_start, event_id, claimed_at
            ) VALUES ($1, $2, $3, $4, $5, NOW())
            ON CONFLICT (project_key, user_id, event_type, window_start) DO NOTHING
            "#,
        )
        .bind(claim.project_key.as_str())
        .bind(claim.user_id.as_str())
        .bind(claim.event_type.as_str())
        .bind(claim.window_start)
        .bind(event_id)
        .execute(&mut **tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(LedgerError::ClaimTaken(claim.clone()));
        }
        Ok(())
    }

    async fn apply_write(tx: &mut Transaction<'_, Postgres>, write: &WalletWrite) -> Result<WalletEntry> {
        let result = if write.expected_version == 0 {
            sqlx::query(
                r#"
                INSERT INTO wallet_entries (project_key, user_id, token, balance, version, updated_at)
                VALUES ($1, $2, $3, $4, 1, NOW())
                ON CONFLICT (project_key, user_id, token) DO NOTHING
                "#,
            )
            .bind(write.key.project_key.as_str())
            .bind(write.key.user_id.as_str())
            .bind(write.key.token.as_str())
            .bind(write.new_balance)
            .execute(&mut **tx)
            .await?
        } else {
            sqlx::query(
                r#"
                UPDATE wallet_entries
                SET balance = $1, version = version + 1, updated_at = NOW()
                WHERE project_key = $2 AND user_id = $3 AND token = $4 AND version = $5
                "#,
            )
            .bind(write.new_balance)
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
impl WalletStore for PgWalletStore {
    async fn load(&self, keys: &[WalletKey]) -> Result<Vec<WalletEntry>> {
        let mut entries = Vec::with_capacity(keys.len());
        for key in keys {
            let row: Option<(i64, i64)> = sqlx::query_as(
                r#"
                SELECT balance, version FROM wallet_entries
                WHERE project_key = $1 AND user_id = $2 AND token = $3
                "#,
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
            "SELECT token, balance FROM wallet_entries WHERE project_key = $1 AND user_id = $2",
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
        let exists: bool = sqlx::query_scalar(
            "SELECT EXISTS(SELECT 1 FROM processed_events WHERE event_id = $1)",
        )
        .bind(event_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(exists)
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
            WHERE project_key = $1 AND idempotency_key = $2
            "#,
        )
        .bind(project_key.as_str())
        .bind(idempotency_key)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(DistributionRow::into_record))
    }

    async fn claim_holder(&self, claim: &RewardClaim) -> Result<Option<Uuid>> {
        let holder: Option<Uuid> = sqlx::query_scalar(
            r#"
            SELECT event_id FROM reward_claims
            WHERE project_key = $1 AND user_id = $2 AND event_type = $3 AND window_start = $4
            "#,
        )
        .bind(claim.project_key.as_str())
        .bind(claim.user_id.as_str())
        .bind(claim.event_type.as_str())
        .bind(claim.window_start)
        .fetch_optional(&self.pool)
        .await?;
        Ok(holder)
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
            r#"
            SELECT user_id, token, balance, version FROM wallet_entries
            WHERE project_key = $1
            ORDER BY user_id, token
            "#,
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
            WHERE project_key = $1
            ORDER BY created_at
            "#,
        )
        .bind(project_key.as_str())
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(DistributionRow::into_record).collect())
    }
}

#[derive(Debug, FromRow)]
struct DistributionRow {
    project_key: String,
    idempotency_key: String,
    user_id: String,
    token: String,
    amount: i64,
    created_at: DateTime<Utc>,
}

impl DistributionRow {
    fn into_record(self) -> DistributionRecord {
        DistributionRecord {
            project_key: self.project_key.into(),
            idempotency_key: self.idempotency_key,
            user_id: self.user_id.into(),
            token: self.token.into(),
            amount: self.amount,
            created_at: self.created_at,
        }
    }
}
