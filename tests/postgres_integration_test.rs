//! Postgres-backed integration tests.
//!
//! These are ignored by default and are intended to run in CI (or locally)
//! with `DATABASE_URL` set.

mod common;

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use sqlx::postgres::PgPoolOptions;
use uuid::Uuid;

use theras_distribution::domain::{DistributionRequest, Token};
use theras_distribution::infra::{EventLedger, LedgerError, PgEventLedger, PgWalletStore};
use theras_distribution::server::Storage;
use theras_distribution::{NewEvent, ProjectKey, UserId};

use common::*;

async fn connect_db() -> Option<sqlx::PgPool> {
    let url = std::env::var("DATABASE_URL").ok()?;
    let pool = PgPoolOptions::new()
        .max_connections(20)
        .connect(&url)
        .await
        .ok()?;
    Some(pool)
}

async fn postgres_storage() -> Option<Storage> {
    let pool = connect_db().await?;
    theras_distribution::migrations::run_postgres(&pool)
        .await
        .unwrap();

    let ledger = Arc::new(PgEventLedger::new(pool.clone()));
    Some(Storage {
        ledger: ledger.clone(),
        wallets: Arc::new(PgWalletStore::new(pool)),
        health: ledger,
        backend: "postgres",
    })
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[ignore]
async fn postgres_concurrent_rewards_are_applied_exactly_once() {
    let Some(storage) = postgres_storage().await else {
        eprintln!("DATABASE_URL not set; skipping");
        return;
    };
    let distributor = distributor_on(&storage, builtin_rules());
    let (project, user) = (random_project_key(), random_user_id());

    let tasks: usize = 8;
    let per_task: i64 = 10;

    let handles: Vec<_> = (0..tasks)
        .map(|_| {
            let distributor = distributor.clone();
            let (project, user) = (project.clone(), user.clone());
            tokio::spawn(async move {
                for _ in 0..per_task {
                    let event = purchase(&project, &user, 3).with_id(Uuid::new_v4());
                    distributor.ingest(event.clone()).await.unwrap();
                    // Resubmission never double counts
                    let again = distributor.ingest(event).await.unwrap();
                    assert!(again.duplicate);
                }
            })
        })
        .collect();

    for handle in handles {
        handle.await.unwrap();
    }

    let balances = distributor
        .get_balance(&ProjectKey::from(project.as_str()), &UserId::from(user.as_str()))
        .await
        .unwrap();
    assert_eq!(balances[&Token::tgem()], 3 * per_task * tasks as i64);

    let drift = distributor
        .verify_balances(&ProjectKey::from(project.as_str()))
        .await
        .unwrap();
    assert!(drift.is_empty(), "drift: {drift:?}");
}

#[tokio::test]
#[ignore]
async fn postgres_distribution_and_overdraft() {
    let Some(storage) = postgres_storage().await else {
        eprintln!("DATABASE_URL not set; skipping");
        return;
    };
    let distributor = distributor_on(&storage, builtin_rules());
    let (project, user) = (random_project_key(), random_user_id());

    let request = DistributionRequest {
        project_key: project.as_str().into(),
        user_id: user.as_str().into(),
        token: Token::partner(),
        amount: 45,
        idempotency_key: "key-1".to_string(),
    };
    assert!(!distributor.distribute(request.clone()).await.unwrap().replayed);
    assert!(distributor.distribute(request).await.unwrap().replayed);

    let err = distributor
        .ingest(
            NewEvent::new(project.as_str(), user.as_str(), "redeem_catalog")
                .with_property("amount", json!(1)),
        )
        .await
        .unwrap_err();
    match err {
        LedgerError::NotApplied { source, .. } => {
            assert!(matches!(*source, LedgerError::InsufficientFunds { .. }))
        }
        other => panic!("expected NotApplied, got {other:?}"),
    }

    let balances = distributor
        .get_balance(&ProjectKey::from(project.as_str()), &UserId::from(user.as_str()))
        .await
        .unwrap();
    assert_eq!(balances.get(&Token::partner()), Some(&45));
    assert_eq!(balances.get(&Token::tgem()), None);

    assert!(storage.health.check_health().await.is_healthy());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[ignore]
async fn postgres_cursor_reader_never_skips_a_slow_append() {
    let Some(pool) = connect_db().await else {
        eprintln!("DATABASE_URL not set; skipping");
        return;
    };
    theras_distribution::migrations::run_postgres(&pool)
        .await
        .unwrap();
    let ledger = Arc::new(PgEventLedger::new(pool.clone()));
    let project = random_project_key();

    // A writer that has taken its number but not yet committed
    let mut slow = pool.begin().await.unwrap();
    let slow_seq: i64 = sqlx::query_scalar(
        r#"
        INSERT INTO event_sequences (project_key, last_seq)
        VALUES ($1, 1)
        ON CONFLICT (project_key)
        DO UPDATE SET last_seq = event_sequences.last_seq + 1
        RETURNING last_seq
        "#,
    )
    .bind(project.as_str())
    .fetch_one(&mut *slow)
    .await
    .unwrap();
    let slow_id = Uuid::new_v4();
    sqlx::query(
        r#"
        INSERT INTO events (seq, id, project_key, user_id, event_type, received_at)
        VALUES ($1, $2, $3, 'alice', 'daily_login', NOW())
        "#,
    )
    .bind(slow_seq)
    .bind(slow_id)
    .bind(project.as_str())
    .execute(&mut *slow)
    .await
    .unwrap();

    let fast = {
        let ledger = ledger.clone();
        let project = project.clone();
        tokio::spawn(async move { ledger.append(purchase(&project, "bob", 1)).await })
    };

    // The later append waits on the counter row instead of committing first
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(!fast.is_finished());
    let project_key = ProjectKey::from(project.as_str());
    let page = ledger.scan_project(&project_key, None, 1).await.unwrap();
    assert!(page.events.is_empty());

    slow.commit().await.unwrap();
    let fast = fast.await.unwrap().unwrap();
    assert_eq!(fast.event.sequence, slow_seq as u64 + 1);

    let first = ledger.scan_project(&project_key, None, 1).await.unwrap();
    assert_eq!(first.events[0].id, slow_id);
    let second = ledger
        .scan_project(&project_key, first.next_cursor, 1)
        .await
        .unwrap();
    assert_eq!(second.events[0].id, fast.event.id);
}
