//! Embedded schema migrations for the Postgres and SQLite backends.

use sqlx::migrate::{MigrateError, Migrator};
use sqlx::{PgPool, SqlitePool};

use crate::infra::{LedgerError, Result};

static POSTGRES_MIGRATOR: Migrator = sqlx::migrate!("migrations/postgres");
static SQLITE_MIGRATOR: Migrator = sqlx::migrate!("migrations/sqlite");

pub async fn run_postgres(pool: &PgPool) -> Result<()> {
    POSTGRES_MIGRATOR.run(pool).await.map_err(migration_error)
}

pub async fn run_sqlite(pool: &SqlitePool) -> Result<()> {
    SQLITE_MIGRATOR.run(pool).await.map_err(migration_error)
}

fn migration_error(err: MigrateError) -> LedgerError {
    match err {
        MigrateError::Execute(db) => LedgerError::Database(db),
        other => LedgerError::Configuration(format!("migration failed: {other}")),
    }
}
