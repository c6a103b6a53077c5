//! HTTP server bootstrap for the distribution service.
//!
//! This module wires together:
//! - configuration
//! - the storage backend (Postgres, SQLite or in-memory)
//! - the rule engine and distributor
//! - the Axum router

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::http::{HeaderValue, Method};
use axum::Router;
use sqlx::postgres::PgPoolOptions;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::distributor::{Distributor, DistributorConfig};
use crate::infra::{
    is_transient_db_error, EventLedger, HealthCheck, MemoryStore, PgEventLedger, PgWalletStore,
    Retry, RetryConfig, SqliteLedger, WalletStore,
};
use crate::metrics::{metric_names, MetricsRegistry};
use crate::rules::RuleEngine;
use crate::telemetry::{init_telemetry, shutdown_telemetry, TelemetryConfig};

/// Where balances and events are kept, chosen by the shape of `DATABASE_URL`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageBackend {
    Postgres(String),
    Sqlite(String),
    Memory,
}

impl StorageBackend {
    pub fn parse(url: &str) -> anyhow::Result<Self> {
        let url = url.trim();
        if url.eq_ignore_ascii_case("memory") {
            Ok(Self::Memory)
        } else if url.starts_with("postgres://") || url.starts_with("postgresql://") {
            Ok(Self::Postgres(url.to_string()))
        } else if url.starts_with("sqlite:") {
            Ok(Self::Sqlite(url.to_string()))
        } else {
            anyhow::bail!("unsupported DATABASE_URL {url:?}; expected postgres://, sqlite: or memory")
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Postgres(_) => "postgres",
            Self::Sqlite(_) => "sqlite",
            Self::Memory => "memory",
        }
    }
}

/// Server configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub backend: StorageBackend,
    pub listen_addr: SocketAddr,
    /// Maximum database connections.
    pub max_connections: u32,
    pub migrate_on_startup: bool,
    /// Rule document; the built-in rules are used when unset.
    pub rules_path: Option<PathBuf>,
    /// Retries after a wallet version conflict before it is surfaced.
    pub conflict_max_retries: u32,
    /// Bound on every storage call.
    pub operation_timeout: Duration,
    /// Comma-separated origins, or `*`.
    pub cors_allow_origins: Option<String>,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let parse_num = |key: &str, default: u64| -> anyhow::Result<u64> {
            match lookup(key) {
                Some(v) => v
                    .trim()
                    .parse()
                    .map_err(|e| anyhow::anyhow!("Invalid {key} {v:?}: {e}")),
                None => Ok(default),
            }
        };

        let database_url = lookup("DATABASE_URL").unwrap_or_else(|| "memory".to_string());
        let backend = StorageBackend::parse(&database_url)?;

        let host = lookup("HOST").unwrap_or_else(|| "0.0.0.0".to_string());
        let port = parse_num("PORT", 8080)?;
        let listen_addr: SocketAddr = format!("{host}:{port}")
            .parse()
            .map_err(|e| anyhow::anyhow!("Invalid listen address {host}:{port}: {e}"))?;

        let migrate_on_startup = lookup("DB_MIGRATE_ON_STARTUP")
            .map(|v| {
                !matches!(
                    v.trim().to_ascii_lowercase().as_str(),
                    "0" | "false" | "off"
                )
            })
            .unwrap_or(true);

        Ok(Self {
            backend,
            listen_addr,
            max_connections: parse_num("MAX_DB_CONNECTIONS", 10)? as u32,
            migrate_on_startup,
            rules_path: lookup("RULES_PATH")
                .filter(|p| !p.trim().is_empty())
                .map(PathBuf::from),
            conflict_max_retries: parse_num("CONFLICT_MAX_RETRIES", 5)? as u32,
            operation_timeout: Duration::from_millis(parse_num("OPERATION_TIMEOUT_MS", 5_000)?),
            cors_allow_origins: lookup("CORS_ALLOW_ORIGINS"),
        })
    }

    pub fn distributor_config(&self) -> DistributorConfig {
        DistributorConfig {
            retry: RetryConfig::conflicts().with_max_retries(self.conflict_max_retries),
            operation_timeout: self.operation_timeout,
        }
    }
}

/// Connected storage, split into the roles the distributor needs.
#[derive(Clone)]
pub struct Storage {
    pub ledger: Arc<dyn EventLedger>,
    pub wallets: Arc<dyn WalletStore>,
    pub health: Arc<dyn HealthCheck>,
    pub backend: &'static str,
}

impl Storage {
    /// Connect to the configured backend, migrating first if asked to.
    pub async fn connect(config: &Config) -> anyhow::Result<Self> {
        match &config.backend {
            StorageBackend::Memory => {
                let store = Arc::new(MemoryStore::new());
                Ok(Self {
                    ledger: store.clone(),
                    wallets: store.clone(),
                    health: store,
                    backend: config.backend.name(),
                })
            }
            StorageBackend::Sqlite(url) => {
                let store = SqliteLedger::connect(url, config.max_connections).await?;
                if config.migrate_on_startup {
                    store.initialize().await?;
                    info!("SQLite migrations applied");
                }
                let store = Arc::new(store);
                Ok(Self {
                    ledger: store.clone(),
                    wallets: store.clone(),
                    health: store,
                    backend: config.backend.name(),
                })
            }
            StorageBackend::Postgres(url) => {
                info!("Connecting to PostgreSQL...");
                let pool = Retry::new(RetryConfig::database())
                    .run_with_predicate(
                        || {
                            PgPoolOptions::new()
                                .max_connections(config.max_connections)
                                .connect(url)
                        },
                        is_transient_db_error,
                    )
                    .await
                    .into_result()?;
                info!("Connected to PostgreSQL");

                if config.migrate_on_startup {
                    info!("Running database migrations...");
                    crate::migrations::run_postgres(&pool).await?;
                    info!("Database migrations applied");
                } else {
                    info!("DB migrations skipped (DB_MIGRATE_ON_STARTUP=0)");
                }

                let ledger = Arc::new(PgEventLedger::new(pool.clone()));
                Ok(Self {
                    ledger: ledger.clone(),
                    wallets: Arc::new(PgWalletStore::new(pool)),
                    health: ledger,
                    backend: config.backend.name(),
                })
            }
        }
    }
}

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub distributor: Arc<Distributor>,
    pub storage: Arc<dyn HealthCheck>,
    pub backend: &'static str,
}

impl AppState {
    pub fn new(storage: &Storage, rules: Arc<RuleEngine>, config: DistributorConfig) -> Self {
        let distributor = Distributor::new(
            storage.ledger.clone(),
            storage.wallets.clone(),
            rules,
            config,
            Arc::new(MetricsRegistry::new()),
        );
        Self {
            distributor: Arc::new(distributor),
            storage: storage.health.clone(),
            backend: storage.backend,
        }
    }
}

/// Start the HTTP server.
pub async fn run() -> anyhow::Result<()> {
    init_telemetry(&TelemetryConfig::from_env())
        .map_err(|e| anyhow::anyhow!("failed to initialize telemetry: {e}"))?;

    info!("Starting Theras distribution service v{}", env!("CARGO_PKG_VERSION"));

    let config = Config::from_env()?;
    info!("Configuration loaded");
    info!("  Listen address: {}", config.listen_addr);
    info!("  Storage backend: {}", config.backend.name());
    info!("  Max connections: {}", config.max_connections);

    let rules = Arc::new(RuleEngine::load(config.rules_path.as_deref())?);
    info!(
        rules = rules.rule_count(),
        path = ?config.rules_path,
        "Reward rules loaded"
    );

    let storage = Storage::connect(&config).await?;
    let state = AppState::new(&storage, rules.clone(), config.distributor_config());
    state
        .distributor
        .metrics()
        .set_gauge(metric_names::RULES_LOADED, rules.rule_count() as u64)
        .await;

    let cors = match config.cors_allow_origins.as_deref() {
        Some(origins) => cors_layer(origins)?,
        None => None,
    };
    let app = build_router(state, cors);

    info!("Starting HTTP server on {}", config.listen_addr);
    let listener = tokio::net::TcpListener::bind(config.listen_addr).await?;

    info!("Distribution service is ready to accept connections");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Server stopped");
    shutdown_telemetry();
    Ok(())
}

/// Full router with tracing and optional CORS.
pub fn build_router(state: AppState, cors: Option<CorsLayer>) -> Router {
    let mut router = crate::api::router()
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    if let Some(cors) = cors {
        router = router.layer(cors);
    }

    router
}

/// CORS layer for a `CORS_ALLOW_ORIGINS` value; `None` when it is blank.
pub fn cors_layer(origins: &str) -> anyhow::Result<Option<CorsLayer>> {
    let origins = origins.trim();
    if origins.is_empty() {
        return Ok(None);
    }

    let allow_origin = if origins == "*" {
        AllowOrigin::any()
    } else {
        let origins: Vec<HeaderValue> = origins
            .split(',')
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .map(|s| {
                s.parse::<HeaderValue>()
                    .map_err(|e| anyhow::anyhow!("Invalid CORS origin {s:?}: {e}"))
            })
            .collect::<anyhow::Result<_>>()?;
        AllowOrigin::list(origins)
    };

    Ok(Some(
        CorsLayer::new()
            .allow_origin(allow_origin)
            .allow_methods([Method::GET, Method::POST])
            .allow_headers([axum::http::header::CONTENT_TYPE]),
    ))
}

/// Resolves on Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, shutting down"),
        _ = terminate => info!("Received SIGTERM, shutting down"),
    }
}
