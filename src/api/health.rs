//! Liveness, readiness and metrics endpoints

use std::time::{Duration, Instant};

use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};

use crate::infra::ComponentHealth;
use crate::server::AppState;

const SERVICE_NAME: &str = "theras-distribution";

/// Readiness probes give up on storage after this long
const READY_TIMEOUT: Duration = Duration::from_secs(2);

pub(crate) fn router() -> Router<AppState> {
    Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/metrics", get(metrics))
}

/// Overall health status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Ready,
    Unavailable,
}

/// Response for the liveness endpoint
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: HealthStatus,
    pub service: String,
    pub version: String,
    pub uptime_secs: u64,
}

/// Response for the readiness endpoint
#[derive(Debug, Serialize, Deserialize)]
pub struct ReadinessResponse {
    pub status: HealthStatus,
    /// Storage backend name (`postgres`, `sqlite`, `memory`)
    pub storage: String,
    pub response_time_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Liveness: no dependencies are touched.
async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: HealthStatus::Healthy,
        service: SERVICE_NAME.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_secs: state.distributor.metrics().uptime_seconds(),
    })
}

/// Readiness: one storage round trip.
async fn readiness_check(State(state): State<AppState>) -> (StatusCode, Json<ReadinessResponse>) {
    let start = Instant::now();
    let health = match tokio::time::timeout(READY_TIMEOUT, state.storage.check_health()).await {
        Ok(health) => health,
        Err(_) => ComponentHealth::Unhealthy {
            reason: format!("no response within {}ms", READY_TIMEOUT.as_millis()),
        },
    };
    let response_time_ms = start.elapsed().as_millis() as u64;

    match health {
        ComponentHealth::Healthy => (
            StatusCode::OK,
            Json(ReadinessResponse {
                status: HealthStatus::Ready,
                storage: state.backend.to_string(),
                response_time_ms,
                message: None,
            }),
        ),
        ComponentHealth::Unhealthy { reason } => {
            tracing::warn!(storage = state.backend, %reason, "Readiness check failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(ReadinessResponse {
                    status: HealthStatus::Unavailable,
                    storage: state.backend.to_string(),
                    response_time_ms,
                    message: Some(reason),
                }),
            )
        }
    }
}

async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    let body = state.distributor.metrics().to_prometheus().await;
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        body,
    )
}
