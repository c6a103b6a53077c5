//! REST endpoints for events, distributions and wallets.

use axum::extract::rejection::{JsonRejection, PathRejection, QueryRejection};
use axum::extract::{Path, Query, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use tracing::instrument;
use uuid::Uuid;

use super::error::ApiError;
use super::types::{
    ApplyEventResponse, DistributeRequest, DistributeResponse, ListEventsQuery,
    ListEventsResponse, TrackEventRequest, TrackEventResponse, WalletQuery,
};
use crate::domain::Balances;
use crate::infra::LedgerError;
use crate::server::AppState;

/// Build the service router (without middleware layers).
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/events", post(track_event).get(list_events))
        .route("/events/:event_id/apply", post(apply_event))
        .route("/distribute", post(distribute))
        .route("/wallet", get(get_wallet))
        .merge(super::health::router())
}

// ============================================================================
// Events
// ============================================================================

#[instrument(skip_all)]
async fn track_event(
    State(state): State<AppState>,
    body: Result<Json<TrackEventRequest>, JsonRejection>,
) -> Result<Json<TrackEventResponse>, ApiError> {
    let Json(request) = body?;
    let event = request.into_new_event().map_err(LedgerError::from)?;

    let receipt = state.distributor.ingest(event).await?;
    Ok(Json(receipt.into()))
}

#[instrument(skip(state))]
async fn apply_event(
    State(state): State<AppState>,
    event_id: Result<Path<Uuid>, PathRejection>,
) -> Result<Json<ApplyEventResponse>, ApiError> {
    let Path(event_id) = event_id?;

    let receipt = state.distributor.apply_event(event_id).await?;
    Ok(Json(ApplyEventResponse {
        ok: true,
        event_id: receipt.event_id,
        replayed: receipt.replayed,
        entries: receipt.entries,
    }))
}

async fn list_events(
    State(state): State<AppState>,
    query: Result<Query<ListEventsQuery>, QueryRejection>,
) -> Result<Json<ListEventsResponse>, ApiError> {
    let Query(query) = query?;

    let page = state
        .distributor
        .list_since(&query.project_key, &query.user_id, query.cursor, query.limit)
        .await?;

    Ok(Json(ListEventsResponse {
        ok: true,
        events: page.events,
        next_cursor: page.next_cursor,
    }))
}

// ============================================================================
// Distributions and wallets
// ============================================================================

#[instrument(skip_all)]
async fn distribute(
    State(state): State<AppState>,
    body: Result<Json<DistributeRequest>, JsonRejection>,
) -> Result<Json<DistributeResponse>, ApiError> {
    let Json(request) = body?;

    let receipt = state.distributor.distribute(request.into()).await?;
    Ok(Json(receipt.into()))
}

/// Balances as a bare `{token: balance}` object.
async fn get_wallet(
    State(state): State<AppState>,
    query: Result<Query<WalletQuery>, QueryRejection>,
) -> Result<Json<Balances>, ApiError> {
    let Query(query) = query?;

    let balances = state
        .distributor
        .get_balance(&query.project_key, &query.user_id)
        .await?;
    Ok(Json(balances))
}
