//! Common test utilities and fixtures for integration tests

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Method, Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tower::ServiceExt;
use uuid::Uuid;

use theras_distribution::distributor::{Distributor, DistributorConfig};
use theras_distribution::infra::{MemoryStore, RetryConfig, SqliteLedger};
use theras_distribution::metrics::MetricsRegistry;
use theras_distribution::rules::{RuleEngine, RulesConfig};
use theras_distribution::server::{build_router, AppState, Storage};
use theras_distribution::NewEvent;

/// Generate a project key unique to one test
pub fn random_project_key() -> String {
    format!("p-{}", &Uuid::new_v4().simple().to_string()[..8])
}

/// Generate a user id unique to one test
pub fn random_user_id() -> String {
    format!("u-{}", &Uuid::new_v4().simple().to_string()[..8])
}

/// `purchase` event worth `amount` tgem under the built-in rules
pub fn purchase(project_key: &str, user_id: &str, amount: i64) -> NewEvent {
    NewEvent::new(project_key, user_id, "purchase").with_property("amount", json!(amount))
}

/// `redeem_catalog` event spending `amount` tgem
pub fn redeem(project_key: &str, user_id: &str, amount: i64) -> NewEvent {
    NewEvent::new(project_key, user_id, "redeem_catalog").with_property("amount", json!(amount))
}

/// Retry budget large enough for heavily contended tests
pub fn contended_config() -> DistributorConfig {
    DistributorConfig {
        retry: RetryConfig::conflicts()
            .with_max_retries(100)
            .with_initial_delay(Duration::from_millis(1))
            .with_max_delay(Duration::from_millis(20)),
        operation_timeout: Duration::from_secs(10),
    }
}

pub fn memory_storage() -> Storage {
    let store = Arc::new(MemoryStore::new());
    Storage {
        ledger: store.clone(),
        wallets: store.clone(),
        health: store,
        backend: "memory",
    }
}

pub async fn sqlite_storage() -> Storage {
    let store = Arc::new(SqliteLedger::in_memory().await.unwrap());
    Storage {
        ledger: store.clone(),
        wallets: store.clone(),
        health: store,
        backend: "sqlite",
    }
}

pub fn distributor_on(storage: &Storage, rules: RuleEngine) -> Arc<Distributor> {
    Arc::new(Distributor::new(
        storage.ledger.clone(),
        storage.wallets.clone(),
        Arc::new(rules),
        contended_config(),
        Arc::new(MetricsRegistry::new()),
    ))
}

pub fn builtin_rules() -> RuleEngine {
    RuleEngine::builtin().unwrap()
}

/// Rule engine from an inline JSON document
pub fn rules_from(document: Value) -> RuleEngine {
    let config = RulesConfig::from_json(&document.to_string()).unwrap();
    RuleEngine::new(config).unwrap()
}

/// Router over the in-memory store and built-in rules
pub fn test_app() -> Router {
    let state = AppState::new(
        &memory_storage(),
        Arc::new(builtin_rules()),
        contended_config(),
    );
    build_router(state, None)
}

/// Send a request and decode the JSON response body.
pub async fn send(app: &Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let builder = Request::builder().method(method).uri(uri);
    let request = match body {
        Some(body) => builder
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };

    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let json = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or_else(|_| {
            Value::String(String::from_utf8_lossy(&bytes).into_owned())
        })
    };
    (status, json)
}

pub async fn post_json(app: &Router, uri: &str, body: Value) -> (StatusCode, Value) {
    send(app, Method::POST, uri, Some(body)).await
}

pub async fn get_json(app: &Router, uri: &str) -> (StatusCode, Value) {
    send(app, Method::GET, uri, None).await
}
