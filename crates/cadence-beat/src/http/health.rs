use axum::{extract::State, http::StatusCode, Json};
use cadence_scheduler::StatsSnapshot;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::Arc;

use crate::app::AppState;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    status: &'static str,
    version: &'static str,
    git_sha: &'static str,
    environment: String,
    database: String,
    queue: QueueStatus,
    schedules: usize,
    synced_at: Option<DateTime<Utc>>,
    stats: StatsSnapshot,
}

#[derive(Debug, Serialize)]
struct QueueStatus {
    backend: String,
    status: String,
}

fn describe<E: std::fmt::Display>(result: Result<(), E>) -> String {
    match result {
        Ok(()) => "ok".to_string(),
        Err(e) => format!("error: {e}"),
    }
}

/// GET /health: server metadata plus dependency checks.
pub async fn health_handler(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let database = describe(state.store.ping().await);
    let queue = describe(state.queue.ping().await);
    let snapshot = state.snapshot();
    let status = if database == "ok" && queue == "ok" {
        "ok"
    } else {
        "degraded"
    };

    Json(HealthResponse {
        status,
        version: env!("CARGO_PKG_VERSION"),
        git_sha: env!("CADENCE_GIT_SHA"),
        environment: state.config.app.environment.clone(),
        database,
        queue: QueueStatus {
            backend: state.queue.name().to_string(),
            status: queue,
        },
        schedules: snapshot.len(),
        synced_at: snapshot.synced_at(),
        stats: state.stats.snapshot(),
    })
}

/// GET /healthz/live
pub async fn live_handler() -> Json<Value> {
    Json(json!({ "status": "alive" }))
}

/// GET /healthz/ready: 503 until the first sync has landed and both the
/// store and the queue answer.
pub async fn ready_handler(State(state): State<Arc<AppState>>) -> (StatusCode, Json<Value>) {
    let snapshot = state.snapshot();
    let database = state.store.ping().await;
    let queue = state.queue.ping().await;

    match snapshot.synced_at() {
        Some(synced_at) if database.is_ok() && queue.is_ok() => (
            StatusCode::OK,
            Json(json!({
                "status": "ready",
                "schedules": snapshot.len(),
                "synced_at": synced_at,
            })),
        ),
        synced_at => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({
                "status": "not ready",
                "synced": synced_at.is_some(),
                "database": describe(database),
                "queue": describe(queue),
            })),
        ),
    }
}
