use axum::{extract::State, Json};
use cadence_scheduler::EntrySummary;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;

use crate::app::AppState;

#[derive(Debug, Serialize)]
pub struct SchedulesResponse {
    synced_at: Option<DateTime<Utc>>,
    count: usize,
    schedules: Vec<EntrySummary>,
}

/// GET /schedules: the scheduler's current view, sorted by name.
pub async fn list_handler(State(state): State<Arc<AppState>>) -> Json<SchedulesResponse> {
    let snapshot = state.snapshot();
    Json(SchedulesResponse {
        synced_at: snapshot.synced_at(),
        count: snapshot.len(),
        schedules: snapshot.summaries(),
    })
}
