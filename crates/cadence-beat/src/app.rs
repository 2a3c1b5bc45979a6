use axum::{routing::get, Router};
use cadence_core::CadenceConfig;
use cadence_scheduler::{CacheSnapshot, JobQueue, ScheduleStore, SchedulerStats};
use std::sync::Arc;
use tokio::sync::watch;

/// Shared state for the read-only HTTP surface, passed as `Arc<AppState>`.
pub struct AppState {
    pub config: CadenceConfig,
    /// Latest snapshot published by the scheduler loop.
    pub snapshots: watch::Receiver<Arc<CacheSnapshot>>,
    pub stats: Arc<SchedulerStats>,
    pub store: Arc<dyn ScheduleStore>,
    pub queue: Arc<dyn JobQueue>,
}

impl AppState {
    pub fn snapshot(&self) -> Arc<CacheSnapshot> {
        self.snapshots.borrow().clone()
    }
}

/// Assemble the Axum router.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(crate::http::health::health_handler))
        .route("/healthz/live", get(crate::http::health::live_handler))
        .route("/healthz/ready", get(crate::http::health::ready_handler))
        .route("/schedules", get(crate::http::schedules::list_handler))
        .with_state(state)
        .layer(tower_http::trace::TraceLayer::new_for_http())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        body::{to_bytes, Body},
        http::{Request, StatusCode},
    };
    use cadence_scheduler::{
        cache::build_snapshot, ChannelQueue, JobMessage, ScheduleDefinition, SqliteScheduleStore,
    };
    use chrono::{DateTime, Utc};
    use serde_json::Value;
    use tokio::sync::mpsc;
    use tower::ServiceExt;

    fn at(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    fn state(snapshot: CacheSnapshot) -> (Arc<AppState>, mpsc::Receiver<JobMessage>) {
        let (queue, rx) = ChannelQueue::new(8);
        let (_tx, snapshots) = watch::channel(Arc::new(snapshot));
        let state = AppState {
            config: CadenceConfig::default(),
            snapshots,
            stats: Arc::new(SchedulerStats::default()),
            store: Arc::new(SqliteScheduleStore::open_in_memory().unwrap()),
            queue: Arc::new(queue),
        };
        (Arc::new(state), rx)
    }

    fn synced() -> CacheSnapshot {
        build_snapshot(
            vec![
                ScheduleDefinition::interval("heartbeat", "ping", 30),
                ScheduleDefinition::interval("cleanup", "db.vacuum", 3600),
            ],
            None,
            at("2024-01-01T00:00:00Z"),
        )
        .snapshot
    }

    async fn get_json(state: Arc<AppState>, uri: &str) -> (StatusCode, Value) {
        let response = build_router(state)
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn live_is_always_ok() {
        let (state, _rx) = state(CacheSnapshot::empty());
        let (status, body) = get_json(state, "/healthz/live").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "alive");
    }

    #[tokio::test]
    async fn ready_waits_for_first_sync() {
        let (state, _rx) = state(CacheSnapshot::empty());
        let (status, body) = get_json(state, "/healthz/ready").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["status"], "not ready");
    }

    #[tokio::test]
    async fn ready_after_sync_with_reachable_dependencies() {
        let (state, _rx) = state(synced());
        let (status, body) = get_json(state, "/healthz/ready").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ready");
        assert_eq!(body["schedules"], 2);
    }

    #[tokio::test]
    async fn health_reports_degraded_queue() {
        let (state, rx) = state(synced());
        drop(rx);
        let (status, body) = get_json(state, "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "degraded");
        assert_eq!(body["database"], "ok");
        assert_eq!(body["queue"]["backend"], "channel");
        assert_ne!(body["queue"]["status"], "ok");
        assert_eq!(body["version"], env!("CARGO_PKG_VERSION"));
    }

    #[tokio::test]
    async fn schedules_lists_snapshot_in_name_order() {
        let (state, _rx) = state(synced());
        let (status, body) = get_json(state, "/schedules").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["count"], 2);
        let names: Vec<&str> = body["schedules"]
            .as_array()
            .unwrap()
            .iter()
            .map(|s| s["name"].as_str().unwrap())
            .collect();
        assert_eq!(names, vec!["cleanup", "heartbeat"]);
        assert_eq!(body["schedules"][1]["kind"], "interval");
        assert_eq!(body["schedules"][1]["rule"], "every 30s");
        assert_eq!(body["synced_at"], "2024-01-01T00:00:00Z");
    }
}
