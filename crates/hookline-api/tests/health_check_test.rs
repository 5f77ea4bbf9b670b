//! Health, readiness, liveness and root endpoint tests.

#![allow(clippy::unwrap_used)]

use std::{sync::Arc, time::Duration};

use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use hookline_api::{create_router, AppState};
use hookline_core::{storage::Storage, TestClock};
use hookline_queue::{
    storage::mock::MockQueueStorage, BackoffPolicy, HandlerRegistry, Queue, QueueConfig,
    QueueStorage, SqliteQueueStorage,
};
use serde_json::Value;
use tower::ServiceExt;

fn router(storage: Arc<dyn QueueStorage>) -> Router {
    let queue = Arc::new(Queue::new(
        storage,
        HandlerRegistry::new(),
        BackoffPolicy::default(),
        QueueConfig::default(),
    ));
    create_router(AppState::new(queue, Arc::new(TestClock::new())), &[], Duration::from_secs(30))
}

async fn get(app: Router, uri: &str) -> (StatusCode, Value) {
    let request = Request::builder().method("GET").uri(uri).body(Body::empty()).unwrap();
    let response = app.oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    (status, serde_json::from_slice(&bytes).unwrap())
}

#[tokio::test]
async fn root_reports_ok() {
    let (status, body) = get(router(Arc::new(MockQueueStorage::new())), "/").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, serde_json::json!({"status": "ok"}));
}

#[tokio::test]
async fn health_check_reports_store_up() {
    let storage = Storage::open_in_memory().await.unwrap();
    let app = router(Arc::new(SqliteQueueStorage::new(Arc::new(storage))));

    let (status, body) = get(app, "/health").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["checks"]["store"]["status"], "up");
    assert_eq!(body["checks"]["queue"]["exhausted"], 0);
    assert_eq!(body["checks"]["queue"]["timer_armed"], false);
    assert!(body["version"].is_string());
}

#[tokio::test]
async fn health_check_reports_closed_store_as_unavailable() {
    let storage = Storage::open_in_memory().await.unwrap();
    storage.pool().close().await;
    let app = router(Arc::new(SqliteQueueStorage::new(Arc::new(storage))));

    let (status, body) = get(app.clone(), "/health").await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["status"], "unhealthy");
    assert_eq!(body["checks"]["store"]["status"], "down");
    assert!(body["checks"]["store"]["message"].is_string());
    assert!(body["checks"]["queue"].get("exhausted").is_none());

    let (status, _) = get(app, "/ready").await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn health_check_reports_armed_timer() {
    let storage = MockQueueStorage::new();
    let queue = Arc::new(Queue::new(
        Arc::new(storage),
        HandlerRegistry::new(),
        BackoffPolicy::default(),
        QueueConfig::default(),
    ));
    queue.rearm().await.unwrap();
    let app = create_router(
        AppState::new(queue, Arc::new(TestClock::new())),
        &[],
        Duration::from_secs(30),
    );

    let (status, body) = get(app, "/health").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["checks"]["queue"]["timer_armed"], true);
}

#[tokio::test]
async fn liveness_ignores_dependencies() {
    let (status, body) = get(router(Arc::new(MockQueueStorage::new())), "/live").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "alive");
    assert_eq!(body["service"], "hookline");
}
