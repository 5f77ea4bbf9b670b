//! Health endpoints.
//!
//! `/health` and `/ready` check the queue store and report the run loop's
//! timer; `/live` only proves the HTTP server answers.

use std::{sync::Arc, time::Duration};

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, Utc};
use hookline_core::Clock;
use hookline_queue::Queue;
use serde::Serialize;
use tracing::{debug, error, instrument};

use crate::server::AppState;

/// Body of `/health` and `/ready`.
#[derive(Debug, Serialize)]
pub struct HealthReport {
    /// Overall verdict; unhealthy whenever the store is down.
    pub status: HealthStatus,
    /// When the check ran.
    pub timestamp: DateTime<Utc>,
    /// Per-component results.
    pub checks: HealthChecks,
    /// Crate version.
    pub version: &'static str,
}

/// Overall verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// The store answered.
    Healthy,
    /// The store did not answer; webhooks cannot be accepted.
    Unhealthy,
}

/// Component results.
#[derive(Debug, Serialize)]
pub struct HealthChecks {
    /// The SQLite store.
    pub store: StoreHealth,
    /// The dispatch side of the queue.
    pub queue: QueueHealth,
}

/// Store check result.
#[derive(Debug, Serialize)]
pub struct StoreHealth {
    /// Up or down.
    pub status: ComponentStatus,
    /// Failure detail when down.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Check round trip.
    pub response_time_ms: u64,
}

/// Dispatch state. Informational only; never fails the check.
#[derive(Debug, Serialize)]
pub struct QueueHealth {
    /// Whether the run loop has a wake-up scheduled.
    pub timer_armed: bool,
    /// Entries that used up their attempts, if the store could be read.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exhausted: Option<u64>,
}

/// Component status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ComponentStatus {
    /// Reachable.
    Up,
    /// Unreachable.
    Down,
}

/// Runs health checks with an injected clock.
pub struct HealthService {
    clock: Arc<dyn Clock>,
}

impl HealthService {
    /// Creates a health service.
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { clock }
    }

    /// Checks the store behind `queue` and collects dispatch state.
    pub async fn check(&self, queue: &Queue) -> HealthReport {
        let timestamp = self.clock.now_utc();
        let started = self.clock.now();
        let reachable = queue.health_check().await;
        let response_time_ms = millis(self.clock.now().duration_since(started));

        let store = match reachable {
            Ok(()) => StoreHealth { status: ComponentStatus::Up, message: None, response_time_ms },
            Err(e) => {
                error!(error = %e, "store health check failed");
                StoreHealth {
                    status: ComponentStatus::Down,
                    message: Some(format!("Store unavailable: {e}")),
                    response_time_ms,
                }
            },
        };

        let exhausted = match store.status {
            ComponentStatus::Up => queue.counts().await.ok().map(|counts| counts.exhausted),
            ComponentStatus::Down => None,
        };

        let status = match store.status {
            ComponentStatus::Up => HealthStatus::Healthy,
            ComponentStatus::Down => HealthStatus::Unhealthy,
        };

        HealthReport {
            status,
            timestamp,
            checks: HealthChecks {
                store,
                queue: QueueHealth { timer_armed: queue.is_armed(), exhausted },
            },
            version: env!("CARGO_PKG_VERSION"),
        }
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// `GET /health`: 200 when the store answers, 503 otherwise.
#[instrument(name = "health_check", skip(app_state))]
pub async fn health_check(State(app_state): State<AppState>) -> Response {
    let report = HealthService::new(app_state.clock.clone()).check(&app_state.queue).await;

    let status_code = match report.status {
        HealthStatus::Healthy => StatusCode::OK,
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };

    debug!(
        status = ?report.status,
        store = ?report.checks.store.status,
        timer_armed = report.checks.queue.timer_armed,
        "health check completed"
    );

    (status_code, Json(report)).into_response()
}

/// `GET /ready`: the service can take webhooks exactly when its store
/// answers, so this is the health check.
#[instrument(name = "readiness_check", skip(app_state))]
pub async fn readiness_check(State(app_state): State<AppState>) -> Response {
    health_check(State(app_state)).await
}

/// `GET /live`
#[instrument(name = "liveness_check", skip(app_state))]
pub async fn liveness_check(State(app_state): State<AppState>) -> Response {
    let body = serde_json::json!({
        "status": "alive",
        "timestamp": app_state.clock.now_utc(),
        "service": "hookline",
    });

    (StatusCode::OK, Json(body)).into_response()
}

/// `GET /`
pub async fn root() -> Json<serde_json::Value> {
    Json(serde_json::json!({"status": "ok"}))
}
