//! Queue statistics endpoint.

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use hookline_queue::{QueueCounts, QueueStatsSnapshot};
use serde::Serialize;
use serde_json::json;
use tracing::{error, instrument};

use crate::server::AppState;

/// Durable counts plus in-process activity since start.
#[derive(Debug, Serialize)]
pub struct StatsResponse {
    /// Entries by state, read from the store.
    #[serde(flatten)]
    pub counts: QueueCounts,
    /// Activity counters since the process started.
    pub activity: QueueStatsSnapshot,
    /// Attempt limit in effect.
    pub max_attempts: u32,
}

/// Returns queue statistics.
#[instrument(name = "queue_stats", skip(app_state))]
pub async fn queue_stats(State(app_state): State<AppState>) -> Response {
    match app_state.queue.counts().await {
        Ok(counts) => {
            let response = StatsResponse {
                counts,
                activity: app_state.queue.stats(),
                max_attempts: app_state.queue.config().max_attempts,
            };
            (StatusCode::OK, Json(response)).into_response()
        },
        Err(e) => {
            error!(error = %e, "failed to read queue counts");
            let body = json!({"success": false, "error": e.to_string()});
            (StatusCode::INTERNAL_SERVER_ERROR, Json(body)).into_response()
        },
    }
}
