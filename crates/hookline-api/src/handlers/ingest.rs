//! Webhook ingestion handler.
//!
//! Decodes the request body, keeps the stable request headers, and hands
//! `{headers, body}` to the queue under the route's source name. The
//! response only reports whether the payload was new; delivery happens
//! later on the queue's run loop.

use axum::{
    extract::{Extension, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use bytes::Bytes;
use serde::Serialize;
use serde_json::{json, Map, Value};
use tracing::{error, info, instrument, warn};

use crate::server::AppState;

/// Headers that differ between deliveries of the same webhook and would
/// defeat deduplication.
pub const VOLATILE_HEADERS: &[&str] =
    &["content-length", "x-request-id", "x-forwarded-for", "x-real-ip", "connection"];

/// Source name attached to a webhook route.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebhookSource(pub String);

/// Response from webhook ingestion.
#[derive(Debug, Serialize)]
pub struct IngestResponse {
    /// True when the webhook was accepted.
    pub success: bool,
    /// True when the same webhook was seen before.
    pub already_exists: bool,
}

/// Error response body.
#[derive(Debug, Serialize)]
pub struct IngestError {
    /// Always false.
    pub success: bool,
    /// Human-readable failure.
    pub error: String,
}

impl IngestError {
    fn response(status: StatusCode, message: impl Into<String>) -> Response {
        (status, Json(Self { success: false, error: message.into() })).into_response()
    }
}

/// Ingests a webhook into the queue.
///
/// Returns 200 for both new and duplicate payloads, 400 for an undecodable
/// body, and 500 if the store rejects the write.
#[instrument(
    name = "ingest_webhook",
    skip(state, headers, body),
    fields(source = %source.0, content_length = body.len())
)]
pub async fn ingest_webhook(
    State(state): State<AppState>,
    Extension(source): Extension<WebhookSource>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let body = match decode_body(&headers, &body) {
        Ok(body) => body,
        Err(message) => {
            warn!(error = %message, "rejecting undecodable webhook body");
            return IngestError::response(StatusCode::BAD_REQUEST, message);
        },
    };

    let payload = json!({
        "headers": stable_headers(&headers),
        "body": body,
    });

    match state.queue.enqueue(&source.0, payload).await {
        Ok(outcome) => {
            if outcome.already_exists {
                info!("duplicate webhook acknowledged");
            }
            (
                StatusCode::OK,
                Json(IngestResponse { success: true, already_exists: outcome.already_exists }),
            )
                .into_response()
        },
        Err(e) => {
            error!(error = %e, "failed to queue webhook");
            IngestError::response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        },
    }
}

/// Decodes a JSON or form-encoded body. An empty body becomes `{}`.
///
/// # Errors
///
/// Returns a message if the body is not valid JSON, or if a form body does
/// not decode to valid UTF-8.
pub fn decode_body(headers: &HeaderMap, body: &[u8]) -> Result<Value, String> {
    if is_form(headers) {
        return decode_form(body).map(Value::Object);
    }

    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(Value::Object(Map::new()));
    }

    serde_json::from_slice(body).map_err(|e| format!("invalid JSON body: {e}"))
}

fn is_form(headers: &HeaderMap) -> bool {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.starts_with("application/x-www-form-urlencoded"))
}

/// Repeated keys collect into an array in arrival order.
///
/// The parser decodes lossily, so a replacement character in the output
/// marks bytes that were not UTF-8.
fn decode_form(body: &[u8]) -> Result<Map<String, Value>, String> {
    const NOT_UTF8: &str = "form body is not valid UTF-8";

    if std::str::from_utf8(body).is_err() {
        return Err(NOT_UTF8.to_string());
    }

    let lossy = |s: &str| s.contains(char::REPLACEMENT_CHARACTER);
    let mut map = Map::new();
    for (key, value) in url::form_urlencoded::parse(body) {
        if lossy(&*key) || lossy(&*value) {
            return Err(NOT_UTF8.to_string());
        }
        let value = Value::String(value.into_owned());
        match map.get_mut(&*key) {
            Some(Value::Array(values)) => values.push(value),
            Some(existing) => {
                let first = existing.take();
                *existing = Value::Array(vec![first, value]);
            },
            None => {
                map.insert(key.into_owned(), value);
            },
        }
    }
    Ok(map)
}

/// Request headers minus [`VOLATILE_HEADERS`]. Repeated headers are joined
/// with `", "`.
pub fn stable_headers(headers: &HeaderMap) -> Map<String, Value> {
    let mut map = Map::new();
    for name in headers.keys() {
        if VOLATILE_HEADERS.contains(&name.as_str()) {
            continue;
        }
        let joined = headers
            .get_all(name)
            .iter()
            .map(|v| String::from_utf8_lossy(v.as_bytes()).into_owned())
            .collect::<Vec<_>>()
            .join(", ");
        map.insert(name.as_str().to_string(), Value::String(joined));
    }
    map
}
