//! HTTP server configuration and request routing.
//!
//! Requests flow through middleware in order:
//! 1. Request ID generation
//! 2. Request/response logging
//! 3. Timeout enforcement
//! 4. Handler execution
//!
//! # Graceful Shutdown
//!
//! The server stops accepting connections when its cancellation token
//! fires and waits for in-flight requests to finish. The binary fires the
//! same token from SIGINT/SIGTERM to stop the queue run loop.

use std::{net::SocketAddr, sync::Arc, time::Duration};

use axum::{
    extract::Request,
    http::HeaderValue,
    middleware::{self, Next},
    response::Response,
    routing::{get, post},
    Extension, Router,
};
use hookline_core::Clock;
use hookline_queue::Queue;
use tokio_util::sync::CancellationToken;
use tower_http::{timeout::TimeoutLayer, trace::TraceLayer};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::{
    config::WebhookRoute,
    handlers::{self, WebhookSource},
};

const REQUEST_ID_HEADER: &str = "x-request-id";

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    /// The queue webhooks are fed into.
    pub queue: Arc<Queue>,
    /// Clock for response timestamps.
    pub clock: Arc<dyn Clock>,
}

impl AppState {
    /// Creates application state.
    pub fn new(queue: Arc<Queue>, clock: Arc<dyn Clock>) -> Self {
        Self { queue, clock }
    }
}

/// Creates the Axum router with all routes and middleware.
///
/// Every webhook route gets `POST <path>` feeding the queue under the
/// route's name. Route paths must already be validated; see
/// [`crate::Config::validate`].
pub fn create_router(
    state: AppState,
    routes: &[WebhookRoute],
    request_timeout: Duration,
) -> Router {
    let service_routes = Router::new()
        .route("/", get(handlers::root))
        .route("/health", get(handlers::health_check))
        .route("/ready", get(handlers::readiness_check))
        .route("/live", get(handlers::liveness_check))
        .route("/queue/stats", get(handlers::queue_stats));

    let webhook_routes = routes.iter().fold(Router::new(), |router, route| {
        router.route(
            &route.path,
            post(handlers::ingest_webhook)
                .layer(Extension(WebhookSource(route.name.clone()))),
        )
    });

    Router::new()
        .merge(service_routes)
        .merge(webhook_routes)
        .layer(TimeoutLayer::new(request_timeout))
        .layer(TraceLayer::new_for_http())
        .layer(middleware::from_fn(inject_request_id))
        .with_state(state)
}

/// Tags every request with an id and echoes it as `X-Request-Id`.
///
/// An id supplied by the upstream is kept so that its logs and ours can be
/// joined; otherwise a fresh UUID is used.
async fn inject_request_id(mut req: Request, next: Next) -> Response {
    let request_id = req
        .headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.is_empty() && value.len() <= 128)
        .map_or_else(|| Uuid::new_v4().to_string(), str::to_string);

    req.extensions_mut().insert(request_id.clone());
    let mut response = next.run(req).await;

    if let Ok(value) = HeaderValue::from_str(&request_id) {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }
    response
}

/// Serves `app` on `addr` until `shutdown` is cancelled.
///
/// # Errors
///
/// Returns `std::io::Error` if the address cannot be bound or the server
/// fails.
pub async fn start_server(
    app: Router,
    addr: SocketAddr,
    shutdown: CancellationToken,
) -> Result<(), std::io::Error> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let actual_addr = listener.local_addr()?;

    info!(addr = %actual_addr, "HTTP server listening");

    axum::serve(listener, app).with_graceful_shutdown(shutdown.cancelled_owned()).await?;

    info!("HTTP server stopped");
    Ok(())
}

/// Resolves on SIGINT or SIGTERM.
pub async fn shutdown_signal() {
    let interrupt = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "cannot listen for SIGINT");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            },
            Err(e) => {
                error!(error = %e, "cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            },
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    let signal = tokio::select! {
        () = interrupt => "SIGINT",
        () = terminate => "SIGTERM",
    };

    warn!(signal, "shutting down; waiting for in-flight requests and handler call");
}
