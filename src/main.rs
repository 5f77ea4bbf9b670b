//! Hookline webhook queue service.
//!
//! Main entry point. Loads configuration, opens the queue database, starts
//! the queue run loop and the HTTP ingress, and coordinates graceful
//! shutdown of both.

use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use hookline_api::{create_router, shutdown_signal, start_server, AppState, Config};
use hookline_core::{storage::Storage, RealClock};
use hookline_queue::{Queue, SqliteQueueStorage};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load()?;

    init_tracing(&config.rust_log);

    info!("Starting hookline webhook queue");

    config.require_target()?;
    let addr = config.parse_server_addr()?;
    info!(
        database_path = %config.database_path,
        server_addr = %addr,
        routes = config.webhooks.len(),
        max_attempts = config.max_attempts,
        "Configuration loaded"
    );

    // The store must be writable before anything is acknowledged.
    let storage = Arc::new(
        Storage::open(&config.database_path)
            .await
            .with_context(|| format!("Failed to open queue database {}", config.database_path))?,
    );

    let registry = config.handler_registry()?;
    if registry.is_empty() {
        warn!("No webhook routes configured; only service endpoints will be served");
    }

    let queue = Arc::new(Queue::new(
        Arc::new(SqliteQueueStorage::new(storage.clone())),
        registry,
        config.to_backoff_policy(),
        config.to_queue_config(),
    ));

    let shutdown = CancellationToken::new();

    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            shutdown_signal().await;
            shutdown.cancel();
        }
    });

    let queue_handle = tokio::spawn({
        let queue = queue.clone();
        let shutdown = shutdown.clone();
        async move { queue.run(shutdown).await }
    });

    let app = create_router(
        AppState::new(queue, Arc::new(RealClock::new())),
        &config.webhooks,
        Duration::from_secs(config.request_timeout),
    );

    info!(addr = %addr, "hookline is ready to receive webhooks");
    let served = start_server(app, addr, shutdown.clone()).await;

    // Stop the queue too if the server exited on its own.
    shutdown.cancel();

    match queue_handle.await {
        Ok(Ok(())) => info!("Queue stopped"),
        Ok(Err(e)) => error!(error = %e, "Queue stopped with error"),
        Err(e) => error!(error = %e, "Queue task panicked"),
    }

    storage.pool().close().await;
    info!("Database connections closed");

    served.context("HTTP server failed")?;

    info!("hookline shutdown complete");
    Ok(())
}

/// Initializes tracing with environment-based configuration.
///
/// `RUST_LOG` reaches this through the configuration layer; an invalid
/// directive falls back to `info`.
fn init_tracing(directives: &str) {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_new(directives).unwrap_or_else(|_| EnvFilter::new("info"));

    let fmt_layer = fmt::layer()
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true);

    tracing_subscriber::registry().with(filter).with(fmt_layer).init();
}
