//! Drain loop that hands ready entries to their handlers.
//!
//! One drain cycle repeatedly takes the best ready entry from the store,
//! invokes the handler registered for its source, and records the outcome:
//! success moves the entry to history, failure bumps its attempt count and
//! pushes its retry time forward. A reentrancy guard keeps at most one
//! cycle, and therefore at most one handler call, in flight.

use std::{any::Any, sync::Arc, time::Duration};

use hookline_core::{Clock, PendingEntry};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::{
    backoff::BackoffPolicy,
    error::{QueueError, Result},
    handler::{HandlerContext, HandlerError, HandlerRegistry},
    stats::QueueStats,
    storage::QueueStorage,
};

/// Maximum stored length of a failure message, in characters.
pub const MAX_ERROR_LEN: usize = 2000;

/// Outcome of one call to [`Dispatcher::drain`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DrainReport {
    /// True if another drain was already running and this call did nothing.
    pub skipped: bool,
    /// Handler invocations made.
    pub dispatched: u64,
    /// Entries promoted to history.
    pub succeeded: u64,
    /// Failed invocations recorded on their entries.
    pub failed: u64,
}

impl DrainReport {
    fn skipped() -> Self {
        Self { skipped: true, ..Self::default() }
    }
}

/// Serialized dispatcher for pending entries.
pub struct Dispatcher {
    storage: Arc<dyn QueueStorage>,
    registry: Arc<HandlerRegistry>,
    policy: BackoffPolicy,
    max_attempts: u32,
    clock: Arc<dyn Clock>,
    stats: Arc<QueueStats>,
    guard: Mutex<()>,
}

impl Dispatcher {
    /// Creates a dispatcher.
    pub fn new(
        storage: Arc<dyn QueueStorage>,
        registry: Arc<HandlerRegistry>,
        policy: BackoffPolicy,
        max_attempts: u32,
        clock: Arc<dyn Clock>,
        stats: Arc<QueueStats>,
    ) -> Self {
        Self { storage, registry, policy, max_attempts, clock, stats, guard: Mutex::new(()) }
    }

    /// Runs one drain cycle.
    ///
    /// Returns immediately with a skipped report if a cycle is already in
    /// progress. Handler failures are recorded and never abort the cycle;
    /// entries whose retry time lies in the future are left for a later
    /// cycle.
    ///
    /// # Errors
    ///
    /// Returns `QueueError::Storage` if the store fails. The entry being
    /// processed at that point keeps its previous state.
    pub async fn drain(&self) -> Result<DrainReport> {
        let Ok(_guard) = self.guard.try_lock() else {
            debug!("drain already in progress");
            return Ok(DrainReport::skipped());
        };

        self.stats.record_cycle();
        let started = self.clock.now();

        let eligible = self.storage.count_eligible(self.max_attempts).await?;
        if eligible > 1 {
            info!(eligible, "draining queue");
        }

        let mut report = DrainReport::default();
        while let Some(entry) =
            self.storage.next_ready(self.max_attempts, self.clock.now_utc()).await?
        {
            report.dispatched += 1;
            self.stats.record_dispatch();

            match self.invoke(&entry).await {
                Ok(response) => {
                    self.complete(entry, response).await?;
                    report.succeeded += 1;
                },
                Err(error) => {
                    self.record_failure(&entry, &error).await?;
                    report.failed += 1;
                },
            }
        }

        if report.dispatched > 0 {
            debug!(
                dispatched = report.dispatched,
                succeeded = report.succeeded,
                failed = report.failed,
                duration_ms = duration_millis(self.clock.now().duration_since(started)),
                "drain cycle finished"
            );
        }

        Ok(report)
    }

    async fn invoke(&self, entry: &PendingEntry) -> std::result::Result<Value, HandlerError> {
        let Some(handler) = self.registry.get(&entry.source) else {
            return Err(QueueError::handler_not_found(&entry.source).into());
        };

        debug!(
            entry_id = %entry.id,
            source = %entry.source,
            attempts = entry.attempts,
            "dispatching entry"
        );

        // Own task: a handler panic arrives here as a JoinError and is
        // recorded like any other failure.
        let payload = entry.payload.clone();
        let ctx = HandlerContext::from(entry);
        let call = tokio::spawn(async move { handler.handle(&payload, &ctx).await });

        match call.await {
            Ok(result) => result,
            Err(join) if join.is_panic() => {
                let message = panic_message(join.into_panic());
                error!(entry_id = %entry.id, source = %entry.source, "handler panicked");
                Err(HandlerError::new(format!("handler panicked: {message}")))
            },
            Err(join) => Err(HandlerError::new(format!("handler task failed: {join}"))),
        }
    }

    async fn complete(&self, entry: PendingEntry, response: Value) -> Result<()> {
        let entry_id = entry.id;
        let source = entry.source.clone();
        let attempts = entry.attempts;

        self.storage.promote_to_history(entry, response, self.clock.now_utc()).await?;
        self.stats.record_success();

        info!(entry_id = %entry_id, source = %source, attempts, "webhook processed");
        Ok(())
    }

    async fn record_failure(&self, entry: &PendingEntry, error: &HandlerError) -> Result<()> {
        let attempts = entry.attempts.saturating_add(1);
        let delay = self.policy.delay(attempts);
        let next_attempt_at = self.policy.next_attempt_at(self.clock.now_utc(), attempts);
        let message = sanitize_error(error.message());

        self.storage.mark_failed(entry.id, attempts, message.clone(), next_attempt_at).await?;

        let exhausted = attempts >= self.max_attempts;
        self.stats.record_failure(exhausted);

        if exhausted {
            warn!(
                entry_id = %entry.id,
                source = %entry.source,
                attempts,
                error = %message,
                "retries exhausted; entry kept in pending"
            );
        } else {
            warn!(
                entry_id = %entry.id,
                source = %entry.source,
                attempts,
                delay_ms = duration_millis(delay),
                error = %message,
                "webhook handling failed; retry scheduled"
            );
        }

        Ok(())
    }
}

/// Makes a failure message safe to store and log.
///
/// Control characters become spaces, whitespace runs collapse to a single
/// space, the ends are trimmed, and the result is cut to
/// [`MAX_ERROR_LEN`] characters.
pub fn sanitize_error(message: &str) -> String {
    let spaced: String =
        message.chars().map(|c| if c.is_control() { ' ' } else { c }).collect();
    let collapsed = spaced.split_whitespace().collect::<Vec<_>>().join(" ");

    match collapsed.char_indices().nth(MAX_ERROR_LEN) {
        Some((cut, _)) => collapsed[..cut].trim_end().to_string(),
        None => collapsed,
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    match payload.downcast::<String>() {
        Ok(message) => *message,
        Err(payload) => match payload.downcast::<&'static str>() {
            Ok(message) => (*message).to_string(),
            Err(_) => "non-string panic payload".to_string(),
        },
    }
}

fn duration_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
