//! The queue service: intake, drain scheduling and the run loop.
//!
//! A `Queue` is built once at startup and shared by handle. It owns the
//! store handle, the dispatcher with its reentrancy guard, and the
//! scheduler's timer, so there is no ambient global state.

use std::{sync::Arc, time::Duration};

use hookline_core::{fingerprint, Clock, EntryId, NewPendingEntry, RealClock};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    backoff::BackoffPolicy,
    dispatcher::{Dispatcher, DrainReport},
    error::Result,
    handler::HandlerRegistry,
    scheduler::Scheduler,
    stats::{QueueStats, QueueStatsSnapshot},
    storage::QueueStorage,
};

/// Queue behavior settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Failed attempts after which an entry is no longer dispatched.
    pub max_attempts: u32,

    /// Timer period used when no entry is eligible.
    pub idle_recheck: Duration,

    /// Extra tries for a failed intake write.
    pub intake_retries: u32,

    /// Pause between intake write tries.
    pub intake_retry_interval: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_attempts: crate::DEFAULT_MAX_ATTEMPTS,
            idle_recheck: Duration::from_secs(5),
            intake_retries: 3,
            intake_retry_interval: Duration::from_secs(5),
        }
    }
}

/// Result of [`Queue::enqueue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct EnqueueOutcome {
    /// True if the fingerprint was already pending or processed.
    pub already_exists: bool,

    /// Identifier of the new pending entry, if one was created.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entry_id: Option<EntryId>,
}

impl EnqueueOutcome {
    fn duplicate() -> Self {
        Self { already_exists: true, entry_id: None }
    }
}

/// Durable counts read from the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct QueueCounts {
    /// Pending entries that can still be dispatched.
    pub eligible: u64,
    /// Pending entries that used up their attempts.
    pub exhausted: u64,
    /// Entries in history.
    pub processed: u64,
}

/// Durable webhook queue.
pub struct Queue {
    storage: Arc<dyn QueueStorage>,
    dispatcher: Dispatcher,
    scheduler: Scheduler,
    notify: Arc<Notify>,
    clock: Arc<dyn Clock>,
    stats: Arc<QueueStats>,
    config: QueueConfig,
}

impl Queue {
    /// Creates a queue using the system clock.
    pub fn new(
        storage: Arc<dyn QueueStorage>,
        registry: HandlerRegistry,
        policy: BackoffPolicy,
        config: QueueConfig,
    ) -> Self {
        Self::with_clock(storage, registry, policy, config, Arc::new(RealClock::new()))
    }

    /// Creates a queue with an injected clock.
    pub fn with_clock(
        storage: Arc<dyn QueueStorage>,
        registry: HandlerRegistry,
        policy: BackoffPolicy,
        config: QueueConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let notify = Arc::new(Notify::new());
        let stats = Arc::new(QueueStats::default());

        let dispatcher = Dispatcher::new(
            storage.clone(),
            Arc::new(registry),
            policy,
            config.max_attempts,
            clock.clone(),
            stats.clone(),
        );
        let scheduler = Scheduler::new(
            notify.clone(),
            storage.clone(),
            clock.clone(),
            config.max_attempts,
            config.idle_recheck,
        );

        Self { storage, dispatcher, scheduler, notify, clock, stats, config }
    }

    /// Accepts a webhook for delivery.
    ///
    /// A fingerprint already present in the store yields
    /// `already_exists = true` with no state change; so does losing a race
    /// against a concurrent enqueue of the same payload. Otherwise the entry
    /// is persisted with zero attempts and the scheduler is re-armed so it is
    /// attempted right away.
    ///
    /// # Errors
    ///
    /// Returns `QueueError::Storage` if the store stays unavailable after
    /// the configured intake retries.
    pub async fn enqueue(&self, source: &str, payload: Value) -> Result<EnqueueOutcome> {
        let fingerprint = fingerprint(source, &payload);

        if self.storage.contains(&fingerprint).await? {
            self.stats.record_duplicate();
            debug!(source, fingerprint = %fingerprint, "duplicate webhook ignored");
            return Ok(EnqueueOutcome::duplicate());
        }

        let entry = NewPendingEntry {
            fingerprint: fingerprint.clone(),
            source: source.to_string(),
            payload,
            created_at: self.clock.now_utc(),
        };

        let mut tries = 0;
        let entry_id = loop {
            match self.storage.insert_pending(entry.clone()).await {
                Ok(id) => break id,
                Err(err) if err.is_conflict() => {
                    self.stats.record_duplicate();
                    debug!(source, fingerprint = %fingerprint, "concurrent duplicate ignored");
                    return Ok(EnqueueOutcome::duplicate());
                },
                Err(err) if tries < self.config.intake_retries => {
                    tries += 1;
                    warn!(
                        source,
                        fingerprint = %fingerprint,
                        attempt = tries,
                        error = %err,
                        "failed to store webhook; retrying"
                    );
                    tokio::time::sleep(self.config.intake_retry_interval).await;
                },
                Err(err) => return Err(err.into()),
            }
        };

        info!(entry_id = %entry_id, source, fingerprint = %fingerprint, "webhook queued");

        if let Err(err) = self.scheduler.rearm().await {
            warn!(error = %err, "failed to re-arm scheduler after enqueue");
            self.notify.notify_one();
        }

        Ok(EnqueueOutcome { already_exists: false, entry_id: Some(entry_id) })
    }

    /// Runs one drain cycle now. A no-op while another cycle is running.
    ///
    /// # Errors
    ///
    /// Returns `QueueError::Storage` if the store fails mid-cycle.
    pub async fn drain(&self) -> Result<DrainReport> {
        self.dispatcher.drain().await
    }

    /// Re-arms the scheduler from the store's earliest retry time.
    ///
    /// # Errors
    ///
    /// Returns `QueueError::Storage` if the store cannot be read.
    pub async fn rearm(&self) -> Result<Duration> {
        self.scheduler.rearm().await
    }

    /// Drives the queue until `cancel` fires.
    ///
    /// Each wake-up (timer or enqueue) runs one drain cycle and re-arms the
    /// timer. Entries left pending by a previous run are picked up on the
    /// first re-arm. A handler call in flight when cancellation arrives is
    /// allowed to finish.
    ///
    /// # Errors
    ///
    /// Currently always returns `Ok`; store failures are logged and retried
    /// on the idle interval.
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        info!(
            max_attempts = self.config.max_attempts,
            idle_recheck_ms = duration_millis(self.config.idle_recheck),
            "queue started"
        );

        loop {
            if let Err(err) = self.scheduler.rearm().await {
                error!(error = %err, "failed to re-arm scheduler");
                self.scheduler.arm_idle();
            }

            tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                () = self.notify.notified() => {},
            }

            if let Err(err) = self.dispatcher.drain().await {
                error!(error = %err, "drain cycle failed");
            }
        }

        self.scheduler.cancel();
        info!("queue stopped");
        Ok(())
    }

    /// Returns the in-process activity counters.
    pub fn stats(&self) -> QueueStatsSnapshot {
        self.stats.snapshot()
    }

    /// Reads the durable entry counts.
    ///
    /// # Errors
    ///
    /// Returns `QueueError::Storage` if the store cannot be read.
    pub async fn counts(&self) -> Result<QueueCounts> {
        let max_attempts = self.config.max_attempts;
        Ok(QueueCounts {
            eligible: self.storage.count_eligible(max_attempts).await?,
            exhausted: self.storage.count_exhausted(max_attempts).await?,
            processed: self.storage.count_history().await?,
        })
    }

    /// Verifies the store is reachable.
    ///
    /// # Errors
    ///
    /// Returns `QueueError::Storage` if the health check fails.
    pub async fn health_check(&self) -> Result<()> {
        Ok(self.storage.health_check().await?)
    }

    /// Returns the queue configuration.
    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Returns the store handle, for inspection.
    pub fn storage(&self) -> &Arc<dyn QueueStorage> {
        &self.storage
    }

    /// Returns true if the scheduler has an outstanding timer.
    pub fn is_armed(&self) -> bool {
        self.scheduler.is_armed()
    }
}

fn duration_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
