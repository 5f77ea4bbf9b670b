//! Runtime counters for queue activity.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Counters updated by intake and the dispatcher.
///
/// Values reset on restart; durable counts come from the store.
#[derive(Debug, Default)]
pub struct QueueStats {
    cycles: AtomicU64,
    dispatched: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    exhausted: AtomicU64,
    duplicates: AtomicU64,
}

/// Point-in-time copy of [`QueueStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueStatsSnapshot {
    /// Drain cycles that ran (skipped reentrant calls excluded).
    pub cycles: u64,
    /// Handler invocations started.
    pub dispatched: u64,
    /// Entries promoted to history.
    pub succeeded: u64,
    /// Failed handler invocations.
    pub failed: u64,
    /// Entries that used up their final attempt.
    pub exhausted: u64,
    /// Enqueues answered with `already_exists`.
    pub duplicates: u64,
}

impl QueueStats {
    pub(crate) fn record_cycle(&self) {
        self.cycles.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_dispatch(&self) {
        self.dispatched.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_success(&self) {
        self.succeeded.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_failure(&self, exhausted: bool) {
        self.failed.fetch_add(1, Ordering::Relaxed);
        if exhausted {
            self.exhausted.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub(crate) fn record_duplicate(&self) {
        self.duplicates.fetch_add(1, Ordering::Relaxed);
    }

    /// Returns the current counter values.
    pub fn snapshot(&self) -> QueueStatsSnapshot {
        QueueStatsSnapshot {
            cycles: self.cycles.load(Ordering::Relaxed),
            dispatched: self.dispatched.load(Ordering::Relaxed),
            succeeded: self.succeeded.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            exhausted: self.exhausted.load(Ordering::Relaxed),
            duplicates: self.duplicates.load(Ordering::Relaxed),
        }
    }
}
