//! Single-timer scheduler that wakes the drain loop.
//!
//! The [`Timer`] owns at most one outstanding sleep task. Firing it only
//! signals a [`Notify`]; the drain itself runs on the queue's run loop, so
//! cancelling or re-arming the timer can never interrupt a handler call.

use std::{
    sync::{Arc, Mutex as StdMutex, MutexGuard},
    time::Duration,
};

use chrono::{DateTime, Utc};
use hookline_core::Clock;
use tokio::{
    sync::{Mutex, Notify},
    task::JoinHandle,
};
use tracing::debug;

use crate::{error::Result, storage::QueueStorage};

/// Cancellable one-shot timer that notifies a waiter when it fires.
#[derive(Debug)]
pub struct Timer {
    notify: Arc<Notify>,
    slot: StdMutex<Option<JoinHandle<()>>>,
}

impl Timer {
    /// Creates an unarmed timer that signals `notify` when it fires.
    pub fn new(notify: Arc<Notify>) -> Self {
        Self { notify, slot: StdMutex::new(None) }
    }

    /// Arms the timer to fire after `delay`, cancelling any outstanding
    /// timer first.
    pub fn arm(&self, delay: Duration) {
        let mut slot = self.lock_slot();
        if let Some(previous) = slot.take() {
            previous.abort();
        }

        let notify = self.notify.clone();
        *slot = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            notify.notify_one();
        }));
    }

    /// Cancels the outstanding timer, if any.
    pub fn cancel(&self) {
        if let Some(previous) = self.lock_slot().take() {
            previous.abort();
        }
    }

    /// Returns true if a timer is armed and has not fired yet.
    pub fn is_armed(&self) -> bool {
        self.lock_slot().as_ref().is_some_and(|handle| !handle.is_finished())
    }

    fn lock_slot(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        match self.slot.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// Sizes the timer from the store's earliest retry time.
pub struct Scheduler {
    timer: Timer,
    storage: Arc<dyn QueueStorage>,
    clock: Arc<dyn Clock>,
    max_attempts: u32,
    idle_recheck: Duration,
    rearm_lock: Mutex<()>,
}

impl Scheduler {
    /// Creates a scheduler whose timer signals `notify`.
    pub fn new(
        notify: Arc<Notify>,
        storage: Arc<dyn QueueStorage>,
        clock: Arc<dyn Clock>,
        max_attempts: u32,
        idle_recheck: Duration,
    ) -> Self {
        Self {
            timer: Timer::new(notify),
            storage,
            clock,
            max_attempts,
            idle_recheck,
            rearm_lock: Mutex::new(()),
        }
    }

    /// Re-arms the timer for the earliest eligible entry, or for the idle
    /// recheck interval when nothing is eligible. Returns the armed delay.
    ///
    /// Concurrent calls are serialized so that the later call always sees
    /// the store state left by the earlier one.
    ///
    /// # Errors
    ///
    /// Returns `QueueError::Storage` if the store cannot be read. The timer
    /// is left unchanged in that case.
    pub async fn rearm(&self) -> Result<Duration> {
        let _serial = self.rearm_lock.lock().await;

        let delay = match self.storage.earliest_pending(self.max_attempts).await? {
            Some(at) => self.delay_until(at),
            None => self.idle_recheck,
        };

        self.timer.arm(delay);
        debug!(delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX), "timer armed");
        Ok(delay)
    }

    /// Arms the timer to fire at `at`, or immediately if `at` has passed.
    pub fn arm(&self, at: DateTime<Utc>) {
        self.timer.arm(self.delay_until(at));
    }

    /// Arms the timer for the idle recheck interval.
    pub fn arm_idle(&self) {
        self.timer.arm(self.idle_recheck);
    }

    /// Cancels the outstanding timer.
    pub fn cancel(&self) {
        self.timer.cancel();
    }

    /// Returns true if a timer is armed and has not fired yet.
    pub fn is_armed(&self) -> bool {
        self.timer.is_armed()
    }

    fn delay_until(&self, at: DateTime<Utc>) -> Duration {
        (at - self.clock.now_utc()).to_std().unwrap_or(Duration::ZERO)
    }
}
