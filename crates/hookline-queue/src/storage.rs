//! Storage abstraction for the queue.
//!
//! The dispatcher, scheduler and intake talk to the durable store through
//! `QueueStorage`, so queue behavior can be tested against the in-memory
//! [`mock::MockQueueStorage`] as well as the SQLite-backed adapter.

use std::{future::Future, pin::Pin, sync::Arc};

use chrono::{DateTime, Utc};
use hookline_core::{
    error::Result, EntryId, Fingerprint, HistoryEntry, NewPendingEntry, PendingEntry,
};
use serde_json::Value;

/// Boxed future returned by storage operations.
pub type StorageFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Durable store operations required by the queue.
///
/// Each mutation must be atomic on its own. The dispatcher's reentrancy
/// guard provides the single-writer discipline, so no further locking is
/// expected from implementations.
pub trait QueueStorage: Send + Sync + 'static {
    /// Reports whether the fingerprint is present in pending or history.
    fn contains(&self, fingerprint: &Fingerprint) -> StorageFuture<'_, bool>;

    /// Inserts a new pending entry.
    ///
    /// Fails with `CoreError::Conflict` if the fingerprint is already present
    /// in either set. This is the final guard against racing enqueues.
    fn insert_pending(&self, entry: NewPendingEntry) -> StorageFuture<'_, EntryId>;

    /// Returns the best dispatch candidate at `now`: fewest attempts, then
    /// oldest, among entries with `attempts < max_attempts` that are due.
    fn next_ready(
        &self,
        max_attempts: u32,
        now: DateTime<Utc>,
    ) -> StorageFuture<'_, Option<PendingEntry>>;

    /// Returns the earliest retry time among non-exhausted entries.
    fn earliest_pending(&self, max_attempts: u32) -> StorageFuture<'_, Option<DateTime<Utc>>>;

    /// Records a failed attempt on a pending entry.
    fn mark_failed(
        &self,
        id: EntryId,
        attempts: u32,
        last_error: String,
        next_attempt_at: DateTime<Utc>,
    ) -> StorageFuture<'_, ()>;

    /// Atomically removes the pending entry and records it in history.
    fn promote_to_history(
        &self,
        entry: PendingEntry,
        response: Value,
        processed_at: DateTime<Utc>,
    ) -> StorageFuture<'_, ()>;

    /// Counts entries with `attempts < max_attempts`.
    fn count_eligible(&self, max_attempts: u32) -> StorageFuture<'_, u64>;

    /// Counts entries with `attempts >= max_attempts`.
    fn count_exhausted(&self, max_attempts: u32) -> StorageFuture<'_, u64>;

    /// Counts history entries.
    fn count_history(&self) -> StorageFuture<'_, u64>;

    /// Finds a pending entry by fingerprint.
    fn find_pending(&self, fingerprint: &Fingerprint) -> StorageFuture<'_, Option<PendingEntry>>;

    /// Finds a history entry by fingerprint.
    fn find_history(&self, fingerprint: &Fingerprint) -> StorageFuture<'_, Option<HistoryEntry>>;

    /// Lists pending entries in dispatch order, exhausted ones included.
    fn list_pending(&self, limit: u32) -> StorageFuture<'_, Vec<PendingEntry>>;

    /// Lists exhausted entries, oldest first.
    fn list_exhausted(&self, max_attempts: u32, limit: u32) -> StorageFuture<'_, Vec<PendingEntry>>;

    /// Verifies the store is reachable.
    fn health_check(&self) -> StorageFuture<'_, ()>;
}

/// Production storage backed by SQLite.
///
/// Wraps the concrete `hookline_core::storage::Storage`.
pub struct SqliteQueueStorage {
    storage: Arc<hookline_core::storage::Storage>,
}

impl SqliteQueueStorage {
    /// Creates a new SQLite storage adapter.
    pub fn new(storage: Arc<hookline_core::storage::Storage>) -> Self {
        Self { storage }
    }

    /// Returns the wrapped storage.
    pub fn inner(&self) -> &Arc<hookline_core::storage::Storage> {
        &self.storage
    }
}

impl QueueStorage for SqliteQueueStorage {
    fn contains(&self, fingerprint: &Fingerprint) -> StorageFuture<'_, bool> {
        let storage = self.storage.clone();
        let fingerprint = fingerprint.clone();
        Box::pin(async move { storage.contains(&fingerprint).await })
    }

    fn insert_pending(&self, entry: NewPendingEntry) -> StorageFuture<'_, EntryId> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.pending.insert(&entry).await })
    }

    fn next_ready(
        &self,
        max_attempts: u32,
        now: DateTime<Utc>,
    ) -> StorageFuture<'_, Option<PendingEntry>> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.pending.next_ready(max_attempts, now).await })
    }

    fn earliest_pending(&self, max_attempts: u32) -> StorageFuture<'_, Option<DateTime<Utc>>> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.pending.earliest_next_attempt(max_attempts).await })
    }

    fn mark_failed(
        &self,
        id: EntryId,
        attempts: u32,
        last_error: String,
        next_attempt_at: DateTime<Utc>,
    ) -> StorageFuture<'_, ()> {
        let storage = self.storage.clone();
        Box::pin(async move {
            storage.pending.mark_failed(id, attempts, &last_error, next_attempt_at).await
        })
    }

    fn promote_to_history(
        &self,
        entry: PendingEntry,
        response: Value,
        processed_at: DateTime<Utc>,
    ) -> StorageFuture<'_, ()> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.promote_to_history(&entry, &response, processed_at).await })
    }

    fn count_eligible(&self, max_attempts: u32) -> StorageFuture<'_, u64> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.pending.count_eligible(max_attempts).await })
    }

    fn count_exhausted(&self, max_attempts: u32) -> StorageFuture<'_, u64> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.pending.count_exhausted(max_attempts).await })
    }

    fn count_history(&self) -> StorageFuture<'_, u64> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.history.count().await })
    }

    fn find_pending(&self, fingerprint: &Fingerprint) -> StorageFuture<'_, Option<PendingEntry>> {
        let storage = self.storage.clone();
        let fingerprint = fingerprint.clone();
        Box::pin(async move { storage.pending.find_by_fingerprint(&fingerprint).await })
    }

    fn find_history(&self, fingerprint: &Fingerprint) -> StorageFuture<'_, Option<HistoryEntry>> {
        let storage = self.storage.clone();
        let fingerprint = fingerprint.clone();
        Box::pin(async move { storage.history.find_by_fingerprint(&fingerprint).await })
    }

    fn list_pending(&self, limit: u32) -> StorageFuture<'_, Vec<PendingEntry>> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.pending.list(limit).await })
    }

    fn list_exhausted(
        &self,
        max_attempts: u32,
        limit: u32,
    ) -> StorageFuture<'_, Vec<PendingEntry>> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.pending.list_exhausted(max_attempts, limit).await })
    }

    fn health_check(&self) -> StorageFuture<'_, ()> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.health_check().await })
    }
}

pub mod mock {
    //! In-memory storage for testing queue logic without a database.
    //!
    //! Mirrors the SQLite semantics (cross-set uniqueness, dispatch order,
    //! transactional promotion) and supports injecting store failures.

    use std::{
        collections::{BTreeMap, HashMap},
        sync::{
            atomic::{AtomicUsize, Ordering},
            Arc,
        },
    };

    use chrono::{DateTime, Utc};
    use hookline_core::{
        CoreError, EntryId, Fingerprint, HistoryEntry, NewPendingEntry, PendingEntry,
    };
    use serde_json::Value;
    use tokio::sync::RwLock;

    use super::{QueueStorage, StorageFuture};

    #[derive(Default)]
    struct State {
        pending: BTreeMap<EntryId, PendingEntry>,
        history: HashMap<Fingerprint, HistoryEntry>,
        next_id: i64,
    }

    /// In-memory queue storage with failure injection.
    #[derive(Clone, Default)]
    pub struct MockQueueStorage {
        state: Arc<RwLock<State>>,
        insert_failures: Arc<AtomicUsize>,
        read_failures: Arc<AtomicUsize>,
        insert_calls: Arc<AtomicUsize>,
    }

    impl MockQueueStorage {
        /// Creates an empty mock store.
        pub fn new() -> Self {
            Self::default()
        }

        /// Makes the next `count` inserts fail with a database error.
        pub fn fail_next_inserts(&self, count: usize) {
            self.insert_failures.store(count, Ordering::SeqCst);
        }

        /// Makes the next `count` dispatch reads (`next_ready`,
        /// `earliest_pending`) fail with a database error.
        pub fn fail_next_reads(&self, count: usize) {
            self.read_failures.store(count, Ordering::SeqCst);
        }

        /// Returns how many insert attempts were made.
        pub fn insert_calls(&self) -> usize {
            self.insert_calls.load(Ordering::SeqCst)
        }

        /// Returns a snapshot of all pending entries ordered by id.
        pub async fn pending_entries(&self) -> Vec<PendingEntry> {
            self.state.read().await.pending.values().cloned().collect()
        }

        /// Returns a snapshot of all history entries ordered by id.
        pub async fn history_entries(&self) -> Vec<HistoryEntry> {
            let mut entries: Vec<_> = self.state.read().await.history.values().cloned().collect();
            entries.sort_by_key(|entry| entry.id);
            entries
        }

        /// Overwrites a pending entry's retry time.
        pub async fn set_next_attempt_at(&self, id: EntryId, at: DateTime<Utc>) {
            if let Some(entry) = self.state.write().await.pending.get_mut(&id) {
                entry.next_attempt_at = at;
            }
        }

        fn take_failure(counter: &AtomicUsize) -> bool {
            counter.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1)).is_ok()
        }
    }

    fn dispatch_order(entries: &mut [PendingEntry]) {
        entries.sort_by(|a, b| {
            a.attempts.cmp(&b.attempts).then(a.created_at.cmp(&b.created_at)).then(a.id.cmp(&b.id))
        });
    }

    impl QueueStorage for MockQueueStorage {
        fn contains(&self, fingerprint: &Fingerprint) -> StorageFuture<'_, bool> {
            let fingerprint = fingerprint.clone();
            Box::pin(async move {
                let state = self.state.read().await;
                Ok(state.history.contains_key(&fingerprint)
                    || state.pending.values().any(|e| e.fingerprint == fingerprint))
            })
        }

        fn insert_pending(&self, entry: NewPendingEntry) -> StorageFuture<'_, EntryId> {
            Box::pin(async move {
                self.insert_calls.fetch_add(1, Ordering::SeqCst);
                if Self::take_failure(&self.insert_failures) {
                    return Err(CoreError::Database("injected insert failure".to_string()));
                }

                let mut state = self.state.write().await;
                let duplicate = state.history.contains_key(&entry.fingerprint)
                    || state.pending.values().any(|e| e.fingerprint == entry.fingerprint);
                if duplicate {
                    return Err(CoreError::Conflict(format!(
                        "fingerprint {} already present",
                        entry.fingerprint
                    )));
                }

                state.next_id += 1;
                let id = EntryId(state.next_id);
                state.pending.insert(id, PendingEntry {
                    id,
                    fingerprint: entry.fingerprint,
                    source: entry.source,
                    payload: entry.payload,
                    created_at: entry.created_at,
                    attempts: 0,
                    last_error: String::new(),
                    next_attempt_at: entry.created_at,
                });
                Ok(id)
            })
        }

        fn next_ready(
            &self,
            max_attempts: u32,
            now: DateTime<Utc>,
        ) -> StorageFuture<'_, Option<PendingEntry>> {
            Box::pin(async move {
                if Self::take_failure(&self.read_failures) {
                    return Err(CoreError::Database("injected read failure".to_string()));
                }
                let state = self.state.read().await;
                let mut ready: Vec<_> = state
                    .pending
                    .values()
                    .filter(|e| e.is_ready(max_attempts, now))
                    .cloned()
                    .collect();
                dispatch_order(&mut ready);
                Ok(ready.into_iter().next())
            })
        }

        fn earliest_pending(&self, max_attempts: u32) -> StorageFuture<'_, Option<DateTime<Utc>>> {
            Box::pin(async move {
                if Self::take_failure(&self.read_failures) {
                    return Err(CoreError::Database("injected read failure".to_string()));
                }
                let state = self.state.read().await;
                Ok(state
                    .pending
                    .values()
                    .filter(|e| !e.is_exhausted(max_attempts))
                    .map(|e| e.next_attempt_at)
                    .min())
            })
        }

        fn mark_failed(
            &self,
            id: EntryId,
            attempts: u32,
            last_error: String,
            next_attempt_at: DateTime<Utc>,
        ) -> StorageFuture<'_, ()> {
            Box::pin(async move {
                let mut state = self.state.write().await;
                let entry = state
                    .pending
                    .get_mut(&id)
                    .ok_or_else(|| CoreError::NotFound(format!("pending entry {id}")))?;
                if attempts < entry.attempts {
                    return Err(CoreError::InvalidInput(format!(
                        "attempts for entry {id} cannot decrease from {} to {attempts}",
                        entry.attempts
                    )));
                }
                entry.attempts = attempts;
                entry.last_error = last_error;
                entry.next_attempt_at = next_attempt_at;
                Ok(())
            })
        }

        fn promote_to_history(
            &self,
            entry: PendingEntry,
            response: Value,
            processed_at: DateTime<Utc>,
        ) -> StorageFuture<'_, ()> {
            Box::pin(async move {
                let mut state = self.state.write().await;
                if !state.pending.contains_key(&entry.id) {
                    return Err(CoreError::NotFound(format!("pending entry {}", entry.id)));
                }
                state.pending.remove(&entry.id);
                state.history.entry(entry.fingerprint.clone()).or_insert(HistoryEntry {
                    id: entry.id,
                    fingerprint: entry.fingerprint,
                    source: entry.source,
                    payload: entry.payload,
                    created_at: entry.created_at,
                    processed_at,
                    attempts: entry.attempts,
                    response,
                });
                Ok(())
            })
        }

        fn count_eligible(&self, max_attempts: u32) -> StorageFuture<'_, u64> {
            Box::pin(async move {
                let state = self.state.read().await;
                Ok(state.pending.values().filter(|e| !e.is_exhausted(max_attempts)).count() as u64)
            })
        }

        fn count_exhausted(&self, max_attempts: u32) -> StorageFuture<'_, u64> {
            Box::pin(async move {
                let state = self.state.read().await;
                Ok(state.pending.values().filter(|e| e.is_exhausted(max_attempts)).count() as u64)
            })
        }

        fn count_history(&self) -> StorageFuture<'_, u64> {
            Box::pin(async move { Ok(self.state.read().await.history.len() as u64) })
        }

        fn find_pending(
            &self,
            fingerprint: &Fingerprint,
        ) -> StorageFuture<'_, Option<PendingEntry>> {
            let fingerprint = fingerprint.clone();
            Box::pin(async move {
                let state = self.state.read().await;
                Ok(state.pending.values().find(|e| e.fingerprint == fingerprint).cloned())
            })
        }

        fn find_history(
            &self,
            fingerprint: &Fingerprint,
        ) -> StorageFuture<'_, Option<HistoryEntry>> {
            let fingerprint = fingerprint.clone();
            Box::pin(async move { Ok(self.state.read().await.history.get(&fingerprint).cloned()) })
        }

        fn list_pending(&self, limit: u32) -> StorageFuture<'_, Vec<PendingEntry>> {
            Box::pin(async move {
                let mut entries = self.pending_entries().await;
                dispatch_order(&mut entries);
                entries.truncate(limit as usize);
                Ok(entries)
            })
        }

        fn list_exhausted(
            &self,
            max_attempts: u32,
            limit: u32,
        ) -> StorageFuture<'_, Vec<PendingEntry>> {
            Box::pin(async move {
                let mut entries: Vec<_> = self
                    .pending_entries()
                    .await
                    .into_iter()
                    .filter(|e| e.is_exhausted(max_attempts))
                    .collect();
                entries.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
                entries.truncate(limit as usize);
                Ok(entries)
            })
        }

        fn health_check(&self) -> StorageFuture<'_, ()> {
            Box::pin(async { Ok(()) })
        }
    }
}
