//! Integration tests for intake, draining and retry bookkeeping.
//!
//! Drives the queue against the in-memory store with a controllable clock
//! so retry times can be asserted exactly.

#![allow(clippy::expect_used)]
#![allow(clippy::unwrap_used)]

use std::{
    collections::VecDeque,
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use hookline_core::{fingerprint, Clock, TestClock};
use hookline_queue::{
    storage::{mock::MockQueueStorage, QueueStorage},
    BackoffPolicy, HandlerContext, HandlerError, HandlerRegistry, Queue, QueueConfig,
    QueueError, WebhookHandler,
};
use serde_json::{json, Value};
use tokio::sync::Notify;

/// Handler that replays scripted outcomes and records every call.
#[derive(Default)]
struct ScriptedHandler {
    outcomes: Mutex<VecDeque<Result<Value, HandlerError>>>,
    calls: Mutex<Vec<(String, u32, Value)>>,
}

impl ScriptedHandler {
    fn succeeding() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn failing(times: usize, message: &str) -> Arc<Self> {
        let handler = Self::default();
        {
            let mut outcomes = handler.outcomes.lock().unwrap();
            for _ in 0..times {
                outcomes.push_back(Err(HandlerError::new(message)));
            }
        }
        Arc::new(handler)
    }

    fn calls(&self) -> Vec<(String, u32, Value)> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl WebhookHandler for ScriptedHandler {
    async fn handle(&self, payload: &Value, ctx: &HandlerContext) -> Result<Value, HandlerError> {
        self.calls.lock().unwrap().push((ctx.source.clone(), ctx.attempts, payload.clone()));
        self.outcomes
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(json!({"handled": payload.clone()})))
    }
}

/// Handler that blocks until released, to hold a drain cycle open.
struct GateHandler {
    entered: Notify,
    release: Notify,
}

#[async_trait]
impl WebhookHandler for GateHandler {
    async fn handle(&self, _payload: &Value, _ctx: &HandlerContext) -> Result<Value, HandlerError> {
        self.entered.notify_one();
        self.release.notified().await;
        Ok(Value::Null)
    }
}

/// Handler that panics on payloads flagged `bad` and succeeds otherwise.
struct PanickyHandler;

#[async_trait]
impl WebhookHandler for PanickyHandler {
    async fn handle(&self, payload: &Value, _ctx: &HandlerContext) -> Result<Value, HandlerError> {
        if payload["bad"] == json!(true) {
            panic!("bad payload");
        }
        Ok(json!({"ok": true}))
    }
}

struct Fixture {
    queue: Queue,
    storage: MockQueueStorage,
    clock: TestClock,
    policy: BackoffPolicy,
}

fn fixture(registry: HandlerRegistry, config: QueueConfig) -> Fixture {
    let storage = MockQueueStorage::new();
    let clock = TestClock::new();
    let policy = BackoffPolicy::new(Duration::from_secs(1));
    let queue = Queue::with_clock(
        Arc::new(storage.clone()),
        registry,
        policy.clone(),
        config,
        Arc::new(clock.clone()),
    );
    Fixture { queue, storage, clock, policy }
}

fn registry(name: &str, handler: Arc<dyn WebhookHandler>) -> HandlerRegistry {
    HandlerRegistry::new().with(name, handler).unwrap()
}

#[tokio::test]
async fn failed_attempt_is_recorded_and_duplicate_rejected() {
    let handler = ScriptedHandler::failing(1, "network error");
    let f = fixture(registry("amocrm", handler.clone()), QueueConfig::default());
    let payload = json!({"headers": {}, "body": {"lead": 7}});

    let outcome = f.queue.enqueue("amocrm", payload.clone()).await.unwrap();
    assert!(!outcome.already_exists);
    let failed_at = f.clock.now_utc();

    let report = f.queue.drain().await.unwrap();
    assert_eq!(report.dispatched, 1);
    assert_eq!(report.failed, 1);

    let pending = f.storage.pending_entries().await;
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].attempts, 1);
    assert_eq!(pending[0].last_error, "network error");
    // Cubic backoff with a one second base: 2 * 1^3 seconds.
    assert_eq!(pending[0].next_attempt_at, failed_at + chrono::Duration::seconds(2));

    let again = f.queue.enqueue("amocrm", payload).await.unwrap();
    assert!(again.already_exists);
    assert_eq!(again.entry_id, None);
    assert_eq!(f.storage.pending_entries().await.len(), 1);
    assert_eq!(handler.calls().len(), 1);
}

#[tokio::test]
async fn success_moves_entry_to_history() {
    struct TaskUrl;

    #[async_trait]
    impl WebhookHandler for TaskUrl {
        async fn handle(&self, _: &Value, _: &HandlerContext) -> Result<Value, HandlerError> {
            Ok(json!({"url": "https://x/42"}))
        }
    }

    let f = fixture(registry("tilda", Arc::new(TaskUrl)), QueueConfig::default());
    let payload = json!({"headers": {}, "body": {"name": "Ann"}});

    f.queue.enqueue("tilda", payload.clone()).await.unwrap();
    let report = f.queue.drain().await.unwrap();
    assert_eq!(report.succeeded, 1);

    assert!(f.storage.pending_entries().await.is_empty());
    let history = f.storage.history_entries().await;
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].source, "tilda");
    assert_eq!(history[0].payload, payload);
    assert_eq!(history[0].attempts, 0);
    assert_eq!(history[0].response, json!({"url": "https://x/42"}));

    let again = f.queue.enqueue("tilda", payload).await.unwrap();
    assert!(again.already_exists);
    assert_eq!(f.queue.stats().duplicates, 1);
}

#[tokio::test]
async fn same_payload_on_different_sources_is_distinct() {
    let handler = ScriptedHandler::succeeding();
    let registry = HandlerRegistry::new()
        .with("tilda", handler.clone())
        .unwrap()
        .with("manychat", handler.clone())
        .unwrap();
    let f = fixture(registry, QueueConfig::default());

    let a = f.queue.enqueue("tilda", json!({"id": 1})).await.unwrap();
    let b = f.queue.enqueue("manychat", json!({"id": 1})).await.unwrap();

    assert!(!a.already_exists);
    assert!(!b.already_exists);
    assert_ne!(a.entry_id, b.entry_id);
}

#[tokio::test]
async fn key_order_does_not_defeat_deduplication() {
    let f = fixture(HandlerRegistry::new(), QueueConfig::default());

    f.queue.enqueue("tilda", json!({"a": 1, "b": 2})).await.unwrap();
    let again = f.queue.enqueue("tilda", json!({"b": 2, "a": 1})).await.unwrap();

    assert!(again.already_exists);
}

#[tokio::test]
async fn fewer_attempts_are_dispatched_first() {
    let handler = ScriptedHandler::failing(1, "boom");
    let f = fixture(registry("tilda", handler.clone()), QueueConfig::default());

    let first = f.queue.enqueue("tilda", json!({"n": 1})).await.unwrap().entry_id.unwrap();
    f.queue.drain().await.unwrap();

    // The failed entry becomes due again before a fresh one arrives.
    f.storage.set_next_attempt_at(first, f.clock.now_utc()).await;
    f.clock.advance(Duration::from_secs(1));
    f.queue.enqueue("tilda", json!({"n": 2})).await.unwrap();

    f.queue.drain().await.unwrap();

    let calls = handler.calls();
    assert_eq!(calls.len(), 3);
    assert_eq!(calls[0].2, json!({"n": 1}));
    assert_eq!((calls[1].1, calls[1].2.clone()), (0, json!({"n": 2})));
    assert_eq!((calls[2].1, calls[2].2.clone()), (1, json!({"n": 1})));
}

#[tokio::test]
async fn entries_with_future_retry_time_are_skipped() {
    let handler = ScriptedHandler::failing(1, "down");
    let f = fixture(registry("tilda", handler.clone()), QueueConfig::default());

    f.queue.enqueue("tilda", json!({"n": 1})).await.unwrap();
    f.queue.drain().await.unwrap();

    let report = f.queue.drain().await.unwrap();
    assert_eq!(report.dispatched, 0);

    f.clock.advance(f.policy.delay(1));
    let report = f.queue.drain().await.unwrap();
    assert_eq!(report.succeeded, 1);
    assert_eq!(handler.calls().len(), 2);
}

#[tokio::test]
async fn exhausted_entries_stay_pending_and_are_not_dispatched() {
    let handler = ScriptedHandler::failing(16, "still down");
    let config = QueueConfig { max_attempts: 3, ..QueueConfig::default() };
    let f = fixture(registry("tilda", handler.clone()), config);

    f.queue.enqueue("tilda", json!({"n": 1})).await.unwrap();
    for attempt in 1..=3 {
        f.queue.drain().await.unwrap();
        f.clock.advance(f.policy.delay(attempt));
    }

    f.clock.advance(Duration::from_secs(86_400));
    let report = f.queue.drain().await.unwrap();
    assert_eq!(report.dispatched, 0);
    assert_eq!(handler.calls().len(), 3);

    let pending = f.storage.pending_entries().await;
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].attempts, 3);

    let counts = f.queue.counts().await.unwrap();
    assert_eq!((counts.eligible, counts.exhausted, counts.processed), (0, 1, 0));
    assert_eq!(f.queue.stats().exhausted, 1);
    assert_eq!(f.queue.storage().earliest_pending(3).await.unwrap(), None);

    let again = f.queue.enqueue("tilda", json!({"n": 1})).await.unwrap();
    assert!(again.already_exists);
}

#[tokio::test]
async fn missing_handler_counts_as_failure() {
    let f = fixture(HandlerRegistry::new(), QueueConfig::default());

    f.queue.enqueue("telegram", json!({"msg": "hi"})).await.unwrap();
    let report = f.queue.drain().await.unwrap();
    assert_eq!(report.failed, 1);

    let pending = f.storage.pending_entries().await;
    assert_eq!(pending[0].attempts, 1);
    assert_eq!(pending[0].last_error, "no handler registered for source telegram");
}

#[tokio::test]
async fn failure_messages_are_sanitized() {
    let handler = ScriptedHandler::failing(1, "task request failed: 502\r\n<html>\n  bad gateway");
    let f = fixture(registry("tilda", handler), QueueConfig::default());

    f.queue.enqueue("tilda", json!({"n": 1})).await.unwrap();
    f.queue.drain().await.unwrap();

    let pending = f.storage.pending_entries().await;
    assert_eq!(pending[0].last_error, "task request failed: 502 <html> bad gateway");
}

#[tokio::test]
async fn concurrent_drain_is_skipped() {
    let gate = Arc::new(GateHandler { entered: Notify::new(), release: Notify::new() });
    let f = fixture(registry("tilda", gate.clone()), QueueConfig::default());
    let queue = Arc::new(f.queue);

    queue.enqueue("tilda", json!({"n": 1})).await.unwrap();

    let running = tokio::spawn({
        let queue = queue.clone();
        async move { queue.drain().await }
    });
    gate.entered.notified().await;

    let second = queue.drain().await.unwrap();
    assert!(second.skipped);
    assert_eq!(second.dispatched, 0);

    gate.release.notify_one();
    let first = running.await.unwrap().unwrap();
    assert!(!first.skipped);
    assert_eq!(first.succeeded, 1);
}

#[tokio::test(start_paused = true)]
async fn intake_retries_transient_store_failures() {
    let config = QueueConfig {
        intake_retries: 3,
        intake_retry_interval: Duration::from_secs(5),
        ..QueueConfig::default()
    };
    let f = fixture(HandlerRegistry::new(), config);
    f.storage.fail_next_inserts(2);

    let outcome = f.queue.enqueue("tilda", json!({"n": 1})).await.unwrap();

    assert!(!outcome.already_exists);
    assert_eq!(f.storage.insert_calls(), 3);
    assert_eq!(f.storage.pending_entries().await.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn intake_gives_up_after_configured_retries() {
    let config = QueueConfig {
        intake_retries: 2,
        intake_retry_interval: Duration::from_millis(100),
        ..QueueConfig::default()
    };
    let f = fixture(HandlerRegistry::new(), config);
    f.storage.fail_next_inserts(10);

    let err = f.queue.enqueue("tilda", json!({"n": 1})).await.unwrap_err();

    assert!(matches!(err, QueueError::Storage { .. }));
    assert_eq!(f.storage.insert_calls(), 3);
    assert!(f.storage.pending_entries().await.is_empty());
}

#[tokio::test]
async fn store_failure_during_drain_leaves_entry_untouched() {
    let handler = ScriptedHandler::succeeding();
    let f = fixture(registry("tilda", handler.clone()), QueueConfig::default());

    f.queue.enqueue("tilda", json!({"n": 1})).await.unwrap();
    f.storage.fail_next_reads(1);

    assert!(f.queue.drain().await.is_err());
    assert!(handler.calls().is_empty());

    let pending = f.storage.pending_entries().await;
    assert_eq!(pending[0].attempts, 0);

    let report = f.queue.drain().await.unwrap();
    assert_eq!(report.succeeded, 1);
}

#[tokio::test]
async fn handler_context_reflects_entry() {
    let handler = ScriptedHandler::failing(1, "retry me");
    let f = fixture(registry("manychat", handler.clone()), QueueConfig::default());
    let payload = json!({"body": {"id": 5}});

    f.queue.enqueue("manychat", payload.clone()).await.unwrap();
    f.queue.drain().await.unwrap();
    f.clock.advance(f.policy.delay(1));
    f.queue.drain().await.unwrap();

    let calls = handler.calls();
    assert_eq!(calls[0], ("manychat".to_string(), 0, payload.clone()));
    assert_eq!(calls[1], ("manychat".to_string(), 1, payload.clone()));

    let stored = f.storage.find_history(&fingerprint("manychat", &payload)).await.unwrap();
    assert_eq!(stored.unwrap().attempts, 1);
}

#[tokio::test]
async fn panicking_handler_is_recorded_as_failure() {
    let f = fixture(registry("tilda", Arc::new(PanickyHandler)), QueueConfig::default());

    f.queue.enqueue("tilda", json!({"bad": true})).await.unwrap();
    f.queue.enqueue("tilda", json!({"bad": false})).await.unwrap();

    let report = f.queue.drain().await.unwrap();
    assert_eq!(report.dispatched, 2);
    assert_eq!(report.failed, 1);
    assert_eq!(report.succeeded, 1);

    let pending = f.storage.pending_entries().await;
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].payload, json!({"bad": true}));
    assert_eq!(pending[0].attempts, 1);
    assert_eq!(pending[0].last_error, "handler panicked: bad payload");

    let history = f.storage.history_entries().await;
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].payload, json!({"bad": false}));
}

#[tokio::test]
async fn rearm_falls_back_to_idle_recheck_on_empty_store() {
    let f = fixture(HandlerRegistry::new(), QueueConfig::default());

    let delay = f.queue.rearm().await.unwrap();

    assert_eq!(delay, QueueConfig::default().idle_recheck);
    assert!(f.queue.is_armed());
}

#[tokio::test]
async fn rearm_waits_for_earliest_retry_time() {
    let f = fixture(HandlerRegistry::new(), QueueConfig::default());
    let now = f.clock.now_utc();

    let due = f.queue.enqueue("tilda", json!({"n": 1})).await.unwrap().entry_id.unwrap();
    assert_eq!(f.queue.rearm().await.unwrap(), Duration::ZERO);

    f.storage.set_next_attempt_at(due, now + chrono::Duration::seconds(30)).await;
    let later = f.queue.enqueue("tilda", json!({"n": 2})).await.unwrap().entry_id.unwrap();
    f.storage.set_next_attempt_at(later, now + chrono::Duration::seconds(90)).await;
    assert_eq!(f.queue.rearm().await.unwrap(), Duration::from_secs(30));

    // Overdue entries are due now, never a negative wait.
    f.storage.set_next_attempt_at(due, now - chrono::Duration::seconds(10)).await;
    assert_eq!(f.queue.rearm().await.unwrap(), Duration::ZERO);
}

#[tokio::test]
async fn rearm_ignores_exhausted_entries() {
    let config = QueueConfig { max_attempts: 2, ..QueueConfig::default() };
    let f = fixture(HandlerRegistry::new(), config.clone());
    let now = f.clock.now_utc();

    let id = f.queue.enqueue("tilda", json!({"n": 1})).await.unwrap().entry_id.unwrap();
    f.storage
        .mark_failed(id, 2, "gave up".to_string(), now + chrono::Duration::seconds(5))
        .await
        .unwrap();

    assert_eq!(f.queue.rearm().await.unwrap(), config.idle_recheck);
    assert_eq!(f.storage.pending_entries().await.len(), 1);
}
