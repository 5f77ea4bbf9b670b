//! Property-based tests for backoff and dispatch ordering.

#![allow(clippy::unwrap_used)]

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use hookline_core::{fingerprint, NewPendingEntry};
use hookline_queue::{
    storage::{mock::MockQueueStorage, QueueStorage},
    BackoffPolicy, BackoffStrategy, HandlerContext, HandlerError, HandlerRegistry, Queue,
    QueueConfig, WebhookHandler,
};
use proptest::prelude::*;
use serde_json::{json, Value};

fn strategy() -> impl Strategy<Value = BackoffStrategy> {
    prop_oneof![
        Just(BackoffStrategy::Cubic),
        Just(BackoffStrategy::Exponential),
        Just(BackoffStrategy::Linear),
        Just(BackoffStrategy::Fixed),
    ]
}

proptest! {
    #[test]
    fn backoff_never_decreases(
        base_ms in 1u64..10_000,
        cap_secs in prop::option::of(1u64..1_000_000),
        strategy in strategy(),
        attempts in 0u32..10_000,
    ) {
        let mut policy = BackoffPolicy::new(Duration::from_millis(base_ms)).with_strategy(strategy);
        if let Some(cap) = cap_secs {
            policy = policy.with_max_delay(Duration::from_secs(cap));
        }

        prop_assert!(policy.delay(attempts + 1) >= policy.delay(attempts));
        prop_assert!(policy.delay(attempts) <= policy.max_delay);
    }

    #[test]
    fn failed_attempts_always_move_retry_forward(
        base_ms in 1u64..60_000,
        attempts in 1u32..1_000,
    ) {
        let policy = BackoffPolicy::new(Duration::from_millis(base_ms));
        let now = Utc::now();
        prop_assert!(policy.next_attempt_at(now, attempts) > now);
    }
}

/// Records the order entries are handed over in.
struct Recorder(Mutex<Vec<(u32, i64)>>);

#[async_trait]
impl WebhookHandler for Recorder {
    async fn handle(&self, payload: &Value, ctx: &HandlerContext) -> Result<Value, HandlerError> {
        let created = payload["created"].as_i64().unwrap_or_default();
        self.0.lock().unwrap().push((ctx.attempts, created));
        Ok(Value::Null)
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn drain_visits_entries_by_attempts_then_age(
        entries in prop::collection::vec((0u32..4, 0i64..1_000), 1..20),
    ) {
        let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();

        let order = runtime.block_on(async {
            let storage = MockQueueStorage::new();
            let due = Utc.timestamp_opt(1_700_000_000, 0).unwrap();

            for (index, (attempts, created)) in entries.iter().enumerate() {
                let payload = json!({"created": created, "index": index});
                let id = storage
                    .insert_pending(NewPendingEntry {
                        fingerprint: fingerprint("tilda", &payload),
                        source: "tilda".to_string(),
                        payload,
                        created_at: Utc.timestamp_opt(1_600_000_000 + created, 0).unwrap(),
                    })
                    .await
                    .unwrap();
                if *attempts > 0 {
                    storage.mark_failed(id, *attempts, "earlier".to_string(), due).await.unwrap();
                }
            }

            let recorder = Arc::new(Recorder(Mutex::new(Vec::new())));
            let queue = Queue::new(
                Arc::new(storage),
                HandlerRegistry::new().with("tilda", recorder.clone()).unwrap(),
                BackoffPolicy::default(),
                QueueConfig::default(),
            );
            queue.drain().await.unwrap();

            let order = recorder.0.lock().unwrap().clone();
            order
        });

        prop_assert_eq!(order.len(), entries.len());
        for pair in order.windows(2) {
            prop_assert!(pair[0] <= pair[1], "out of order: {:?}", order);
        }
    }
}
