//! Durable webhook delivery queue.
//!
//! Accepts webhooks once per distinct `(source, payload)`, persists them,
//! and hands them one at a time to the handler registered for their source,
//! retrying failures on a widening backoff schedule.
//!
//! # Architecture
//!
//! 1. **Intake** - [`Queue::enqueue`] fingerprints the payload, drops
//!    duplicates, persists new entries and re-arms the scheduler
//! 2. **Scheduler** - a single cancellable timer sized from the earliest
//!    retry time wakes the run loop
//! 3. **Dispatcher** - drains every ready entry in `(attempts, created_at)`
//!    order with at most one handler call in flight
//! 4. **Outcome** - success moves the entry to history; failure records the
//!    sanitized message and the next retry time
//!
//! Entries that reach the attempt limit stay in the pending set for
//! inspection and are never dispatched again.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use hookline_queue::{
//!     storage::mock::MockQueueStorage, BackoffPolicy, HandlerRegistry, Queue, QueueConfig,
//! };
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> hookline_queue::Result<()> {
//! let queue = Arc::new(Queue::new(
//!     Arc::new(MockQueueStorage::new()),
//!     HandlerRegistry::new(),
//!     BackoffPolicy::default(),
//!     QueueConfig::default(),
//! ));
//!
//! let cancel = CancellationToken::new();
//! let runner = tokio::spawn({
//!     let queue = queue.clone();
//!     let cancel = cancel.clone();
//!     async move { queue.run(cancel).await }
//! });
//!
//! queue.enqueue("tilda", serde_json::json!({"body": {"name": "Ann"}})).await?;
//! cancel.cancel();
//! # let _ = runner.await;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod backoff;
pub mod client;
pub mod dispatcher;
pub mod error;
pub mod handler;
pub mod queue;
pub mod scheduler;
pub mod stats;
pub mod storage;

pub use backoff::{BackoffPolicy, BackoffStrategy};
pub use client::{ForwardingHandler, TaskClient, TaskClientConfig, TaskDefaults};
pub use dispatcher::DrainReport;
pub use error::{QueueError, Result};
pub use handler::{HandlerContext, HandlerError, HandlerRegistry, WebhookHandler};
pub use queue::{EnqueueOutcome, Queue, QueueConfig, QueueCounts};
pub use stats::QueueStatsSnapshot;
pub use storage::{QueueStorage, SqliteQueueStorage};

/// Default number of failed attempts before an entry stops being dispatched.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 12;
