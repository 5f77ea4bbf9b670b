//! HTTP request handlers.
//!
//! - `ingest` - webhook routes feeding the queue
//! - `health` - root, health, readiness and liveness endpoints
//! - `stats` - queue counts and activity

pub mod health;
pub mod ingest;
pub mod stats;

pub use health::{health_check, liveness_check, readiness_check, root};
pub use ingest::{ingest_webhook, WebhookSource};
pub use stats::queue_stats;
