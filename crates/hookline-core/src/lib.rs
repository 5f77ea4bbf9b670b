//! Core domain models and storage for the hookline delivery queue.
//!
//! Provides the strongly-typed records that flow through the queue, the
//! content fingerprint used for deduplication, a clock abstraction, and the
//! SQLite repositories that persist pending work and delivery history. The
//! queue and API crates depend on these types for consistency.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod error;
pub mod fingerprint;
pub mod models;
pub mod storage;
pub mod time;

pub use error::{CoreError, Result};
pub use fingerprint::fingerprint;
pub use models::{EntryId, Fingerprint, HistoryEntry, NewPendingEntry, PendingEntry};
pub use time::{Clock, RealClock, TestClock};
