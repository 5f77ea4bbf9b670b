//! Queue records and strongly-typed identifiers.
//!
//! A webhook lives in exactly one of two places: the pending set while it
//! awaits successful handling, or the history set once handled. Both carry
//! the content fingerprint that enforces at-most-once acceptance.

use std::fmt;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::{sqlite::SqliteRow, Row};

/// Store-assigned identifier of a pending entry.
///
/// Assigned by SQLite on insert and carried into the history record when
/// the entry is promoted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntryId(pub i64);

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for EntryId {
    fn from(id: i64) -> Self {
        Self(id)
    }
}

/// Hex-encoded SHA-256 digest identifying a webhook's content.
///
/// Two webhooks with the same source and payload produce the same
/// fingerprint. See [`crate::fingerprint::fingerprint`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Wraps an already computed hex digest.
    pub fn from_hex(hex: impl Into<String>) -> Self {
        Self(hex.into())
    }

    /// Returns the hex digest.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Webhook accepted at intake and not yet persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct NewPendingEntry {
    /// Content fingerprint.
    pub fingerprint: Fingerprint,
    /// Name of the route that received the webhook; selects the handler.
    pub source: String,
    /// Request content handed to the handler.
    pub payload: Value,
    /// Time of acceptance. Also the first eligible dispatch time.
    pub created_at: DateTime<Utc>,
}

/// Webhook awaiting successful handling.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PendingEntry {
    /// Store-assigned identifier.
    pub id: EntryId,
    /// Content fingerprint, unique across pending and history.
    pub fingerprint: Fingerprint,
    /// Route name selecting the handler.
    pub source: String,
    /// Request content handed to the handler.
    pub payload: Value,
    /// Time of acceptance.
    pub created_at: DateTime<Utc>,
    /// Number of failed handling attempts so far.
    pub attempts: u32,
    /// Sanitized message from the most recent failure, empty if none.
    pub last_error: String,
    /// Earliest time the entry may be dispatched again.
    pub next_attempt_at: DateTime<Utc>,
}

impl PendingEntry {
    /// Returns true once the entry has used up its attempt budget.
    ///
    /// Exhausted entries stay in the pending set for inspection but are
    /// never dispatched again.
    pub fn is_exhausted(&self, max_attempts: u32) -> bool {
        self.attempts >= max_attempts
    }

    /// Returns true if the entry may be dispatched at `now`.
    pub fn is_ready(&self, max_attempts: u32, now: DateTime<Utc>) -> bool {
        !self.is_exhausted(max_attempts) && self.next_attempt_at <= now
    }
}

impl<'r> sqlx::FromRow<'r, SqliteRow> for PendingEntry {
    fn from_row(row: &'r SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: EntryId(row.try_get("id")?),
            fingerprint: Fingerprint(row.try_get("fingerprint")?),
            source: row.try_get("source")?,
            payload: decode_json(row, "payload")?,
            created_at: decode_millis(row, "created_at")?,
            attempts: decode_attempts(row)?,
            last_error: row.try_get("last_error")?,
            next_attempt_at: decode_millis(row, "next_attempt_at")?,
        })
    }
}

/// Webhook that was handled successfully.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HistoryEntry {
    /// Identifier carried over from the pending entry.
    pub id: EntryId,
    /// Content fingerprint.
    pub fingerprint: Fingerprint,
    /// Route name.
    pub source: String,
    /// Request content.
    pub payload: Value,
    /// Time of original acceptance.
    pub created_at: DateTime<Utc>,
    /// Time of successful handling.
    pub processed_at: DateTime<Utc>,
    /// Failed attempts before the successful one.
    pub attempts: u32,
    /// Result value returned by the handler.
    pub response: Value,
}

impl<'r> sqlx::FromRow<'r, SqliteRow> for HistoryEntry {
    fn from_row(row: &'r SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: EntryId(row.try_get("id")?),
            fingerprint: Fingerprint(row.try_get("fingerprint")?),
            source: row.try_get("source")?,
            payload: decode_json(row, "payload")?,
            created_at: decode_millis(row, "created_at")?,
            processed_at: decode_millis(row, "processed_at")?,
            attempts: decode_attempts(row)?,
            response: decode_json(row, "response")?,
        })
    }
}

/// Converts a timestamp to the Unix milliseconds stored in SQLite.
pub fn to_millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

/// Converts stored Unix milliseconds back to a timestamp.
pub fn from_millis(millis: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_millis_opt(millis).single()
}

fn decode_millis(row: &SqliteRow, column: &str) -> Result<DateTime<Utc>, sqlx::Error> {
    let millis: i64 = row.try_get(column)?;
    from_millis(millis).ok_or_else(|| sqlx::Error::ColumnDecode {
        index: column.to_string(),
        source: format!("timestamp out of range: {millis}").into(),
    })
}

fn decode_json(row: &SqliteRow, column: &str) -> Result<Value, sqlx::Error> {
    let text: String = row.try_get(column)?;
    serde_json::from_str(&text)
        .map_err(|e| sqlx::Error::ColumnDecode { index: column.to_string(), source: Box::new(e) })
}

fn decode_attempts(row: &SqliteRow) -> Result<u32, sqlx::Error> {
    let attempts: i64 = row.try_get("attempts")?;
    u32::try_from(attempts).map_err(|e| sqlx::Error::ColumnDecode {
        index: "attempts".to_string(),
        source: Box::new(e),
    })
}
