//! Repository for the pending set.
//!
//! Holds webhooks that have been accepted but not yet handled successfully,
//! including exhausted entries that will never be dispatched again.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::{Executor, Sqlite, SqlitePool, Transaction};

use crate::{
    error::{CoreError, Result},
    models::{from_millis, to_millis, EntryId, Fingerprint, NewPendingEntry, PendingEntry},
};

const COLUMNS: &str =
    "id, fingerprint, source, payload, created_at, attempts, last_error, next_attempt_at";

/// Repository for pending entry operations.
pub struct Repository {
    pool: Arc<SqlitePool>,
}

impl Repository {
    /// Creates a new repository instance.
    pub fn new(pool: Arc<SqlitePool>) -> Self {
        Self { pool }
    }

    /// Inserts a new pending entry with zero attempts.
    ///
    /// The insert and the history membership check are one statement, so a
    /// fingerprint can never be accepted while a history record for it
    /// exists. The entry's first eligible dispatch time is its creation
    /// time.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Conflict` if the fingerprint is already present
    /// in either set, `CoreError::Database` on other failures.
    pub async fn insert(&self, entry: &NewPendingEntry) -> Result<EntryId> {
        let created_at = to_millis(entry.created_at);
        let result = sqlx::query(
            r#"
            INSERT INTO pending
                (fingerprint, source, payload, created_at, attempts, last_error, next_attempt_at)
            SELECT ?, ?, ?, ?, 0, '', ?
            WHERE NOT EXISTS (SELECT 1 FROM history WHERE fingerprint = ?)
            "#,
        )
        .bind(entry.fingerprint.as_str())
        .bind(&entry.source)
        .bind(entry.payload.to_string())
        .bind(created_at)
        .bind(created_at)
        .bind(entry.fingerprint.as_str())
        .execute(&*self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(CoreError::Conflict(format!(
                "fingerprint {} already processed",
                entry.fingerprint
            )));
        }

        Ok(EntryId(result.last_insert_rowid()))
    }

    /// Returns the next entry due for dispatch, if any.
    ///
    /// Candidates have fewer than `max_attempts` attempts and a retry time
    /// at or before `now`. Ordering is fewest attempts first, then oldest
    /// creation time, then lowest id.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn next_ready(
        &self,
        max_attempts: u32,
        now: DateTime<Utc>,
    ) -> Result<Option<PendingEntry>> {
        let entry = sqlx::query_as::<_, PendingEntry>(&format!(
            r#"
            SELECT {COLUMNS} FROM pending
            WHERE attempts < ? AND next_attempt_at <= ?
            ORDER BY attempts ASC, created_at ASC, id ASC
            LIMIT 1
            "#
        ))
        .bind(i64::from(max_attempts))
        .bind(to_millis(now))
        .fetch_optional(&*self.pool)
        .await?;

        Ok(entry)
    }

    /// Returns the smallest retry time among non-exhausted entries.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn earliest_next_attempt(&self, max_attempts: u32) -> Result<Option<DateTime<Utc>>> {
        let millis: Option<i64> =
            sqlx::query_scalar("SELECT MIN(next_attempt_at) FROM pending WHERE attempts < ?")
                .bind(i64::from(max_attempts))
                .fetch_one(&*self.pool)
                .await?;

        Ok(millis.and_then(from_millis))
    }

    /// Counts entries that can still be dispatched, ignoring their retry
    /// times.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn count_eligible(&self, max_attempts: u32) -> Result<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM pending WHERE attempts < ?")
            .bind(i64::from(max_attempts))
            .fetch_one(&*self.pool)
            .await?;

        Ok(u64::try_from(count).unwrap_or(0))
    }

    /// Counts entries that have used up their attempt budget.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn count_exhausted(&self, max_attempts: u32) -> Result<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM pending WHERE attempts >= ?")
            .bind(i64::from(max_attempts))
            .fetch_one(&*self.pool)
            .await?;

        Ok(u64::try_from(count).unwrap_or(0))
    }

    /// Records a failed attempt.
    ///
    /// Sets the attempt count, failure message and next retry time. The
    /// update only applies if it does not lower the stored attempt count.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::NotFound` if no entry with `id` exists,
    /// `CoreError::InvalidInput` if the update would lower the attempt
    /// count.
    pub async fn mark_failed(
        &self,
        id: EntryId,
        attempts: u32,
        last_error: &str,
        next_attempt_at: DateTime<Utc>,
    ) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE pending
            SET attempts = ?, last_error = ?, next_attempt_at = ?
            WHERE id = ? AND attempts <= ?
            "#,
        )
        .bind(i64::from(attempts))
        .bind(last_error)
        .bind(to_millis(next_attempt_at))
        .bind(id.0)
        .bind(i64::from(attempts))
        .execute(&*self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return match self.find_by_id(id).await? {
                Some(current) => Err(CoreError::InvalidInput(format!(
                    "attempts for entry {id} cannot decrease from {} to {attempts}",
                    current.attempts
                ))),
                None => Err(CoreError::NotFound(format!("pending entry {id}"))),
            };
        }

        Ok(())
    }

    /// Finds a pending entry by id.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn find_by_id(&self, id: EntryId) -> Result<Option<PendingEntry>> {
        let entry = sqlx::query_as::<_, PendingEntry>(&format!(
            "SELECT {COLUMNS} FROM pending WHERE id = ?"
        ))
        .bind(id.0)
        .fetch_optional(&*self.pool)
        .await?;

        Ok(entry)
    }

    /// Finds a pending entry by fingerprint.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn find_by_fingerprint(
        &self,
        fingerprint: &Fingerprint,
    ) -> Result<Option<PendingEntry>> {
        let entry = sqlx::query_as::<_, PendingEntry>(&format!(
            "SELECT {COLUMNS} FROM pending WHERE fingerprint = ?"
        ))
        .bind(fingerprint.as_str())
        .fetch_optional(&*self.pool)
        .await?;

        Ok(entry)
    }

    /// Lists pending entries in dispatch order, exhausted ones included.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn list(&self, limit: u32) -> Result<Vec<PendingEntry>> {
        let entries = sqlx::query_as::<_, PendingEntry>(&format!(
            "SELECT {COLUMNS} FROM pending ORDER BY attempts ASC, created_at ASC, id ASC LIMIT ?"
        ))
        .bind(i64::from(limit))
        .fetch_all(&*self.pool)
        .await?;

        Ok(entries)
    }

    /// Lists entries that have used up their attempt budget, oldest first.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn list_exhausted(&self, max_attempts: u32, limit: u32) -> Result<Vec<PendingEntry>> {
        let entries = sqlx::query_as::<_, PendingEntry>(&format!(
            r#"
            SELECT {COLUMNS} FROM pending
            WHERE attempts >= ?
            ORDER BY created_at ASC, id ASC
            LIMIT ?
            "#
        ))
        .bind(i64::from(max_attempts))
        .bind(i64::from(limit))
        .fetch_all(&*self.pool)
        .await?;

        Ok(entries)
    }

    /// Deletes a pending entry within an existing transaction.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::NotFound` if no entry with `id` exists.
    pub async fn delete_in_tx(&self, tx: &mut Transaction<'_, Sqlite>, id: EntryId) -> Result<()> {
        self.delete_impl(&mut **tx, id).await
    }

    async fn delete_impl<'e, E>(&self, executor: E, id: EntryId) -> Result<()>
    where
        E: Executor<'e, Database = Sqlite>,
    {
        let result =
            sqlx::query("DELETE FROM pending WHERE id = ?").bind(id.0).execute(executor).await?;

        if result.rows_affected() == 0 {
            return Err(CoreError::NotFound(format!("pending entry {id}")));
        }

        Ok(())
    }
}
