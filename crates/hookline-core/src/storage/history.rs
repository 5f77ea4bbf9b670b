//! Repository for the history set of successfully handled webhooks.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{Executor, Sqlite, SqlitePool, Transaction};

use crate::{
    error::Result,
    models::{to_millis, Fingerprint, HistoryEntry, PendingEntry},
};

const COLUMNS: &str =
    "id, fingerprint, source, payload, created_at, processed_at, attempts, response";

/// Repository for history entry operations.
pub struct Repository {
    pool: Arc<SqlitePool>,
}

impl Repository {
    /// Creates a new repository instance.
    pub fn new(pool: Arc<SqlitePool>) -> Self {
        Self { pool }
    }

    /// Records a handled entry within an existing transaction.
    ///
    /// A fingerprint already present in history is left untouched. Returns
    /// whether a new row was written.
    ///
    /// # Errors
    ///
    /// Returns error if the insert fails.
    pub async fn insert_in_tx(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        entry: &PendingEntry,
        response: &Value,
        processed_at: DateTime<Utc>,
    ) -> Result<bool> {
        self.insert_impl(&mut **tx, entry, response, processed_at).await
    }

    async fn insert_impl<'e, E>(
        &self,
        executor: E,
        entry: &PendingEntry,
        response: &Value,
        processed_at: DateTime<Utc>,
    ) -> Result<bool>
    where
        E: Executor<'e, Database = Sqlite>,
    {
        let result = sqlx::query(
            r#"
            INSERT INTO history
                (id, fingerprint, source, payload, created_at, processed_at, attempts, response)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(fingerprint) DO NOTHING
            "#,
        )
        .bind(entry.id.0)
        .bind(entry.fingerprint.as_str())
        .bind(&entry.source)
        .bind(entry.payload.to_string())
        .bind(to_millis(entry.created_at))
        .bind(to_millis(processed_at))
        .bind(i64::from(entry.attempts))
        .bind(response.to_string())
        .execute(executor)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Finds a history entry by fingerprint.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn find_by_fingerprint(
        &self,
        fingerprint: &Fingerprint,
    ) -> Result<Option<HistoryEntry>> {
        let entry = sqlx::query_as::<_, HistoryEntry>(&format!(
            "SELECT {COLUMNS} FROM history WHERE fingerprint = ?"
        ))
        .bind(fingerprint.as_str())
        .fetch_optional(&*self.pool)
        .await?;

        Ok(entry)
    }

    /// Lists the most recently processed entries first.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn list_recent(&self, limit: u32) -> Result<Vec<HistoryEntry>> {
        let entries = sqlx::query_as::<_, HistoryEntry>(&format!(
            "SELECT {COLUMNS} FROM history ORDER BY processed_at DESC, id DESC LIMIT ?"
        ))
        .bind(i64::from(limit))
        .fetch_all(&*self.pool)
        .await?;

        Ok(entries)
    }

    /// Counts history entries.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn count(&self) -> Result<u64> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM history").fetch_one(&*self.pool).await?;

        Ok(u64::try_from(count).unwrap_or(0))
    }
}
