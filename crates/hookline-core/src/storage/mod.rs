//! SQLite persistence for the pending and history sets.
//!
//! All queue state lives in one database file so that accepted webhooks,
//! their retry bookkeeping, and their handled results survive restarts.
//! Every durable change goes through these repositories.

use std::{path::Path, str::FromStr, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous},
    SqlitePool,
};
use tracing::{debug, info};

pub mod history;
pub mod pending;

use crate::{
    error::{CoreError, Result},
    models::{Fingerprint, PendingEntry},
};

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS pending (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        fingerprint TEXT NOT NULL UNIQUE,
        source TEXT NOT NULL,
        payload TEXT NOT NULL,
        created_at INTEGER NOT NULL,
        attempts INTEGER NOT NULL DEFAULT 0,
        last_error TEXT NOT NULL DEFAULT '',
        next_attempt_at INTEGER NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_pending_dispatch ON pending(attempts, created_at)",
    "CREATE INDEX IF NOT EXISTS idx_pending_next_attempt ON pending(next_attempt_at)",
    r#"
    CREATE TABLE IF NOT EXISTS history (
        id INTEGER PRIMARY KEY,
        fingerprint TEXT NOT NULL UNIQUE,
        source TEXT NOT NULL,
        payload TEXT NOT NULL,
        created_at INTEGER NOT NULL,
        processed_at INTEGER NOT NULL,
        attempts INTEGER NOT NULL,
        response TEXT NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_history_processed_at ON history(processed_at)",
];

/// Container for the queue repositories sharing one connection pool.
#[derive(Clone)]
pub struct Storage {
    /// Repository for the pending set.
    pub pending: Arc<pending::Repository>,

    /// Repository for the history set.
    pub history: Arc<history::Repository>,

    pool: Arc<SqlitePool>,
}

impl Storage {
    /// Opens (creating if needed) the database file at `path`.
    ///
    /// The parent directory is created when missing. The database runs in
    /// WAL mode with `synchronous = FULL` so acknowledged writes survive a
    /// crash.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Database` if the directory or database cannot be
    /// created or the schema cannot be applied.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                CoreError::Database(format!("failed to create {}: {e}", parent.display()))
            })?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Full)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new().max_connections(4).connect_with(options).await?;

        info!(path = %path.display(), "opened queue database");
        Self::new(pool).await
    }

    /// Opens a transient in-memory database.
    ///
    /// The pool is pinned to a single connection that is never recycled,
    /// since every SQLite in-memory connection is a separate database.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Database` if the schema cannot be applied.
    pub async fn open_in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        Self::new(pool).await
    }

    /// Wraps an existing pool, applying the schema.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Database` if the schema cannot be applied.
    pub async fn new(pool: SqlitePool) -> Result<Self> {
        let pool = Arc::new(pool);
        let storage = Self {
            pending: Arc::new(pending::Repository::new(pool.clone())),
            history: Arc::new(history::Repository::new(pool.clone())),
            pool,
        };
        storage.init_schema().await?;
        Ok(storage)
    }

    async fn init_schema(&self) -> Result<()> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&*self.pool).await?;
        }
        debug!("queue schema ready");
        Ok(())
    }

    /// Returns the shared connection pool.
    pub fn pool(&self) -> Arc<SqlitePool> {
        self.pool.clone()
    }

    /// Reports whether `fingerprint` is present in either set.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn contains(&self, fingerprint: &Fingerprint) -> Result<bool> {
        let found: i64 = sqlx::query_scalar(
            r#"
            SELECT EXISTS (SELECT 1 FROM pending WHERE fingerprint = ?)
                OR EXISTS (SELECT 1 FROM history WHERE fingerprint = ?)
            "#,
        )
        .bind(fingerprint.as_str())
        .bind(fingerprint.as_str())
        .fetch_one(&*self.pool)
        .await?;

        Ok(found != 0)
    }

    /// Moves a handled entry from the pending set to history.
    ///
    /// Both writes commit together. If history already holds the
    /// fingerprint the history row is kept as is and the pending row is
    /// still removed.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::NotFound` if the pending entry no longer exists,
    /// in which case nothing is written.
    pub async fn promote_to_history(
        &self,
        entry: &PendingEntry,
        response: &Value,
        processed_at: DateTime<Utc>,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        let inserted = self.history.insert_in_tx(&mut tx, entry, response, processed_at).await?;
        self.pending.delete_in_tx(&mut tx, entry.id).await?;

        tx.commit().await?;

        if !inserted {
            debug!(
                entry_id = %entry.id,
                fingerprint = %entry.fingerprint,
                "history already held fingerprint; pending entry removed"
            );
        }

        Ok(())
    }

    /// Verifies database connectivity.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Database` if the connection is unhealthy.
    pub async fn health_check(&self) -> Result<()> {
        let _: (i64,) = sqlx::query_as("SELECT 1").fetch_one(&*self.pool).await?;
        Ok(())
    }
}
