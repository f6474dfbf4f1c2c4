// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! SQLite-backed event store.
//!
//! Holds the local copy of the log: one row per position, keyed by the
//! decimal text of `pos`, valued with the JSON record.
//!
//! # Durability
//!
//! The database runs in WAL mode. `durable_writes = false` (the default)
//! uses `synchronous = NORMAL`: a power loss may drop the last few writes,
//! which the next backfill restores. `durable_writes = true` uses
//! `synchronous = FULL`.
//!
//! # SQLite Busy Handling
//!
//! SQLITE_BUSY/SQLITE_LOCKED are retried with capped exponential backoff.
//! Any other error surfaces to the caller straight away.
//!
//! ## Idempotent Writes
//!
//! ```text
//! put(2, r) → INSERT ... ON CONFLICT(key) DO UPDATE SET value = excluded.value
//! put(2, r) → same row, same value (no-op in effect)
//! ```

use crate::config::StoreConfig;
use crate::error::{ReplicationError, Result};
use crate::record::{store_key, EventRecord};
use crate::store::{BoxFuture, EventStore, StoreError};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous,
};
use std::future::Future;
use std::pin::Pin;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Configuration for SQLite busy retry behavior
const SQLITE_RETRY_MAX_ATTEMPTS: u32 = 5;
const SQLITE_RETRY_BASE_DELAY_MS: u64 = 10;
const SQLITE_RETRY_MAX_DELAY_MS: u64 = 500;

/// Check if an error is a retryable SQLite busy/locked error
fn is_sqlite_busy_error(e: &sqlx::Error) -> bool {
    match e {
        sqlx::Error::Database(db_err) => {
            // SQLite error codes: SQLITE_BUSY = 5, SQLITE_LOCKED = 6
            if let Some(code) = db_err.code() {
                return code == "5" || code == "6";
            }
            let msg = db_err.message().to_lowercase();
            msg.contains("database is locked") || msg.contains("database is busy")
        }
        _ => false,
    }
}

/// Execute a database operation with retry on SQLITE_BUSY/SQLITE_LOCKED
async fn execute_with_retry<F, Fut, T>(
    operation_name: &str,
    mut f: F,
) -> std::result::Result<T, sqlx::Error>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::result::Result<T, sqlx::Error>>,
{
    let mut attempts = 0;
    let mut delay_ms = SQLITE_RETRY_BASE_DELAY_MS;

    loop {
        attempts += 1;
        match f().await {
            Ok(result) => {
                if attempts > 1 {
                    debug!(
                        operation = operation_name,
                        attempts,
                        "SQLite operation succeeded after retry"
                    );
                }
                return Ok(result);
            }
            Err(e) if is_sqlite_busy_error(&e) && attempts < SQLITE_RETRY_MAX_ATTEMPTS => {
                warn!(
                    operation = operation_name,
                    attempts,
                    max_attempts = SQLITE_RETRY_MAX_ATTEMPTS,
                    delay_ms,
                    "SQLite busy, retrying"
                );
                crate::metrics::record_store_retry(operation_name);
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                delay_ms = (delay_ms * 2).min(SQLITE_RETRY_MAX_DELAY_MS);
            }
            Err(e) => return Err(e),
        }
    }
}

/// Persistent event store backed by SQLite.
pub struct SqliteEventStore {
    pool: SqlitePool,
    path: String,
}

impl SqliteEventStore {
    /// Open (or create) the store described by `config`.
    pub async fn open(config: &StoreConfig) -> Result<Self> {
        let path = config.sqlite_path.as_str();
        info!(path = %path, durable = config.durable_writes, "Opening event store");

        let url = if path == ":memory:" {
            "sqlite::memory:".to_string()
        } else {
            format!("sqlite://{}?mode=rwc", path)
        };

        let synchronous = if config.durable_writes {
            SqliteSynchronous::Full
        } else {
            SqliteSynchronous::Normal
        };

        let options = SqliteConnectOptions::from_str(&url)
            .map_err(|e| ReplicationError::Config(format!("Invalid SQLite path: {}", e)))?
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(synchronous)
            .create_if_missing(true);

        // An in-memory database lives and dies with its single connection.
        let max_connections = if path == ":memory:" { 1 } else { 4 };

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .min_connections(if path == ":memory:" { 1 } else { 0 })
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS events (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            )
            "#,
        )
        .execute(&pool)
        .await?;

        let existing: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM events")
            .fetch_one(&pool)
            .await?;
        if existing > 0 {
            info!(count = existing, "Event store holds records from a previous run");
        }

        Ok(Self {
            pool,
            path: path.to_string(),
        })
    }

    /// Open a store at a filesystem path with default settings.
    pub async fn open_path(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let config = StoreConfig {
            sqlite_path: path.as_ref().to_string_lossy().to_string(),
            ..Default::default()
        };
        Self::open(&config).await
    }

    /// Number of stored positions.
    pub async fn len(&self) -> Result<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM events")
            .fetch_one(&self.pool)
            .await?;
        Ok(count.max(0) as u64)
    }

    /// Whether the store is empty.
    pub async fn is_empty(&self) -> Result<bool> {
        Ok(self.len().await? == 0)
    }

    /// Get database path (for diagnostics).
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Force flush WAL to main database.
    pub async fn checkpoint(&self) -> Result<()> {
        let pool = &self.pool;
        execute_with_retry("store_checkpoint", || async {
            sqlx::query("PRAGMA wal_checkpoint(TRUNCATE)")
                .execute(pool)
                .await
        })
        .await?;

        debug!("WAL checkpoint complete");
        Ok(())
    }

    async fn put_record(&self, pos: u64, record: &EventRecord) -> std::result::Result<(), StoreError> {
        let key = store_key(pos);
        let value = serde_json::to_string(record)
            .map_err(|e| StoreError(format!("encode record {}: {}", pos, e)))?;
        let pool = &self.pool;

        execute_with_retry("store_put", || async {
            sqlx::query(
                r#"
                INSERT INTO events (key, value)
                VALUES (?, ?)
                ON CONFLICT(key) DO UPDATE SET value = excluded.value
                "#,
            )
            .bind(&key)
            .bind(&value)
            .execute(pool)
            .await
        })
        .await
        .map_err(|e| StoreError(format!("put {}: {}", key, e)))?;

        Ok(())
    }

    async fn get_record(&self, pos: u64) -> std::result::Result<Option<EventRecord>, StoreError> {
        let key = store_key(pos);
        let pool = &self.pool;

        let row: Option<String> = execute_with_retry("store_get", || async {
            sqlx::query_scalar("SELECT value FROM events WHERE key = ?")
                .bind(&key)
                .fetch_optional(pool)
                .await
        })
        .await
        .map_err(|e| StoreError(format!("get {}: {}", key, e)))?;

        match row {
            Some(json) => serde_json::from_str(&json)
                .map(Some)
                .map_err(|e| StoreError(format!("corrupt value at {}: {}", key, e))),
            None => Ok(None),
        }
    }
}

impl EventStore for SqliteEventStore {
    fn put(&self, pos: u64, record: &EventRecord) -> BoxFuture<'_, ()> {
        let record = record.clone();
        Box::pin(async move { self.put_record(pos, &record).await })
    }

    fn get(&self, pos: u64) -> BoxFuture<'_, Option<EventRecord>> {
        Box::pin(async move { self.get_record(pos).await })
    }

    fn close(&self) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(async move {
            if let Err(e) = self.checkpoint().await {
                warn!(error = %e, "Failed to checkpoint WAL on close");
            }
            self.pool.close().await;
            info!("Event store closed");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;
    use tempfile::tempdir;

    fn record(pos: u64) -> EventRecord {
        EventRecord::new(pos, Utc::now(), json!({ "test": "test", "n": pos }))
    }

    #[tokio::test]
    async fn test_store_put_get() {
        let dir = tempdir().unwrap();
        let store = SqliteEventStore::open_path(dir.path().join("events.db")).await.unwrap();

        assert!(store.is_empty().await.unwrap());
        assert!(store.get(0).await.unwrap().is_none());

        let r = record(0);
        store.put(0, &r).await.unwrap();
        assert_eq!(store.get(0).await.unwrap(), Some(r));
        assert_eq!(store.len().await.unwrap(), 1);

        store.close().await;
    }

    #[tokio::test]
    async fn test_store_overwrite_same_position() {
        let dir = tempdir().unwrap();
        let store = SqliteEventStore::open_path(dir.path().join("events.db")).await.unwrap();

        let r = record(7);
        store.put(7, &r).await.unwrap();
        store.put(7, &r).await.unwrap();

        assert_eq!(store.len().await.unwrap(), 1);
        assert_eq!(store.get(7).await.unwrap(), Some(r));
        store.close().await;
    }

    #[tokio::test]
    async fn test_store_persistence_across_reopen() {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("persist.db");
        let r = record(2);

        {
            let store = SqliteEventStore::open_path(&db_path).await.unwrap();
            store.put(2, &r).await.unwrap();
            store.close().await;
        }

        {
            let store = SqliteEventStore::open_path(&db_path).await.unwrap();
            assert_eq!(store.get(2).await.unwrap(), Some(r));
            assert!(store.get(3).await.unwrap().is_none());
            store.close().await;
        }
    }

    #[tokio::test]
    async fn test_store_keys_are_decimal_text() {
        let dir = tempdir().unwrap();
        let store = SqliteEventStore::open_path(dir.path().join("keys.db")).await.unwrap();
        store.put(10, &record(10)).await.unwrap();
        store.put(2, &record(2)).await.unwrap();

        let keys: Vec<String> = sqlx::query_scalar("SELECT key FROM events ORDER BY key")
            .fetch_all(&store.pool)
            .await
            .unwrap();
        assert_eq!(keys, vec!["10".to_string(), "2".to_string()]);

        let raw: String = sqlx::query_scalar("SELECT value FROM events WHERE key = '10'")
            .fetch_one(&store.pool)
            .await
            .unwrap();
        let decoded = crate::record::decode(raw.as_bytes()).unwrap();
        assert_eq!(decoded.pos, 10);
        store.close().await;
    }

    #[tokio::test]
    async fn test_store_in_memory() {
        let store = SqliteEventStore::open(&StoreConfig::in_memory()).await.unwrap();
        store.put(1, &record(1)).await.unwrap();
        assert!(store.get(1).await.unwrap().is_some());
        assert_eq!(store.path(), ":memory:");
    }

    #[tokio::test]
    async fn test_store_durable_writes() {
        let dir = tempdir().unwrap();
        let config = StoreConfig {
            sqlite_path: dir.path().join("durable.db").to_string_lossy().to_string(),
            durable_writes: true,
        };
        let store = SqliteEventStore::open(&config).await.unwrap();
        store.put(0, &record(0)).await.unwrap();
        store.checkpoint().await.unwrap();
        store.close().await;
    }

    #[tokio::test]
    async fn test_store_corrupt_value_is_error_not_missing() {
        let dir = tempdir().unwrap();
        let store = SqliteEventStore::open_path(dir.path().join("corrupt.db")).await.unwrap();
        sqlx::query("INSERT INTO events (key, value) VALUES ('5', 'garbage')")
            .execute(&store.pool)
            .await
            .unwrap();

        let err = store.get(5).await.unwrap_err();
        assert!(err.to_string().contains("corrupt value"));
        store.close().await;
    }

    #[tokio::test]
    async fn test_execute_with_retry_succeeds_immediately() {
        let result: std::result::Result<i32, sqlx::Error> =
            execute_with_retry("test", || async { Ok(42) }).await;
        assert_eq!(result.unwrap(), 42);
    }

    #[tokio::test]
    async fn test_execute_with_retry_fails_on_non_busy_error() {
        let result: std::result::Result<i32, sqlx::Error> =
            execute_with_retry("test", || async { Err(sqlx::Error::RowNotFound) }).await;
        assert!(matches!(result, Err(sqlx::Error::RowNotFound)));
    }

    #[test]
    fn test_is_sqlite_busy_error_row_not_found() {
        assert!(!is_sqlite_busy_error(&sqlx::Error::RowNotFound));
    }

    #[test]
    fn test_is_sqlite_busy_error_pool_timed_out() {
        assert!(!is_sqlite_busy_error(&sqlx::Error::PoolTimedOut));
    }
}
