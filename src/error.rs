// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Error types for the event replicator.
//!
//! Errors are categorized by their source (bus, backfill transport, store)
//! and carry enough context to be useful in a log line.
//!
//! # Error Categories
//!
//! | Error Type | Handled by | Description |
//! |------------|------------|-------------|
//! | `Redis` | live loop backs off, reads again | Bus command failed (network, timeout, dropped connection) |
//! | `BusConnection` | `start()` / `open()` fail | Could not establish the bus connection |
//! | `Backfill` | backfill restarts after the fixed delay | History endpoint unreachable, bad status, body read failed |
//! | `Store` | backfill restarts; live acks and moves on | Event store put/get failed |
//! | `Database` | `open()` fails | SQLite store could not be opened |
//! | `Decode` | backfill restarts; live drops the message | Malformed event record |
//! | `Config` | `open()` fails | Configuration invalid |
//! | `InvalidState` | returned to the caller | Replicator lifecycle misuse |
//! | `Shutdown` | returned to waiting queries | Replicator is shutting down |
//!
//! No error stops a running replicator. Backfill treats every failure the
//! same way, including a malformed history line: the whole attempt starts
//! over.

use thiserror::Error;

/// Result type alias for replicator operations.
pub type Result<T> = std::result::Result<T, ReplicationError>;

/// Errors that can occur while replicating or querying.
#[derive(Error, Debug)]
pub enum ReplicationError {
    /// Redis command error on the live bus.
    #[error("Redis error ({operation}): {message}")]
    Redis {
        operation: String,
        message: String,
        #[source]
        source: Option<redis::RedisError>,
    },

    /// The bus connection could not be established.
    #[error("Bus connection error ({url}): {message}")]
    BusConnection { url: String, message: String },

    /// The history endpoint failed: connect error, non-2xx status, or a
    /// broken body stream.
    #[error("Backfill transport error ({url}): {message}")]
    Backfill { url: String, message: String },

    /// An event store operation failed.
    ///
    /// The ingress writer never retries these; the calling path decides.
    #[error("Event store error: {0}")]
    Store(String),

    /// SQLite error while opening or managing the event store.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A payload could not be decoded as an event record.
    #[error("Decode error: {0}")]
    Decode(String),

    /// Invalid or missing configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Lifecycle violation (e.g. `start()` on a running replicator).
    #[error("Invalid state: expected {expected}, got {actual}")]
    InvalidState { expected: String, actual: String },

    /// Shutdown in progress.
    ///
    /// Returned to queries that were still waiting when the replicator
    /// shut down.
    #[error("Shutdown in progress")]
    Shutdown,
}

impl ReplicationError {
    /// Create a Redis error from a `redis::RedisError`.
    pub fn redis(operation: impl Into<String>, source: redis::RedisError) -> Self {
        Self::Redis {
            operation: operation.into(),
            message: source.to_string(),
            source: Some(source),
        }
    }

    /// Create a Redis error without source.
    pub fn redis_msg(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Redis {
            operation: operation.into(),
            message: message.into(),
            source: None,
        }
    }

    /// Create a backfill transport error.
    pub fn backfill(url: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Backfill {
            url: url.into(),
            message: message.into(),
        }
    }

    /// Short label for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Redis { .. } => "redis",
            Self::BusConnection { .. } => "bus_connection",
            Self::Backfill { .. } => "backfill",
            Self::Store(_) => "store",
            Self::Database(_) => "database",
            Self::Decode(_) => "decode",
            Self::Config(_) => "config",
            Self::InvalidState { .. } => "invalid_state",
            Self::Shutdown => "shutdown",
        }
    }

    /// Whether this is a Redis `NOGROUP` reply (consumer group vanished).
    pub fn is_missing_group(&self) -> bool {
        match self {
            Self::Redis { source: Some(e), .. } => e.code() == Some("NOGROUP"),
            Self::Redis { message, .. } => message.contains("NOGROUP"),
            _ => false,
        }
    }
}

impl From<redis::RedisError> for ReplicationError {
    fn from(e: redis::RedisError) -> Self {
        Self::redis("unknown", e)
    }
}

impl From<serde_json::Error> for ReplicationError {
    fn from(e: serde_json::Error) -> Self {
        Self::Decode(e.to_string())
    }
}
