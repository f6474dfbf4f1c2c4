//! Configuration for the event replicator.
//!
//! Configuration is passed to [`Replicator::open()`](crate::Replicator::open)
//! or [`Replicator::with_components()`](crate::Replicator::with_components)
//! and can be built in code or deserialized from YAML/JSON.
//!
//! # Quick Start
//!
//! ```rust
//! use event_replicator::config::ReplicatorConfig;
//!
//! let mut config = ReplicatorConfig::default();
//! config.backfill.url = "http://eventstore/".into();
//! config.bus.redis_url = "redis://bus:6379".into();
//! config.bus.topic = "events".into();
//! assert!(config.validate().is_ok());
//! ```
//!
//! # Configuration Structure
//!
//! ```text
//! ReplicatorConfig
//! ├── backfill: BackfillConfig   # Where history comes from
//! │   ├── url                    # GET endpoint, NDJSON body
//! │   └── connect_timeout
//! ├── bus: BusConfig             # Where live events come from
//! │   ├── redis_url
//! │   ├── topic                  # Stream key every producer appends to
//! │   ├── group_prefix           # Per-process consumer group = prefix-<uuid>
//! │   ├── payload_field
//! │   ├── block_timeout
//! │   └── batch_size
//! └── store: StoreConfig         # Local copy
//!     ├── sqlite_path
//!     └── durable_writes
//! ```
//!
//! # YAML Example
//!
//! ```yaml
//! backfill:
//!   url: "http://eventstore/"
//!
//! bus:
//!   redis_url: "redis://bus:6379"
//!   topic: "events"
//!
//! store:
//!   sqlite_path: "/var/lib/replica/events.db"
//!   durable_writes: true
//! ```

use crate::error::{ReplicationError, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

// ═══════════════════════════════════════════════════════════════════════════════
// Top-level config
// ═══════════════════════════════════════════════════════════════════════════════

/// The top-level config object.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReplicatorConfig {
    /// Historical backfill source.
    #[serde(default)]
    pub backfill: BackfillConfig,

    /// Live publish/subscribe bus.
    #[serde(default)]
    pub bus: BusConfig,

    /// Local event store.
    #[serde(default)]
    pub store: StoreConfig,
}

impl ReplicatorConfig {
    /// Create a config for tests: in-memory SQLite and a short block timeout.
    pub fn for_testing() -> Self {
        Self {
            backfill: BackfillConfig::default(),
            bus: BusConfig {
                block_timeout: "100ms".to_string(),
                ..Default::default()
            },
            store: StoreConfig::in_memory(),
        }
    }

    /// Check the config for values that can never work.
    pub fn validate(&self) -> Result<()> {
        if self.backfill.url.trim().is_empty() {
            return Err(ReplicationError::Config("backfill.url is empty".into()));
        }
        parse_duration("backfill.connect_timeout", &self.backfill.connect_timeout)?;

        if self.bus.redis_url.trim().is_empty() {
            return Err(ReplicationError::Config("bus.redis_url is empty".into()));
        }
        if self.bus.topic.trim().is_empty() {
            return Err(ReplicationError::Config("bus.topic is empty".into()));
        }
        if self.bus.payload_field.is_empty() {
            return Err(ReplicationError::Config("bus.payload_field is empty".into()));
        }
        if self.bus.batch_size == 0 {
            return Err(ReplicationError::Config("bus.batch_size must be > 0".into()));
        }
        parse_duration("bus.block_timeout", &self.bus.block_timeout)?;

        if self.store.sqlite_path.trim().is_empty() {
            return Err(ReplicationError::Config("store.sqlite_path is empty".into()));
        }
        Ok(())
    }
}

fn parse_duration(name: &str, value: &str) -> Result<Duration> {
    humantime::parse_duration(value)
        .map_err(|e| ReplicationError::Config(format!("{}: invalid duration '{}': {}", name, value, e)))
}

// ═══════════════════════════════════════════════════════════════════════════════
// BackfillConfig: history endpoint
// ═══════════════════════════════════════════════════════════════════════════════

/// Backfill (HTTP history replay) configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackfillConfig {
    /// GET endpoint serving the full history as newline-delimited JSON.
    #[serde(default = "default_backfill_url")]
    pub url: String,

    /// TCP connect timeout for the history request.
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout: String,
}

fn default_backfill_url() -> String {
    "http://localhost/".to_string()
}

fn default_connect_timeout() -> String {
    "10s".to_string()
}

impl Default for BackfillConfig {
    fn default() -> Self {
        Self {
            url: default_backfill_url(),
            connect_timeout: default_connect_timeout(),
        }
    }
}

impl BackfillConfig {
    /// Parse `connect_timeout`, falling back to 10 seconds.
    pub fn connect_timeout_duration(&self) -> Duration {
        humantime::parse_duration(&self.connect_timeout).unwrap_or(Duration::from_secs(10))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// BusConfig: live subscription
// ═══════════════════════════════════════════════════════════════════════════════

/// Live bus (Redis Streams) configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusConfig {
    /// Redis URL of the bus.
    #[serde(default = "default_redis_url")]
    pub redis_url: String,

    /// Stream key the producer publishes every event to.
    #[serde(default = "default_topic")]
    pub topic: String,

    /// Prefix for this replica's consumer group. A fresh `prefix-<uuid>`
    /// group is created on every start.
    #[serde(default = "default_group_prefix")]
    pub group_prefix: String,

    /// Stream entry field holding the JSON record.
    #[serde(default = "default_payload_field")]
    pub payload_field: String,

    /// XREADGROUP block timeout as a duration string (e.g. "5s").
    #[serde(default = "default_block_timeout")]
    pub block_timeout: String,

    /// Maximum entries fetched per XREADGROUP.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
}

fn default_redis_url() -> String {
    "redis://localhost:6379".to_string()
}

fn default_topic() -> String {
    "events".to_string()
}

fn default_group_prefix() -> String {
    "replica".to_string()
}

fn default_payload_field() -> String {
    "payload".to_string()
}

fn default_block_timeout() -> String {
    "5s".to_string()
}

fn default_batch_size() -> usize {
    100
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            redis_url: default_redis_url(),
            topic: default_topic(),
            group_prefix: default_group_prefix(),
            payload_field: default_payload_field(),
            block_timeout: default_block_timeout(),
            batch_size: default_batch_size(),
        }
    }
}

impl BusConfig {
    /// Parse the block_timeout string to a Duration.
    pub fn block_timeout_duration(&self) -> Duration {
        humantime::parse_duration(&self.block_timeout).unwrap_or(Duration::from_secs(5))
    }

    /// Build a unique consumer group name for this process start.
    pub fn fresh_group_name(&self) -> String {
        format!("{}-{}", self.group_prefix, uuid::Uuid::new_v4())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// StoreConfig: local persistence
// ═══════════════════════════════════════════════════════════════════════════════

/// Event store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Path to the SQLite database holding the local copy.
    #[serde(default = "default_sqlite_path")]
    pub sqlite_path: String,

    /// fsync every write (`synchronous = FULL`) instead of `NORMAL`.
    #[serde(default)]
    pub durable_writes: bool,
}

fn default_sqlite_path() -> String {
    "/tmp/eventreplicator.db".to_string()
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            sqlite_path: default_sqlite_path(),
            durable_writes: false,
        }
    }
}

impl StoreConfig {
    /// Create an in-memory config for testing.
    pub fn in_memory() -> Self {
        Self {
            sqlite_path: ":memory:".to_string(),
            durable_writes: false,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════
