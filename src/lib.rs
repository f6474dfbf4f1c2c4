//! # Event Replicator
//!
//! A read-only local replica of an upstream, position-ordered event log.
//!
//! ## Architecture
//!
//! The replica catches up from the log's history over HTTP, then follows
//! newly published records on a Redis Streams topic. Both paths feed one
//! ingress writer, and position queries wait on records that have not
//! arrived yet:
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────────────────┐
//! │                             event-replicator                              │
//! │                                                                           │
//! │  ┌──────────────────┐                                                     │
//! │  │ HistorySource    │──┐                                                  │
//! │  │ (HTTP NDJSON)    │  │   ┌───────────────┐    ┌──────────────────────┐  │
//! │  └──────────────────┘  ├──►│ IngressWriter │───►│ EventStore (SQLite)  │  │
//! │  ┌──────────────────┐  │   │ put → mark →  │    └──────────────────────┘  │
//! │  │ LiveBus          │──┘   │ notify        │               ▲              │
//! │  │ (consumer group) │      └───────┬───────┘               │              │
//! │  └──────────────────┘              │ fire                  │ get          │
//! │                                    ▼                       │              │
//! │                           ┌────────────────┐     ┌──────────────────┐     │
//! │                           │ WaiterRegistry │◄────│ ReplicaReader    │     │
//! │                           └────────────────┘     │ get_position(p)  │     │
//! │                                                  └──────────────────┘     │
//! └───────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Catch Up, Then Tail
//!
//! 1. **Bind**: the live subscription is created first, so nothing published
//!    during backfill is missed
//! 2. **Backfill**: the full history is replayed; any failure restarts it
//!    from the beginning after a fixed delay
//! 3. **Tail**: live deliveries are stored as they arrive, before, during
//!    and after backfill
//!
//! ## Usage
//!
//! ```rust,no_run
//! use event_replicator::{Replicator, ReplicatorConfig};
//!
//! #[tokio::main]
//! async fn main() -> event_replicator::Result<()> {
//!     let mut config = ReplicatorConfig::default();
//!     config.backfill.url = "http://eventstore/".into();
//!
//!     let mut replicator = Replicator::open(config).await?;
//!     replicator.start().await?;
//!     replicator.ready().await?;
//!
//!     let record = replicator.get_position(0).await?;
//!     println!("{}", record.event);
//!
//!     replicator.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod bus;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod history;
pub mod ingress;
pub mod metrics;
pub mod record;
pub mod resilience;
pub mod sqlite_store;
pub mod store;
pub mod waiters;

// Re-exports for convenience
pub use bus::{Delivery, LiveBus, LiveSubscription, RedisBus, RedisSubscription};
pub use config::{BackfillConfig, BusConfig, ReplicatorConfig, StoreConfig};
pub use coordinator::{
    BackfillOutcome, HealthCheck, ReplicaReader, Replicator, ReplicatorState, BACKFILL_RETRY_DELAY,
};
pub use error::{ReplicationError, Result};
pub use history::{HistorySource, HttpHistorySource, LineSplitter};
pub use ingress::{IngestOutcome, IngestSource, IngressWriter, MarkChange};
pub use record::EventRecord;
pub use sqlite_store::SqliteEventStore;
pub use store::{EventStore, MemoryEventStore};
