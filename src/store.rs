// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Event store integration trait.
//!
//! Defines what the replicator needs from the key/value engine holding the
//! local copy. Keys are positions (stored as their decimal text), values are
//! [`EventRecord`]s.
//!
//! Two implementations ship with the crate:
//! - [`SqliteEventStore`](crate::sqlite_store::SqliteEventStore) for production
//! - [`MemoryEventStore`] for tests and embedders that don't need durability
//!
//! # Example
//!
//! ```rust,no_run
//! use event_replicator::store::{BoxFuture, EventStore};
//! use event_replicator::EventRecord;
//!
//! struct MyBackend { /* ... */ }
//!
//! impl EventStore for MyBackend {
//!     fn put(&self, _pos: u64, _record: &EventRecord) -> BoxFuture<'_, ()> {
//!         Box::pin(async move { Ok(()) })
//!     }
//!
//!     fn get(&self, _pos: u64) -> BoxFuture<'_, Option<EventRecord>> {
//!         Box::pin(async move { Ok(None) })
//!     }
//! }
//! ```

use crate::record::EventRecord;
use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tokio::sync::RwLock;

/// Result type for store operations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Type alias for boxed async store futures.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = StoreResult<T>> + Send + 'a>>;

/// Simplified error for store operations.
///
/// "Not found" is never an error: `get` returns `Ok(None)` for it.
#[derive(Debug, Clone)]
pub struct StoreError(pub String);

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for StoreError {}

impl From<StoreError> for crate::error::ReplicationError {
    fn from(e: StoreError) -> Self {
        crate::error::ReplicationError::Store(e.0)
    }
}

/// Trait defining what we need from the key/value engine.
///
/// Implementations must allow `put` and `get` to run concurrently, and a
/// repeated `put` of an identical record must be harmless (overwrite).
pub trait EventStore: Send + Sync + 'static {
    /// Durably write `record` under `pos`.
    fn put(&self, pos: u64, record: &EventRecord) -> BoxFuture<'_, ()>;

    /// Point lookup. `Ok(None)` means the position has not been stored yet.
    fn get(&self, pos: u64) -> BoxFuture<'_, Option<EventRecord>>;

    /// Release engine resources.
    ///
    /// Default implementation does nothing.
    fn close(&self) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(async {})
    }
}

/// In-memory ordered store.
///
/// Supports failure injection so the store-failure paths can be exercised.
#[derive(Default)]
pub struct MemoryEventStore {
    entries: RwLock<BTreeMap<u64, EventRecord>>,
    fail_puts: AtomicBool,
    fail_gets: AtomicBool,
    put_count: AtomicUsize,
}

impl MemoryEventStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent `put` fail (or succeed again).
    pub fn fail_puts(&self, fail: bool) {
        self.fail_puts.store(fail, Ordering::SeqCst);
    }

    /// Make every subsequent `get` fail (or succeed again).
    pub fn fail_gets(&self, fail: bool) {
        self.fail_gets.store(fail, Ordering::SeqCst);
    }

    /// Number of successful `put` calls, duplicates included.
    pub fn put_count(&self) -> usize {
        self.put_count.load(Ordering::SeqCst)
    }

    /// Number of distinct stored positions.
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    /// Whether nothing has been stored.
    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    /// Stored positions in ascending order.
    pub async fn positions(&self) -> Vec<u64> {
        self.entries.read().await.keys().copied().collect()
    }
}

impl EventStore for MemoryEventStore {
    fn put(&self, pos: u64, record: &EventRecord) -> BoxFuture<'_, ()> {
        let record = record.clone();
        Box::pin(async move {
            if self.fail_puts.load(Ordering::SeqCst) {
                return Err(StoreError(format!("injected put failure at {}", pos)));
            }
            self.entries.write().await.insert(pos, record);
            self.put_count.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }

    fn get(&self, pos: u64) -> BoxFuture<'_, Option<EventRecord>> {
        Box::pin(async move {
            if self.fail_gets.load(Ordering::SeqCst) {
                return Err(StoreError(format!("injected get failure at {}", pos)));
            }
            Ok(self.entries.read().await.get(&pos).cloned())
        })
    }
}
