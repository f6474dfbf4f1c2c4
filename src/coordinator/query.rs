// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Position queries against the local copy.
//!
//! `get_position(p)` resolves with the record at `p`, waiting for it to
//! arrive if necessary. There is no timeout; drop the future to give up.
//!
//! # Resolution
//!
//! ```text
//! p <= mark? ──yes──→ store.get(p) ──found──→ return
//!     │                    │
//!     no              missing / error
//!     │                    │
//!     ▼                    ▼
//! register waiter for p   (always before the read below)
//!     │
//!     ▼
//! store.get(p) ──found──→ deregister, return
//!     │
//! missing / error
//!     │
//!     ▼
//! await waiter ──record──→ return
//!     │
//! registry closed
//!     ▼
//! Err(Shutdown)
//! ```
//!
//! Registering before the read closes the gap with the ingress writer,
//! which notifies only after its write: either the read sees the record or
//! the waiter is fired.

use crate::error::{ReplicationError, Result};
use crate::ingress::HighWaterMark;
use crate::metrics;
use crate::record::EventRecord;
use crate::store::EventStore;
use crate::waiters::{WaiterId, WaiterRegistry};
use std::sync::Arc;
use tracing::{debug, trace};

/// Cheap, cloneable handle for position queries.
pub struct ReplicaReader<S: EventStore> {
    store: Arc<S>,
    mark: Arc<HighWaterMark>,
    waiters: Arc<WaiterRegistry>,
}

impl<S: EventStore> Clone for ReplicaReader<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            mark: Arc::clone(&self.mark),
            waiters: Arc::clone(&self.waiters),
        }
    }
}

/// Removes the waiter if the query future is dropped before it resolves.
struct WaiterGuard<'a> {
    waiters: &'a WaiterRegistry,
    pos: u64,
    id: WaiterId,
}

impl Drop for WaiterGuard<'_> {
    fn drop(&mut self) {
        // No-op if the waiter already fired.
        self.waiters.deregister(self.pos, self.id);
    }
}

impl<S: EventStore> ReplicaReader<S> {
    pub fn new(store: Arc<S>, mark: Arc<HighWaterMark>, waiters: Arc<WaiterRegistry>) -> Self {
        Self {
            store,
            mark,
            waiters,
        }
    }

    /// Resolve with the record at `pos`, waiting for it if needed.
    ///
    /// Errors only with [`ReplicationError::Shutdown`], when the replicator
    /// shuts down while the query is waiting.
    pub async fn get_position(&self, pos: u64) -> Result<EventRecord> {
        if self.mark.covers(pos) {
            if let Some(record) = self.read(pos).await {
                metrics::record_query("direct");
                return Ok(record);
            }
        }

        let (id, rx) = self.waiters.register(pos);
        let _guard = WaiterGuard {
            waiters: &self.waiters,
            pos,
            id,
        };

        if let Some(record) = self.read(pos).await {
            metrics::record_query("read_after_register");
            return Ok(record);
        }

        trace!(pos, waiter_id = id, "Waiting for position");
        match rx.await {
            Ok(record) => {
                metrics::record_query("waited");
                Ok(record)
            }
            Err(_) => {
                metrics::record_query("shutdown");
                Err(ReplicationError::Shutdown)
            }
        }
    }

    /// Greatest position stored so far.
    pub fn high_water_mark(&self) -> Option<u64> {
        self.mark.get()
    }

    /// Store read with failures treated as "not found".
    async fn read(&self, pos: u64) -> Option<EventRecord> {
        match self.store.get(pos).await {
            Ok(found) => found,
            Err(e) => {
                debug!(pos, error = %e, "Store read failed during query; treating as not found");
                None
            }
        }
    }
}
