// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Ingress writer: the single path into the local copy.
//!
//! Backfill and live delivery both end here. One `ingest` call:
//!
//! ```text
//! store.put(pos, record)        ── failure → Err(Store), nothing else changes
//!        │
//!        ▼
//! high_water_mark.fetch_max(pos)
//!        │
//!        ▼
//! waiters.fire(pos, record)
//! ```
//!
//! The order matters. A query registers its waiter *before* reading the
//! store, and waiters fire only *after* the write landed, so a query either
//! sees the record in its read or is woken by `fire`.

use crate::error::{ReplicationError, Result};
use crate::metrics;
use crate::record::EventRecord;
use crate::store::EventStore;
use crate::waiters::WaiterRegistry;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, trace};

/// Where a record came from. Only used for logs and metric labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestSource {
    Backfill,
    Live,
}

impl IngestSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            IngestSource::Backfill => "backfill",
            IngestSource::Live => "live",
        }
    }
}

impl std::fmt::Display for IngestSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Effect of the write on the high-water mark.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkChange {
    /// `pos` was above the previous mark.
    Advanced,
    /// Duplicate or out-of-order write.
    Unchanged,
}

/// Result of a successful ingest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IngestOutcome {
    pub mark: MarkChange,
    /// Waiters that received the record.
    pub woken: usize,
}

/// Sentinel for "nothing written yet".
const NO_MARK: i64 = -1;

/// Shared high-water mark.
///
/// Starts below zero and only ever moves up.
#[derive(Debug)]
pub struct HighWaterMark(AtomicI64);

impl Default for HighWaterMark {
    fn default() -> Self {
        Self(AtomicI64::new(NO_MARK))
    }
}

impl HighWaterMark {
    pub fn new() -> Self {
        Self::default()
    }

    /// Greatest position written so far, if any.
    pub fn get(&self) -> Option<u64> {
        let raw = self.0.load(Ordering::Acquire);
        u64::try_from(raw).ok()
    }

    /// Whether `pos` is at or below the mark.
    pub fn covers(&self, pos: u64) -> bool {
        self.get().is_some_and(|mark| pos <= mark)
    }

    /// Raise the mark to `pos`. Returns true if it moved.
    pub fn raise(&self, pos: u64) -> bool {
        // Positions above i64::MAX can't be represented; saturate.
        let pos = i64::try_from(pos).unwrap_or(i64::MAX);
        let previous = self.0.fetch_max(pos, Ordering::AcqRel);
        previous < pos
    }
}

/// Writes records to the store, raises the mark and wakes waiters.
pub struct IngressWriter<S: EventStore> {
    store: Arc<S>,
    mark: Arc<HighWaterMark>,
    waiters: Arc<WaiterRegistry>,
}

impl<S: EventStore> Clone for IngressWriter<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            mark: Arc::clone(&self.mark),
            waiters: Arc::clone(&self.waiters),
        }
    }
}

impl<S: EventStore> IngressWriter<S> {
    pub fn new(store: Arc<S>, mark: Arc<HighWaterMark>, waiters: Arc<WaiterRegistry>) -> Self {
        Self {
            store,
            mark,
            waiters,
        }
    }

    /// Persist `record`, then advance the mark, then fire waiters.
    ///
    /// A store failure is returned as [`ReplicationError::Store`] and is not
    /// retried here; the mark and waiters are left untouched.
    pub async fn ingest(&self, record: EventRecord, source: IngestSource) -> Result<IngestOutcome> {
        let start = Instant::now();
        let pos = record.pos;

        if let Err(e) = self.store.put(pos, &record).await {
            metrics::record_ingest(source.as_str(), "failure", start.elapsed());
            return Err(ReplicationError::from(e));
        }

        let mark = if self.mark.raise(pos) {
            metrics::set_high_water_mark(pos);
            MarkChange::Advanced
        } else {
            MarkChange::Unchanged
        };

        let woken = self.waiters.fire(pos, &record);
        metrics::record_waiters_fired(woken);
        metrics::record_ingest(source.as_str(), "success", start.elapsed());

        if mark == MarkChange::Unchanged {
            debug!(pos, source = %source, "Stored record at or below high-water mark");
        } else {
            trace!(pos, source = %source, woken, "Stored record");
        }

        Ok(IngestOutcome { mark, woken })
    }

    /// Current high-water mark.
    pub fn high_water_mark(&self) -> Option<u64> {
        self.mark.get()
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }
}
