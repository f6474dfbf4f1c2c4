//! Waiter registry: queries parked on positions that have not arrived.
//!
//! Each waiter is a `oneshot` sender keyed by position. The ingress writer
//! takes the whole entry for a position after a successful write and sends
//! the record to every live waiter. A query that finds its answer in the
//! store first deregisters its own waiter by id.
//!
//! The mutex is a `std::sync::Mutex` and is never held across an `.await`.

use crate::record::EventRecord;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use tokio::sync::oneshot;
use tracing::trace;

/// Identifies one registration so it can be removed again.
pub type WaiterId = u64;

struct Waiter {
    id: WaiterId,
    tx: oneshot::Sender<EventRecord>,
}

/// Position → pending continuations.
#[derive(Default)]
pub struct WaiterRegistry {
    waiters: Mutex<HashMap<u64, Vec<Waiter>>>,
    next_id: AtomicU64,
    closed: AtomicBool,
}

impl WaiterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register interest in `pos`.
    ///
    /// The receiver resolves with the record once `pos` is ingested, or
    /// errors if the registry is closed first. After [`close`](Self::close)
    /// the receiver errors immediately.
    pub fn register(&self, pos: u64) -> (WaiterId, oneshot::Receiver<EventRecord>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        let mut waiters = self.lock();
        if self.closed.load(Ordering::Acquire) {
            // tx drops here
            return (id, rx);
        }
        waiters.entry(pos).or_default().push(Waiter { id, tx });
        crate::metrics::set_pending_waiters(count(&waiters));
        trace!(pos, waiter_id = id, "Registered waiter");
        (id, rx)
    }

    /// Remove one registration. Returns whether it was still present.
    pub fn deregister(&self, pos: u64, id: WaiterId) -> bool {
        let mut waiters = self.lock();
        let Some(entry) = waiters.get_mut(&pos) else {
            return false;
        };
        let before = entry.len();
        entry.retain(|w| w.id != id);
        let removed = entry.len() != before;
        if entry.is_empty() {
            waiters.remove(&pos);
        }
        crate::metrics::set_pending_waiters(count(&waiters));
        removed
    }

    /// Fire every waiter on `pos` with `record` and drop the entry.
    ///
    /// Waiters whose receiver was dropped are skipped. Returns how many were
    /// actually woken.
    pub fn fire(&self, pos: u64, record: &EventRecord) -> usize {
        let taken = {
            let mut waiters = self.lock();
            let taken = waiters.remove(&pos);
            crate::metrics::set_pending_waiters(count(&waiters));
            taken
        };

        let Some(taken) = taken else {
            return 0;
        };

        let mut woken = 0;
        for waiter in taken {
            if waiter.tx.send(record.clone()).is_ok() {
                woken += 1;
            }
        }
        trace!(pos, woken, "Fired waiters");
        woken
    }

    /// Drop every pending waiter and refuse further registrations.
    ///
    /// Receivers of dropped waiters see a closed channel.
    pub fn close(&self) -> usize {
        let drained = {
            let mut waiters = self.lock();
            self.closed.store(true, Ordering::Release);
            std::mem::take(&mut *waiters)
        };
        crate::metrics::set_pending_waiters(0);
        count(&drained)
    }

    /// Number of registered waiters across all positions.
    pub fn pending(&self) -> usize {
        count(&self.lock())
    }

    /// Number of distinct positions with at least one waiter.
    #[cfg(test)]
    fn pending_positions(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<u64, Vec<Waiter>>> {
        // A panic while holding the lock leaves the map consistent (every
        // mutation is a single insert/remove), so poisoning is ignored.
        self.waiters.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn count(waiters: &HashMap<u64, Vec<Waiter>>) -> usize {
    waiters.values().map(Vec::len).sum()
}
