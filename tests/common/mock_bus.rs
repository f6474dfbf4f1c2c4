//! Channel-backed live bus for testing.
//!
//! Deliveries published on the bus fan out to every bound subscription,
//! like a fanout exchange. Anything published before a subscription is
//! bound is never seen by it.

use super::CallLog;
use event_replicator::bus::{BusFuture, Delivery, LiveBus, LiveSubscription};
use event_replicator::{EventRecord, ReplicationError};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

/// Shared state between the bus handle and its subscriptions.
#[derive(Default)]
struct Shared {
    subscribers: Mutex<Vec<mpsc::UnboundedSender<Delivery>>>,
    acks: Mutex<Vec<String>>,
    next_tag: AtomicU64,
    binds: AtomicUsize,
    closes: AtomicUsize,
    fail_binds: AtomicBool,
    read_failures: AtomicUsize,
    ack_failures: AtomicUsize,
}

/// In-process bus implementing `LiveBus`.
///
/// Supports failure injection:
/// - `fail_binds(true)`: every `bind()` errors
/// - `fail_next_reads(n)`: the next `n` reads error
/// - `fail_next_acks(n)`: the next `n` acks error
#[derive(Clone, Default)]
pub struct ChannelBus {
    shared: Arc<Shared>,
    log: Option<CallLog>,
}

impl ChannelBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record "bind" in `log` whenever a subscription is created.
    pub fn with_log(log: CallLog) -> Self {
        Self {
            shared: Arc::default(),
            log: Some(log),
        }
    }

    /// Publish a record as its JSON payload. Returns the delivery tag.
    pub fn publish(&self, record: &EventRecord) -> String {
        self.publish_raw(record.to_json().unwrap().into_bytes())
    }

    /// Publish raw bytes. Returns the delivery tag.
    pub fn publish_raw(&self, payload: impl Into<Vec<u8>>) -> String {
        let tag = format!("{}-0", self.shared.next_tag.fetch_add(1, Ordering::SeqCst));
        let delivery = Delivery::new(tag.clone(), payload);
        let mut subscribers = self.shared.subscribers.lock().unwrap();
        subscribers.retain(|tx| tx.send(delivery.clone()).is_ok());
        tag
    }

    /// Tags acknowledged so far, in order.
    pub fn acks(&self) -> Vec<String> {
        self.shared.acks.lock().unwrap().clone()
    }

    pub fn ack_count(&self) -> usize {
        self.shared.acks.lock().unwrap().len()
    }

    pub fn bind_count(&self) -> usize {
        self.shared.binds.load(Ordering::SeqCst)
    }

    pub fn close_count(&self) -> usize {
        self.shared.closes.load(Ordering::SeqCst)
    }

    pub fn fail_binds(&self, fail: bool) {
        self.shared.fail_binds.store(fail, Ordering::SeqCst);
    }

    pub fn fail_next_reads(&self, n: usize) {
        self.shared.read_failures.store(n, Ordering::SeqCst);
    }

    pub fn fail_next_acks(&self, n: usize) {
        self.shared.ack_failures.store(n, Ordering::SeqCst);
    }
}

/// Decrement `counter` if positive; true if a failure should be injected.
fn take_failure(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

impl LiveBus for ChannelBus {
    type Subscription = ChannelSubscription;

    fn bind(&self) -> BusFuture<'_, ChannelSubscription> {
        Box::pin(async move {
            if self.shared.fail_binds.load(Ordering::SeqCst) {
                return Err(ReplicationError::BusConnection {
                    url: "channel://test".to_string(),
                    message: "injected bind failure".to_string(),
                });
            }

            let (tx, rx) = mpsc::unbounded_channel();
            self.shared.subscribers.lock().unwrap().push(tx);
            let n = self.shared.binds.fetch_add(1, Ordering::SeqCst);
            if let Some(log) = &self.log {
                log.push("bind");
            }

            Ok(ChannelSubscription {
                name: format!("channel-sub-{}", n),
                rx,
                shared: Arc::clone(&self.shared),
            })
        })
    }
}

/// Subscription half of [`ChannelBus`].
pub struct ChannelSubscription {
    name: String,
    rx: mpsc::UnboundedReceiver<Delivery>,
    shared: Arc<Shared>,
}

impl LiveSubscription for ChannelSubscription {
    fn next(&mut self) -> BusFuture<'_, Vec<Delivery>> {
        Box::pin(async move {
            if take_failure(&self.shared.read_failures) {
                return Err(ReplicationError::redis_msg("XREADGROUP", "injected read failure"));
            }

            match self.rx.recv().await {
                Some(first) => {
                    let mut batch = vec![first];
                    while let Ok(more) = self.rx.try_recv() {
                        batch.push(more);
                    }
                    Ok(batch)
                }
                // Bus handle dropped; behave like an idle stream
                None => futures::future::pending().await,
            }
        })
    }

    fn ack(&mut self, tag: String) -> BusFuture<'_, ()> {
        Box::pin(async move {
            if take_failure(&self.shared.ack_failures) {
                return Err(ReplicationError::redis_msg("XACK", "injected ack failure"));
            }
            self.shared.acks.lock().unwrap().push(tag);
            Ok(())
        })
    }

    fn close(&mut self) -> BusFuture<'_, ()> {
        Box::pin(async move {
            self.rx.close();
            self.shared.closes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }

    fn name(&self) -> &str {
        &self.name
    }
}
