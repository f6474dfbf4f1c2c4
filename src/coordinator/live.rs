//! Live tail: consume bus deliveries for the life of the replicator.
//!
//! Per delivery:
//!
//! ```text
//! decode ──(fails)──→ ack, drop, count       (never stored, mark untouched)
//!    │
//!    ▼
//! ingest ──(store fails)──→ log error         (the only record of the loss)
//!    │                         │
//!    ▼                         ▼
//!   ack ◄──────────────────────┘
//! ```
//!
//! Deliveries are acknowledged whatever the ingest outcome. Bus errors (read
//! or ack) back off on the daemon schedule and retry forever; the
//! subscription handles reconnection and redelivery of unacked entries.
//!
//! On shutdown the loop stops reading and closes the subscription before
//! returning.

use crate::bus::{Delivery, LiveSubscription};
use crate::ingress::{IngestSource, IngressWriter};
use crate::metrics;
use crate::record;
use crate::resilience::{Backoff, RetryConfig};
use crate::store::EventStore;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, error, info, info_span, warn, Instrument};

use super::wait_for_shutdown;

/// Running totals for the live tail.
#[derive(Debug, Default)]
pub struct LiveCounters {
    pub delivered: AtomicU64,
    pub stored: AtomicU64,
    pub dropped: AtomicU64,
    pub store_failures: AtomicU64,
    pub ack_failures: AtomicU64,
}

/// Run the live loop until shutdown is signaled.
pub async fn run_live<S: EventStore, L: LiveSubscription>(
    mut subscription: L,
    writer: IngressWriter<S>,
    retry_config: RetryConfig,
    counters: Arc<LiveCounters>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let span = info_span!("live", subscription = %subscription.name());

    async move {
        info!("Starting live tail");
        let mut backoff = Backoff::new(retry_config);

        loop {
            let batch = tokio::select! {
                biased;
                _ = wait_for_shutdown(&mut shutdown_rx) => break,
                batch = subscription.next() => batch,
            };

            let deliveries = match batch {
                Ok(deliveries) => deliveries,
                Err(e) => {
                    metrics::record_bus_error("read");
                    let delay = backoff.next_delay();
                    warn!(
                        error = %e,
                        attempt = backoff.attempts(),
                        retry_in_ms = delay.as_millis() as u64,
                        "Live read failed, backing off"
                    );
                    if sleep_or_shutdown(delay, &mut shutdown_rx).await {
                        break;
                    }
                    continue;
                }
            };

            let mut ack_failed = false;
            for delivery in deliveries {
                if !handle_delivery(&mut subscription, &writer, &counters, delivery).await {
                    ack_failed = true;
                }
            }

            if ack_failed {
                let delay = backoff.next_delay();
                warn!(
                    attempt = backoff.attempts(),
                    retry_in_ms = delay.as_millis() as u64,
                    "Acknowledgement failed, backing off"
                );
                if sleep_or_shutdown(delay, &mut shutdown_rx).await {
                    break;
                }
            } else {
                backoff.reset();
            }
        }

        info!(
            delivered = counters.delivered.load(Ordering::Relaxed),
            dropped = counters.dropped.load(Ordering::Relaxed),
            "Live tail stopping"
        );

        if let Err(e) = subscription.close().await {
            warn!(error = %e, "Failed to close live subscription");
        }
    }
    .instrument(span)
    .await
}

/// Decode, ingest, ack. Returns false if the ack failed.
async fn handle_delivery<S: EventStore, L: LiveSubscription>(
    subscription: &mut L,
    writer: &IngressWriter<S>,
    counters: &LiveCounters,
    delivery: Delivery,
) -> bool {
    counters.delivered.fetch_add(1, Ordering::Relaxed);
    let Delivery { tag, payload } = delivery;

    match record::decode(&payload) {
        Ok(record) => {
            let pos = record.pos;
            match writer.ingest(record, IngestSource::Live).await {
                Ok(outcome) => {
                    counters.stored.fetch_add(1, Ordering::Relaxed);
                    debug!(pos, tag = %tag, mark = ?outcome.mark, woken = outcome.woken, "Live record stored");
                }
                Err(e) => {
                    counters.store_failures.fetch_add(1, Ordering::Relaxed);
                    metrics::record_error("live", e.kind());
                    error!(pos, tag = %tag, error = %e, "Failed to store live record; acknowledging anyway");
                }
            }
        }
        Err(e) => {
            counters.dropped.fetch_add(1, Ordering::Relaxed);
            metrics::record_decode_failure("live");
            warn!(tag = %tag, bytes = payload.len(), error = %e, "Dropping undecodable live message");
        }
    }

    match subscription.ack(tag.clone()).await {
        Ok(()) => {
            metrics::record_live_ack("success");
            true
        }
        Err(e) => {
            counters.ack_failures.fetch_add(1, Ordering::Relaxed);
            metrics::record_live_ack("failure");
            metrics::record_bus_error("ack");
            warn!(tag = %tag, error = %e, "Failed to acknowledge live message");
            false
        }
    }
}

/// Returns true if shutdown arrived first.
async fn sleep_or_shutdown(
    delay: std::time::Duration,
    shutdown_rx: &mut watch::Receiver<bool>,
) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(delay) => false,
        _ = wait_for_shutdown(shutdown_rx) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::BusFuture;
    use crate::error::ReplicationError;
    use crate::ingress::HighWaterMark;
    use crate::store::MemoryEventStore;
    use crate::waiters::WaiterRegistry;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::time::Duration;

    /// Replays scripted batches, then idles. Records acks.
    struct ScriptedSubscription {
        batches: VecDeque<std::result::Result<Vec<Delivery>, String>>,
        acked: Arc<Mutex<Vec<String>>>,
        closed: Arc<Mutex<bool>>,
        fail_acks: bool,
    }

    impl LiveSubscription for ScriptedSubscription {
        fn next(&mut self) -> BusFuture<'_, Vec<Delivery>> {
            let next = self.batches.pop_front();
            Box::pin(async move {
                match next {
                    Some(Ok(batch)) => Ok(batch),
                    Some(Err(msg)) => Err(ReplicationError::redis_msg("XREADGROUP", msg)),
                    None => {
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Ok(Vec::new())
                    }
                }
            })
        }

        fn ack(&mut self, tag: String) -> BusFuture<'_, ()> {
            Box::pin(async move {
                if self.fail_acks {
                    return Err(ReplicationError::redis_msg("XACK", "broken pipe"));
                }
                self.acked.lock().unwrap().push(tag);
                Ok(())
            })
        }

        fn close(&mut self) -> BusFuture<'_, ()> {
            Box::pin(async move {
                *self.closed.lock().unwrap() = true;
                Ok(())
            })
        }

        fn name(&self) -> &str {
            "scripted"
        }
    }

    fn payload(pos: u64) -> Vec<u8> {
        format!("{{\"pos\":{},\"time\":\"2024-05-01T12:00:00Z\",\"event\":\"x\"}}", pos).into_bytes()
    }

    struct Harness {
        store: Arc<MemoryEventStore>,
        writer: IngressWriter<MemoryEventStore>,
        acked: Arc<Mutex<Vec<String>>>,
        closed: Arc<Mutex<bool>>,
        counters: Arc<LiveCounters>,
    }

    fn harness() -> Harness {
        let store = Arc::new(MemoryEventStore::new());
        let writer = IngressWriter::new(
            Arc::clone(&store),
            Arc::new(HighWaterMark::new()),
            Arc::new(WaiterRegistry::new()),
        );
        Harness {
            store,
            writer,
            acked: Arc::new(Mutex::new(Vec::new())),
            closed: Arc::new(Mutex::new(false)),
            counters: Arc::new(LiveCounters::default()),
        }
    }

    impl Harness {
        fn subscription(
            &self,
            batches: Vec<std::result::Result<Vec<Delivery>, String>>,
            fail_acks: bool,
        ) -> ScriptedSubscription {
            ScriptedSubscription {
                batches: batches.into(),
                acked: Arc::clone(&self.acked),
                closed: Arc::clone(&self.closed),
                fail_acks,
            }
        }

        async fn run_for(&self, sub: ScriptedSubscription, duration: Duration) {
            let (tx, rx) = watch::channel(false);
            let handle = tokio::spawn(run_live(
                sub,
                self.writer.clone(),
                RetryConfig::testing(),
                Arc::clone(&self.counters),
                rx,
            ));
            tokio::time::sleep(duration).await;
            tx.send(true).unwrap();
            handle.await.unwrap();
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_live_stores_and_acks() {
        let h = harness();
        let sub = h.subscription(
            vec![Ok(vec![Delivery::new("1-0", payload(0)), Delivery::new("2-0", payload(1))])],
            false,
        );
        h.run_for(sub, Duration::from_secs(1)).await;

        assert_eq!(h.store.positions().await, vec![0, 1]);
        assert_eq!(h.writer.high_water_mark(), Some(1));
        assert_eq!(*h.acked.lock().unwrap(), vec!["1-0", "2-0"]);
        assert!(*h.closed.lock().unwrap());
        assert_eq!(h.counters.stored.load(Ordering::Relaxed), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_live_malformed_acked_and_dropped() {
        let h = harness();
        let sub = h.subscription(
            vec![Ok(vec![
                Delivery::new("1-0", payload(0)),
                Delivery::new("2-0", b"{\"test\":\"test\"}".to_vec()),
                Delivery::new("3-0", Vec::new()),
                Delivery::new("4-0", payload(1)),
            ])],
            false,
        );
        h.run_for(sub, Duration::from_secs(1)).await;

        assert_eq!(h.store.positions().await, vec![0, 1]);
        assert_eq!(h.acked.lock().unwrap().len(), 4);
        assert_eq!(h.counters.dropped.load(Ordering::Relaxed), 2);
        assert_eq!(h.counters.delivered.load(Ordering::Relaxed), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_live_store_failure_still_acks() {
        let h = harness();
        h.store.fail_puts(true);
        let sub = h.subscription(vec![Ok(vec![Delivery::new("1-0", payload(5))])], false);
        h.run_for(sub, Duration::from_secs(1)).await;

        assert!(h.store.is_empty().await);
        assert_eq!(h.writer.high_water_mark(), None);
        assert_eq!(*h.acked.lock().unwrap(), vec!["1-0"]);
        assert_eq!(h.counters.store_failures.load(Ordering::Relaxed), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_live_read_error_backs_off_and_recovers() {
        let h = harness();
        let sub = h.subscription(
            vec![
                Err("connection reset".into()),
                Err("connection reset".into()),
                Ok(vec![Delivery::new("9-0", payload(3))]),
            ],
            false,
        );
        h.run_for(sub, Duration::from_secs(5)).await;

        assert_eq!(h.store.positions().await, vec![3]);
        assert_eq!(*h.acked.lock().unwrap(), vec!["9-0"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_live_ack_failure_keeps_running() {
        let h = harness();
        let sub = h.subscription(vec![Ok(vec![Delivery::new("1-0", payload(0))])], true);
        h.run_for(sub, Duration::from_secs(1)).await;

        assert_eq!(h.store.positions().await, vec![0]);
        assert_eq!(h.counters.ack_failures.load(Ordering::Relaxed), 1);
        assert!(*h.closed.lock().unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_live_shutdown_during_backoff() {
        let h = harness();
        let sub = h.subscription(vec![Err("down".into())], false);
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(run_live(
            sub,
            h.writer.clone(),
            RetryConfig::daemon(),
            Arc::clone(&h.counters),
            rx,
        ));

        tokio::time::sleep(Duration::from_millis(100)).await;
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_millis(100), handle)
            .await
            .expect("live loop should stop promptly")
            .unwrap();
        assert!(*h.closed.lock().unwrap());
    }
}
