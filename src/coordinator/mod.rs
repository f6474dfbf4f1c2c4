// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Replicator coordinator.
//!
//! The orchestrator that ties together:
//! - The event store via [`crate::store::EventStore`]
//! - The live tail via [`crate::bus::LiveBus`]
//! - Backfill via [`crate::history::HistorySource`]
//! - Position queries via [`ReplicaReader`]
//!
//! # Startup Order
//!
//! ```text
//! start()
//!   1. Connecting   bus.bind()        (failure → Failed, error returned)
//!   2. CatchingUp   spawn backfill    (only after bind confirmed)
//!   3.              spawn live tail   (runs alongside backfill)
//!   ── start() returns ──
//!   4. Running      backfill complete → ready = true
//! ```
//!
//! Binding first means nothing published during backfill is lost: it is
//! either in the history or delivered live (or both; writes are idempotent).

mod backfill;
mod live;
mod query;
mod types;

pub use backfill::{BackfillOutcome, BACKFILL_RETRY_DELAY};
pub use live::LiveCounters;
pub use query::ReplicaReader;
pub use types::{HealthCheck, ReplicatorState};

use crate::bus::{LiveBus, RedisBus};
use crate::config::ReplicatorConfig;
use crate::error::{ReplicationError, Result};
use crate::history::{HistorySource, HttpHistorySource};
use crate::ingress::{HighWaterMark, IngressWriter};
use crate::metrics;
use crate::record::EventRecord;
use crate::resilience::RetryConfig;
use crate::sqlite_store::SqliteEventStore;
use crate::store::EventStore;
use crate::waiters::WaiterRegistry;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// How long each task gets to finish after shutdown is signaled.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Resolves once shutdown is signaled (or the signal sender is gone).
pub(crate) async fn wait_for_shutdown(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            return;
        }
    }
}

/// A catch-up-then-tail replica of an upstream event log.
///
/// Owns its store, bus and history source. Several replicators can live in
/// one process; nothing is global.
pub struct Replicator<S: EventStore, B: LiveBus, H: HistorySource> {
    config: ReplicatorConfig,

    /// Lifecycle state (broadcast to watchers)
    state_tx: Arc<watch::Sender<ReplicatorState>>,
    state_rx: watch::Receiver<ReplicatorState>,

    /// Flips to true once, when backfill completes
    ready_tx: Arc<watch::Sender<bool>>,
    ready_rx: watch::Receiver<bool>,

    store: Arc<S>,
    bus: Arc<B>,
    history: Arc<H>,

    mark: Arc<HighWaterMark>,
    waiters: Arc<WaiterRegistry>,

    backfill_attempts: Arc<AtomicU64>,
    live_counters: Arc<LiveCounters>,

    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,

    /// Backfill and live task handles
    handles: Vec<JoinHandle<()>>,
}

impl Replicator<SqliteEventStore, RedisBus, HttpHistorySource> {
    /// Build a replicator from config: SQLite store, Redis bus, HTTP history.
    ///
    /// Connects to the bus (startup retry schedule) but does not bind;
    /// call [`start()`](Self::start) for that.
    pub async fn open(config: ReplicatorConfig) -> Result<Self> {
        config.validate()?;

        let store = SqliteEventStore::open(&config.store).await?;
        let bus = RedisBus::connect(&config.bus).await?;
        let history = HttpHistorySource::from_config(&config.backfill)?;

        Ok(Self::with_components(
            config,
            Arc::new(store),
            Arc::new(bus),
            Arc::new(history),
        ))
    }
}

impl<S: EventStore, B: LiveBus, H: HistorySource> Replicator<S, B, H> {
    /// Create a replicator from explicit collaborators.
    ///
    /// The replicator starts in `Created` state.
    pub fn with_components(
        config: ReplicatorConfig,
        store: Arc<S>,
        bus: Arc<B>,
        history: Arc<H>,
    ) -> Self {
        let (state_tx, state_rx) = watch::channel(ReplicatorState::Created);
        let (ready_tx, ready_rx) = watch::channel(false);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        Self {
            config,
            state_tx: Arc::new(state_tx),
            state_rx,
            ready_tx: Arc::new(ready_tx),
            ready_rx,
            store,
            bus,
            history,
            mark: Arc::new(HighWaterMark::new()),
            waiters: Arc::new(WaiterRegistry::new()),
            backfill_attempts: Arc::new(AtomicU64::new(0)),
            live_counters: Arc::new(LiveCounters::default()),
            shutdown_tx,
            shutdown_rx,
            handles: Vec::new(),
        }
    }

    /// Get current state.
    pub fn state(&self) -> ReplicatorState {
        *self.state_rx.borrow()
    }

    /// Get a receiver to watch state changes.
    pub fn state_receiver(&self) -> watch::Receiver<ReplicatorState> {
        self.state_rx.clone()
    }

    /// Whether backfill has completed.
    pub fn is_ready(&self) -> bool {
        *self.ready_rx.borrow()
    }

    /// Wait until backfill has completed.
    ///
    /// Returns [`ReplicationError::Shutdown`] if the replicator stops or
    /// fails before becoming ready.
    pub async fn ready(&self) -> Result<()> {
        let mut ready_rx = self.ready_rx.clone();
        let mut state_rx = self.state_rx.clone();

        tokio::select! {
            result = ready_rx.wait_for(|ready| *ready) => {
                if result.is_ok() {
                    return Ok(());
                }
            }
            _ = state_rx.wait_for(|state| state.is_terminal()) => {}
        }

        if self.is_ready() {
            Ok(())
        } else {
            Err(ReplicationError::Shutdown)
        }
    }

    /// Greatest position stored so far, `None` before the first write.
    pub fn high_water_mark(&self) -> Option<u64> {
        self.mark.get()
    }

    /// A cloneable query handle.
    pub fn reader(&self) -> ReplicaReader<S> {
        ReplicaReader::new(
            Arc::clone(&self.store),
            Arc::clone(&self.mark),
            Arc::clone(&self.waiters),
        )
    }

    /// Resolve with the record at `pos`, waiting for it if needed.
    ///
    /// See [`ReplicaReader::get_position`].
    pub async fn get_position(&self, pos: u64) -> Result<EventRecord> {
        self.reader().get_position(pos).await
    }

    /// The store this replicator writes to.
    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn config(&self) -> &ReplicatorConfig {
        &self.config
    }

    /// Health snapshot for monitoring endpoints. No I/O.
    ///
    /// # Example
    ///
    /// ```rust,ignore
    /// let health = replicator.health_check();
    ///
    /// // For /ready endpoint
    /// if health.ready {
    ///     HttpResponse::Ok()
    /// } else {
    ///     HttpResponse::ServiceUnavailable()
    /// }
    /// ```
    pub fn health_check(&self) -> HealthCheck {
        let state = self.state();
        let ready = self.is_ready();
        HealthCheck {
            state,
            ready,
            healthy: ready && state == ReplicatorState::Running,
            high_water_mark: self.mark.get(),
            pending_waiters: self.waiters.pending(),
            backfill_attempts: self.backfill_attempts.load(Ordering::Relaxed),
            live_delivered: self.live_counters.delivered.load(Ordering::Relaxed),
            live_dropped: self.live_counters.dropped.load(Ordering::Relaxed),
            live_store_failures: self.live_counters.store_failures.load(Ordering::Relaxed),
        }
    }

    fn set_state(&self, state: ReplicatorState) {
        let _ = self.state_tx.send(state);
        metrics::set_replicator_state(&state.to_string());
    }

    /// Start replicating.
    ///
    /// Binds the live subscription, then starts backfill and the live tail.
    /// Returns once both tasks are running; use [`ready()`](Self::ready) to
    /// wait for backfill.
    pub async fn start(&mut self) -> Result<()> {
        if self.state() != ReplicatorState::Created {
            return Err(ReplicationError::InvalidState {
                expected: "Created".to_string(),
                actual: self.state().to_string(),
            });
        }

        info!(
            backfill_url = %self.config.backfill.url,
            topic = %self.config.bus.topic,
            "Starting replicator"
        );
        self.set_state(ReplicatorState::Connecting);

        let subscription = match self.bus.bind().await {
            Ok(subscription) => subscription,
            Err(e) => {
                error!(error = %e, "Failed to bind live subscription");
                self.set_state(ReplicatorState::Failed);
                return Err(e);
            }
        };

        self.set_state(ReplicatorState::CatchingUp);
        let writer = IngressWriter::new(
            Arc::clone(&self.store),
            Arc::clone(&self.mark),
            Arc::clone(&self.waiters),
        );

        self.spawn_backfill(writer.clone());
        self.spawn_live(subscription, writer);

        info!("Replicator started; catching up");
        Ok(())
    }

    /// Spawn the backfill task. Marks the replicator ready on completion.
    fn spawn_backfill(&mut self, writer: IngressWriter<S>) {
        let history = Arc::clone(&self.history);
        let attempts = Arc::clone(&self.backfill_attempts);
        let shutdown_rx = self.shutdown_rx.clone();
        let ready_tx = Arc::clone(&self.ready_tx);
        let state_tx = Arc::clone(&self.state_tx);

        let handle = tokio::spawn(async move {
            let outcome =
                backfill::run_backfill(history, writer, attempts, shutdown_rx).await;

            if let BackfillOutcome::Completed { records, attempts } = outcome {
                // send_if_modified keeps readiness single-fire
                ready_tx.send_if_modified(|ready| !std::mem::replace(ready, true));
                let promoted = state_tx.send_if_modified(|state| {
                    if *state == ReplicatorState::CatchingUp {
                        *state = ReplicatorState::Running;
                        true
                    } else {
                        false
                    }
                });
                if promoted {
                    metrics::set_replicator_state("Running");
                }
                info!(records, attempts, "Replica ready; following live tail");
            }
        });

        debug!("Spawned backfill task");
        self.handles.push(handle);
    }

    /// Spawn the live tail task.
    fn spawn_live(&mut self, subscription: B::Subscription, writer: IngressWriter<S>) {
        let counters = Arc::clone(&self.live_counters);
        let shutdown_rx = self.shutdown_rx.clone();

        let handle = tokio::spawn(live::run_live(
            subscription,
            writer,
            RetryConfig::daemon(),
            counters,
            shutdown_rx,
        ));

        debug!("Spawned live tail task");
        self.handles.push(handle);
    }

    /// Shut down gracefully.
    ///
    /// Shutdown sequence:
    /// 1. Signal backfill and live tasks to stop
    /// 2. Wait for each (live closes its subscription on the way out)
    /// 3. Close the waiter registry; pending queries get `Shutdown`
    /// 4. Close the store
    pub async fn shutdown(&mut self) {
        info!("Shutting down replicator");
        self.set_state(ReplicatorState::ShuttingDown);

        let _ = self.shutdown_tx.send(true);

        let handles = std::mem::take(&mut self.handles);
        let task_count = handles.len();
        if task_count > 0 {
            info!(task_count, "Waiting for tasks to drain");
        }

        for (i, handle) in handles.into_iter().enumerate() {
            match tokio::time::timeout(DRAIN_TIMEOUT, handle).await {
                Ok(Ok(())) => {
                    debug!(task = i + 1, "Task completed gracefully");
                }
                Ok(Err(e)) => {
                    warn!(task = i + 1, error = %e, "Task panicked during shutdown");
                }
                Err(_) => {
                    warn!(task = i + 1, "Task timed out during shutdown");
                }
            }
        }

        let released = self.waiters.close();
        if released > 0 {
            info!(released, "Released pending queries");
        }

        self.store.close().await;

        self.set_state(ReplicatorState::Stopped);
        info!(high_water_mark = ?self.mark.get(), "Replicator stopped");
    }
}
