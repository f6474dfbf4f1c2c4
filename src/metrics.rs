//! Metrics for observability.
//!
//! Exports Prometheus-compatible metrics for:
//! - Ingestion (both sources) and the high-water mark
//! - Backfill attempts and throughput
//! - Live bus deliveries, acks and errors
//! - Waiting position queries
//!
//! # Metric Naming Convention
//!
//! All metrics are prefixed with `replicator_` and follow Prometheus conventions:
//! - Counters end in `_total`
//! - Gauges represent current state
//! - Histograms track distributions (duration)
//!
//! No recorder is installed by the crate; the embedding application picks
//! the exporter.
//!
//! # Usage
//!
//! ```rust,no_run
//! use event_replicator::metrics;
//! use std::time::Duration;
//!
//! // In the ingress writer after a successful put
//! metrics::record_ingest("live", "success", Duration::from_micros(250));
//! metrics::set_high_water_mark(41);
//! ```

use metrics::{counter, gauge, histogram};
use std::time::Duration;

// =============================================================================
// Ingress
// =============================================================================

/// Record one ingest call. `status` is `success` or `failure`.
pub fn record_ingest(source: &str, status: &str, duration: Duration) {
    counter!(
        "replicator_ingest_total",
        "source" => source.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
    histogram!("replicator_ingest_duration_seconds", "source" => source.to_string())
        .record(duration.as_secs_f64());
}

/// Current high-water mark.
pub fn set_high_water_mark(pos: u64) {
    gauge!("replicator_high_water_mark").set(pos as f64);
}

/// Record waiters woken by an ingest.
pub fn record_waiters_fired(count: usize) {
    if count > 0 {
        counter!("replicator_waiters_fired_total").increment(count as u64);
    }
}

/// Gauge for queries currently parked on a waiter.
pub fn set_pending_waiters(count: usize) {
    gauge!("replicator_pending_waiters").set(count as f64);
}

/// Record a payload that could not be decoded.
pub fn record_decode_failure(source: &str) {
    counter!("replicator_decode_failures_total", "source" => source.to_string()).increment(1);
}

/// Record a SQLite retry (for SQLITE_BUSY/SQLITE_LOCKED).
pub fn record_store_retry(operation: &str) {
    counter!("replicator_store_retries_total", "operation" => operation.to_string()).increment(1);
}

// =============================================================================
// Backfill
// =============================================================================

/// Record the end of a backfill attempt. `outcome` is `success` or `failure`.
pub fn record_backfill_attempt(outcome: &str, records: u64, duration: Duration) {
    counter!("replicator_backfill_attempts_total", "outcome" => outcome.to_string()).increment(1);
    counter!("replicator_backfill_records_total").increment(records);
    histogram!("replicator_backfill_duration_seconds", "outcome" => outcome.to_string())
        .record(duration.as_secs_f64());
}

// =============================================================================
// Live bus
// =============================================================================

/// Record an acknowledgement. `status` is `success` or `failure`.
pub fn record_live_ack(status: &str) {
    counter!("replicator_live_acks_total", "status" => status.to_string()).increment(1);
}

/// Record a bus-side error (read, ack, group recreate).
pub fn record_bus_error(operation: &str) {
    counter!("replicator_bus_errors_total", "operation" => operation.to_string()).increment(1);
}

/// Record that the consumer group vanished and was recreated.
pub fn record_group_recreated() {
    counter!("replicator_group_recreated_total").increment(1);
}

/// Record stale consumer groups destroyed at bind.
pub fn record_groups_pruned(count: usize) {
    counter!("replicator_groups_pruned_total").increment(count as u64);
}

// =============================================================================
// Queries
// =============================================================================

/// Record how a position query was answered.
///
/// `resolution` is one of `direct`, `read_after_register`, `waited`,
/// `shutdown`.
pub fn record_query(resolution: &str) {
    counter!("replicator_queries_total", "resolution" => resolution.to_string()).increment(1);
}

// =============================================================================
// Lifecycle
// =============================================================================

/// Gauge for replicator state.
pub fn set_replicator_state(state: &str) {
    // Numeric encoding for alerting
    let value = match state {
        "Created" => 0.0,
        "Connecting" => 1.0,
        "CatchingUp" => 2.0,
        "Running" => 3.0,
        "ShuttingDown" => 4.0,
        "Stopped" => 5.0,
        "Failed" => 6.0,
        _ => -1.0,
    };
    gauge!("replicator_state").set(value);
}

/// Record errors by type.
pub fn record_error(component: &str, error_type: &str) {
    counter!(
        "replicator_errors_total",
        "component" => component.to_string(),
        "error_type" => error_type.to_string()
    )
    .increment(1);
}
