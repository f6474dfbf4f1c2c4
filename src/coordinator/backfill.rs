// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Backfill: replay the full history into the local copy.
//!
//! One attempt opens the history, splits it into lines, decodes each line
//! and ingests it, strictly one at a time. The next chunk is not pulled
//! until the current record is stored, so a slow store slows the read.
//!
//! # Retry Policy
//!
//! ```text
//! attempt 1 ──(transport / decode / store error)──→ wait 2s
//! attempt 2 ──(error)──→ wait 2s
//! ...
//! attempt n ──(clean EOF)──→ Completed
//! ```
//!
//! Every attempt restarts from the first record. The delay is fixed at
//! [`BACKFILL_RETRY_DELAY`] and is not configurable; there is no attempt cap. Records already stored by an abandoned attempt
//! are simply written again (puts are idempotent).

use crate::error::Result;
use crate::history::{HistorySource, LineSplitter};
use crate::ingress::{IngestSource, IngressWriter};
use crate::metrics;
use crate::record;
use crate::resilience::{Backoff, RetryConfig};
use crate::store::EventStore;
use futures::StreamExt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, info, info_span, warn, Instrument};

use super::wait_for_shutdown;

/// Pause between a failed backfill attempt and the next full restart.
pub const BACKFILL_RETRY_DELAY: Duration = Duration::from_secs(2);

/// How a backfill run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackfillOutcome {
    /// An attempt read the history to a clean end.
    Completed {
        /// Records ingested by the successful attempt.
        records: u64,
        /// Attempts made, including the successful one.
        attempts: u64,
    },
    /// Shutdown arrived first.
    Cancelled,
}

/// Run backfill attempts until one completes or shutdown is signaled.
///
/// `attempts` is bumped at the start of every attempt so health checks can
/// see a backfill that keeps failing.
pub async fn run_backfill<S: EventStore, H: HistorySource>(
    history: Arc<H>,
    writer: IngressWriter<S>,
    attempts: Arc<AtomicU64>,
    mut shutdown_rx: watch::Receiver<bool>,
) -> BackfillOutcome {
    let span = info_span!("backfill", source = %history.describe());

    async move {
        info!(retry_delay_ms = BACKFILL_RETRY_DELAY.as_millis() as u64, "Starting backfill");
        let mut backoff = Backoff::new(RetryConfig::fixed(BACKFILL_RETRY_DELAY));

        loop {
            let attempt = attempts.fetch_add(1, Ordering::AcqRel) + 1;
            let started = Instant::now();
            let mut ingested = 0u64;

            let result = tokio::select! {
                result = run_attempt(history.as_ref(), &writer, &mut ingested) => result,
                _ = wait_for_shutdown(&mut shutdown_rx) => {
                    info!(attempt, ingested, "Backfill cancelled by shutdown");
                    return BackfillOutcome::Cancelled;
                }
            };

            match result {
                Ok(()) => {
                    metrics::record_backfill_attempt("success", ingested, started.elapsed());
                    info!(
                        attempt,
                        records = ingested,
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        high_water_mark = ?writer.high_water_mark(),
                        "Backfill complete"
                    );
                    return BackfillOutcome::Completed {
                        records: ingested,
                        attempts: attempt,
                    };
                }
                Err(e) => {
                    metrics::record_backfill_attempt("failure", ingested, started.elapsed());
                    metrics::record_error("backfill", e.kind());
                    let delay = backoff.next_delay();
                    warn!(
                        attempt,
                        ingested,
                        error = %e,
                        retry_in_ms = delay.as_millis() as u64,
                        "Backfill attempt failed, restarting from the beginning"
                    );

                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = wait_for_shutdown(&mut shutdown_rx) => {
                            info!(attempt, "Backfill cancelled by shutdown during retry delay");
                            return BackfillOutcome::Cancelled;
                        }
                    }
                }
            }
        }
    }
    .instrument(span)
    .await
}

/// One pass over the history. `ingested` counts records stored so far,
/// kept outside so a failed attempt can still report its progress.
async fn run_attempt<S: EventStore, H: HistorySource>(
    history: &H,
    writer: &IngressWriter<S>,
    ingested: &mut u64,
) -> Result<()> {
    let mut chunks = history.open().await?;
    let mut splitter = LineSplitter::new();

    while let Some(chunk) = chunks.next().await {
        let chunk = chunk?;
        for line in splitter.push(&chunk) {
            let record = record::decode(&line).map_err(|e| {
                metrics::record_decode_failure("backfill");
                e
            })?;
            writer.ingest(record, IngestSource::Backfill).await?;
            *ingested += 1;
        }
    }

    let dropped = splitter.finish();
    debug!(ingested = *ingested, dropped_bytes = dropped, "History stream ended");
    Ok(())
}
