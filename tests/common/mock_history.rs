//! Scripted history sources for testing.
//!
//! Each `open()` consumes the next step of the script. Once the script is
//! exhausted the last step repeats, so a source that ends in a body keeps
//! serving it.

use super::CallLog;
use event_replicator::history::{ChunkStream, HistorySource, OpenFuture};
use event_replicator::ReplicationError;
use futures::StreamExt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

/// What one backfill attempt sees.
#[derive(Clone)]
pub enum HistoryStep {
    /// Serve these chunks, then end cleanly.
    Body(Vec<Vec<u8>>),
    /// Fail at open (connection refused, 5xx, ...).
    Fail(String),
    /// Serve these chunks, then break the stream.
    BreakAfter(Vec<Vec<u8>>, String),
    /// Serve `before`, wait for the gate, then serve `after`.
    Gated {
        before: Vec<Vec<u8>>,
        gate: Arc<Notify>,
        after: Vec<Vec<u8>>,
    },
}

/// A `HistorySource` that follows a script of steps.
pub struct ScriptedHistory {
    steps: Mutex<Vec<HistoryStep>>,
    last: Mutex<Option<HistoryStep>>,
    opens: AtomicUsize,
    log: Option<CallLog>,
}

impl ScriptedHistory {
    pub fn new(steps: Vec<HistoryStep>) -> Self {
        let mut steps = steps;
        steps.reverse();
        Self {
            steps: Mutex::new(steps),
            last: Mutex::new(None),
            opens: AtomicUsize::new(0),
            log: None,
        }
    }

    /// A history serving one body, once split into the given chunks.
    pub fn body(chunks: Vec<Vec<u8>>) -> Self {
        Self::new(vec![HistoryStep::Body(chunks)])
    }

    /// A history that fails `failures` times, then serves `body`.
    pub fn failing_then(failures: usize, body: Vec<Vec<u8>>) -> Self {
        let mut steps: Vec<HistoryStep> = (0..failures)
            .map(|i| HistoryStep::Fail(format!("injected failure {}", i + 1)))
            .collect();
        steps.push(HistoryStep::Body(body));
        Self::new(steps)
    }

    /// A history that never succeeds.
    pub fn always_failing() -> Self {
        Self::new(vec![HistoryStep::Fail("history unavailable".to_string())])
    }

    /// Record "open" in `log` on every attempt.
    pub fn with_log(mut self, log: CallLog) -> Self {
        self.log = Some(log);
        self
    }

    /// Number of `open()` calls so far (one per backfill attempt).
    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    fn next_step(&self) -> Option<HistoryStep> {
        let popped = self.steps.lock().unwrap().pop();
        let mut last = self.last.lock().unwrap();
        match popped {
            Some(step) => {
                *last = Some(step.clone());
                Some(step)
            }
            None => last.clone(),
        }
    }
}

fn chunk_stream(chunks: Vec<Vec<u8>>) -> ChunkStream {
    futures::stream::iter(chunks.into_iter().map(Ok)).boxed()
}

impl HistorySource for ScriptedHistory {
    fn open(&self) -> OpenFuture<'_> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        if let Some(log) = &self.log {
            log.push("open");
        }
        let step = self.next_step();

        Box::pin(async move {
            match step {
                Some(HistoryStep::Body(chunks)) => Ok(chunk_stream(chunks)),
                Some(HistoryStep::Fail(msg)) => Err(ReplicationError::backfill("scripted://", msg)),
                Some(HistoryStep::BreakAfter(chunks, msg)) => {
                    let broken = futures::stream::once(async move {
                        Err(ReplicationError::backfill("scripted://", msg))
                    });
                    Ok(chunk_stream(chunks).chain(broken).boxed())
                }
                Some(HistoryStep::Gated { before, gate, after }) => {
                    let rest = futures::stream::once(async move {
                        gate.notified().await;
                        futures::stream::iter(after.into_iter().map(Ok))
                    })
                    .flatten();
                    Ok(chunk_stream(before).chain(rest).boxed())
                }
                None => Err(ReplicationError::backfill("scripted://", "empty script")),
            }
        })
    }

    fn describe(&self) -> String {
        "scripted://".to_string()
    }
}
