//! Shared test utilities for integration and chaos tests.
//!
//! This module provides:
//! - Redis testcontainer setup
//! - A channel-backed `LiveBus` that records acks
//! - Scripted `HistorySource`s (failing, gated, flaky)
//! - Event record helpers

#![allow(dead_code)]

pub mod containers;
pub mod mock_bus;
pub mod mock_history;

pub use containers::*;
pub use mock_bus::*;
pub use mock_history::*;

use chrono::{TimeZone, Utc};
use event_replicator::EventRecord;
use serde_json::json;
use std::sync::{Arc, Mutex};

/// A record with a deterministic timestamp and a small payload.
pub fn record(pos: u64) -> EventRecord {
    let time = Utc
        .timestamp_opt(1_700_000_000 + pos as i64, 0)
        .single()
        .unwrap();
    EventRecord::new(pos, time, json!({ "test": "test", "n": pos }))
}

/// A record carrying a specific event body.
pub fn record_with(pos: u64, event: serde_json::Value) -> EventRecord {
    EventRecord { event, ..record(pos) }
}

/// JSON bytes for a record, without trailing newline.
pub fn payload(pos: u64) -> Vec<u8> {
    record(pos).to_json().unwrap().into_bytes()
}

/// One NDJSON history line (newline-terminated).
pub fn line(pos: u64) -> Vec<u8> {
    let mut bytes = payload(pos);
    bytes.push(b'\n');
    bytes
}

/// A whole NDJSON body for positions `range`.
pub fn ndjson(range: std::ops::Range<u64>) -> Vec<u8> {
    range.flat_map(line).collect()
}

/// Ordered log of interesting calls across mocks ("bind", "open", ...).
#[derive(Clone, Default)]
pub struct CallLog(Arc<Mutex<Vec<String>>>);

impl CallLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, entry: impl Into<String>) {
        self.0.lock().unwrap().push(entry.into());
    }

    pub fn entries(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }

    /// Index of the first entry equal to `entry`.
    pub fn position(&self, entry: &str) -> Option<usize> {
        self.0.lock().unwrap().iter().position(|e| e == entry)
    }
}

/// Poll `f` until it returns true or `timeout` elapses.
pub async fn eventually<F: FnMut() -> bool>(timeout: std::time::Duration, mut f: F) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if f() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    }
}
