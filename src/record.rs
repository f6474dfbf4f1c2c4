// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Event records and their wire/storage encoding.
//!
//! The same JSON shape is used everywhere: backfill lines, bus payloads and
//! store values.
//!
//! ```json
//! {"pos":0,"time":"2024-05-01T12:00:00Z","event":{"test":"test"}}
//! ```
//!
//! `event` is opaque to the replicator. Unknown extra fields are ignored.
//!
//! `time` is read as either an RFC 3339 string or integer milliseconds since
//! the Unix epoch, and always written back as RFC 3339.

use crate::error::{ReplicationError, Result};
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Deserializer, Serialize};

/// One entry of the upstream log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    /// Position assigned upstream (contiguous, zero-based).
    pub pos: u64,
    /// When the producer accepted the event.
    #[serde(deserialize_with = "deserialize_time")]
    pub time: DateTime<Utc>,
    /// Opaque payload.
    pub event: serde_json::Value,
}

impl EventRecord {
    /// Create a record.
    pub fn new(pos: u64, time: DateTime<Utc>, event: serde_json::Value) -> Self {
        Self { pos, time, event }
    }

    /// Store key for this record.
    pub fn key(&self) -> String {
        store_key(self.pos)
    }

    /// Serialize to the JSON wire form.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(ReplicationError::from)
    }
}

/// Decode a record from raw JSON bytes.
///
/// Used for backfill lines and bus payloads alike. Invalid UTF-8, malformed
/// JSON, a negative or missing `pos`, and a `time` that is neither RFC 3339
/// nor epoch milliseconds are all `Decode` errors.
pub fn decode(bytes: &[u8]) -> Result<EventRecord> {
    serde_json::from_slice(bytes)
        .map_err(|e| ReplicationError::Decode(format!("invalid event record: {}", e)))
}

#[derive(Deserialize)]
#[serde(untagged)]
enum WireTime {
    Rfc3339(DateTime<Utc>),
    EpochMillis(i64),
}

fn deserialize_time<'de, D>(deserializer: D) -> std::result::Result<DateTime<Utc>, D::Error>
where
    D: Deserializer<'de>,
{
    match WireTime::deserialize(deserializer)? {
        WireTime::Rfc3339(time) => Ok(time),
        WireTime::EpochMillis(ms) => Utc.timestamp_millis_opt(ms).single().ok_or_else(|| {
            serde::de::Error::custom(format!("epoch millis {} out of range", ms))
        }),
    }
}

/// Store key for a position: its decimal text form.
pub fn store_key(pos: u64) -> String {
    pos.to_string()
}
