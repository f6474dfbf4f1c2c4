// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Backfill transport: where historical records come from.
//!
//! A [`HistorySource`] yields the raw body of one backfill attempt as a
//! stream of byte chunks. [`LineSplitter`] turns those chunks into
//! newline-delimited records.
//!
//! # Wire Format
//!
//! ```text
//! GET <backfill.url>
//! 200 OK
//!
//! {"pos":0,"time":"...","event":{...}}\n
//! {"pos":1,"time":"...","event":{...}}\n
//! ...
//! <EOF>
//! ```
//!
//! Chunk boundaries are arbitrary: a line (or a multi-byte UTF-8 character)
//! may be split across chunks.

use crate::error::{ReplicationError, Result};
use futures::stream::BoxStream;
use futures::StreamExt;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use tracing::{debug, warn};

/// Raw body chunks of one backfill attempt.
pub type ChunkStream = BoxStream<'static, Result<Vec<u8>>>;

/// Boxed future returned by [`HistorySource::open`].
pub type OpenFuture<'a> = Pin<Box<dyn Future<Output = Result<ChunkStream>> + Send + 'a>>;

/// A source of historical records.
///
/// `open` is called once per backfill attempt; every attempt starts from
/// the beginning of the history.
pub trait HistorySource: Send + Sync + 'static {
    /// Start a new read of the full history.
    fn open(&self) -> OpenFuture<'_>;

    /// Human-readable location for logs.
    fn describe(&self) -> String;
}

// =============================================================================
// HTTP
// =============================================================================

/// Streams history from an HTTP endpoint.
pub struct HttpHistorySource {
    client: reqwest::Client,
    url: String,
}

impl HttpHistorySource {
    /// Build a source for `url`.
    pub fn new(url: impl Into<String>, connect_timeout: Duration) -> Result<Self> {
        let url = url.into();
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .build()
            .map_err(|e| ReplicationError::backfill(&url, format!("client build failed: {}", e)))?;
        Ok(Self { client, url })
    }

    /// Build from config.
    pub fn from_config(config: &crate::config::BackfillConfig) -> Result<Self> {
        Self::new(config.url.clone(), config.connect_timeout_duration())
    }
}

impl HistorySource for HttpHistorySource {
    fn open(&self) -> OpenFuture<'_> {
        Box::pin(async move {
            let response = self
                .client
                .get(&self.url)
                .send()
                .await
                .map_err(|e| ReplicationError::backfill(&self.url, e.to_string()))?;

            let status = response.status();
            if !status.is_success() {
                return Err(ReplicationError::backfill(
                    &self.url,
                    format!("unexpected status {}", status),
                ));
            }

            debug!(url = %self.url, status = status.as_u16(), "Backfill response received");

            let url = self.url.clone();
            let stream = response
                .bytes_stream()
                .map(move |chunk| {
                    chunk
                        .map(|bytes| bytes.to_vec())
                        .map_err(|e| ReplicationError::backfill(&url, format!("body read failed: {}", e)))
                })
                .boxed();

            Ok(stream)
        })
    }

    fn describe(&self) -> String {
        self.url.clone()
    }
}

// =============================================================================
// Line splitting
// =============================================================================

/// Reassembles newline-delimited lines from arbitrary chunks.
///
/// Works on bytes, so a UTF-8 sequence split across chunks comes out whole.
/// Empty lines and lines holding only `\r` are skipped; a trailing `\r` is
/// trimmed from every line.
#[derive(Debug, Default)]
pub struct LineSplitter {
    buf: Vec<u8>,
}

impl LineSplitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk, returning every line it completes.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Vec<u8>> {
        let mut lines = Vec::new();
        let mut rest = chunk;

        while let Some(idx) = rest.iter().position(|&b| b == b'\n') {
            self.buf.extend_from_slice(&rest[..idx]);
            rest = &rest[idx + 1..];

            let mut line = std::mem::take(&mut self.buf);
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            if !line.is_empty() {
                lines.push(line);
            }
        }

        self.buf.extend_from_slice(rest);
        lines
    }

    /// Bytes held back waiting for a newline.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }

    /// End of input. An unterminated fragment is discarded; returns its
    /// length so the caller can log it.
    pub fn finish(&mut self) -> usize {
        let dropped = std::mem::take(&mut self.buf);
        let len = if dropped.iter().all(|b| b.is_ascii_whitespace()) {
            0
        } else {
            dropped.len()
        };
        if len > 0 {
            warn!(bytes = len, "Discarding unterminated trailing line from history");
        }
        len
    }
}
