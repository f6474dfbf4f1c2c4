// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Live bus: the unbounded tail of newly published records.
//!
//! [`LiveBus::bind`] creates this replica's exclusive subscription and
//! returns only once the binding is confirmed. The coordinator relies on
//! that: backfill may only start after `bind` returns, so nothing published
//! in between is missed.
//!
//! # Redis Streams Mapping
//!
//! ```text
//! topic (stream "events")
//!   │  XADD events * payload {...}          ← producers / RedisBus::publish
//!   │
//!   ├── group "replica-<uuid>"  (this process, created at $ with MKSTREAM)
//!   │     XREADGROUP GROUP g c COUNT n BLOCK ms STREAMS events >
//!   │     XACK events g <id>
//!   │     XGROUP DESTROY events g          ← close()
//!   └── group "replica-<uuid>"  (another replica)
//! ```
//!
//! Every group sees every entry added after it was created, which gives
//! fanout with no routing filter. The group name is fresh per bind, so no
//! identity survives a restart.
//!
//! A replica that exits without `close()` leaves its group (and pending
//! list) behind. `bind` destroys groups named `<prefix>-<uuid>` whose
//! consumers have all been idle for [`STALE_GROUP_IDLE`]. Live replicas
//! block on XREADGROUP every `block_timeout`, so they never look idle.
//!
//! # Recovery
//!
//! After a read or ack error the subscription re-reads its own pending
//! list (ID `0`) before going back to `>`, so entries delivered but never
//! acked are processed again. If the group itself is gone (`NOGROUP`), it is recreated
//! at `$` and a warning notes that live entries may have been missed.

use crate::config::BusConfig;
use crate::error::{ReplicationError, Result};
use crate::metrics;
use crate::record::EventRecord;
use crate::resilience::RetryConfig;
use redis::aio::ConnectionManager;
use redis::streams::{
    StreamInfoConsumersReply, StreamInfoGroupsReply, StreamReadOptions, StreamReadReply,
};
use redis::{AsyncCommands, Client};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, error, info, trace, warn};

/// Groups whose consumers have all been idle this long are treated as
/// abandoned and destroyed on the next bind.
pub const STALE_GROUP_IDLE: Duration = Duration::from_secs(600);

/// Boxed future used by the bus traits.
pub type BusFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// One message handed out by a subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// Opaque handle passed back to [`LiveSubscription::ack`].
    pub tag: String,
    /// Raw payload. Empty if the message carried none.
    pub payload: Vec<u8>,
}

impl Delivery {
    pub fn new(tag: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            tag: tag.into(),
            payload: payload.into(),
        }
    }
}

/// A message bus the replica can subscribe to.
pub trait LiveBus: Send + Sync + 'static {
    type Subscription: LiveSubscription;

    /// Create a fresh exclusive subscription on the topic.
    ///
    /// Must not return until the subscription is receiving.
    fn bind(&self) -> BusFuture<'_, Self::Subscription>;
}

/// A bound subscription.
pub trait LiveSubscription: Send + 'static {
    /// Wait for the next batch of deliveries.
    ///
    /// An empty batch means nothing arrived within the block timeout.
    fn next(&mut self) -> BusFuture<'_, Vec<Delivery>>;

    /// Acknowledge one delivery.
    fn ack(&mut self, tag: String) -> BusFuture<'_, ()>;

    /// Tear the subscription down.
    fn close(&mut self) -> BusFuture<'_, ()>;

    /// Name for logs.
    fn name(&self) -> &str;
}

// =============================================================================
// Redis
// =============================================================================

/// Redis Streams implementation of [`LiveBus`].
pub struct RedisBus {
    conn: ConnectionManager,
    config: BusConfig,
}

impl RedisBus {
    /// Connect with the startup retry schedule.
    pub async fn connect(config: &BusConfig) -> Result<Self> {
        Self::connect_with(config, &RetryConfig::startup()).await
    }

    /// Connect with a custom retry schedule.
    pub async fn connect_with(config: &BusConfig, retry_config: &RetryConfig) -> Result<Self> {
        info!(url = %config.redis_url, topic = %config.topic, "Connecting to bus");

        let client = Client::open(config.redis_url.as_str()).map_err(|e| {
            ReplicationError::BusConnection {
                url: config.redis_url.clone(),
                message: format!("Invalid Redis URL: {}", e),
            }
        })?;

        let mut attempt = 0;

        loop {
            attempt += 1;

            // Unreachable hosts can hang; bound each attempt
            let conn_result = timeout(
                retry_config.connection_timeout,
                client.get_connection_manager(),
            )
            .await;

            let message = match conn_result {
                Ok(Ok(conn)) => {
                    if attempt > 1 {
                        info!(url = %config.redis_url, attempt, "Connected to bus after retry");
                    } else {
                        info!(url = %config.redis_url, "Connected to bus");
                    }
                    return Ok(Self {
                        conn,
                        config: config.clone(),
                    });
                }
                Ok(Err(e)) => e.to_string(),
                Err(_) => format!(
                    "timed out after {}ms",
                    retry_config.connection_timeout.as_millis()
                ),
            };

            if !retry_config.allows_attempt(attempt + 1) {
                error!(
                    url = %config.redis_url,
                    attempt,
                    error = %message,
                    "Failed to connect to bus after max retries"
                );
                return Err(ReplicationError::BusConnection {
                    url: config.redis_url.clone(),
                    message: format!("Connection failed after {} attempts: {}", attempt, message),
                });
            }

            let delay = retry_config.delay_for_attempt(attempt);
            warn!(
                url = %config.redis_url,
                attempt,
                delay_ms = delay.as_millis(),
                error = %message,
                "Bus connection attempt failed, retrying"
            );
            tokio::time::sleep(delay).await;
        }
    }

    /// Append a record to the topic. Returns the stream entry id.
    pub async fn publish(&self, record: &EventRecord) -> Result<String> {
        let json = record.to_json()?;
        let id = self.publish_raw(json.as_bytes()).await?;
        trace!(topic = %self.config.topic, pos = record.pos, id = %id, "Published record");
        Ok(id)
    }

    /// Append raw payload bytes to the topic, unvalidated.
    pub async fn publish_raw(&self, payload: &[u8]) -> Result<String> {
        let mut conn = self.conn.clone();
        let id: String = conn
            .xadd(
                &self.config.topic,
                "*",
                &[(self.config.payload_field.as_bytes(), payload)],
            )
            .await
            .map_err(|e| ReplicationError::redis("XADD", e))?;
        Ok(id)
    }

    pub fn config(&self) -> &BusConfig {
        &self.config
    }

    /// Destroy this prefix's groups whose consumers have all been idle for
    /// at least `max_idle`. Groups with no consumer yet are left alone.
    /// Returns how many were destroyed.
    pub async fn prune_stale_groups(&self, max_idle: Duration) -> Result<usize> {
        let mut conn = self.conn.clone();
        let topic = &self.config.topic;
        let reply: StreamInfoGroupsReply = conn
            .xinfo_groups(topic)
            .await
            .map_err(|e| ReplicationError::redis("XINFO GROUPS", e))?;

        let mut pruned = 0;
        for group in reply.groups {
            if group.consumers == 0 || !is_replica_group(&group.name, &self.config.group_prefix) {
                continue;
            }
            let consumers: StreamInfoConsumersReply = conn
                .xinfo_consumers(topic, &group.name)
                .await
                .map_err(|e| ReplicationError::redis("XINFO CONSUMERS", e))?;
            let Some(idle_ms) = consumers.consumers.iter().map(|c| c.idle).min() else {
                continue;
            };
            if (idle_ms as u128) < max_idle.as_millis() {
                continue;
            }

            destroy_group(&mut conn, topic, &group.name).await?;
            warn!(
                topic = %topic,
                group = %group.name,
                idle_ms,
                pending = group.pending,
                "Destroyed abandoned consumer group"
            );
            pruned += 1;
        }

        if pruned > 0 {
            metrics::record_groups_pruned(pruned);
        }
        Ok(pruned)
    }
}

/// Whether `name` is `<prefix>-<uuid>`, the shape of groups created by `bind`.
fn is_replica_group(name: &str, prefix: &str) -> bool {
    name.strip_prefix(prefix)
        .and_then(|rest| rest.strip_prefix('-'))
        .is_some_and(|id| uuid::Uuid::parse_str(id).is_ok())
}

impl LiveBus for RedisBus {
    type Subscription = RedisSubscription;

    fn bind(&self) -> BusFuture<'_, RedisSubscription> {
        Box::pin(async move {
            let group = self.config.fresh_group_name();
            let mut conn = self.conn.clone();
            create_group(&mut conn, &self.config.topic, &group).await?;

            info!(topic = %self.config.topic, group = %group, "Live subscription bound");

            // Best effort: a failed sweep only warns
            if let Err(e) = self.prune_stale_groups(STALE_GROUP_IDLE).await {
                warn!(topic = %self.config.topic, error = %e, "Failed to prune stale consumer groups");
            }

            Ok(RedisSubscription {
                conn,
                topic: self.config.topic.clone(),
                consumer: group.clone(),
                group,
                payload_field: self.config.payload_field.clone(),
                block_ms: self.config.block_timeout_duration().as_millis() as usize,
                batch_size: self.config.batch_size,
                read_pending: false,
                closed: false,
            })
        })
    }
}

/// `XGROUP CREATE topic group $ MKSTREAM`
async fn create_group(conn: &mut ConnectionManager, topic: &str, group: &str) -> Result<()> {
    let _: () = redis::cmd("XGROUP")
        .arg("CREATE")
        .arg(topic)
        .arg(group)
        .arg("$")
        .arg("MKSTREAM")
        .query_async(conn)
        .await
        .map_err(|e| ReplicationError::redis("XGROUP CREATE", e))?;
    Ok(())
}

/// `XGROUP DESTROY topic group`
async fn destroy_group(conn: &mut ConnectionManager, topic: &str, group: &str) -> Result<()> {
    let _: i64 = redis::cmd("XGROUP")
        .arg("DESTROY")
        .arg(topic)
        .arg(group)
        .query_async(conn)
        .await
        .map_err(|e| ReplicationError::redis("XGROUP DESTROY", e))?;
    Ok(())
}

/// A consumer group bound to the topic.
pub struct RedisSubscription {
    conn: ConnectionManager,
    topic: String,
    group: String,
    consumer: String,
    payload_field: String,
    block_ms: usize,
    batch_size: usize,
    /// Next read drains our own pending list instead of new entries.
    read_pending: bool,
    closed: bool,
}

impl RedisSubscription {
    /// Consumer group name.
    pub fn group(&self) -> &str {
        &self.group
    }

    async fn read(&mut self) -> Result<Vec<Delivery>> {
        let (id, opts) = if self.read_pending {
            (
                "0",
                StreamReadOptions::default()
                    .group(&self.group, &self.consumer)
                    .count(self.batch_size),
            )
        } else {
            (
                ">",
                StreamReadOptions::default()
                    .group(&self.group, &self.consumer)
                    .count(self.batch_size)
                    .block(self.block_ms),
            )
        };

        // XREADGROUP GROUP g c COUNT n [BLOCK ms] STREAMS topic id
        let reply: StreamReadReply = self
            .conn
            .xread_options(&[&self.topic], &[id], &opts)
            .await
            .map_err(|e| ReplicationError::redis("XREADGROUP", e))?;

        let mut deliveries = Vec::new();
        for stream_key in reply.keys {
            for entry in stream_key.ids {
                let payload = payload_field(&entry.map, &self.payload_field);
                if payload.is_empty() {
                    debug!(id = %entry.id, field = %self.payload_field, "Stream entry has no payload");
                }
                deliveries.push(Delivery::new(entry.id, payload));
            }
        }

        if self.read_pending && deliveries.is_empty() {
            debug!(group = %self.group, "Pending list drained, resuming new entries");
            self.read_pending = false;
        }

        Ok(deliveries)
    }
}

impl LiveSubscription for RedisSubscription {
    fn next(&mut self) -> BusFuture<'_, Vec<Delivery>> {
        Box::pin(async move {
            match self.read().await {
                Ok(deliveries) => Ok(deliveries),
                Err(e) if e.is_missing_group() => {
                    warn!(
                        topic = %self.topic,
                        group = %self.group,
                        "Consumer group vanished; recreating at $ (live entries may have been missed)"
                    );
                    create_group(&mut self.conn, &self.topic, &self.group).await?;
                    metrics::record_group_recreated();
                    self.read_pending = false;
                    Ok(Vec::new())
                }
                Err(e) => {
                    self.read_pending = true;
                    Err(e)
                }
            }
        })
    }

    fn ack(&mut self, tag: String) -> BusFuture<'_, ()> {
        Box::pin(async move {
            let acked: redis::RedisResult<i64> =
                self.conn.xack(&self.topic, &self.group, &[tag.as_str()]).await;
            if let Err(e) = acked {
                // Still in our pending list; pick it up on the next read
                self.read_pending = true;
                return Err(ReplicationError::redis("XACK", e));
            }
            Ok(())
        })
    }

    fn close(&mut self) -> BusFuture<'_, ()> {
        Box::pin(async move {
            if self.closed {
                return Ok(());
            }
            destroy_group(&mut self.conn, &self.topic, &self.group).await?;
            self.closed = true;
            info!(topic = %self.topic, group = %self.group, "Live subscription closed");
            Ok(())
        })
    }

    fn name(&self) -> &str {
        &self.group
    }
}

/// Extract the payload bytes from a stream entry. Missing or non-string
/// fields yield an empty payload, which fails to decode downstream.
fn payload_field(fields: &HashMap<String, redis::Value>, name: &str) -> Vec<u8> {
    match fields.get(name) {
        Some(redis::Value::BulkString(bytes)) => bytes.clone(),
        Some(redis::Value::SimpleString(s)) => s.as_bytes().to_vec(),
        _ => Vec::new(),
    }
}
