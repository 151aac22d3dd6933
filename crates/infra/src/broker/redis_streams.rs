//! Redis Streams-backed broker (durable, at-least-once delivery).
//!
//! ## Architecture
//!
//! - **Streams**: one per priority, `{prefix}:{priority}` (e.g. `jobrelay:notifications:high`)
//! - **Consumer group**: shared by every worker; each message goes to one consumer
//! - **Delayed set**: `{prefix}:delayed`, a sorted set scored by `run_at` in
//!   milliseconds; members are promoted onto their stream once due
//! - **Redelivery**: entries left pending longer than `claim_idle` (consumer
//!   crashed before acking) are claimed by the next popping consumer
//!
//! Pops check streams in priority order, so a due `high` message always wins
//! over a `normal` one.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::Value;
use redis::aio::MultiplexedConnection;
use serde::{Deserialize, Serialize};
use tokio::sync::OnceCell;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use jobrelay_core::BrokerPriority;

use super::{Acknowledger, Broker, BrokerError, Delivery, PublishOptions};

/// Default key prefix
pub const DEFAULT_STREAM_PREFIX: &str = "jobrelay:notifications";

/// Default consumer group
const DEFAULT_GROUP: &str = "jobrelay.workers";

/// Pending entries idle this long are reclaimed from their consumer
const DEFAULT_CLAIM_IDLE_MS: u64 = 60_000;

/// How often an idle pop re-checks the streams
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Promotions per pop
const PROMOTE_BATCH: usize = 100;

/// Entry field holding the message body
const PAYLOAD_FIELD: &str = "payload";

/// Delayed-set member: a message waiting for its `run_at`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct ParkedMessage {
    id: uuid::Uuid,
    priority: BrokerPriority,
    /// Hex-encoded payload.
    payload: String,
}

#[derive(Clone)]
pub struct RedisStreamsBroker {
    client: Arc<redis::Client>,
    conn: Arc<OnceCell<MultiplexedConnection>>,
    prefix: String,
    group: String,
    consumer: String,
    claim_idle_ms: u64,
    poll_interval: Duration,
}

impl RedisStreamsBroker {
    /// Create a broker client.
    ///
    /// # Arguments
    ///
    /// * `redis_url` - Redis connection URL (e.g., "redis://localhost:6379")
    /// * `prefix` - Key prefix (default: "jobrelay:notifications")
    /// * `consumer` - This worker's consumer name within the group
    pub fn new(
        redis_url: impl AsRef<str>,
        prefix: Option<String>,
        consumer: impl Into<String>,
    ) -> Result<Self, BrokerError> {
        let client = redis::Client::open(redis_url.as_ref())
            .map_err(|e| BrokerError::Connection(e.to_string()))?;

        Ok(Self {
            client: Arc::new(client),
            conn: Arc::new(OnceCell::new()),
            prefix: prefix.unwrap_or_else(|| DEFAULT_STREAM_PREFIX.to_string()),
            group: DEFAULT_GROUP.to_string(),
            consumer: consumer.into(),
            claim_idle_ms: DEFAULT_CLAIM_IDLE_MS,
            poll_interval: DEFAULT_POLL_INTERVAL,
        })
    }

    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.group = group.into();
        self
    }

    pub fn with_claim_idle(mut self, idle: Duration) -> Self {
        self.claim_idle_ms = idle.as_millis() as u64;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn stream_key(&self, priority: BrokerPriority) -> String {
        format!("{}:{}", self.prefix, priority.as_str())
    }

    pub fn delayed_key(&self) -> String {
        format!("{}:delayed", self.prefix)
    }

    async fn connection(&self) -> Result<MultiplexedConnection, BrokerError> {
        let conn = self
            .conn
            .get_or_try_init(|| async {
                let mut conn = self
                    .client
                    .get_multiplexed_async_connection()
                    .await
                    .map_err(|e| BrokerError::Connection(e.to_string()))?;
                // XREADGROUP fails with NOGROUP until the groups exist.
                self.create_groups(&mut conn).await?;
                Ok::<_, BrokerError>(conn)
            })
            .await?;
        Ok(conn.clone())
    }

    /// Create the consumer group on every priority stream (idempotent).
    ///
    /// Runs on first connect; call again if the streams were deleted.
    pub async fn ensure_consumer_group(&self) -> Result<(), BrokerError> {
        let mut conn = self.connection().await?;
        self.create_groups(&mut conn).await
    }

    async fn create_groups(&self, conn: &mut MultiplexedConnection) -> Result<(), BrokerError> {
        for priority in BrokerPriority::ALL {
            let created: redis::RedisResult<String> = redis::cmd("XGROUP")
                .arg("CREATE")
                .arg(self.stream_key(priority))
                .arg(&self.group)
                .arg("0")
                .arg("MKSTREAM")
                .query_async(conn)
                .await;
            match created {
                Err(e) if !is_busy_group(&e) => {
                    return Err(BrokerError::Command(format!("XGROUP CREATE failed: {}", e)));
                }
                _ => {}
            }
        }
        Ok(())
    }

    async fn append(
        &self,
        conn: &mut MultiplexedConnection,
        priority: BrokerPriority,
        payload: &[u8],
    ) -> Result<String, BrokerError> {
        redis::cmd("XADD")
            .arg(self.stream_key(priority))
            .arg("*")
            .arg(PAYLOAD_FIELD)
            .arg(payload)
            .query_async::<_, String>(conn)
            .await
            .map_err(|e| BrokerError::Command(format!("XADD failed: {}", e)))
    }

    /// Move due delayed messages onto their streams.
    ///
    /// Several consumers may race here; only the one whose `ZREM` removes the
    /// member appends it, so each parked message is promoted once.
    async fn promote_due(&self, conn: &mut MultiplexedConnection) -> Result<(), BrokerError> {
        let now_ms = Utc::now().timestamp_millis();
        let due: Vec<String> = redis::cmd("ZRANGEBYSCORE")
            .arg(self.delayed_key())
            .arg("-inf")
            .arg(now_ms)
            .arg("LIMIT")
            .arg(0)
            .arg(PROMOTE_BATCH)
            .query_async(conn)
            .await
            .map_err(|e| BrokerError::Command(format!("ZRANGEBYSCORE failed: {}", e)))?;

        for member in due {
            let removed: i64 = redis::cmd("ZREM")
                .arg(self.delayed_key())
                .arg(&member)
                .query_async(conn)
                .await
                .map_err(|e| BrokerError::Command(format!("ZREM failed: {}", e)))?;
            if removed != 1 {
                continue;
            }

            let parked: ParkedMessage = match serde_json::from_str(&member) {
                Ok(parked) => parked,
                Err(e) => {
                    warn!(error = %e, "dropping unreadable delayed message");
                    continue;
                }
            };
            let payload = match hex::decode(&parked.payload) {
                Ok(payload) => payload,
                Err(e) => {
                    warn!(id = %parked.id, error = %e, "dropping delayed message with bad payload");
                    continue;
                }
            };
            self.append(conn, parked.priority, &payload).await?;
            debug!(id = %parked.id, priority = %parked.priority, "promoted delayed message");
        }
        Ok(())
    }

    /// Claim one entry another consumer left pending for too long.
    async fn reclaim(
        &self,
        conn: &mut MultiplexedConnection,
        priority: BrokerPriority,
    ) -> Result<Option<(String, Vec<u8>)>, BrokerError> {
        let key = self.stream_key(priority);
        let pending: Vec<(String, String, u64, u64)> = redis::cmd("XPENDING")
            .arg(&key)
            .arg(&self.group)
            .arg("-")
            .arg("+")
            .arg(10)
            .query_async(conn)
            .await
            .map_err(|e| BrokerError::Command(format!("XPENDING failed: {}", e)))?;

        let Some((id, owner, idle_ms, deliveries)) = pending
            .into_iter()
            .find(|(_, _, idle_ms, _)| *idle_ms >= self.claim_idle_ms)
        else {
            return Ok(None);
        };

        let claimed: Value = redis::cmd("XCLAIM")
            .arg(&key)
            .arg(&self.group)
            .arg(&self.consumer)
            .arg(self.claim_idle_ms)
            .arg(&id)
            .query_async(conn)
            .await
            .map_err(|e| BrokerError::Command(format!("XCLAIM failed: {}", e)))?;

        let entry = match claimed {
            Value::Bulk(entries) => entries.iter().find_map(parse_entry),
            _ => None,
        };
        if entry.is_some() {
            warn!(
                message_id = %id,
                previous_consumer = %owner,
                idle_ms,
                deliveries,
                "reclaimed unacknowledged message"
            );
        }
        Ok(entry)
    }

    /// Read the next new entry from one stream without blocking.
    async fn read_new(
        &self,
        conn: &mut MultiplexedConnection,
        priority: BrokerPriority,
    ) -> Result<Option<(String, Vec<u8>)>, BrokerError> {
        let reply: Value = redis::cmd("XREADGROUP")
            .arg("GROUP")
            .arg(&self.group)
            .arg(&self.consumer)
            .arg("COUNT")
            .arg(1)
            .arg("STREAMS")
            .arg(self.stream_key(priority))
            .arg(">")
            .query_async(conn)
            .await
            .map_err(|e| BrokerError::Command(format!("XREADGROUP failed: {}", e)))?;

        Ok(parse_read_reply(&reply).into_iter().next())
    }

    async fn try_pop(&self) -> Result<Option<Delivery>, BrokerError> {
        let mut conn = self.connection().await?;
        self.promote_due(&mut conn).await?;

        for priority in BrokerPriority::ALL {
            let found = match self.reclaim(&mut conn, priority).await? {
                Some(entry) => Some(entry),
                None => self.read_new(&mut conn, priority).await?,
            };
            if let Some((id, payload)) = found {
                let acker = Arc::new(RedisAcker {
                    conn: conn.clone(),
                    group: self.group.clone(),
                });
                return Ok(Some(Delivery::new(
                    id,
                    self.stream_key(priority),
                    payload,
                    priority,
                    acker,
                )));
            }
        }
        Ok(None)
    }
}

impl std::fmt::Debug for RedisStreamsBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStreamsBroker")
            .field("prefix", &self.prefix)
            .field("group", &self.group)
            .field("consumer", &self.consumer)
            .finish()
    }
}

struct RedisAcker {
    conn: MultiplexedConnection,
    group: String,
}

#[async_trait]
impl Acknowledger for RedisAcker {
    async fn ack(&self, source: &str, tag: &str) -> Result<(), BrokerError> {
        let mut conn = self.conn.clone();
        let _: u64 = redis::cmd("XACK")
            .arg(source)
            .arg(&self.group)
            .arg(tag)
            .query_async(&mut conn)
            .await
            .map_err(|e| BrokerError::Command(format!("XACK failed: {}", e)))?;
        Ok(())
    }
}

#[async_trait]
impl Broker for RedisStreamsBroker {
    #[instrument(skip(self, payload), fields(priority = %options.priority, run_at = %options.run_at), err)]
    async fn publish(&self, payload: Vec<u8>, options: PublishOptions) -> Result<(), BrokerError> {
        let mut conn = self.connection().await?;

        if options.run_at <= Utc::now() {
            self.append(&mut conn, options.priority, &payload).await?;
            return Ok(());
        }

        let member = serde_json::to_string(&ParkedMessage {
            id: uuid::Uuid::now_v7(),
            priority: options.priority,
            payload: hex::encode(&payload),
        })
        .map_err(|e| BrokerError::Serialization(e.to_string()))?;

        let _: i64 = redis::cmd("ZADD")
            .arg(self.delayed_key())
            .arg(score(options.run_at))
            .arg(member)
            .query_async(&mut conn)
            .await
            .map_err(|e| BrokerError::Command(format!("ZADD failed: {}", e)))?;
        Ok(())
    }

    async fn pop(
        &self,
        wait: Duration,
        cancel: &CancellationToken,
    ) -> Result<Option<Delivery>, BrokerError> {
        let deadline = Instant::now() + wait;
        loop {
            if cancel.is_cancelled() {
                return Err(BrokerError::Cancelled);
            }
            if let Some(delivery) = self.try_pop().await? {
                return Ok(Some(delivery));
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            let nap = self.poll_interval.min(deadline - now);
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(BrokerError::Cancelled),
                _ = tokio::time::sleep(nap) => {}
            }
        }
    }
}

fn score(run_at: DateTime<Utc>) -> i64 {
    run_at.timestamp_millis()
}

/// `XREADGROUP` reply: `[[stream, [[id, [field, value, ...]], ...]], ...]`.
fn parse_read_reply(reply: &Value) -> Vec<(String, Vec<u8>)> {
    let Value::Bulk(streams) = reply else {
        return Vec::new();
    };
    let mut entries = Vec::new();
    for stream in streams {
        let Value::Bulk(parts) = stream else { continue };
        if let Some(Value::Bulk(items)) = parts.get(1) {
            entries.extend(items.iter().filter_map(parse_entry));
        }
    }
    entries
}

/// Stream entry: `[id, [field, value, ...]]`. Returns the id and payload.
fn parse_entry(entry: &Value) -> Option<(String, Vec<u8>)> {
    let Value::Bulk(parts) = entry else {
        return None;
    };
    let id = match parts.first()? {
        Value::Data(data) => String::from_utf8_lossy(data).to_string(),
        Value::Status(s) => s.clone(),
        _ => return None,
    };
    let Value::Bulk(fields) = parts.get(1)? else {
        return None;
    };
    fields.chunks(2).find_map(|pair| match pair {
        [Value::Data(key), Value::Data(value)] if key.as_slice() == PAYLOAD_FIELD.as_bytes() => {
            Some((id.clone(), value.clone()))
        }
        _ => None,
    })
}

/// XGROUP CREATE answers BUSYGROUP when the group already exists.
fn is_busy_group(err: &redis::RedisError) -> bool {
    err.code() == Some("BUSYGROUP") || err.to_string().contains("BUSYGROUP")
}
