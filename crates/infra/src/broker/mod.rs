//! Message broker abstraction (low-latency wake-up channel).
//!
//! The broker is not authoritative: deliveries may be late, duplicated or
//! stale. Consumers cross-check every delivery against the job store.
//!
//! ## Components
//!
//! - `Broker`: publish with a priority tag and target delivery time, blocking
//!   cancellable pop
//! - `Delivery`: one popped message plus its acknowledgement handle
//! - `Acknowledger`: transport-side ack, called at most once per delivery

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use jobrelay_core::BrokerPriority;

pub mod in_memory;
#[cfg(feature = "redis")]
pub mod redis_streams;

pub use in_memory::InMemoryBroker;
#[cfg(feature = "redis")]
pub use redis_streams::RedisStreamsBroker;

/// Broker transport error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BrokerError {
    #[error("broker connection error: {0}")]
    Connection(String),

    #[error("broker command error: {0}")]
    Command(String),

    #[error("broker serialization error: {0}")]
    Serialization(String),

    #[error("broker wait cancelled")]
    Cancelled,
}

/// Delivery options for a published message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PublishOptions {
    pub priority: BrokerPriority,
    /// Do not deliver before this instant.
    pub run_at: DateTime<Utc>,
}

impl PublishOptions {
    pub fn new(priority: BrokerPriority, run_at: DateTime<Utc>) -> Self {
        Self { priority, run_at }
    }

    /// Deliver as soon as possible.
    pub fn immediate(priority: BrokerPriority) -> Self {
        Self::new(priority, Utc::now())
    }
}

/// Transport-side acknowledgement.
#[async_trait]
pub trait Acknowledger: Send + Sync {
    async fn ack(&self, source: &str, tag: &str) -> Result<(), BrokerError>;
}

/// A message popped from the broker.
///
/// Acknowledging is idempotent: only the first successful [`Delivery::ack`]
/// reaches the transport.
pub struct Delivery {
    tag: String,
    source: String,
    payload: Vec<u8>,
    priority: BrokerPriority,
    acker: Arc<dyn Acknowledger>,
    acked: AtomicBool,
}

impl Delivery {
    pub fn new(
        tag: impl Into<String>,
        source: impl Into<String>,
        payload: Vec<u8>,
        priority: BrokerPriority,
        acker: Arc<dyn Acknowledger>,
    ) -> Self {
        Self {
            tag: tag.into(),
            source: source.into(),
            payload,
            priority,
            acker,
            acked: AtomicBool::new(false),
        }
    }

    /// Broker-assigned message id.
    pub fn tag(&self) -> &str {
        &self.tag
    }

    /// Queue/stream the message was popped from.
    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn priority(&self) -> BrokerPriority {
        self.priority
    }

    pub fn is_acked(&self) -> bool {
        self.acked.load(Ordering::SeqCst)
    }

    pub async fn ack(&self) -> Result<(), BrokerError> {
        if self.acked.swap(true, Ordering::SeqCst) {
            debug!(tag = %self.tag, source = %self.source, "delivery already acknowledged");
            return Ok(());
        }
        if let Err(e) = self.acker.ack(&self.source, &self.tag).await {
            self.acked.store(false, Ordering::SeqCst);
            return Err(e);
        }
        Ok(())
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("tag", &self.tag)
            .field("source", &self.source)
            .field("priority", &self.priority)
            .field("payload_len", &self.payload.len())
            .field("acked", &self.is_acked())
            .finish()
    }
}

/// Notification transport.
#[async_trait]
pub trait Broker: Send + Sync {
    async fn publish(&self, payload: Vec<u8>, options: PublishOptions) -> Result<(), BrokerError>;

    /// Wait up to `wait` for the next due message.
    ///
    /// Returns `Ok(None)` when the wait elapses and
    /// `Err(BrokerError::Cancelled)` as soon as `cancel` fires.
    async fn pop(
        &self,
        wait: Duration,
        cancel: &CancellationToken,
    ) -> Result<Option<Delivery>, BrokerError>;
}

#[async_trait]
impl<B> Broker for Arc<B>
where
    B: Broker + ?Sized,
{
    async fn publish(&self, payload: Vec<u8>, options: PublishOptions) -> Result<(), BrokerError> {
        (**self).publish(payload, options).await
    }

    async fn pop(
        &self,
        wait: Duration,
        cancel: &CancellationToken,
    ) -> Result<Option<Delivery>, BrokerError> {
        (**self).pop(wait, cancel).await
    }
}
