//! In-memory broker for tests/dev.
//!
//! Messages are delivered in priority order (FIFO within a priority) once
//! their `run_at` has passed. Popped messages stay in flight until acked and
//! can be pushed back with [`InMemoryBroker::requeue_unacked`] to simulate a
//! consumer crash.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use jobrelay_core::BrokerPriority;

use super::{Acknowledger, Broker, BrokerError, Delivery, PublishOptions};

/// A message as it was handed to `publish`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedMessage {
    pub payload: Vec<u8>,
    pub options: PublishOptions,
}

#[derive(Debug, Clone)]
struct Queued {
    seq: u64,
    source: String,
    payload: Vec<u8>,
    priority: BrokerPriority,
    run_at: DateTime<Utc>,
}

impl Queued {
    fn tag(&self) -> String {
        format!("{}-0", self.seq)
    }
}

#[derive(Debug, Default)]
struct State {
    next_seq: u64,
    queue: Vec<Queued>,
    in_flight: HashMap<String, Queued>,
    acks: HashMap<String, usize>,
    published: Vec<PublishedMessage>,
    publish_failure: Option<String>,
}

impl State {
    fn enqueue(&mut self, source: String, payload: Vec<u8>, priority: BrokerPriority, run_at: DateTime<Utc>) {
        self.next_seq += 1;
        self.queue.push(Queued {
            seq: self.next_seq,
            source,
            payload,
            priority,
            run_at,
        });
    }

    /// Remove and return the most urgent due message.
    fn take_due(&mut self, now: DateTime<Utc>) -> Option<Queued> {
        let index = self
            .queue
            .iter()
            .enumerate()
            .filter(|(_, q)| q.run_at <= now)
            .min_by_key(|(_, q)| (q.priority, q.seq))
            .map(|(i, _)| i)?;
        Some(self.queue.swap_remove(index))
    }

    fn next_run_at(&self) -> Option<DateTime<Utc>> {
        self.queue.iter().map(|q| q.run_at).min()
    }
}

struct InMemoryAcker {
    state: Arc<Mutex<State>>,
}

#[async_trait]
impl Acknowledger for InMemoryAcker {
    async fn ack(&self, _source: &str, tag: &str) -> Result<(), BrokerError> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| BrokerError::Command("broker state poisoned".to_string()))?;
        state.in_flight.remove(tag);
        *state.acks.entry(tag.to_string()).or_default() += 1;
        Ok(())
    }
}

/// In-memory broker.
#[derive(Clone)]
pub struct InMemoryBroker {
    state: Arc<Mutex<State>>,
    notify: Arc<Notify>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(State::default())),
            notify: Arc::new(Notify::new()),
        }
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Every message accepted by `publish`, oldest first.
    pub fn published(&self) -> Vec<PublishedMessage> {
        self.state
            .lock()
            .map(|s| s.published.clone())
            .unwrap_or_default()
    }

    /// How many times the delivery with `tag` reached the transport ack.
    pub fn ack_count(&self, tag: &str) -> usize {
        self.state
            .lock()
            .map(|s| s.acks.get(tag).copied().unwrap_or(0))
            .unwrap_or(0)
    }

    pub fn total_acks(&self) -> usize {
        self.state
            .lock()
            .map(|s| s.acks.values().sum())
            .unwrap_or(0)
    }

    /// Messages waiting to be popped (due or not).
    pub fn queued(&self) -> usize {
        self.state.lock().map(|s| s.queue.len()).unwrap_or(0)
    }

    /// Messages popped but not yet acknowledged.
    pub fn in_flight(&self) -> usize {
        self.state.lock().map(|s| s.in_flight.len()).unwrap_or(0)
    }

    /// Put every unacknowledged message back on the queue, due immediately.
    pub fn requeue_unacked(&self) -> usize {
        let count = match self.state.lock() {
            Ok(mut state) => {
                let pending: Vec<_> = state.in_flight.drain().map(|(_, q)| q).collect();
                let count = pending.len();
                let now = Utc::now();
                for mut q in pending {
                    q.run_at = now;
                    state.queue.push(q);
                }
                count
            }
            Err(_) => 0,
        };
        self.notify.notify_waiters();
        count
    }

    /// Make every subsequent publish fail with a connection error.
    pub fn fail_publishes(&self, reason: impl Into<String>) {
        if let Ok(mut state) = self.state.lock() {
            state.publish_failure = Some(reason.into());
        }
    }

    pub fn restore_publishes(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.publish_failure = None;
        }
    }

    /// Enqueue a raw message from some other producer, bypassing `publish`.
    pub fn inject(&self, source: impl Into<String>, payload: impl Into<Vec<u8>>) {
        if let Ok(mut state) = self.state.lock() {
            state.enqueue(source.into(), payload.into(), BrokerPriority::Normal, Utc::now());
        }
        self.notify.notify_waiters();
    }

    fn lock_state(&self) -> Result<std::sync::MutexGuard<'_, State>, BrokerError> {
        self.state
            .lock()
            .map_err(|_| BrokerError::Command("broker state poisoned".to_string()))
    }

    fn delivery(&self, queued: Queued) -> Delivery {
        Delivery::new(
            queued.tag(),
            queued.source.clone(),
            queued.payload.clone(),
            queued.priority,
            Arc::new(InMemoryAcker {
                state: Arc::clone(&self.state),
            }),
        )
    }
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for InMemoryBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryBroker")
            .field("queued", &self.queued())
            .field("in_flight", &self.in_flight())
            .finish()
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn publish(&self, payload: Vec<u8>, options: PublishOptions) -> Result<(), BrokerError> {
        {
            let mut state = self.lock_state()?;
            if let Some(reason) = &state.publish_failure {
                return Err(BrokerError::Connection(reason.clone()));
            }
            state.published.push(PublishedMessage {
                payload: payload.clone(),
                options,
            });
            state.enqueue(
                options.priority.as_str().to_string(),
                payload,
                options.priority,
                options.run_at,
            );
        }
        self.notify.notify_waiters();
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

            // Register interest before inspecting the queue so a publish in
            // between is not missed.
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let wake_at = {
                let mut state = self.lock_state()?;
                if let Some(queued) = state.take_due(Utc::now()) {
                    state.in_flight.insert(queued.tag(), queued.clone());
                    drop(state);
                    return Ok(Some(self.delivery(queued)));
                }
                match state.next_run_at() {
                    Some(run_at) => {
                        let until = (run_at - Utc::now()).to_std().unwrap_or_default();
                        Instant::now()
                            .checked_add(until)
                            .map_or(deadline, |at| deadline.min(at))
                    }
                    None => deadline,
                }
            };

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(BrokerError::Cancelled),
                _ = &mut notified => continue,
                _ = tokio::time::sleep_until(wake_at) => {
                    if Instant::now() >= deadline {
                        return Ok(None);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    fn opts(priority: BrokerPriority) -> PublishOptions {
        PublishOptions::immediate(priority)
    }

    #[tokio::test]
    async fn pops_by_priority_then_fifo() {
        let broker = InMemoryBroker::new();
        let cancel = CancellationToken::new();
        broker.publish(b"low".to_vec(), opts(BrokerPriority::Low)).await.unwrap();
        broker.publish(b"n1".to_vec(), opts(BrokerPriority::Normal)).await.unwrap();
        broker.publish(b"high".to_vec(), opts(BrokerPriority::High)).await.unwrap();
        broker.publish(b"n2".to_vec(), opts(BrokerPriority::Normal)).await.unwrap();

        let mut order = Vec::new();
        while let Some(d) = broker.pop(Duration::from_millis(10), &cancel).await.unwrap() {
            order.push(String::from_utf8(d.payload().to_vec()).unwrap());
        }
        assert_eq!(order, vec!["high", "n1", "n2", "low"]);
    }

    #[tokio::test]
    async fn future_messages_wait_for_run_at() {
        let broker = InMemoryBroker::new();
        let cancel = CancellationToken::new();
        let later = Utc::now() + ChronoDuration::hours(1);
        broker
            .publish(b"later".to_vec(), PublishOptions::new(BrokerPriority::High, later))
            .await
            .unwrap();

        assert!(broker.pop(Duration::from_millis(20), &cancel).await.unwrap().is_none());
        assert_eq!(broker.queued(), 1);
    }

    #[tokio::test]
    async fn pop_wakes_on_publish() {
        let broker = InMemoryBroker::new();
        let cancel = CancellationToken::new();

        let consumer = {
            let broker = broker.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { broker.pop(Duration::from_secs(5), &cancel).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        broker.publish(b"x".to_vec(), opts(BrokerPriority::Normal)).await.unwrap();

        let delivered = consumer.await.unwrap().unwrap();
        assert_eq!(delivered.unwrap().payload(), b"x");
    }

    #[tokio::test]
    async fn cancellation_interrupts_a_blocked_pop() {
        let broker = InMemoryBroker::new();
        let cancel = CancellationToken::new();

        let consumer = {
            let broker = broker.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { broker.pop(Duration::from_secs(60), &cancel).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();

        assert_eq!(consumer.await.unwrap().unwrap_err(), BrokerError::Cancelled);
    }

    #[tokio::test]
    async fn acks_are_counted_and_clear_in_flight() {
        let broker = InMemoryBroker::new();
        let cancel = CancellationToken::new();
        broker.publish(b"x".to_vec(), opts(BrokerPriority::Normal)).await.unwrap();

        let d = broker.pop(Duration::from_millis(10), &cancel).await.unwrap().unwrap();
        assert_eq!(broker.in_flight(), 1);
        d.ack().await.unwrap();
        d.ack().await.unwrap();

        assert_eq!(broker.ack_count(d.tag()), 1);
        assert_eq!(broker.in_flight(), 0);
    }

    #[tokio::test]
    async fn unacked_messages_can_be_redelivered() {
        let broker = InMemoryBroker::new();
        let cancel = CancellationToken::new();
        broker.publish(b"x".to_vec(), opts(BrokerPriority::Normal)).await.unwrap();

        let first = broker.pop(Duration::from_millis(10), &cancel).await.unwrap().unwrap();
        assert_eq!(broker.requeue_unacked(), 1);
        let second = broker.pop(Duration::from_millis(10), &cancel).await.unwrap().unwrap();

        assert_eq!(first.tag(), second.tag());
    }

    #[tokio::test]
    async fn failing_publish_is_reported() {
        let broker = InMemoryBroker::new();
        broker.fail_publishes("unreachable");

        let err = broker
            .publish(b"x".to_vec(), opts(BrokerPriority::Normal))
            .await
            .unwrap_err();
        assert_eq!(err, BrokerError::Connection("unreachable".to_string()));
        assert!(broker.published().is_empty());
    }
}
