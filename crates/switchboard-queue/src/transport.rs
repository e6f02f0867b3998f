//! Durable queue contract and an in-process broker.
//!
//! Routing follows the default-exchange convention: a message published with
//! routing key `k` lands on the queue named `k`. Consumers receive each ready
//! message exactly once until it is acked; a nack with requeue puts it back
//! at the head of its queue.

use std::{
    collections::{HashMap, VecDeque},
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::Notify;
use tracing::{debug, warn};

use crate::error::{QueueError, Result};

/// Publish and consume against a durable queue broker.
#[async_trait]
pub trait QueueTransport: Send + Sync + fmt::Debug {
    /// Publishes `payload` to the queue bound to `routing_key`.
    async fn publish(&self, routing_key: &str, payload: Bytes) -> Result<()>;

    /// Opens a consumer on `queue`.
    async fn consume(&self, queue: &str) -> Result<Box<dyn Consumer>>;
}

/// Stream of deliveries from one queue.
#[async_trait]
pub trait Consumer: Send + fmt::Debug {
    /// Waits for the next delivery. `None` once the broker closed the stream.
    ///
    /// Dropping the future before it resolves must not lose a message.
    async fn next(&mut self) -> Option<Delivery>;
}

/// Settles deliveries with the broker that produced them.
#[async_trait]
pub trait Acknowledger: Send + Sync + fmt::Debug {
    /// Removes the delivery from the queue.
    async fn ack(&self, queue: &str, delivery_tag: u64) -> Result<()>;

    /// Rejects the delivery, optionally putting it back on the queue.
    async fn nack(&self, queue: &str, delivery_tag: u64, requeue: bool) -> Result<()>;
}

/// One message handed to a consumer.
#[derive(Debug, Clone)]
pub struct Delivery {
    /// Message body.
    pub payload: Bytes,
    /// Queue the message came from.
    pub queue: String,
    /// Broker assigned tag, unique per queue.
    pub delivery_tag: u64,
    acker: Arc<dyn Acknowledger>,
}

impl Delivery {
    /// Creates a delivery settled through `acker`.
    pub fn new(
        payload: Bytes,
        queue: impl Into<String>,
        delivery_tag: u64,
        acker: Arc<dyn Acknowledger>,
    ) -> Self {
        Self { payload, queue: queue.into(), delivery_tag, acker }
    }

    /// Acknowledges the delivery.
    pub async fn ack(&self) -> Result<()> {
        self.acker.ack(&self.queue, self.delivery_tag).await
    }

    /// Rejects the delivery.
    pub async fn nack(&self, requeue: bool) -> Result<()> {
        self.acker.nack(&self.queue, self.delivery_tag, requeue).await
    }
}

#[derive(Debug, Default)]
struct QueueState {
    ready: VecDeque<Bytes>,
    unacked: HashMap<u64, Bytes>,
    notify: Arc<Notify>,
}

#[derive(Debug, Default)]
struct BrokerState {
    queues: Mutex<HashMap<String, QueueState>>,
    next_tag: AtomicU64,
    /// Cap on ready messages per queue. `None` is unbounded.
    max_len: Option<usize>,
    dropped: AtomicU64,
}

impl BrokerState {
    fn with_queue<T>(&self, queue: &str, f: impl FnOnce(&mut QueueState) -> T) -> Result<T> {
        let mut queues = self.queues.lock().map_err(|_| QueueError::transport("broker state poisoned"))?;
        Ok(f(queues.entry(queue.to_string()).or_default()))
    }

    fn settle(&self, queue: &str, delivery_tag: u64, requeue: bool) -> Result<()> {
        let outcome = self.with_queue(queue, |state| {
            let payload = state.unacked.remove(&delivery_tag)?;
            if requeue {
                state.ready.push_front(payload);
                state.notify.notify_one();
            }
            Some(())
        })?;
        outcome.ok_or_else(|| QueueError::UnknownDelivery { queue: queue.to_string(), delivery_tag })
    }
}

#[async_trait]
impl Acknowledger for BrokerState {
    async fn ack(&self, queue: &str, delivery_tag: u64) -> Result<()> {
        self.settle(queue, delivery_tag, false)
    }

    async fn nack(&self, queue: &str, delivery_tag: u64, requeue: bool) -> Result<()> {
        debug!(queue, delivery_tag, requeue, "delivery rejected");
        self.settle(queue, delivery_tag, requeue)
    }
}

/// In-process broker for single-node deployments and tests.
///
/// Clones share the same queues.
#[derive(Debug, Clone, Default)]
pub struct MemoryBroker {
    state: Arc<BrokerState>,
}

impl MemoryBroker {
    /// Creates a broker with no queues.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a broker that keeps at most `max_len` ready messages per
    /// queue, dropping the oldest when a publish would exceed it.
    pub fn with_max_len(max_len: usize) -> Self {
        Self {
            state: Arc::new(BrokerState { max_len: Some(max_len.max(1)), ..BrokerState::default() }),
        }
    }

    /// Messages dropped across all queues because a queue was full.
    pub fn dropped(&self) -> u64 {
        self.state.dropped.load(Ordering::Relaxed)
    }

    /// Messages waiting on `queue`, oldest first.
    pub fn messages(&self, queue: &str) -> Vec<Bytes> {
        self.state
            .with_queue(queue, |state| state.ready.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Number of messages waiting on `queue`.
    pub fn len(&self, queue: &str) -> usize {
        self.state.with_queue(queue, |state| state.ready.len()).unwrap_or_default()
    }

    /// Whether `queue` has no waiting messages.
    pub fn is_empty(&self, queue: &str) -> bool {
        self.len(queue) == 0
    }

    /// Number of deliveries handed out on `queue` and not yet settled.
    pub fn unacked(&self, queue: &str) -> usize {
        self.state.with_queue(queue, |state| state.unacked.len()).unwrap_or_default()
    }
}

#[async_trait]
impl QueueTransport for MemoryBroker {
    async fn publish(&self, routing_key: &str, payload: Bytes) -> Result<()> {
        let max_len = self.state.max_len;
        let dropped = self.state.with_queue(routing_key, |state| {
            state.ready.push_back(payload);
            state.notify.notify_one();
            let excess = max_len.map_or(0, |max| state.ready.len().saturating_sub(max));
            state.ready.drain(..excess);
            excess
        })?;

        if dropped > 0 {
            self.state.dropped.fetch_add(dropped as u64, Ordering::Relaxed);
            warn!(queue = routing_key, dropped, "queue full, dropped oldest messages");
        }
        Ok(())
    }

    async fn consume(&self, queue: &str) -> Result<Box<dyn Consumer>> {
        Ok(Box::new(MemoryConsumer { queue: queue.to_string(), state: Arc::clone(&self.state) }))
    }
}

struct MemoryConsumer {
    queue: String,
    state: Arc<BrokerState>,
}

impl fmt::Debug for MemoryConsumer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryConsumer").field("queue", &self.queue).finish_non_exhaustive()
    }
}

#[async_trait]
impl Consumer for MemoryConsumer {
    async fn next(&mut self) -> Option<Delivery> {
        loop {
            let tag = self.state.next_tag.fetch_add(1, Ordering::Relaxed) + 1;
            let polled = self
                .state
                .with_queue(&self.queue, |state| match state.ready.pop_front() {
                    Some(payload) => {
                        state.unacked.insert(tag, payload.clone());
                        Ok(payload)
                    },
                    None => Err(Arc::clone(&state.notify)),
                })
                .ok()?;

            match polled {
                Ok(payload) => {
                    let acker: Arc<dyn Acknowledger> = self.state.clone();
                    return Some(Delivery::new(payload, self.queue.clone(), tag, acker));
                },
                Err(notify) => notify.notified().await,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn ack_removes_and_nack_requeues_at_head() {
        let broker = MemoryBroker::new();
        broker.publish("commands", Bytes::from_static(b"a")).await.unwrap();
        broker.publish("commands", Bytes::from_static(b"b")).await.unwrap();
        let mut consumer = broker.consume("commands").await.unwrap();

        let first = consumer.next().await.unwrap();
        assert_eq!(first.payload, Bytes::from_static(b"a"));
        assert_eq!(broker.unacked("commands"), 1);

        first.nack(true).await.unwrap();
        assert_eq!(broker.messages("commands"), vec![Bytes::from_static(b"a"), Bytes::from_static(b"b")]);

        let again = consumer.next().await.unwrap();
        again.ack().await.unwrap();
        assert_eq!(broker.len("commands"), 1);
        assert_eq!(broker.unacked("commands"), 0);
    }

    #[tokio::test]
    async fn settling_twice_is_an_error() {
        let broker = MemoryBroker::new();
        broker.publish("q", Bytes::from_static(b"x")).await.unwrap();
        let delivery = broker.consume("q").await.unwrap().next().await.unwrap();

        delivery.ack().await.unwrap();

        assert!(matches!(delivery.ack().await, Err(QueueError::UnknownDelivery { .. })));
    }

    #[tokio::test]
    async fn waiting_consumer_wakes_on_publish() {
        let broker = MemoryBroker::new();
        let mut consumer = broker.consume("q").await.unwrap();

        let waiter = tokio::spawn(async move { consumer.next().await.map(|d| d.payload) });
        tokio::time::sleep(Duration::from_millis(20)).await;
        broker.publish("q", Bytes::from_static(b"late")).await.unwrap();

        let payload = tokio::time::timeout(Duration::from_secs(1), waiter).await.unwrap().unwrap();
        assert_eq!(payload, Some(Bytes::from_static(b"late")));
    }

    #[tokio::test]
    async fn bounded_queue_drops_oldest_when_nothing_consumes() {
        let broker = MemoryBroker::with_max_len(3);

        for n in 0..10u8 {
            broker.publish("status", Bytes::from(vec![n])).await.unwrap();
        }

        assert_eq!(
            broker.messages("status"),
            vec![Bytes::from(vec![7]), Bytes::from(vec![8]), Bytes::from(vec![9])]
        );
        assert_eq!(broker.dropped(), 7);
        assert_eq!(broker.len("commands"), 0);
    }

    #[tokio::test]
    async fn unbounded_broker_keeps_everything() {
        let broker = MemoryBroker::new();

        for n in 0..100u8 {
            broker.publish("status", Bytes::from(vec![n])).await.unwrap();
        }

        assert_eq!(broker.len("status"), 100);
        assert_eq!(broker.dropped(), 0);
    }

    #[tokio::test]
    async fn nack_without_requeue_discards() {
        let broker = MemoryBroker::new();
        broker.publish("q", Bytes::from_static(b"x")).await.unwrap();
        let delivery = broker.consume("q").await.unwrap().next().await.unwrap();

        delivery.nack(false).await.unwrap();

        assert!(broker.is_empty("q"));
        assert_eq!(broker.unacked("q"), 0);
    }
}
