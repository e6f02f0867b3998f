//! Durable queue transport over Redis streams.
//!
//! Each queue is a stream read through one consumer group. Messages are
//! stream entries with a single `payload` field, so external producers
//! publish with `XADD <queue> * payload <json>`.
//!
//! Ack is `XACK` plus `XDEL`. A nack with requeue appends a fresh copy
//! before acking the original, so unlike [`MemoryBroker`] the message goes
//! to the tail of its queue. Entries delivered to a consumer that died
//! before settling them stay in the group's pending list; a consumer with
//! the same name replays them before reading new entries.
//!
//! [`MemoryBroker`]: crate::transport::MemoryBroker

use std::{
    collections::HashMap,
    fmt,
    sync::{
        atomic::{AtomicU64, AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use redis::{
    aio::{ConnectionManager, MultiplexedConnection},
    streams::StreamReadReply,
    RedisError,
};
use tracing::{debug, info, warn};

use crate::{
    error::{QueueError, Result},
    transport::{Acknowledger, Consumer, Delivery, QueueTransport},
};

/// Consumer group every queue is read through.
pub const CONSUMER_GROUP: &str = "switchboard";

/// Stream field carrying the message body.
pub const PAYLOAD_FIELD: &str = "payload";

const BLOCK_MS: u64 = 1_000;
const RECONNECT_DELAY: Duration = Duration::from_secs(1);

fn redis_error(err: RedisError) -> QueueError {
    QueueError::transport(err.to_string())
}

/// Redis stream broker settings.
#[derive(Debug, Clone)]
pub struct RedisBrokerConfig {
    /// Prefix of consumer names. Must be unique per gateway process and
    /// stable across its restarts so pending entries are replayed.
    pub consumer_name: String,
    /// Approximate cap on entries kept per stream.
    pub max_len: usize,
}

impl Default for RedisBrokerConfig {
    fn default() -> Self {
        Self { consumer_name: "switchboard".to_string(), max_len: 10_000 }
    }
}

struct Pending {
    entry_id: String,
    payload: Bytes,
}

/// Settles deliveries and publishes on the shared connection.
struct StreamAcker {
    conn: ConnectionManager,
    max_len: usize,
    pending: Mutex<HashMap<(String, u64), Pending>>,
    next_tag: AtomicU64,
}

impl fmt::Debug for StreamAcker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamAcker").field("max_len", &self.max_len).finish_non_exhaustive()
    }
}

impl StreamAcker {
    fn xadd(&self, pipe: &mut redis::Pipeline, stream: &str, payload: &[u8]) {
        pipe.cmd("XADD")
            .arg(stream)
            .arg("MAXLEN")
            .arg("~")
            .arg(self.max_len)
            .arg("*")
            .arg(PAYLOAD_FIELD)
            .arg(payload)
            .ignore();
    }

    fn track(&self, stream: &str, entry_id: String, payload: Bytes) -> Result<u64> {
        let tag = self.next_tag.fetch_add(1, Ordering::Relaxed) + 1;
        self.pending
            .lock()
            .map_err(|_| QueueError::transport("pending deliveries lock poisoned"))?
            .insert((stream.to_string(), tag), Pending { entry_id, payload });
        Ok(tag)
    }

    fn lookup(&self, stream: &str, delivery_tag: u64) -> Result<(String, Bytes)> {
        let pending = self
            .pending
            .lock()
            .map_err(|_| QueueError::transport("pending deliveries lock poisoned"))?;
        pending
            .get(&(stream.to_string(), delivery_tag))
            .map(|p| (p.entry_id.clone(), p.payload.clone()))
            .ok_or_else(|| QueueError::UnknownDelivery { queue: stream.to_string(), delivery_tag })
    }

    fn forget(&self, stream: &str, delivery_tag: u64) {
        if let Ok(mut pending) = self.pending.lock() {
            pending.remove(&(stream.to_string(), delivery_tag));
        }
    }

    async fn settle(&self, stream: &str, delivery_tag: u64, requeue: bool) -> Result<()> {
        let (entry_id, payload) = self.lookup(stream, delivery_tag)?;

        let mut pipe = redis::pipe();
        pipe.atomic();
        if requeue {
            self.xadd(&mut pipe, stream, &payload);
        }
        pipe.cmd("XACK").arg(stream).arg(CONSUMER_GROUP).arg(&entry_id).ignore();
        pipe.cmd("XDEL").arg(stream).arg(&entry_id).ignore();

        let mut conn = self.conn.clone();
        let _: () = pipe.query_async(&mut conn).await.map_err(redis_error)?;
        self.forget(stream, delivery_tag);
        Ok(())
    }
}

#[async_trait]
impl Acknowledger for StreamAcker {
    async fn ack(&self, queue: &str, delivery_tag: u64) -> Result<()> {
        self.settle(queue, delivery_tag, false).await
    }

    async fn nack(&self, queue: &str, delivery_tag: u64, requeue: bool) -> Result<()> {
        debug!(queue, delivery_tag, requeue, "delivery rejected");
        self.settle(queue, delivery_tag, requeue).await
    }
}

/// Queue transport backed by Redis streams and consumer groups.
#[derive(Clone)]
pub struct RedisBroker {
    client: redis::Client,
    acker: Arc<StreamAcker>,
    consumer_name: String,
    consumers: Arc<AtomicUsize>,
}

impl fmt::Debug for RedisBroker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisBroker")
            .field("consumer_name", &self.consumer_name)
            .finish_non_exhaustive()
    }
}

impl RedisBroker {
    /// Connects to the Redis server at `url`.
    pub async fn connect(url: &str, config: RedisBrokerConfig) -> Result<Self> {
        let client = redis::Client::open(url).map_err(redis_error)?;
        let conn = ConnectionManager::new(client.clone()).await.map_err(redis_error)?;
        info!(consumer_name = %config.consumer_name, "redis stream broker connected");

        Ok(Self {
            client,
            acker: Arc::new(StreamAcker {
                conn,
                max_len: config.max_len.max(1),
                pending: Mutex::new(HashMap::new()),
                next_tag: AtomicU64::new(0),
            }),
            consumer_name: config.consumer_name,
            consumers: Arc::new(AtomicUsize::new(0)),
        })
    }
}

async fn ensure_group(conn: &mut MultiplexedConnection, stream: &str) -> Result<()> {
    let created: redis::RedisResult<()> = redis::cmd("XGROUP")
        .arg("CREATE")
        .arg(stream)
        .arg(CONSUMER_GROUP)
        .arg("0")
        .arg("MKSTREAM")
        .query_async(conn)
        .await;
    match created {
        Ok(()) => Ok(()),
        Err(err) if err.code() == Some("BUSYGROUP") => Ok(()),
        Err(err) => Err(redis_error(err)),
    }
}

#[async_trait]
impl QueueTransport for RedisBroker {
    async fn publish(&self, routing_key: &str, payload: Bytes) -> Result<()> {
        let mut pipe = redis::pipe();
        self.acker.xadd(&mut pipe, routing_key, &payload);
        let mut conn = self.acker.conn.clone();
        let _: () = pipe.query_async(&mut conn).await.map_err(redis_error)?;
        Ok(())
    }

    async fn consume(&self, queue: &str) -> Result<Box<dyn Consumer>> {
        // Blocking reads get their own connection so they never stall
        // publishes and acks on the shared one.
        let mut conn = self.client.get_multiplexed_async_connection().await.map_err(redis_error)?;
        ensure_group(&mut conn, queue).await?;

        let index = self.consumers.fetch_add(1, Ordering::Relaxed);
        let consumer = format!("{}-{index}", self.consumer_name);
        debug!(queue, consumer = %consumer, "stream consumer opened");

        Ok(Box::new(StreamConsumer {
            client: self.client.clone(),
            conn: Some(conn),
            stream: queue.to_string(),
            consumer,
            replaying: true,
            acker: Arc::clone(&self.acker),
        }))
    }
}

struct StreamConsumer {
    client: redis::Client,
    conn: Option<MultiplexedConnection>,
    stream: String,
    consumer: String,
    /// Reading this consumer's unsettled entries before new ones.
    replaying: bool,
    acker: Arc<StreamAcker>,
}

impl fmt::Debug for StreamConsumer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamConsumer")
            .field("stream", &self.stream)
            .field("consumer", &self.consumer)
            .finish_non_exhaustive()
    }
}

impl StreamConsumer {
    async fn read(&mut self) -> Result<Option<(String, Option<Vec<u8>>)>> {
        if self.conn.is_none() {
            let mut conn =
                self.client.get_multiplexed_async_connection().await.map_err(redis_error)?;
            ensure_group(&mut conn, &self.stream).await?;
            self.conn = Some(conn);
        }
        let Some(conn) = self.conn.as_mut() else { return Ok(None) };

        let mut cmd = redis::cmd("XREADGROUP");
        cmd.arg("GROUP").arg(CONSUMER_GROUP).arg(&self.consumer).arg("COUNT").arg(1);
        if !self.replaying {
            cmd.arg("BLOCK").arg(BLOCK_MS);
        }
        cmd.arg("STREAMS").arg(&self.stream).arg(if self.replaying { "0" } else { ">" });

        let reply: Option<StreamReadReply> = match cmd.query_async(conn).await {
            Ok(reply) => reply,
            Err(err) if err.code() == Some("NOGROUP") => {
                ensure_group(conn, &self.stream).await?;
                return Ok(None);
            },
            Err(err) => return Err(redis_error(err)),
        };

        let entry = reply
            .and_then(|reply| reply.keys.into_iter().next())
            .and_then(|key| key.ids.into_iter().next());
        Ok(entry.map(|entry| {
            let payload = entry.get::<Vec<u8>>(PAYLOAD_FIELD);
            (entry.id, payload)
        }))
    }
}

#[async_trait]
impl Consumer for StreamConsumer {
    async fn next(&mut self) -> Option<Delivery> {
        loop {
            let (entry_id, payload) = match self.read().await {
                Ok(Some(entry)) => entry,
                Ok(None) => {
                    if self.replaying {
                        debug!(consumer = %self.consumer, "pending entries replayed");
                        self.replaying = false;
                    }
                    continue;
                },
                Err(error) => {
                    warn!(stream = %self.stream, error = %error, "stream read failed, reconnecting");
                    self.conn = None;
                    tokio::time::sleep(RECONNECT_DELAY).await;
                    continue;
                },
            };

            let payload = payload.map(Bytes::from);
            let tracked = payload.clone().unwrap_or_default();
            let tag = match self.acker.track(&self.stream, entry_id.clone(), tracked) {
                Ok(tag) => tag,
                Err(error) => {
                    warn!(stream = %self.stream, error = %error, "failed to track delivery");
                    return None;
                },
            };

            let Some(payload) = payload else {
                // Deleted after delivery; only the pending record is left.
                if let Err(error) = self.acker.ack(&self.stream, tag).await {
                    warn!(stream = %self.stream, entry_id = %entry_id, error = %error, "failed to clear empty entry");
                }
                continue;
            };

            let acker: Arc<dyn Acknowledger> = self.acker.clone();
            return Some(Delivery::new(payload, self.stream.clone(), tag, acker));
        }
    }
}
