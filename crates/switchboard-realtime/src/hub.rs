//! Broadcast hub shared by the SSE and WebSocket endpoints.
//!
//! One control loop per hub owns the subscriber set. Every mutation
//! (register, unregister, scope change) and every broadcast travels through
//! the loop's command channel, so the set is never touched from outside.
//! Sends into subscriber buffers never wait: a full buffer loses that
//! message for that subscriber only.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use switchboard_core::{DomainEvent, EventKind, EventSink, TenantId};
use tokio::{
    sync::{mpsc, oneshot},
    time::{self, Instant, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    error::{RealtimeError, Result},
    subscriber::{DeliverySubscriber, Frame, HubMessage, Scope, SubscriberId, SubscriberStream},
};

/// Hub configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HubConfig {
    /// Frames buffered per subscriber.
    pub buffer_size: usize,
    /// Interval between heartbeats.
    pub heartbeat_interval: Duration,
    /// Commands buffered for the control loop.
    pub command_buffer: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            buffer_size: 64,
            heartbeat_interval: Duration::from_secs(30),
            command_buffer: 1024,
        }
    }
}

enum Command {
    Register(DeliverySubscriber),
    Unregister(SubscriberId),
    SetScope { id: SubscriberId, scope: Scope },
    Broadcast(Arc<HubMessage>),
    Count { tenant_id: Option<TenantId>, reply: oneshot::Sender<usize> },
}

/// Handle to a running hub. Clones share the same control loop.
#[derive(Debug, Clone)]
pub struct Hub {
    name: &'static str,
    commands: mpsc::Sender<Command>,
    buffer_size: usize,
    heartbeat_interval: Duration,
    dropped: Arc<AtomicU64>,
    shutdown: CancellationToken,
}

impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Register(subscriber) => write!(f, "Register({})", subscriber.id),
            Self::Unregister(id) => write!(f, "Unregister({id})"),
            Self::SetScope { id, .. } => write!(f, "SetScope({id})"),
            Self::Broadcast(message) => write!(f, "Broadcast({})", message.event_id),
            Self::Count { .. } => write!(f, "Count"),
        }
    }
}

impl Hub {
    /// Spawns the control loop. `name` labels logs (`sse`, `ws`).
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(name: &'static str, config: HubConfig) -> Self {
        let (commands, rx) = mpsc::channel(config.command_buffer.max(1));
        let dropped = Arc::new(AtomicU64::new(0));
        let shutdown = CancellationToken::new();

        let control = ControlLoop {
            name,
            subscribers: HashMap::new(),
            dropped: Arc::clone(&dropped),
        };
        tokio::spawn(control.run(rx, config.heartbeat_interval, shutdown.clone()));

        Self {
            name,
            commands,
            buffer_size: config.buffer_size,
            heartbeat_interval: config.heartbeat_interval,
            dropped,
            shutdown,
        }
    }

    /// Hub name.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Interval between heartbeats sent to idle subscribers.
    pub fn heartbeat_interval(&self) -> Duration {
        self.heartbeat_interval
    }

    fn closed(&self) -> RealtimeError {
        RealtimeError::HubClosed { hub: self.name }
    }

    async fn send(&self, command: Command) -> Result<()> {
        self.commands.send(command).await.map_err(|_| self.closed())
    }

    /// Adds a subscriber. Registering the same subscriber again is a no-op.
    pub async fn register(&self, subscriber: DeliverySubscriber) -> Result<()> {
        self.send(Command::Register(subscriber)).await
    }

    /// Creates and registers a subscriber with the hub's buffer size.
    pub async fn subscribe(&self, scope: Scope) -> Result<SubscriberStream> {
        let (subscriber, stream) = DeliverySubscriber::new(scope, self.buffer_size);
        self.register(subscriber).await?;
        Ok(stream)
    }

    /// Removes a subscriber. Unknown IDs are ignored.
    pub async fn unregister(&self, id: SubscriberId) -> Result<()> {
        self.send(Command::Unregister(id)).await
    }

    /// Changes which tenants a subscriber receives.
    pub async fn set_scope(&self, id: SubscriberId, scope: Scope) -> Result<()> {
        self.send(Command::SetScope { id, scope }).await
    }

    /// Queues a broadcast without waiting for the control loop.
    ///
    /// Returns false when the broadcast was dropped because the hub is
    /// saturated or closed.
    pub fn broadcast(&self, tenant_id: TenantId, kind: EventKind, data: Value) -> bool {
        let timestamp = chrono::Utc::now().timestamp();
        self.publish(HubMessage::new(tenant_id, kind, data, timestamp))
    }

    /// Queues a domain event for broadcast.
    pub fn broadcast_event(&self, event: &DomainEvent) -> bool {
        self.publish(HubMessage::from(event))
    }

    fn publish(&self, message: HubMessage) -> bool {
        match self.commands.try_send(Command::Broadcast(Arc::new(message))) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(hub = self.name, "hub command queue full, dropping broadcast");
                false
            },
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    async fn count(&self, tenant_id: Option<TenantId>) -> Result<usize> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Count { tenant_id, reply }).await?;
        rx.await.map_err(|_| self.closed())
    }

    /// Number of live subscribers.
    pub async fn subscriber_count(&self) -> Result<usize> {
        self.count(None).await
    }

    /// Number of live subscribers receiving `tenant_id`'s events, wildcard
    /// subscribers included.
    pub async fn subscriber_count_for_tenant(&self, tenant_id: &TenantId) -> Result<usize> {
        self.count(Some(tenant_id.clone())).await
    }

    /// Messages lost to full buffers or a saturated command queue.
    pub fn dropped_messages(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Stops the control loop; subscriber streams end.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}

#[async_trait]
impl EventSink for Hub {
    async fn deliver(&self, event: Arc<DomainEvent>) {
        self.broadcast_event(&event);
    }
}

struct ControlLoop {
    name: &'static str,
    subscribers: HashMap<SubscriberId, DeliverySubscriber>,
    dropped: Arc<AtomicU64>,
}

impl ControlLoop {
    async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        heartbeat_interval: Duration,
        shutdown: CancellationToken,
    ) {
        let period = heartbeat_interval.max(Duration::from_millis(10));
        let mut heartbeat = time::interval_at(Instant::now() + period, period);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(hub = self.name, "hub started");

        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                _ = heartbeat.tick() => self.fan_out(|_| true, &Frame::Heartbeat),
                command = commands.recv() => match command {
                    Some(command) => self.handle(command),
                    None => break,
                },
            }
        }

        info!(hub = self.name, subscribers = self.subscribers.len(), "hub stopped");
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::Register(subscriber) => {
                debug!(hub = self.name, client_id = %subscriber.id, "subscriber registered");
                self.subscribers.insert(subscriber.id, subscriber);
            },
            Command::Unregister(id) => {
                if self.subscribers.remove(&id).is_some() {
                    debug!(hub = self.name, client_id = %id, "subscriber unregistered");
                }
            },
            Command::SetScope { id, scope } => {
                if let Some(subscriber) = self.subscribers.get_mut(&id) {
                    subscriber.scope = scope;
                }
            },
            Command::Broadcast(message) => {
                let tenant_id = message.tenant_id.clone();
                self.fan_out(|scope| scope.matches(&tenant_id), &Frame::Event(message));
            },
            Command::Count { tenant_id, reply } => {
                self.prune();
                let count = match tenant_id {
                    Some(tenant_id) => {
                        self.subscribers.values().filter(|s| s.scope.matches(&tenant_id)).count()
                    },
                    None => self.subscribers.len(),
                };
                let _ = reply.send(count);
            },
        }
    }

    /// Offers `frame` to every subscriber whose scope passes `wants`.
    fn fan_out(&mut self, wants: impl Fn(&Scope) -> bool, frame: &Frame) {
        self.prune();

        let mut closed = Vec::new();
        for subscriber in self.subscribers.values().filter(|s| wants(&s.scope)) {
            match subscriber.tx.try_send(frame.clone()) {
                Ok(()) => {},
                Err(mpsc::error::TrySendError::Full(_)) => {
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                    debug!(hub = self.name, client_id = %subscriber.id, "subscriber buffer full, message dropped");
                },
                Err(mpsc::error::TrySendError::Closed(_)) => closed.push(subscriber.id),
            }
        }

        for id in closed {
            self.subscribers.remove(&id);
        }
    }

    fn prune(&mut self) {
        let name = self.name;
        self.subscribers.retain(|id, subscriber| {
            let keep = !subscriber.is_gone();
            if !keep {
                debug!(hub = name, client_id = %id, "subscriber gone");
            }
            keep
        });
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn hub() -> Hub {
        Hub::start("test", HubConfig { buffer_size: 4, ..HubConfig::default() })
    }

    #[tokio::test]
    async fn register_is_idempotent() {
        let hub = hub();
        let (subscriber, _stream) = DeliverySubscriber::new(Scope::All, 4);
        let id = subscriber.id();
        let twin = DeliverySubscriber {
            id,
            scope: Scope::All,
            tx: subscriber.tx.clone(),
            done: subscriber.done.clone(),
        };

        hub.register(subscriber).await.unwrap();
        hub.register(twin).await.unwrap();

        assert_eq!(hub.subscriber_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn unregister_unknown_subscriber_is_a_no_op() {
        let hub = hub();
        let _stream = hub.subscribe(Scope::All).await.unwrap();

        hub.unregister(SubscriberId::new()).await.unwrap();

        assert_eq!(hub.subscriber_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn closed_stream_is_forgotten() {
        let hub = hub();
        let stream = hub.subscribe(Scope::parse("acme")).await.unwrap();
        assert_eq!(hub.subscriber_count_for_tenant(&TenantId::from("acme")).await.unwrap(), 1);

        drop(stream);

        assert_eq!(hub.subscriber_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn scope_change_redirects_broadcasts() {
        let hub = hub();
        let mut stream = hub.subscribe(Scope::parse("acme")).await.unwrap();

        hub.set_scope(stream.id(), Scope::parse("beta")).await.unwrap();
        assert!(hub.broadcast(TenantId::from("acme"), EventKind::GroupUpdate, json!({})));
        assert!(hub.broadcast(TenantId::from("beta"), EventKind::GroupUpdate, json!({"n": 2})));

        let Some(Frame::Event(message)) = stream.recv().await else {
            panic!("expected an event frame");
        };
        assert_eq!(message.tenant_id.as_str(), "beta");
        assert_eq!(message.data["n"], 2);
    }

    #[tokio::test]
    async fn heartbeats_reach_idle_subscribers() {
        let hub = Hub::start(
            "test",
            HubConfig { heartbeat_interval: Duration::from_millis(20), ..HubConfig::default() },
        );
        let mut stream = hub.subscribe(Scope::None).await.unwrap();

        let frame = time::timeout(Duration::from_secs(1), stream.recv()).await.unwrap();

        assert_eq!(frame, Some(Frame::Heartbeat));
    }

    #[tokio::test]
    async fn shutdown_closes_the_hub() {
        let hub = hub();
        let mut stream = hub.subscribe(Scope::All).await.unwrap();

        hub.shutdown();

        assert_eq!(time::timeout(Duration::from_secs(1), stream.recv()).await.unwrap(), None);
        assert!(matches!(hub.subscriber_count().await, Err(RealtimeError::HubClosed { .. })));
    }
}
