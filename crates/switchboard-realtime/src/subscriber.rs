//! Real-time subscribers and the frames they receive.

use std::{fmt, sync::Arc};

use serde::Serialize;
use serde_json::Value;
use switchboard_core::{DomainEvent, EventKind, TenantId};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Path segment and subscribe argument selecting every tenant.
pub const WILDCARD: &str = "all";

/// Generated subscriber identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriberId(Uuid);

impl SubscriberId {
    /// Generates a new ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SubscriberId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Which tenants' events a subscriber receives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Scope {
    /// Every tenant.
    All,
    /// One tenant.
    Tenant(TenantId),
    /// Nothing until the client subscribes again.
    None,
}

impl Scope {
    /// Parses a tenant ID, mapping [`WILDCARD`] to [`Scope::All`].
    pub fn parse(value: &str) -> Self {
        if value == WILDCARD {
            Self::All
        } else {
            Self::Tenant(TenantId::from(value))
        }
    }

    /// Whether events of `tenant_id` are in scope.
    pub fn matches(&self, tenant_id: &TenantId) -> bool {
        match self {
            Self::All => true,
            Self::Tenant(id) => id == tenant_id,
            Self::None => false,
        }
    }
}

/// One event as broadcast to subscribers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HubMessage {
    /// Event ID, echoed in client acknowledgements.
    pub event_id: Uuid,
    /// Tenant the event belongs to.
    pub tenant_id: TenantId,
    /// Event kind.
    pub kind: EventKind,
    /// Kind specific payload.
    pub data: Value,
    /// Unix timestamp in seconds.
    pub timestamp: i64,
}

impl HubMessage {
    /// Message for an ad-hoc broadcast.
    pub fn new(tenant_id: TenantId, kind: EventKind, data: Value, timestamp: i64) -> Self {
        Self { event_id: Uuid::new_v4(), tenant_id, kind, data, timestamp }
    }
}

impl From<&DomainEvent> for HubMessage {
    fn from(event: &DomainEvent) -> Self {
        Self {
            event_id: event.id,
            tenant_id: event.tenant_id.clone(),
            kind: event.kind,
            data: event.data(),
            timestamp: event.timestamp.timestamp(),
        }
    }
}

/// What a hub pushes into a subscriber's buffer.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// A broadcast event.
    Event(Arc<HubMessage>),
    /// Keep-alive for idle connections.
    Heartbeat,
}

/// Hub side of a subscriber: the buffered sender and the done signal.
#[derive(Debug)]
pub struct DeliverySubscriber {
    pub(crate) id: SubscriberId,
    pub(crate) scope: Scope,
    pub(crate) tx: mpsc::Sender<Frame>,
    pub(crate) done: CancellationToken,
}

impl DeliverySubscriber {
    /// Creates a subscriber with a buffer of `buffer` frames.
    ///
    /// The returned stream is the connection's end; dropping it signals
    /// `done` so the hub forgets the subscriber.
    pub fn new(scope: Scope, buffer: usize) -> (Self, SubscriberStream) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        let id = SubscriberId::new();
        let done = CancellationToken::new();
        let stream = SubscriberStream { id, rx, done: done.clone() };
        (Self { id, scope, tx, done }, stream)
    }

    /// Subscriber ID.
    pub fn id(&self) -> SubscriberId {
        self.id
    }

    /// Whether the connection went away.
    pub(crate) fn is_gone(&self) -> bool {
        self.done.is_cancelled() || self.tx.is_closed()
    }
}

/// Connection side of a subscriber.
#[derive(Debug)]
pub struct SubscriberStream {
    id: SubscriberId,
    rx: mpsc::Receiver<Frame>,
    done: CancellationToken,
}

impl SubscriberStream {
    /// Subscriber ID.
    pub fn id(&self) -> SubscriberId {
        self.id
    }

    /// Next frame; `None` once the hub dropped the subscriber.
    pub async fn recv(&mut self) -> Option<Frame> {
        self.rx.recv().await
    }

    /// Next frame if one is buffered.
    pub fn try_recv(&mut self) -> Option<Frame> {
        self.rx.try_recv().ok()
    }

    /// Signals the hub that this connection is finished.
    pub fn close(&self) {
        self.done.cancel();
    }
}

impl Drop for SubscriberStream {
    fn drop(&mut self) {
        self.done.cancel();
    }
}
