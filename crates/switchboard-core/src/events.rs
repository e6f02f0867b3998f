//! Normalized domain events and the sink contract shared by dispatch channels.
//!
//! Every transport-native event that carries externally relevant information
//! becomes exactly one [`DomainEvent`]. Events are wrapped in an `Arc` before
//! fan-out, so each channel observes the same immutable value.
//!
//! ```text
//!                                   ┌──────────────────┐
//!                              ┌───▶│ WebhookDispatcher│
//! ┌────────────┐  DomainEvent  │    └──────────────────┘
//! │ Normalizer │ ────────────▶ │    ┌──────────────────┐
//! │ (session)  │  MulticastSink├───▶│ SSE Hub          │
//! └────────────┘               │    └──────────────────┘
//!                              │    ┌──────────────────┐
//!                              └───▶│ WebSocket Hub    │
//!                                   └──────────────────┘
//! ```

use std::{fmt, str::FromStr, sync::Arc};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::models::{ConnectionState, TenantId};

/// Tag identifying the kind of a domain event on every wire format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EventKind {
    /// A new pairing code was issued.
    #[serde(rename = "qr.updated")]
    QrUpdated,
    /// The session connection state changed.
    #[serde(rename = "connection.update")]
    ConnectionUpdate,
    /// An inbound (or own outbound, echoed) message.
    #[serde(rename = "message.received")]
    MessageReceived,
    /// Delivered/read receipt for previously sent messages.
    #[serde(rename = "message.receipt")]
    MessageReceipt,
    /// Contact presence or typing state.
    #[serde(rename = "presence.update")]
    PresenceUpdate,
    /// Group metadata or membership change.
    #[serde(rename = "group.update")]
    GroupUpdate,
    /// Transport event type the normalizer does not recognize.
    #[serde(rename = "unknown")]
    Unknown,
}

impl EventKind {
    /// All kinds, in wire order.
    pub const ALL: [EventKind; 7] = [
        Self::QrUpdated,
        Self::ConnectionUpdate,
        Self::MessageReceived,
        Self::MessageReceipt,
        Self::PresenceUpdate,
        Self::GroupUpdate,
        Self::Unknown,
    ];

    /// Returns the dotted wire name.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::QrUpdated => "qr.updated",
            Self::ConnectionUpdate => "connection.update",
            Self::MessageReceived => "message.received",
            Self::MessageReceipt => "message.receipt",
            Self::PresenceUpdate => "presence.update",
            Self::GroupUpdate => "group.update",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| format!("unknown event kind '{s}'"))
    }
}

/// Kind specific event data.
///
/// Serializes untagged: the `data` object of every wire envelope is exactly
/// the variant's fields, while the kind travels separately.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum EventPayload {
    /// New pairing code.
    QrUpdated {
        /// Raw pairing code; rendering is left to clients.
        code: String,
    },
    /// Connection state change.
    ConnectionChanged {
        /// State after the change.
        state: ConnectionState,
        /// Account phone, set once connected.
        #[serde(skip_serializing_if = "Option::is_none")]
        phone: Option<String>,
        /// Account display name, set once connected.
        #[serde(skip_serializing_if = "Option::is_none")]
        display_name: Option<String>,
        /// Transport supplied reason for disconnects and failures.
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    /// Message received (or sent from another device).
    MessageReceived {
        /// Transport message ID.
        message_id: String,
        /// Chat the message belongs to.
        chat_id: String,
        /// Sender address.
        sender: String,
        /// Whether the paired account sent it.
        from_me: bool,
        /// Message content type (`text`, `image`, ...).
        message_type: String,
        /// Text body or caption.
        #[serde(skip_serializing_if = "Option::is_none")]
        text: Option<String>,
        /// Sender's push name.
        #[serde(skip_serializing_if = "Option::is_none")]
        push_name: Option<String>,
        /// Transport timestamp, Unix seconds.
        timestamp: i64,
        /// Remaining transport content, passed through untouched.
        #[serde(skip_serializing_if = "Value::is_null")]
        content: Value,
    },
    /// Delivery or read receipt.
    DeliveryReceipt {
        /// Messages the receipt applies to.
        message_ids: Vec<String>,
        /// Chat of the messages.
        chat_id: String,
        /// Receipt issuer.
        sender: String,
        /// Receipt type (`delivered`, `read`, `played`).
        receipt_type: String,
        /// Transport timestamp, Unix seconds.
        timestamp: i64,
    },
    /// Presence or chat state change.
    PresenceChanged {
        /// Address whose presence changed.
        jid: String,
        /// Online flag.
        available: bool,
        /// Last seen time, Unix seconds.
        #[serde(skip_serializing_if = "Option::is_none")]
        last_seen: Option<i64>,
        /// Chat state (`composing`, `paused`, ...) for typing notifications.
        #[serde(skip_serializing_if = "Option::is_none")]
        chat_state: Option<String>,
    },
    /// Group metadata or participant change.
    GroupUpdated {
        /// Group address.
        group_id: String,
        /// Change action (`add`, `remove`, `promote`, `subject`, ...).
        action: String,
        /// Affected participants.
        participants: Vec<String>,
        /// Participant who performed the change.
        #[serde(skip_serializing_if = "Option::is_none")]
        actor: Option<String>,
    },
    /// Unrecognized transport event, forwarded so consumers can see gaps.
    Unknown {
        /// Transport type name.
        source_kind: String,
        /// Raw transport data.
        raw: Value,
    },
}

impl EventPayload {
    /// Returns the kind tag for this payload.
    pub const fn kind(&self) -> EventKind {
        match self {
            Self::QrUpdated { .. } => EventKind::QrUpdated,
            Self::ConnectionChanged { .. } => EventKind::ConnectionUpdate,
            Self::MessageReceived { .. } => EventKind::MessageReceived,
            Self::DeliveryReceipt { .. } => EventKind::MessageReceipt,
            Self::PresenceChanged { .. } => EventKind::PresenceUpdate,
            Self::GroupUpdated { .. } => EventKind::GroupUpdate,
            Self::Unknown { .. } => EventKind::Unknown,
        }
    }
}

/// Canonical event produced for one tenant session.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DomainEvent {
    /// Unique event ID, used for client acknowledgements.
    pub id: Uuid,
    /// Tenant the event happened on.
    pub tenant_id: TenantId,
    /// Kind tag, always equal to `payload.kind()`.
    pub kind: EventKind,
    /// Normalization time.
    pub timestamp: DateTime<Utc>,
    /// Kind specific data.
    pub payload: EventPayload,
}

impl DomainEvent {
    /// Creates an event, deriving the kind from the payload.
    pub fn new(tenant_id: TenantId, payload: EventPayload, timestamp: DateTime<Utc>) -> Self {
        Self { id: Uuid::new_v4(), tenant_id, kind: payload.kind(), timestamp, payload }
    }

    /// Returns the payload as the JSON `data` object of wire envelopes.
    pub fn data(&self) -> Value {
        serde_json::to_value(&self.payload).unwrap_or(Value::Null)
    }
}

/// A dispatch channel that delivers domain events to the outside world.
///
/// `deliver` must not hold the caller for the duration of the delivery:
/// implementations buffer or hand the event to their own tasks and apply
/// their own backpressure policy. Failures are logged by the channel and
/// never surfaced to the event source.
#[async_trait::async_trait]
pub trait EventSink: Send + Sync + std::fmt::Debug {
    /// Hands an event to the channel.
    async fn deliver(&self, event: Arc<DomainEvent>);
}

/// Sink that discards every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoOpSink;

#[async_trait::async_trait]
impl EventSink for NoOpSink {
    async fn deliver(&self, _event: Arc<DomainEvent>) {}
}

/// Fans one event out to every registered sink concurrently.
#[derive(Debug, Clone, Default)]
pub struct MulticastSink {
    sinks: Vec<Arc<dyn EventSink>>,
}

impl MulticastSink {
    /// Creates a multicast sink with no targets.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a target sink.
    pub fn add_sink(&mut self, sink: Arc<dyn EventSink>) {
        self.sinks.push(sink);
    }

    /// Builder form of [`MulticastSink::add_sink`].
    #[must_use]
    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.add_sink(sink);
        self
    }

    /// Number of target sinks.
    pub fn sink_count(&self) -> usize {
        self.sinks.len()
    }
}

#[async_trait::async_trait]
impl EventSink for MulticastSink {
    async fn deliver(&self, event: Arc<DomainEvent>) {
        let deliveries = self.sinks.iter().map(|sink| {
            let event = Arc::clone(&event);
            async move { sink.deliver(event).await }
        });
        futures::future::join_all(deliveries).await;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use serde_json::json;

    use super::*;

    #[derive(Debug, Default)]
    struct CountingSink {
        seen: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl EventSink for CountingSink {
        async fn deliver(&self, _event: Arc<DomainEvent>) {
            self.seen.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn presence_event() -> DomainEvent {
        DomainEvent::new(
            TenantId::from("acme"),
            EventPayload::PresenceChanged {
                jid: "5511@s.whatsapp.net".into(),
                available: true,
                last_seen: None,
                chat_state: None,
            },
            Utc::now(),
        )
    }

    #[test]
    fn kind_round_trips_through_wire_name() {
        for kind in EventKind::ALL {
            assert_eq!(kind.as_str().parse::<EventKind>().unwrap(), kind);
            assert_eq!(serde_json::to_value(kind).unwrap(), json!(kind.as_str()));
        }
        assert!("message.deleted".parse::<EventKind>().is_err());
    }

    #[test]
    fn event_kind_follows_payload() {
        let event = presence_event();
        assert_eq!(event.kind, EventKind::PresenceUpdate);
    }

    #[test]
    fn data_is_the_bare_payload_object() {
        let event = DomainEvent::new(
            TenantId::from("acme"),
            EventPayload::QrUpdated { code: "2@abc".into() },
            Utc::now(),
        );
        assert_eq!(event.data(), json!({"code": "2@abc"}));

        let connected = DomainEvent::new(
            TenantId::from("acme"),
            EventPayload::ConnectionChanged {
                state: ConnectionState::Connected,
                phone: Some("5511999999999".into()),
                display_name: None,
                reason: None,
            },
            Utc::now(),
        );
        assert_eq!(connected.data(), json!({"state": "connected", "phone": "5511999999999"}));
    }

    #[tokio::test]
    async fn multicast_forwards_to_all_sinks() {
        let first = Arc::new(CountingSink::default());
        let second = Arc::new(CountingSink::default());
        let multicast = MulticastSink::new()
            .with_sink(first.clone())
            .with_sink(second.clone());

        assert_eq!(multicast.sink_count(), 2);
        multicast.deliver(Arc::new(presence_event())).await;

        assert_eq!(first.seen.load(Ordering::SeqCst), 1);
        assert_eq!(second.seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn multicast_without_sinks_is_a_no_op() {
        MulticastSink::new().deliver(Arc::new(presence_event())).await;
        NoOpSink.deliver(Arc::new(presence_event())).await;
    }
}
