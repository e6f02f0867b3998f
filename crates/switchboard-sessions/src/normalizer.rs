//! Maps transport events to domain events and state transitions.
//!
//! The mapping is total over [`TransportEvent`]: every variant either yields
//! a domain event, a transition, both, or is explicitly dropped. Unknown
//! transport types become [`EventPayload::Unknown`] instead of disappearing.

use chrono::{DateTime, Utc};
use switchboard_core::{ConnectionState, DomainEvent, EventPayload, TenantId};

use crate::{state::Transition, transport::TransportEvent};

/// Output of normalizing one transport event.
#[derive(Debug, Clone, PartialEq)]
pub struct Normalized {
    /// Transition to apply before forwarding the event.
    pub transition: Option<Transition>,
    /// Event to forward to dispatch channels.
    pub event: Option<DomainEvent>,
}

impl Normalized {
    fn dropped() -> Self {
        Self { transition: None, event: None }
    }
}

/// Normalizer bound to one tenant session.
#[derive(Debug, Clone)]
pub struct EventNormalizer {
    tenant_id: TenantId,
}

fn connection_changed(
    state: ConnectionState,
    phone: Option<String>,
    display_name: Option<String>,
    reason: Option<String>,
) -> EventPayload {
    EventPayload::ConnectionChanged { state, phone, display_name, reason }
}

impl EventNormalizer {
    /// Creates a normalizer for `tenant_id`.
    pub fn new(tenant_id: TenantId) -> Self {
        Self { tenant_id }
    }

    /// Normalizes one transport event observed at `at`.
    pub fn normalize(&self, event: TransportEvent, at: DateTime<Utc>) -> Normalized {
        let (transition, payload) = match event {
            TransportEvent::Qr { code } => {
                (Some(Transition::QrIssued(code.clone())), Some(EventPayload::QrUpdated { code }))
            },
            TransportEvent::Connected { profile } => {
                let payload = connection_changed(
                    ConnectionState::Connected,
                    Some(profile.phone.clone()),
                    profile.display_name.clone(),
                    None,
                );
                (Some(Transition::Authenticated(profile)), Some(payload))
            },
            TransportEvent::Disconnected { reason, will_reconnect } => {
                let state = if will_reconnect {
                    ConnectionState::Connecting
                } else {
                    ConnectionState::Disconnected
                };
                (
                    Some(Transition::Disconnected { will_reconnect }),
                    Some(connection_changed(state, None, None, reason)),
                )
            },
            TransportEvent::LoggedOut { reason } => (
                Some(Transition::LoggedOut),
                Some(connection_changed(
                    ConnectionState::Disconnected,
                    None,
                    None,
                    Some(reason.unwrap_or_else(|| "logged_out".to_string())),
                )),
            ),
            TransportEvent::ConnectFailure { reason } => (
                Some(Transition::Failed),
                Some(connection_changed(ConnectionState::Error, None, None, Some(reason))),
            ),
            TransportEvent::Message(message) => (
                None,
                Some(EventPayload::MessageReceived {
                    message_id: message.id,
                    chat_id: message.chat_id,
                    sender: message.sender,
                    from_me: message.from_me,
                    message_type: message.message_type,
                    text: message.text,
                    push_name: message.push_name,
                    timestamp: message.timestamp,
                    content: message.content,
                }),
            ),
            TransportEvent::Receipt(receipt) => (
                None,
                Some(EventPayload::DeliveryReceipt {
                    message_ids: receipt.message_ids,
                    chat_id: receipt.chat_id,
                    sender: receipt.sender,
                    receipt_type: receipt.receipt_type,
                    timestamp: receipt.timestamp,
                }),
            ),
            TransportEvent::Presence { jid, available, last_seen } => (
                None,
                Some(EventPayload::PresenceChanged { jid, available, last_seen, chat_state: None }),
            ),
            TransportEvent::ChatPresence { chat_id: _, sender, state } => (
                None,
                Some(EventPayload::PresenceChanged {
                    jid: sender,
                    available: true,
                    last_seen: None,
                    chat_state: Some(state),
                }),
            ),
            TransportEvent::Group(change) => (
                None,
                Some(EventPayload::GroupUpdated {
                    group_id: change.group_id,
                    action: change.action,
                    participants: change.participants,
                    actor: change.actor,
                }),
            ),
            TransportEvent::HistorySync { .. } | TransportEvent::KeepAlive => {
                return Normalized::dropped();
            },
            TransportEvent::Unknown { kind, raw } => {
                (None, Some(EventPayload::Unknown { source_kind: kind, raw }))
            },
        };

        Normalized {
            transition,
            event: payload.map(|payload| DomainEvent::new(self.tenant_id.clone(), payload, at)),
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use switchboard_core::{AccountProfile, EventKind};

    use super::*;
    use crate::transport::{GroupChange, InboundMessage};

    fn normalizer() -> EventNormalizer {
        EventNormalizer::new(TenantId::from("acme"))
    }

    #[test]
    fn qr_sets_transition_and_event() {
        let out = normalizer().normalize(TransportEvent::Qr { code: "2@abc".into() }, Utc::now());

        assert_eq!(out.transition, Some(Transition::QrIssued("2@abc".into())));
        let event = out.event.unwrap();
        assert_eq!(event.kind, EventKind::QrUpdated);
        assert_eq!(event.tenant_id.as_str(), "acme");
    }

    #[test]
    fn connected_carries_phone() {
        let profile = AccountProfile { phone: "5511999999999".into(), ..AccountProfile::default() };
        let out = normalizer().normalize(TransportEvent::Connected { profile }, Utc::now());

        assert!(matches!(out.transition, Some(Transition::Authenticated(_))));
        assert_eq!(
            out.event.unwrap().data(),
            json!({"state": "connected", "phone": "5511999999999"})
        );
    }

    #[test]
    fn reconnecting_disconnect_reports_connecting() {
        let out = normalizer().normalize(
            TransportEvent::Disconnected { reason: Some("stream error".into()), will_reconnect: true },
            Utc::now(),
        );
        assert_eq!(out.transition, Some(Transition::Disconnected { will_reconnect: true }));
        assert_eq!(out.event.unwrap().data()["state"], "connecting");
    }

    #[test]
    fn message_maps_without_transition() {
        let message = InboundMessage {
            id: "ABC".into(),
            chat_id: "5511@s.whatsapp.net".into(),
            sender: "5511@s.whatsapp.net".into(),
            from_me: false,
            message_type: "text".into(),
            text: Some("hi".into()),
            push_name: None,
            timestamp: 1_700_000_000,
            content: serde_json::Value::Null,
        };
        let out = normalizer().normalize(TransportEvent::Message(message), Utc::now());

        assert!(out.transition.is_none());
        let event = out.event.unwrap();
        assert_eq!(event.kind, EventKind::MessageReceived);
        assert_eq!(event.data()["text"], "hi");
    }

    #[test]
    fn typing_indicator_is_a_presence_event() {
        let out = normalizer().normalize(
            TransportEvent::ChatPresence {
                chat_id: "c".into(),
                sender: "5511@s.whatsapp.net".into(),
                state: "composing".into(),
            },
            Utc::now(),
        );
        let event = out.event.unwrap();
        assert_eq!(event.kind, EventKind::PresenceUpdate);
        assert_eq!(event.data()["chat_state"], "composing");
    }

    #[test]
    fn group_change_maps_to_group_update() {
        let out = normalizer().normalize(
            TransportEvent::Group(GroupChange {
                group_id: "123@g.us".into(),
                action: "add".into(),
                participants: vec!["5511@s.whatsapp.net".into()],
                actor: None,
            }),
            Utc::now(),
        );
        assert_eq!(out.event.unwrap().kind, EventKind::GroupUpdate);
    }

    #[test]
    fn internal_events_are_dropped() {
        let n = normalizer();
        assert_eq!(n.normalize(TransportEvent::HistorySync { conversations: 3 }, Utc::now()), Normalized::dropped());
        assert_eq!(n.normalize(TransportEvent::KeepAlive, Utc::now()), Normalized::dropped());
    }

    #[test]
    fn unknown_events_are_forwarded() {
        let out = normalizer().normalize(
            TransportEvent::Unknown { kind: "call_offer".into(), raw: json!({"id": 1}) },
            Utc::now(),
        );
        let event = out.event.unwrap();
        assert_eq!(event.kind, EventKind::Unknown);
        assert_eq!(event.data(), json!({"source_kind": "call_offer", "raw": {"id": 1}}));
    }
}
