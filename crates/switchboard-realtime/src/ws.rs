//! WebSocket subscribers with client control frames.
//!
//! Outbound frames are `{event, instance_id, event_id, data, timestamp}`.
//! Clients send `{action, data}` with one of:
//!
//! - `ping` answered with a `pong` frame
//! - `subscribe` with `{"tenant_id": "<id>" | "all"}`
//! - `unsubscribe` which stops event delivery until the next subscribe
//! - `ack` with `{"event_id": "<uuid>"}`
//!
//! Control frames only ever change the sending client's own scope.

use axum::extract::ws::{Message, WebSocket};
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use switchboard_core::TenantId;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    error::{RealtimeError, Result},
    hub::Hub,
    subscriber::{Frame, HubMessage, Scope, SubscriberId, WILDCARD},
};

/// Outbound frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerFrame {
    /// Event kind or control reply name.
    pub event: String,
    /// Tenant the event belongs to; absent on control replies.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_id: Option<TenantId>,
    /// Event ID to acknowledge; absent on control replies.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_id: Option<Uuid>,
    /// Payload.
    #[serde(default)]
    pub data: Value,
    /// Unix timestamp in seconds.
    pub timestamp: i64,
}

impl ServerFrame {
    fn control(event: &str, data: Value) -> Self {
        Self {
            event: event.to_string(),
            instance_id: None,
            event_id: None,
            data,
            timestamp: chrono::Utc::now().timestamp(),
        }
    }

    fn error(message: impl Into<String>) -> Self {
        Self::control("error", json!({ "message": message.into() }))
    }
}

impl From<&HubMessage> for ServerFrame {
    fn from(message: &HubMessage) -> Self {
        Self {
            event: message.kind.to_string(),
            instance_id: Some(message.tenant_id.clone()),
            event_id: Some(message.event_id),
            data: message.data.clone(),
            timestamp: message.timestamp,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ClientFrame {
    action: String,
    #[serde(default)]
    data: Value,
}

/// Parsed client control frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientAction {
    /// Liveness probe.
    Ping,
    /// Receive events of a tenant, or of every tenant.
    Subscribe(Scope),
    /// Stop receiving events.
    Unsubscribe,
    /// Client processed an event.
    Ack(Uuid),
}

impl ClientAction {
    /// Parses a text frame.
    pub fn parse(text: &str) -> Result<Self> {
        let frame: ClientFrame =
            serde_json::from_str(text).map_err(|e| RealtimeError::invalid_frame(e.to_string()))?;

        match frame.action.as_str() {
            "ping" => Ok(Self::Ping),
            "unsubscribe" => Ok(Self::Unsubscribe),
            "subscribe" => {
                let tenant = frame
                    .data
                    .get("tenant_id")
                    .and_then(Value::as_str)
                    .filter(|tenant| !tenant.is_empty())
                    .ok_or_else(|| RealtimeError::invalid_frame("subscribe requires data.tenant_id"))?;
                Ok(Self::Subscribe(Scope::parse(tenant)))
            },
            "ack" => {
                let event_id = frame
                    .data
                    .get("event_id")
                    .and_then(Value::as_str)
                    .and_then(|id| Uuid::parse_str(id).ok())
                    .ok_or_else(|| RealtimeError::invalid_frame("ack requires a uuid data.event_id"))?;
                Ok(Self::Ack(event_id))
            },
            other => Err(RealtimeError::invalid_frame(format!("unknown action '{other}'"))),
        }
    }
}

/// Server side of one WebSocket client's control channel.
#[derive(Debug)]
pub struct WsControl {
    hub: Hub,
    id: SubscriberId,
}

impl WsControl {
    /// Control for subscriber `id` registered on `hub`.
    pub fn new(hub: Hub, id: SubscriberId) -> Self {
        Self { hub, id }
    }

    /// Applies a client text frame and returns the reply.
    pub async fn handle_text(&self, text: &str) -> Result<ServerFrame> {
        let action = match ClientAction::parse(text) {
            Ok(action) => action,
            Err(error) => {
                debug!(client_id = %self.id, error = %error, "rejected client frame");
                return Ok(ServerFrame::error(error.to_string()));
            },
        };

        let reply = match action {
            ClientAction::Ping => ServerFrame::control("pong", Value::Null),
            ClientAction::Subscribe(scope) => {
                let tenant = match &scope {
                    Scope::Tenant(id) => id.to_string(),
                    Scope::All | Scope::None => WILDCARD.to_string(),
                };
                self.hub.set_scope(self.id, scope).await?;
                debug!(client_id = %self.id, tenant_id = %tenant, "client subscribed");
                ServerFrame::control("subscribed", json!({ "tenant_id": tenant }))
            },
            ClientAction::Unsubscribe => {
                self.hub.set_scope(self.id, Scope::None).await?;
                debug!(client_id = %self.id, "client unsubscribed");
                ServerFrame::control("unsubscribed", Value::Null)
            },
            ClientAction::Ack(event_id) => {
                debug!(client_id = %self.id, event_id = %event_id, "event acknowledged");
                ServerFrame::control("ack", json!({ "event_id": event_id }))
            },
        };
        Ok(reply)
    }
}

fn text_message(frame: &ServerFrame) -> Option<Message> {
    match serde_json::to_string(frame) {
        Ok(json) => Some(Message::Text(json.into())),
        Err(e) => {
            warn!("failed to serialize websocket frame: {}", e);
            None
        },
    }
}

/// Runs one WebSocket connection until either side closes it.
pub async fn serve_socket(socket: WebSocket, hub: Hub, scope: Scope) {
    let mut stream = match hub.subscribe(scope).await {
        Ok(stream) => stream,
        Err(error) => {
            warn!(error = %error, "websocket rejected, hub unavailable");
            return;
        },
    };
    let control = WsControl::new(hub.clone(), stream.id());
    let client_id = stream.id();
    info!(client_id = %client_id, "websocket client connected");

    let (mut ws_tx, mut ws_rx) = socket.split();

    loop {
        let outgoing = tokio::select! {
            frame = stream.recv() => match frame {
                Some(Frame::Event(message)) => text_message(&ServerFrame::from(message.as_ref())),
                Some(Frame::Heartbeat) => Some(Message::Ping(Bytes::new())),
                None => break,
            },
            incoming = ws_rx.next() => match incoming {
                Some(Ok(Message::Text(text))) => match control.handle_text(text.as_str()).await {
                    Ok(reply) => text_message(&reply),
                    Err(error) => {
                        warn!(client_id = %client_id, error = %error, "websocket control failed");
                        break;
                    },
                },
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => None,
                Some(Err(e)) => {
                    debug!(client_id = %client_id, "websocket error: {}", e);
                    break;
                },
            },
        };

        if let Some(message) = outgoing {
            if ws_tx.send(message).await.is_err() {
                debug!(client_id = %client_id, "websocket send failed, client disconnected");
                break;
            }
        }
    }

    let _ = hub.unregister(client_id).await;
    info!(client_id = %client_id, "websocket client disconnected");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_every_action() {
        assert_eq!(ClientAction::parse(r#"{"action":"ping"}"#), Ok(ClientAction::Ping));
        assert_eq!(
            ClientAction::parse(r#"{"action":"subscribe","data":{"tenant_id":"acme"}}"#),
            Ok(ClientAction::Subscribe(Scope::Tenant(TenantId::from("acme"))))
        );
        assert_eq!(
            ClientAction::parse(r#"{"action":"subscribe","data":{"tenant_id":"all"}}"#),
            Ok(ClientAction::Subscribe(Scope::All))
        );
        assert_eq!(
            ClientAction::parse(r#"{"action":"unsubscribe","data":null}"#),
            Ok(ClientAction::Unsubscribe)
        );
        let id = Uuid::new_v4();
        assert_eq!(
            ClientAction::parse(&format!(r#"{{"action":"ack","data":{{"event_id":"{id}"}}}}"#)),
            Ok(ClientAction::Ack(id))
        );
    }

    #[test]
    fn rejects_malformed_frames() {
        assert!(ClientAction::parse("not json").is_err());
        assert!(ClientAction::parse(r#"{"action":"subscribe"}"#).is_err());
        assert!(ClientAction::parse(r#"{"action":"ack","data":{"event_id":"nope"}}"#).is_err());
        assert!(matches!(
            ClientAction::parse(r#"{"action":"dance"}"#),
            Err(RealtimeError::InvalidFrame { message }) if message.contains("dance")
        ));
    }

    #[test]
    fn event_frame_carries_tenant_and_event_id() {
        let message = HubMessage::new(
            TenantId::from("acme"),
            switchboard_core::EventKind::MessageReceived,
            json!({"text": "hi"}),
            42,
        );

        let frame = ServerFrame::from(&message);

        assert_eq!(frame.event, "message.received");
        assert_eq!(frame.instance_id, Some(TenantId::from("acme")));
        assert_eq!(frame.data["text"], "hi");
        assert_eq!(frame.event_id, Some(message.event_id));
        assert_eq!(frame.timestamp, 42);
    }
}
