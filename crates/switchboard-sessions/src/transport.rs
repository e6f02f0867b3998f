//! Session transport contract.
//!
//! A transport is the external protocol client for one tenant. The gateway
//! never interprets the wire protocol; it drives the transport through
//! [`SessionTransport`] and consumes its callbacks as a channel of
//! [`TransportEvent`]s.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use switchboard_core::{AccountProfile, CommandType, CoreError, Result, Tenant};
use tokio::sync::mpsc;
use tracing::warn;

/// Content of an outbound message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessageContent {
    /// Text body.
    Text {
        /// Message text.
        #[serde(alias = "body")]
        text: String,
    },
    /// Image by URL.
    Image {
        /// Media URL.
        url: String,
        /// Optional caption.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        caption: Option<String>,
        /// MIME type hint.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        mime_type: Option<String>,
    },
    /// Video by URL.
    Video {
        /// Media URL.
        url: String,
        /// Optional caption.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        caption: Option<String>,
        /// MIME type hint.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        mime_type: Option<String>,
    },
    /// Audio or voice note by URL.
    Audio {
        /// Media URL.
        url: String,
        /// Send as push-to-talk voice note.
        #[serde(default)]
        ptt: bool,
        /// MIME type hint.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        mime_type: Option<String>,
    },
    /// Document by URL.
    Document {
        /// Media URL.
        url: String,
        /// File name shown to the recipient.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        file_name: Option<String>,
        /// Optional caption.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        caption: Option<String>,
        /// MIME type hint.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        mime_type: Option<String>,
    },
    /// Location pin.
    Location {
        /// Latitude in degrees.
        latitude: f64,
        /// Longitude in degrees.
        longitude: f64,
        /// Place name.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
        /// Street address.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        address: Option<String>,
    },
    /// Contact card.
    Contact {
        /// Name shown on the card.
        display_name: String,
        /// vCard body.
        vcard: String,
    },
    /// Reaction to an existing message.
    Reaction {
        /// Message being reacted to.
        message_id: String,
        /// Reaction emoji; empty removes a previous reaction.
        emoji: String,
    },
}

impl MessageContent {
    /// Builds the content for a queued command from its JSON payload.
    pub fn from_command(command_type: CommandType, payload: &Value) -> Result<Self> {
        let tag = match command_type {
            CommandType::SendText => "text",
            CommandType::SendImage => "image",
            CommandType::SendVideo => "video",
            CommandType::SendAudio => "audio",
            CommandType::SendDocument => "document",
            CommandType::SendLocation => "location",
            CommandType::SendContact => "contact",
            CommandType::SendReaction => "reaction",
        };

        let mut fields = match payload {
            Value::Object(fields) => fields.clone(),
            Value::Null => serde_json::Map::new(),
            other => {
                return Err(CoreError::invalid_input(format!(
                    "{command_type} payload must be an object, got {other}"
                )));
            },
        };
        fields.insert("type".into(), Value::String(tag.into()));

        serde_json::from_value(Value::Object(fields))
            .map_err(|e| CoreError::invalid_input(format!("invalid {command_type} payload: {e}")))
    }
}

/// One message to send through a transport.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SendRequest {
    /// Recipient address.
    pub to: String,
    /// Message content.
    pub content: MessageContent,
}

/// Inbound message as reported by the transport.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct InboundMessage {
    /// Transport message ID.
    pub id: String,
    /// Chat address.
    pub chat_id: String,
    /// Sender address.
    pub sender: String,
    /// Sent by the paired account from another device.
    #[serde(default)]
    pub from_me: bool,
    /// Content type.
    #[serde(default = "default_message_type")]
    pub message_type: String,
    /// Text body or caption.
    #[serde(default)]
    pub text: Option<String>,
    /// Sender push name.
    #[serde(default)]
    pub push_name: Option<String>,
    /// Unix seconds.
    #[serde(default)]
    pub timestamp: i64,
    /// Remaining content fields.
    #[serde(default)]
    pub content: Value,
}

fn default_message_type() -> String {
    "text".to_string()
}

/// Delivery or read receipt.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Receipt {
    /// Acknowledged message IDs.
    pub message_ids: Vec<String>,
    /// Chat address.
    pub chat_id: String,
    /// Receipt issuer.
    pub sender: String,
    /// `delivered`, `read`, `played`.
    #[serde(rename = "type", default = "default_receipt_type")]
    pub receipt_type: String,
    /// Unix seconds.
    #[serde(default)]
    pub timestamp: i64,
}

fn default_receipt_type() -> String {
    "delivered".to_string()
}

/// Group metadata or membership change.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct GroupChange {
    /// Group address.
    pub group_id: String,
    /// Change action.
    pub action: String,
    /// Affected participants.
    #[serde(default)]
    pub participants: Vec<String>,
    /// Participant who made the change.
    #[serde(default)]
    pub actor: Option<String>,
}

/// Every event a transport can emit.
///
/// Closed over the kinds the gateway understands, with an explicit
/// [`TransportEvent::Unknown`] for the rest so nothing is silently lost.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// Pairing code issued.
    Qr {
        /// Raw pairing code.
        code: String,
    },
    /// Authentication confirmed.
    Connected {
        /// Authenticated account.
        profile: AccountProfile,
    },
    /// Connection dropped.
    Disconnected {
        /// Transport supplied reason.
        reason: Option<String>,
        /// Transport will reconnect on its own.
        will_reconnect: bool,
    },
    /// Device was unpaired; credentials are gone.
    LoggedOut {
        /// Transport supplied reason.
        reason: Option<String>,
    },
    /// Connecting failed and will not be retried by the transport.
    ConnectFailure {
        /// Failure reason.
        reason: String,
    },
    /// Inbound message.
    Message(InboundMessage),
    /// Delivery or read receipt.
    Receipt(Receipt),
    /// Contact online/offline.
    Presence {
        /// Contact address.
        jid: String,
        /// Online flag.
        available: bool,
        /// Last seen, Unix seconds.
        last_seen: Option<i64>,
    },
    /// Typing or recording indicator in a chat.
    ChatPresence {
        /// Chat address.
        chat_id: String,
        /// Participant typing.
        sender: String,
        /// `composing`, `recording`, `paused`.
        state: String,
    },
    /// Group change.
    Group(GroupChange),
    /// Internal history sync chunk.
    HistorySync {
        /// Conversations in the chunk.
        conversations: usize,
    },
    /// Transport keepalive notification.
    KeepAlive,
    /// Event type not known to the gateway.
    Unknown {
        /// Transport type name.
        kind: String,
        /// Raw data.
        raw: Value,
    },
}

#[derive(Deserialize)]
struct QrData {
    code: String,
}

#[derive(Deserialize)]
struct ConnectedData {
    #[serde(alias = "jid")]
    phone: String,
    #[serde(default, alias = "push_name")]
    display_name: Option<String>,
    #[serde(default)]
    avatar_url: Option<String>,
}

#[derive(Deserialize)]
struct DisconnectedData {
    #[serde(default)]
    reason: Option<String>,
    #[serde(default)]
    will_reconnect: bool,
}

#[derive(Deserialize)]
struct ReasonData {
    #[serde(default)]
    reason: Option<String>,
}

#[derive(Deserialize)]
struct PresenceData {
    jid: String,
    #[serde(default)]
    available: bool,
    #[serde(default)]
    last_seen: Option<i64>,
}

#[derive(Deserialize)]
struct ChatPresenceData {
    chat_id: String,
    sender: String,
    state: String,
}

#[derive(Deserialize)]
struct HistorySyncData {
    #[serde(default)]
    conversations: usize,
}

fn parse<T: serde::de::DeserializeOwned>(kind: &str, data: &Value) -> Result<T> {
    T::deserialize(data).map_err(|e| CoreError::InvalidEvent {
        kind: kind.to_string(),
        reason: e.to_string(),
    })
}

impl TransportEvent {
    /// Parses a raw `{type, data}` event, rejecting malformed known types.
    pub fn try_from_raw(kind: &str, data: Value) -> Result<Self> {
        let event = match kind {
            "qr" => Self::Qr { code: parse::<QrData>(kind, &data)?.code },
            "connected" | "pair_success" => {
                let connected: ConnectedData = parse(kind, &data)?;
                Self::Connected {
                    profile: AccountProfile {
                        phone: connected.phone,
                        display_name: connected.display_name,
                        avatar_url: connected.avatar_url,
                    },
                }
            },
            "disconnected" => {
                let disconnected: DisconnectedData = parse(kind, &data)?;
                Self::Disconnected {
                    reason: disconnected.reason,
                    will_reconnect: disconnected.will_reconnect,
                }
            },
            "logged_out" => Self::LoggedOut { reason: parse::<ReasonData>(kind, &data)?.reason },
            "connect_failure" => Self::ConnectFailure {
                reason: parse::<ReasonData>(kind, &data)?
                    .reason
                    .unwrap_or_else(|| "connect failure".to_string()),
            },
            "message" => Self::Message(parse(kind, &data)?),
            "receipt" => Self::Receipt(parse(kind, &data)?),
            "presence" => {
                let presence: PresenceData = parse(kind, &data)?;
                Self::Presence {
                    jid: presence.jid,
                    available: presence.available,
                    last_seen: presence.last_seen,
                }
            },
            "chat_presence" => {
                let presence: ChatPresenceData = parse(kind, &data)?;
                Self::ChatPresence {
                    chat_id: presence.chat_id,
                    sender: presence.sender,
                    state: presence.state,
                }
            },
            "group_info" | "joined_group" => Self::Group(parse(kind, &data)?),
            "history_sync" => Self::HistorySync {
                conversations: parse::<HistorySyncData>(kind, &data)?.conversations,
            },
            "keepalive" | "keep_alive" => Self::KeepAlive,
            _ => Self::Unknown { kind: kind.to_string(), raw: data },
        };
        Ok(event)
    }

    /// Parses a raw `{type, data}` event.
    ///
    /// Malformed events of a known type are logged and surfaced as
    /// [`TransportEvent::Unknown`] so consumers can still see them.
    pub fn from_raw(kind: &str, data: Value) -> Self {
        match Self::try_from_raw(kind, data.clone()) {
            Ok(event) => event,
            Err(error) => {
                warn!(event_type = kind, error = %error, "malformed transport event");
                Self::Unknown { kind: kind.to_string(), raw: data }
            },
        }
    }
}

/// Protocol client for one tenant session.
#[async_trait]
pub trait SessionTransport: Send + Sync + std::fmt::Debug {
    /// Starts connecting. Progress is reported through transport events.
    async fn connect(&self) -> Result<()>;

    /// Closes the connection, keeping credentials.
    async fn disconnect(&self) -> Result<()>;

    /// Unpairs the device and discards credentials.
    async fn logout(&self) -> Result<()>;

    /// Whether the transport currently has an authenticated connection.
    async fn is_connected(&self) -> bool;

    /// Sends a message and returns the transport message ID.
    async fn send(&self, request: SendRequest) -> Result<String>;
}

/// A freshly created transport and its event stream.
#[derive(Debug)]
pub struct TransportHandle {
    /// The transport.
    pub transport: Arc<dyn SessionTransport>,
    /// Events emitted by the transport, in emission order.
    pub events: mpsc::Receiver<TransportEvent>,
}

/// Creates one transport per tenant session.
pub trait TransportFactory: Send + Sync + std::fmt::Debug {
    /// Creates the transport for `tenant`. Must not start connecting.
    fn create(&self, tenant: &Tenant) -> Result<TransportHandle>;
}
