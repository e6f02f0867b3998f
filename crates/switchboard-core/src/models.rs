//! Tenant, session and queue envelope models.
//!
//! Tenants are identified by opaque string IDs supplied by the provisioning
//! layer. Queue envelopes serialize to the wire shapes consumed by external
//! producers and status listeners, so field names here are part of the
//! public contract.

use std::{
    collections::{BTreeMap, BTreeSet},
    fmt,
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::events::EventKind;

/// Opaque tenant (instance) identifier.
///
/// Tenant IDs originate outside the gateway, so unlike generated IDs they
/// are kept as strings and never parsed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TenantId(String);

impl TenantId {
    /// Wraps a raw tenant identifier.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the identifier as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TenantId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for TenantId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Connection state of one tenant session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// No transport connection. Initial state.
    #[default]
    Disconnected,
    /// Connect requested, waiting on the transport.
    Connecting,
    /// Transport issued a pairing code that has not been scanned yet.
    QrPending,
    /// Transport confirmed authentication.
    Connected,
    /// Unrecoverable transport failure.
    Error,
}

impl ConnectionState {
    /// Returns the wire name of the state.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::QrPending => "qr_pending",
            Self::Connected => "connected",
            Self::Error => "error",
        }
    }

    /// True while a transport connection exists or is being established.
    pub const fn is_active(self) -> bool {
        matches!(self, Self::Connecting | Self::QrPending | Self::Connected)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A provisioned tenant as recorded by tenant persistence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tenant {
    /// Tenant identifier.
    pub id: TenantId,
    /// Human readable name, echoed in webhook envelopes.
    pub name: String,
    /// Last recorded connection state.
    #[serde(default)]
    pub status: ConnectionState,
    /// Phone number of the paired account, once known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    /// Provisioning time.
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

impl Tenant {
    /// Creates a disconnected tenant.
    pub fn new(id: impl Into<TenantId>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            status: ConnectionState::Disconnected,
            phone: None,
            created_at: Utc::now(),
        }
    }
}

/// Metadata of the account a session is authenticated as.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AccountProfile {
    /// Account phone number.
    pub phone: String,
    /// Display (push) name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    /// Profile picture URL.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
}

/// Point-in-time view of a session, taken under the session lock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionSnapshot {
    /// Tenant the session belongs to.
    pub tenant_id: TenantId,
    /// Tenant name.
    pub name: String,
    /// Connection state.
    pub state: ConnectionState,
    /// Pairing code, present only while `state` is `qr_pending`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub qr: Option<String>,
    /// Authenticated account, present only while connected.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub profile: Option<AccountProfile>,
    /// Time of the last state transition.
    pub updated_at: DateTime<Utc>,
}

/// Per-tenant webhook configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebhookConfig {
    /// Owning tenant.
    pub tenant_id: TenantId,
    /// Endpoint receiving the POSTed envelopes.
    pub url: String,
    /// Subscribed event kinds. Empty means every kind.
    #[serde(default)]
    pub events: BTreeSet<EventKind>,
    /// Extra headers sent with every delivery.
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    /// Disabled configs are ignored by the dispatcher.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Overrides the dispatcher's default retry count.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,
}

fn default_enabled() -> bool {
    true
}

impl WebhookConfig {
    /// Creates an enabled config subscribed to every event kind.
    pub fn new(tenant_id: impl Into<TenantId>, url: impl Into<String>) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            url: url.into(),
            events: BTreeSet::new(),
            headers: BTreeMap::new(),
            enabled: true,
            max_retries: None,
        }
    }

    /// Restricts the subscription to the given kinds.
    #[must_use]
    pub fn with_events(mut self, events: impl IntoIterator<Item = EventKind>) -> Self {
        self.events = events.into_iter().collect();
        self
    }

    /// Adds a custom header.
    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Returns whether an event of `kind` should be delivered.
    pub fn accepts(&self, kind: EventKind) -> bool {
        self.enabled && (self.events.is_empty() || self.events.contains(&kind))
    }
}

/// Kind of outbound send command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandType {
    /// Plain text message.
    SendText,
    /// Image with optional caption.
    SendImage,
    /// Video with optional caption.
    SendVideo,
    /// Audio or voice note.
    SendAudio,
    /// Document attachment.
    SendDocument,
    /// Location pin.
    SendLocation,
    /// Contact card.
    SendContact,
    /// Reaction to an existing message.
    SendReaction,
}

impl CommandType {
    /// Returns the wire name of the command type.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::SendText => "send_text",
            Self::SendImage => "send_image",
            Self::SendVideo => "send_video",
            Self::SendAudio => "send_audio",
            Self::SendDocument => "send_document",
            Self::SendLocation => "send_location",
            Self::SendContact => "send_contact",
            Self::SendReaction => "send_reaction",
        }
    }
}

impl fmt::Display for CommandType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Send command consumed from the durable queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundCommand {
    /// Unique command ID.
    pub id: Uuid,
    /// Producer supplied correlation ID, echoed on every status update.
    #[serde(default)]
    pub correlation_id: String,
    /// Tenant that should send the message.
    pub instance_id: TenantId,
    /// Command type, selects the handler.
    #[serde(rename = "type")]
    pub command_type: CommandType,
    /// Recipient address.
    pub to: String,
    /// Type specific payload.
    #[serde(default)]
    pub payload: Value,
    /// Producer priority hint.
    #[serde(default)]
    pub priority: u8,
    /// Number of failed attempts so far.
    #[serde(default)]
    pub retries: u32,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

impl OutboundCommand {
    /// Creates a fresh command with zero retries.
    pub fn new(
        instance_id: impl Into<TenantId>,
        command_type: CommandType,
        to: impl Into<String>,
        payload: Value,
    ) -> Self {
        let id = Uuid::new_v4();
        Self {
            id,
            correlation_id: id.to_string(),
            instance_id: instance_id.into(),
            command_type,
            to: to.into(),
            payload,
            priority: 0,
            retries: 0,
            created_at: Utc::now(),
        }
    }

    /// Returns the copy to requeue after a failed attempt.
    #[must_use]
    pub fn next_attempt(&self) -> Self {
        Self { retries: self.retries + 1, ..self.clone() }
    }

    /// Key identifying this delivery attempt for deduplication.
    ///
    /// The retry counter is part of the key so a deliberate requeue is not
    /// mistaken for a redelivery of the same attempt.
    pub fn dedup_key(&self) -> String {
        format!("cmd:{}:{}", self.id, self.retries)
    }
}

/// Command processing outcome published on the status queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandStatus {
    /// A worker picked the command up.
    Processing,
    /// The transport accepted the message.
    Sent,
    /// The attempt failed.
    Failed,
}

/// Status envelope published for every command state change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusUpdate {
    /// ID of the command this update refers to.
    pub message_id: String,
    /// Correlation ID copied from the command.
    pub correlation_id: String,
    /// Tenant of the command.
    pub instance_id: TenantId,
    /// New status.
    pub status: CommandStatus,
    /// Failure reason, only for `failed`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Unix timestamp in seconds.
    pub timestamp: i64,
    /// Transport message ID, only for `sent`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_id: Option<String>,
}

impl StatusUpdate {
    fn for_command(command: &OutboundCommand, status: CommandStatus, at: DateTime<Utc>) -> Self {
        Self {
            message_id: command.id.to_string(),
            correlation_id: command.correlation_id.clone(),
            instance_id: command.instance_id.clone(),
            status,
            error: None,
            timestamp: at.timestamp(),
            external_id: None,
        }
    }

    /// Status published when a worker starts on a command.
    pub fn processing(command: &OutboundCommand, at: DateTime<Utc>) -> Self {
        Self::for_command(command, CommandStatus::Processing, at)
    }

    /// Status published after the transport accepted the message.
    pub fn sent(command: &OutboundCommand, external_id: String, at: DateTime<Utc>) -> Self {
        Self { external_id: Some(external_id), ..Self::for_command(command, CommandStatus::Sent, at) }
    }

    /// Status published after a failed attempt.
    pub fn failed(command: &OutboundCommand, reason: impl Into<String>, at: DateTime<Utc>) -> Self {
        Self { error: Some(reason.into()), ..Self::for_command(command, CommandStatus::Failed, at) }
    }
}
