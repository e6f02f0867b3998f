//! Fixture builders with sensible defaults.

use chrono::Utc;
use serde_json::json;
use switchboard_core::{CommandType, ConnectionState, OutboundCommand, Tenant, TenantId};
use switchboard_sessions::{InboundMessage, TransportEvent};

/// Builder for tenants.
#[derive(Debug, Clone)]
pub struct TenantBuilder {
    tenant: Tenant,
}

impl TenantBuilder {
    /// Starts a disconnected tenant named after its ID.
    pub fn new(id: &str) -> Self {
        Self { tenant: Tenant::new(id, id.to_uppercase()) }
    }

    /// Sets the recorded connection state.
    #[must_use]
    pub fn status(mut self, status: ConnectionState) -> Self {
        self.tenant.status = status;
        self
    }

    /// Sets the recorded phone number.
    #[must_use]
    pub fn phone(mut self, phone: &str) -> Self {
        self.tenant.phone = Some(phone.to_string());
        self
    }

    /// Builds the tenant.
    pub fn build(self) -> Tenant {
        self.tenant
    }
}

/// A disconnected tenant with default fields.
pub fn tenant(id: &str) -> Tenant {
    TenantBuilder::new(id).build()
}

/// A `send_text` command with zero retries.
pub fn send_text_command(tenant_id: &str, text: &str) -> OutboundCommand {
    OutboundCommand::new(
        TenantId::from(tenant_id),
        CommandType::SendText,
        "5511988887777",
        json!({ "text": text }),
    )
}

/// An inbound text message transport event.
pub fn inbound_message(text: &str) -> TransportEvent {
    TransportEvent::Message(InboundMessage {
        id: format!("MSG{}", uuid::Uuid::new_v4().simple()),
        chat_id: "5511988887777@s.whatsapp.net".to_string(),
        sender: "5511988887777@s.whatsapp.net".to_string(),
        from_me: false,
        message_type: "text".to_string(),
        text: Some(text.to_string()),
        push_name: Some("Customer".to_string()),
        timestamp: Utc::now().timestamp(),
        content: serde_json::Value::Null,
    })
}
