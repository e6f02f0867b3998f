//! Command submission onto the outbound queue.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use switchboard_core::{CommandType, CoreError, OutboundCommand, TenantId};
use switchboard_sessions::MessageContent;
use uuid::Uuid;

use crate::{error::ApiError, AppState};

/// Body of `POST /sessions/{tenant_id}/commands`.
#[derive(Debug, Deserialize)]
pub struct SubmitCommand {
    /// Command type.
    #[serde(rename = "type")]
    pub command_type: CommandType,
    /// Recipient address.
    pub to: String,
    /// Type specific payload.
    #[serde(default)]
    pub payload: Value,
    /// Echoed on every status update. Defaults to the command ID.
    #[serde(default)]
    pub correlation_id: Option<String>,
    /// Producer priority hint.
    #[serde(default)]
    pub priority: u8,
}

/// Accepted command reference.
#[derive(Debug, Serialize)]
pub struct CommandAccepted {
    /// Command ID assigned by the gateway.
    pub id: Uuid,
    /// Correlation ID status updates will carry.
    pub correlation_id: String,
    /// Always `queued`.
    pub status: &'static str,
}

/// `POST /sessions/{tenant_id}/commands`.
///
/// Validates the payload for its command type, then enqueues it. The send
/// itself happens on a worker; its outcome arrives on the status queue.
pub async fn submit_command(
    State(state): State<AppState>,
    Path(tenant_id): Path<String>,
    Json(body): Json<SubmitCommand>,
) -> Result<(StatusCode, Json<CommandAccepted>), ApiError> {
    let tenant_id = TenantId::from(tenant_id);
    if state.sessions.get(&tenant_id).await.is_none() {
        return Err(CoreError::not_found(&tenant_id).into());
    }
    if body.to.trim().is_empty() {
        return Err(CoreError::invalid_input("recipient is required").into());
    }
    MessageContent::from_command(body.command_type, &body.payload)?;

    let mut command = OutboundCommand::new(tenant_id, body.command_type, body.to, body.payload);
    command.priority = body.priority;
    command.created_at = state.clock.now_utc();
    if let Some(correlation_id) = body.correlation_id.filter(|id| !id.is_empty()) {
        command.correlation_id = correlation_id;
    }

    state.commands.submit(&command).await?;

    Ok((
        StatusCode::ACCEPTED,
        Json(CommandAccepted { id: command.id, correlation_id: command.correlation_id, status: "queued" }),
    ))
}
