//! Command handlers keyed by command type.

use std::{collections::HashMap, fmt, sync::Arc};

use async_trait::async_trait;
use switchboard_core::{CommandType, OutboundCommand};
use switchboard_sessions::{MessageContent, SendRequest, SessionRegistry};
use tracing::debug;

use crate::error::CommandError;

/// Every command type the gateway can send.
pub const SEND_COMMANDS: [CommandType; 8] = [
    CommandType::SendText,
    CommandType::SendImage,
    CommandType::SendVideo,
    CommandType::SendAudio,
    CommandType::SendDocument,
    CommandType::SendLocation,
    CommandType::SendContact,
    CommandType::SendReaction,
];

/// Performs one command.
#[async_trait]
pub trait CommandHandler: Send + Sync {
    /// Executes `command` and returns the transport message ID.
    async fn handle(&self, command: &OutboundCommand) -> Result<String, CommandError>;
}

/// Handler lookup by command type.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<CommandType, Arc<dyn CommandHandler>>,
}

impl HandlerRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry sending every command type through `sessions`.
    pub fn for_sessions(sessions: Arc<SessionRegistry>) -> Self {
        let handler: Arc<dyn CommandHandler> = Arc::new(SessionSendHandler::new(sessions));
        SEND_COMMANDS
            .into_iter()
            .fold(Self::new(), |registry, command_type| {
                registry.with_handler(command_type, Arc::clone(&handler))
            })
    }

    /// Registers `handler` for `command_type`, replacing any previous one.
    #[must_use]
    pub fn with_handler(mut self, command_type: CommandType, handler: Arc<dyn CommandHandler>) -> Self {
        self.handlers.insert(command_type, handler);
        self
    }

    /// Handler for `command_type`.
    pub fn get(&self, command_type: CommandType) -> Option<Arc<dyn CommandHandler>> {
        self.handlers.get(&command_type).cloned()
    }

    /// Number of registered command types.
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// Whether no handler is registered.
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut types: Vec<_> = self.handlers.keys().map(|t| t.as_str()).collect();
        types.sort_unstable();
        f.debug_struct("HandlerRegistry").field("types", &types).finish()
    }
}

/// Sends commands through the tenant's session.
#[derive(Debug, Clone)]
pub struct SessionSendHandler {
    sessions: Arc<SessionRegistry>,
}

impl SessionSendHandler {
    /// Creates a handler over `sessions`.
    pub fn new(sessions: Arc<SessionRegistry>) -> Self {
        Self { sessions }
    }
}

#[async_trait]
impl CommandHandler for SessionSendHandler {
    async fn handle(&self, command: &OutboundCommand) -> Result<String, CommandError> {
        let content = MessageContent::from_command(command.command_type, &command.payload)?;
        let request = SendRequest { to: command.to.clone(), content };

        let external_id = self.sessions.send(&command.instance_id, request).await?;
        debug!(
            tenant_id = %command.instance_id,
            command_id = %command.id,
            external_id = %external_id,
            "message handed to session"
        );
        Ok(external_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixed;

    #[async_trait]
    impl CommandHandler for Fixed {
        async fn handle(&self, _command: &OutboundCommand) -> Result<String, CommandError> {
            Ok("fixed".to_string())
        }
    }

    #[tokio::test]
    async fn later_registration_wins() {
        let registry = HandlerRegistry::new()
            .with_handler(CommandType::SendText, Arc::new(Fixed))
            .with_handler(CommandType::SendText, Arc::new(Fixed));

        assert_eq!(registry.len(), 1);
        assert!(registry.get(CommandType::SendImage).is_none());
        let command = OutboundCommand::new(
            "acme",
            CommandType::SendText,
            "5511988887777",
            serde_json::json!({"text": "hi"}),
        );
        let handler = registry.get(CommandType::SendText).unwrap();
        assert_eq!(handler.handle(&command).await.unwrap(), "fixed");
    }

    #[test]
    fn debug_lists_registered_types() {
        let registry = HandlerRegistry::new().with_handler(CommandType::SendAudio, Arc::new(Fixed));

        assert_eq!(format!("{registry:?}"), r#"HandlerRegistry { types: ["send_audio"] }"#);
    }
}
