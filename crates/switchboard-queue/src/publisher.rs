//! Producer side of the command queue.

use std::sync::Arc;

use bytes::Bytes;
use switchboard_core::OutboundCommand;
use tracing::debug;

use crate::{error::Result, transport::QueueTransport};

/// Publishes outbound commands for the worker pool to execute.
#[derive(Debug, Clone)]
pub struct CommandPublisher {
    transport: Arc<dyn QueueTransport>,
    queue: String,
}

impl CommandPublisher {
    /// Creates a publisher that enqueues on `queue`.
    pub fn new(transport: Arc<dyn QueueTransport>, queue: impl Into<String>) -> Self {
        Self { transport, queue: queue.into() }
    }

    /// Queue commands are published to.
    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Enqueues `command`.
    pub async fn submit(&self, command: &OutboundCommand) -> Result<()> {
        let payload = serde_json::to_vec(command)?;
        self.transport.publish(&self.queue, Bytes::from(payload)).await?;
        debug!(
            command_id = %command.id,
            tenant_id = %command.instance_id,
            command_type = %command.command_type,
            queue = %self.queue,
            "command queued"
        );
        Ok(())
    }
}
