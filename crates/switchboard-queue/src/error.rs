//! Error types for the queue transport and command handlers.

use std::time::Duration;

use switchboard_core::{ConnectionState, CoreError, TenantId};
use thiserror::Error;

/// Result type alias for queue operations.
pub type Result<T> = std::result::Result<T, QueueError>;

/// Queue transport and worker pool failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueueError {
    /// The broker rejected or failed an operation.
    #[error("queue transport error: {message}")]
    Transport {
        /// Broker supplied message
        message: String,
    },

    /// Ack or nack for a delivery the broker does not know.
    #[error("unknown delivery {delivery_tag} on queue '{queue}'")]
    UnknownDelivery {
        /// Queue the delivery came from
        queue: String,
        /// Broker assigned tag
        delivery_tag: u64,
    },

    /// A message could not be encoded for publishing.
    #[error("failed to encode message: {message}")]
    Encode {
        /// Serializer error
        message: String,
    },

    /// Invalid worker pool configuration.
    #[error("invalid worker configuration: {message}")]
    Configuration {
        /// What is wrong
        message: String,
    },

    /// Workers did not stop in time.
    #[error("worker shutdown timed out after {timeout:?}")]
    ShutdownTimeout {
        /// Timeout that elapsed
        timeout: Duration,
    },
}

impl QueueError {
    /// Creates a transport error.
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport { message: message.into() }
    }

    /// Creates a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration { message: message.into() }
    }
}

impl From<serde_json::Error> for QueueError {
    fn from(error: serde_json::Error) -> Self {
        Self::Encode { message: error.to_string() }
    }
}

/// Why a command handler could not perform a send.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommandError {
    /// The command targets an unknown tenant.
    #[error("tenant {tenant_id} not found")]
    NotFound {
        /// Target tenant
        tenant_id: TenantId,
    },

    /// The tenant's session is not connected.
    #[error("tenant {tenant_id} is not connected (state: {state})")]
    NotConnected {
        /// Target tenant
        tenant_id: TenantId,
        /// Session state at the time of the attempt
        state: ConnectionState,
    },

    /// The command cannot be executed as written.
    #[error("invalid command: {message}")]
    Invalid {
        /// What is wrong
        message: String,
    },

    /// The session transport failed the send.
    #[error("send failed: {message}")]
    Transport {
        /// Transport supplied message
        message: String,
    },
}

impl CommandError {
    /// Creates an invalid command error.
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::Invalid { message: message.into() }
    }

    /// Creates a transport error.
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport { message: message.into() }
    }

    /// Whether another attempt may succeed.
    ///
    /// Sessions come and go, so unknown and disconnected tenants are retried
    /// like transport failures. Invalid commands never become valid.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::Invalid { .. })
    }
}

impl From<CoreError> for CommandError {
    fn from(error: CoreError) -> Self {
        match error {
            CoreError::NotFound { tenant_id } => Self::NotFound { tenant_id },
            CoreError::NotConnected { tenant_id, state } => Self::NotConnected { tenant_id, state },
            CoreError::InvalidInput { message } => Self::Invalid { message },
            other => Self::Transport { message: other.to_string() },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn core_errors_keep_their_meaning() {
        let acme = TenantId::from("acme");

        assert_eq!(
            CommandError::from(CoreError::not_found(&acme)),
            CommandError::NotFound { tenant_id: acme.clone() }
        );
        assert!(matches!(
            CommandError::from(CoreError::not_connected(&acme, ConnectionState::QrPending)),
            CommandError::NotConnected { state: ConnectionState::QrPending, .. }
        ));
        assert!(matches!(
            CommandError::from(CoreError::invalid_input("missing text")),
            CommandError::Invalid { message } if message == "missing text"
        ));
        assert!(matches!(
            CommandError::from(CoreError::transport("socket closed")),
            CommandError::Transport { message } if message.contains("socket closed")
        ));
    }

    #[test]
    fn only_invalid_commands_are_final() {
        assert!(CommandError::transport("timeout").is_retryable());
        assert!(CommandError::NotFound { tenant_id: TenantId::from("acme") }.is_retryable());
        assert!(!CommandError::invalid("no handler").is_retryable());
    }
}
