//! Error types for the real-time hubs.

use thiserror::Error;

/// Result type alias for hub operations.
pub type Result<T> = std::result::Result<T, RealtimeError>;

/// Hub and connection failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RealtimeError {
    /// The hub's control loop has stopped.
    #[error("{hub} hub is closed")]
    HubClosed {
        /// Hub name
        hub: &'static str,
    },

    /// A client control frame could not be understood.
    #[error("invalid client frame: {message}")]
    InvalidFrame {
        /// Parse error
        message: String,
    },
}

impl RealtimeError {
    /// Creates an invalid frame error.
    pub fn invalid_frame(message: impl Into<String>) -> Self {
        Self::InvalidFrame { message: message.into() }
    }
}
