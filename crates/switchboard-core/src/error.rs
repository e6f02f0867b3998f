//! Error taxonomy shared by the session, coordination and queue layers.
//!
//! Each variant carries a stable code and an [`ErrorClass`] that the HTTP
//! surface maps to a status code. Asynchronous dispatch failures never reach
//! this type; they are logged by the channel that saw them.

use std::fmt;

use thiserror::Error;

use crate::models::{ConnectionState, TenantId};

/// Result type alias using [`CoreError`].
pub type Result<T> = std::result::Result<T, CoreError>;

/// Coarse classification used to pick a user-visible status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Unknown tenant or resource.
    NotFound,
    /// Request cannot be served in the current state.
    BadRequest,
    /// Anything else.
    Internal,
}

impl ErrorClass {
    /// HTTP status conventionally used for this class.
    pub const fn http_status(self) -> u16 {
        match self {
            Self::NotFound => 404,
            Self::BadRequest => 400,
            Self::Internal => 500,
        }
    }
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound => write!(f, "not_found"),
            Self::BadRequest => write!(f, "bad_request"),
            Self::Internal => write!(f, "internal"),
        }
    }
}

/// Core error type.
#[derive(Debug, Error)]
pub enum CoreError {
    /// No session or record exists for the tenant.
    #[error("[E1001] Tenant {tenant_id} not found")]
    NotFound {
        /// Tenant that was looked up
        tenant_id: TenantId,
    },

    /// A session for the tenant already exists.
    #[error("[E1002] Session for tenant {tenant_id} already exists")]
    AlreadyExists {
        /// Tenant whose session exists
        tenant_id: TenantId,
    },

    /// Operation requires a connected session.
    #[error("[E1003] Tenant {tenant_id} is not connected (state: {state})")]
    NotConnected {
        /// Tenant the operation targeted
        tenant_id: TenantId,
        /// State the session was in
        state: ConnectionState,
    },

    /// State machine rejected a transition.
    #[error("[E1004] Invalid transition '{transition}' from state {from}")]
    InvalidTransition {
        /// State before the rejected transition
        from: ConnectionState,
        /// Name of the rejected transition
        transition: &'static str,
    },

    /// Malformed input from a caller.
    #[error("[E1005] Invalid input: {message}")]
    InvalidInput {
        /// Description of the problem
        message: String,
    },

    /// Transport event could not be interpreted.
    #[error("[E2001] Invalid event '{kind}': {reason}")]
    InvalidEvent {
        /// Transport event type
        kind: String,
        /// Why it was rejected
        reason: String,
    },

    /// Session transport call failed.
    #[error("[E2002] Transport error: {message}")]
    Transport {
        /// Transport supplied message
        message: String,
    },

    /// Distributed lock is held by another owner.
    #[error("[E3001] Lock '{name}' is held by another owner")]
    LockContention {
        /// Lock name
        name: String,
    },

    /// Shared cache unavailable or returned an error.
    #[error("[E3002] Cache error: {message}")]
    Cache {
        /// Underlying error
        message: String,
    },

    /// Tenant or webhook persistence failed.
    #[error("[E3003] Storage error: {message}")]
    Storage {
        /// Underlying error
        message: String,
    },
}

impl CoreError {
    /// Creates a not-found error.
    pub fn not_found(tenant_id: &TenantId) -> Self {
        Self::NotFound { tenant_id: tenant_id.clone() }
    }

    /// Creates a not-connected error.
    pub fn not_connected(tenant_id: &TenantId, state: ConnectionState) -> Self {
        Self::NotConnected { tenant_id: tenant_id.clone(), state }
    }

    /// Creates a transport error.
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport { message: message.into() }
    }

    /// Creates a cache error.
    pub fn cache(message: impl Into<String>) -> Self {
        Self::Cache { message: message.into() }
    }

    /// Creates a storage error.
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage { message: message.into() }
    }

    /// Creates an invalid input error.
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput { message: message.into() }
    }

    /// Returns the stable error code.
    pub const fn code(&self) -> &'static str {
        match self {
            Self::NotFound { .. } => "E1001",
            Self::AlreadyExists { .. } => "E1002",
            Self::NotConnected { .. } => "E1003",
            Self::InvalidTransition { .. } => "E1004",
            Self::InvalidInput { .. } => "E1005",
            Self::InvalidEvent { .. } => "E2001",
            Self::Transport { .. } => "E2002",
            Self::LockContention { .. } => "E3001",
            Self::Cache { .. } => "E3002",
            Self::Storage { .. } => "E3003",
        }
    }

    /// Returns the user-visible classification.
    pub const fn class(&self) -> ErrorClass {
        match self {
            Self::NotFound { .. } => ErrorClass::NotFound,
            Self::NotConnected { .. }
            | Self::AlreadyExists { .. }
            | Self::InvalidTransition { .. }
            | Self::InvalidInput { .. } => ErrorClass::BadRequest,
            _ => ErrorClass::Internal,
        }
    }

    /// Returns whether retrying the same operation later may succeed.
    ///
    /// `LockContention` is deliberately not retryable: someone else is doing
    /// the work.
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::NotConnected { .. }
                | Self::Transport { .. }
                | Self::Cache { .. }
                | Self::Storage { .. }
        )
    }
}
