//! Error types for webhook delivery.
//!
//! Separates failures of a single HTTP attempt (network, timeout, non-2xx
//! status) from failures of the dispatcher itself (full queue, shutdown,
//! configuration lookup), so the retry policy can tell which ones are worth
//! another attempt.

use std::{fmt, time::Duration};

use thiserror::Error;

/// Result type alias for delivery operations.
pub type Result<T> = std::result::Result<T, DeliveryError>;

/// Error conditions of webhook delivery.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeliveryError {
    /// Connection to the endpoint failed.
    #[error("network connection failed: {message}")]
    Network {
        /// Error message describing the network failure
        message: String,
    },

    /// The endpoint did not answer in time.
    #[error("request timeout after {timeout_seconds}s")]
    Timeout {
        /// Configured request timeout
        timeout_seconds: u64,
    },

    /// Endpoint answered with a 4xx status (or another non-2xx, non-5xx one).
    #[error("client error: HTTP {status_code}")]
    ClientError {
        /// HTTP status code
        status_code: u16,
        /// Response body, truncated
        body: String,
    },

    /// Endpoint answered with a 5xx status.
    #[error("server error: HTTP {status_code}")]
    ServerError {
        /// HTTP status code
        status_code: u16,
        /// Response body, truncated
        body: String,
    },

    /// Every attempt of the retry budget failed.
    #[error("delivery failed after {attempts} attempts")]
    RetriesExhausted {
        /// Attempts made
        attempts: u32,
    },

    /// The sequence ran past its deadline, either waiting for a retry or
    /// inside an attempt.
    #[error("delivery deadline of {deadline_seconds}s exceeded after {attempts} attempts")]
    DeadlineExceeded {
        /// Attempts made
        attempts: u32,
        /// Configured deadline
        deadline_seconds: u64,
    },

    /// The dispatch queue is at capacity.
    #[error("dispatch queue full (capacity {capacity})")]
    QueueFull {
        /// Queue capacity
        capacity: usize,
    },

    /// Webhook or tenant configuration could not be read or used.
    #[error("invalid webhook configuration: {message}")]
    Configuration {
        /// Configuration error message
        message: String,
    },

    /// Dispatcher shutdown requested.
    #[error("dispatcher shutdown requested")]
    ShutdownRequested,

    /// Workers did not stop within the shutdown timeout.
    #[error("dispatcher shutdown timed out after {timeout:?}")]
    ShutdownTimeout {
        /// Timeout that was exceeded
        timeout: Duration,
    },
}

impl DeliveryError {
    /// Creates a network error from a message.
    pub fn network(message: impl Into<String>) -> Self {
        Self::Network { message: message.into() }
    }

    /// Creates a timeout error.
    pub fn timeout(timeout_seconds: u64) -> Self {
        Self::Timeout { timeout_seconds }
    }

    /// Creates a client error from an HTTP response.
    pub fn client_error(status_code: u16, body: impl Into<String>) -> Self {
        Self::ClientError { status_code, body: body.into() }
    }

    /// Creates a server error from an HTTP response.
    pub fn server_error(status_code: u16, body: impl Into<String>) -> Self {
        Self::ServerError { status_code, body: body.into() }
    }

    /// Creates a retries exhausted error.
    pub fn retries_exhausted(attempts: u32) -> Self {
        Self::RetriesExhausted { attempts }
    }

    /// Creates a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration { message: message.into() }
    }

    /// Returns whether another attempt may succeed.
    ///
    /// Any failed HTTP exchange is retried within the budget, including 4xx
    /// answers: receivers commonly return 404 or 409 while they deploy.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Network { .. }
                | Self::Timeout { .. }
                | Self::ClientError { .. }
                | Self::ServerError { .. }
        )
    }

    /// HTTP status of the failed attempt, if the endpoint answered.
    pub fn status_code(&self) -> Option<u16> {
        match self {
            Self::ClientError { status_code, .. } | Self::ServerError { status_code, .. } => {
                Some(*status_code)
            },
            _ => None,
        }
    }
}

/// Coarse error category for logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Connectivity and timeouts.
    Network,
    /// 4xx responses.
    Client,
    /// 5xx responses.
    Server,
    /// Retry budget or deadline used up.
    Budget,
    /// Queue full or shutting down.
    Capacity,
    /// Configuration problems.
    Configuration,
}

impl From<&DeliveryError> for ErrorCategory {
    fn from(error: &DeliveryError) -> Self {
        match error {
            DeliveryError::Network { .. } | DeliveryError::Timeout { .. } => Self::Network,
            DeliveryError::ClientError { .. } => Self::Client,
            DeliveryError::ServerError { .. } => Self::Server,
            DeliveryError::RetriesExhausted { .. } | DeliveryError::DeadlineExceeded { .. } => {
                Self::Budget
            },
            DeliveryError::QueueFull { .. }
            | DeliveryError::ShutdownRequested
            | DeliveryError::ShutdownTimeout { .. } => Self::Capacity,
            DeliveryError::Configuration { .. } => Self::Configuration,
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Network => write!(f, "network"),
            Self::Client => write!(f, "client"),
            Self::Server => write!(f, "server"),
            Self::Budget => write!(f, "budget"),
            Self::Capacity => write!(f, "capacity"),
            Self::Configuration => write!(f, "configuration"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failed_http_exchanges_are_retryable() {
        assert!(DeliveryError::network("connection refused").is_retryable());
        assert!(DeliveryError::timeout(30).is_retryable());
        assert!(DeliveryError::server_error(503, "unavailable").is_retryable());
        assert!(DeliveryError::client_error(404, "not found").is_retryable());

        assert!(!DeliveryError::retries_exhausted(4).is_retryable());
        assert!(!DeliveryError::QueueFull { capacity: 8 }.is_retryable());
        assert!(!DeliveryError::configuration("bad url").is_retryable());
        assert!(!DeliveryError::ShutdownRequested.is_retryable());
    }

    #[test]
    fn status_code_only_for_answered_requests() {
        assert_eq!(DeliveryError::server_error(500, "").status_code(), Some(500));
        assert_eq!(DeliveryError::client_error(410, "").status_code(), Some(410));
        assert_eq!(DeliveryError::timeout(5).status_code(), None);
    }

    #[test]
    fn error_categories_mapped_correctly() {
        assert_eq!(ErrorCategory::from(&DeliveryError::network("x")), ErrorCategory::Network);
        assert_eq!(
            ErrorCategory::from(&DeliveryError::client_error(400, "bad request")),
            ErrorCategory::Client
        );
        assert_eq!(
            ErrorCategory::from(&DeliveryError::DeadlineExceeded { attempts: 2, deadline_seconds: 10 }),
            ErrorCategory::Budget
        );
        assert_eq!(ErrorCategory::from(&DeliveryError::ShutdownRequested).to_string(), "capacity");
    }

    #[test]
    fn error_display_format() {
        assert_eq!(DeliveryError::timeout(30).to_string(), "request timeout after 30s");
        assert_eq!(
            DeliveryError::QueueFull { capacity: 1024 }.to_string(),
            "dispatch queue full (capacity 1024)"
        );
    }
}
