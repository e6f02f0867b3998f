//! Error responses for the HTTP surface.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use switchboard_core::CoreError;
use switchboard_queue::QueueError;
use switchboard_realtime::RealtimeError;
use tracing::error;

/// Error body: `{"error": {"code": "E1001", "message": "..."}}`.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    /// Error details.
    pub error: ErrorDetail,
}

/// Code and message of an error response.
#[derive(Debug, Serialize)]
pub struct ErrorDetail {
    /// Stable error code.
    pub code: String,
    /// Human-readable description.
    pub message: String,
}

/// Failure of a request handler.
#[derive(Debug)]
pub enum ApiError {
    /// Session layer error, mapped by its class.
    Core(CoreError),
    /// A hub is not running.
    Unavailable(RealtimeError),
    /// The command queue rejected a publish.
    Queue(QueueError),
}

impl ApiError {
    /// HTTP status for this error.
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Core(error) => StatusCode::from_u16(error.class().http_status())
                .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
            Self::Unavailable(_) | Self::Queue(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    fn detail(&self) -> ErrorDetail {
        match self {
            Self::Core(error) => ErrorDetail { code: error.code().to_string(), message: error.to_string() },
            Self::Unavailable(error) => {
                ErrorDetail { code: "E4001".to_string(), message: error.to_string() }
            },
            Self::Queue(error) => ErrorDetail { code: "E4002".to_string(), message: error.to_string() },
        }
    }
}

impl From<CoreError> for ApiError {
    fn from(error: CoreError) -> Self {
        Self::Core(error)
    }
}

impl From<RealtimeError> for ApiError {
    fn from(error: RealtimeError) -> Self {
        Self::Unavailable(error)
    }
}

impl From<QueueError> for ApiError {
    fn from(error: QueueError) -> Self {
        Self::Queue(error)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!(status = status.as_u16(), error = ?self, "request failed");
        }
        (status, Json(ErrorResponse { error: self.detail() })).into_response()
    }
}

#[cfg(test)]
mod tests {
    use switchboard_core::{ConnectionState, TenantId};

    use super::*;

    #[test]
    fn core_classes_pick_the_status() {
        let acme = TenantId::from("acme");

        assert_eq!(ApiError::from(CoreError::not_found(&acme)).status(), StatusCode::NOT_FOUND);
        assert_eq!(
            ApiError::from(CoreError::not_connected(&acme, ConnectionState::Disconnected)).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ApiError::from(CoreError::transport("boom")).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            ApiError::from(RealtimeError::HubClosed { hub: "sse" }).status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            ApiError::from(QueueError::transport("connection refused")).status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[test]
    fn detail_carries_the_code() {
        let detail = ApiError::from(CoreError::not_found(&TenantId::from("acme"))).detail();

        assert_eq!(detail.code, "E1001");
        assert!(detail.message.contains("acme"));
    }
}
