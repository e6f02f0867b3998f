//! Health endpoints.

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use switchboard_core::ConnectionState;
use switchboard_delivery::DispatchStats;
use tracing::{debug, instrument, warn};

use crate::AppState;

/// Health check response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    /// Overall status.
    pub status: HealthStatus,
    /// When the check ran.
    pub timestamp: DateTime<Utc>,
    /// Session counts.
    pub sessions: SessionCounts,
    /// Real-time subscriber counts.
    pub subscribers: SubscriberCounts,
    /// Webhook dispatcher counters.
    pub webhooks: DispatchStats,
    /// Service version.
    pub version: String,
}

/// Overall health.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// Every component answered.
    Healthy,
    /// A hub control loop is gone.
    Unhealthy,
}

/// Sessions by state.
#[derive(Debug, Default, Serialize)]
pub struct SessionCounts {
    /// All sessions.
    pub total: usize,
    /// Sessions in `connected`.
    pub connected: usize,
}

/// Live real-time clients. `None` when the hub did not answer.
#[derive(Debug, Serialize)]
pub struct SubscriberCounts {
    /// SSE clients.
    pub sse: Option<usize>,
    /// WebSocket clients.
    pub websocket: Option<usize>,
}

/// `GET /health`.
#[instrument(name = "health_check", skip(state))]
pub async fn health_check(State(state): State<AppState>) -> Response {
    let snapshots = state.sessions.list().await;
    let sessions = SessionCounts {
        total: snapshots.len(),
        connected: snapshots.iter().filter(|s| s.state == ConnectionState::Connected).count(),
    };

    let subscribers = SubscriberCounts {
        sse: state.sse_hub.subscriber_count().await.ok(),
        websocket: state.ws_hub.subscriber_count().await.ok(),
    };

    let status = if subscribers.sse.is_some() && subscribers.websocket.is_some() {
        HealthStatus::Healthy
    } else {
        warn!("real-time hub not answering");
        HealthStatus::Unhealthy
    };

    let response = HealthResponse {
        status,
        timestamp: state.clock.now_utc(),
        sessions,
        subscribers,
        webhooks: state.webhooks.stats(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    };

    debug!(status = ?response.status, sessions = response.sessions.total, "health check completed");

    let status_code = match status {
        HealthStatus::Healthy => StatusCode::OK,
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };
    (status_code, Json(response)).into_response()
}

/// `GET /live`. Answers as long as the server is running.
pub async fn liveness_check(State(state): State<AppState>) -> Response {
    let response = serde_json::json!({
        "status": "alive",
        "timestamp": state.clock.now_utc(),
        "service": "switchboard",
    });
    (StatusCode::OK, Json(response)).into_response()
}
