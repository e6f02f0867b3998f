//! SSE and WebSocket subscription endpoints.
//!
//! Both take a tenant ID or the wildcard `all`.

use axum::{
    extract::{Path, Query, State, WebSocketUpgrade},
    response::Response,
};
use serde::Deserialize;
use switchboard_realtime::{serve_socket, sse_response, Scope};
use tracing::debug;

use crate::{error::ApiError, AppState};

/// `GET /events/{tenant_id}`. Streams the tenant's events as SSE.
pub async fn sse_events(
    State(state): State<AppState>,
    Path(tenant_id): Path<String>,
) -> Result<Response, ApiError> {
    Ok(sse_response(&state.sse_hub, Scope::parse(&tenant_id)).await?)
}

/// Query of the WebSocket endpoint.
#[derive(Debug, Deserialize)]
pub struct WsParams {
    /// Initial scope. Without it the client receives nothing until it sends
    /// a `subscribe` frame.
    pub tenant_id: Option<String>,
}

/// `GET /ws?tenant_id=<id>`. Upgrades to a WebSocket event stream.
pub async fn ws_connect(
    State(state): State<AppState>,
    Query(params): Query<WsParams>,
    upgrade: WebSocketUpgrade,
) -> Response {
    let scope = params.tenant_id.as_deref().map_or(Scope::None, Scope::parse);
    debug!(scope = ?scope, "websocket upgrade requested");
    let hub = state.ws_hub.clone();
    upgrade.on_upgrade(move |socket| serve_socket(socket, hub, scope))
}
