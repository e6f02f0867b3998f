//! Read-only session views.

use axum::{
    extract::{Path, State},
    Json,
};
use switchboard_core::{CoreError, SessionSnapshot, TenantId};

use crate::{error::ApiError, AppState};

/// `GET /sessions`.
pub async fn list_sessions(State(state): State<AppState>) -> Json<Vec<SessionSnapshot>> {
    Json(state.sessions.list().await)
}

/// `GET /sessions/{tenant_id}`.
pub async fn get_session(
    State(state): State<AppState>,
    Path(tenant_id): Path<String>,
) -> Result<Json<SessionSnapshot>, ApiError> {
    let tenant_id = TenantId::from(tenant_id);
    match state.sessions.get(&tenant_id).await {
        Some(snapshot) => Ok(Json(snapshot)),
        None => Err(CoreError::not_found(&tenant_id).into()),
    }
}
