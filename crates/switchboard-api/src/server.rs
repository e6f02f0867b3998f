//! Router construction and serving.
//!
//! Requests flow through request ID injection, tracing and a timeout before
//! reaching the handler. The timeout bounds the time to the response head;
//! SSE bodies and upgraded WebSockets stream past it.

use std::{future::Future, time::Duration};

use axum::{
    extract::Request,
    middleware::{self, Next},
    response::Response,
    routing::{get, post},
    Router,
};
use tokio::net::TcpListener;
use tower_http::{timeout::TimeoutLayer, trace::TraceLayer};
use tracing::{error, info};
use uuid::Uuid;

use crate::{handlers, AppState};

/// Builds the router with every route and middleware.
pub fn create_router(state: AppState, request_timeout: Duration) -> Router {
    let health_routes = Router::new()
        .route("/health", get(handlers::health_check))
        .route("/live", get(handlers::liveness_check));

    let session_routes = Router::new()
        .route("/sessions", get(handlers::list_sessions))
        .route("/sessions/{tenant_id}", get(handlers::get_session))
        .route("/sessions/{tenant_id}/commands", post(handlers::submit_command));

    let realtime_routes = Router::new()
        .route("/events/{tenant_id}", get(handlers::sse_events))
        .route("/ws", get(handlers::ws_connect));

    Router::new()
        .merge(health_routes)
        .merge(session_routes)
        .merge(realtime_routes)
        .layer(TimeoutLayer::new(request_timeout))
        .layer(TraceLayer::new_for_http())
        .layer(middleware::from_fn(inject_request_id))
        .with_state(state)
}

/// Adds an `X-Request-Id` header to every response.
async fn inject_request_id(mut req: Request, next: Next) -> Response {
    let request_id = Uuid::new_v4().to_string();
    req.extensions_mut().insert(request_id.clone());

    let mut response = next.run(req).await;
    if let Ok(header_value) = request_id.parse() {
        response.headers_mut().insert("X-Request-Id", header_value);
    }
    response
}

/// Serves `router` on `listener` until `shutdown` resolves.
///
/// # Errors
///
/// Returns the I/O error that stopped the server.
pub async fn serve(
    listener: TcpListener,
    router: Router,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    let addr = listener.local_addr()?;
    info!(%addr, "HTTP server listening");

    axum::serve(listener, router).with_graceful_shutdown(shutdown).await?;

    info!("HTTP server stopped");
    Ok(())
}

/// Resolves on CTRL+C or SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            },
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
            },
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            info!("Received CTRL+C, starting graceful shutdown");
        },
        () = terminate => {
            info!("Received SIGTERM, starting graceful shutdown");
        },
    }
}
