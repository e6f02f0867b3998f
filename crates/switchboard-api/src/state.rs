//! Shared handler state.

use std::sync::Arc;

use switchboard_core::Clock;
use switchboard_delivery::WebhookDispatcher;
use switchboard_queue::CommandPublisher;
use switchboard_realtime::Hub;
use switchboard_sessions::SessionRegistry;

/// Components the HTTP handlers read from.
#[derive(Debug, Clone)]
pub struct AppState {
    /// Tenant sessions.
    pub sessions: Arc<SessionRegistry>,
    /// Server-sent events hub.
    pub sse_hub: Hub,
    /// WebSocket hub.
    pub ws_hub: Hub,
    /// Producer side of the command queue.
    pub commands: CommandPublisher,
    /// Webhook dispatcher, for its counters.
    pub webhooks: Arc<WebhookDispatcher>,
    /// Time source for response timestamps.
    pub clock: Arc<dyn Clock>,
}
