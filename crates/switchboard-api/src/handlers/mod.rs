//! HTTP request handlers.
//!
//! - `health` - liveness and component counts
//! - `sessions` - read-only session snapshots
//! - `commands` - outbound command submission
//! - `realtime` - SSE streams and WebSocket upgrades

pub mod commands;
pub mod health;
pub mod realtime;
pub mod sessions;

pub use commands::submit_command;
pub use health::{health_check, liveness_check};
pub use realtime::{sse_events, ws_connect};
pub use sessions::{get_session, list_sessions};
