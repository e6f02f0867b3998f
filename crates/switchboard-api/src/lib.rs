//! Configuration and HTTP surface of the switchboard gateway.
//!
//! The HTTP surface is deliberately thin: health, read-only session
//! snapshots, and the SSE and WebSocket subscription endpoints backed by the
//! real-time hubs.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod error;
pub mod handlers;
pub mod server;
pub mod state;

pub use config::{Config, LogFormat};
pub use error::{ApiError, ErrorResponse};
pub use server::{create_router, serve, shutdown_signal};
pub use state::AppState;
