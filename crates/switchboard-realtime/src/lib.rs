//! Real-time broadcast of domain events to SSE and WebSocket clients.
//!
//! Both transports share [`Hub`]: an actor that owns its subscriber set and
//! fans events out with non-blocking sends, so one slow client never delays
//! the others. The SSE endpoint streams `event:`/`data:` frames; the
//! WebSocket endpoint adds client control frames for changing the
//! subscription at runtime.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod error;
pub mod hub;
pub mod sse;
pub mod subscriber;
pub mod ws;

pub use error::{RealtimeError, Result};
pub use hub::{Hub, HubConfig};
pub use sse::{event_payload, event_stream, sse_event, sse_response};
pub use subscriber::{
    DeliverySubscriber, Frame, HubMessage, Scope, SubscriberId, SubscriberStream, WILDCARD,
};
pub use ws::{serve_socket, ClientAction, ServerFrame, WsControl};
