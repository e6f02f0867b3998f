//! Server-sent events streaming.
//!
//! Each hub message becomes an SSE event named after its kind with the
//! JSON envelope as a single data line. Liveness comments come from axum's
//! keep-alive at the hub's heartbeat interval, so hub heartbeat frames are
//! not forwarded.

use std::convert::Infallible;

use axum::{
    http::HeaderValue,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
};
use futures::Stream;
use serde_json::{json, Value};
use tracing::debug;

use crate::{
    error::Result,
    hub::Hub,
    subscriber::{Frame, HubMessage, Scope, SubscriberStream},
};

/// Text of the keep-alive comment.
pub const HEARTBEAT_COMMENT: &str = "heartbeat";

/// JSON carried in the data line of an event.
pub fn event_payload(message: &HubMessage) -> Value {
    json!({
        "event_id": message.event_id,
        "instance_id": message.tenant_id,
        "data": message.data,
        "timestamp": message.timestamp,
    })
}

/// SSE event for one hub message.
pub fn sse_event(message: &HubMessage) -> Event {
    Event::default().event(message.kind.as_str()).data(event_payload(message).to_string())
}

/// Turns a subscriber stream into SSE events.
///
/// The stream ends when the hub drops the subscriber. Dropping it, as axum
/// does when the client goes away, signals the hub.
pub fn event_stream(stream: SubscriberStream) -> impl Stream<Item = std::result::Result<Event, Infallible>> {
    futures::stream::unfold(stream, |mut stream| async move {
        loop {
            match stream.recv().await? {
                Frame::Event(message) => return Some((Ok(sse_event(&message)), stream)),
                Frame::Heartbeat => {},
            }
        }
    })
}

/// Registers an SSE subscriber on `hub` and returns the streaming response.
pub async fn sse_response(hub: &Hub, scope: Scope) -> Result<Response> {
    let stream = hub.subscribe(scope).await?;
    debug!(hub = hub.name(), client_id = %stream.id(), "sse client connected");

    let keep_alive = KeepAlive::new().interval(hub.heartbeat_interval()).text(HEARTBEAT_COMMENT);
    let mut response = Sse::new(event_stream(stream)).keep_alive(keep_alive).into_response();
    response.headers_mut().insert("x-accel-buffering", HeaderValue::from_static("no"));
    Ok(response)
}
