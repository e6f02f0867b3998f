//! Test doubles and fixtures for switchboard integration tests.
//!
//! Provides a scriptable session transport, a sink that records every
//! event it receives, fixture builders, and a polling helper for asserting
//! on state that background tasks update.

#![warn(missing_docs)]
#![forbid(unsafe_code)]

pub mod fixtures;
pub mod sink;
pub mod transport;

use std::{future::Future, time::Duration};

pub use fixtures::{inbound_message, send_text_command, tenant, TenantBuilder};
pub use sink::RecordingSink;
pub use switchboard_core::{Clock, TestClock};
pub use transport::{MockTransport, MockTransportFactory};

/// Polls `check` until it returns true or `timeout` elapses.
///
/// Background tasks (event pumps, dispatch workers, hub loops) complete on
/// their own schedule; this gives them a bounded amount of real time.
pub async fn eventually<F, Fut>(timeout: Duration, mut check: F) -> anyhow::Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check().await {
            return Ok(());
        }
        if tokio::time::Instant::now() >= deadline {
            anyhow::bail!("condition not met within {timeout:?}");
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
