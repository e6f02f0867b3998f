//! Webhook delivery for normalized domain events.
//!
//! The dispatcher looks up each tenant's webhook configuration, skips
//! events the tenant did not subscribe to, and POSTs a JSON envelope to the
//! configured endpoint. Failed attempts are retried with quadratic backoff
//! inside a per-sequence deadline; a sequence that runs out of budget is
//! logged and discarded.
//!
//! # Architecture
//!
//! 1. **Dispatch** - `WebhookDispatcher::dispatch` queues the event and
//!    returns immediately
//! 2. **Config Check** - a worker loads the tenant's `WebhookConfig`
//! 3. **HTTP Delivery** - `WebhookClient` sends the envelope with
//!    identification headers
//! 4. **Retry** - `RetryPolicy` decides whether and when to try again
//!
//! The dispatcher implements [`switchboard_core::EventSink`], so it plugs
//! into the session registry's fan-out next to the real-time hubs.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod client;
pub mod dispatcher;
pub mod error;
pub mod retry;

pub use client::{ClientConfig, WebhookClient, WebhookEnvelope, WebhookRequest, WebhookResponse};
pub use dispatcher::{
    AttemptRecord, DeliveryOutcome, DeliveryReport, DispatchStats, DispatcherConfig,
    WebhookDispatcher,
};
pub use error::{DeliveryError, ErrorCategory, Result};
pub use retry::{BackoffStrategy, RetryContext, RetryDecision, RetryPolicy};

/// Default number of concurrent delivery sequences.
pub const DEFAULT_WORKER_COUNT: usize = 4;

/// Default number of events waiting for a worker.
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;
