//! Outbound send commands consumed from a durable queue.
//!
//! Producers publish `OutboundCommand` envelopes on the command queue. The
//! [`WorkerPool`] consumes them, runs the handler registered for the
//! command type, and echoes `processing`, `sent` and `failed` status
//! updates on the status queue. Failed commands are requeued with an
//! incremented retry counter until the limit, then dead-lettered.
//!
//! The broker sits behind [`QueueTransport`]. [`RedisBroker`] keeps the
//! queues in Redis streams; [`MemoryBroker`] is the in-process
//! implementation. [`CommandPublisher`] is the producer side.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod error;
pub mod handler;
pub mod publisher;
pub mod redis_stream;
pub mod transport;
pub mod worker;

pub use error::{CommandError, QueueError, Result};
pub use handler::{CommandHandler, HandlerRegistry, SessionSendHandler, SEND_COMMANDS};
pub use publisher::CommandPublisher;
pub use redis_stream::{RedisBroker, RedisBrokerConfig};
pub use transport::{Acknowledger, Consumer, Delivery, MemoryBroker, QueueTransport};
pub use worker::{WorkerConfig, WorkerPool, WorkerStats};
