//! Domain models, events and contracts shared by every switchboard crate.
//!
//! Defines tenants and their connection state, the normalized domain event
//! union that flows from sessions to dispatch channels, queue envelopes for
//! outbound commands, the error taxonomy, and the storage traits consumed by
//! the session registry and webhook dispatcher.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod error;
pub mod events;
pub mod models;
pub mod storage;
pub mod time;

pub use error::{CoreError, ErrorClass, Result};
pub use events::{
    DomainEvent, EventKind, EventPayload, EventSink, MulticastSink, NoOpSink,
};
pub use models::{
    AccountProfile, CommandStatus, CommandType, ConnectionState, OutboundCommand, SessionSnapshot,
    StatusUpdate, Tenant, TenantId, WebhookConfig,
};
pub use storage::{FileStore, MemoryStore, TenantStore, WebhookConfigProvider};
pub use time::{Clock, RealClock, TestClock};
