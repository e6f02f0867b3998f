//! Tenant sessions: transport contract, connection state machine, event
//! normalization and the registry that owns them.
//!
//! ```text
//! transport ──TransportEvent──▶ event pump ──▶ EventNormalizer
//!                                  │                 │
//!                                  │ Transition      │ DomainEvent
//!                                  ▼                 ▼
//!                            SessionState ──▶ EventSink (dispatch channels)
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod bridge;
pub mod normalizer;
pub mod registry;
pub mod state;
pub mod transport;

pub use bridge::{BridgeConfig, BridgeTransport, BridgeTransportFactory};
pub use normalizer::{EventNormalizer, Normalized};
pub use registry::{RegistryConfig, RestoreReport, SessionRegistry};
pub use state::{Applied, SessionState, Transition};
pub use transport::{
    GroupChange, InboundMessage, MessageContent, Receipt, SendRequest, SessionTransport,
    TransportEvent, TransportFactory, TransportHandle,
};
