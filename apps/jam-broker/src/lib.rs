//! Session broker for jam session containers.
//!
//! The broker starts one container per collaborative session, waits for the
//! container to call back on the handshake port, then keeps a control
//! connection open to it and routes `correlationId:JSON` frames in both
//! directions. [`lifecycle::SessionBroker`] is the entry point.

pub mod codec;
pub mod config;
pub mod error;
pub mod handshake;
pub mod lifecycle;
pub mod orchestrator;
pub mod pending;
pub mod registry;
pub mod router;
pub mod sanitize;
pub mod store;
pub mod telemetry;

pub use error::BrokerError;
pub use lifecycle::{
    CreateSession, CreatedSession, PurgeReport, SessionBroker, SessionMembership, SessionPhase,
};
pub use router::ResponseHandler;
