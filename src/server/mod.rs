//! Coherence server.
//!
//! - [`service`] - subsystem wiring and message handling
//! - [`stages`] - per-node ordered stage workers
//! - [`listener`] - TCP accept loop and connection tasks

pub mod listener;
pub mod service;
pub mod stages;

pub use listener::{CoherenceListener, ConnectionId, ListenerConfig, ListenerMetrics, ListenerState};
pub use service::{notice_to_message, CoherenceService, Outbox, ReplySender, SessionOpen};
pub use stages::{worker_index, StageKind, StageRouter};
