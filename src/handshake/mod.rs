//! Session establishment and recovery.
//!
//! - [`server`] - Connection state machine, reconnect window, starting phase
//! - [`client`] - Ordered observer dispatch on the client

pub mod client;
pub mod server;

pub use client::{ClientConnectionState, ClientHandshakeCoordinator, HandshakeObserver};
pub use server::{
    ClusterEvent, ConnectionState, ExpiryOutcome, HandshakeSettings, ReleasedAcks,
    ServerHandshakeCoordinator, ServerPhase, Transition,
};
