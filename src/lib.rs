//! Coherence - coordination core for a shared, cache-coherent object space.
//!
//! A coherence server arbitrates distributed locks, orders and fans out
//! object transactions, tracks which client caches hold which objects and
//! hands out globally unique ids in batches. Clients keep a local cache that
//! stays coherent through invalidation pushes and resume their session after
//! a dropped connection within a reconnect window.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                         Client core                             │
//! │   session │ cache │ local locks │ pending transactions │ ids    │
//! └─────────────────────────────────────────────────────────────────┘
//!                                  │ length-prefixed frames
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                     Listener + stage router                     │
//! │          handshake stage │ lock stage │ transaction stage       │
//! └─────────────────────────────────────────────────────────────────┘
//!                                  │
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                       Coherence service                         │
//! │  handshake coordinator │ lock manager │ tracker │ registry │ ids│
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Module Organization
//!
//! ## Core
//! - [`core::config`] - Configuration parsing and validation
//! - [`core::runtime`] - Server runtime orchestration
//! - [`core::time`] - Ticks and deterministic clocks
//! - [`core::error`] - Error types
//!
//! ## Coordination
//! - [`model`] - Identities, lock levels, change sets, invalidations
//! - [`locks`] - Lock state machines, timers, deadlock detection
//! - [`registry`] - Per-client object references and invalidation fan-out
//! - [`txn`] - Transaction ordering, resend handling, low-water marks
//! - [`sequence`] - Batched unique id allocation
//!
//! ## Sessions and transport
//! - [`protocol`] - Messages and frame codec
//! - [`handshake`] - Session establishment, reconnect window, starting phase
//! - [`client`] - Client session, cache, lock view and connection driver
//! - [`server`] - Service wiring, stage workers, TCP listener
//!
//! ## Operations
//! - [`ops::events`] - Operator event log
//! - [`ops::metrics`] - Metrics and health
//! - [`cli`] - Command-line entrypoints
//!
//! # Key Invariants
//!
//! - A lock is held exclusively or shared by compatible levels only; waiters
//!   are granted in arrival order.
//! - Every client caching a changed object is invalidated before the
//!   committing client is acknowledged.
//! - Ids handed out by one server are never reused, across restarts too.
//! - Transactions from one node are applied in sequence order exactly once.

// Core infrastructure
pub mod core;

// Data model
pub mod model;

// Coordination
pub mod locks;
pub mod registry;
pub mod sequence;
pub mod txn;

// Sessions and transport
pub mod client;
pub mod handshake;
pub mod protocol;
pub mod server;

// Operations and observability
pub mod ops;

// CLI
pub mod cli;

/// Wire protocol version spoken by this build.
pub const PROTOCOL_VERSION: &str = "1.0";

// Re-exports for convenience
pub use self::core::{config, context, error, runtime, time};
pub use ops::{events, metrics};
