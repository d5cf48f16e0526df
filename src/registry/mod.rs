//! Per-client object reference tracking.
//!
//! - [`client_state`] - Referenced object ids per connected client, change
//!   pruning and invalidation computation

pub mod client_state;

pub use client_state::{ClientInvalidation, ClientStateRegistry};
