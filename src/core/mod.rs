//! Core runtime infrastructure.
//!
//! - [`config`] - Configuration parsing and validation
//! - [`context`] - Per-node clock, event log and metrics handle
//! - [`error`] - Error types shared by every subsystem
//! - [`runtime`] - Server runtime orchestration
//! - [`time`] - Ticks and deterministic clocks

pub mod config;
pub mod context;
pub mod error;
pub mod runtime;
pub mod time;
