//! Operations and observability.
//!
//! - [`events`] - Bounded operator event log mirrored to `tracing`
//! - [`metrics`] - Counters, gauges and health status

pub mod events;
pub mod metrics;

pub use events::{EventKind, OperatorEvent, OperatorEventLog, Severity};
pub use metrics::{HealthStatus, MetricsRegistry};
