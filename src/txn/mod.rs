//! Transaction ordering and application.
//!
//! - [`tracker`] - Per-node acceptance order, idempotent resend, low-water marks

pub mod tracker;

pub use tracker::{
    AppliedTransaction, BatchOutcome, Durability, LoggingApplier, RecordingApplier,
    TransactionApplier,
    TransactionBatchTracker,
};
