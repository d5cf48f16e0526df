//! Unique id allocation in batches.
//!
//! - [`authority`] - Server-side per-group counters with persisted ceilings
//! - [`batch`] - Client-side pool handing out local batches
//! - [`group`] - Fan-out of one logical request across all groups

pub mod authority;
pub mod batch;
pub mod group;

pub use authority::{FileSequenceStore, MemorySequenceStore, SequenceAuthority, SequenceStore};
pub use batch::{BatchRequester, BatchSequence, NextBatch};
pub use group::{GroupBatch, GroupSequencer};

use serde::{Deserialize, Serialize};

/// Half-open range `[start, end)` of ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct BatchRange {
    /// First id.
    pub start: u64,
    /// One past the last id.
    pub end: u64,
}

impl BatchRange {
    /// The empty range.
    pub const EMPTY: BatchRange = BatchRange { start: 0, end: 0 };

    /// Create a range. `end` is clamped to be at least `start`.
    pub fn new(start: u64, end: u64) -> Self {
        Self {
            start,
            end: end.max(start),
        }
    }

    /// Number of ids.
    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    /// Check if the range holds no ids.
    pub fn is_empty(&self) -> bool {
        self.start >= self.end
    }

    /// Whether `id` falls in the range.
    pub fn contains(&self, id: u64) -> bool {
        id >= self.start && id < self.end
    }

    /// Whether two ranges share an id.
    pub fn overlaps(&self, other: &BatchRange) -> bool {
        !self.is_empty() && !other.is_empty() && self.start < other.end && other.start < self.end
    }

    /// Split off up to `size` ids from the front.
    pub fn take_front(&mut self, size: u64) -> BatchRange {
        let end = self.start.saturating_add(size).min(self.end);
        let taken = BatchRange::new(self.start, end);
        self.start = end;
        taken
    }
}

impl std::fmt::Display for BatchRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}, {})", self.start, self.end)
    }
}
