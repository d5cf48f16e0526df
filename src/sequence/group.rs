//! Group-aware fan-out.
//!
//! Splits one logical batch request across every server group and merges
//! the per-group sub-ranges. Each sub-range comes from its own group's
//! segment, so the merged result is disjoint from anything any group grants
//! later.

use super::authority::SequenceAuthority;
use super::BatchRange;
use crate::core::error::CoherenceResult;
use crate::model::node::{GroupId, NodeId};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Sub-ranges granted by each group for one logical request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupBatch {
    /// Per-group grants, in group order.
    pub parts: Vec<(GroupId, BatchRange)>,
}

impl GroupBatch {
    /// Non-empty ranges sorted by start.
    pub fn ranges(&self) -> Vec<BatchRange> {
        let mut ranges: Vec<BatchRange> = self
            .parts
            .iter()
            .map(|(_, r)| *r)
            .filter(|r| !r.is_empty())
            .collect();
        ranges.sort();
        ranges
    }

    /// Total ids granted.
    pub fn total(&self) -> u64 {
        self.parts.iter().map(|(_, r)| r.len()).sum()
    }

    /// Check if nothing was granted.
    pub fn is_empty(&self) -> bool {
        self.total() == 0
    }
}

/// Fans batch requests out across all groups of an authority.
#[derive(Debug, Clone)]
pub struct GroupSequencer {
    authority: Arc<SequenceAuthority>,
}

impl GroupSequencer {
    /// Wrap an authority.
    pub fn new(authority: Arc<SequenceAuthority>) -> Self {
        Self { authority }
    }

    /// The wrapped authority.
    pub fn authority(&self) -> &Arc<SequenceAuthority> {
        &self.authority
    }

    /// Request at least `size` ids in total, split evenly across groups.
    pub fn request_batch(&self, receiver: NodeId, size: u64) -> CoherenceResult<GroupBatch> {
        let groups = self.authority.group_count() as u64;
        let per_group = size.div_ceil(groups);
        let mut parts = Vec::with_capacity(groups as usize);
        for index in 0..groups as u32 {
            let group = GroupId(index);
            parts.push((group, self.authority.request_batch(receiver, group, per_group)?));
        }
        Ok(GroupBatch { parts })
    }
}
