//! Client cache invalidation sets.
//!
//! An [`Invalidations`] value maps a container id (a distributed map, or
//! [`ObjectId::NULL`] for standalone objects) to the member ids that must be
//! evicted from a client's local cache.
//!
//! Binary layout (all integers big-endian):
//!
//! ```text
//! u32 container_count
//! repeat container_count:
//!     u64 container_id
//!     u32 member_count
//!     u64 member_id * member_count
//! ```

use crate::core::error::{CoherenceError, CoherenceResult};
use crate::model::object::ObjectId;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Container → members to evict.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Invalidations {
    entries: BTreeMap<ObjectId, BTreeSet<ObjectId>>,
}

impl Invalidations {
    /// Create an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add one member of a container.
    pub fn add(&mut self, container: ObjectId, member: ObjectId) {
        self.entries.entry(container).or_default().insert(member);
    }

    /// Add a standalone object.
    pub fn add_object(&mut self, object: ObjectId) {
        self.add(ObjectId::NULL, object);
    }

    /// Union another set into this one.
    pub fn add_all(&mut self, other: &Invalidations) {
        for (container, members) in &other.entries {
            self.entries
                .entry(*container)
                .or_default()
                .extend(members.iter().copied());
        }
    }

    /// Remove every (container, member) pair present in `still_valid`.
    ///
    /// Containers left with no members are dropped.
    pub fn remove_all(&mut self, still_valid: &Invalidations) {
        for (container, valid) in &still_valid.entries {
            if let Some(members) = self.entries.get_mut(container) {
                members.retain(|m| !valid.contains(m));
                if members.is_empty() {
                    self.entries.remove(container);
                }
            }
        }
    }

    /// Whether a pair is present.
    pub fn contains(&self, container: ObjectId, member: ObjectId) -> bool {
        self.entries
            .get(&container)
            .is_some_and(|members| members.contains(&member))
    }

    /// Whether `member` is present under any container.
    pub fn contains_member(&self, member: ObjectId) -> bool {
        self.entries.values().any(|members| members.contains(&member))
    }

    /// Members recorded for a container.
    pub fn members(&self, container: ObjectId) -> Option<&BTreeSet<ObjectId>> {
        self.entries.get(&container)
    }

    /// Containers in ascending order.
    pub fn containers(&self) -> impl Iterator<Item = &ObjectId> {
        self.entries.keys()
    }

    /// Total number of (container, member) pairs.
    pub fn size(&self) -> usize {
        self.entries.values().map(BTreeSet::len).sum()
    }

    /// Check if there is nothing to invalidate.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drain into per-container member lists, in container order.
    pub fn into_entries(self) -> Vec<(ObjectId, Vec<ObjectId>)> {
        self.entries
            .into_iter()
            .map(|(container, members)| (container, members.into_iter().collect()))
            .collect()
    }

    /// Encode with the length-prefixed layout.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(4 + self.entries.len() * 12 + self.size() * 8);
        buf.put_u32(self.entries.len() as u32);
        for (container, members) in &self.entries {
            buf.put_u64(container.0);
            buf.put_u32(members.len() as u32);
            for member in members {
                buf.put_u64(member.0);
            }
        }
        buf.freeze()
    }

    /// Decode the length-prefixed layout.
    pub fn decode(mut data: &[u8]) -> CoherenceResult<Self> {
        let mut out = Self::new();
        let containers = read_u32(&mut data, "container count")?;
        for _ in 0..containers {
            let container = ObjectId(read_u64(&mut data, "container id")?);
            let count = read_u32(&mut data, "member count")?;
            if data.remaining() < count as usize * 8 {
                return Err(CoherenceError::codec("truncated invalidation members"));
            }
            let members = out.entries.entry(container).or_default();
            for _ in 0..count {
                members.insert(ObjectId(data.get_u64()));
            }
        }
        if data.has_remaining() {
            return Err(CoherenceError::codec(format!(
                "{} trailing bytes after invalidations",
                data.remaining()
            )));
        }
        Ok(out)
    }
}

fn read_u32(data: &mut &[u8], what: &str) -> CoherenceResult<u32> {
    if data.remaining() < 4 {
        return Err(CoherenceError::codec(format!("truncated {}", what)));
    }
    Ok(data.get_u32())
}

fn read_u64(data: &mut &[u8], what: &str) -> CoherenceResult<u64> {
    if data.remaining() < 8 {
        return Err(CoherenceError::codec(format!("truncated {}", what)));
    }
    Ok(data.get_u64())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn oid(id: u64) -> ObjectId {
        ObjectId(id)
    }

    #[test]
    fn test_add_and_size() {
        let mut inv = Invalidations::new();
        inv.add(oid(1), oid(10));
        inv.add(oid(1), oid(11));
        inv.add(oid(1), oid(10));
        inv.add_object(oid(5));
        assert_eq!(inv.size(), 3);
        assert!(inv.contains(oid(1), oid(11)));
        assert!(inv.contains_member(oid(5)));
    }

    #[test]
    fn test_remove_all_drops_empty_containers() {
        let mut inv = Invalidations::new();
        inv.add(oid(1), oid(10));
        inv.add(oid(2), oid(20));
        inv.add(oid(2), oid(21));

        let mut valid = Invalidations::new();
        valid.add(oid(1), oid(10));
        valid.add(oid(2), oid(21));
        valid.add(oid(3), oid(30));

        inv.remove_all(&valid);
        assert_eq!(inv.size(), 1);
        assert!(inv.members(oid(1)).is_none());
        assert!(inv.contains(oid(2), oid(20)));
    }

    #[test]
    fn test_encoding_layout() {
        let mut inv = Invalidations::new();
        inv.add(oid(7), oid(1));
        let bytes = inv.encode();
        assert_eq!(bytes.len(), 4 + 8 + 4 + 8);
        assert_eq!(&bytes[..4], &[0, 0, 0, 1]);
        assert_eq!(Invalidations::decode(&bytes).unwrap(), inv);
    }

    #[test]
    fn test_decode_truncated() {
        let mut inv = Invalidations::new();
        inv.add(oid(7), oid(1));
        inv.add(oid(7), oid(2));
        let bytes = inv.encode();
        assert!(Invalidations::decode(&bytes[..bytes.len() - 3]).is_err());
        assert!(Invalidations::decode(&[]).is_err());
    }
}
