//! Client object cache index.
//!
//! Only the ids are tracked here; object bodies live in the application's
//! cache. The server keeps a mirror of this set per client and computes
//! invalidations against it, so the set is sent in every handshake.

use crate::handshake::client::HandshakeObserver;
use crate::model::object::ObjectId;
use crate::protocol::messages::{HandshakeRequest, InvalidationPush};
use parking_lot::Mutex;
use std::collections::BTreeSet;

/// Ids of objects cached by this client.
#[derive(Debug, Default)]
pub struct ClientReferenceCache {
    cached: Mutex<BTreeSet<ObjectId>>,
}

impl ClientReferenceCache {
    /// Empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record newly cached objects. Returns the ids not cached before.
    pub fn add(&self, objects: &[ObjectId]) -> Vec<ObjectId> {
        let mut cached = self.cached.lock();
        objects
            .iter()
            .copied()
            .filter(|id| !id.is_null() && cached.insert(*id))
            .collect()
    }

    /// Forget evicted objects. Returns the ids that were cached.
    pub fn evict(&self, objects: &[ObjectId]) -> Vec<ObjectId> {
        let mut cached = self.cached.lock();
        objects
            .iter()
            .copied()
            .filter(|id| cached.remove(id))
            .collect()
    }

    /// Drop the members named by an invalidation push.
    pub fn invalidate(&self, push: &InvalidationPush) -> usize {
        let mut cached = self.cached.lock();
        push.members.iter().filter(|id| cached.remove(*id)).count()
    }

    /// Whether `object` is cached.
    pub fn contains(&self, object: ObjectId) -> bool {
        self.cached.lock().contains(&object)
    }

    /// Number of cached ids.
    pub fn len(&self) -> usize {
        self.cached.lock().len()
    }

    /// Check if nothing is cached.
    pub fn is_empty(&self) -> bool {
        self.cached.lock().is_empty()
    }
}

impl HandshakeObserver for ClientReferenceCache {
    fn initialize_handshake(&self, request: &mut HandshakeRequest) {
        request.cached_object_ids = self.cached.lock().iter().copied().collect();
    }

    // Invalidations stopped while the server had no record of us.
    fn reset(&self) {
        self.cached.lock().clear();
    }

    fn shutdown(&self) {
        self.cached.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_evict_invalidate() {
        let cache = ClientReferenceCache::new();
        assert_eq!(
            cache.add(&[ObjectId(1), ObjectId(2), ObjectId(1)]),
            vec![ObjectId(1), ObjectId(2)]
        );
        assert!(cache.add(&[ObjectId::NULL]).is_empty());
        assert_eq!(cache.evict(&[ObjectId(2), ObjectId(9)]), vec![ObjectId(2)]);
        cache.add(&[ObjectId(3)]);
        let push = InvalidationPush {
            container: ObjectId::NULL,
            members: vec![ObjectId(1), ObjectId(4)],
        };
        assert_eq!(cache.invalidate(&push), 1);
        let mut request = HandshakeRequest::default();
        cache.initialize_handshake(&mut request);
        assert_eq!(request.cached_object_ids, vec![ObjectId(3)]);
    }
}
