//! Client state registry.
//!
//! Tracks, per connected client, which object ids that client has cached.
//! Change sets produced by applied transactions are pruned against this
//! membership before being pushed: updates go only to clients holding the
//! object, and removals become invalidations for exactly the clients that
//! referenced the removed id.
//!
//! Invalidation computation and reference removal happen under the same
//! lock as `add_reference`, so a reference is either recorded before the
//! invalidation is computed (and is invalidated) or after (and refers to the
//! post-mutation state).

use crate::core::context::NodeContext;
use crate::core::error::{CoherenceError, CoherenceResult};
use crate::model::invalidations::Invalidations;
use crate::model::node::NodeId;
use crate::model::object::{ChangeKind, ChangeSet, ObjectChange, ObjectId};
use crate::ops::metrics::names;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

#[derive(Debug, Default)]
struct ClientState {
    references: HashSet<ObjectId>,
}

/// What one client must receive after a change set was applied.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientInvalidation {
    /// Updates to objects the client caches.
    pub changes: ChangeSet,
    /// Cached entries the client must evict.
    pub invalidations: Invalidations,
}

impl ClientInvalidation {
    /// Check if there is nothing to send.
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty() && self.invalidations.is_empty()
    }
}

/// Registry of referenced object ids per client.
#[derive(Debug)]
pub struct ClientStateRegistry {
    ctx: NodeContext,
    states: Mutex<HashMap<NodeId, ClientState>>,
}

impl ClientStateRegistry {
    /// Create an empty registry.
    pub fn new(ctx: NodeContext) -> Self {
        Self {
            ctx,
            states: Mutex::new(HashMap::new()),
        }
    }

    /// Accept a node, creating its empty entry.
    pub fn startup_node(&self, node: NodeId) -> CoherenceResult<()> {
        if node.is_null() || !node.is_client() {
            return Err(CoherenceError::protocol(
                node,
                "only client nodes carry reference state",
            ));
        }
        let mut states = self.states.lock();
        if states.contains_key(&node) {
            return Err(CoherenceError::NodeAlreadyConnected { node });
        }
        states.insert(node, ClientState::default());
        tracing::debug!(node = %node, "client state created");
        Ok(())
    }

    /// Remove a node and all of its references. Returns how many references
    /// were dropped, or `None` if the node was unknown.
    pub fn shutdown_node(&self, node: NodeId) -> Option<usize> {
        let mut states = self.states.lock();
        let removed = states.remove(&node)?.references.len();
        self.update_gauge(&states);
        tracing::debug!(node = %node, removed, "client state removed");
        Some(removed)
    }

    /// Whether the node has an entry.
    pub fn is_known(&self, node: NodeId) -> bool {
        self.states.lock().contains_key(&node)
    }

    /// Connected nodes, sorted.
    pub fn nodes(&self) -> Vec<NodeId> {
        let mut nodes: Vec<_> = self.states.lock().keys().copied().collect();
        nodes.sort();
        nodes
    }

    /// Record that `node` caches `object`.
    pub fn add_reference(&self, node: NodeId, object: ObjectId) -> CoherenceResult<()> {
        self.add_references(node, std::iter::once(object))?;
        Ok(())
    }

    /// Record several references. Returns the ids that were newly added.
    pub fn add_references(
        &self,
        node: NodeId,
        objects: impl IntoIterator<Item = ObjectId>,
    ) -> CoherenceResult<BTreeSet<ObjectId>> {
        let mut states = self.states.lock();
        let state = states
            .get_mut(&node)
            .ok_or(CoherenceError::UnknownNode { node })?;
        let added: BTreeSet<ObjectId> = objects
            .into_iter()
            .filter(|id| !id.is_null() && state.references.insert(*id))
            .collect();
        self.update_gauge(&states);
        Ok(added)
    }

    /// Re-add the ids a reconnecting client reports as cached.
    pub fn rehydrate(&self, node: NodeId, cached: &[ObjectId]) -> CoherenceResult<usize> {
        let added = self.add_references(node, cached.iter().copied())?;
        tracing::debug!(
            node = %node,
            reported = cached.len(),
            added = added.len(),
            "rehydrated references"
        );
        Ok(added.len())
    }

    /// Of the ids a resuming client reports as cached, those no longer
    /// referenced here. They were invalidated while the client was away.
    pub fn stale_references(
        &self,
        node: NodeId,
        cached: &[ObjectId],
    ) -> CoherenceResult<Vec<ObjectId>> {
        let states = self.states.lock();
        let state = states.get(&node).ok_or(CoherenceError::UnknownNode { node })?;
        Ok(cached
            .iter()
            .copied()
            .filter(|id| !id.is_null() && !state.references.contains(id))
            .collect())
    }

    /// Drop references the client evicted. Returns how many were present.
    pub fn remove_references(&self, node: NodeId, objects: &[ObjectId]) -> usize {
        let mut states = self.states.lock();
        let Some(state) = states.get_mut(&node) else {
            return 0;
        };
        let removed = objects
            .iter()
            .filter(|id| state.references.remove(id))
            .count();
        self.update_gauge(&states);
        removed
    }

    /// Whether `node` caches `object`.
    pub fn has_reference(&self, node: NodeId, object: ObjectId) -> bool {
        self.states
            .lock()
            .get(&node)
            .is_some_and(|state| state.references.contains(&object))
    }

    /// Number of references held by `node`.
    pub fn reference_count(&self, node: NodeId) -> usize {
        self.states
            .lock()
            .get(&node)
            .map_or(0, |state| state.references.len())
    }

    /// Union every client's references into `out`.
    pub fn add_all_referenced_ids_to(&self, out: &mut BTreeSet<ObjectId>) {
        for state in self.states.lock().values() {
            out.extend(state.references.iter().copied());
        }
    }

    /// Filter `changes` down to what `node` caches, folding evictions into
    /// `invalidations` and dropping the evicted references.
    pub fn create_pruned_changes_and_add_object_ids_to(
        &self,
        node: NodeId,
        changes: &ChangeSet,
        invalidations: &mut Invalidations,
    ) -> CoherenceResult<ChangeSet> {
        let mut states = self.states.lock();
        let state = states
            .get_mut(&node)
            .ok_or(CoherenceError::UnknownNode { node })?;
        let pruned = prune(state, changes, invalidations);
        self.update_gauge(&states);
        Ok(pruned)
    }

    /// Compute what every client except `origin` must receive for `changes`,
    /// in one critical section.
    pub fn invalidate_for_all(
        &self,
        origin: NodeId,
        changes: &ChangeSet,
    ) -> BTreeMap<NodeId, ClientInvalidation> {
        let mut states = self.states.lock();
        let mut out = BTreeMap::new();
        for (node, state) in states.iter_mut() {
            if *node == origin {
                continue;
            }
            let mut invalidations = Invalidations::new();
            let pruned = prune(state, changes, &mut invalidations);
            let entry = ClientInvalidation {
                changes: pruned,
                invalidations,
            };
            if !entry.is_empty() {
                out.insert(*node, entry);
            }
        }
        if let Some(state) = states.get_mut(&origin) {
            for removed in changes.removed_ids() {
                state.references.remove(&removed);
            }
        }
        self.update_gauge(&states);
        out
    }

    fn update_gauge(&self, states: &HashMap<NodeId, ClientState>) {
        let total: usize = states.values().map(|s| s.references.len()).sum();
        self.ctx
            .metrics()
            .gauge_set(names::REGISTRY_REFERENCES, total as u64);
    }
}

fn prune(
    state: &mut ClientState,
    changes: &ChangeSet,
    invalidations: &mut Invalidations,
) -> ChangeSet {
    let mut pruned = Vec::new();
    for change in &changes.changes {
        if !state.references.contains(&change.object) {
            continue;
        }
        match (change.kind, change.container) {
            (ChangeKind::Update, None) => pruned.push(change.clone()),
            (ChangeKind::Update, Some(container)) | (ChangeKind::Remove, Some(container)) => {
                invalidations.add(container, change.object);
                state.references.remove(&change.object);
            }
            (ChangeKind::Remove, None) => {
                invalidations.add_object(change.object);
                state.references.remove(&change.object);
            }
        }
    }
    ChangeSet::new(pruned)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> ClientStateRegistry {
        let (ctx, _) = NodeContext::manual("test");
        ClientStateRegistry::new(ctx)
    }

    #[test]
    fn test_startup_rejects_duplicates() {
        let reg = registry();
        let a = NodeId::client(1);
        reg.startup_node(a).unwrap();
        let err = reg.startup_node(a).unwrap_err();
        assert_eq!(err.kind(), "NodeAlreadyConnected");
    }

    #[test]
    fn test_unknown_node_reference() {
        let reg = registry();
        let err = reg.add_reference(NodeId::client(9), ObjectId(1)).unwrap_err();
        assert_eq!(err.kind(), "UnknownNode");
    }

    #[test]
    fn test_references_lifecycle() {
        let reg = registry();
        let a = NodeId::client(1);
        reg.startup_node(a).unwrap();
        reg.add_reference(a, ObjectId(1)).unwrap();
        reg.add_reference(a, ObjectId(2)).unwrap();
        assert!(reg.has_reference(a, ObjectId(1)));
        assert_eq!(reg.remove_references(a, &[ObjectId(1), ObjectId(7)]), 1);
        assert!(!reg.has_reference(a, ObjectId(1)));
        assert_eq!(reg.shutdown_node(a), Some(1));
        assert_eq!(reg.shutdown_node(a), None);
    }

    #[test]
    fn test_pruning_updates_and_removals() {
        let reg = registry();
        let a = NodeId::client(1);
        reg.startup_node(a).unwrap();
        reg.add_references(a, [ObjectId(1), ObjectId(2), ObjectId(5)]).unwrap();

        let changes = ChangeSet::new(vec![
            ObjectChange::update(ObjectId(1), vec![1]),
            ObjectChange::update(ObjectId(3), vec![3]),
            ObjectChange::remove(ObjectId(2)),
            ObjectChange::member(ObjectId(100), ObjectId(5), ChangeKind::Update),
        ]);
        let mut inv = Invalidations::new();
        let pruned = reg
            .create_pruned_changes_and_add_object_ids_to(a, &changes, &mut inv)
            .unwrap();

        assert_eq!(pruned.touched_ids(), BTreeSet::from([ObjectId(1)]));
        assert!(inv.contains(ObjectId::NULL, ObjectId(2)));
        assert!(inv.contains(ObjectId(100), ObjectId(5)));
        assert_eq!(inv.size(), 2);
        assert!(!reg.has_reference(a, ObjectId(2)));
        assert!(reg.has_reference(a, ObjectId(1)));
    }

    #[test]
    fn test_invalidate_for_all_skips_origin() {
        let reg = registry();
        let (a, b) = (NodeId::client(1), NodeId::client(2));
        reg.startup_node(a).unwrap();
        reg.startup_node(b).unwrap();
        reg.add_reference(a, ObjectId(1)).unwrap();
        reg.add_reference(b, ObjectId(1)).unwrap();

        let removal = ChangeSet::new(vec![ObjectChange::remove(ObjectId(1))]);
        let out = reg.invalidate_for_all(a, &removal);
        assert_eq!(out.len(), 1);
        assert!(out[&b].invalidations.contains_member(ObjectId(1)));
        assert!(!reg.has_reference(a, ObjectId(1)));
    }
}
