//! Shared object identities and change records.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Identifier of an object in the shared graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ObjectId(pub u64);

impl ObjectId {
    /// Sentinel for "no object".
    pub const NULL: ObjectId = ObjectId(u64::MAX);

    /// Create an object id.
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Whether this is the null sentinel.
    pub const fn is_null(&self) -> bool {
        self.0 == u64::MAX
    }
}

impl std::fmt::Display for ObjectId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "oid-{}", self.0)
    }
}

/// Kind of mutation applied to an object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeKind {
    /// Object state changed; `payload` carries the new state delta.
    Update,
    /// Object removed from the shared graph.
    Remove,
}

/// One object mutation inside a transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectChange {
    /// Mutated object.
    pub object: ObjectId,
    /// Container holding the object as a member (e.g. a distributed map),
    /// when the object is cached client-side as a container entry.
    pub container: Option<ObjectId>,
    /// Mutation kind.
    pub kind: ChangeKind,
    /// Opaque state delta.
    pub payload: Vec<u8>,
}

impl ObjectChange {
    /// Update of a standalone object.
    pub fn update(object: ObjectId, payload: Vec<u8>) -> Self {
        Self {
            object,
            container: None,
            kind: ChangeKind::Update,
            payload,
        }
    }

    /// Removal of a standalone object.
    pub fn remove(object: ObjectId) -> Self {
        Self {
            object,
            container: None,
            kind: ChangeKind::Remove,
            payload: Vec::new(),
        }
    }

    /// Mutation of a member cached inside `container`.
    pub fn member(container: ObjectId, object: ObjectId, kind: ChangeKind) -> Self {
        Self {
            object,
            container: Some(container),
            kind,
            payload: Vec::new(),
        }
    }
}

/// An ordered set of object changes produced by one applied transaction.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeSet {
    /// Changes in application order.
    pub changes: Vec<ObjectChange>,
}

impl ChangeSet {
    /// Create a change set.
    pub fn new(changes: Vec<ObjectChange>) -> Self {
        Self { changes }
    }

    /// Number of changes.
    pub fn len(&self) -> usize {
        self.changes.len()
    }

    /// Check if there are no changes.
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    /// Every object touched by the set.
    pub fn touched_ids(&self) -> BTreeSet<ObjectId> {
        self.changes.iter().map(|c| c.object).collect()
    }

    /// Objects removed by the set.
    pub fn removed_ids(&self) -> BTreeSet<ObjectId> {
        self.changes
            .iter()
            .filter(|c| c.kind == ChangeKind::Remove)
            .map(|c| c.object)
            .collect()
    }
}

impl FromIterator<ObjectChange> for ChangeSet {
    fn from_iter<I: IntoIterator<Item = ObjectChange>>(iter: I) -> Self {
        Self {
            changes: iter.into_iter().collect(),
        }
    }
}
