//! Lock identities, levels and contexts.

use crate::core::time::TimerSpec;
use crate::model::node::NodeId;
use serde::{Deserialize, Serialize};

/// Name of a distributed mutual-exclusion domain.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LockId(pub String);

impl LockId {
    /// Create a lock id from a name.
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Composite lock id built from a container id and a key, e.g. for
    /// per-entry locks inside a distributed map.
    pub fn composite(container: impl std::fmt::Display, key: impl std::fmt::Display) -> Self {
        Self(format!("{}:{}", container, key))
    }

    /// Lock name.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for LockId {
    fn from(name: &str) -> Self {
        Self(name.to_string())
    }
}

impl std::fmt::Display for LockId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Logical requester identity scoped to one client.
///
/// This is an opaque client-supplied session token and has no relationship
/// to operating-system threads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ThreadId(pub u64);

impl ThreadId {
    /// Sentinel for "no thread".
    pub const NULL: ThreadId = ThreadId(u64::MAX);

    /// Create a thread id.
    pub const fn new(id: u64) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for ThreadId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "thread-{}", self.0)
    }
}

/// Lock level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum LockLevel {
    /// Shared read.
    Read,
    /// Exclusive write.
    Write,
    /// Exclusive write whose transaction must be acknowledged before release.
    SynchronousWrite,
    /// Shared, no mutual exclusion among concurrent holders.
    Concurrent,
}

impl LockLevel {
    /// Whether the level is exclusive.
    pub const fn is_write(&self) -> bool {
        matches!(self, Self::Write | Self::SynchronousWrite)
    }

    /// Whether the level is shared.
    pub const fn is_shared(&self) -> bool {
        matches!(self, Self::Read | Self::Concurrent)
    }

    /// Whether a holder at `self` can coexist with a holder at `other`.
    pub const fn is_compatible_with(&self, other: LockLevel) -> bool {
        self.is_shared() && other.is_shared()
    }
}

impl std::fmt::Display for LockLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Read => write!(f, "READ"),
            Self::Write => write!(f, "WRITE"),
            Self::SynchronousWrite => write!(f, "SYNCHRONOUS_WRITE"),
            Self::Concurrent => write!(f, "CONCURRENT"),
        }
    }
}

/// A lock requester: a logical thread on a specific node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Requester {
    /// Node the requester lives on.
    pub node: NodeId,
    /// Logical thread on that node.
    pub thread: ThreadId,
}

impl Requester {
    /// Create a requester.
    pub const fn new(node: NodeId, thread: ThreadId) -> Self {
        Self { node, thread }
    }
}

impl std::fmt::Display for Requester {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.node, self.thread)
    }
}

/// Role of a context within a lock's state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum LockType {
    /// Granted.
    Holder,
    /// Queued for grant.
    Pending,
    /// Queued for grant with a bounded acquisition timer.
    TryPending,
    /// Released its hold via `wait`, awaiting notify or timeout.
    Waiter,
}

/// Immutable description of one requester's relationship to one lock.
///
/// Identity and hash cover every field, so a holder context and a pending
/// context for the same requester are distinct values.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LockContext {
    lock_id: LockId,
    node: NodeId,
    thread: ThreadId,
    level: LockLevel,
    lock_type: LockType,
    timer: Option<TimerSpec>,
}

impl LockContext {
    /// Plain holder context.
    pub fn holder(lock_id: LockId, node: NodeId, thread: ThreadId, level: LockLevel) -> Self {
        Self::build(lock_id, node, thread, level, LockType::Holder, None)
    }

    /// Plain pending context.
    pub fn pending(lock_id: LockId, node: NodeId, thread: ThreadId, level: LockLevel) -> Self {
        Self::build(lock_id, node, thread, level, LockType::Pending, None)
    }

    /// Wait context: the requester released its hold via `wait`.
    pub fn wait(
        lock_id: LockId,
        node: NodeId,
        thread: ThreadId,
        level: LockLevel,
        timer: TimerSpec,
    ) -> Self {
        Self::build(lock_id, node, thread, level, LockType::Waiter, Some(timer))
    }

    /// Try-lock context: a pending request bounded by `timer`.
    pub fn try_lock(
        lock_id: LockId,
        node: NodeId,
        thread: ThreadId,
        level: LockLevel,
        timer: TimerSpec,
    ) -> Self {
        Self::build(lock_id, node, thread, level, LockType::TryPending, Some(timer))
    }

    fn build(
        lock_id: LockId,
        node: NodeId,
        thread: ThreadId,
        level: LockLevel,
        lock_type: LockType,
        timer: Option<TimerSpec>,
    ) -> Self {
        Self {
            lock_id,
            node,
            thread,
            level,
            lock_type,
            timer,
        }
    }

    /// Lock this context refers to.
    pub fn lock_id(&self) -> &LockId {
        &self.lock_id
    }

    /// Requesting node.
    pub fn node(&self) -> NodeId {
        self.node
    }

    /// Requesting thread.
    pub fn thread(&self) -> ThreadId {
        self.thread
    }

    /// Requested or held level.
    pub fn level(&self) -> LockLevel {
        self.level
    }

    /// Role tag.
    pub fn lock_type(&self) -> LockType {
        self.lock_type
    }

    /// Timer spec for wait and try-lock contexts.
    pub fn timer(&self) -> Option<TimerSpec> {
        self.timer
    }

    /// The (node, thread) pair naming the requester.
    pub fn requester(&self) -> Requester {
        Requester::new(self.node, self.thread)
    }

    /// Same requester and level, re-tagged with another role.
    pub fn with_type(&self, lock_type: LockType, timer: Option<TimerSpec>) -> Self {
        Self::build(
            self.lock_id.clone(),
            self.node,
            self.thread,
            self.level,
            lock_type,
            timer,
        )
    }
}

impl std::fmt::Display for LockContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{:?}[{} {} {}]",
            self.lock_type,
            self.lock_id,
            self.requester(),
            self.level
        )
    }
}
