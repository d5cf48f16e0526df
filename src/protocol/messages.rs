//! Client/server message types.
//!
//! Every message travels over one persistent, ordered connection per client.
//! [`ClientMessage`] flows client to server, [`ServerMessage`] the other way.

use crate::core::time::TimerSpec;
use crate::locks::deadlock::DeadlockChain;
use crate::model::lock::{LockContext, LockId, LockLevel, ThreadId};
use crate::model::node::{GroupId, NodeId};
use crate::model::object::{ChangeSet, ObjectId};
use crate::model::txn::{ClientTransaction, TransactionId};
use crate::sequence::BatchRange;
use serde::{Deserialize, Serialize};

/// Session (re-)establishment request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeRequest {
    /// Connecting node.
    pub node: NodeId,
    /// Protocol version, `MAJOR.MINOR`.
    pub protocol_version: String,
    /// Locks the client holds.
    pub held_locks: Vec<LockContext>,
    /// Blocking requests the client is still waiting on.
    pub pending_locks: Vec<LockContext>,
    /// Bounded requests the client is still waiting on.
    pub pending_try_locks: Vec<LockContext>,
    /// Threads parked in `wait`.
    pub waiting_locks: Vec<LockContext>,
    /// Transactions sent but not yet covered by a low-water mark.
    pub unacknowledged: Vec<TransactionId>,
    /// An id batch request was outstanding when the connection dropped.
    pub object_id_batch_pending: bool,
    /// Object ids currently in the client's cache.
    pub cached_object_ids: Vec<ObjectId>,
    /// Client software version.
    pub client_version: String,
}

impl HandshakeRequest {
    /// Whether the request re-asserts any server-side state.
    pub fn carries_state(&self) -> bool {
        !self.held_locks.is_empty()
            || !self.pending_locks.is_empty()
            || !self.pending_try_locks.is_empty()
            || !self.waiting_locks.is_empty()
            || !self.unacknowledged.is_empty()
    }

    /// Every lock context, holders first.
    pub fn lock_contexts(&self) -> impl Iterator<Item = &LockContext> {
        self.held_locks
            .iter()
            .chain(self.pending_locks.iter())
            .chain(self.pending_try_locks.iter())
            .chain(self.waiting_locks.iter())
    }
}

/// Why a handshake was refused.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RejectReason {
    /// Major protocol versions differ.
    VersionMismatch { server: String },
    /// The node's reconnect window expired; it must start a fresh session.
    ReconnectWindowExpired,
    /// The node already has a live connection.
    AlreadyConnected,
    /// The request was malformed or contradicted server state.
    ProtocolViolation,
}

/// Handshake acknowledgement.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeResponse {
    /// Whether the session was (re-)established.
    pub accepted: bool,
    /// Highest transaction id from this node the server accepted.
    pub server_high_water_mark: TransactionId,
    /// Completed-transaction low-water mark for this node.
    pub low_water_mark: TransactionId,
    /// Id ranges granted because a batch request was outstanding.
    pub object_id_ranges: Vec<BatchRange>,
    /// Reported cached ids invalidated while the client was away.
    pub stale_object_ids: Vec<ObjectId>,
    /// Rejection category.
    pub rejection: Option<RejectReason>,
    /// Human readable rejection detail.
    pub error_reason: Option<String>,
}

impl HandshakeResponse {
    /// A refusal.
    pub fn rejected(reason: RejectReason, detail: impl Into<String>) -> Self {
        Self {
            accepted: false,
            rejection: Some(reason),
            error_reason: Some(detail.into()),
            ..Self::default()
        }
    }
}

/// Lock operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LockMode {
    /// Blocking acquire.
    Acquire,
    /// Bounded acquire; needs a timer.
    TryAcquire,
    /// Drop a hold.
    Release,
    /// Release the write hold and wait; the timer bounds the wait.
    Wait,
    /// Wake the earliest waiter.
    Notify,
    /// Wake every waiter.
    NotifyAll,
    /// Wake one specific waiter without a notify.
    Interrupt,
}

/// Lock request from one logical thread.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockRequest {
    /// Target lock.
    pub lock_id: LockId,
    /// Requesting node.
    pub node: NodeId,
    /// Requesting thread.
    pub thread: ThreadId,
    /// Requested level (ignored by release/notify).
    pub level: LockLevel,
    /// Operation.
    pub mode: LockMode,
    /// Timer for try-acquire and wait.
    pub timer: Option<TimerSpec>,
}

/// Asynchronous outcome of a lock request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockResponse {
    /// Lock concerned.
    pub lock_id: LockId,
    /// Thread concerned.
    pub thread: ThreadId,
    /// Level granted, when `granted`.
    pub level: Option<LockLevel>,
    /// The lock was awarded.
    pub granted: bool,
    /// A try-acquire failed or a wait timed out.
    pub timed_out: bool,
    /// The request closed a cycle in the wait-for graph.
    pub deadlock_chain: Option<DeadlockChain>,
}

/// Request for a batch of unique ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchRequest {
    /// Client-local request id; responses echo it.
    pub request_id: u64,
    /// Ids wanted.
    pub size: u64,
    /// Group whose counter to draw from.
    pub group: GroupId,
}

/// Granted id batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchResponse {
    /// Echoed request id.
    pub request_id: u64,
    /// First id.
    pub start: u64,
    /// One past the last id.
    pub end: u64,
}

impl BatchResponse {
    /// The granted range.
    pub fn range(&self) -> BatchRange {
        BatchRange::new(self.start, self.end)
    }
}

/// Transactions committed by one client, in commit order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionBatch {
    /// Transactions.
    pub transactions: Vec<ClientTransaction>,
}

/// Completed-transaction low-water mark for one node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletedTransactionLowWaterMark {
    /// Node the mark applies to.
    pub node: NodeId,
    /// Every transaction below this id is durably applied.
    pub watermark: TransactionId,
}

/// Members of one container to evict.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvalidationPush {
    /// Container, or `ObjectId::NULL` for standalone objects.
    pub container: ObjectId,
    /// Members to evict.
    pub members: Vec<ObjectId>,
}

/// Client to server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClientMessage {
    /// Session (re-)establishment.
    Handshake(HandshakeRequest),
    /// Lock operation.
    Lock(LockRequest),
    /// Id batch request.
    Batch(BatchRequest),
    /// Committed transactions.
    Transactions(TransactionBatch),
    /// Objects newly cached by the client.
    AddReferences(Vec<ObjectId>),
    /// Objects evicted by the client.
    RemoveReferences(Vec<ObjectId>),
    /// Clean shutdown; the server releases everything immediately.
    Goodbye,
}

impl ClientMessage {
    /// Short name for logs.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Handshake(_) => "handshake",
            Self::Lock(_) => "lock",
            Self::Batch(_) => "batch",
            Self::Transactions(_) => "transactions",
            Self::AddReferences(_) => "add_references",
            Self::RemoveReferences(_) => "remove_references",
            Self::Goodbye => "goodbye",
        }
    }
}

/// Server to client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServerMessage {
    /// Handshake outcome.
    HandshakeAck(HandshakeResponse),
    /// Lock outcome.
    Lock(LockResponse),
    /// Holders are asked to give the lock up.
    Recall { lock_id: LockId, level: LockLevel },
    /// Id batch.
    Batch(BatchResponse),
    /// Transactions accepted (applied or recognised as resends).
    TransactionAck(Vec<TransactionId>),
    /// Low-water mark moved.
    LowWaterMark(CompletedTransactionLowWaterMark),
    /// Cached entries to evict.
    Invalidation(InvalidationPush),
    /// Updates to cached objects.
    Changes(ChangeSet),
    /// Request failed; `fatal` means the connection is about to close.
    Error { message: String, fatal: bool },
}

impl ServerMessage {
    /// Short name for logs.
    pub fn name(&self) -> &'static str {
        match self {
            Self::HandshakeAck(_) => "handshake_ack",
            Self::Lock(_) => "lock",
            Self::Recall { .. } => "recall",
            Self::Batch(_) => "batch",
            Self::TransactionAck(_) => "transaction_ack",
            Self::LowWaterMark(_) => "low_water_mark",
            Self::Invalidation(_) => "invalidation",
            Self::Changes(_) => "changes",
            Self::Error { .. } => "error",
        }
    }
}
