//! Transaction identities.

use crate::core::error::{CoherenceError, CoherenceResult};
use crate::model::lock::{LockId, ThreadId};
use crate::model::node::NodeId;
use crate::model::object::ChangeSet;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

/// Client-local transaction id. Real ids start at 1; 0 is the null id.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TransactionId(pub u64);

impl TransactionId {
    /// Sentinel for "no transaction".
    pub const NULL: TransactionId = TransactionId(0);

    /// Create a transaction id.
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Whether this is the null sentinel.
    pub const fn is_null(&self) -> bool {
        self.0 == 0
    }

    /// The following id.
    pub const fn next(&self) -> Self {
        Self(self.0 + 1)
    }
}

impl std::fmt::Display for TransactionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "txn-{}", self.0)
    }
}

/// Server-side total order key for one client transaction.
///
/// Ordered by source node first, then by client transaction id, so ordering
/// is monotonic per node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ServerTransactionId {
    /// Node that originated the transaction.
    pub source: NodeId,
    /// The originating client's transaction id.
    pub client_txn: TransactionId,
}

impl ServerTransactionId {
    /// Null server transaction id.
    pub const NULL: ServerTransactionId = ServerTransactionId {
        source: NodeId::NULL,
        client_txn: TransactionId::NULL,
    };

    /// Create a server transaction id.
    pub const fn new(source: NodeId, client_txn: TransactionId) -> Self {
        Self { source, client_txn }
    }

    /// Whether both parts are null.
    pub const fn is_null(&self) -> bool {
        self.source.is_null() && self.client_txn.is_null()
    }

    /// Fixed byte layout: node id encoding followed by the 8-byte
    /// big-endian transaction id.
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.source.encoded_len() + 8);
        self.source.encode(&mut buf);
        buf.put_u64(self.client_txn.0);
        buf.freeze()
    }

    /// Parse the layout produced by [`ServerTransactionId::to_bytes`].
    pub fn from_bytes(mut data: &[u8]) -> CoherenceResult<Self> {
        let source = NodeId::decode(&mut data)?;
        if data.remaining() != 8 {
            return Err(CoherenceError::codec(format!(
                "server transaction id expects 8 trailing bytes, found {}",
                data.remaining()
            )));
        }
        Ok(Self::new(source, TransactionId(data.get_u64())))
    }
}

impl std::fmt::Display for ServerTransactionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.source, self.client_txn)
    }
}

/// Server acceptance order across all nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct GlobalTransactionId(pub u64);

impl std::fmt::Display for GlobalTransactionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "gtx-{}", self.0)
    }
}

/// One client transaction as sent to the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientTransaction {
    /// Client-local id, strictly increasing per node.
    pub id: TransactionId,
    /// Logical thread that committed the transaction.
    pub thread: ThreadId,
    /// Locks the committing thread must hold.
    pub lock_ids: Vec<LockId>,
    /// Object changes.
    pub changes: ChangeSet,
}

impl ClientTransaction {
    /// Transaction that requires no locks.
    pub fn new(id: TransactionId, thread: ThreadId, changes: ChangeSet) -> Self {
        Self {
            id,
            thread,
            lock_ids: Vec::new(),
            changes,
        }
    }

    /// Require `lock_id` to be held at commit.
    pub fn with_lock(mut self, lock_id: LockId) -> Self {
        self.lock_ids.push(lock_id);
        self
    }
}
