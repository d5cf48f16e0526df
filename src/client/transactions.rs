//! Client resend buffer.
//!
//! Every committed transaction gets the next client transaction id and stays
//! buffered until the server's low-water mark passes it. Acks only mark a
//! transaction as accepted; it is still resent after a reconnect until the
//! mark confirms it is durable, and the server treats such resends as
//! no-ops.

use crate::handshake::client::HandshakeObserver;
use crate::model::lock::{LockId, ThreadId};
use crate::model::node::NodeId;
use crate::model::object::ChangeSet;
use crate::model::txn::{ClientTransaction, TransactionId};
use crate::protocol::messages::{HandshakeRequest, HandshakeResponse};
use parking_lot::Mutex;
use std::collections::BTreeMap;

#[derive(Debug, Clone)]
struct Buffered {
    txn: ClientTransaction,
    acknowledged: bool,
}

#[derive(Debug)]
struct BufferState {
    next_id: u64,
    low_water: TransactionId,
    buffered: BTreeMap<TransactionId, Buffered>,
}

/// Transactions committed by this client and not yet known durable.
#[derive(Debug)]
pub struct ClientTransactionBuffer {
    node: NodeId,
    state: Mutex<BufferState>,
}

impl ClientTransactionBuffer {
    /// Empty buffer; the first transaction gets id 1.
    pub fn new(node: NodeId) -> Self {
        Self {
            node,
            state: Mutex::new(BufferState {
                next_id: 1,
                low_water: TransactionId::NULL,
                buffered: BTreeMap::new(),
            }),
        }
    }

    /// Assign the next id and buffer the transaction.
    pub fn commit(
        &self,
        thread: ThreadId,
        changes: ChangeSet,
        lock_ids: &[LockId],
    ) -> ClientTransaction {
        let mut state = self.state.lock();
        let id = TransactionId::new(state.next_id);
        state.next_id += 1;
        let mut txn = ClientTransaction::new(id, thread, changes);
        for lock_id in lock_ids {
            txn = txn.with_lock(lock_id.clone());
        }
        state.buffered.insert(
            id,
            Buffered {
                txn: txn.clone(),
                acknowledged: false,
            },
        );
        txn
    }

    /// Record server acknowledgements.
    pub fn acknowledged(&self, ids: &[TransactionId]) {
        let mut state = self.state.lock();
        for id in ids {
            if let Some(buffered) = state.buffered.get_mut(id) {
                buffered.acknowledged = true;
            }
        }
    }

    /// Drop everything below the server's low-water mark. A mark lower than
    /// one already seen is ignored. Returns how many were dropped.
    pub fn low_water_mark(&self, mark: TransactionId) -> usize {
        let mut state = self.state.lock();
        if mark <= state.low_water {
            return 0;
        }
        state.low_water = mark;
        let kept = state.buffered.split_off(&mark);
        let dropped = std::mem::replace(&mut state.buffered, kept).len();
        tracing::trace!(node = %self.node, mark = %mark, dropped, "resend buffer trimmed");
        dropped
    }

    /// Buffered transactions in id order, for resending after a handshake.
    pub fn resend_batch(&self) -> Vec<ClientTransaction> {
        self.state
            .lock()
            .buffered
            .values()
            .map(|b| b.txn.clone())
            .collect()
    }

    /// Ids still buffered.
    pub fn unacknowledged_ids(&self) -> Vec<TransactionId> {
        self.state.lock().buffered.keys().copied().collect()
    }

    /// Buffered transactions the server has not acknowledged yet.
    pub fn awaiting_ack(&self) -> usize {
        self.state
            .lock()
            .buffered
            .values()
            .filter(|b| !b.acknowledged)
            .count()
    }

    /// Highest low-water mark seen.
    pub fn current_low_water_mark(&self) -> TransactionId {
        self.state.lock().low_water
    }

    /// Number of buffered transactions.
    pub fn len(&self) -> usize {
        self.state.lock().buffered.len()
    }

    /// Check if the buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.state.lock().buffered.is_empty()
    }
}

impl HandshakeObserver for ClientTransactionBuffer {
    fn initialize_handshake(&self, request: &mut HandshakeRequest) {
        request.unacknowledged = self.unacknowledged_ids();
    }

    fn unpause(&self, response: &HandshakeResponse) {
        self.low_water_mark(response.low_water_mark);
    }

    fn reset(&self) {
        let mut state = self.state.lock();
        if !state.buffered.is_empty() {
            tracing::warn!(
                node = %self.node,
                lost = state.buffered.len(),
                "server lost session state; dropping unconfirmed transactions"
            );
        }
        state.buffered.clear();
        state.low_water = TransactionId::NULL;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_are_sequential() {
        let buffer = ClientTransactionBuffer::new(NodeId::client(1));
        let a = buffer.commit(ThreadId(1), ChangeSet::default(), &[]);
        let b = buffer.commit(ThreadId(1), ChangeSet::default(), &[LockId::from("L")]);
        assert_eq!(a.id, TransactionId(1));
        assert_eq!(b.id, TransactionId(2));
        assert_eq!(b.lock_ids, vec![LockId::from("L")]);
    }

    #[test]
    fn test_low_water_mark_trims_and_is_monotonic() {
        let buffer = ClientTransactionBuffer::new(NodeId::client(1));
        for _ in 0..5 {
            buffer.commit(ThreadId(1), ChangeSet::default(), &[]);
        }
        buffer.acknowledged(&[TransactionId(1), TransactionId(2)]);
        assert_eq!(buffer.awaiting_ack(), 3);
        assert_eq!(buffer.low_water_mark(TransactionId(3)), 2);
        assert_eq!(buffer.low_water_mark(TransactionId(2)), 0);
        assert_eq!(
            buffer.unacknowledged_ids(),
            vec![TransactionId(3), TransactionId(4), TransactionId(5)]
        );
    }

    #[test]
    fn test_handshake_reports_and_ack_trims() {
        let buffer = ClientTransactionBuffer::new(NodeId::client(1));
        for _ in 0..3 {
            buffer.commit(ThreadId(1), ChangeSet::default(), &[]);
        }
        let mut request = HandshakeRequest::default();
        buffer.initialize_handshake(&mut request);
        assert_eq!(request.unacknowledged.len(), 3);

        buffer.unpause(&HandshakeResponse {
            accepted: true,
            low_water_mark: TransactionId(3),
            ..HandshakeResponse::default()
        });
        let resend = buffer.resend_batch();
        assert_eq!(resend.len(), 1);
        assert_eq!(resend[0].id, TransactionId(3));
    }
}
