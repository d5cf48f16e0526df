//! Client session.
//!
//! Wires the client collaborators to one server connection. Registration
//! order with the handshake coordinator is fixed: lock table, resend buffer,
//! id pool, reference cache.
//!
//! Traffic rules while the session is not connected:
//! - lock and try-lock requests are recorded and reach the server through the
//!   next handshake
//! - commits are buffered and resent after the ack
//! - release, wait, notify and interrupt fail with `NodePaused`
//!
//! Server messages are turned into [`SessionEvent`]s for the application.

use super::cache::ClientReferenceCache;
use super::locks::{ClientLockTable, LockOutcome};
use super::transactions::ClientTransactionBuffer;
use crate::core::config::SequenceConfig;
use crate::core::error::{CoherenceError, CoherenceResult};
use crate::core::time::TimerSpec;
use crate::handshake::client::{
    ClientConnectionState, ClientHandshakeCoordinator, HandshakeObserver,
};
use crate::model::lock::{LockId, LockLevel, ThreadId};
use crate::model::node::{GroupId, NodeId};
use crate::model::object::{ChangeSet, ObjectId};
use crate::model::txn::TransactionId;
use crate::protocol::messages::{
    BatchRequest, ClientMessage, HandshakeRequest, HandshakeResponse, InvalidationPush,
    ServerMessage, TransactionBatch,
};
use crate::sequence::{BatchRange, BatchRequester, BatchSequence, NextBatch};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Sends messages to the server.
pub trait Outbound: Send + Sync {
    /// Send one message. Fails when the connection is down.
    fn send(&self, message: ClientMessage) -> CoherenceResult<()>;
}

/// Outbound backed by a channel, drained by a connection writer task.
#[derive(Debug, Clone)]
pub struct ChannelOutbound {
    tx: mpsc::UnboundedSender<ClientMessage>,
}

impl ChannelOutbound {
    /// Create an outbound and the receiver a writer drains.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ClientMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl Outbound for ChannelOutbound {
    fn send(&self, message: ClientMessage) -> CoherenceResult<()> {
        self.tx
            .send(message)
            .map_err(|_| CoherenceError::internal("connection writer closed"))
    }
}

/// Notification for the application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// A lock request resolved.
    Lock(LockOutcome),
    /// The server asked these threads to release `lock_id`.
    Recalled {
        lock_id: LockId,
        level: LockLevel,
        threads: Vec<ThreadId>,
    },
    /// Cached objects were evicted.
    Invalidated(InvalidationPush),
    /// Updates to cached objects.
    Changes(ChangeSet),
    /// The server reported a failure.
    ServerError { message: String, fatal: bool },
    /// The server had forgotten this node or tore the session down; local
    /// session state was dropped. After an expired window a fresh handshake
    /// is sent at once; after a fatal error it waits for the next connection.
    SessionReset,
}

/// Client session settings.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// This client's node id.
    pub node: NodeId,
    /// Protocol version sent in handshakes.
    pub protocol_version: String,
    /// Client software version.
    pub client_version: String,
    /// Ids per local batch.
    pub batch_size: u64,
    /// Ids per server request.
    pub fetch_size: u64,
    /// Prefetch threshold; 0 disables prefetch.
    pub low_water: u64,
    /// Group whose counter batch requests draw from.
    pub id_group: GroupId,
}

impl SessionConfig {
    /// Settings for `node` using the id pool sizes of a sequence section.
    pub fn from_sequence(node: NodeId, sequence: &SequenceConfig) -> Self {
        Self {
            node,
            protocol_version: crate::PROTOCOL_VERSION.to_string(),
            client_version: env!("CARGO_PKG_VERSION").to_string(),
            batch_size: sequence.client_batch_size,
            fetch_size: sequence.client_fetch_size,
            low_water: sequence.client_low_water,
            id_group: GroupId::new(0),
        }
    }
}

struct OutboundBatchRequester {
    outbound: Arc<dyn Outbound>,
    group: GroupId,
}

impl BatchRequester for OutboundBatchRequester {
    fn request_batch(&self, request_id: u64, size: u64) {
        let message = ClientMessage::Batch(BatchRequest {
            request_id,
            size,
            group: self.group,
        });
        if let Err(e) = self.outbound.send(message) {
            tracing::debug!(
                request_id,
                error = %e,
                "id batch request not sent; handshake will cover it"
            );
        }
    }
}

impl HandshakeObserver for BatchSequence {
    fn initialize_handshake(&self, request: &mut HandshakeRequest) {
        request.object_id_batch_pending = self.is_request_pending();
    }

    fn unpause(&self, response: &HandshakeResponse) {
        self.handshake_ranges(&response.object_id_ranges);
    }
}

/// One client's session with the server.
pub struct ClientSession {
    node: NodeId,
    outbound: Arc<dyn Outbound>,
    handshake: ClientHandshakeCoordinator,
    locks: Arc<ClientLockTable>,
    txns: Arc<ClientTransactionBuffer>,
    ids: Arc<BatchSequence>,
    cache: Arc<ClientReferenceCache>,
    events: mpsc::UnboundedSender<SessionEvent>,
}

impl ClientSession {
    /// Create a session. Events for the application arrive on the returned
    /// receiver.
    pub fn new(
        config: SessionConfig,
        outbound: Arc<dyn Outbound>,
    ) -> (Self, mpsc::UnboundedReceiver<SessionEvent>) {
        let node = config.node;
        let handshake =
            ClientHandshakeCoordinator::new(node, config.protocol_version, config.client_version);
        let locks = Arc::new(ClientLockTable::new(node));
        let txns = Arc::new(ClientTransactionBuffer::new(node));
        let requester = Arc::new(OutboundBatchRequester {
            outbound: outbound.clone(),
            group: config.id_group,
        });
        let ids = Arc::new(BatchSequence::new(
            requester,
            config.batch_size,
            config.fetch_size,
            config.low_water,
        ));
        let cache = Arc::new(ClientReferenceCache::new());

        handshake.add_observer(locks.clone());
        handshake.add_observer(txns.clone());
        handshake.add_observer(ids.clone());
        handshake.add_observer(cache.clone());

        let (events, rx) = mpsc::unbounded_channel();
        let session = Self {
            node,
            outbound,
            handshake,
            locks,
            txns,
            ids,
            cache,
            events,
        };
        (session, rx)
    }

    /// This client's node id.
    pub fn node(&self) -> NodeId {
        self.node
    }

    /// Handshake coordinator, for registering extra observers.
    pub fn handshake(&self) -> &ClientHandshakeCoordinator {
        &self.handshake
    }

    /// Lock table.
    pub fn locks(&self) -> &ClientLockTable {
        &self.locks
    }

    /// Resend buffer.
    pub fn transactions(&self) -> &ClientTransactionBuffer {
        &self.txns
    }

    /// Id pool.
    pub fn ids(&self) -> &BatchSequence {
        &self.ids
    }

    /// Cached object ids.
    pub fn cache(&self) -> &ClientReferenceCache {
        &self.cache
    }

    /// Connection state.
    pub fn state(&self) -> ClientConnectionState {
        self.handshake.state()
    }

    /// Send a handshake on a new connection.
    pub fn connect(&self) -> CoherenceResult<()> {
        let request = self.handshake.build_handshake()?;
        self.outbound.send(ClientMessage::Handshake(request))
    }

    /// The connection dropped.
    pub fn connection_lost(&self) {
        self.handshake.disconnected();
    }

    /// Close the session for good.
    pub fn goodbye(&self) -> CoherenceResult<()> {
        let result = if self.handshake.is_connected() {
            self.outbound.send(ClientMessage::Goodbye)
        } else {
            Ok(())
        };
        self.handshake.shutdown();
        result
    }

    /// Blocking lock request; the outcome arrives as a [`SessionEvent`].
    pub fn lock(
        &self,
        lock_id: &LockId,
        thread: ThreadId,
        level: LockLevel,
    ) -> CoherenceResult<()> {
        let request = self.locks.request(lock_id, thread, level)?;
        self.send_when_connected(ClientMessage::Lock(request))
    }

    /// Bounded lock request.
    pub fn try_lock(
        &self,
        lock_id: &LockId,
        thread: ThreadId,
        level: LockLevel,
        timer: TimerSpec,
    ) -> CoherenceResult<()> {
        let request = self.locks.try_request(lock_id, thread, level, timer)?;
        self.send_when_connected(ClientMessage::Lock(request))
    }

    /// Release a hold.
    pub fn unlock(&self, lock_id: &LockId, thread: ThreadId) -> CoherenceResult<()> {
        self.require_connected()?;
        let request = self.locks.release(lock_id, thread)?;
        self.outbound.send(ClientMessage::Lock(request))
    }

    /// Give up a write hold and wait for a notify or the timer.
    pub fn wait(
        &self,
        lock_id: &LockId,
        thread: ThreadId,
        timer: TimerSpec,
    ) -> CoherenceResult<()> {
        self.require_connected()?;
        let request = self.locks.wait(lock_id, thread, timer)?;
        self.outbound.send(ClientMessage::Lock(request))
    }

    /// Wake one or all waiters of `lock_id`.
    pub fn notify(&self, lock_id: &LockId, thread: ThreadId, all: bool) -> CoherenceResult<()> {
        self.require_connected()?;
        let request = self.locks.notify(lock_id, thread, all)?;
        self.outbound.send(ClientMessage::Lock(request))
    }

    /// Wake a waiting thread without a notify.
    pub fn interrupt(&self, lock_id: &LockId, thread: ThreadId) -> CoherenceResult<()> {
        self.require_connected()?;
        let request = self.locks.interrupt(lock_id, thread)?;
        self.outbound.send(ClientMessage::Lock(request))
    }

    /// Commit a transaction. Sent now when connected, otherwise after the
    /// next accepted handshake.
    pub fn commit(
        &self,
        thread: ThreadId,
        changes: ChangeSet,
        lock_ids: &[LockId],
    ) -> CoherenceResult<TransactionId> {
        let txn = self.txns.commit(thread, changes, lock_ids);
        let id = txn.id;
        self.send_when_connected(ClientMessage::Transactions(TransactionBatch {
            transactions: vec![txn],
        }))?;
        Ok(id)
    }

    /// Next local id batch, requesting more from the server if needed.
    pub fn next_ids(&self) -> NextBatch {
        self.ids.next_batch()
    }

    /// Next local id batch, waiting for the server if the pool is empty.
    pub async fn acquire_ids(&self) -> BatchRange {
        self.ids.acquire().await
    }

    /// Record newly cached objects.
    pub fn add_references(&self, objects: &[ObjectId]) -> CoherenceResult<()> {
        let added = self.cache.add(objects);
        if added.is_empty() {
            return Ok(());
        }
        self.send_when_connected(ClientMessage::AddReferences(added))
    }

    /// Record evicted objects.
    pub fn remove_references(&self, objects: &[ObjectId]) -> CoherenceResult<()> {
        let removed = self.cache.evict(objects);
        if removed.is_empty() {
            return Ok(());
        }
        self.send_when_connected(ClientMessage::RemoveReferences(removed))
    }

    /// Handle one message from the server.
    pub fn handle(&self, message: ServerMessage) -> CoherenceResult<()> {
        tracing::trace!(node = %self.node, message = message.name(), "server message");
        match message {
            ServerMessage::HandshakeAck(response) => self.on_handshake_ack(response),
            ServerMessage::Lock(response) => {
                let outcome = self.locks.on_response(&response);
                self.emit(SessionEvent::Lock(outcome));
                Ok(())
            }
            ServerMessage::Recall { lock_id, level } => {
                let threads = self.locks.recall(&lock_id);
                self.emit(SessionEvent::Recalled {
                    lock_id,
                    level,
                    threads,
                });
                Ok(())
            }
            ServerMessage::Batch(response) => {
                self.ids.batch_received(response.request_id, response.range());
                Ok(())
            }
            ServerMessage::TransactionAck(ids) => {
                self.txns.acknowledged(&ids);
                Ok(())
            }
            ServerMessage::LowWaterMark(mark) => {
                if mark.node != self.node {
                    return Err(CoherenceError::protocol(
                        self.node,
                        format!("low-water mark addressed to {}", mark.node),
                    ));
                }
                self.txns.low_water_mark(mark.watermark);
                Ok(())
            }
            ServerMessage::Invalidation(push) => {
                self.cache.invalidate(&push);
                self.emit(SessionEvent::Invalidated(push));
                Ok(())
            }
            ServerMessage::Changes(changes) => {
                self.emit(SessionEvent::Changes(changes));
                Ok(())
            }
            ServerMessage::Error { message, fatal } => {
                self.emit(SessionEvent::ServerError { message, fatal });
                if fatal {
                    // The server dropped this node; nothing local survives.
                    self.handshake.reset();
                    self.emit(SessionEvent::SessionReset);
                }
                Ok(())
            }
        }
    }

    fn on_handshake_ack(&self, response: HandshakeResponse) -> CoherenceResult<()> {
        match self.handshake.acknowledged(&response) {
            Ok(()) => {
                let evicted = self.cache.evict(&response.stale_object_ids);
                if !evicted.is_empty() {
                    self.emit(SessionEvent::Invalidated(InvalidationPush {
                        container: ObjectId::NULL,
                        members: evicted,
                    }));
                }
                let resend = self.txns.resend_batch();
                if !resend.is_empty() {
                    tracing::debug!(
                        node = %self.node,
                        count = resend.len(),
                        "resending transactions"
                    );
                    self.outbound.send(ClientMessage::Transactions(TransactionBatch {
                        transactions: resend,
                    }))?;
                }
                Ok(())
            }
            Err(CoherenceError::ReconnectWindowExpired { .. }) => {
                self.handshake.reset();
                self.emit(SessionEvent::SessionReset);
                self.connect()
            }
            Err(e) => Err(e),
        }
    }

    fn require_connected(&self) -> CoherenceResult<()> {
        match self.handshake.state() {
            ClientConnectionState::Connected => Ok(()),
            ClientConnectionState::Shutdown => Err(CoherenceError::internal("session shut down")),
            _ => Err(CoherenceError::NodePaused { node: self.node }),
        }
    }

    fn send_when_connected(&self, message: ClientMessage) -> CoherenceResult<()> {
        match self.handshake.state() {
            ClientConnectionState::Connected => self.outbound.send(message),
            ClientConnectionState::Shutdown => Err(CoherenceError::internal("session shut down")),
            _ => {
                tracing::trace!(
                    node = %self.node,
                    message = message.name(),
                    "deferred until handshake"
                );
                Ok(())
            }
        }
    }

    fn emit(&self, event: SessionEvent) {
        if self.events.send(event).is_err() {
            tracing::trace!(node = %self.node, "session event receiver dropped");
        }
    }
}

impl std::fmt::Debug for ClientSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientSession")
            .field("node", &self.node)
            .field("state", &self.state())
            .field("locks", &self.locks.len())
            .field("buffered_txns", &self.txns.len())
            .field("cached", &self.cache.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::messages::{BatchResponse, LockMode, LockResponse, RejectReason};

    fn session() -> (
        ClientSession,
        mpsc::UnboundedReceiver<ClientMessage>,
        mpsc::UnboundedReceiver<SessionEvent>,
    ) {
        let (outbound, wire) = ChannelOutbound::new();
        let mut config =
            SessionConfig::from_sequence(NodeId::client(5), &SequenceConfig::default());
        config.batch_size = 10;
        config.fetch_size = 100;
        config.low_water = 0;
        let (session, events) = ClientSession::new(config, Arc::new(outbound));
        (session, wire, events)
    }

    fn accept() -> ServerMessage {
        ServerMessage::HandshakeAck(HandshakeResponse {
            accepted: true,
            ..HandshakeResponse::default()
        })
    }

    #[test]
    fn test_requests_before_ack_travel_in_handshake() {
        let (s, mut wire, _) = session();
        s.lock(&LockId::from("L"), ThreadId(1), LockLevel::Write).unwrap();
        s.commit(ThreadId(1), ChangeSet::default(), &[]).unwrap();
        assert!(wire.try_recv().is_err());
        assert!(matches!(
            s.unlock(&LockId::from("L"), ThreadId(1)),
            Err(CoherenceError::NodePaused { .. })
        ));

        s.connect().unwrap();
        let Ok(ClientMessage::Handshake(request)) = wire.try_recv() else {
            panic!("expected a handshake");
        };
        assert_eq!(request.pending_locks.len(), 1);
        assert_eq!(request.unacknowledged, vec![TransactionId(1)]);

        s.handle(accept()).unwrap();
        let Ok(ClientMessage::Transactions(batch)) = wire.try_recv() else {
            panic!("expected a resend");
        };
        assert_eq!(batch.transactions.len(), 1);
    }

    #[test]
    fn test_lock_response_becomes_event() {
        let (s, mut wire, mut events) = session();
        s.connect().unwrap();
        s.handle(accept()).unwrap();
        wire.try_recv().unwrap();
        s.lock(&LockId::from("L"), ThreadId(1), LockLevel::Write).unwrap();
        let Ok(ClientMessage::Lock(request)) = wire.try_recv() else {
            panic!("expected a lock request");
        };
        assert_eq!(request.mode, LockMode::Acquire);
        s.handle(ServerMessage::Lock(LockResponse {
            lock_id: LockId::from("L"),
            thread: ThreadId(1),
            level: Some(LockLevel::Write),
            granted: true,
            timed_out: false,
            deadlock_chain: None,
        }))
        .unwrap();
        assert!(matches!(events.try_recv(), Ok(SessionEvent::Lock(LockOutcome::Granted { .. }))));
        assert!(s.locks().is_held(&LockId::from("L"), ThreadId(1)));
    }

    #[test]
    fn test_expired_window_resets_and_rehandshakes() {
        let (s, mut wire, mut events) = session();
        s.cache().add(&[ObjectId(1)]);
        s.commit(ThreadId(1), ChangeSet::default(), &[]).unwrap();
        s.connect().unwrap();
        wire.try_recv().unwrap();
        s.handle(ServerMessage::HandshakeAck(HandshakeResponse::rejected(
            RejectReason::ReconnectWindowExpired,
            "late",
        )))
        .unwrap();
        assert_eq!(events.try_recv().unwrap(), SessionEvent::SessionReset);
        let Ok(ClientMessage::Handshake(fresh)) = wire.try_recv() else {
            panic!("expected a fresh handshake");
        };
        assert!(!fresh.carries_state());
        assert!(fresh.cached_object_ids.is_empty());
    }

    #[test]
    fn test_fatal_error_drops_session_state() {
        let (s, mut wire, mut events) = session();
        s.connect().unwrap();
        s.handle(accept()).unwrap();
        wire.try_recv().unwrap();
        s.cache().add(&[ObjectId(3)]);
        s.commit(ThreadId(1), ChangeSet::default(), &[]).unwrap();
        assert!(!s.transactions().is_empty());

        s.handle(ServerMessage::Error {
            message: "lock not held".to_string(),
            fatal: true,
        })
        .unwrap();
        assert!(matches!(
            events.try_recv(),
            Ok(SessionEvent::ServerError { fatal: true, .. })
        ));
        assert_eq!(events.try_recv().unwrap(), SessionEvent::SessionReset);
        assert!(s.transactions().is_empty());
        assert!(!s.cache().contains(ObjectId(3)));

        while wire.try_recv().is_ok() {}
        s.connect().unwrap();
        let Ok(ClientMessage::Handshake(fresh)) = wire.try_recv() else {
            panic!("expected a handshake");
        };
        assert!(!fresh.carries_state());
    }

    #[test]
    fn test_stale_ids_in_ack_are_evicted() {
        let (s, mut wire, mut events) = session();
        s.cache().add(&[ObjectId(1), ObjectId(2)]);
        s.connect().unwrap();
        wire.try_recv().unwrap();
        s.handle(ServerMessage::HandshakeAck(HandshakeResponse {
            accepted: true,
            stale_object_ids: vec![ObjectId(2), ObjectId(7)],
            ..HandshakeResponse::default()
        }))
        .unwrap();
        assert!(s.cache().contains(ObjectId(1)));
        assert!(!s.cache().contains(ObjectId(2)));
        let Ok(SessionEvent::Invalidated(push)) = events.try_recv() else {
            panic!("expected an invalidation");
        };
        assert_eq!(push.members, vec![ObjectId(2)]);
    }

    #[test]
    fn test_pending_batch_request_reported_and_cleared() {
        let (s, mut wire, _) = session();
        s.connect().unwrap();
        s.handle(accept()).unwrap();
        wire.try_recv().unwrap();
        assert!(matches!(s.next_ids(), NextBatch::Requested(1)));
        assert!(matches!(wire.try_recv(), Ok(ClientMessage::Batch(_))));

        s.connection_lost();
        s.connect().unwrap();
        let Ok(ClientMessage::Handshake(request)) = wire.try_recv() else {
            panic!("expected a handshake");
        };
        assert!(request.object_id_batch_pending);
        s.handle(ServerMessage::HandshakeAck(HandshakeResponse {
            accepted: true,
            object_id_ranges: vec![BatchRange::new(200, 300)],
            ..HandshakeResponse::default()
        }))
        .unwrap();
        s.handle(ServerMessage::Batch(BatchResponse {
            request_id: 1,
            start: 0,
            end: 100,
        }))
        .unwrap();
        assert_eq!(s.next_ids(), NextBatch::Ready(BatchRange::new(200, 210)));
        assert_eq!(s.ids().remaining(), 90);
    }
}
