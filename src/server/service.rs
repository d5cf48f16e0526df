//! Coherence service.
//!
//! Owns the server-side subsystems and turns client messages into calls on
//! them. Everything produced for a client (lock notices, acks, pushes) goes
//! out through the [`Outbox`], which maps a node to its live connection.
//!
//! Messages are processed synchronously; ordering per node is the caller's
//! job (see [`crate::server::stages`]).

use super::listener::ConnectionId;
use crate::core::config::Config;
use crate::core::context::NodeContext;
use crate::core::error::{CoherenceError, CoherenceResult};
use crate::core::time::TimerSpec;
use crate::handshake::server::{
    ConnectionState, HandshakeSettings, ReleasedAcks, ServerHandshakeCoordinator,
};
use crate::locks::deadlock::DeadlockChain;
use crate::locks::lock::LockNotice;
use crate::locks::manager::{LockManager, LockNoticeSink};
use crate::locks::timer::TimerScheduler;
use crate::model::lock::Requester;
use crate::model::node::NodeId;
use crate::model::object::ChangeSet;
use crate::model::txn::ServerTransactionId;
use crate::ops::metrics::{names, HealthStatus};
use crate::protocol::messages::{
    BatchRequest, BatchResponse, ClientMessage, CompletedTransactionLowWaterMark,
    HandshakeRequest, InvalidationPush, LockMode, LockRequest, LockResponse, ServerMessage,
    TransactionBatch,
};
use crate::registry::ClientStateRegistry;
use crate::sequence::{GroupSequencer, SequenceAuthority};
use crate::txn::{TransactionApplier, TransactionBatchTracker};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Writer side of one client connection.
pub type ReplySender = mpsc::UnboundedSender<ServerMessage>;

#[derive(Debug)]
struct Route {
    connection: ConnectionId,
    tx: ReplySender,
}

/// Routes server messages to the connection currently owned by each node.
#[derive(Debug, Default)]
pub struct Outbox {
    routes: RwLock<HashMap<NodeId, Route>>,
}

impl Outbox {
    /// Empty outbox.
    pub fn new() -> Self {
        Self::default()
    }

    /// Route messages for `node` to `connection`.
    pub fn attach(&self, node: NodeId, connection: ConnectionId, tx: ReplySender) {
        self.routes.write().insert(node, Route { connection, tx });
    }

    /// Stop routing to `connection`. A newer connection for the same node is
    /// left alone.
    pub fn detach(&self, node: NodeId, connection: ConnectionId) -> bool {
        let mut routes = self.routes.write();
        match routes.get(&node) {
            Some(route) if route.connection == connection => {
                routes.remove(&node);
                true
            }
            _ => false,
        }
    }

    /// Stop routing to whatever connection `node` has.
    pub fn detach_node(&self, node: NodeId) -> bool {
        self.routes.write().remove(&node).is_some()
    }

    /// Connection currently owned by `node`.
    pub fn connection_of(&self, node: NodeId) -> Option<ConnectionId> {
        self.routes.read().get(&node).map(|r| r.connection)
    }

    /// Queue `message` for `node`. False when the node has no live route.
    pub fn send(&self, node: NodeId, message: ServerMessage) -> bool {
        let routes = self.routes.read();
        let Some(route) = routes.get(&node) else {
            tracing::trace!(node = %node, message = message.name(), "no route; message dropped");
            return false;
        };
        route.tx.send(message).is_ok()
    }

    /// Number of routed nodes.
    pub fn len(&self) -> usize {
        self.routes.read().len()
    }

    /// Check if nothing is routed.
    pub fn is_empty(&self) -> bool {
        self.routes.read().is_empty()
    }
}

impl LockNoticeSink for Outbox {
    fn deliver(&self, notice: LockNotice) {
        let node = notice.node();
        self.send(node, notice_to_message(notice));
    }
}

/// Wire form of a lock notice.
pub fn notice_to_message(notice: LockNotice) -> ServerMessage {
    match notice {
        LockNotice::Granted {
            lock_id,
            requester,
            level,
        } => ServerMessage::Lock(LockResponse {
            lock_id,
            thread: requester.thread,
            level: Some(level),
            granted: true,
            timed_out: false,
            deadlock_chain: None,
        }),
        LockNotice::TryFailed {
            lock_id,
            requester,
            level,
        } => ServerMessage::Lock(LockResponse {
            lock_id,
            thread: requester.thread,
            level: Some(level),
            granted: false,
            timed_out: true,
            deadlock_chain: None,
        }),
        LockNotice::WaitTimedOut { lock_id, requester } => ServerMessage::Lock(LockResponse {
            lock_id,
            thread: requester.thread,
            level: None,
            granted: false,
            timed_out: true,
            deadlock_chain: None,
        }),
        LockNotice::Recall { lock_id, level, .. } => ServerMessage::Recall { lock_id, level },
        LockNotice::Deadlocked {
            lock_id,
            requester,
            chain,
        } => ServerMessage::Lock(LockResponse {
            lock_id,
            thread: requester.thread,
            level: None,
            granted: false,
            timed_out: false,
            deadlock_chain: Some(chain),
        }),
    }
}

/// Result of opening a session on a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionOpen {
    /// The handshake completed; these nodes became connected (more than one
    /// when it finished server startup).
    Connected(Vec<NodeId>),
    /// Accepted but the ack is held until the server finishes starting.
    Deferred,
    /// Refused; the rejection was sent on the connection.
    Rejected,
}

/// Server-side coherence service.
pub struct CoherenceService {
    ctx: NodeContext,
    outbox: Arc<Outbox>,
    locks: Arc<LockManager>,
    registry: Arc<ClientStateRegistry>,
    tracker: Arc<TransactionBatchTracker>,
    authority: Arc<SequenceAuthority>,
    handshake: ServerHandshakeCoordinator,
}

impl CoherenceService {
    /// Wire the subsystems together. With `expected` set the service starts
    /// in the starting phase, waiting for those clients to return.
    pub fn build(
        ctx: NodeContext,
        config: &Config,
        authority: Arc<SequenceAuthority>,
        timers: Arc<dyn TimerScheduler>,
        applier: Arc<dyn TransactionApplier>,
        expected: Option<Vec<NodeId>>,
    ) -> Self {
        let outbox = Arc::new(Outbox::new());
        let locks = match expected {
            Some(_) => LockManager::starting(ctx.clone(), timers, outbox.clone()),
            None => LockManager::new(ctx.clone(), timers, outbox.clone()),
        }
        .with_scan_on_pending(config.locks.scan_on_pending);
        let locks = Arc::new(locks);
        let registry = Arc::new(ClientStateRegistry::new(ctx.clone()));
        let tracker = Arc::new(TransactionBatchTracker::new(ctx.clone(), locks.clone(), applier));
        let settings = HandshakeSettings::from_config(config);
        let sequencer = GroupSequencer::new(authority.clone());
        let handshake = match expected {
            Some(nodes) => ServerHandshakeCoordinator::starting(
                ctx.clone(),
                settings,
                locks.clone(),
                registry.clone(),
                tracker.clone(),
                sequencer,
                nodes,
            ),
            None => ServerHandshakeCoordinator::new(
                ctx.clone(),
                settings,
                locks.clone(),
                registry.clone(),
                tracker.clone(),
                sequencer,
            ),
        };
        Self {
            ctx,
            outbox,
            locks,
            registry,
            tracker,
            authority,
            handshake,
        }
    }

    /// Node context.
    pub fn context(&self) -> &NodeContext {
        &self.ctx
    }

    /// Message routes.
    pub fn outbox(&self) -> &Arc<Outbox> {
        &self.outbox
    }

    /// Lock manager.
    pub fn locks(&self) -> &Arc<LockManager> {
        &self.locks
    }

    /// Client state registry.
    pub fn registry(&self) -> &Arc<ClientStateRegistry> {
        &self.registry
    }

    /// Transaction tracker.
    pub fn tracker(&self) -> &Arc<TransactionBatchTracker> {
        &self.tracker
    }

    /// Id authority.
    pub fn authority(&self) -> &Arc<SequenceAuthority> {
        &self.authority
    }

    /// Handshake coordinator.
    pub fn handshake(&self) -> &ServerHandshakeCoordinator {
        &self.handshake
    }

    /// Process the handshake that opens `connection`.
    pub fn open_session(
        &self,
        connection: ConnectionId,
        request: HandshakeRequest,
        reply: &ReplySender,
    ) -> SessionOpen {
        let node = request.node;
        // A live session keeps its route; the newcomer only gets the refusal.
        let live = matches!(
            self.handshake.connection_state(node),
            ConnectionState::Connected | ConnectionState::Handshaking
        );
        if !live {
            self.outbox.attach(node, connection, reply.clone());
        }

        let acks = self.handshake.handle_handshake(request);
        let own = acks.iter().find(|(to, _)| *to == node).map(|(_, ack)| ack.clone());
        match own {
            Some(ack) if !ack.accepted => {
                if reply.send(ServerMessage::HandshakeAck(ack)).is_err() {
                    tracing::debug!(
                        node = %node,
                        %connection,
                        "connection closed before rejection"
                    );
                }
                if !live {
                    self.outbox.detach(node, connection);
                }
                SessionOpen::Rejected
            }
            Some(_) => SessionOpen::Connected(self.deliver_acks(acks)),
            None => {
                tracing::debug!(node = %node, %connection, "handshake deferred until start");
                SessionOpen::Deferred
            }
        }
    }

    /// Process one steady-state message from a connected node.
    pub fn handle(&self, node: NodeId, message: ClientMessage) -> CoherenceResult<()> {
        if let Some(err) = self.handshake.traffic_error(node) {
            return Err(err);
        }
        match message {
            ClientMessage::Handshake(_) => Err(CoherenceError::protocol(
                node,
                "handshake on an established session",
            )),
            ClientMessage::Lock(request) => self.on_lock(node, request),
            ClientMessage::Batch(request) => self.on_batch(node, request),
            ClientMessage::Transactions(batch) => self.on_transactions(node, batch),
            ClientMessage::AddReferences(ids) => {
                self.registry.add_references(node, ids)?;
                Ok(())
            }
            ClientMessage::RemoveReferences(ids) => {
                self.registry.remove_references(node, &ids);
                Ok(())
            }
            ClientMessage::Goodbye => {
                self.goodbye(node);
                Ok(())
            }
        }
    }

    /// Report a failed message to its sender. Fatal errors tear the session
    /// down; the client must start over with a fresh handshake.
    pub fn report_error(&self, node: NodeId, err: &CoherenceError) {
        let fatal = err.is_fatal();
        self.outbox.send(
            node,
            ServerMessage::Error {
                message: err.to_string(),
                fatal,
            },
        );
        if fatal {
            tracing::warn!(node = %node, error = %err, "tearing down session");
            self.outbox.detach_node(node);
            self.handshake.evict_node(node);
        } else {
            tracing::debug!(node = %node, error = %err, "request failed");
        }
    }

    /// Clean shutdown of `node`.
    pub fn goodbye(&self, node: NodeId) {
        if self.handshake.shutdown_node(node) {
            tracing::info!(node = %node, "client said goodbye");
        }
        self.outbox.detach_node(node);
    }

    /// A connection closed. Pauses its node if the connection still owned
    /// the node's route.
    pub fn connection_closed(&self, node: NodeId, connection: ConnectionId) -> bool {
        if !self.outbox.detach(node, connection) {
            return false;
        }
        self.handshake.disconnect(node)
    }

    /// Expire reconnect windows. Returns nodes that became connected because
    /// the server finished starting.
    pub fn expire_windows(&self) -> Vec<NodeId> {
        let outcome = self.handshake.expire_windows();
        for node in &outcome.departed {
            self.outbox.detach_node(*node);
        }
        self.deliver_acks(outcome.released)
    }

    /// Finish starting now. Returns nodes that became connected.
    pub fn start(&self) -> CoherenceResult<Vec<NodeId>> {
        let released = self.handshake.start()?;
        Ok(self.deliver_acks(released))
    }

    /// Run a deadlock scan. Returns the cycles the previous scan missed.
    pub fn detect_deadlocks(&self) -> Vec<DeadlockChain> {
        self.locks.detect_new_deadlocks()
    }

    /// The applier reports a deferred transaction durable.
    pub fn mark_durable(&self, txn: ServerTransactionId) {
        if let Some(watermark) = self.tracker.mark_durable(txn) {
            self.outbox.send(
                txn.source,
                ServerMessage::LowWaterMark(CompletedTransactionLowWaterMark {
                    node: txn.source,
                    watermark,
                }),
            );
        }
    }

    /// Health derived from the lock manager state.
    pub fn health(&self) -> HealthStatus {
        if self.locks.is_started() {
            HealthStatus::healthy()
        } else {
            HealthStatus::unhealthy(format!("lock manager is {:?}", self.locks.state()))
        }
    }

    fn deliver_acks(&self, acks: ReleasedAcks) -> Vec<NodeId> {
        let mut connected = Vec::with_capacity(acks.len());
        for (node, ack) in acks {
            let accepted = ack.accepted;
            if !self.outbox.send(node, ServerMessage::HandshakeAck(ack)) {
                tracing::debug!(node = %node, "ack undeliverable; connection gone");
            }
            if accepted {
                connected.push(node);
            }
        }
        connected
    }

    fn on_lock(&self, node: NodeId, request: LockRequest) -> CoherenceResult<()> {
        if request.node != node {
            return Err(CoherenceError::protocol(
                node,
                format!("lock request on behalf of {}", request.node),
            ));
        }
        let requester = Requester::new(node, request.thread);
        let lock_id = &request.lock_id;
        let timer = request.timer.unwrap_or(TimerSpec::ZERO);
        match request.mode {
            LockMode::Acquire => self.locks.request(lock_id, requester, request.level),
            LockMode::TryAcquire => {
                self.locks
                    .try_request(lock_id, requester, request.level, timer)
            }
            LockMode::Release => self.locks.release(lock_id, requester),
            LockMode::Wait => self.locks.wait(lock_id, requester, timer),
            LockMode::Notify | LockMode::NotifyAll => {
                let woken = self
                    .locks
                    .notify(lock_id, requester, request.mode == LockMode::NotifyAll)?;
                tracing::trace!(lock = %lock_id, woken = woken.len(), "notified");
                Ok(())
            }
            LockMode::Interrupt => {
                self.locks.interrupt(lock_id, requester)?;
                Ok(())
            }
        }
    }

    fn on_batch(&self, node: NodeId, request: BatchRequest) -> CoherenceResult<()> {
        let range = self
            .authority
            .request_batch(node, request.group, request.size)?;
        self.outbox.send(
            node,
            ServerMessage::Batch(BatchResponse {
                request_id: request.request_id,
                start: range.start,
                end: range.end,
            }),
        );
        Ok(())
    }

    fn on_transactions(&self, node: NodeId, batch: TransactionBatch) -> CoherenceResult<()> {
        let outcome = self.tracker.receive_batch(node, batch.transactions)?;

        // Invalidations go out before the ack that makes the writes visible
        // to the committer.
        for applied in &outcome.applied {
            self.fan_out(node, &applied.changes);
            let removed = applied.changes.removed_ids();
            let kept = applied
                .changes
                .touched_ids()
                .into_iter()
                .filter(|id| !removed.contains(id));
            self.registry.add_references(node, kept)?;
        }

        let acknowledged = outcome.acknowledged();
        if !acknowledged.is_empty() {
            self.outbox
                .send(node, ServerMessage::TransactionAck(acknowledged));
        }
        if let Some(watermark) = outcome.low_water_mark {
            self.outbox.send(
                node,
                ServerMessage::LowWaterMark(CompletedTransactionLowWaterMark { node, watermark }),
            );
        }
        match outcome.apply_error {
            Some(reason) => Err(CoherenceError::internal(format!(
                "batch from {} stopped: {}",
                node, reason
            ))),
            None => Ok(()),
        }
    }

    fn fan_out(&self, origin: NodeId, changes: &ChangeSet) {
        for (target, pushed) in self.registry.invalidate_for_all(origin, changes) {
            if !pushed.changes.is_empty()
                && !self
                    .outbox
                    .send(target, ServerMessage::Changes(pushed.changes.clone()))
            {
                // Forget what could not be updated so the next handshake
                // reports it stale.
                let ids: Vec<_> = pushed.changes.touched_ids().into_iter().collect();
                self.registry.remove_references(target, &ids);
            }
            for (container, members) in pushed.invalidations.into_entries() {
                self.ctx.metrics().counter_inc(names::TXN_INVALIDATIONS);
                self.outbox.send(
                    target,
                    ServerMessage::Invalidation(InvalidationPush { container, members }),
                );
            }
        }
    }
}

impl std::fmt::Debug for CoherenceService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoherenceService")
            .field("node", &self.ctx.node_name())
            .field("phase", &self.handshake.phase())
            .field("routes", &self.outbox.len())
            .field("locks", &self.locks.lock_count())
            .finish()
    }
}
