//! Server handshake coordinator.
//!
//! Tracks the connection state of every client node:
//!
//! ```text
//! DISCONNECTED -> HANDSHAKING -> CONNECTED -> PAUSED -> HANDSHAKING
//!                                                    \-> DISCONNECTED (window expired)
//! ```
//!
//! A handshake re-seeds the lock manager, the client state registry and the
//! transaction tracker from what the client reports, then acknowledges with
//! the node's transaction marks (and a fresh id range when the client had a
//! batch request outstanding).
//!
//! A paused node keeps its server-side state for the reconnect window. When
//! the window elapses the node departs: its locks are released, its
//! references purged and a tombstone is left so that a late handshake that
//! still asserts old state is refused. A node torn down for a fatal error is
//! tombstoned the same way.
//!
//! A coordinator built with [`ServerHandshakeCoordinator::starting`] waits
//! for the clients that were connected to the previous server. Acks are held
//! back until every expected client returned or the window elapsed, at which
//! point the lock manager starts and the held acks are released.

use crate::core::config::Config;
use crate::core::context::NodeContext;
use crate::core::error::{CoherenceError, CoherenceResult};
use crate::core::time::Tick;
use crate::locks::manager::LockManager;
use crate::model::node::NodeId;
use crate::ops::events::{EventKind, OperatorEvent, Severity};
use crate::ops::metrics::names;
use crate::protocol::messages::{HandshakeRequest, HandshakeResponse, RejectReason};
use crate::protocol::versions_compatible;
use crate::registry::ClientStateRegistry;
use crate::sequence::GroupSequencer;
use crate::txn::TransactionBatchTracker;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

/// Connection state of one client node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ConnectionState {
    /// No session.
    Disconnected,
    /// Handshake in progress, or ack held back while the server starts.
    Handshaking,
    /// Steady-state traffic allowed.
    Connected,
    /// Connection lost; state retained until `until`.
    Paused { until: Tick },
}

/// Coordinator phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ServerPhase {
    /// Waiting for the clients of a previous server.
    Starting,
    /// Serving.
    Started,
}

/// Membership transition reported by the cluster layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Transition {
    /// Node became reachable.
    Up,
    /// Node became unreachable.
    Down,
}

/// Cluster membership event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterEvent {
    /// Node concerned.
    pub node: NodeId,
    /// Transition.
    pub transition: Transition,
}

/// Handshake tuning taken from the server configuration.
#[derive(Debug, Clone)]
pub struct HandshakeSettings {
    /// Server protocol version.
    pub protocol_version: String,
    /// Reconnect window.
    pub reconnect_window_ms: u64,
    /// Ids granted when a handshake reports a pending batch request.
    pub batch_grant_size: u64,
}

impl HandshakeSettings {
    /// Settings from a loaded configuration.
    pub fn from_config(config: &Config) -> Self {
        Self {
            protocol_version: config.server.protocol_version.clone(),
            reconnect_window_ms: config.server.reconnect_window_ms,
            batch_grant_size: config.sequence.client_fetch_size,
        }
    }
}

/// Acks ready to be sent, addressed by node.
pub type ReleasedAcks = Vec<(NodeId, HandshakeResponse)>;

/// Result of a window expiry pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExpiryOutcome {
    /// Nodes that departed.
    pub departed: Vec<NodeId>,
    /// Acks released because the server finished starting.
    pub released: ReleasedAcks,
}

#[derive(Debug)]
struct CoordinatorState {
    phase: ServerPhase,
    starting_deadline: Tick,
    expected: BTreeSet<NodeId>,
    deferred: ReleasedAcks,
    nodes: HashMap<NodeId, ConnectionState>,
    tombstones: HashSet<NodeId>,
}

/// Server side of session establishment and recovery.
pub struct ServerHandshakeCoordinator {
    ctx: NodeContext,
    settings: HandshakeSettings,
    locks: Arc<LockManager>,
    registry: Arc<ClientStateRegistry>,
    tracker: Arc<TransactionBatchTracker>,
    sequencer: GroupSequencer,
    state: Mutex<CoordinatorState>,
}

impl ServerHandshakeCoordinator {
    /// Coordinator for a server that is serving from the start.
    pub fn new(
        ctx: NodeContext,
        settings: HandshakeSettings,
        locks: Arc<LockManager>,
        registry: Arc<ClientStateRegistry>,
        tracker: Arc<TransactionBatchTracker>,
        sequencer: GroupSequencer,
    ) -> Self {
        let state = CoordinatorState {
            phase: ServerPhase::Started,
            starting_deadline: ctx.now(),
            expected: BTreeSet::new(),
            deferred: Vec::new(),
            nodes: HashMap::new(),
            tombstones: HashSet::new(),
        };
        Self {
            ctx,
            settings,
            locks,
            registry,
            tracker,
            sequencer,
            state: Mutex::new(state),
        }
    }

    /// Coordinator for a server taking over from a failed one. `expected`
    /// are the clients connected to the previous server; `locks` must be in
    /// the starting state.
    pub fn starting(
        ctx: NodeContext,
        settings: HandshakeSettings,
        locks: Arc<LockManager>,
        registry: Arc<ClientStateRegistry>,
        tracker: Arc<TransactionBatchTracker>,
        sequencer: GroupSequencer,
        expected: impl IntoIterator<Item = NodeId>,
    ) -> Self {
        let coordinator = Self::new(ctx, settings, locks, registry, tracker, sequencer);
        {
            let mut state = coordinator.state.lock();
            state.phase = ServerPhase::Starting;
            state.starting_deadline = coordinator
                .ctx
                .now()
                .add_ms(coordinator.settings.reconnect_window_ms);
            state.expected = expected.into_iter().filter(NodeId::is_client).collect();
            tracing::info!(
                expected = state.expected.len(),
                deadline = %state.starting_deadline,
                "waiting for clients of the previous server"
            );
        }
        coordinator
    }

    /// Current phase.
    pub fn phase(&self) -> ServerPhase {
        self.state.lock().phase
    }

    /// Connection state of `node`.
    pub fn connection_state(&self, node: NodeId) -> ConnectionState {
        self.state
            .lock()
            .nodes
            .get(&node)
            .copied()
            .unwrap_or(ConnectionState::Disconnected)
    }

    /// Whether steady-state traffic from `node` may be processed.
    pub fn is_connected(&self, node: NodeId) -> bool {
        self.connection_state(node) == ConnectionState::Connected
    }

    /// Error describing why traffic from `node` cannot be processed now.
    pub fn traffic_error(&self, node: NodeId) -> Option<CoherenceError> {
        match self.connection_state(node) {
            ConnectionState::Connected => None,
            ConnectionState::Paused { .. } => Some(CoherenceError::NodePaused { node }),
            ConnectionState::Handshaking | ConnectionState::Disconnected => {
                Some(CoherenceError::HandshakeIncomplete { node })
            }
        }
    }

    /// Nodes currently connected.
    pub fn connected_nodes(&self) -> Vec<NodeId> {
        let state = self.state.lock();
        let mut nodes: Vec<NodeId> = state
            .nodes
            .iter()
            .filter(|(_, s)| **s == ConnectionState::Connected)
            .map(|(n, _)| *n)
            .collect();
        nodes.sort();
        nodes
    }

    /// Process a handshake. Returns the acks to send now: empty while the
    /// server is starting, several when this handshake completes startup.
    pub fn handle_handshake(&self, request: HandshakeRequest) -> ReleasedAcks {
        let node = request.node;
        let mut state = self.state.lock();

        if let Some(rejection) = self.screen(&mut state, &request) {
            return vec![(node, rejection)];
        }

        let previous = state.nodes.insert(node, ConnectionState::Handshaking);
        let response = match self.rehydrate(&request) {
            Ok(response) => response,
            Err(e) => {
                tracing::warn!(node = %node, error = %e, "handshake rehydration failed");
                self.depart(&mut state, node);
                let ack = self.reject(node, RejectReason::ProtocolViolation, e.to_string());
                return vec![(node, ack)];
            }
        };

        let metrics = self.ctx.metrics();
        if let Some(ConnectionState::Paused { .. }) = previous {
            metrics.gauge_dec(names::CLIENTS_PAUSED);
        }
        metrics.counter_inc(names::HANDSHAKES_COMPLETED);

        if state.phase == ServerPhase::Starting {
            state.expected.remove(&node);
            state.deferred.push((node, response));
            tracing::debug!(
                node = %node,
                remaining = state.expected.len(),
                "handshake ack deferred"
            );
            if state.expected.is_empty() {
                return self.finish_starting(&mut state);
            }
            return Vec::new();
        }

        self.mark_connected(&mut state, node, previous.is_none());
        vec![(node, response)]
    }

    /// A connection dropped: keep the node's state for the reconnect window.
    pub fn disconnect(&self, node: NodeId) -> bool {
        let mut state = self.state.lock();
        let Some(current) = state.nodes.get_mut(&node) else {
            return false;
        };
        let was_connected = *current == ConnectionState::Connected;
        match *current {
            ConnectionState::Connected | ConnectionState::Handshaking => {
                let until = self.ctx.now().add_ms(self.settings.reconnect_window_ms);
                *current = ConnectionState::Paused { until };
                let metrics = self.ctx.metrics();
                if was_connected {
                    metrics.gauge_dec(names::CLIENTS_CONNECTED);
                }
                metrics.gauge_inc(names::CLIENTS_PAUSED);
                state.deferred.retain(|(n, _)| *n != node);
                self.ctx.record(
                    OperatorEvent::new(
                        EventKind::NodePaused,
                        format!("{} disconnected; state kept until {}", node, until),
                    )
                    .with_node(node),
                );
                true
            }
            ConnectionState::Paused { .. } | ConnectionState::Disconnected => false,
        }
    }

    /// Depart every paused node whose window elapsed, and finish starting
    /// when the starting deadline passed.
    pub fn expire_windows(&self) -> ExpiryOutcome {
        let now = self.ctx.now();
        let mut state = self.state.lock();
        let mut outcome = ExpiryOutcome::default();

        let expired: Vec<NodeId> = state
            .nodes
            .iter()
            .filter_map(|(node, s)| match s {
                ConnectionState::Paused { until } if now.is_at_or_after(*until) => Some(*node),
                _ => None,
            })
            .collect();
        for node in expired {
            self.expire(&mut state, node);
            outcome.departed.push(node);
        }

        if state.phase == ServerPhase::Starting && now.is_at_or_after(state.starting_deadline) {
            let missing: Vec<NodeId> = std::mem::take(&mut state.expected).into_iter().collect();
            for node in missing {
                self.ctx.record(
                    OperatorEvent::new(
                        EventKind::ReconnectWindowExpired,
                        format!("{} did not return before the server started", node),
                    )
                    .with_node(node),
                );
                self.depart(&mut state, node);
                state.tombstones.insert(node);
                outcome.departed.push(node);
            }
            outcome.released = self.finish_starting(&mut state);
        }
        outcome
    }

    /// Clean shutdown (goodbye): release everything immediately.
    pub fn shutdown_node(&self, node: NodeId) -> bool {
        let mut state = self.state.lock();
        if !state.nodes.contains_key(&node) && !self.registry.is_known(node) {
            return false;
        }
        state.expected.remove(&node);
        self.depart(&mut state, node);
        true
    }

    /// Fatal teardown: release everything and leave a tombstone, so the
    /// node can only come back with a fresh session.
    pub fn evict_node(&self, node: NodeId) -> bool {
        let mut state = self.state.lock();
        if !state.nodes.contains_key(&node) && !self.registry.is_known(node) {
            return false;
        }
        state.expected.remove(&node);
        self.depart(&mut state, node);
        state.tombstones.insert(node);
        true
    }

    /// Leave the starting phase now. Returns the acks that were held back.
    pub fn start(&self) -> CoherenceResult<ReleasedAcks> {
        let mut state = self.state.lock();
        if state.phase == ServerPhase::Started {
            return Ok(Vec::new());
        }
        let missing: Vec<NodeId> = std::mem::take(&mut state.expected).into_iter().collect();
        for node in missing {
            self.depart(&mut state, node);
            state.tombstones.insert(node);
        }
        self.try_finish_starting(&mut state)
    }

    /// Apply a membership transition.
    pub fn cluster_event(&self, event: ClusterEvent) {
        self.ctx.record(
            OperatorEvent::new(
                EventKind::ClusterMembership,
                format!("{} {:?}", event.node, event.transition),
            )
            .with_node(event.node),
        );
        if event.node.is_client() && event.transition == Transition::Down {
            self.disconnect(event.node);
        }
    }

    /// Nodes whose window expired and that have not started a fresh session.
    pub fn tombstones(&self) -> Vec<NodeId> {
        let mut nodes: Vec<NodeId> = self.state.lock().tombstones.iter().copied().collect();
        nodes.sort();
        nodes
    }

    fn screen(
        &self,
        state: &mut CoordinatorState,
        request: &HandshakeRequest,
    ) -> Option<HandshakeResponse> {
        let node = request.node;
        if !versions_compatible(&self.settings.protocol_version, &request.protocol_version) {
            let err = CoherenceError::VersionMismatch {
                server: self.settings.protocol_version.clone(),
                client: request.protocol_version.clone(),
            };
            let reason = RejectReason::VersionMismatch {
                server: self.settings.protocol_version.clone(),
            };
            return Some(self.reject(node, reason, err.to_string()));
        }
        if node.is_null() || !node.is_client() {
            return Some(self.reject(
                node,
                RejectReason::ProtocolViolation,
                format!("{} cannot open a client session", node),
            ));
        }
        if let Some(foreign) = request.lock_contexts().find(|c| c.node() != node) {
            return Some(self.reject(
                node,
                RejectReason::ProtocolViolation,
                format!("handshake from {} carries foreign context {}", node, foreign),
            ));
        }

        match state.nodes.get(&node).copied() {
            Some(ConnectionState::Connected) | Some(ConnectionState::Handshaking) => {
                return Some(self.reject(
                    node,
                    RejectReason::AlreadyConnected,
                    format!("{} already has a live session", node),
                ));
            }
            Some(ConnectionState::Paused { until }) if self.ctx.now().is_at_or_after(until) => {
                self.expire(state, node);
            }
            _ => {}
        }

        if state.tombstones.contains(&node) {
            if request.carries_state() {
                let err = CoherenceError::ReconnectWindowExpired { node };
                return Some(self.reject(
                    node,
                    RejectReason::ReconnectWindowExpired,
                    err.to_string(),
                ));
            }
            state.tombstones.remove(&node);
        }
        None
    }

    fn rehydrate(&self, request: &HandshakeRequest) -> CoherenceResult<HandshakeResponse> {
        let node = request.node;
        let stale_object_ids = if self.registry.is_known(node) {
            self.registry.stale_references(node, &request.cached_object_ids)?
        } else {
            self.registry.startup_node(node)?;
            self.registry.rehydrate(node, &request.cached_object_ids)?;
            Vec::new()
        };

        for ctx in request.lock_contexts() {
            self.locks.reestablish(ctx.clone())?;
        }

        self.tracker.startup_node(node);
        let resent = self.tracker.already_applied(node, &request.unacknowledged);
        if !resent.is_empty() {
            tracing::debug!(
                node = %node,
                already_applied = resent.len(),
                "client will resend applied transactions"
            );
        }

        let object_id_ranges = if request.object_id_batch_pending {
            self.sequencer
                .request_batch(node, self.settings.batch_grant_size)?
                .ranges()
        } else {
            Vec::new()
        };

        Ok(HandshakeResponse {
            accepted: true,
            server_high_water_mark: self.tracker.highest_accepted(node).unwrap_or_default(),
            low_water_mark: self.tracker.low_water_mark(node).unwrap_or_default(),
            object_id_ranges,
            stale_object_ids,
            rejection: None,
            error_reason: None,
        })
    }

    fn reject(&self, node: NodeId, reason: RejectReason, detail: String) -> HandshakeResponse {
        self.ctx.metrics().counter_inc(names::HANDSHAKES_REJECTED);
        self.ctx.record(
            OperatorEvent::new(
                EventKind::HandshakeRejected,
                format!("handshake from {} rejected: {}", node, detail),
            )
            .with_node(node),
        );
        HandshakeResponse::rejected(reason, detail)
    }

    fn mark_connected(&self, state: &mut CoordinatorState, node: NodeId, fresh: bool) {
        state.nodes.insert(node, ConnectionState::Connected);
        self.ctx.metrics().gauge_inc(names::CLIENTS_CONNECTED);
        let (kind, verb) = if fresh {
            (EventKind::NodeJoined, "joined")
        } else {
            (EventKind::HandshakeCompleted, "reconnected")
        };
        self.ctx
            .record(OperatorEvent::new(kind, format!("{} {}", node, verb)).with_node(node));
    }

    fn expire(&self, state: &mut CoordinatorState, node: NodeId) {
        self.ctx.record(
            OperatorEvent::new(
                EventKind::ReconnectWindowExpired,
                format!(
                    "{} did not reconnect within {}ms",
                    node, self.settings.reconnect_window_ms
                ),
            )
            .with_node(node),
        );
        self.depart(state, node);
        state.tombstones.insert(node);
    }

    fn depart(&self, state: &mut CoordinatorState, node: NodeId) {
        let metrics = self.ctx.metrics();
        match state.nodes.remove(&node) {
            Some(ConnectionState::Connected) => metrics.gauge_dec(names::CLIENTS_CONNECTED),
            Some(ConnectionState::Paused { .. }) => metrics.gauge_dec(names::CLIENTS_PAUSED),
            _ => {}
        }
        state.deferred.retain(|(n, _)| *n != node);
        self.locks.clear_state_for_node(node);
        let references = self.registry.shutdown_node(node).unwrap_or(0);
        self.tracker.shutdown_node(node);
        self.ctx.record(
            OperatorEvent::new(
                EventKind::NodeLeft,
                format!("{} left; released its locks and {} reference(s)", node, references),
            )
            .with_node(node),
        );
    }

    fn finish_starting(&self, state: &mut CoordinatorState) -> ReleasedAcks {
        match self.try_finish_starting(state) {
            Ok(acks) => acks,
            Err(e) => {
                self.ctx.record(
                    OperatorEvent::new(EventKind::ServerStarted, format!("start failed: {}", e))
                        .with_severity(Severity::Error),
                );
                Vec::new()
            }
        }
    }

    fn try_finish_starting(&self, state: &mut CoordinatorState) -> CoherenceResult<ReleasedAcks> {
        self.locks.start()?;
        state.phase = ServerPhase::Started;
        let released = std::mem::take(&mut state.deferred);
        for (node, _) in &released {
            self.mark_connected(state, *node, false);
        }
        self.ctx.record(OperatorEvent::new(
            EventKind::ServerStarted,
            format!("server started with {} returning client(s)", released.len()),
        ));
        Ok(released)
    }
}

impl std::fmt::Debug for ServerHandshakeCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("ServerHandshakeCoordinator")
            .field("phase", &state.phase)
            .field("nodes", &state.nodes.len())
            .field("expected", &state.expected.len())
            .field("tombstones", &state.tombstones.len())
            .finish()
    }
}
