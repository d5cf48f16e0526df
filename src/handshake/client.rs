//! Client handshake coordinator.
//!
//! Client collaborators (lock table, resend buffer, id pool, reference
//! cache) register as [`HandshakeObserver`]s. Every transition is dispatched
//! to the observers synchronously, in registration order:
//!
//! - connection lost: `pause`
//! - handshake built: `initialize_handshake`, each observer adding its part
//! - ack accepted: `unpause`
//! - session state lost on the server: `reset`
//! - goodbye: `shutdown`
//!
//! Steady-state traffic resumes only after an accepted ack;
//! [`ClientHandshakeCoordinator::wait_connected`] is the back-pressure point.

use crate::core::error::{CoherenceError, CoherenceResult};
use crate::model::node::NodeId;
use crate::protocol::messages::{HandshakeRequest, HandshakeResponse, RejectReason};
use parking_lot::RwLock;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::watch;

/// Receives session transitions.
pub trait HandshakeObserver: Send + Sync {
    /// The connection dropped.
    fn pause(&self) {}

    /// Add this collaborator's state to an outgoing handshake.
    fn initialize_handshake(&self, _request: &mut HandshakeRequest) {}

    /// The server accepted the handshake.
    fn unpause(&self, _response: &HandshakeResponse) {}

    /// The server no longer has this node's state; drop session state.
    fn reset(&self) {}

    /// The session is closing for good.
    fn shutdown(&self) {}
}

/// Client view of its connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ClientConnectionState {
    /// Not yet connected.
    Disconnected,
    /// Handshake sent, ack outstanding.
    Handshaking,
    /// Ack received.
    Connected,
    /// Connection lost; waiting to reconnect.
    Paused,
    /// Goodbye sent.
    Shutdown,
}

/// Client side of session establishment and recovery.
pub struct ClientHandshakeCoordinator {
    node: NodeId,
    protocol_version: String,
    client_version: String,
    observers: RwLock<Vec<Arc<dyn HandshakeObserver>>>,
    state: watch::Sender<ClientConnectionState>,
}

impl ClientHandshakeCoordinator {
    /// Create a coordinator for `node`.
    pub fn new(
        node: NodeId,
        protocol_version: impl Into<String>,
        client_version: impl Into<String>,
    ) -> Self {
        let (state, _) = watch::channel(ClientConnectionState::Disconnected);
        Self {
            node,
            protocol_version: protocol_version.into(),
            client_version: client_version.into(),
            observers: RwLock::new(Vec::new()),
            state,
        }
    }

    /// Node this coordinator speaks for.
    pub fn node(&self) -> NodeId {
        self.node
    }

    /// Register an observer; it runs after every earlier registration.
    pub fn add_observer(&self, observer: Arc<dyn HandshakeObserver>) {
        self.observers.write().push(observer);
    }

    /// Number of registered observers.
    pub fn observer_count(&self) -> usize {
        self.observers.read().len()
    }

    /// Current state.
    pub fn state(&self) -> ClientConnectionState {
        *self.state.borrow()
    }

    /// Whether steady-state traffic may be sent.
    pub fn is_connected(&self) -> bool {
        self.state() == ClientConnectionState::Connected
    }

    /// Wait until an ack is accepted. Fails if the session shuts down.
    pub async fn wait_connected(&self) -> CoherenceResult<()> {
        let mut rx = self.state.subscribe();
        let state = rx
            .wait_for(|s| {
                matches!(
                    s,
                    ClientConnectionState::Connected | ClientConnectionState::Shutdown
                )
            })
            .await
            .map_err(|_| CoherenceError::internal("handshake coordinator dropped"))?;
        match *state {
            ClientConnectionState::Connected => Ok(()),
            _ => Err(CoherenceError::internal("session shut down")),
        }
    }

    /// Build the handshake for a (re)connect.
    pub fn build_handshake(&self) -> CoherenceResult<HandshakeRequest> {
        if self.state() == ClientConnectionState::Shutdown {
            return Err(CoherenceError::internal("session shut down"));
        }
        let mut request = HandshakeRequest {
            node: self.node,
            protocol_version: self.protocol_version.clone(),
            client_version: self.client_version.clone(),
            ..HandshakeRequest::default()
        };
        for observer in self.observers.read().iter() {
            observer.initialize_handshake(&mut request);
        }
        self.state.send_replace(ClientConnectionState::Handshaking);
        tracing::debug!(
            node = %self.node,
            held = request.held_locks.len(),
            pending = request.pending_locks.len() + request.pending_try_locks.len(),
            resend = request.unacknowledged.len(),
            "sending handshake"
        );
        Ok(request)
    }

    /// Handle the server's ack.
    pub fn acknowledged(&self, response: &HandshakeResponse) -> CoherenceResult<()> {
        if self.state() != ClientConnectionState::Handshaking {
            return Err(CoherenceError::protocol(
                self.node,
                "handshake ack without an outstanding handshake",
            ));
        }
        if !response.accepted {
            self.state.send_replace(ClientConnectionState::Disconnected);
            let detail = response.error_reason.clone().unwrap_or_default();
            tracing::warn!(
                node = %self.node,
                reason = ?response.rejection,
                %detail,
                "handshake rejected"
            );
            return Err(self.rejection_error(response.rejection.as_ref(), detail));
        }
        for observer in self.observers.read().iter() {
            observer.unpause(response);
        }
        self.state.send_replace(ClientConnectionState::Connected);
        tracing::info!(
            node = %self.node,
            low_water_mark = %response.low_water_mark,
            "session established"
        );
        Ok(())
    }

    /// The connection dropped.
    pub fn disconnected(&self) {
        let paused = self.state.send_if_modified(|s| match s {
            ClientConnectionState::Connected | ClientConnectionState::Handshaking => {
                *s = ClientConnectionState::Paused;
                true
            }
            _ => false,
        });
        if paused {
            for observer in self.observers.read().iter() {
                observer.pause();
            }
            tracing::info!(node = %self.node, "connection lost; paused");
        }
    }

    /// Drop session state after the server forgot this node.
    pub fn reset(&self) {
        for observer in self.observers.read().iter() {
            observer.reset();
        }
        self.state.send_replace(ClientConnectionState::Disconnected);
    }

    /// Close the session.
    pub fn shutdown(&self) {
        let previous = self.state.send_replace(ClientConnectionState::Shutdown);
        if previous == ClientConnectionState::Shutdown {
            return;
        }
        for observer in self.observers.read().iter() {
            observer.shutdown();
        }
    }

    fn rejection_error(&self, reason: Option<&RejectReason>, detail: String) -> CoherenceError {
        match reason {
            Some(RejectReason::VersionMismatch { server }) => CoherenceError::VersionMismatch {
                server: server.clone(),
                client: self.protocol_version.clone(),
            },
            Some(RejectReason::ReconnectWindowExpired) => {
                CoherenceError::ReconnectWindowExpired { node: self.node }
            }
            Some(RejectReason::AlreadyConnected) => {
                CoherenceError::NodeAlreadyConnected { node: self.node }
            }
            Some(RejectReason::ProtocolViolation) | None => {
                CoherenceError::protocol(self.node, detail)
            }
        }
    }
}

impl std::fmt::Debug for ClientHandshakeCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientHandshakeCoordinator")
            .field("node", &self.node)
            .field("state", &self.state())
            .field("observers", &self.observer_count())
            .finish()
    }
}
