//! Error types and classification.
//!
//! Protocol and invariant violations are fatal for the connection that
//! produced them: the server tears the connection down and the client must
//! re-handshake from scratch. Timeouts (`try_request`, `wait`) are reported
//! as normal outcomes and never surface as errors.

use crate::model::lock::LockId;
use crate::model::node::NodeId;
use thiserror::Error;

/// Common coherence error conditions.
#[derive(Debug, Error)]
pub enum CoherenceError {
    /// A peer broke a protocol invariant (out-of-order batch, malformed
    /// handshake, conflicting lock re-establishment).
    #[error("protocol violation from {node}: {message}")]
    ProtocolViolation { node: NodeId, message: String },

    /// The referenced node has no registered state.
    #[error("unknown node: {node}")]
    UnknownNode { node: NodeId },

    /// `startup_node` was called for a node that already has state.
    #[error("node already connected: {node}")]
    NodeAlreadyConnected { node: NodeId },

    /// Client and server protocol versions are incompatible.
    #[error("protocol version mismatch: server {server}, client {client}")]
    VersionMismatch { server: String, client: String },

    /// Steady-state traffic arrived before the node's handshake completed.
    #[error("handshake not complete for {node}")]
    HandshakeIncomplete { node: NodeId },

    /// The node's connection is paused; the operation may be retried after
    /// the next successful handshake.
    #[error("node {node} is paused awaiting reconnect")]
    NodePaused { node: NodeId },

    /// The node reconnected after its reconnect window expired.
    #[error("reconnect window expired for {node}")]
    ReconnectWindowExpired { node: NodeId },

    /// `wait`/`notify` called without the sole write hold.
    #[error("illegal monitor state on {lock_id}: {message}")]
    IllegalMonitorState { lock_id: LockId, message: String },

    /// Release or wait for a context that holds nothing.
    #[error("{node} does not hold {lock_id}")]
    NotHolder { lock_id: LockId, node: NodeId },

    /// The lock manager is not accepting this call in its current state.
    #[error("lock manager is {state}")]
    LockManagerUnavailable { state: &'static str },

    /// Frame encode/decode failure.
    #[error("codec error: {message}")]
    Codec { message: String },

    /// Transport I/O failure.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal error.
    #[error("internal error: {message}")]
    Internal { message: String },
}

impl CoherenceError {
    /// Create a protocol violation error.
    pub fn protocol(node: NodeId, message: impl Into<String>) -> Self {
        Self::ProtocolViolation {
            node,
            message: message.into(),
        }
    }

    /// Create a codec error.
    pub fn codec(message: impl Into<String>) -> Self {
        Self::Codec {
            message: message.into(),
        }
    }

    /// Create an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Whether the connection that triggered this error must be torn down.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::ProtocolViolation { .. }
                | Self::UnknownNode { .. }
                | Self::VersionMismatch { .. }
                | Self::ReconnectWindowExpired { .. }
                | Self::Codec { .. }
        )
    }

    /// Whether the operation may be retried after reconnecting.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            Self::NodePaused { .. } | Self::HandshakeIncomplete { .. } | Self::Io(_)
        )
    }

    /// Short stable identifier, used in handshake rejections and events.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ProtocolViolation { .. } => "ProtocolViolation",
            Self::UnknownNode { .. } => "UnknownNode",
            Self::NodeAlreadyConnected { .. } => "NodeAlreadyConnected",
            Self::VersionMismatch { .. } => "VersionMismatch",
            Self::HandshakeIncomplete { .. } => "HandshakeIncomplete",
            Self::NodePaused { .. } => "NodePaused",
            Self::ReconnectWindowExpired { .. } => "ReconnectWindowExpired",
            Self::IllegalMonitorState { .. } => "IllegalMonitorState",
            Self::NotHolder { .. } => "NotHolder",
            Self::LockManagerUnavailable { .. } => "LockManagerUnavailable",
            Self::Codec { .. } => "Codec",
            Self::Io(_) => "Io",
            Self::Internal { .. } => "Internal",
        }
    }
}

/// Result type using CoherenceError.
pub type CoherenceResult<T> = Result<T, CoherenceError>;
