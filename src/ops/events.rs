//! Operator event log.
//!
//! Events an operator should see without reading debug logs: detected
//! deadlocks, handshake rejections, reconnect-window expiries, node
//! join/leave, lock recalls and server lifecycle changes. Events are kept in
//! a bounded in-memory ring and mirrored to `tracing`.

use crate::core::time::Tick;
use crate::model::node::NodeId;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

/// Operator event type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    /// A cycle was found in the wait-for graph.
    DeadlockDetected,
    /// A handshake was refused.
    HandshakeRejected,
    /// A handshake completed.
    HandshakeCompleted,
    /// A node connected for the first time.
    NodeJoined,
    /// A node left (shutdown or window expiry).
    NodeLeft,
    /// A connection dropped and entered its reconnect window.
    NodePaused,
    /// A paused node did not return in time.
    ReconnectWindowExpired,
    /// Holders of a lock were asked to relinquish it.
    LockRecalled,
    /// A cluster membership transition was received.
    ClusterMembership,
    /// The server finished starting.
    ServerStarted,
    /// The server is stopping.
    ServerStopping,
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::DeadlockDetected => write!(f, "lock.deadlock"),
            Self::HandshakeRejected => write!(f, "handshake.rejected"),
            Self::HandshakeCompleted => write!(f, "handshake.completed"),
            Self::NodeJoined => write!(f, "node.joined"),
            Self::NodeLeft => write!(f, "node.left"),
            Self::NodePaused => write!(f, "node.paused"),
            Self::ReconnectWindowExpired => write!(f, "node.window_expired"),
            Self::LockRecalled => write!(f, "lock.recalled"),
            Self::ClusterMembership => write!(f, "cluster.membership"),
            Self::ServerStarted => write!(f, "server.started"),
            Self::ServerStopping => write!(f, "server.stopping"),
        }
    }
}

/// Event severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Severity {
    /// Informational.
    Info,
    /// Needs attention.
    Warning,
    /// Something failed.
    Error,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Info => write!(f, "info"),
            Self::Warning => write!(f, "warning"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// One operator event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperatorEvent {
    /// Sequence number assigned by the log.
    pub event_id: u64,
    /// Event type.
    pub kind: EventKind,
    /// Severity.
    pub severity: Severity,
    /// When the event was recorded.
    pub at: Tick,
    /// Name of the recording server.
    pub source: String,
    /// Node the event concerns.
    pub node: Option<NodeId>,
    /// Human readable message.
    pub message: String,
}

impl OperatorEvent {
    /// Create an event with the kind's default severity.
    pub fn new(kind: EventKind, message: impl Into<String>) -> Self {
        Self {
            event_id: 0,
            kind,
            severity: Self::default_severity(kind),
            at: Tick::zero(),
            source: String::new(),
            node: None,
            message: message.into(),
        }
    }

    fn default_severity(kind: EventKind) -> Severity {
        match kind {
            EventKind::DeadlockDetected
            | EventKind::HandshakeRejected
            | EventKind::ReconnectWindowExpired => Severity::Warning,
            _ => Severity::Info,
        }
    }

    /// Attach the node the event concerns.
    pub fn with_node(mut self, node: NodeId) -> Self {
        self.node = Some(node);
        self
    }

    /// Override the severity.
    pub fn with_severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }
}

/// Counts by severity.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SeverityCounts {
    /// Info events.
    pub info: u64,
    /// Warning events.
    pub warning: u64,
    /// Error events.
    pub error: u64,
}

/// Log statistics.
#[derive(Debug, Clone, Serialize)]
pub struct EventLogStats {
    /// Events recorded since start.
    pub total_events: u64,
    /// Events evicted from the ring.
    pub dropped_events: u64,
    /// Counts by severity.
    pub by_severity: SeverityCounts,
}

/// Bounded operator event log.
#[derive(Debug)]
pub struct OperatorEventLog {
    source: String,
    capacity: usize,
    buffer: RwLock<VecDeque<OperatorEvent>>,
    next_event_id: AtomicU64,
    total_events: AtomicU64,
    dropped_events: AtomicU64,
    counts: RwLock<SeverityCounts>,
}

impl OperatorEventLog {
    /// Create a log for the server named `source` holding at most
    /// `capacity` events.
    pub fn new(source: impl Into<String>, capacity: usize) -> Self {
        Self {
            source: source.into(),
            capacity: capacity.max(1),
            buffer: RwLock::new(VecDeque::new()),
            next_event_id: AtomicU64::new(1),
            total_events: AtomicU64::new(0),
            dropped_events: AtomicU64::new(0),
            counts: RwLock::new(SeverityCounts::default()),
        }
    }

    /// Record an event at `at`.
    pub fn record(&self, mut event: OperatorEvent, at: Tick) {
        event.event_id = self.next_event_id.fetch_add(1, Ordering::Relaxed);
        event.at = at;
        event.source = self.source.clone();

        match event.severity {
            Severity::Info => {
                tracing::info!(kind = %event.kind, node = ?event.node, "{}", event.message)
            }
            Severity::Warning => {
                tracing::warn!(kind = %event.kind, node = ?event.node, "{}", event.message)
            }
            Severity::Error => {
                tracing::error!(kind = %event.kind, node = ?event.node, "{}", event.message)
            }
        }

        self.total_events.fetch_add(1, Ordering::Relaxed);
        {
            let mut counts = self.counts.write();
            match event.severity {
                Severity::Info => counts.info += 1,
                Severity::Warning => counts.warning += 1,
                Severity::Error => counts.error += 1,
            }
        }

        let mut buffer = self.buffer.write();
        if buffer.len() >= self.capacity {
            buffer.pop_front();
            self.dropped_events.fetch_add(1, Ordering::Relaxed);
        }
        buffer.push_back(event);
    }

    /// Most recent events, newest first.
    pub fn recent(&self, count: usize) -> Vec<OperatorEvent> {
        self.buffer.read().iter().rev().take(count).cloned().collect()
    }

    /// Most recent events of one kind, newest first.
    pub fn by_kind(&self, kind: EventKind, count: usize) -> Vec<OperatorEvent> {
        self.buffer
            .read()
            .iter()
            .rev()
            .filter(|e| e.kind == kind)
            .take(count)
            .cloned()
            .collect()
    }

    /// Number of buffered events of one kind.
    pub fn count_of(&self, kind: EventKind) -> usize {
        self.buffer.read().iter().filter(|e| e.kind == kind).count()
    }

    /// Statistics.
    pub fn stats(&self) -> EventLogStats {
        EventLogStats {
            total_events: self.total_events.load(Ordering::Relaxed),
            dropped_events: self.dropped_events.load(Ordering::Relaxed),
            by_severity: self.counts.read().clone(),
        }
    }

    /// Buffered event count.
    pub fn len(&self) -> usize {
        self.buffer.read().len()
    }

    /// Check if the buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.buffer.read().is_empty()
    }

    /// Export buffered events as a JSON array.
    pub fn export_json(&self) -> String {
        let buffer = self.buffer.read();
        let events: Vec<&OperatorEvent> = buffer.iter().collect();
        serde_json::to_string_pretty(&events).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_severity() {
        let event = OperatorEvent::new(EventKind::DeadlockDetected, "cycle");
        assert_eq!(event.severity, Severity::Warning);
        let event = OperatorEvent::new(EventKind::NodeJoined, "hello");
        assert_eq!(event.severity, Severity::Info);
    }

    #[test]
    fn test_record_assigns_ids_and_source() {
        let log = OperatorEventLog::new("server-1", 10);
        log.record(
            OperatorEvent::new(EventKind::NodeJoined, "joined").with_node(NodeId::client(3)),
            Tick::new(42),
        );
        let events = log.recent(1);
        assert_eq!(events[0].event_id, 1);
        assert_eq!(events[0].source, "server-1");
        assert_eq!(events[0].at, Tick::new(42));
        assert_eq!(events[0].node, Some(NodeId::client(3)));
    }

    #[test]
    fn test_ring_drops_oldest() {
        let log = OperatorEventLog::new("s", 2);
        for i in 0..3 {
            log.record(
                OperatorEvent::new(EventKind::LockRecalled, format!("r{}", i)),
                Tick::zero(),
            );
        }
        assert_eq!(log.len(), 2);
        assert_eq!(log.stats().dropped_events, 1);
        assert_eq!(log.recent(2)[1].message, "r1");
    }

    #[test]
    fn test_by_kind_and_counts() {
        let log = OperatorEventLog::new("s", 10);
        log.record(OperatorEvent::new(EventKind::NodeJoined, "a"), Tick::zero());
        log.record(OperatorEvent::new(EventKind::DeadlockDetected, "b"), Tick::zero());
        log.record(OperatorEvent::new(EventKind::NodeJoined, "c"), Tick::zero());
        assert_eq!(log.by_kind(EventKind::NodeJoined, 10).len(), 2);
        assert_eq!(log.count_of(EventKind::DeadlockDetected), 1);
        assert_eq!(log.stats().by_severity.warning, 1);
        assert!(log.export_json().contains("DeadlockDetected"));
    }
}
