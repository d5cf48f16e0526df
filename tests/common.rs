//! Common test utilities.
//!
//! Shared helpers for integration tests. Import with `mod common;`.

#![allow(dead_code)]

use coherence::client::session::{ChannelOutbound, ClientSession, SessionConfig, SessionEvent};
use coherence::core::config::Config;
use coherence::core::context::NodeContext;
use coherence::core::runtime::Runtime;
use coherence::core::time::ManualClock;
use coherence::locks::manager::{CollectingSink, LockManager};
use coherence::locks::timer::ManualTimerScheduler;
use coherence::model::lock::{LockId, Requester, ThreadId};
use coherence::model::node::NodeId;
use coherence::protocol::messages::{
    ClientMessage, HandshakeRequest, LockMode, LockRequest, ServerMessage,
};
use coherence::sequence::SequenceAuthority;
use coherence::server::listener::ConnectionId;
use coherence::server::service::{CoherenceService, ReplySender, SessionOpen};
use coherence::txn::RecordingApplier;
use coherence::model::lock::LockLevel;
use std::io::Write;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tempfile::NamedTempFile;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Requester `thread` on client `client`.
pub fn req(client: u64, thread: u64) -> Requester {
    Requester::new(NodeId::client(client), ThreadId(thread))
}

/// Lock manager driven by a manual clock and timer scheduler.
pub fn manual_manager() -> (LockManager, Arc<CollectingSink>, Arc<ManualTimerScheduler>) {
    let (ctx, _) = NodeContext::manual("test");
    let sink = Arc::new(CollectingSink::new());
    let timers = Arc::new(ManualTimerScheduler::new());
    (LockManager::new(ctx, timers.clone(), sink.clone()), sink, timers)
}

/// Write `content` to a temporary config file.
pub fn config_file(content: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().expect("Failed to create temp file");
    file.write_all(content.as_bytes())
        .expect("Failed to write config");
    file
}

/// Minimal server config bound to an ephemeral local port.
pub fn local_config(name: &str) -> Config {
    let mut config = Config::for_node(name);
    config.server.bind = "127.0.0.1:0".to_string();
    config
}

/// In-process service on a manual clock, with a recording applier.
pub struct TestService {
    pub service: CoherenceService,
    pub clock: Arc<ManualClock>,
    pub timers: Arc<ManualTimerScheduler>,
    pub applier: Arc<RecordingApplier>,
}

impl TestService {
    pub fn new(reconnect_window_ms: u64) -> Self {
        Self::build(reconnect_window_ms, None)
    }

    pub fn starting(reconnect_window_ms: u64, expected: Vec<NodeId>) -> Self {
        Self::build(reconnect_window_ms, Some(expected))
    }

    fn build(reconnect_window_ms: u64, expected: Option<Vec<NodeId>>) -> Self {
        let (ctx, clock) = NodeContext::manual("server");
        let mut config = Config::for_node("server");
        config.server.reconnect_window_ms = reconnect_window_ms;
        let authority = Arc::new(
            SequenceAuthority::in_memory(ctx.clone(), 1).expect("in-memory authority"),
        );
        let timers = Arc::new(ManualTimerScheduler::new());
        let applier = Arc::new(RecordingApplier::new());
        let service = CoherenceService::build(
            ctx,
            &config,
            authority,
            timers.clone(),
            applier.clone(),
            expected,
        );
        Self {
            service,
            clock,
            timers,
            applier,
        }
    }

    /// Fire every manual timer due within `ms`.
    pub fn advance(&self, ms: u64) {
        self.clock.advance(ms);
        for key in self.timers.advance(ms) {
            self.service.locks().timer_fired(&key);
        }
    }
}

/// One simulated client connection against a [`TestService`].
pub struct Peer {
    pub node: NodeId,
    pub connection: ConnectionId,
    pub tx: ReplySender,
    pub rx: mpsc::UnboundedReceiver<ServerMessage>,
}

impl Peer {
    pub fn new(id: u64, connection: u64) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            node: NodeId::client(id),
            connection: ConnectionId(connection),
            tx,
            rx,
        }
    }

    /// A fresh connection for the same node.
    pub fn reconnect(&self, connection: u64) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            node: self.node,
            connection: ConnectionId(connection),
            tx,
            rx,
        }
    }

    pub fn hello(&self) -> HandshakeRequest {
        HandshakeRequest {
            node: self.node,
            protocol_version: coherence::PROTOCOL_VERSION.to_string(),
            ..HandshakeRequest::default()
        }
    }

    pub fn open(&self, svc: &CoherenceService, request: HandshakeRequest) -> SessionOpen {
        svc.open_session(self.connection, request, &self.tx)
    }

    pub fn drain(&mut self) -> Vec<ServerMessage> {
        let mut out = Vec::new();
        while let Ok(m) = self.rx.try_recv() {
            out.push(m);
        }
        out
    }

    pub fn lock(&self, name: &str, thread: u64, level: LockLevel, mode: LockMode) -> ClientMessage {
        ClientMessage::Lock(LockRequest {
            lock_id: LockId::from(name),
            node: self.node,
            thread: ThreadId(thread),
            level,
            mode,
            timer: None,
        })
    }
}

/// Whether `messages` contains a grant of `name`.
pub fn granted(messages: &[ServerMessage], name: &str) -> bool {
    messages.iter().any(|m| {
        matches!(m, ServerMessage::Lock(r) if r.granted && r.lock_id.as_str() == name)
    })
}

/// Start a runtime on an ephemeral port.
pub async fn start_server(config: Config) -> Runtime {
    let mut runtime = Runtime::new(config).expect("runtime");
    runtime.start().await.expect("start");
    runtime
}

/// A client session driven over TCP.
pub struct TcpClient {
    pub session: Arc<ClientSession>,
    pub events: mpsc::UnboundedReceiver<SessionEvent>,
    pub driver: JoinHandle<()>,
}

impl TcpClient {
    pub async fn connect(addr: SocketAddr, id: u64) -> Self {
        let (outbound, rx) = ChannelOutbound::new();
        let config = SessionConfig::from_sequence(
            NodeId::client(id),
            &Config::for_node("client").sequence,
        );
        let (session, events) = ClientSession::new(config, Arc::new(outbound));
        let session = Arc::new(session);
        let driver_session = session.clone();
        let driver = tokio::spawn(async move {
            let _ = coherence::client::connection::connect(addr, driver_session, rx).await;
        });
        let client = Self {
            session,
            events,
            driver,
        };
        tokio::time::timeout(Duration::from_secs(5), client.session.handshake().wait_connected())
            .await
            .expect("handshake timed out")
            .expect("handshake failed");
        client
    }

    /// Next session event, failing the test after a few seconds.
    pub async fn next_event(&mut self) -> SessionEvent {
        tokio::time::timeout(Duration::from_secs(5), self.events.recv())
            .await
            .expect("no session event")
            .expect("session dropped")
    }
}
