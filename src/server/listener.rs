//! TCP listener for client connections.
//!
//! Every connection must open with a handshake frame. The connection task
//! then reads frames and hands them to the [`StageRouter`]; a writer task
//! drains the connection's reply channel. The connection closes when the
//! peer disconnects, when the service drops its route (goodbye or a fatal
//! error) or on shutdown.

use super::service::SessionOpen;
use super::stages::StageRouter;
use crate::core::config::ServerConfig;
use crate::core::error::{CoherenceError, CoherenceResult};
use crate::protocol::codec::{read_frame, write_frame, ServerCodec};
use crate::protocol::messages::{ClientMessage, ServerMessage};
use bytes::BytesMut;
use parking_lot::RwLock;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::{TcpListener as TokioTcpListener, TcpStream};
use tokio::sync::{mpsc, watch};

/// Listener configuration.
#[derive(Debug, Clone)]
pub struct ListenerConfig {
    /// Bind address.
    pub bind_addr: SocketAddr,

    /// Maximum concurrent connections.
    pub max_connections: usize,

    /// Initial read buffer size.
    pub read_buffer_size: usize,

    /// TCP nodelay (disable Nagle's algorithm).
    pub nodelay: bool,
}

impl ListenerConfig {
    /// Listener settings from the `[server]` section.
    pub fn from_server(server: &ServerConfig) -> CoherenceResult<Self> {
        let bind_addr = server.bind.parse().map_err(|e| {
            CoherenceError::internal(format!("invalid bind address {}: {}", server.bind, e))
        })?;
        Ok(Self {
            bind_addr,
            max_connections: server.max_connections,
            ..Self::default()
        })
    }
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 9510)),
            max_connections: 10_000,
            read_buffer_size: 64 * 1024,
            nodelay: true,
        }
    }
}

/// Listener state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerState {
    /// Not yet started.
    Created,
    /// Binding to address.
    Binding,
    /// Accepting connections.
    Listening,
    /// Shutting down.
    ShuttingDown,
    /// Stopped.
    Stopped,
}

/// Connection identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(pub u64);

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Listener counters.
#[derive(Debug, Default)]
pub struct ListenerMetrics {
    /// Total connections accepted.
    pub connections_total: AtomicU64,

    /// Currently active connections.
    pub connections_active: AtomicU64,

    /// Connections refused at capacity.
    pub connections_rejected: AtomicU64,

    /// Frames read from clients.
    pub frames_received: AtomicU64,

    /// Frames written to clients.
    pub frames_sent: AtomicU64,
}

impl ListenerMetrics {
    /// Record a new connection.
    pub fn connection_accepted(&self) {
        self.connections_total.fetch_add(1, Ordering::Relaxed);
        self.connections_active.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a connection closed.
    pub fn connection_closed(&self) {
        self.connections_active.fetch_sub(1, Ordering::Relaxed);
    }

    /// Record a refused connection.
    pub fn connection_rejected(&self) {
        self.connections_rejected.fetch_add(1, Ordering::Relaxed);
    }

    /// Get active connection count.
    pub fn active_connections(&self) -> u64 {
        self.connections_active.load(Ordering::Relaxed)
    }
}

/// Accepts client connections and drives them.
pub struct CoherenceListener {
    config: ListenerConfig,
    state: RwLock<ListenerState>,
    next_conn_id: AtomicU64,
    shutting_down: AtomicBool,
    shutdown_rx: watch::Receiver<bool>,
    metrics: Arc<ListenerMetrics>,
}

impl CoherenceListener {
    /// Create a listener; it stops accepting when `shutdown_rx` changes.
    pub fn new(config: ListenerConfig, shutdown_rx: watch::Receiver<bool>) -> Self {
        Self {
            config,
            state: RwLock::new(ListenerState::Created),
            next_conn_id: AtomicU64::new(1),
            shutting_down: AtomicBool::new(false),
            shutdown_rx,
            metrics: Arc::new(ListenerMetrics::default()),
        }
    }

    /// Get the configuration.
    pub fn config(&self) -> &ListenerConfig {
        &self.config
    }

    /// Get the current state.
    pub fn state(&self) -> ListenerState {
        *self.state.read()
    }

    /// Get metrics.
    pub fn metrics(&self) -> &Arc<ListenerMetrics> {
        &self.metrics
    }

    /// Check if at connection capacity.
    pub fn at_capacity(&self) -> bool {
        self.metrics.active_connections() >= self.config.max_connections as u64
    }

    fn next_connection_id(&self) -> ConnectionId {
        ConnectionId(self.next_conn_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Bind and start listening.
    pub async fn bind(&self) -> CoherenceResult<TokioTcpListener> {
        *self.state.write() = ListenerState::Binding;
        let listener = TokioTcpListener::bind(self.config.bind_addr)
            .await
            .map_err(|e| {
                CoherenceError::internal(format!(
                    "failed to bind to {}: {}",
                    self.config.bind_addr, e
                ))
            })?;
        *self.state.write() = ListenerState::Listening;
        Ok(listener)
    }

    /// Accept one connection. `None` once shutdown was signalled.
    pub async fn accept(
        &self,
        listener: &TokioTcpListener,
    ) -> CoherenceResult<Option<(ConnectionId, TcpStream, SocketAddr)>> {
        if self.shutting_down.load(Ordering::Relaxed) {
            return Ok(None);
        }
        let mut shutdown_rx = self.shutdown_rx.clone();
        tokio::select! {
            result = listener.accept() => {
                let (stream, addr) = result
                    .map_err(|e| CoherenceError::internal(format!("accept failed: {}", e)))?;
                if self.config.nodelay {
                    let _ = stream.set_nodelay(true);
                }
                Ok(Some((self.next_connection_id(), stream, addr)))
            }
            _ = shutdown_rx.changed() => Ok(None),
        }
    }

    /// Accept connections until shutdown, spawning a task per connection.
    pub async fn serve(self: Arc<Self>, listener: TokioTcpListener, router: Arc<StageRouter>) {
        tracing::info!(addr = %self.config.bind_addr, "listening for clients");
        loop {
            match self.accept(&listener).await {
                Ok(Some((id, stream, addr))) => {
                    if self.at_capacity() {
                        self.metrics.connection_rejected();
                        tracing::warn!(%id, %addr, "connection limit reached; refusing");
                        continue;
                    }
                    self.metrics.connection_accepted();
                    let this = self.clone();
                    let router = router.clone();
                    tokio::spawn(async move {
                        if let Err(e) = this.drive(id, stream, &router).await {
                            tracing::debug!(%id, %addr, error = %e, "connection ended with error");
                        }
                        this.metrics.connection_closed();
                    });
                }
                Ok(None) => break,
                Err(e) => tracing::warn!(error = %e, "accept failed"),
            }
        }
        self.shutdown();
        self.stopped();
    }

    async fn drive(
        &self,
        id: ConnectionId,
        stream: TcpStream,
        router: &StageRouter,
    ) -> CoherenceResult<()> {
        let (mut reader, writer) = stream.into_split();
        let codec = ServerCodec::new();
        let mut buffer = BytesMut::with_capacity(self.config.read_buffer_size);

        let (tx, rx) = mpsc::unbounded_channel();
        let mut writer_task = tokio::spawn(write_loop(writer, rx, self.metrics.clone()));

        let request = match read_frame(&codec, &mut reader, &mut buffer).await? {
            Some(ClientMessage::Handshake(request)) => request,
            Some(other) => {
                let _ = tx.send(ServerMessage::Error {
                    message: format!("expected handshake, got {}", other.name()),
                    fatal: true,
                });
                drop(tx);
                let _ = writer_task.await;
                return Ok(());
            }
            None => return Ok(()),
        };
        self.metrics.frames_received.fetch_add(1, Ordering::Relaxed);
        let node = request.node;
        tracing::debug!(%id, node = %node, "handshake received");

        // The outbox keeps its own sender; the connection ends with the route.
        let open = router.open(id, request, tx).await?;
        if open == SessionOpen::Rejected {
            let _ = writer_task.await;
            return Ok(());
        }

        let mut shutdown_rx = self.shutdown_rx.clone();
        loop {
            tokio::select! {
                frame = read_frame(&codec, &mut reader, &mut buffer) => {
                    match frame {
                        Ok(Some(message)) => {
                            self.metrics.frames_received.fetch_add(1, Ordering::Relaxed);
                            let goodbye = matches!(message, ClientMessage::Goodbye);
                            router.dispatch(node, message).await?;
                            if goodbye {
                                break;
                            }
                        }
                        Ok(None) => break,
                        Err(e) => {
                            tracing::warn!(%id, node = %node, error = %e, "dropping connection");
                            break;
                        }
                    }
                }
                _ = &mut writer_task => {
                    tracing::debug!(%id, node = %node, "route closed by server");
                    break;
                }
                _ = shutdown_rx.changed() => break,
            }
        }
        router.closed(node, id).await
    }

    /// Signal shutdown.
    pub fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::Relaxed);
        *self.state.write() = ListenerState::ShuttingDown;
    }

    /// Mark as stopped.
    pub fn stopped(&self) {
        *self.state.write() = ListenerState::Stopped;
    }
}

async fn write_loop(
    mut writer: tokio::net::tcp::OwnedWriteHalf,
    mut rx: mpsc::UnboundedReceiver<ServerMessage>,
    metrics: Arc<ListenerMetrics>,
) {
    let codec = ServerCodec::new();
    while let Some(message) = rx.recv().await {
        if let Err(e) = write_frame(&codec, &mut writer, &message).await {
            tracing::debug!(error = %e, "write failed; closing writer");
            break;
        }
        metrics.frames_sent.fetch_add(1, Ordering::Relaxed);
    }
}
