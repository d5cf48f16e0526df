//! Stage router.
//!
//! Client messages are routed to one of three stages: handshake, lock or
//! transaction. Each stage has a fixed pool of workers; a node is pinned to
//! one worker per stage by hashing its id, so its messages are processed in
//! arrival order within the stage.
//!
//! Two cross-stage rules are enforced here:
//!
//! - Handshake barrier: steady-state messages from a node whose ack is held
//!   back (server starting) are parked and released, in order, once the node
//!   becomes connected.
//! - Release fence: a release or wait is processed only after every
//!   transaction batch the node sent before it has been applied, so a commit
//!   is never checked against a lock its sender already gave up.

use super::listener::ConnectionId;
use super::service::{CoherenceService, ReplySender, SessionOpen};
use crate::core::config::StagesConfig;
use crate::core::error::{CoherenceError, CoherenceResult};
use crate::handshake::server::ConnectionState;
use crate::model::node::NodeId;
use crate::ops::metrics::names;
use crate::protocol::messages::{ClientMessage, HandshakeRequest, LockMode};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use twox_hash::XxHash64;

/// Stage a message is processed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StageKind {
    /// Session open, goodbye and connection loss.
    Handshake,
    /// Lock operations.
    Lock,
    /// Transactions, id batches and reference updates.
    Transaction,
}

impl StageKind {
    /// Stage for a steady-state message.
    pub fn for_message(message: &ClientMessage) -> Self {
        match message {
            ClientMessage::Handshake(_) | ClientMessage::Goodbye => Self::Handshake,
            ClientMessage::Lock(_) => Self::Lock,
            ClientMessage::Batch(_)
            | ClientMessage::Transactions(_)
            | ClientMessage::AddReferences(_)
            | ClientMessage::RemoveReferences(_) => Self::Transaction,
        }
    }

    fn as_str(&self) -> &'static str {
        match self {
            Self::Handshake => "handshake",
            Self::Lock => "lock",
            Self::Transaction => "transaction",
        }
    }
}

enum Job {
    Open {
        connection: ConnectionId,
        request: HandshakeRequest,
        reply: ReplySender,
        opened: oneshot::Sender<SessionOpen>,
    },
    Closed {
        node: NodeId,
        connection: ConnectionId,
    },
    Message {
        node: NodeId,
        message: ClientMessage,
        progress: Option<Progress>,
    },
}

// Progress travels with the job, so forgetting a node never strands a
// fenced release waiting on a counter nobody will bump.
enum Progress {
    Fence(Arc<NodeProgress>, u64),
    Batch(Arc<NodeProgress>),
}

#[derive(Debug)]
struct NodeProgress {
    txn_sent: AtomicU64,
    txn_done: watch::Sender<u64>,
}

impl NodeProgress {
    fn new() -> Self {
        let (txn_done, _) = watch::channel(0);
        Self {
            txn_sent: AtomicU64::new(0),
            txn_done,
        }
    }
}

struct Stage {
    kind: StageKind,
    workers: Vec<mpsc::Sender<Job>>,
}

impl Stage {
    async fn dispatch(&self, node: NodeId, job: Job) -> CoherenceResult<()> {
        let index = worker_index(node, self.workers.len());
        self.workers[index]
            .send(job)
            .await
            .map_err(|_| CoherenceError::internal(format!("{} stage stopped", self.kind.as_str())))
    }
}

struct Shared {
    service: Arc<CoherenceService>,
    handshake: Stage,
    lock: Stage,
    transaction: Stage,
    held: Mutex<HashMap<NodeId, Vec<ClientMessage>>>,
    progress: RwLock<HashMap<NodeId, Arc<NodeProgress>>>,
}

/// Routes client messages to ordered stage workers.
pub struct StageRouter {
    shared: Arc<Shared>,
    tasks: parking_lot::Mutex<Vec<JoinHandle<()>>>,
}

impl StageRouter {
    /// Spawn the stage workers. They run until `shutdown` flips to true.
    pub fn start(
        service: Arc<CoherenceService>,
        config: &StagesConfig,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let depth = config.queue_depth.max(1);
        let (handshake, handshake_rx) =
            build_stage(StageKind::Handshake, config.handshake_workers, depth);
        let (lock, lock_rx) = build_stage(StageKind::Lock, config.lock_workers, depth);
        let (transaction, transaction_rx) =
            build_stage(StageKind::Transaction, config.txn_workers, depth);

        let shared = Arc::new(Shared {
            service,
            handshake,
            lock,
            transaction,
            held: Mutex::new(HashMap::new()),
            progress: RwLock::new(HashMap::new()),
        });

        let mut tasks = Vec::new();
        for (kind, receivers) in [
            (StageKind::Handshake, handshake_rx),
            (StageKind::Lock, lock_rx),
            (StageKind::Transaction, transaction_rx),
        ] {
            for (index, rx) in receivers.into_iter().enumerate() {
                let shared = shared.clone();
                let shutdown = shutdown.clone();
                tasks.push(tokio::spawn(async move {
                    run_worker(shared, kind, index, rx, shutdown).await;
                }));
            }
        }
        tracing::info!(
            handshake = config.handshake_workers,
            lock = config.lock_workers,
            transaction = config.txn_workers,
            "stage workers started"
        );
        Self {
            shared,
            tasks: parking_lot::Mutex::new(tasks),
        }
    }

    /// The service messages are processed by.
    pub fn service(&self) -> &Arc<CoherenceService> {
        &self.shared.service
    }

    /// Open a session on `connection`. Resolves once the handshake was
    /// processed.
    pub async fn open(
        &self,
        connection: ConnectionId,
        request: HandshakeRequest,
        reply: ReplySender,
    ) -> CoherenceResult<SessionOpen> {
        let node = request.node;
        let (opened, rx) = oneshot::channel();
        self.shared
            .handshake
            .dispatch(
                node,
                Job::Open {
                    connection,
                    request,
                    reply,
                    opened,
                },
            )
            .await?;
        rx.await
            .map_err(|_| CoherenceError::internal("handshake stage dropped the session"))
    }

    /// Route one steady-state message from `node`.
    pub async fn dispatch(&self, node: NodeId, message: ClientMessage) -> CoherenceResult<()> {
        self.shared.dispatch(node, message).await
    }

    /// The connection that carried `node` closed.
    pub async fn closed(&self, node: NodeId, connection: ConnectionId) -> CoherenceResult<()> {
        self.shared
            .handshake
            .dispatch(node, Job::Closed { node, connection })
            .await
    }

    /// Expire reconnect windows, releasing held traffic if the server
    /// finished starting as a result.
    pub async fn expire_windows(&self) {
        let nodes = self.shared.service.expire_windows();
        self.shared.forget_departed();
        self.shared.started(nodes).await;
    }

    /// Nodes whose transaction progress is tracked for release fences.
    pub fn tracked_nodes(&self) -> Vec<NodeId> {
        let mut nodes: Vec<NodeId> = self.shared.progress.read().keys().copied().collect();
        nodes.sort();
        nodes
    }

    /// Leave the starting phase now.
    pub async fn start_now(&self) -> CoherenceResult<()> {
        let nodes = self.shared.service.start()?;
        self.shared.started(nodes).await;
        Ok(())
    }

    /// Wait for every worker to exit after shutdown was signalled.
    pub async fn join(&self) {
        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "stage worker panicked");
            }
        }
    }
}

impl Shared {
    async fn dispatch(&self, node: NodeId, message: ClientMessage) -> CoherenceResult<()> {
        let mut held = self.held.lock().await;
        if let Some(parked) = held.get_mut(&node) {
            self.service.context().metrics().counter_inc(names::STAGE_HELD);
            tracing::trace!(
                node = %node,
                message = message.name(),
                "held until handshake completes"
            );
            parked.push(message);
            return Ok(());
        }
        drop(held);
        self.route(node, message).await
    }

    async fn route(&self, node: NodeId, message: ClientMessage) -> CoherenceResult<()> {
        let kind = StageKind::for_message(&message);
        let progress = match &message {
            ClientMessage::Lock(request)
                if matches!(request.mode, LockMode::Release | LockMode::Wait) =>
            {
                let progress = self.progress(node);
                let sent = progress.txn_sent.load(Ordering::Acquire);
                Some(Progress::Fence(progress, sent))
            }
            ClientMessage::Transactions(_) => {
                let progress = self.progress(node);
                progress.txn_sent.fetch_add(1, Ordering::AcqRel);
                Some(Progress::Batch(progress))
            }
            _ => None,
        };
        self.service
            .context()
            .metrics()
            .counter_inc(names::STAGE_DISPATCHED);
        let job = Job::Message {
            node,
            message,
            progress,
        };
        match kind {
            StageKind::Handshake => self.handshake.dispatch(node, job).await,
            StageKind::Lock => self.lock.dispatch(node, job).await,
            StageKind::Transaction => self.transaction.dispatch(node, job).await,
        }
    }

    /// Release parked messages, in order, for nodes that became connected.
    async fn release_held(&self, nodes: &[NodeId]) {
        let mut held = self.held.lock().await;
        for node in nodes {
            let Some(parked) = held.remove(node) else {
                continue;
            };
            tracing::debug!(node = %node, count = parked.len(), "releasing held messages");
            for message in parked {
                if let Err(e) = self.route(*node, message).await {
                    tracing::warn!(node = %node, error = %e, "failed to release held message");
                }
            }
        }
    }

    fn progress(&self, node: NodeId) -> Arc<NodeProgress> {
        if let Some(progress) = self.progress.read().get(&node) {
            return progress.clone();
        }
        self.progress
            .write()
            .entry(node)
            .or_insert_with(|| Arc::new(NodeProgress::new()))
            .clone()
    }

    /// Drop progress for nodes the service no longer knows.
    fn forget_departed(&self) {
        let handshake = self.service.handshake();
        self.progress
            .write()
            .retain(|node, _| handshake.connection_state(*node) != ConnectionState::Disconnected);
    }

    async fn process(&self, job: Job) {
        match job {
            Job::Open {
                connection,
                request,
                reply,
                opened,
            } => {
                let node = request.node;
                // Park before the deferred session becomes visible to the reader.
                let mut held = self.held.lock().await;
                let outcome = self.service.open_session(connection, request, &reply);
                if outcome == SessionOpen::Deferred {
                    held.entry(node).or_default();
                }
                drop(held);
                if let SessionOpen::Connected(nodes) = &outcome {
                    self.release_held(nodes).await;
                }
                if opened.send(outcome).is_err() {
                    tracing::debug!(
                        node = %node,
                        %connection,
                        "connection gone before open completed"
                    );
                }
            }
            Job::Closed { node, connection } => {
                if self.service.connection_closed(node, connection) {
                    self.held.lock().await.remove(&node);
                    tracing::info!(node = %node, %connection, "connection lost; node paused");
                }
            }
            Job::Message {
                node,
                message,
                progress,
            } => {
                if let Some(Progress::Fence(progress, required)) = &progress {
                    await_transactions(node, progress, *required).await;
                }
                let goodbye = matches!(message, ClientMessage::Goodbye);
                let mut departed = goodbye;
                if let Err(e) = self.service.handle(node, message) {
                    departed |= e.is_fatal();
                    self.service.report_error(node, &e);
                }
                if let Some(Progress::Batch(progress)) = &progress {
                    progress.txn_done.send_modify(|done| *done += 1);
                }
                if goodbye {
                    self.held.lock().await.remove(&node);
                }
                if departed {
                    self.forget_departed();
                }
            }
        }
    }

    /// Nodes that became connected because the server finished starting.
    async fn started(&self, nodes: Vec<NodeId>) {
        if !nodes.is_empty() {
            self.release_held(&nodes).await;
        }
    }
}

async fn await_transactions(node: NodeId, progress: &NodeProgress, required: u64) {
    let mut rx = progress.txn_done.subscribe();
    if rx.wait_for(|done| *done >= required).await.is_err() {
        tracing::debug!(node = %node, "transaction progress dropped while fenced");
    }
}

fn build_stage(kind: StageKind, workers: usize, depth: usize) -> (Stage, Vec<mpsc::Receiver<Job>>) {
    let workers = workers.max(1);
    let mut senders = Vec::with_capacity(workers);
    let mut receivers = Vec::with_capacity(workers);
    for _ in 0..workers {
        let (tx, rx) = mpsc::channel(depth);
        senders.push(tx);
        receivers.push(rx);
    }
    (
        Stage {
            kind,
            workers: senders,
        },
        receivers,
    )
}

async fn run_worker(
    shared: Arc<Shared>,
    kind: StageKind,
    index: usize,
    mut rx: mpsc::Receiver<Job>,
    mut shutdown: watch::Receiver<bool>,
) {
    tracing::trace!(stage = kind.as_str(), worker = index, "stage worker running");
    loop {
        tokio::select! {
            job = rx.recv() => {
                match job {
                    Some(job) => shared.process(job).await,
                    None => break,
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
    tracing::trace!(stage = kind.as_str(), worker = index, "stage worker stopped");
}

/// Worker a node is pinned to in a pool of `workers`.
pub fn worker_index(node: NodeId, workers: usize) -> usize {
    let mut hasher = XxHash64::with_seed(0);
    node.hash(&mut hasher);
    (hasher.finish() % workers.max(1) as u64) as usize
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::Config;
    use crate::core::context::NodeContext;
    use crate::locks::timer::ManualTimerScheduler;
    use crate::model::lock::{LockId, LockLevel, ThreadId};
    use crate::model::object::ChangeSet;
    use crate::model::txn::{ClientTransaction, TransactionId};
    use crate::protocol::messages::{LockRequest, ServerMessage, TransactionBatch};
    use crate::sequence::SequenceAuthority;
    use crate::txn::RecordingApplier;
    use std::time::Duration;

    fn router(expected: Option<Vec<NodeId>>) -> (StageRouter, watch::Sender<bool>) {
        let (ctx, _) = NodeContext::manual("server");
        let authority = Arc::new(SequenceAuthority::in_memory(ctx.clone(), 1).unwrap());
        let service = Arc::new(CoherenceService::build(
            ctx,
            &Config::for_node("server"),
            authority,
            Arc::new(ManualTimerScheduler::new()),
            Arc::new(RecordingApplier::new()),
            expected,
        ));
        let (tx, rx) = watch::channel(false);
        (StageRouter::start(service, &StagesConfig::default(), rx), tx)
    }

    fn hello(node: NodeId) -> HandshakeRequest {
        HandshakeRequest {
            node,
            protocol_version: crate::PROTOCOL_VERSION.to_string(),
            ..HandshakeRequest::default()
        }
    }

    fn acquire(node: NodeId) -> ClientMessage {
        ClientMessage::Lock(LockRequest {
            lock_id: LockId::from("L"),
            node,
            thread: ThreadId(1),
            level: LockLevel::Write,
            mode: LockMode::Acquire,
            timer: None,
        })
    }

    fn commit() -> ClientMessage {
        let txn = ClientTransaction::new(TransactionId(1), ThreadId(1), ChangeSet::default())
            .with_lock(LockId::from("L"));
        ClientMessage::Transactions(TransactionBatch {
            transactions: vec![txn],
        })
    }

    async fn tracked_until(router: &StageRouter, expected: Vec<NodeId>) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while router.tracked_nodes() != expected {
            let tracked = router.tracked_nodes();
            assert!(tokio::time::Instant::now() < deadline, "still tracking {:?}", tracked);
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    async fn next(rx: &mut mpsc::UnboundedReceiver<ServerMessage>) -> ServerMessage {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out")
            .expect("channel closed")
    }

    #[test]
    fn test_worker_index_is_stable() {
        let node = NodeId::client(42);
        assert_eq!(worker_index(node, 4), worker_index(node, 4));
        assert!(worker_index(node, 4) < 4);
        assert_eq!(worker_index(node, 1), 0);
    }

    #[tokio::test]
    async fn test_open_then_lock() {
        let (router, shutdown) = router(None);
        let node = NodeId::client(1);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let open = router.open(ConnectionId(1), hello(node), tx).await.unwrap();
        assert_eq!(open, SessionOpen::Connected(vec![node]));
        assert!(matches!(next(&mut rx).await, ServerMessage::HandshakeAck(ack) if ack.accepted));

        router.dispatch(node, acquire(node)).await.unwrap();
        assert!(matches!(next(&mut rx).await, ServerMessage::Lock(r) if r.granted));

        shutdown.send_replace(true);
        router.join().await;
    }

    #[tokio::test]
    async fn test_traffic_held_until_start() {
        let (router, shutdown) = router(Some(vec![NodeId::client(1), NodeId::client(2)]));
        let node = NodeId::client(1);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let open = router.open(ConnectionId(1), hello(node), tx).await.unwrap();
        assert_eq!(open, SessionOpen::Deferred);

        router.dispatch(node, acquire(node)).await.unwrap();
        assert!(rx.try_recv().is_err());
        assert_eq!(
            router.service().context().metrics().counter_get(names::STAGE_HELD),
            1
        );

        router.start_now().await.unwrap();
        assert!(matches!(next(&mut rx).await, ServerMessage::HandshakeAck(ack) if ack.accepted));
        assert!(matches!(next(&mut rx).await, ServerMessage::Lock(r) if r.granted));

        shutdown.send_replace(true);
        router.join().await;
    }

    #[tokio::test]
    async fn test_departed_nodes_are_forgotten() {
        let (router, shutdown) = router(None);
        let (a, b) = (NodeId::client(1), NodeId::client(2));
        let (tx_a, mut rx_a) = mpsc::unbounded_channel();
        let (tx_b, mut rx_b) = mpsc::unbounded_channel();
        router.open(ConnectionId(1), hello(a), tx_a).await.unwrap();
        router.open(ConnectionId(2), hello(b), tx_b).await.unwrap();
        next(&mut rx_a).await;
        next(&mut rx_b).await;

        router.dispatch(a, acquire(a)).await.unwrap();
        assert!(matches!(next(&mut rx_a).await, ServerMessage::Lock(r) if r.granted));
        router.dispatch(a, commit()).await.unwrap();
        assert!(matches!(next(&mut rx_a).await, ServerMessage::TransactionAck(_)));
        // Not holding the lock is fatal.
        router.dispatch(b, commit()).await.unwrap();
        assert!(matches!(
            next(&mut rx_b).await,
            ServerMessage::Error { fatal: true, .. }
        ));
        tracked_until(&router, vec![a]).await;

        router.dispatch(a, ClientMessage::Goodbye).await.unwrap();
        tracked_until(&router, Vec::new()).await;

        shutdown.send_replace(true);
        router.join().await;
    }
}
