//! Main runtime orchestration.
//!
//! The runtime coordinates component lifecycle:
//! - Start order: sequence store → lock manager and service → stages → listener
//! - Shutdown order: listener → stages → lock manager
//!
//! Two maintenance loops run alongside: reconnect window expiry and the
//! periodic deadlock scan. Lock timers fire through a tokio scheduler whose
//! keys are fed back into the lock manager by a dedicated task.

use crate::core::config::Config;
use crate::core::context::NodeContext;
use crate::locks::timer::{TimerKey, TokioTimerScheduler};
use crate::model::node::NodeId;
use crate::ops::events::{EventKind, OperatorEvent};
use crate::sequence::{FileSequenceStore, MemorySequenceStore, SequenceAuthority, SequenceStore};
use crate::server::listener::{CoherenceListener, ListenerConfig};
use crate::server::service::CoherenceService;
use crate::server::stages::StageRouter;
use crate::txn::{LoggingApplier, TransactionApplier};
use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

/// Component health status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComponentHealth {
    /// Component is starting.
    Starting,
    /// Component is healthy and operational.
    Healthy,
    /// Component is waiting on peers (server starting phase).
    Degraded,
    /// Component has failed.
    Failed,
    /// Component is stopping.
    Stopping,
    /// Component has stopped.
    Stopped,
}

/// Health status aggregated from all components.
#[derive(Debug, Clone)]
pub struct RuntimeHealth {
    /// Id sequence store.
    pub sequence: ComponentHealth,
    /// Lock manager and service.
    pub service: ComponentHealth,
    /// Stage workers.
    pub stages: ComponentHealth,
    /// Client listener.
    pub listener: ComponentHealth,
}

impl Default for RuntimeHealth {
    fn default() -> Self {
        Self {
            sequence: ComponentHealth::Starting,
            service: ComponentHealth::Starting,
            stages: ComponentHealth::Starting,
            listener: ComponentHealth::Starting,
        }
    }
}

impl RuntimeHealth {
    /// Check if the runtime is ready to serve requests.
    pub fn is_ready(&self) -> bool {
        matches!(
            (self.sequence, self.service, self.stages, self.listener),
            (
                ComponentHealth::Healthy,
                ComponentHealth::Healthy | ComponentHealth::Degraded,
                ComponentHealth::Healthy,
                ComponentHealth::Healthy
            )
        )
    }

    /// Check if the runtime is alive (not failed).
    pub fn is_alive(&self) -> bool {
        let components = [self.sequence, self.service, self.stages, self.listener];
        !components.contains(&ComponentHealth::Failed)
    }
}

/// Coherence server runtime holding all component handles.
pub struct Runtime {
    /// Configuration.
    config: Arc<Config>,

    /// Events, metrics and clock.
    ctx: NodeContext,

    /// Applies accepted transactions.
    applier: Arc<dyn TransactionApplier>,

    /// Id authority.
    authority: Option<Arc<SequenceAuthority>>,

    /// Coherence service.
    service: Option<Arc<CoherenceService>>,

    /// Stage router.
    router: Option<Arc<StageRouter>>,

    /// Bound listener address.
    local_addr: Option<SocketAddr>,

    /// Runtime health status.
    health: RuntimeHealth,

    /// Whether the runtime is running.
    running: Arc<AtomicBool>,

    /// Shutdown signal sender.
    shutdown_tx: watch::Sender<bool>,

    /// Shutdown signal receiver.
    shutdown_rx: watch::Receiver<bool>,

    /// Background tasks (listener, timers, maintenance).
    tasks: Vec<JoinHandle<()>>,
}

impl Runtime {
    /// Create a new runtime with the given configuration.
    pub fn new(config: Config) -> Result<Self> {
        config.validate().context("invalid configuration")?;
        let ctx = NodeContext::system(
            config.server.node_name.clone(),
            config.telemetry.event_buffer_size,
        );
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Ok(Self {
            config: Arc::new(config),
            ctx,
            applier: Arc::new(LoggingApplier),
            authority: None,
            service: None,
            router: None,
            local_addr: None,
            health: RuntimeHealth::default(),
            running: Arc::new(AtomicBool::new(false)),
            shutdown_tx,
            shutdown_rx,
            tasks: Vec::new(),
        })
    }

    /// Use `applier` for accepted transactions. Must be called before start.
    pub fn with_applier(mut self, applier: Arc<dyn TransactionApplier>) -> Self {
        self.applier = applier;
        self
    }

    /// Get the configuration.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Events, metrics and clock.
    pub fn context(&self) -> &NodeContext {
        &self.ctx
    }

    /// The coherence service (once started).
    pub fn service(&self) -> Option<&Arc<CoherenceService>> {
        self.service.as_ref()
    }

    /// Address the listener is bound to (once started).
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Get the current health status.
    pub fn health(&self) -> &RuntimeHealth {
        &self.health
    }

    /// Check if the runtime is ready to serve requests.
    pub fn is_ready(&self) -> bool {
        self.health.is_ready()
    }

    /// Check if the runtime is alive.
    pub fn is_alive(&self) -> bool {
        self.health.is_alive()
    }

    /// Check if the runtime is running.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Get a shutdown receiver for graceful shutdown coordination.
    pub fn shutdown_receiver(&self) -> watch::Receiver<bool> {
        self.shutdown_rx.clone()
    }

    /// Initialize and start all runtime components.
    pub async fn start(&mut self) -> Result<()> {
        tracing::info!(
            node = %self.config.server.node_name,
            bind = %self.config.server.bind,
            "starting coherence server"
        );

        self.init_sequence()?;
        let timer_rx = self.init_service()?;
        self.init_stages()?;
        self.start_listener().await?;
        self.spawn_timer_loop(timer_rx)?;
        self.spawn_maintenance()?;

        self.running.store(true, Ordering::Release);
        tracing::info!("coherence server started");
        Ok(())
    }

    fn init_sequence(&mut self) -> Result<()> {
        let seq = &self.config.sequence;
        let store: Arc<dyn SequenceStore> = match seq.store.as_str() {
            "file" => Arc::new(
                FileSequenceStore::open(&seq.store_path)
                    .context("failed to open sequence store")?,
            ),
            _ => Arc::new(MemorySequenceStore::new()),
        };
        let authority =
            SequenceAuthority::open(self.ctx.clone(), seq.groups, store, seq.reserve_ahead)
                .context("failed to open sequence authority")?;
        self.authority = Some(Arc::new(authority));
        self.health.sequence = ComponentHealth::Healthy;
        tracing::info!(groups = seq.groups, store = %seq.store, "sequence authority opened");
        Ok(())
    }

    fn init_service(&mut self) -> Result<mpsc::UnboundedReceiver<TimerKey>> {
        let authority = self
            .authority
            .clone()
            .context("sequence authority not initialized")?;
        let (timers, timer_rx) = TokioTimerScheduler::new();
        let expected: Vec<NodeId> = self
            .config
            .server
            .expected_clients
            .iter()
            .map(|id| NodeId::client(*id))
            .collect();
        let expected = (!expected.is_empty()).then_some(expected);
        let starting = expected.is_some();
        let service = CoherenceService::build(
            self.ctx.clone(),
            &self.config,
            authority,
            Arc::new(timers),
            self.applier.clone(),
            expected,
        );
        self.service = Some(Arc::new(service));
        self.health.service = if starting {
            ComponentHealth::Degraded
        } else {
            ComponentHealth::Healthy
        };
        tracing::info!(starting, "coherence service initialized");
        Ok(timer_rx)
    }

    fn init_stages(&mut self) -> Result<()> {
        let service = self.service.clone().context("service not initialized")?;
        let router = StageRouter::start(service, &self.config.stages, self.shutdown_rx.clone());
        self.router = Some(Arc::new(router));
        self.health.stages = ComponentHealth::Healthy;
        Ok(())
    }

    async fn start_listener(&mut self) -> Result<()> {
        let router = self.router.clone().context("stages not initialized")?;
        let config = ListenerConfig::from_server(&self.config.server)?;
        let listener = Arc::new(CoherenceListener::new(config, self.shutdown_rx.clone()));
        let bound = listener.bind().await?;
        let addr = bound.local_addr().context("listener has no local address")?;
        self.local_addr = Some(addr);
        self.tasks
            .push(tokio::spawn(listener.serve(bound, router)));
        self.health.listener = ComponentHealth::Healthy;
        tracing::info!(addr = %addr, "client listener started");
        Ok(())
    }

    fn spawn_timer_loop(&mut self, mut timer_rx: mpsc::UnboundedReceiver<TimerKey>) -> Result<()> {
        let service = self.service.clone().context("service not initialized")?;
        let mut shutdown = self.shutdown_rx.clone();
        self.tasks.push(tokio::spawn(async move {
            loop {
                tokio::select! {
                    key = timer_rx.recv() => match key {
                        Some(key) => service.locks().timer_fired(&key),
                        None => break,
                    },
                    _ = shutdown.changed() => break,
                }
            }
        }));
        Ok(())
    }

    fn spawn_maintenance(&mut self) -> Result<()> {
        let router = self.router.clone().context("stages not initialized")?;
        let expiry_ms = (self.config.server.reconnect_window_ms / 4).clamp(10, 1_000);
        let expiry_every = Duration::from_millis(expiry_ms);
        let mut shutdown = self.shutdown_rx.clone();
        self.tasks.push(tokio::spawn(async move {
            let mut tick = tokio::time::interval(expiry_every);
            loop {
                tokio::select! {
                    _ = tick.tick() => router.expire_windows().await,
                    _ = shutdown.changed() => break,
                }
            }
        }));

        let scan_ms = self.config.locks.deadlock_scan_interval_ms;
        if scan_ms > 0 {
            let service = self.service.clone().context("service not initialized")?;
            let mut shutdown = self.shutdown_rx.clone();
            self.tasks.push(tokio::spawn(async move {
                let mut tick = tokio::time::interval(Duration::from_millis(scan_ms));
                loop {
                    tokio::select! {
                        _ = tick.tick() => {
                            for chain in service.detect_deadlocks() {
                                tracing::warn!(chain = %chain, "deadlock detected");
                            }
                        }
                        _ = shutdown.changed() => break,
                    }
                }
            }));
        }
        Ok(())
    }

    /// Trigger graceful shutdown.
    pub fn shutdown(&self) {
        tracing::info!("shutdown requested");
        let _ = self.shutdown_tx.send(true);
    }

    /// Wait for shutdown signal.
    pub async fn wait_for_shutdown(&mut self) {
        let mut rx = self.shutdown_rx.clone();
        while !*rx.borrow() {
            if rx.changed().await.is_err() {
                break;
            }
        }
    }

    /// Run the runtime until shutdown.
    pub async fn run(&mut self) -> Result<()> {
        self.start().await?;

        let mut shutdown_rx = self.shutdown_rx.clone();
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::warn!("shutdown signal received (SIGINT)");
            }
            _ = async {
                while !*shutdown_rx.borrow() {
                    if shutdown_rx.changed().await.is_err() {
                        break;
                    }
                }
            } => {
                tracing::info!("shutdown requested by component");
            }
        }

        self.stop().await
    }

    /// Stop all runtime components in reverse start order.
    pub async fn stop(&mut self) -> Result<()> {
        tracing::info!("stopping coherence server");
        self.running.store(false, Ordering::Release);
        self.ctx.record(OperatorEvent::new(
            EventKind::ServerStopping,
            format!("{} stopping", self.config.server.node_name),
        ));
        let _ = self.shutdown_tx.send(true);

        self.health.listener = ComponentHealth::Stopping;
        for task in self.tasks.drain(..) {
            match tokio::time::timeout(Duration::from_secs(5), task).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::warn!(error = %e, "background task panicked"),
                Err(_) => tracing::warn!("background task stop timed out"),
            }
        }
        self.health.listener = ComponentHealth::Stopped;

        self.health.stages = ComponentHealth::Stopping;
        if let Some(router) = self.router.take() {
            router.join().await;
        }
        self.health.stages = ComponentHealth::Stopped;

        self.health.service = ComponentHealth::Stopping;
        if let Some(service) = self.service.as_ref() {
            service.locks().stop();
        }
        self.health.service = ComponentHealth::Stopped;
        self.health.sequence = ComponentHealth::Stopped;

        tracing::info!("coherence server stopped");
        Ok(())
    }
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("node", &self.config.server.node_name)
            .field("local_addr", &self.local_addr)
            .field("health", &self.health)
            .field("running", &self.is_running())
            .finish()
    }
}
