//! Server lock manager.
//!
//! Owns one [`ServerLock`] per [`LockId`] behind its own mutex, so
//! operations on different locks never contend. The table itself is only
//! write-locked to create an entry or to drop an entry that became empty.
//! A dropped entry is marked retired first; an operation that raced with the
//! removal and finds a retired entry looks the lock up again.
//!
//! Lifecycle: a manager created for a server taking over after failover
//! starts in [`ManagerState::Starting`]. Reconnecting clients re-establish
//! their contexts, new `request`/`try_request` calls are queued, and
//! [`LockManager::start`] arms deferred timers, grants what the queues allow
//! and replays the queued requests in arrival order.

use super::deadlock::{DeadlockChain, WaitForGraph};
use super::lock::{LockEffects, LockNotice, LockSnapshot, ServerLock};
use super::timer::{TimerIdGen, TimerKey, TimerScheduler};
use crate::core::context::NodeContext;
use crate::core::error::{CoherenceError, CoherenceResult};
use crate::core::time::TimerSpec;
use crate::model::lock::{LockContext, LockId, LockLevel, Requester};
use crate::model::node::NodeId;
use crate::ops::events::{EventKind, OperatorEvent};
use crate::ops::metrics::names;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Receives notices produced by the lock manager.
pub trait LockNoticeSink: Send + Sync {
    /// Deliver one notice.
    fn deliver(&self, notice: LockNotice);
}

/// Sink that keeps every notice in memory.
#[derive(Debug, Default)]
pub struct CollectingSink {
    notices: Mutex<Vec<LockNotice>>,
}

impl CollectingSink {
    /// Create an empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Remove and return everything collected so far.
    pub fn take(&self) -> Vec<LockNotice> {
        std::mem::take(&mut *self.notices.lock())
    }

    /// Number of collected notices.
    pub fn len(&self) -> usize {
        self.notices.lock().len()
    }

    /// Check if nothing was collected.
    pub fn is_empty(&self) -> bool {
        self.notices.lock().is_empty()
    }
}

impl LockNoticeSink for CollectingSink {
    fn deliver(&self, notice: LockNotice) {
        self.notices.lock().push(notice);
    }
}

/// Manager lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ManagerState {
    /// Accepting re-established contexts; new requests are queued.
    Starting,
    /// Serving requests.
    Started,
    /// Rejecting everything.
    Stopped,
}

impl ManagerState {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Started => "started",
            Self::Stopped => "stopped",
        }
    }
}

#[derive(Debug)]
enum QueuedRequest {
    Lock {
        lock_id: LockId,
        requester: Requester,
        level: LockLevel,
    },
    Try {
        lock_id: LockId,
        requester: Requester,
        level: LockLevel,
        timer: TimerSpec,
    },
}

impl QueuedRequest {
    fn node(&self) -> NodeId {
        match self {
            Self::Lock { requester, .. } | Self::Try { requester, .. } => requester.node,
        }
    }
}

#[derive(Debug)]
struct Lifecycle {
    state: ManagerState,
    queued: Vec<QueuedRequest>,
}

/// Aggregate counts across all locks.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LockStats {
    /// Locks with at least one entry.
    pub locks: usize,
    /// Holder entries.
    pub holders: usize,
    /// Pending and try-pending entries.
    pub pending: usize,
    /// Waiter entries.
    pub waiters: usize,
}

/// Server lock manager.
pub struct LockManager {
    ctx: NodeContext,
    locks: RwLock<HashMap<LockId, Arc<Mutex<ServerLock>>>>,
    lifecycle: Mutex<Lifecycle>,
    timers: Arc<dyn TimerScheduler>,
    timer_ids: TimerIdGen,
    sink: Arc<dyn LockNoticeSink>,
    scan_on_pending: bool,
    // Chains seen by the previous full scan.
    reported: Mutex<HashSet<DeadlockChain>>,
}

impl LockManager {
    /// Create a manager that is already started.
    pub fn new(
        ctx: NodeContext,
        timers: Arc<dyn TimerScheduler>,
        sink: Arc<dyn LockNoticeSink>,
    ) -> Self {
        Self::with_state(ctx, timers, sink, ManagerState::Started)
    }

    /// Create a manager in the starting state.
    pub fn starting(
        ctx: NodeContext,
        timers: Arc<dyn TimerScheduler>,
        sink: Arc<dyn LockNoticeSink>,
    ) -> Self {
        Self::with_state(ctx, timers, sink, ManagerState::Starting)
    }

    fn with_state(
        ctx: NodeContext,
        timers: Arc<dyn TimerScheduler>,
        sink: Arc<dyn LockNoticeSink>,
        state: ManagerState,
    ) -> Self {
        Self {
            ctx,
            locks: RwLock::new(HashMap::new()),
            lifecycle: Mutex::new(Lifecycle {
                state,
                queued: Vec::new(),
            }),
            timers,
            timer_ids: TimerIdGen::default(),
            sink,
            scan_on_pending: false,
            reported: Mutex::new(HashSet::new()),
        }
    }

    /// Run deadlock detection whenever a request has to queue.
    pub fn with_scan_on_pending(mut self, enabled: bool) -> Self {
        self.scan_on_pending = enabled;
        self
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ManagerState {
        self.lifecycle.lock().state
    }

    /// Whether the manager is serving requests.
    pub fn is_started(&self) -> bool {
        self.state() == ManagerState::Started
    }

    /// Leave the starting state: arm deferred timers, grant what the queues
    /// allow, then replay requests queued while starting.
    pub fn start(&self) -> CoherenceResult<()> {
        let mut lifecycle = self.lifecycle.lock();
        match lifecycle.state {
            ManagerState::Started => return Ok(()),
            ManagerState::Stopped => {
                return Err(CoherenceError::LockManagerUnavailable { state: "stopped" })
            }
            ManagerState::Starting => {}
        }

        let mut effects = LockEffects::default();
        for (_, entry) in self.all_locks() {
            let mut lock = entry.lock();
            if lock.is_retired() {
                continue;
            }
            lock.arm_timers(&self.timer_ids, &mut effects);
            lock.process_pending(&mut effects);
        }
        self.apply(effects);

        let queued = std::mem::take(&mut lifecycle.queued);
        let replayed = queued.len();
        for request in queued {
            let result = match request {
                QueuedRequest::Lock {
                    lock_id,
                    requester,
                    level,
                } => self.do_request(&lock_id, requester, level),
                QueuedRequest::Try {
                    lock_id,
                    requester,
                    level,
                    timer,
                } => self.do_try_request(&lock_id, requester, level, timer),
            };
            if let Err(e) = result {
                tracing::warn!(error = %e, "queued lock request rejected at start");
            }
        }
        lifecycle.state = ManagerState::Started;
        tracing::info!(locks = self.lock_count(), replayed, "lock manager started");
        Ok(())
    }

    /// Stop serving. Later calls fail and late timers are ignored.
    pub fn stop(&self) {
        let mut lifecycle = self.lifecycle.lock();
        lifecycle.state = ManagerState::Stopped;
        lifecycle.queued.clear();
        tracing::info!("lock manager stopped");
    }

    /// Blocking request: granted now or queued FIFO.
    pub fn request(
        &self,
        lock_id: &LockId,
        requester: Requester,
        level: LockLevel,
    ) -> CoherenceResult<()> {
        if self.queue_if_starting(|| QueuedRequest::Lock {
            lock_id: lock_id.clone(),
            requester,
            level,
        })? {
            return Ok(());
        }
        self.do_request(lock_id, requester, level)
    }

    /// Bounded request; a `TryFailed` notice reports refusal or timeout.
    pub fn try_request(
        &self,
        lock_id: &LockId,
        requester: Requester,
        level: LockLevel,
        timer: TimerSpec,
    ) -> CoherenceResult<()> {
        if self.queue_if_starting(|| QueuedRequest::Try {
            lock_id: lock_id.clone(),
            requester,
            level,
            timer,
        })? {
            return Ok(());
        }
        self.do_try_request(lock_id, requester, level, timer)
    }

    /// Drop a hold.
    pub fn release(&self, lock_id: &LockId, requester: Requester) -> CoherenceResult<()> {
        self.ensure_not_stopped()?;
        let mut effects = LockEffects::default();
        let result = self
            .with_existing(lock_id, |lock| lock.release(requester, &mut effects))
            .unwrap_or(Err(CoherenceError::NotHolder {
                lock_id: lock_id.clone(),
                node: requester.node,
            }));
        self.apply(effects);
        result
    }

    /// Release the write hold and wait for notify or `timer`.
    pub fn wait(
        &self,
        lock_id: &LockId,
        requester: Requester,
        timer: TimerSpec,
    ) -> CoherenceResult<()> {
        let arm = self.ensure_not_stopped()? == ManagerState::Started;
        let mut effects = LockEffects::default();
        let result = self
            .with_existing(lock_id, |lock| {
                lock.wait(requester, timer, &self.timer_ids, arm, &mut effects)
            })
            .unwrap_or_else(|| Err(not_held_for_monitor(lock_id, requester, "wait")));
        self.apply(effects);
        result
    }

    /// Wake one or all waiters. Returns the notified requesters.
    pub fn notify(
        &self,
        lock_id: &LockId,
        requester: Requester,
        all: bool,
    ) -> CoherenceResult<Vec<Requester>> {
        self.ensure_not_stopped()?;
        let mut effects = LockEffects::default();
        let result = self
            .with_existing(lock_id, |lock| lock.notify(requester, all, &mut effects))
            .unwrap_or_else(|| Err(not_held_for_monitor(lock_id, requester, "notify")));
        self.apply(effects);
        result
    }

    /// Wake a waiter without a notify. Returns false when it is not waiting.
    pub fn interrupt(&self, lock_id: &LockId, requester: Requester) -> CoherenceResult<bool> {
        self.ensure_not_stopped()?;
        let mut effects = LockEffects::default();
        let woke = self
            .with_existing(lock_id, |lock| lock.interrupt(requester, &mut effects))
            .unwrap_or(false);
        self.apply(effects);
        Ok(woke)
    }

    /// Ask every node holding `lock_id` to relinquish it. Returns the number
    /// of recall notices sent.
    pub fn recall(&self, lock_id: &LockId) -> CoherenceResult<usize> {
        self.ensure_not_stopped()?;
        let mut effects = LockEffects::default();
        self.with_existing(lock_id, |lock| lock.recall(&mut effects));
        let sent = effects.notices.len();
        if sent > 0 {
            self.ctx.record(OperatorEvent::new(
                EventKind::LockRecalled,
                format!("recalled {} from {} node(s)", lock_id, sent),
            ));
        }
        self.apply(effects);
        Ok(sent)
    }

    /// Re-create a context reported in a reconnecting client's handshake.
    pub fn reestablish(&self, ctx: LockContext) -> CoherenceResult<()> {
        let started = self.ensure_not_stopped()? == ManagerState::Started;
        let lock_id = ctx.lock_id().clone();
        let mut effects = LockEffects::default();
        let result = self.with_lock(&lock_id, |lock| {
            lock.reestablish(ctx, &self.timer_ids, started, &mut effects)?;
            if started {
                lock.process_pending(&mut effects);
            }
            Ok(())
        });
        self.apply(effects);
        result
    }

    /// Drop every context of a departed node, granting what becomes free.
    pub fn clear_state_for_node(&self, node: NodeId) {
        self.lifecycle.lock().queued.retain(|q| q.node() != node);
        let mut effects = LockEffects::default();
        let mut emptied = Vec::new();
        for (lock_id, entry) in self.all_locks() {
            let mut lock = entry.lock();
            if lock.is_retired() {
                continue;
            }
            if lock.clear_node(node, &mut effects) {
                emptied.push(lock_id);
            }
        }
        for lock_id in emptied {
            self.collect_if_empty(&lock_id);
        }
        tracing::debug!(node = %node, "cleared lock state for node");
        self.apply(effects);
    }

    /// Handle an elapsed try-lock or wait timer.
    pub fn timer_fired(&self, key: &TimerKey) {
        if self.state() == ManagerState::Stopped {
            return;
        }
        let mut effects = LockEffects::default();
        self.with_existing(&key.lock_id, |lock| lock.timer_fired(key, &mut effects));
        self.apply(effects);
    }

    /// Snapshot of one lock.
    pub fn query_lock(&self, lock_id: &LockId) -> Option<LockSnapshot> {
        self.with_existing(lock_id, |lock| lock.snapshot())
    }

    /// Level at which `requester` holds `lock_id`.
    pub fn held_level(&self, lock_id: &LockId, requester: Requester) -> Option<LockLevel> {
        self.with_existing(lock_id, |lock| lock.held_level(requester))
            .flatten()
    }

    /// Every context that belongs to `node`, across all locks.
    pub fn contexts_for_node(&self, node: NodeId) -> Vec<LockContext> {
        let mut out = Vec::new();
        for (_, entry) in self.all_locks() {
            let snapshot = entry.lock().snapshot();
            out.extend(
                snapshot
                    .holders
                    .into_iter()
                    .chain(snapshot.pending)
                    .chain(snapshot.waiters)
                    .filter(|ctx| ctx.node() == node),
            );
        }
        out
    }

    /// Number of tracked locks.
    pub fn lock_count(&self) -> usize {
        self.locks.read().len()
    }

    /// Aggregate counts.
    pub fn stats(&self) -> LockStats {
        let mut stats = LockStats::default();
        for (_, entry) in self.all_locks() {
            let lock = entry.lock();
            if lock.is_retired() {
                continue;
            }
            stats.locks += 1;
            stats.holders += lock.holders_count();
            stats.pending += lock.pending_count();
            stats.waiters += lock.waiter_count();
        }
        stats
    }

    /// Scan the wait-for graph and return every cycle in it.
    pub fn detect_deadlocks(&self) -> Vec<DeadlockChain> {
        self.scan().0
    }

    /// Scan the wait-for graph and return only the cycles the previous scan
    /// did not see. A cycle that disappears and forms again counts as new.
    pub fn detect_new_deadlocks(&self) -> Vec<DeadlockChain> {
        self.scan().1
    }

    // New cycles are recorded as operator events.
    fn scan(&self) -> (Vec<DeadlockChain>, Vec<DeadlockChain>) {
        let chains = self.wait_for_graph().find_deadlocks();
        let mut reported = self.reported.lock();
        let fresh: Vec<DeadlockChain> = chains
            .iter()
            .filter(|chain| !reported.contains(*chain))
            .cloned()
            .collect();
        *reported = chains.iter().cloned().collect();
        drop(reported);
        for chain in &fresh {
            self.ctx.metrics().counter_inc(names::LOCKS_DEADLOCKS);
            self.ctx.record(OperatorEvent::new(
                EventKind::DeadlockDetected,
                format!("deadlock: {}", chain),
            ));
        }
        (chains, fresh)
    }

    fn wait_for_graph(&self) -> WaitForGraph {
        let mut graph = WaitForGraph::new();
        for (_, entry) in self.all_locks() {
            graph.add_lock(&entry.lock().snapshot());
        }
        graph
    }

    fn do_request(
        &self,
        lock_id: &LockId,
        requester: Requester,
        level: LockLevel,
    ) -> CoherenceResult<()> {
        let mut effects = LockEffects::default();
        let queued = self.with_lock(lock_id, |lock| {
            lock.request(requester, level, &mut effects)?;
            Ok::<_, CoherenceError>(!lock.is_held_by(requester))
        })?;
        self.apply(effects);
        if queued && self.scan_on_pending {
            self.report_deadlocks_for(lock_id, requester);
        }
        Ok(())
    }

    fn do_try_request(
        &self,
        lock_id: &LockId,
        requester: Requester,
        level: LockLevel,
        timer: TimerSpec,
    ) -> CoherenceResult<()> {
        let mut effects = LockEffects::default();
        self.with_lock(lock_id, |lock| {
            lock.try_request(requester, level, timer, &self.timer_ids, &mut effects)
        })?;
        self.apply(effects);
        Ok(())
    }

    fn report_deadlocks_for(&self, lock_id: &LockId, requester: Requester) {
        let Some(chain) = self.wait_for_graph().cycle_through(requester) else {
            return;
        };
        self.ctx.metrics().counter_inc(names::LOCKS_DEADLOCKS);
        self.ctx.record(OperatorEvent::new(
            EventKind::DeadlockDetected,
            format!("deadlock: {}", chain),
        ));
        self.sink.deliver(LockNotice::Deadlocked {
            lock_id: lock_id.clone(),
            requester,
            chain,
        });
    }

    fn queue_if_starting(
        &self,
        request: impl FnOnce() -> QueuedRequest,
    ) -> CoherenceResult<bool> {
        let mut lifecycle = self.lifecycle.lock();
        match lifecycle.state {
            ManagerState::Starting => {
                lifecycle.queued.push(request());
                Ok(true)
            }
            ManagerState::Started => Ok(false),
            ManagerState::Stopped => Err(CoherenceError::LockManagerUnavailable {
                state: ManagerState::Stopped.as_str(),
            }),
        }
    }

    fn ensure_not_stopped(&self) -> CoherenceResult<ManagerState> {
        match self.state() {
            ManagerState::Stopped => Err(CoherenceError::LockManagerUnavailable {
                state: ManagerState::Stopped.as_str(),
            }),
            state => Ok(state),
        }
    }

    fn all_locks(&self) -> Vec<(LockId, Arc<Mutex<ServerLock>>)> {
        self.locks
            .read()
            .iter()
            .map(|(id, entry)| (id.clone(), entry.clone()))
            .collect()
    }

    /// Run `f` inside the lock's critical section, creating the lock if
    /// needed.
    fn with_lock<R>(&self, lock_id: &LockId, f: impl FnOnce(&mut ServerLock) -> R) -> R {
        let mut f = Some(f);
        loop {
            let entry = self.entry_or_create(lock_id);
            let mut lock = entry.lock();
            if lock.is_retired() {
                continue;
            }
            let Some(f) = f.take() else {
                unreachable!("closure consumed once");
            };
            let result = f(&mut lock);
            let empty = lock.is_empty();
            drop(lock);
            if empty {
                self.collect_if_empty(lock_id);
            }
            return result;
        }
    }

    /// Run `f` inside the lock's critical section if the lock exists.
    fn with_existing<R>(
        &self,
        lock_id: &LockId,
        f: impl FnOnce(&mut ServerLock) -> R,
    ) -> Option<R> {
        let entry = self.locks.read().get(lock_id).cloned()?;
        let mut lock = entry.lock();
        if lock.is_retired() {
            return None;
        }
        let result = f(&mut lock);
        let empty = lock.is_empty();
        drop(lock);
        if empty {
            self.collect_if_empty(lock_id);
        }
        Some(result)
    }

    fn entry_or_create(&self, lock_id: &LockId) -> Arc<Mutex<ServerLock>> {
        if let Some(entry) = self.locks.read().get(lock_id) {
            return entry.clone();
        }
        let mut locks = self.locks.write();
        let entry = locks
            .entry(lock_id.clone())
            .or_insert_with(|| Arc::new(Mutex::new(ServerLock::new(lock_id.clone()))))
            .clone();
        self.ctx
            .metrics()
            .gauge_set(names::LOCKS_ACTIVE, locks.len() as u64);
        entry
    }

    fn collect_if_empty(&self, lock_id: &LockId) {
        let mut locks = self.locks.write();
        let Some(entry) = locks.get(lock_id).cloned() else {
            return;
        };
        let mut lock = entry.lock();
        if lock.is_empty() {
            lock.retire();
            drop(lock);
            locks.remove(lock_id);
            self.ctx
                .metrics()
                .gauge_set(names::LOCKS_ACTIVE, locks.len() as u64);
        }
    }

    fn apply(&self, effects: LockEffects) {
        for (key, spec) in effects.scheduled {
            self.timers.schedule(key, spec);
        }
        for id in effects.cancelled {
            self.timers.cancel(id);
        }
        for notice in effects.notices {
            let metric = match &notice {
                LockNotice::Granted { .. } => names::LOCKS_GRANTED,
                LockNotice::TryFailed { .. } => names::LOCKS_TRY_FAILED,
                LockNotice::WaitTimedOut { .. } => names::LOCKS_WAIT_TIMED_OUT,
                LockNotice::Recall { .. } => names::LOCKS_RECALLS,
                LockNotice::Deadlocked { .. } => names::LOCKS_DEADLOCKS,
            };
            self.ctx.metrics().counter_inc(metric);
            tracing::trace!(
                lock = %notice.lock_id(),
                node = %notice.node(),
                ?notice,
                "lock notice"
            );
            self.sink.deliver(notice);
        }
    }
}

fn not_held_for_monitor(lock_id: &LockId, requester: Requester, op: &str) -> CoherenceError {
    CoherenceError::IllegalMonitorState {
        lock_id: lock_id.clone(),
        message: format!("{} called by {} on a lock nobody holds", op, requester),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::locks::timer::ManualTimerScheduler;
    use crate::model::lock::ThreadId;

    fn req(client: u64, thread: u64) -> Requester {
        Requester::new(NodeId::client(client), ThreadId(thread))
    }

    fn manager() -> (LockManager, Arc<CollectingSink>, Arc<ManualTimerScheduler>) {
        let (ctx, _) = NodeContext::manual("test");
        let sink = Arc::new(CollectingSink::new());
        let timers = Arc::new(ManualTimerScheduler::new());
        (LockManager::new(ctx, timers.clone(), sink.clone()), sink, timers)
    }

    #[test]
    fn test_empty_locks_are_collected() {
        let (mgr, _, _) = manager();
        let l1 = LockId::from("L1");
        mgr.request(&l1, req(1, 1), LockLevel::Write).unwrap();
        assert_eq!(mgr.lock_count(), 1);
        mgr.release(&l1, req(1, 1)).unwrap();
        assert_eq!(mgr.lock_count(), 0);
        assert!(mgr.query_lock(&l1).is_none());
    }

    #[test]
    fn test_release_unknown_lock_is_not_holder() {
        let (mgr, _, _) = manager();
        let err = mgr.release(&LockId::from("nope"), req(1, 1)).unwrap_err();
        assert_eq!(err.kind(), "NotHolder");
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_starting_queues_requests_until_start() {
        let (ctx, _) = NodeContext::manual("test");
        let sink = Arc::new(CollectingSink::new());
        let timers = Arc::new(ManualTimerScheduler::new());
        let mgr = LockManager::starting(ctx, timers, sink.clone());
        let l1 = LockId::from("L1");

        let held =
            LockContext::holder(l1.clone(), NodeId::client(1), ThreadId(1), LockLevel::Write);
        mgr.reestablish(held).unwrap();
        mgr.request(&l1, req(2, 1), LockLevel::Write).unwrap();
        assert!(sink.is_empty());
        assert_eq!(mgr.query_lock(&l1).unwrap().pending.len(), 0);

        mgr.start().unwrap();
        let snapshot = mgr.query_lock(&l1).unwrap();
        assert_eq!(snapshot.holders[0].requester(), req(1, 1));
        assert_eq!(snapshot.pending[0].requester(), req(2, 1));
    }

    #[test]
    fn test_stopped_rejects() {
        let (mgr, _, _) = manager();
        mgr.stop();
        let err = mgr
            .request(&LockId::from("L"), req(1, 1), LockLevel::Read)
            .unwrap_err();
        assert_eq!(err.kind(), "LockManagerUnavailable");
    }

    #[test]
    fn test_timer_driven_try_failure() {
        let (mgr, sink, timers) = manager();
        let l = LockId::from("L");
        mgr.request(&l, req(1, 1), LockLevel::Write).unwrap();
        mgr.try_request(&l, req(2, 1), LockLevel::Write, TimerSpec::from_millis(100))
            .unwrap();
        sink.take();

        for key in timers.advance(100) {
            mgr.timer_fired(&key);
        }
        let notices = sink.take();
        assert!(matches!(notices[0], LockNotice::TryFailed { .. }));
        assert_eq!(mgr.stats().pending, 0);
    }

    #[test]
    fn test_scan_on_pending_reports_deadlock() {
        let (ctx, _) = NodeContext::manual("test");
        let sink = Arc::new(CollectingSink::new());
        let timers = Arc::new(ManualTimerScheduler::new());
        let mgr = LockManager::new(ctx, timers, sink.clone()).with_scan_on_pending(true);
        let (l1, l2) = (LockId::from("L1"), LockId::from("L2"));

        mgr.request(&l1, req(1, 1), LockLevel::Write).unwrap();
        mgr.request(&l2, req(2, 2), LockLevel::Write).unwrap();
        mgr.request(&l2, req(1, 1), LockLevel::Write).unwrap();
        mgr.request(&l1, req(2, 2), LockLevel::Write).unwrap();

        let deadlocked: Vec<_> = sink
            .take()
            .into_iter()
            .filter(|n| matches!(n, LockNotice::Deadlocked { .. }))
            .collect();
        assert_eq!(deadlocked.len(), 1);
        assert_eq!(deadlocked[0].node(), NodeId::client(2));
    }

    #[test]
    fn test_cycle_closed_inside_a_deadlocked_group_is_reported() {
        let (ctx, _) = NodeContext::manual("test");
        let sink = Arc::new(CollectingSink::new());
        let timers = Arc::new(ManualTimerScheduler::new());
        let mgr = LockManager::new(ctx, timers, sink.clone()).with_scan_on_pending(true);
        let (l1, l2) = (LockId::from("L1"), LockId::from("L2"));

        mgr.request(&l1, req(1, 1), LockLevel::Read).unwrap();
        mgr.request(&l1, req(3, 1), LockLevel::Read).unwrap();
        mgr.request(&l2, req(2, 1), LockLevel::Write).unwrap();
        mgr.request(&l2, req(1, 1), LockLevel::Write).unwrap();
        mgr.request(&l1, req(2, 1), LockLevel::Write).unwrap();
        sink.take();

        // Client 3 closes a second cycle with client 2.
        mgr.request(&l2, req(3, 1), LockLevel::Write).unwrap();
        let deadlocked: Vec<_> = sink
            .take()
            .into_iter()
            .filter_map(|n| match n {
                LockNotice::Deadlocked { requester, chain, .. } => Some((requester, chain)),
                _ => None,
            })
            .collect();
        assert_eq!(deadlocked.len(), 1);
        assert_eq!(deadlocked[0].0, req(3, 1));
        assert!(deadlocked[0].1.requesters().contains(&req(2, 1)));
    }

    #[test]
    fn test_periodic_scan_reports_each_chain_once() {
        let (ctx, _) = NodeContext::manual("test");
        let sink = Arc::new(CollectingSink::new());
        let timers = Arc::new(ManualTimerScheduler::new());
        let mgr = LockManager::new(ctx.clone(), timers, sink);
        let (l1, l2) = (LockId::from("L1"), LockId::from("L2"));

        mgr.request(&l1, req(1, 1), LockLevel::Write).unwrap();
        mgr.request(&l2, req(2, 1), LockLevel::Write).unwrap();
        mgr.request(&l2, req(1, 1), LockLevel::Write).unwrap();
        mgr.request(&l1, req(2, 1), LockLevel::Write).unwrap();

        assert_eq!(mgr.detect_new_deadlocks().len(), 1);
        assert!(mgr.detect_new_deadlocks().is_empty());
        assert_eq!(mgr.detect_deadlocks().len(), 1);
        assert_eq!(ctx.events().count_of(EventKind::DeadlockDetected), 1);

        // Breaking the cycle forgets it.
        mgr.clear_state_for_node(NodeId::client(2));
        assert!(mgr.detect_new_deadlocks().is_empty());
        let l3 = LockId::from("L3");
        mgr.request(&l3, req(3, 1), LockLevel::Write).unwrap();
        mgr.request(&l3, req(1, 1), LockLevel::Write).unwrap();
        mgr.request(&l1, req(3, 1), LockLevel::Write).unwrap();
        assert_eq!(mgr.detect_new_deadlocks().len(), 1);
    }
}
