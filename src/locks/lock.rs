//! Per-lock state machine.
//!
//! A [`ServerLock`] keeps three ordered collections for one [`LockId`]:
//! holders in grant order, pending entries in arrival order, and waiters in
//! the order they called `wait`. Operations never touch timers or the
//! network directly; they record what must happen in [`LockEffects`] and the
//! manager applies the effects after leaving the lock's critical section.
//!
//! Grant rule: the head of the pending queue is granted when it is
//! compatible with every current holder, then the next entry is considered,
//! and so on. The first entry that cannot be granted stops the scan, so a
//! later compatible entry never overtakes an earlier incompatible one.

use super::deadlock::DeadlockChain;
use super::timer::{TimerId, TimerIdGen, TimerKey, TimerKind};
use crate::core::error::{CoherenceError, CoherenceResult};
use crate::core::time::TimerSpec;
use crate::model::lock::{LockContext, LockId, LockLevel, LockType, Requester};
use crate::model::node::NodeId;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, VecDeque};

/// Outcome addressed to one requester (or, for recalls, one holder node).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LockNotice {
    /// The request was granted.
    Granted {
        lock_id: LockId,
        requester: Requester,
        level: LockLevel,
    },
    /// A try-lock was refused or its timer expired before grant.
    TryFailed {
        lock_id: LockId,
        requester: Requester,
        level: LockLevel,
    },
    /// A waiter's timer expired; the requester re-contends for the lock.
    WaitTimedOut { lock_id: LockId, requester: Requester },
    /// The holder node is asked to give up its holds.
    Recall {
        lock_id: LockId,
        node: NodeId,
        level: LockLevel,
    },
    /// The queued request closed a cycle in the wait-for graph. The request
    /// stays queued; resolving the cycle is up to the caller.
    Deadlocked {
        lock_id: LockId,
        requester: Requester,
        chain: DeadlockChain,
    },
}

impl LockNotice {
    /// Node the notice must be delivered to.
    pub fn node(&self) -> NodeId {
        match self {
            Self::Granted { requester, .. }
            | Self::TryFailed { requester, .. }
            | Self::WaitTimedOut { requester, .. }
            | Self::Deadlocked { requester, .. } => requester.node,
            Self::Recall { node, .. } => *node,
        }
    }

    /// Lock the notice refers to.
    pub fn lock_id(&self) -> &LockId {
        match self {
            Self::Granted { lock_id, .. }
            | Self::TryFailed { lock_id, .. }
            | Self::WaitTimedOut { lock_id, .. }
            | Self::Recall { lock_id, .. }
            | Self::Deadlocked { lock_id, .. } => lock_id,
        }
    }
}

/// Side effects produced by lock operations.
#[derive(Debug, Default)]
pub struct LockEffects {
    /// Notices to deliver, in production order.
    pub notices: Vec<LockNotice>,
    /// Timers to schedule.
    pub scheduled: Vec<(TimerKey, TimerSpec)>,
    /// Timers to cancel.
    pub cancelled: Vec<TimerId>,
}

impl LockEffects {
    /// Whether nothing needs to be applied.
    pub fn is_empty(&self) -> bool {
        self.notices.is_empty() && self.scheduled.is_empty() && self.cancelled.is_empty()
    }

    /// Append another set of effects.
    pub fn extend(&mut self, other: LockEffects) {
        self.notices.extend(other.notices);
        self.scheduled.extend(other.scheduled);
        self.cancelled.extend(other.cancelled);
    }
}

#[derive(Debug, Clone)]
struct Entry {
    ctx: LockContext,
    timer: Option<TimerId>,
}

impl Entry {
    fn new(ctx: LockContext) -> Self {
        Self { ctx, timer: None }
    }

    fn requester(&self) -> Requester {
        self.ctx.requester()
    }
}

/// Read-only view of one lock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockSnapshot {
    /// Lock id.
    pub lock_id: LockId,
    /// Holders in grant order.
    pub holders: Vec<LockContext>,
    /// Pending and try-pending entries in queue order.
    pub pending: Vec<LockContext>,
    /// Waiters in arrival order.
    pub waiters: Vec<LockContext>,
}

/// State of one lock.
#[derive(Debug)]
pub struct ServerLock {
    lock_id: LockId,
    holders: Vec<Entry>,
    pending: VecDeque<Entry>,
    waiters: Vec<Entry>,
    retired: bool,
}

impl ServerLock {
    /// Create an empty lock.
    pub fn new(lock_id: LockId) -> Self {
        Self {
            lock_id,
            holders: Vec::new(),
            pending: VecDeque::new(),
            waiters: Vec::new(),
            retired: false,
        }
    }

    /// Lock id.
    pub fn lock_id(&self) -> &LockId {
        &self.lock_id
    }

    /// Whether the lock has no holders, pending entries or waiters.
    pub fn is_empty(&self) -> bool {
        self.holders.is_empty() && self.pending.is_empty() && self.waiters.is_empty()
    }

    /// Whether the lock was removed from the manager's table.
    pub(crate) fn is_retired(&self) -> bool {
        self.retired
    }

    pub(crate) fn retire(&mut self) {
        self.retired = true;
    }

    /// Number of holders.
    pub fn holders_count(&self) -> usize {
        self.holders.len()
    }

    /// Number of pending and try-pending entries.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Number of waiters.
    pub fn waiter_count(&self) -> usize {
        self.waiters.len()
    }

    /// Whether `requester` holds the lock.
    pub fn is_held_by(&self, requester: Requester) -> bool {
        self.holders.iter().any(|e| e.requester() == requester)
    }

    /// Level held by `requester`, if any.
    pub fn held_level(&self, requester: Requester) -> Option<LockLevel> {
        self.holders
            .iter()
            .find(|e| e.requester() == requester)
            .map(|e| e.ctx.level())
    }

    /// Snapshot of the lock's queues.
    pub fn snapshot(&self) -> LockSnapshot {
        LockSnapshot {
            lock_id: self.lock_id.clone(),
            holders: self.holders.iter().map(|e| e.ctx.clone()).collect(),
            pending: self.pending.iter().map(|e| e.ctx.clone()).collect(),
            waiters: self.waiters.iter().map(|e| e.ctx.clone()).collect(),
        }
    }

    /// Queue a blocking request and grant what the FIFO rule allows.
    pub fn request(
        &mut self,
        requester: Requester,
        level: LockLevel,
        effects: &mut LockEffects,
    ) -> CoherenceResult<()> {
        self.validate_new_request(requester, level)?;
        let ctx =
            LockContext::pending(self.lock_id.clone(), requester.node, requester.thread, level);
        self.pending.push_back(Entry::new(ctx));
        self.process_pending(effects);
        Ok(())
    }

    /// Try to acquire within `timer`.
    ///
    /// Granted immediately when nothing is queued and the level is compatible
    /// with the holders. Otherwise a zero timer fails at once, and a non-zero
    /// timer queues a try-pending entry with a scheduled timeout.
    pub fn try_request(
        &mut self,
        requester: Requester,
        level: LockLevel,
        timer: TimerSpec,
        ids: &TimerIdGen,
        effects: &mut LockEffects,
    ) -> CoherenceResult<()> {
        self.validate_new_request(requester, level)?;
        if self.pending.is_empty() && self.can_award(level) {
            self.award(
                LockContext::pending(self.lock_id.clone(), requester.node, requester.thread, level),
                effects,
            );
            return Ok(());
        }
        if timer.is_zero() {
            effects.notices.push(LockNotice::TryFailed {
                lock_id: self.lock_id.clone(),
                requester,
                level,
            });
            return Ok(());
        }
        let ctx = LockContext::try_lock(
            self.lock_id.clone(),
            requester.node,
            requester.thread,
            level,
            timer,
        );
        let mut entry = Entry::new(ctx);
        entry.timer = Some(self.schedule(requester, TimerKind::TryLock, timer, ids, effects));
        self.pending.push_back(entry);
        Ok(())
    }

    /// Drop a hold and grant what the FIFO rule allows.
    pub fn release(
        &mut self,
        requester: Requester,
        effects: &mut LockEffects,
    ) -> CoherenceResult<()> {
        let Some(pos) = self.holders.iter().position(|e| e.requester() == requester) else {
            return Err(CoherenceError::NotHolder {
                lock_id: self.lock_id.clone(),
                node: requester.node,
            });
        };
        self.holders.remove(pos);
        self.process_pending(effects);
        Ok(())
    }

    /// Move the sole write holder to the waiter set.
    ///
    /// A zero timer waits until notified.
    pub fn wait(
        &mut self,
        requester: Requester,
        timer: TimerSpec,
        ids: &TimerIdGen,
        arm_timer: bool,
        effects: &mut LockEffects,
    ) -> CoherenceResult<()> {
        let pos = self.write_holder_position(requester, "wait")?;
        let holder = self.holders.remove(pos);
        let mut entry = Entry::new(holder.ctx.with_type(LockType::Waiter, Some(timer)));
        if arm_timer && !timer.is_zero() {
            entry.timer = Some(self.schedule(requester, TimerKind::Wait, timer, ids, effects));
        }
        self.waiters.push(entry);
        self.process_pending(effects);
        Ok(())
    }

    /// Move the earliest waiter, or every waiter, to the front of the
    /// pending queue. Only the write holder may notify.
    ///
    /// Returns the notified requesters in their original wait order.
    pub fn notify(
        &mut self,
        requester: Requester,
        all: bool,
        effects: &mut LockEffects,
    ) -> CoherenceResult<Vec<Requester>> {
        self.write_holder_position(requester, "notify")?;
        let count = if all { self.waiters.len() } else { self.waiters.len().min(1) };
        let notified: Vec<Entry> = self.waiters.drain(..count).collect();
        let requesters = notified.iter().map(Entry::requester).collect();
        for waiter in notified.into_iter().rev() {
            self.move_to_pending_front(waiter, effects);
        }
        Ok(requesters)
    }

    /// Wake a waiter without a notify, putting it at the front of the queue.
    ///
    /// Returns false when `requester` is not waiting.
    pub fn interrupt(&mut self, requester: Requester, effects: &mut LockEffects) -> bool {
        let Some(pos) = self.waiters.iter().position(|e| e.requester() == requester) else {
            return false;
        };
        let waiter = self.waiters.remove(pos);
        self.move_to_pending_front(waiter, effects);
        self.process_pending(effects);
        true
    }

    /// Ask every holder node to relinquish the lock.
    pub fn recall(&self, effects: &mut LockEffects) {
        let mut seen = BTreeSet::new();
        for holder in &self.holders {
            let node = holder.ctx.node();
            if seen.insert(node) {
                effects.notices.push(LockNotice::Recall {
                    lock_id: self.lock_id.clone(),
                    node,
                    level: holder.ctx.level(),
                });
            }
        }
    }

    /// Handle an elapsed timer. Keys whose id no longer matches a live entry
    /// are ignored.
    pub fn timer_fired(&mut self, key: &TimerKey, effects: &mut LockEffects) {
        match key.kind {
            TimerKind::TryLock => {
                let Some(pos) = self
                    .pending
                    .iter()
                    .position(|e| e.requester() == key.requester && e.timer == Some(key.id))
                else {
                    return;
                };
                if let Some(entry) = self.pending.remove(pos) {
                    effects.notices.push(LockNotice::TryFailed {
                        lock_id: self.lock_id.clone(),
                        requester: key.requester,
                        level: entry.ctx.level(),
                    });
                }
                self.process_pending(effects);
            }
            TimerKind::Wait => {
                let Some(pos) = self
                    .waiters
                    .iter()
                    .position(|e| e.requester() == key.requester && e.timer == Some(key.id))
                else {
                    return;
                };
                let waiter = self.waiters.remove(pos);
                effects.notices.push(LockNotice::WaitTimedOut {
                    lock_id: self.lock_id.clone(),
                    requester: key.requester,
                });
                let ctx = waiter.ctx.with_type(LockType::Pending, None);
                if self.holders.is_empty() && self.pending.is_empty() {
                    self.award(ctx, effects);
                } else {
                    self.pending.push_back(Entry::new(ctx));
                    self.process_pending(effects);
                }
            }
        }
    }

    /// Remove every entry belonging to `node` and grant what becomes
    /// available. Returns whether the lock is now empty.
    pub fn clear_node(&mut self, node: NodeId, effects: &mut LockEffects) -> bool {
        let mut cancel = |entry: &Entry| {
            if let Some(id) = entry.timer {
                effects.cancelled.push(id);
            }
        };
        self.holders.retain(|e| e.ctx.node() != node);
        self.pending.retain(|e| {
            let keep = e.ctx.node() != node;
            if !keep {
                cancel(e);
            }
            keep
        });
        self.waiters.retain(|e| {
            let keep = e.ctx.node() != node;
            if !keep {
                cancel(e);
            }
            keep
        });
        self.process_pending(effects);
        self.is_empty()
    }

    /// Re-create a context reported by a reconnecting client.
    ///
    /// Identical existing contexts are left alone. A request the client
    /// still reports as pending but that was granted before the connection
    /// dropped gets its grant re-sent. A hold that conflicts with a
    /// different existing holder is a protocol violation.
    pub fn reestablish(
        &mut self,
        ctx: LockContext,
        ids: &TimerIdGen,
        arm_timers: bool,
        effects: &mut LockEffects,
    ) -> CoherenceResult<()> {
        let requester = ctx.requester();
        if self.find(requester).is_some_and(|existing| existing == &ctx) {
            return Ok(());
        }
        let requested = matches!(ctx.lock_type(), LockType::Pending | LockType::TryPending);
        if requested && self.held_level(requester) == Some(ctx.level()) {
            effects.notices.push(LockNotice::Granted {
                lock_id: self.lock_id.clone(),
                requester,
                level: ctx.level(),
            });
            return Ok(());
        }
        if let Some(existing) = self.find(requester) {
            return Err(CoherenceError::protocol(
                requester.node,
                format!("reestablish {} conflicts with existing {}", ctx, existing),
            ));
        }
        match ctx.lock_type() {
            LockType::Holder => {
                if !self.can_award(ctx.level()) {
                    return Err(CoherenceError::protocol(
                        requester.node,
                        format!("cannot reestablish {}: lock held incompatibly", ctx),
                    ));
                }
                self.holders.push(Entry::new(ctx));
            }
            LockType::Pending => {
                self.pending.push_back(Entry::new(ctx));
            }
            LockType::TryPending => {
                let timer = ctx.timer().unwrap_or(TimerSpec::ZERO);
                let mut entry = Entry::new(ctx);
                if arm_timers && !timer.is_zero() {
                    let key = self.schedule(requester, TimerKind::TryLock, timer, ids, effects);
                    entry.timer = Some(key);
                }
                self.pending.push_back(entry);
            }
            LockType::Waiter => {
                let timer = ctx.timer().unwrap_or(TimerSpec::ZERO);
                let mut entry = Entry::new(ctx);
                if arm_timers && !timer.is_zero() {
                    let key = self.schedule(requester, TimerKind::Wait, timer, ids, effects);
                    entry.timer = Some(key);
                }
                self.waiters.push(entry);
            }
        }
        Ok(())
    }

    /// Schedule timers for entries that were re-established without one.
    pub fn arm_timers(&mut self, ids: &TimerIdGen, effects: &mut LockEffects) {
        let lock_id = self.lock_id.clone();
        let mut arm = |entry: &mut Entry, kind: TimerKind| {
            let spec = entry.ctx.timer().unwrap_or(TimerSpec::ZERO);
            if entry.timer.is_none() && !spec.is_zero() {
                let key = TimerKey {
                    id: ids.next(),
                    lock_id: lock_id.clone(),
                    requester: entry.requester(),
                    kind,
                };
                entry.timer = Some(key.id);
                effects.scheduled.push((key, spec));
            }
        };
        for entry in self.pending.iter_mut() {
            if entry.ctx.lock_type() == LockType::TryPending {
                arm(entry, TimerKind::TryLock);
            }
        }
        for entry in self.waiters.iter_mut() {
            arm(entry, TimerKind::Wait);
        }
    }

    /// Grant from the head of the pending queue while the level rules allow.
    pub fn process_pending(&mut self, effects: &mut LockEffects) {
        while let Some(head) = self.pending.front() {
            if !self.can_award(head.ctx.level()) {
                break;
            }
            if let Some(entry) = self.pending.pop_front() {
                if let Some(id) = entry.timer {
                    effects.cancelled.push(id);
                }
                self.award(entry.ctx, effects);
            }
        }
    }

    /// Wait-for edges: (blocked requester, holder it waits on).
    pub fn wait_for_edges(&self) -> Vec<(Requester, Requester)> {
        let mut edges = Vec::new();
        for blocked in self.pending.iter().chain(self.waiters.iter()) {
            for holder in &self.holders {
                if blocked.requester() != holder.requester() {
                    edges.push((blocked.requester(), holder.requester()));
                }
            }
        }
        edges
    }

    fn can_award(&self, level: LockLevel) -> bool {
        self.holders
            .iter()
            .all(|h| h.ctx.level().is_compatible_with(level))
    }

    fn award(&mut self, pending: LockContext, effects: &mut LockEffects) {
        let holder = pending.with_type(LockType::Holder, None);
        effects.notices.push(LockNotice::Granted {
            lock_id: self.lock_id.clone(),
            requester: holder.requester(),
            level: holder.level(),
        });
        self.holders.push(Entry::new(holder));
    }

    fn move_to_pending_front(&mut self, waiter: Entry, effects: &mut LockEffects) {
        if let Some(id) = waiter.timer {
            effects.cancelled.push(id);
        }
        let ctx = waiter.ctx.with_type(LockType::Pending, None);
        self.pending.push_front(Entry::new(ctx));
    }

    fn schedule(
        &self,
        requester: Requester,
        kind: TimerKind,
        timer: TimerSpec,
        ids: &TimerIdGen,
        effects: &mut LockEffects,
    ) -> TimerId {
        let key = TimerKey {
            id: ids.next(),
            lock_id: self.lock_id.clone(),
            requester,
            kind,
        };
        let id = key.id;
        effects.scheduled.push((key, timer));
        id
    }

    fn find(&self, requester: Requester) -> Option<&LockContext> {
        self.holders
            .iter()
            .chain(self.pending.iter())
            .chain(self.waiters.iter())
            .find(|e| e.requester() == requester)
            .map(|e| &e.ctx)
    }

    fn write_holder_position(&self, requester: Requester, op: &str) -> CoherenceResult<usize> {
        let Some(pos) = self.holders.iter().position(|e| e.requester() == requester) else {
            return Err(CoherenceError::IllegalMonitorState {
                lock_id: self.lock_id.clone(),
                message: format!("{} called by {} without holding the lock", op, requester),
            });
        };
        if !self.holders[pos].ctx.level().is_write() {
            return Err(CoherenceError::IllegalMonitorState {
                lock_id: self.lock_id.clone(),
                message: format!(
                    "{} called by {} holding {}",
                    op,
                    requester,
                    self.holders[pos].ctx.level()
                ),
            });
        }
        Ok(pos)
    }

    fn validate_new_request(&self, requester: Requester, level: LockLevel) -> CoherenceResult<()> {
        let Some(existing) = self.find(requester) else {
            return Ok(());
        };
        let message = match existing.lock_type() {
            LockType::Holder if existing.level().is_shared() && level.is_write() => {
                format!("lock upgrade from {} to {} is not supported", existing.level(), level)
            }
            LockType::Holder => format!("requesting already held lock {}", existing),
            LockType::Pending | LockType::TryPending => {
                format!("duplicate request, already queued as {}", existing)
            }
            LockType::Waiter => format!("requester is waiting on {}", self.lock_id),
        };
        Err(CoherenceError::protocol(requester.node, message))
    }
}
