//! Client lock table.
//!
//! Mirrors, per (lock, thread), what the server believes about this client:
//! held, pending, try-pending or waiting. The table is the source of the
//! lock contexts carried by every handshake, so a reconnect re-creates the
//! server's view exactly. Requests made while the connection is paused are
//! recorded here and reach the server through the next handshake.

use crate::core::error::{CoherenceError, CoherenceResult};
use crate::core::time::TimerSpec;
use crate::handshake::client::HandshakeObserver;
use crate::locks::deadlock::DeadlockChain;
use crate::model::lock::{LockContext, LockId, LockLevel, ThreadId};
use crate::model::node::NodeId;
use crate::protocol::messages::{HandshakeRequest, LockMode, LockRequest, LockResponse};
use parking_lot::Mutex;
use std::collections::BTreeMap;

/// Local status of one (lock, thread).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocalLockStatus {
    /// Granted.
    Held,
    /// Blocking request outstanding.
    Pending,
    /// Bounded request outstanding.
    TryPending(TimerSpec),
    /// Parked in `wait`.
    Waiting(TimerSpec),
}

#[derive(Debug, Clone, Copy)]
struct LocalLock {
    level: LockLevel,
    status: LocalLockStatus,
    recalled: bool,
}

/// What a server lock response meant for the application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockOutcome {
    /// The thread now holds the lock.
    Granted {
        lock_id: LockId,
        thread: ThreadId,
        level: LockLevel,
    },
    /// A try-lock failed.
    TryFailed { lock_id: LockId, thread: ThreadId },
    /// A wait timed out; the thread is contending again.
    WaitTimedOut { lock_id: LockId, thread: ThreadId },
    /// The thread's request is part of a deadlock.
    Deadlocked {
        lock_id: LockId,
        thread: ThreadId,
        chain: DeadlockChain,
    },
    /// A response for a (lock, thread) the table does not know.
    Unexpected { lock_id: LockId, thread: ThreadId },
}

/// Client-side lock state.
#[derive(Debug)]
pub struct ClientLockTable {
    node: NodeId,
    entries: Mutex<BTreeMap<(LockId, ThreadId), LocalLock>>,
}

impl ClientLockTable {
    /// Empty table for `node`.
    pub fn new(node: NodeId) -> Self {
        Self {
            node,
            entries: Mutex::new(BTreeMap::new()),
        }
    }

    /// Record a blocking request.
    pub fn request(
        &self,
        lock_id: &LockId,
        thread: ThreadId,
        level: LockLevel,
    ) -> CoherenceResult<LockRequest> {
        self.insert(lock_id, thread, level, LocalLockStatus::Pending)?;
        Ok(self.message(lock_id, thread, level, LockMode::Acquire, None))
    }

    /// Record a bounded request.
    pub fn try_request(
        &self,
        lock_id: &LockId,
        thread: ThreadId,
        level: LockLevel,
        timer: TimerSpec,
    ) -> CoherenceResult<LockRequest> {
        self.insert(lock_id, thread, level, LocalLockStatus::TryPending(timer))?;
        Ok(self.message(lock_id, thread, level, LockMode::TryAcquire, Some(timer)))
    }

    /// Drop a hold.
    pub fn release(&self, lock_id: &LockId, thread: ThreadId) -> CoherenceResult<LockRequest> {
        let mut entries = self.entries.lock();
        let key = (lock_id.clone(), thread);
        match entries.get(&key) {
            Some(local) if local.status == LocalLockStatus::Held => {
                let level = local.level;
                entries.remove(&key);
                Ok(self.message(lock_id, thread, level, LockMode::Release, None))
            }
            _ => Err(CoherenceError::NotHolder {
                lock_id: lock_id.clone(),
                node: self.node,
            }),
        }
    }

    /// Park a write holder in `wait`.
    pub fn wait(
        &self,
        lock_id: &LockId,
        thread: ThreadId,
        timer: TimerSpec,
    ) -> CoherenceResult<LockRequest> {
        let mut entries = self.entries.lock();
        let local = self.write_holder(&mut entries, lock_id, thread, "wait")?;
        local.status = LocalLockStatus::Waiting(timer);
        let level = local.level;
        Ok(self.message(lock_id, thread, level, LockMode::Wait, Some(timer)))
    }

    /// Wake one or all waiters.
    pub fn notify(
        &self,
        lock_id: &LockId,
        thread: ThreadId,
        all: bool,
    ) -> CoherenceResult<LockRequest> {
        let mut entries = self.entries.lock();
        let level = self.write_holder(&mut entries, lock_id, thread, "notify")?.level;
        let mode = if all {
            LockMode::NotifyAll
        } else {
            LockMode::Notify
        };
        Ok(self.message(lock_id, thread, level, mode, None))
    }

    /// Wake one of this node's waiting threads without a notify.
    pub fn interrupt(&self, lock_id: &LockId, thread: ThreadId) -> CoherenceResult<LockRequest> {
        let entries = self.entries.lock();
        match entries.get(&(lock_id.clone(), thread)) {
            Some(local) if matches!(local.status, LocalLockStatus::Waiting(_)) => {
                Ok(self.message(lock_id, thread, local.level, LockMode::Interrupt, None))
            }
            _ => Err(CoherenceError::IllegalMonitorState {
                lock_id: lock_id.clone(),
                message: format!("{} is not waiting", thread),
            }),
        }
    }

    /// Apply a server lock response.
    pub fn on_response(&self, response: &LockResponse) -> LockOutcome {
        let lock_id = response.lock_id.clone();
        let thread = response.thread;
        let mut entries = self.entries.lock();
        let Some(local) = entries.get_mut(&(lock_id.clone(), thread)) else {
            tracing::debug!(lock = %lock_id, thread = %thread, "lock response for unknown entry");
            return LockOutcome::Unexpected { lock_id, thread };
        };

        if let Some(chain) = &response.deadlock_chain {
            return LockOutcome::Deadlocked {
                lock_id,
                thread,
                chain: chain.clone(),
            };
        }
        if response.granted {
            local.status = LocalLockStatus::Held;
            if let Some(level) = response.level {
                local.level = level;
            }
            return LockOutcome::Granted {
                lock_id,
                thread,
                level: local.level,
            };
        }
        if response.timed_out {
            match local.status {
                LocalLockStatus::TryPending(_) => {
                    entries.remove(&(lock_id.clone(), thread));
                    return LockOutcome::TryFailed { lock_id, thread };
                }
                LocalLockStatus::Waiting(_) => {
                    local.status = LocalLockStatus::Pending;
                    return LockOutcome::WaitTimedOut { lock_id, thread };
                }
                LocalLockStatus::Held | LocalLockStatus::Pending => {}
            }
        }
        LockOutcome::Unexpected { lock_id, thread }
    }

    /// Mark every local hold of `lock_id` recalled. Returns the holding
    /// threads, which should release as soon as they can.
    pub fn recall(&self, lock_id: &LockId) -> Vec<ThreadId> {
        let mut entries = self.entries.lock();
        entries
            .iter_mut()
            .filter(|((id, _), local)| id == lock_id && local.status == LocalLockStatus::Held)
            .map(|((_, thread), local)| {
                local.recalled = true;
                *thread
            })
            .collect()
    }

    /// Whether a hold of `lock_id` by `thread` was recalled.
    pub fn is_recalled(&self, lock_id: &LockId, thread: ThreadId) -> bool {
        self.entries
            .lock()
            .get(&(lock_id.clone(), thread))
            .is_some_and(|l| l.recalled)
    }

    /// Local status of (lock, thread).
    pub fn status(&self, lock_id: &LockId, thread: ThreadId) -> Option<LocalLockStatus> {
        self.entries
            .lock()
            .get(&(lock_id.clone(), thread))
            .map(|l| l.status)
    }

    /// Whether `thread` holds `lock_id`.
    pub fn is_held(&self, lock_id: &LockId, thread: ThreadId) -> bool {
        self.status(lock_id, thread) == Some(LocalLockStatus::Held)
    }

    /// Number of tracked entries.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Check if nothing is tracked.
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    fn insert(
        &self,
        lock_id: &LockId,
        thread: ThreadId,
        level: LockLevel,
        status: LocalLockStatus,
    ) -> CoherenceResult<()> {
        let mut entries = self.entries.lock();
        let key = (lock_id.clone(), thread);
        if let Some(existing) = entries.get(&key) {
            return Err(CoherenceError::IllegalMonitorState {
                lock_id: lock_id.clone(),
                message: format!("{} already has a {:?} entry", thread, existing.status),
            });
        }
        entries.insert(
            key,
            LocalLock {
                level,
                status,
                recalled: false,
            },
        );
        Ok(())
    }

    fn write_holder<'a>(
        &self,
        entries: &'a mut BTreeMap<(LockId, ThreadId), LocalLock>,
        lock_id: &LockId,
        thread: ThreadId,
        op: &str,
    ) -> CoherenceResult<&'a mut LocalLock> {
        match entries.get_mut(&(lock_id.clone(), thread)) {
            Some(local) if local.status == LocalLockStatus::Held && local.level.is_write() => {
                Ok(local)
            }
            _ => Err(CoherenceError::IllegalMonitorState {
                lock_id: lock_id.clone(),
                message: format!("{} by {} without a write hold", op, thread),
            }),
        }
    }

    fn message(
        &self,
        lock_id: &LockId,
        thread: ThreadId,
        level: LockLevel,
        mode: LockMode,
        timer: Option<TimerSpec>,
    ) -> LockRequest {
        LockRequest {
            lock_id: lock_id.clone(),
            node: self.node,
            thread,
            level,
            mode,
            timer,
        }
    }
}

impl HandshakeObserver for ClientLockTable {
    fn initialize_handshake(&self, request: &mut HandshakeRequest) {
        for ((lock_id, thread), local) in self.entries.lock().iter() {
            let (lock_id, node, thread, level) = (lock_id.clone(), self.node, *thread, local.level);
            match local.status {
                LocalLockStatus::Held => request
                    .held_locks
                    .push(LockContext::holder(lock_id, node, thread, level)),
                LocalLockStatus::Pending => request
                    .pending_locks
                    .push(LockContext::pending(lock_id, node, thread, level)),
                LocalLockStatus::TryPending(timer) => request
                    .pending_try_locks
                    .push(LockContext::try_lock(lock_id, node, thread, level, timer)),
                LocalLockStatus::Waiting(timer) => request
                    .waiting_locks
                    .push(LockContext::wait(lock_id, node, thread, level, timer)),
            }
        }
    }

    fn reset(&self) {
        let dropped = std::mem::take(&mut *self.entries.lock());
        if !dropped.is_empty() {
            tracing::warn!(
                node = %self.node,
                entries = dropped.len(),
                "server lost lock state; local lock table cleared"
            );
        }
    }

    fn shutdown(&self) {
        self.entries.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn granted(lock: &str, thread: u64, level: LockLevel) -> LockResponse {
        LockResponse {
            lock_id: LockId::from(lock),
            thread: ThreadId(thread),
            level: Some(level),
            granted: true,
            timed_out: false,
            deadlock_chain: None,
        }
    }

    fn timed_out(lock: &str, thread: u64) -> LockResponse {
        LockResponse {
            granted: false,
            timed_out: true,
            level: None,
            ..granted(lock, thread, LockLevel::Write)
        }
    }

    #[test]
    fn test_request_then_grant() {
        let table = ClientLockTable::new(NodeId::client(1));
        let l = LockId::from("L");
        let msg = table.request(&l, ThreadId(1), LockLevel::Write).unwrap();
        assert_eq!(msg.mode, LockMode::Acquire);
        assert_eq!(table.status(&l, ThreadId(1)), Some(LocalLockStatus::Pending));
        assert!(table.request(&l, ThreadId(1), LockLevel::Write).is_err());
        assert!(matches!(
            table.on_response(&granted("L", 1, LockLevel::Write)),
            LockOutcome::Granted { .. }
        ));
        assert!(table.is_held(&l, ThreadId(1)));
        assert_eq!(table.release(&l, ThreadId(1)).unwrap().mode, LockMode::Release);
        assert!(table.is_empty());
    }

    #[test]
    fn test_try_and_wait_timeouts_are_told_apart() {
        let table = ClientLockTable::new(NodeId::client(1));
        let l = LockId::from("L");
        table
            .try_request(&l, ThreadId(1), LockLevel::Write, TimerSpec::from_millis(5))
            .unwrap();
        assert!(matches!(table.on_response(&timed_out("L", 1)), LockOutcome::TryFailed { .. }));
        assert!(table.status(&l, ThreadId(1)).is_none());

        table.request(&l, ThreadId(2), LockLevel::Write).unwrap();
        table.on_response(&granted("L", 2, LockLevel::Write));
        table.wait(&l, ThreadId(2), TimerSpec::from_millis(5)).unwrap();
        assert!(matches!(table.on_response(&timed_out("L", 2)), LockOutcome::WaitTimedOut { .. }));
        assert_eq!(table.status(&l, ThreadId(2)), Some(LocalLockStatus::Pending));
    }

    #[test]
    fn test_wait_requires_write_hold() {
        let table = ClientLockTable::new(NodeId::client(1));
        let l = LockId::from("L");
        table.request(&l, ThreadId(1), LockLevel::Read).unwrap();
        table.on_response(&granted("L", 1, LockLevel::Read));
        assert!(matches!(
            table.wait(&l, ThreadId(1), TimerSpec::ZERO),
            Err(CoherenceError::IllegalMonitorState { .. })
        ));
        assert!(table.notify(&l, ThreadId(1), true).is_err());
        assert!(matches!(
            table.release(&LockId::from("other"), ThreadId(1)),
            Err(CoherenceError::NotHolder { .. })
        ));
    }

    #[test]
    fn test_handshake_carries_every_context() {
        let node = NodeId::client(3);
        let table = ClientLockTable::new(node);
        let timer = TimerSpec::from_millis(100);
        table.request(&LockId::from("held"), ThreadId(1), LockLevel::Write).unwrap();
        table.on_response(&granted("held", 1, LockLevel::Write));
        table.request(&LockId::from("queued"), ThreadId(2), LockLevel::Read).unwrap();
        table
            .try_request(&LockId::from("bounded"), ThreadId(3), LockLevel::Write, timer)
            .unwrap();
        table.request(&LockId::from("mon"), ThreadId(4), LockLevel::Write).unwrap();
        table.on_response(&granted("mon", 4, LockLevel::Write));
        table.wait(&LockId::from("mon"), ThreadId(4), timer).unwrap();

        let mut request = HandshakeRequest::default();
        table.initialize_handshake(&mut request);
        assert_eq!(
            request.held_locks,
            vec![LockContext::holder(LockId::from("held"), node, ThreadId(1), LockLevel::Write)]
        );
        assert_eq!(request.pending_locks.len(), 1);
        assert_eq!(
            request.pending_try_locks,
            vec![LockContext::try_lock(
                LockId::from("bounded"),
                node,
                ThreadId(3),
                LockLevel::Write,
                timer
            )]
        );
        assert_eq!(request.waiting_locks.len(), 1);
    }

    #[test]
    fn test_recall_marks_holders() {
        let table = ClientLockTable::new(NodeId::client(1));
        let l = LockId::from("L");
        for t in 1..=2 {
            table.request(&l, ThreadId(t), LockLevel::Read).unwrap();
            table.on_response(&granted("L", t, LockLevel::Read));
        }
        assert_eq!(table.recall(&l), vec![ThreadId(1), ThreadId(2)]);
        assert!(table.is_recalled(&l, ThreadId(1)));
        table.reset();
        assert!(table.is_empty());
    }
}
