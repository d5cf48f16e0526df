//! Lock timers.
//!
//! `try_request` and `wait` are bounded by a [`TimerSpec`]. Instead of
//! blocking, the lock manager registers a [`TimerKey`] with a
//! [`TimerScheduler`]; when the timer elapses the scheduler hands the key back
//! through a channel and the owner calls `LockManager::timer_fired`.
//!
//! Each key carries a unique [`TimerId`]. A lock entry remembers the id of its
//! live timer, so a key that fires after the entry was granted, cancelled or
//! re-queued no longer matches and is ignored.

use crate::core::time::{Tick, TimerSpec};
use crate::model::lock::{LockId, Requester};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Unique id of one scheduled timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TimerId(pub u64);

/// What a timer bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    /// A try-lock pending entry.
    TryLock,
    /// A waiter.
    Wait,
}

/// Identifies the lock entry a timer belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TimerKey {
    /// Timer id.
    pub id: TimerId,
    /// Lock the entry lives on.
    pub lock_id: LockId,
    /// Requester owning the entry.
    pub requester: Requester,
    /// Entry kind.
    pub kind: TimerKind,
}

/// Allocates timer ids.
#[derive(Debug, Default)]
pub struct TimerIdGen {
    next: AtomicU64,
}

impl TimerIdGen {
    /// Next unused id.
    pub fn next(&self) -> TimerId {
        TimerId(self.next.fetch_add(1, Ordering::Relaxed) + 1)
    }
}

/// Schedules timer callbacks.
pub trait TimerScheduler: Send + Sync {
    /// Arrange for `key` to fire after `after` elapses.
    fn schedule(&self, key: TimerKey, after: TimerSpec);

    /// Cancel a scheduled timer. Cancelling an unknown or fired id is a no-op.
    fn cancel(&self, id: TimerId);
}

/// Scheduler backed by tokio sleeps.
///
/// Fired keys are sent on an unbounded channel; the receiver half is drained
/// by the server runtime.
pub struct TokioTimerScheduler {
    tx: mpsc::UnboundedSender<TimerKey>,
    tasks: Mutex<HashMap<TimerId, JoinHandle<()>>>,
}

impl TokioTimerScheduler {
    /// Create a scheduler and the receiver for fired keys.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<TimerKey>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                tx,
                tasks: Mutex::new(HashMap::new()),
            },
            rx,
        )
    }

    /// Number of timers not yet fired or cancelled.
    pub fn active(&self) -> usize {
        let mut tasks = self.tasks.lock();
        tasks.retain(|_, handle| !handle.is_finished());
        tasks.len()
    }
}

impl TimerScheduler for TokioTimerScheduler {
    fn schedule(&self, key: TimerKey, after: TimerSpec) {
        let id = key.id;
        let tx = self.tx.clone();
        let delay = after.to_duration();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(key);
        });
        let mut tasks = self.tasks.lock();
        tasks.retain(|_, handle| !handle.is_finished());
        tasks.insert(id, handle);
    }

    fn cancel(&self, id: TimerId) {
        if let Some(handle) = self.tasks.lock().remove(&id) {
            handle.abort();
        }
    }
}

/// Deterministic scheduler driven by explicit ticks.
///
/// Used by tests and simulations: nothing fires until [`ManualTimerScheduler::advance_to`]
/// is called.
#[derive(Debug, Default)]
pub struct ManualTimerScheduler {
    inner: Mutex<ManualState>,
}

#[derive(Debug, Default)]
struct ManualState {
    now: Tick,
    due: BTreeMap<(Tick, TimerId), TimerKey>,
    by_id: HashMap<TimerId, Tick>,
}

impl ManualTimerScheduler {
    /// Create a scheduler at tick zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Current tick.
    pub fn now(&self) -> Tick {
        self.inner.lock().now
    }

    /// Number of pending timers.
    pub fn pending(&self) -> usize {
        self.inner.lock().due.len()
    }

    /// Move time forward and return the keys that fired, earliest first.
    pub fn advance_to(&self, now: Tick) -> Vec<TimerKey> {
        let mut inner = self.inner.lock();
        if now > inner.now {
            inner.now = now;
        }
        let mut fired = Vec::new();
        loop {
            let Some(&(deadline, id)) = inner.due.keys().next() else {
                break;
            };
            if !inner.now.is_at_or_after(deadline) {
                break;
            }
            if let Some(key) = inner.due.remove(&(deadline, id)) {
                inner.by_id.remove(&id);
                fired.push(key);
            }
        }
        fired
    }

    /// Advance by `ms` milliseconds.
    pub fn advance(&self, ms: u64) -> Vec<TimerKey> {
        let target = self.now().add_ms(ms);
        self.advance_to(target)
    }
}

impl TimerScheduler for ManualTimerScheduler {
    fn schedule(&self, key: TimerKey, after: TimerSpec) {
        let mut inner = self.inner.lock();
        let deadline = after.deadline_from(inner.now);
        inner.by_id.insert(key.id, deadline);
        inner.due.insert((deadline, key.id), key);
    }

    fn cancel(&self, id: TimerId) {
        let mut inner = self.inner.lock();
        if let Some(deadline) = inner.by_id.remove(&id) {
            inner.due.remove(&(deadline, id));
        }
    }
}
