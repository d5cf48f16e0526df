//! Server-side lock management.
//!
//! - [`lock`] - Per-lock state machine (holders, pending, waiters)
//! - [`manager`] - Lock table, lifecycle, notice delivery
//! - [`timer`] - Try-lock and wait timers
//! - [`deadlock`] - Wait-for graph and cycle search

pub mod deadlock;
pub mod lock;
pub mod manager;
pub mod timer;

pub use deadlock::{DeadlockChain, DeadlockHop, WaitForGraph};
pub use lock::{LockEffects, LockNotice, LockSnapshot, ServerLock};
pub use manager::{CollectingSink, LockManager, LockNoticeSink, LockStats, ManagerState};
pub use timer::{ManualTimerScheduler, TimerKey, TimerKind, TimerScheduler, TokioTimerScheduler};
