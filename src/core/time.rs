//! Time utilities.
//!
//! The coherence core never samples wall-clock time inside a state machine.
//! Components receive a [`Tick`] from a [`Clock`] at their boundary, and
//! bounded operations (`try_request`, `wait`) carry a [`TimerSpec`] that the
//! lock timer scheduler turns into a callback.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// A millisecond instant.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Tick {
    /// Milliseconds since an epoch (implementation-defined).
    pub ms: u64,
}

impl Tick {
    /// Create a new tick with the given millisecond value.
    pub const fn new(ms: u64) -> Self {
        Self { ms }
    }

    /// Create a tick representing zero (epoch start).
    pub const fn zero() -> Self {
        Self { ms: 0 }
    }

    /// Add milliseconds to this tick.
    pub const fn add_ms(self, ms: u64) -> Self {
        Self {
            ms: self.ms.saturating_add(ms),
        }
    }

    /// Check if this tick is at or after the given deadline.
    pub const fn is_at_or_after(self, deadline: Tick) -> bool {
        self.ms >= deadline.ms
    }

    /// Milliseconds until a deadline.
    ///
    /// Returns 0 if the deadline has already passed.
    pub fn ms_until(self, deadline: Tick) -> u64 {
        deadline.ms.saturating_sub(self.ms)
    }
}

impl std::fmt::Display for Tick {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Tick({}ms)", self.ms)
    }
}

/// Timer specification carried by `try_request` and `wait`.
///
/// Expressed as whole milliseconds plus a nanosecond remainder, matching the
/// wire representation used by clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TimerSpec {
    /// Whole milliseconds.
    pub millis: u64,
    /// Nanosecond remainder (`< 1_000_000`).
    pub nanos: u32,
}

impl TimerSpec {
    /// A zero timer.
    ///
    /// For `wait` this means "wait until notified"; for `try_request` it means
    /// "grant now or fail now".
    pub const ZERO: TimerSpec = TimerSpec {
        millis: 0,
        nanos: 0,
    };

    /// Create a timer spec, normalising an oversized nanosecond remainder.
    pub fn new(millis: u64, nanos: u32) -> Self {
        let carry = u64::from(nanos / 1_000_000);
        Self {
            millis: millis.saturating_add(carry),
            nanos: nanos % 1_000_000,
        }
    }

    /// Create a timer spec from milliseconds.
    pub const fn from_millis(millis: u64) -> Self {
        Self { millis, nanos: 0 }
    }

    /// Whether both parts are zero.
    pub const fn is_zero(&self) -> bool {
        self.millis == 0 && self.nanos == 0
    }

    /// Convert to a [`Duration`].
    pub fn to_duration(&self) -> Duration {
        Duration::from_millis(self.millis) + Duration::from_nanos(u64::from(self.nanos))
    }

    /// Deadline reached from `now`, rounding the nanosecond remainder up.
    pub fn deadline_from(&self, now: Tick) -> Tick {
        let extra = if self.nanos > 0 { 1 } else { 0 };
        now.add_ms(self.millis.saturating_add(extra))
    }
}

impl std::fmt::Display for TimerSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}ms+{}ns", self.millis, self.nanos)
    }
}

// ============================================================================
// Clocks
// ============================================================================

/// Source of the current [`Tick`].
pub trait Clock: Send + Sync {
    /// Current time.
    fn now(&self) -> Tick;
}

/// Wall-clock backed clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Tick {
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;
        Tick::new(now)
    }
}

/// Manually advanced clock for deterministic tests and simulations.
#[derive(Debug, Default)]
pub struct ManualClock {
    ms: AtomicU64,
}

impl ManualClock {
    /// Create a manual clock starting at `start`.
    pub fn new(start: Tick) -> Self {
        Self {
            ms: AtomicU64::new(start.ms),
        }
    }

    /// Advance the clock by `ms` milliseconds and return the new time.
    pub fn advance(&self, ms: u64) -> Tick {
        Tick::new(self.ms.fetch_add(ms, Ordering::AcqRel) + ms)
    }

    /// Set the clock to an absolute value.
    pub fn set(&self, tick: Tick) {
        self.ms.store(tick.ms, Ordering::Release);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Tick {
        Tick::new(self.ms.load(Ordering::Acquire))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timer_spec_normalises_nanos() {
        let spec = TimerSpec::new(5, 2_500_000);
        assert_eq!(spec.millis, 7);
        assert_eq!(spec.nanos, 500_000);
    }

    #[test]
    fn test_timer_spec_deadline_rounds_up() {
        let now = Tick::new(100);
        assert_eq!(TimerSpec::from_millis(50).deadline_from(now), Tick::new(150));
        assert_eq!(TimerSpec::new(50, 1).deadline_from(now), Tick::new(151));
    }

    #[test]
    fn test_manual_clock_advance() {
        let clock = ManualClock::new(Tick::new(10));
        assert_eq!(clock.now(), Tick::new(10));
        assert_eq!(clock.advance(5), Tick::new(15));
        clock.set(Tick::zero());
        assert_eq!(clock.now(), Tick::zero());
    }

    #[test]
    fn test_tick_ms_until() {
        assert_eq!(Tick::new(10).ms_until(Tick::new(25)), 15);
        assert_eq!(Tick::new(30).ms_until(Tick::new(25)), 0);
    }
}
