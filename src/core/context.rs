//! Process-wide node context.
//!
//! Built once at startup and handed to every component that records
//! operator events, updates metrics or reads the clock.

use crate::core::time::{Clock, ManualClock, SystemClock, Tick};
use crate::ops::events::{OperatorEvent, OperatorEventLog};
use crate::ops::metrics::MetricsRegistry;
use std::sync::Arc;

/// Shared services for one server or client process.
#[derive(Clone)]
pub struct NodeContext {
    node_name: Arc<str>,
    clock: Arc<dyn Clock>,
    events: Arc<OperatorEventLog>,
    metrics: Arc<MetricsRegistry>,
}

impl NodeContext {
    /// Create a context.
    pub fn new(node_name: impl Into<String>, clock: Arc<dyn Clock>, event_capacity: usize) -> Self {
        let node_name: String = node_name.into();
        Self {
            events: Arc::new(OperatorEventLog::new(node_name.clone(), event_capacity)),
            node_name: node_name.into(),
            clock,
            metrics: Arc::new(MetricsRegistry::new()),
        }
    }

    /// Context backed by the system clock.
    pub fn system(node_name: impl Into<String>, event_capacity: usize) -> Self {
        Self::new(node_name, Arc::new(SystemClock), event_capacity)
    }

    /// Context backed by a manual clock, returned alongside it.
    pub fn manual(node_name: impl Into<String>) -> (Self, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(Tick::zero()));
        (Self::new(node_name, clock.clone(), 1_000), clock)
    }

    /// Node name.
    pub fn node_name(&self) -> &str {
        &self.node_name
    }

    /// Current time.
    pub fn now(&self) -> Tick {
        self.clock.now()
    }

    /// Clock handle.
    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Operator event log.
    pub fn events(&self) -> &OperatorEventLog {
        &self.events
    }

    /// Metrics registry.
    pub fn metrics(&self) -> &MetricsRegistry {
        &self.metrics
    }

    /// Record an operator event stamped with the current time.
    pub fn record(&self, event: OperatorEvent) {
        self.events.record(event, self.clock.now());
    }
}

impl std::fmt::Debug for NodeContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeContext")
            .field("node_name", &self.node_name)
            .field("now", &self.clock.now())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops::events::EventKind;

    #[test]
    fn test_record_uses_clock() {
        let (ctx, clock) = NodeContext::manual("server-a");
        clock.advance(250);
        ctx.record(OperatorEvent::new(EventKind::ServerStarted, "up"));
        let event = &ctx.events().recent(1)[0];
        assert_eq!(event.at, Tick::new(250));
        assert_eq!(event.source, "server-a");
    }

    #[test]
    fn test_clones_share_services() {
        let (ctx, _) = NodeContext::manual("s");
        let other = ctx.clone();
        other.metrics().counter_inc("x");
        assert_eq!(ctx.metrics().counter_get("x"), 1);
    }
}
