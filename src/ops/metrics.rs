//! Counters, gauges and health.
//!
//! Metric namespaces:
//! - coherence.locks.*
//! - coherence.txn.*
//! - coherence.sequence.*
//! - coherence.handshake.*
//! - coherence.registry.*
//! - coherence.stages.*

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// Metric names.
pub mod names {
    /// Locks currently tracked.
    pub const LOCKS_ACTIVE: &str = "coherence.locks.active";
    /// Grants delivered.
    pub const LOCKS_GRANTED: &str = "coherence.locks.granted_total";
    /// Try-locks that failed or timed out.
    pub const LOCKS_TRY_FAILED: &str = "coherence.locks.try_failed_total";
    /// Waits that timed out.
    pub const LOCKS_WAIT_TIMED_OUT: &str = "coherence.locks.wait_timed_out_total";
    /// Recall notices sent.
    pub const LOCKS_RECALLS: &str = "coherence.locks.recalls_total";
    /// Deadlock cycles found.
    pub const LOCKS_DEADLOCKS: &str = "coherence.locks.deadlocks_total";
    /// Transactions applied.
    pub const TXN_APPLIED: &str = "coherence.txn.applied_total";
    /// Resent transactions ignored as duplicates.
    pub const TXN_DUPLICATES: &str = "coherence.txn.duplicates_total";
    /// Transactions awaiting acknowledgement.
    pub const TXN_IN_FLIGHT: &str = "coherence.txn.in_flight";
    /// Invalidation pushes sent.
    pub const TXN_INVALIDATIONS: &str = "coherence.txn.invalidations_total";
    /// Batches granted by the sequence authority.
    pub const SEQUENCE_BATCHES: &str = "coherence.sequence.batches_total";
    /// Ids granted by the sequence authority.
    pub const SEQUENCE_IDS: &str = "coherence.sequence.ids_total";
    /// Completed handshakes.
    pub const HANDSHAKES_COMPLETED: &str = "coherence.handshake.completed_total";
    /// Rejected handshakes.
    pub const HANDSHAKES_REJECTED: &str = "coherence.handshake.rejected_total";
    /// Connected clients.
    pub const CLIENTS_CONNECTED: &str = "coherence.handshake.connected";
    /// Paused clients.
    pub const CLIENTS_PAUSED: &str = "coherence.handshake.paused";
    /// Object references tracked across all clients.
    pub const REGISTRY_REFERENCES: &str = "coherence.registry.references";
    /// Messages dispatched to stages.
    pub const STAGE_DISPATCHED: &str = "coherence.stages.dispatched_total";
    /// Messages held behind an incomplete handshake.
    pub const STAGE_HELD: &str = "coherence.stages.held_total";
}

/// Health result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthStatus {
    /// Overall healthy state.
    pub healthy: bool,
    /// Status message.
    pub message: String,
}

impl HealthStatus {
    /// Healthy status.
    pub fn healthy() -> Self {
        Self {
            healthy: true,
            message: "OK".to_string(),
        }
    }

    /// Unhealthy status with a reason.
    pub fn unhealthy(message: impl Into<String>) -> Self {
        Self {
            healthy: false,
            message: message.into(),
        }
    }
}

/// Metrics registry.
#[derive(Debug, Default)]
pub struct MetricsRegistry {
    counters: RwLock<HashMap<String, AtomicU64>>,
    gauges: RwLock<HashMap<String, AtomicU64>>,
    histograms: RwLock<HashMap<String, HistogramData>>,
}

impl MetricsRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Increment a counter.
    pub fn counter_inc(&self, name: &str) {
        self.counter_add(name, 1);
    }

    /// Add to a counter.
    pub fn counter_add(&self, name: &str, value: u64) {
        if let Some(counter) = self.counters.read().get(name) {
            counter.fetch_add(value, Ordering::Relaxed);
            return;
        }
        self.counters
            .write()
            .entry(name.to_string())
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(value, Ordering::Relaxed);
    }

    /// Counter value.
    pub fn counter_get(&self, name: &str) -> u64 {
        self.counters
            .read()
            .get(name)
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Set a gauge.
    pub fn gauge_set(&self, name: &str, value: u64) {
        if let Some(gauge) = self.gauges.read().get(name) {
            gauge.store(value, Ordering::Relaxed);
            return;
        }
        self.gauges
            .write()
            .entry(name.to_string())
            .or_insert_with(|| AtomicU64::new(0))
            .store(value, Ordering::Relaxed);
    }

    /// Increment a gauge.
    pub fn gauge_inc(&self, name: &str) {
        if let Some(gauge) = self.gauges.read().get(name) {
            gauge.fetch_add(1, Ordering::Relaxed);
            return;
        }
        self.gauges
            .write()
            .entry(name.to_string())
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(1, Ordering::Relaxed);
    }

    /// Decrement a gauge, saturating at zero.
    pub fn gauge_dec(&self, name: &str) {
        if let Some(gauge) = self.gauges.read().get(name) {
            let _ = gauge.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
                Some(v.saturating_sub(1))
            });
        }
    }

    /// Gauge value.
    pub fn gauge_get(&self, name: &str) -> u64 {
        self.gauges
            .read()
            .get(name)
            .map(|g| g.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Record a histogram observation.
    pub fn histogram_observe(&self, name: &str, value: f64) {
        self.histograms
            .write()
            .entry(name.to_string())
            .or_insert_with(HistogramData::new)
            .observe(value);
    }

    /// Histogram snapshot.
    pub fn histogram_get(&self, name: &str) -> Option<HistogramSnapshot> {
        self.histograms.read().get(name).map(HistogramData::snapshot)
    }

    /// Export in Prometheus text format, names sorted.
    pub fn export_prometheus(&self) -> String {
        let mut output = String::new();

        let counters = self.counters.read();
        let mut names: Vec<_> = counters.keys().collect();
        names.sort();
        for name in names {
            let prom = name.replace('.', "_");
            output.push_str(&format!(
                "# TYPE {} counter\n{} {}\n",
                prom,
                prom,
                counters[name].load(Ordering::Relaxed)
            ));
        }

        let gauges = self.gauges.read();
        let mut names: Vec<_> = gauges.keys().collect();
        names.sort();
        for name in names {
            let prom = name.replace('.', "_");
            output.push_str(&format!(
                "# TYPE {} gauge\n{} {}\n",
                prom,
                prom,
                gauges[name].load(Ordering::Relaxed)
            ));
        }

        let histograms = self.histograms.read();
        for (name, data) in histograms.iter() {
            let prom = name.replace('.', "_");
            let snapshot = data.snapshot();
            output.push_str(&format!(
                "# TYPE {} histogram\n{}_count {}\n{}_sum {}\n",
                prom, prom, snapshot.count, prom, snapshot.sum
            ));
        }

        output
    }
}

#[derive(Debug)]
struct HistogramData {
    count: AtomicU64,
    stats: Mutex<(f64, f64, f64)>,
}

impl HistogramData {
    fn new() -> Self {
        Self {
            count: AtomicU64::new(0),
            stats: Mutex::new((0.0, f64::MAX, f64::MIN)),
        }
    }

    fn observe(&self, value: f64) {
        self.count.fetch_add(1, Ordering::Relaxed);
        let mut stats = self.stats.lock();
        stats.0 += value;
        stats.1 = stats.1.min(value);
        stats.2 = stats.2.max(value);
    }

    fn snapshot(&self) -> HistogramSnapshot {
        let (sum, min, max) = *self.stats.lock();
        HistogramSnapshot {
            count: self.count.load(Ordering::Relaxed),
            sum,
            min,
            max,
        }
    }
}

/// Histogram snapshot.
#[derive(Debug, Clone)]
pub struct HistogramSnapshot {
    /// Observations.
    pub count: u64,
    /// Sum of observations.
    pub sum: f64,
    /// Smallest observation.
    pub min: f64,
    /// Largest observation.
    pub max: f64,
}

impl HistogramSnapshot {
    /// Mean observation.
    pub fn mean(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.sum / self.count as f64
        }
    }
}
