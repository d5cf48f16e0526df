//! Transaction batch tracker.
//!
//! Accepts client transaction batches in per-node order, assigns each a
//! global acceptance order, hands it to the [`TransactionApplier`] and tracks
//! which transactions are durable. The per-node low-water mark is the lowest
//! client transaction id that is accepted but not yet durable (or one past
//! the highest accepted id when nothing is in flight). It never decreases.
//!
//! Resends of transactions that were already applied, or that lie below the
//! low-water mark, are acknowledged without being applied again. Any other
//! transaction whose id does not exceed the node's highest accepted id
//! arrived out of order, which is a protocol violation.

use crate::core::context::NodeContext;
use crate::core::error::{CoherenceError, CoherenceResult};
use crate::locks::manager::LockManager;
use crate::model::lock::Requester;
use crate::model::node::NodeId;
use crate::model::object::ChangeSet;
use crate::model::txn::{ClientTransaction, GlobalTransactionId, ServerTransactionId, TransactionId};
use crate::ops::metrics::names;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Whether an applied transaction is already durable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Durability {
    /// Durable on return.
    Durable,
    /// Durable later; the applier reports it via
    /// [`TransactionBatchTracker::mark_durable`].
    Deferred,
}

/// Applies accepted transactions to the shared object space.
pub trait TransactionApplier: Send + Sync {
    /// Apply one transaction.
    fn apply(&self, txn: &AppliedTransaction) -> CoherenceResult<Durability>;
}

/// Applier that records the acceptance order and is durable immediately.
#[derive(Debug, Default)]
pub struct RecordingApplier {
    applied: Mutex<Vec<(GlobalTransactionId, ServerTransactionId)>>,
}

impl RecordingApplier {
    /// Create an empty applier.
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything applied so far, in order.
    pub fn applied(&self) -> Vec<(GlobalTransactionId, ServerTransactionId)> {
        self.applied.lock().clone()
    }
}

impl TransactionApplier for RecordingApplier {
    fn apply(&self, txn: &AppliedTransaction) -> CoherenceResult<Durability> {
        self.applied.lock().push((txn.global, txn.server));
        Ok(Durability::Durable)
    }
}

/// Applier for servers whose object space lives elsewhere: logs each
/// transaction and reports it durable.
#[derive(Debug, Default)]
pub struct LoggingApplier;

impl TransactionApplier for LoggingApplier {
    fn apply(&self, txn: &AppliedTransaction) -> CoherenceResult<Durability> {
        tracing::debug!(
            txn = %txn.server,
            global = %txn.global,
            changes = txn.changes.len(),
            "applied"
        );
        Ok(Durability::Durable)
    }
}

/// A transaction accepted and applied by the tracker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppliedTransaction {
    /// Server ordering key.
    pub server: ServerTransactionId,
    /// Global acceptance order.
    pub global: GlobalTransactionId,
    /// Applied changes.
    pub changes: ChangeSet,
}

/// Outcome of one batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchOutcome {
    /// Newly applied transactions, in order.
    pub applied: Vec<AppliedTransaction>,
    /// Resends acknowledged without applying.
    pub duplicates: Vec<ServerTransactionId>,
    /// New low-water mark, if it moved.
    pub low_water_mark: Option<TransactionId>,
    /// Applier failure that stopped the batch. Transactions after the
    /// failing one were not applied and stay unacknowledged.
    pub apply_error: Option<String>,
}

impl BatchOutcome {
    /// Every transaction id the batch acknowledges.
    pub fn acknowledged(&self) -> Vec<TransactionId> {
        let mut ids: Vec<_> = self
            .applied
            .iter()
            .map(|t| t.server.client_txn)
            .chain(self.duplicates.iter().map(|s| s.client_txn))
            .collect();
        ids.sort();
        ids
    }
}

#[derive(Debug)]
struct NodeTxnState {
    highest_accepted: TransactionId,
    applied: BTreeSet<TransactionId>,
    in_flight: BTreeSet<TransactionId>,
    low_water: TransactionId,
}

impl NodeTxnState {
    fn new() -> Self {
        Self {
            highest_accepted: TransactionId::NULL,
            applied: BTreeSet::new(),
            in_flight: BTreeSet::new(),
            low_water: TransactionId::NULL.next(),
        }
    }

    fn is_applied(&self, id: TransactionId) -> bool {
        id < self.low_water || self.applied.contains(&id)
    }

    /// Recompute the low-water mark. Returns it if it moved.
    fn advance(&mut self) -> Option<TransactionId> {
        let candidate = self
            .in_flight
            .first()
            .copied()
            .unwrap_or_else(|| self.highest_accepted.next());
        if candidate <= self.low_water {
            return None;
        }
        self.low_water = candidate;
        self.applied = self.applied.split_off(&candidate);
        Some(candidate)
    }
}

/// Server-side transaction tracker.
pub struct TransactionBatchTracker {
    ctx: NodeContext,
    locks: Arc<LockManager>,
    applier: Arc<dyn TransactionApplier>,
    nodes: RwLock<HashMap<NodeId, Arc<Mutex<NodeTxnState>>>>,
    next_global: AtomicU64,
}

impl TransactionBatchTracker {
    /// Create a tracker.
    pub fn new(
        ctx: NodeContext,
        locks: Arc<LockManager>,
        applier: Arc<dyn TransactionApplier>,
    ) -> Self {
        Self {
            ctx,
            locks,
            applier,
            nodes: RwLock::new(HashMap::new()),
            next_global: AtomicU64::new(1),
        }
    }

    /// Start tracking a node. Existing state is kept.
    pub fn startup_node(&self, node: NodeId) {
        self.nodes
            .write()
            .entry(node)
            .or_insert_with(|| Arc::new(Mutex::new(NodeTxnState::new())));
    }

    /// Forget a departed node.
    pub fn shutdown_node(&self, node: NodeId) {
        if let Some(state) = self.nodes.write().remove(&node) {
            let in_flight = state.lock().in_flight.len() as u64;
            for _ in 0..in_flight {
                self.ctx.metrics().gauge_dec(names::TXN_IN_FLIGHT);
            }
        }
    }

    /// Whether `node` is tracked.
    pub fn is_tracked(&self, node: NodeId) -> bool {
        self.nodes.read().contains_key(&node)
    }

    /// Current low-water mark for `node`.
    pub fn low_water_mark(&self, node: NodeId) -> Option<TransactionId> {
        self.state(node).map(|s| s.lock().low_water)
    }

    /// Highest accepted id for `node`.
    pub fn highest_accepted(&self, node: NodeId) -> Option<TransactionId> {
        self.state(node).map(|s| s.lock().highest_accepted)
    }

    /// Of the ids a reconnecting client will resend, those already applied.
    pub fn already_applied(&self, node: NodeId, resend: &[TransactionId]) -> Vec<TransactionId> {
        let Some(state) = self.state(node) else {
            return Vec::new();
        };
        let state = state.lock();
        resend
            .iter()
            .copied()
            .filter(|id| state.is_applied(*id))
            .collect()
    }

    /// Accept, order and apply one batch from `node`.
    ///
    /// The whole batch is validated before anything is applied, so a
    /// protocol violation leaves no partial effect. If the applier fails
    /// part way through, the transactions applied before it are still
    /// returned and the failure is carried in [`BatchOutcome::apply_error`].
    pub fn receive_batch(
        &self,
        node: NodeId,
        batch: Vec<ClientTransaction>,
    ) -> CoherenceResult<BatchOutcome> {
        let state = self
            .state(node)
            .ok_or(CoherenceError::UnknownNode { node })?;
        let mut state = state.lock();
        let mut outcome = BatchOutcome::default();

        let mut accepted = Vec::with_capacity(batch.len());
        let mut highest = state.highest_accepted;
        for txn in batch {
            let server = ServerTransactionId::new(node, txn.id);
            if txn.id.is_null() {
                return Err(CoherenceError::protocol(node, "null transaction id"));
            }
            if txn.id <= highest {
                if txn.id <= state.highest_accepted && state.is_applied(txn.id) {
                    outcome.duplicates.push(server);
                    continue;
                }
                return Err(CoherenceError::protocol(
                    node,
                    format!("transaction {} arrived after {}", txn.id, highest),
                ));
            }
            self.check_locks(node, &txn)?;
            highest = txn.id;
            accepted.push(txn);
        }

        for server in &outcome.duplicates {
            self.ctx.metrics().counter_inc(names::TXN_DUPLICATES);
            tracing::debug!(txn = %server, "ignoring resent transaction");
        }

        for txn in accepted {
            let applied = AppliedTransaction {
                server: ServerTransactionId::new(node, txn.id),
                global: GlobalTransactionId(self.next_global.fetch_add(1, Ordering::AcqRel)),
                changes: txn.changes,
            };
            let durability = match self.applier.apply(&applied) {
                Ok(durability) => durability,
                Err(e) => {
                    tracing::warn!(txn = %applied.server, error = %e, "apply failed");
                    outcome.apply_error = Some(e.to_string());
                    break;
                }
            };
            state.highest_accepted = txn.id;
            state.applied.insert(txn.id);
            if durability == Durability::Deferred {
                state.in_flight.insert(txn.id);
                self.ctx.metrics().gauge_inc(names::TXN_IN_FLIGHT);
            }
            self.ctx.metrics().counter_inc(names::TXN_APPLIED);
            tracing::trace!(txn = %applied.server, global = %applied.global, "applied transaction");
            outcome.applied.push(applied);
        }

        outcome.low_water_mark = state.advance();
        Ok(outcome)
    }

    /// Record that a deferred transaction became durable. Returns the new
    /// low-water mark if it moved.
    pub fn mark_durable(&self, txn: ServerTransactionId) -> Option<TransactionId> {
        let state = self.state(txn.source)?;
        let mut state = state.lock();
        if !state.in_flight.remove(&txn.client_txn) {
            return None;
        }
        self.ctx.metrics().gauge_dec(names::TXN_IN_FLIGHT);
        state.advance()
    }

    fn check_locks(&self, node: NodeId, txn: &ClientTransaction) -> CoherenceResult<()> {
        let requester = Requester::new(node, txn.thread);
        for lock_id in &txn.lock_ids {
            if self.locks.held_level(lock_id, requester).is_none() {
                return Err(CoherenceError::protocol(
                    node,
                    format!(
                        "transaction {} requires {} which {} does not hold",
                        txn.id, lock_id, requester
                    ),
                ));
            }
        }
        Ok(())
    }

    fn state(&self, node: NodeId) -> Option<Arc<Mutex<NodeTxnState>>> {
        self.nodes.read().get(&node).cloned()
    }
}

impl std::fmt::Debug for TransactionBatchTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionBatchTracker")
            .field("nodes", &self.nodes.read().len())
            .field("next_global", &self.next_global.load(Ordering::Relaxed))
            .finish()
    }
}
