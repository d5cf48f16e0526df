//! Deadlock detection over the wait-for graph.
//!
//! An edge `a -> b` labelled `L` means requester `a` is pending or waiting on
//! lock `L` while `b` holds it. Strongly connected components of two or more
//! requesters contain at least one cycle; for each such component one cycle
//! is extracted by depth-first search starting at the component's smallest
//! requester, so repeated scans over the same state report the same chain.
//! A requester that just queued is checked on its own with a search that
//! starts and ends at it.
//!
//! Self-edges are never added: a requester cannot block itself.

use super::lock::LockSnapshot;
use crate::model::lock::{LockId, LockType, Requester};
use petgraph::algo::tarjan_scc;
use petgraph::graph::{DiGraph, EdgeIndex, NodeIndex};
use petgraph::visit::EdgeRef;
use petgraph::Direction;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashSet};

/// One step of a circular wait.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeadlockHop {
    /// Requester that is blocked.
    pub waiter: Requester,
    /// Lock it is blocked on.
    pub lock_id: LockId,
    /// Requester holding that lock.
    pub holder: Requester,
}

/// An ordered cycle of hops; the last hop's holder is the first hop's waiter.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeadlockChain {
    /// Hops in cycle order.
    pub hops: Vec<DeadlockHop>,
}

impl DeadlockChain {
    /// Number of hops.
    pub fn len(&self) -> usize {
        self.hops.len()
    }

    /// Check if the chain has no hops.
    pub fn is_empty(&self) -> bool {
        self.hops.is_empty()
    }

    /// Requesters participating in the cycle, in cycle order.
    pub fn requesters(&self) -> Vec<Requester> {
        self.hops.iter().map(|hop| hop.waiter).collect()
    }

    /// Locks participating in the cycle, in cycle order.
    pub fn locks(&self) -> Vec<&LockId> {
        self.hops.iter().map(|hop| &hop.lock_id).collect()
    }
}

impl std::fmt::Display for DeadlockChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for (i, hop) in self.hops.iter().enumerate() {
            if i > 0 {
                write!(f, " -> ")?;
            }
            write!(
                f,
                "({},{},{}) -> ({},{})",
                hop.waiter.node, hop.waiter.thread, hop.lock_id, hop.holder.node, hop.holder.thread
            )?;
        }
        Ok(())
    }
}

/// Wait-for graph assembled from lock snapshots.
#[derive(Debug, Default)]
pub struct WaitForGraph {
    edges: BTreeSet<(Requester, Requester, LockId)>,
}

impl WaitForGraph {
    /// Create an empty graph.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add one edge. Self-edges are dropped.
    pub fn add_edge(&mut self, waiter: Requester, holder: Requester, lock_id: LockId) {
        if waiter != holder {
            self.edges.insert((waiter, holder, lock_id));
        }
    }

    /// Add the edges implied by one lock: every pending entry and waiter
    /// waits on every holder.
    pub fn add_lock(&mut self, snapshot: &LockSnapshot) {
        for blocked in snapshot.pending.iter().chain(snapshot.waiters.iter()) {
            debug_assert!(blocked.lock_type() != LockType::Holder);
            for holder in &snapshot.holders {
                self.add_edge(
                    blocked.requester(),
                    holder.requester(),
                    snapshot.lock_id.clone(),
                );
            }
        }
    }

    /// Number of edges.
    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    /// Find one cycle per strongly connected component of size two or more.
    pub fn find_deadlocks(&self) -> Vec<DeadlockChain> {
        let (graph, _) = self.build();
        let mut chains: Vec<DeadlockChain> = tarjan_scc(&graph)
            .into_iter()
            .filter(|component| component.len() >= 2)
            .filter_map(|component| {
                let members: HashSet<NodeIndex> = component.iter().copied().collect();
                let start = component.iter().copied().min_by_key(|idx| graph[*idx])?;
                let path = find_cycle(&graph, start, &members)?;
                Some(chain_from(&graph, path))
            })
            .collect();
        chains.sort_by(|a, b| a.hops[0].waiter.cmp(&b.hops[0].waiter));
        chains
    }

    /// A cycle that starts and ends at `requester`, if one exists.
    ///
    /// Unlike [`find_deadlocks`](Self::find_deadlocks) this finds the cycle a
    /// new wait closed even when its component already held another cycle.
    pub fn cycle_through(&self, requester: Requester) -> Option<DeadlockChain> {
        let (graph, indices) = self.build();
        let start = *indices.get(&requester)?;
        let members: HashSet<NodeIndex> = graph.node_indices().collect();
        let path = find_cycle(&graph, start, &members)?;
        Some(chain_from(&graph, path))
    }

    fn build(&self) -> (DiGraph<Requester, LockId>, BTreeMap<Requester, NodeIndex>) {
        let mut graph: DiGraph<Requester, LockId> = DiGraph::new();
        let mut indices: BTreeMap<Requester, NodeIndex> = BTreeMap::new();

        for (waiter, holder, _) in &self.edges {
            for requester in [waiter, holder] {
                if !indices.contains_key(requester) {
                    let idx = graph.add_node(*requester);
                    indices.insert(*requester, idx);
                }
            }
        }
        for (waiter, holder, lock_id) in &self.edges {
            if let (Some(&from), Some(&to)) = (indices.get(waiter), indices.get(holder)) {
                graph.add_edge(from, to, lock_id.clone());
            }
        }
        (graph, indices)
    }
}

fn chain_from(graph: &DiGraph<Requester, LockId>, path: Vec<EdgeIndex>) -> DeadlockChain {
    let hops = path
        .into_iter()
        .filter_map(|edge| {
            let (from, to) = graph.edge_endpoints(edge)?;
            Some(DeadlockHop {
                waiter: graph[from],
                lock_id: graph[edge].clone(),
                holder: graph[to],
            })
        })
        .collect();
    DeadlockChain { hops }
}

fn sorted_out_edges(
    graph: &DiGraph<Requester, LockId>,
    node: NodeIndex,
    members: &HashSet<NodeIndex>,
) -> Vec<(EdgeIndex, NodeIndex)> {
    let mut out: Vec<_> = graph
        .edges_directed(node, Direction::Outgoing)
        .filter(|edge| members.contains(&edge.target()))
        .map(|edge| (edge.id(), edge.target()))
        .collect();
    out.sort_by(|a, b| {
        graph[a.1]
            .cmp(&graph[b.1])
            .then_with(|| graph[a.0].cmp(&graph[b.0]))
    });
    out
}

fn find_cycle(
    graph: &DiGraph<Requester, LockId>,
    start: NodeIndex,
    members: &HashSet<NodeIndex>,
) -> Option<Vec<EdgeIndex>> {
    let mut path = Vec::new();
    let mut visited = HashSet::new();
    visited.insert(start);
    if walk(graph, start, start, members, &mut visited, &mut path) {
        Some(path)
    } else {
        None
    }
}

fn walk(
    graph: &DiGraph<Requester, LockId>,
    node: NodeIndex,
    start: NodeIndex,
    members: &HashSet<NodeIndex>,
    visited: &mut HashSet<NodeIndex>,
    path: &mut Vec<EdgeIndex>,
) -> bool {
    for (edge, target) in sorted_out_edges(graph, node, members) {
        if target == start {
            path.push(edge);
            return true;
        }
        if visited.insert(target) {
            path.push(edge);
            if walk(graph, target, start, members, visited, path) {
                return true;
            }
            path.pop();
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::lock::ThreadId;
    use crate::model::node::NodeId;

    fn req(client: u64, thread: u64) -> Requester {
        Requester::new(NodeId::client(client), ThreadId(thread))
    }

    #[test]
    fn test_two_hop_cycle() {
        let mut graph = WaitForGraph::new();
        graph.add_edge(req(1, 1), req(2, 2), LockId::from("L2"));
        graph.add_edge(req(2, 2), req(1, 1), LockId::from("L1"));

        let chains = graph.find_deadlocks();
        assert_eq!(chains.len(), 1);
        let hops = &chains[0].hops;
        assert_eq!(hops.len(), 2);
        assert_eq!(hops[0].waiter, req(1, 1));
        assert_eq!(hops[0].lock_id.as_str(), "L2");
        assert_eq!(hops[0].holder, req(2, 2));
        assert_eq!(hops[1].waiter, req(2, 2));
        assert_eq!(hops[1].lock_id.as_str(), "L1");
        assert_eq!(hops[1].holder, req(1, 1));
    }

    #[test]
    fn test_no_cycle_in_chain_of_waits() {
        let mut graph = WaitForGraph::new();
        graph.add_edge(req(1, 1), req(2, 1), LockId::from("A"));
        graph.add_edge(req(2, 1), req(3, 1), LockId::from("B"));
        assert!(graph.find_deadlocks().is_empty());
    }

    #[test]
    fn test_self_edge_ignored() {
        let mut graph = WaitForGraph::new();
        graph.add_edge(req(1, 1), req(1, 1), LockId::from("A"));
        assert_eq!(graph.edge_count(), 0);
    }

    #[test]
    fn test_three_hop_cycle_and_separate_component() {
        let mut graph = WaitForGraph::new();
        graph.add_edge(req(1, 1), req(2, 1), LockId::from("A"));
        graph.add_edge(req(2, 1), req(3, 1), LockId::from("B"));
        graph.add_edge(req(3, 1), req(1, 1), LockId::from("C"));
        graph.add_edge(req(7, 1), req(8, 1), LockId::from("X"));
        graph.add_edge(req(8, 1), req(7, 1), LockId::from("Y"));

        let chains = graph.find_deadlocks();
        assert_eq!(chains.len(), 2);
        assert_eq!(chains[0].len(), 3);
        assert_eq!(chains[0].requesters(), vec![req(1, 1), req(2, 1), req(3, 1)]);
        assert_eq!(chains[1].len(), 2);
    }

    #[test]
    fn test_second_cycle_in_one_component_is_found_from_its_requester() {
        let mut graph = WaitForGraph::new();
        graph.add_edge(req(1, 1), req(2, 1), LockId::from("L2"));
        graph.add_edge(req(2, 1), req(1, 1), LockId::from("L1"));
        graph.add_edge(req(2, 1), req(3, 1), LockId::from("L1"));
        graph.add_edge(req(3, 1), req(2, 1), LockId::from("L2"));

        // One component, so the full scan reports one chain.
        assert_eq!(graph.find_deadlocks().len(), 1);
        let chain = graph.cycle_through(req(3, 1)).unwrap();
        assert_eq!(chain.requesters(), vec![req(3, 1), req(2, 1)]);
        assert_eq!(chain.hops[1].holder, req(3, 1));

        assert!(graph.cycle_through(req(9, 1)).is_none());
    }
}
