//! Lock manager tests.

mod common;

use common::{manual_manager, req};
use coherence::core::time::TimerSpec;
use coherence::locks::lock::LockNotice;
use coherence::locks::manager::ManagerState;
use coherence::model::lock::{LockContext, LockId, LockLevel, Requester, ThreadId};
use coherence::model::node::NodeId;

fn grants(notices: &[LockNotice]) -> Vec<Requester> {
    notices
        .iter()
        .filter_map(|n| match n {
            LockNotice::Granted { requester, .. } => Some(*requester),
            _ => None,
        })
        .collect()
}

// ============================================================================
// Arbitration
// ============================================================================

#[test]
fn first_writer_holds_second_queues_then_inherits() {
    let (mgr, sink, _) = manual_manager();
    let l1 = LockId::from("L1");
    let (a, b) = (req(1, 1), req(2, 1));

    mgr.request(&l1, a, LockLevel::Write).unwrap();
    mgr.request(&l1, b, LockLevel::Write).unwrap();
    assert_eq!(grants(&sink.take()), vec![a]);

    let snapshot = mgr.query_lock(&l1).unwrap();
    assert_eq!(snapshot.holders.len(), 1);
    assert_eq!(snapshot.holders[0].requester(), a);
    assert_eq!(snapshot.pending[0].requester(), b);

    mgr.release(&l1, a).unwrap();
    assert_eq!(grants(&sink.take()), vec![b]);
    assert_eq!(mgr.held_level(&l1, b), Some(LockLevel::Write));
}

#[test]
fn waiters_are_granted_in_arrival_order() {
    let (mgr, sink, _) = manual_manager();
    let l = LockId::from("fifo");
    mgr.request(&l, req(1, 1), LockLevel::Write).unwrap();
    for client in 2..=5 {
        mgr.request(&l, req(client, 1), LockLevel::Write).unwrap();
    }
    sink.take();

    let mut order = Vec::new();
    let mut holder = req(1, 1);
    for _ in 2..=5 {
        mgr.release(&l, holder).unwrap();
        let granted = grants(&sink.take());
        assert_eq!(granted.len(), 1);
        holder = granted[0];
        order.push(holder.node);
    }
    assert_eq!(
        order,
        (2..=5).map(NodeId::client).collect::<Vec<_>>()
    );
}

#[test]
fn readers_share_but_never_with_a_writer() {
    let (mgr, sink, _) = manual_manager();
    let l = LockId::from("rw");
    mgr.request(&l, req(1, 1), LockLevel::Read).unwrap();
    mgr.request(&l, req(2, 1), LockLevel::Concurrent).unwrap();
    mgr.request(&l, req(3, 1), LockLevel::Write).unwrap();
    // Queued behind the writer even though it is compatible with the holders.
    mgr.request(&l, req(4, 1), LockLevel::Read).unwrap();
    assert_eq!(grants(&sink.take()), vec![req(1, 1), req(2, 1)]);

    mgr.release(&l, req(1, 1)).unwrap();
    assert!(grants(&sink.take()).is_empty());
    mgr.release(&l, req(2, 1)).unwrap();
    assert_eq!(grants(&sink.take()), vec![req(3, 1)]);
    mgr.release(&l, req(3, 1)).unwrap();
    assert_eq!(grants(&sink.take()), vec![req(4, 1)]);
}

#[test]
fn exclusion_holds_across_a_long_interleaving() {
    let (mgr, _sink, _) = manual_manager();
    let locks = [LockId::from("a"), LockId::from("b"), LockId::from("c")];
    let levels = [
        LockLevel::Read,
        LockLevel::Write,
        LockLevel::Concurrent,
        LockLevel::SynchronousWrite,
    ];
    let mut state: u64 = 0x5eed;
    let mut step = || {
        state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
        (state >> 33) as usize
    };

    for _ in 0..2_000 {
        let lock = &locks[step() % locks.len()];
        let requester = req((step() % 6) as u64 + 1, (step() % 2) as u64);
        if mgr.held_level(lock, requester).is_some() {
            mgr.release(lock, requester).unwrap();
        } else if !mgr
            .contexts_for_node(requester.node)
            .iter()
            .any(|c| c.requester() == requester && c.lock_id() == lock)
        {
            mgr.request(lock, requester, levels[step() % levels.len()]).unwrap();
        }

        for lock in &locks {
            let Some(snapshot) = mgr.query_lock(lock) else {
                continue;
            };
            let writers = snapshot.holders.iter().filter(|h| h.level().is_write()).count();
            assert!(writers <= 1, "two write holders on {}", lock);
            if writers == 1 {
                assert_eq!(snapshot.holders.len(), 1, "writer shares {}", lock);
            }
        }
    }
}

// ============================================================================
// Try-lock, wait and notify
// ============================================================================

#[test]
fn try_lock_times_out_through_the_scheduler() {
    let (mgr, sink, timers) = manual_manager();
    let l = LockId::from("try");
    mgr.request(&l, req(1, 1), LockLevel::Write).unwrap();
    mgr.try_request(&l, req(2, 1), LockLevel::Write, TimerSpec::from_millis(50))
        .unwrap();
    sink.take();

    assert!(timers.advance(49).is_empty());
    for key in timers.advance(1) {
        mgr.timer_fired(&key);
    }
    assert!(matches!(
        sink.take().as_slice(),
        [LockNotice::TryFailed { requester, .. }] if *requester == req(2, 1)
    ));

    mgr.release(&l, req(1, 1)).unwrap();
    assert!(grants(&sink.take()).is_empty());
    assert!(mgr.query_lock(&l).is_none());
}

#[test]
fn notified_waiter_reacquires_before_queued_requests() {
    let (mgr, sink, _) = manual_manager();
    let l = LockId::from("monitor");
    let (owner, other, late) = (req(1, 1), req(2, 1), req(3, 1));

    mgr.request(&l, owner, LockLevel::Write).unwrap();
    mgr.wait(&l, owner, TimerSpec::ZERO).unwrap();
    mgr.request(&l, other, LockLevel::Write).unwrap();
    assert_eq!(grants(&sink.take()), vec![owner, other]);

    mgr.request(&l, late, LockLevel::Write).unwrap();
    assert_eq!(mgr.notify(&l, other, false).unwrap(), vec![owner]);
    mgr.release(&l, other).unwrap();
    assert_eq!(grants(&sink.take()), vec![owner]);
}

#[test]
fn wait_timeout_recontends_for_the_lock() {
    let (mgr, sink, timers) = manual_manager();
    let l = LockId::from("monitor");
    let owner = req(1, 1);
    mgr.request(&l, owner, LockLevel::Write).unwrap();
    mgr.wait(&l, owner, TimerSpec::from_millis(100)).unwrap();
    sink.take();

    for key in timers.advance(100) {
        mgr.timer_fired(&key);
    }
    let notices = sink.take();
    assert!(matches!(notices[0], LockNotice::WaitTimedOut { .. }));
    assert_eq!(grants(&notices), vec![owner]);
}

#[test]
fn wait_without_write_hold_is_illegal() {
    let (mgr, _, _) = manual_manager();
    let l = LockId::from("monitor");
    mgr.request(&l, req(1, 1), LockLevel::Read).unwrap();
    let err = mgr.wait(&l, req(1, 1), TimerSpec::ZERO).unwrap_err();
    assert_eq!(err.kind(), "IllegalMonitorState");
    let err = mgr.notify(&l, req(2, 1), true).unwrap_err();
    assert_eq!(err.kind(), "IllegalMonitorState");
}

// ============================================================================
// Deadlocks, recall, node cleanup
// ============================================================================

#[test]
fn crossed_waits_form_a_two_hop_chain() {
    let (mgr, _, _) = manual_manager();
    let (l1, l2) = (LockId::from("L1"), LockId::from("L2"));
    let a_t1 = Requester::new(NodeId::client(1), ThreadId(1));
    let b_t2 = Requester::new(NodeId::client(2), ThreadId(2));

    mgr.request(&l1, a_t1, LockLevel::Write).unwrap();
    mgr.request(&l2, b_t2, LockLevel::Write).unwrap();
    mgr.request(&l2, a_t1, LockLevel::Write).unwrap();
    mgr.request(&l1, b_t2, LockLevel::Write).unwrap();

    let chains = mgr.detect_deadlocks();
    assert_eq!(chains.len(), 1);
    let hops = &chains[0].hops;
    assert_eq!(hops.len(), 2);
    assert_eq!((hops[0].waiter, hops[0].lock_id.as_str(), hops[0].holder), (a_t1, "L2", b_t2));
    assert_eq!((hops[1].waiter, hops[1].lock_id.as_str(), hops[1].holder), (b_t2, "L1", a_t1));
}

#[test]
fn recall_notifies_each_holder_node_once() {
    let (mgr, sink, _) = manual_manager();
    let l = LockId::from("shared");
    mgr.request(&l, req(1, 1), LockLevel::Read).unwrap();
    mgr.request(&l, req(1, 2), LockLevel::Read).unwrap();
    mgr.request(&l, req(2, 1), LockLevel::Read).unwrap();
    sink.take();

    assert_eq!(mgr.recall(&l).unwrap(), 2);
    let nodes: Vec<_> = sink.take().iter().map(LockNotice::node).collect();
    assert_eq!(nodes, vec![NodeId::client(1), NodeId::client(2)]);
}

#[test]
fn departed_node_releases_and_dequeues_everything() {
    let (mgr, sink, _) = manual_manager();
    let (l1, l2) = (LockId::from("L1"), LockId::from("L2"));
    mgr.request(&l1, req(1, 1), LockLevel::Write).unwrap();
    mgr.request(&l1, req(2, 1), LockLevel::Write).unwrap();
    mgr.request(&l2, req(3, 1), LockLevel::Write).unwrap();
    mgr.request(&l2, req(1, 2), LockLevel::Write).unwrap();
    sink.take();

    mgr.clear_state_for_node(NodeId::client(1));
    assert_eq!(grants(&sink.take()), vec![req(2, 1)]);
    assert!(mgr.contexts_for_node(NodeId::client(1)).is_empty());
    assert_eq!(mgr.stats().pending, 0);
}

// ============================================================================
// Lifecycle
// ============================================================================

#[test]
fn starting_manager_rebuilds_holds_before_serving() {
    let (ctx, _) = coherence::core::context::NodeContext::manual("test");
    let sink = std::sync::Arc::new(coherence::locks::manager::CollectingSink::new());
    let timers = std::sync::Arc::new(coherence::locks::timer::ManualTimerScheduler::new());
    let mgr = coherence::locks::manager::LockManager::starting(ctx, timers, sink.clone());
    let l = LockId::from("L");
    assert_eq!(mgr.state(), ManagerState::Starting);

    mgr.request(&l, req(2, 1), LockLevel::Write).unwrap();
    let holder = |client| {
        LockContext::holder(l.clone(), NodeId::client(client), ThreadId(1), LockLevel::Write)
    };
    mgr.reestablish(holder(1)).unwrap();
    // Same context again is accepted silently.
    mgr.reestablish(holder(1)).unwrap();
    let conflict = mgr.reestablish(holder(3)).unwrap_err();
    assert!(conflict.is_fatal());

    mgr.start().unwrap();
    assert!(mgr.is_started());
    assert_eq!(mgr.held_level(&l, req(1, 1)), Some(LockLevel::Write));
    assert!(grants(&sink.take()).is_empty());
    mgr.release(&l, req(1, 1)).unwrap();
    assert_eq!(grants(&sink.take()), vec![req(2, 1)]);
}
