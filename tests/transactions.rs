//! Transaction ordering and fan-out tests.

mod common;

use common::{Peer, TestService};
use coherence::model::lock::{LockContext, LockId, LockLevel, ThreadId};
use coherence::model::object::{ChangeSet, ObjectChange, ObjectId};
use coherence::model::txn::{ClientTransaction, TransactionId};
use coherence::protocol::messages::{
    ClientMessage, LockMode, RejectReason, ServerMessage, TransactionBatch,
};
use coherence::server::service::SessionOpen;

fn connect(svc: &TestService, peer: &mut Peer) {
    assert_eq!(
        peer.open(&svc.service, peer.hello()),
        SessionOpen::Connected(vec![peer.node])
    );
    peer.drain();
}

fn commit(ids: &[u64], lock: &str, changes: Vec<ObjectChange>) -> ClientMessage {
    ClientMessage::Transactions(TransactionBatch {
        transactions: ids
            .iter()
            .map(|id| {
                let changes = ChangeSet::new(changes.clone());
                ClientTransaction::new(TransactionId(*id), ThreadId(1), changes)
                    .with_lock(LockId::from(lock))
            })
            .collect(),
    })
}

fn acked(messages: &[ServerMessage]) -> Vec<TransactionId> {
    messages
        .iter()
        .filter_map(|m| match m {
            ServerMessage::TransactionAck(ids) => Some(ids.clone()),
            _ => None,
        })
        .flatten()
        .collect()
}

fn watermarks(messages: &[ServerMessage]) -> Vec<TransactionId> {
    messages
        .iter()
        .filter_map(|m| match m {
            ServerMessage::LowWaterMark(mark) => Some(mark.watermark),
            _ => None,
        })
        .collect()
}

#[test]
fn interleaved_writers_get_one_global_order() {
    let svc = TestService::new(1_000);
    let mut a = Peer::new(1, 1);
    let mut b = Peer::new(2, 2);
    connect(&svc, &mut a);
    connect(&svc, &mut b);
    svc.service
        .handle(a.node, a.lock("LA", 1, LockLevel::Write, LockMode::Acquire))
        .unwrap();
    svc.service
        .handle(b.node, b.lock("LB", 1, LockLevel::Write, LockMode::Acquire))
        .unwrap();

    for round in 1..=5u64 {
        let mine = vec![ObjectChange::update(ObjectId(round), vec![])];
        let theirs = vec![ObjectChange::update(ObjectId(100 + round), vec![])];
        svc.service.handle(a.node, commit(&[round], "LA", mine)).unwrap();
        svc.service.handle(b.node, commit(&[round], "LB", theirs)).unwrap();
    }

    let applied = svc.applier.applied();
    assert_eq!(applied.len(), 10);
    for pair in applied.windows(2) {
        assert!(pair[0].0 < pair[1].0, "global order must increase");
    }
    let from_a: Vec<_> = applied
        .iter()
        .filter(|(_, s)| s.source == a.node)
        .map(|(_, s)| s.client_txn)
        .collect();
    assert_eq!(from_a, (1..=5).map(TransactionId).collect::<Vec<_>>());

    let marks = watermarks(&a.drain());
    assert_eq!(marks.len(), 5);
    for pair in marks.windows(2) {
        assert!(pair[0] < pair[1]);
    }
}

#[test]
fn resent_transactions_are_acknowledged_once_applied_once() {
    let svc = TestService::new(5_000);
    let mut a = Peer::new(1, 1);
    connect(&svc, &mut a);
    svc.service
        .handle(a.node, a.lock("L", 1, LockLevel::Write, LockMode::Acquire))
        .unwrap();
    svc.service
        .handle(a.node, commit(&[1, 2], "L", vec![ObjectChange::update(ObjectId(1), vec![1])]))
        .unwrap();
    let first = a.drain();
    assert_eq!(acked(&first), vec![TransactionId(1), TransactionId(2)]);
    assert_eq!(watermarks(&first), vec![TransactionId(3)]);

    // The connection drops before the client sees the ack.
    svc.service.connection_closed(a.node, a.connection);
    let mut back = a.reconnect(2);
    let mut hello = back.hello();
    hello.unacknowledged = vec![TransactionId(1), TransactionId(2), TransactionId(3)];
    hello.held_locks = vec![LockContext::holder(
        LockId::from("L"),
        a.node,
        ThreadId(1),
        LockLevel::Write,
    )];
    back.open(&svc.service, hello);
    back.drain();

    svc.service
        .handle(
            back.node,
            commit(&[1, 2, 3], "L", vec![ObjectChange::update(ObjectId(1), vec![2])]),
        )
        .unwrap();
    let resent = back.drain();
    assert_eq!(
        acked(&resent),
        vec![TransactionId(1), TransactionId(2), TransactionId(3)]
    );
    assert_eq!(watermarks(&resent), vec![TransactionId(4)]);
    assert_eq!(svc.applier.applied().len(), 3);
}

#[test]
fn readers_receive_updates_and_evictions_before_the_writer_is_acked() {
    let svc = TestService::new(1_000);
    let mut writer = Peer::new(1, 1);
    let mut reader = Peer::new(2, 2);
    let mut bystander = Peer::new(3, 3);
    for peer in [&mut writer, &mut reader, &mut bystander] {
        connect(&svc, peer);
    }
    svc.service
        .handle(reader.node, ClientMessage::AddReferences(vec![ObjectId(1), ObjectId(2)]))
        .unwrap();
    svc.service
        .handle(writer.node, writer.lock("L", 1, LockLevel::Write, LockMode::Acquire))
        .unwrap();
    writer.drain();

    svc.service
        .handle(
            writer.node,
            commit(
                &[1],
                "L",
                vec![
                    ObjectChange::update(ObjectId(1), b"new".to_vec()),
                    ObjectChange::remove(ObjectId(2)),
                ],
            ),
        )
        .unwrap();

    let pushed = reader.drain();
    assert!(matches!(
        &pushed[0],
        ServerMessage::Changes(changes) if changes.touched_ids().contains(&ObjectId(1))
    ));
    assert!(matches!(
        &pushed[1],
        ServerMessage::Invalidation(push) if push.members == vec![ObjectId(2)]
    ));
    assert!(bystander.drain().is_empty());
    assert_eq!(acked(&writer.drain()), vec![TransactionId(1)]);

    // The writer now caches what it wrote, except what it removed.
    let registry = svc.service.registry();
    assert!(registry.has_reference(writer.node, ObjectId(1)));
    assert!(!registry.has_reference(writer.node, ObjectId(2)));
    assert!(!registry.has_reference(reader.node, ObjectId(2)));
}

#[test]
fn a_rejected_batch_changes_nothing_anywhere() {
    let svc = TestService::new(1_000);
    let mut writer = Peer::new(1, 1);
    let mut reader = Peer::new(2, 2);
    connect(&svc, &mut writer);
    connect(&svc, &mut reader);
    svc.service
        .handle(reader.node, ClientMessage::AddReferences(vec![ObjectId(10)]))
        .unwrap();

    // The first transaction needs no lock; the second names one nobody holds.
    let batch = ClientMessage::Transactions(TransactionBatch {
        transactions: vec![
            ClientTransaction::new(
                TransactionId(1),
                ThreadId(1),
                ChangeSet::new(vec![ObjectChange::remove(ObjectId(10))]),
            ),
            ClientTransaction::new(TransactionId(2), ThreadId(1), ChangeSet::default())
                .with_lock(LockId::from("unheld")),
        ],
    });
    let err = svc.service.handle(writer.node, batch).unwrap_err();
    assert!(err.is_fatal());
    assert!(svc.applier.applied().is_empty());
    assert!(reader.drain().is_empty());
    assert!(svc.service.registry().has_reference(reader.node, ObjectId(10)));
}

#[test]
fn commit_without_the_lock_tears_the_session_down() {
    let svc = TestService::new(1_000);
    let mut a = Peer::new(1, 1);
    connect(&svc, &mut a);
    svc.service
        .handle(a.node, a.lock("held", 1, LockLevel::Write, LockMode::Acquire))
        .unwrap();
    svc.service
        .handle(a.node, commit(&[1], "held", vec![]))
        .unwrap();
    let err = svc
        .service
        .handle(a.node, commit(&[2], "other", vec![]))
        .unwrap_err();
    assert!(err.is_fatal());
    assert_eq!(svc.applier.applied().len(), 1);

    svc.service.report_error(a.node, &err);
    assert!(matches!(
        a.drain().last(),
        Some(ServerMessage::Error { fatal: true, .. })
    ));
    assert!(!svc.service.handshake().is_connected(a.node));
    assert!(svc.service.locks().contexts_for_node(a.node).is_empty());

    // Coming back with the old session's locks and transactions is refused.
    let mut stale = a.reconnect(2);
    let mut hello = stale.hello();
    hello.held_locks = vec![LockContext::holder(
        LockId::from("held"),
        a.node,
        ThreadId(1),
        LockLevel::Write,
    )];
    hello.unacknowledged = vec![TransactionId(1), TransactionId(2)];
    assert_eq!(stale.open(&svc.service, hello), SessionOpen::Rejected);
    assert!(matches!(
        stale.drain().as_slice(),
        [ServerMessage::HandshakeAck(ack)]
            if ack.rejection == Some(RejectReason::ReconnectWindowExpired)
    ));
    assert!(svc.service.locks().contexts_for_node(a.node).is_empty());
    assert_eq!(svc.applier.applied().len(), 1);

    // A fresh session starts over.
    let mut fresh = a.reconnect(3);
    connect(&svc, &mut fresh);
    svc.service
        .handle(fresh.node, fresh.lock("held", 1, LockLevel::Write, LockMode::Acquire))
        .unwrap();
    svc.service
        .handle(fresh.node, commit(&[1], "held", vec![]))
        .unwrap();
    assert_eq!(acked(&fresh.drain()), vec![TransactionId(1)]);
    assert_eq!(svc.applier.applied().len(), 2);
}
