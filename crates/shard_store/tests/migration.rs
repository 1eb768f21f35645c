//! End-to-end partition migration scenarios over the in-process mesh.
//!
//! Covered here:
//! - single-record migration with full metadata fidelity (S1)
//! - a concurrent client write beating a retransmitted migration insert (S2)
//! - cluster-key advance aborting a migration mid-stream (S3)
//! - duplicate START idempotency (S6)
//! - at-most-once DONE observation under retransmitted DONEs
//! - cluster-key fencing and INSERT idempotency at the receiver

mod common;

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::time::Duration;

use common::{fast_config, install_record, int_bins, wait_until, TestCluster, IO_TIMEOUT};
use shard_fabric::{Channel, Fabric, NodeId};
use shard_store::migrate::EmigrationFlag;
use shard_store::msg::{FabricMsg, MigrateMsg, MigrateOp};
use shard_store::partition::PartitionState;
use shard_store::record::Digest;
use shard_store::WriteOptions;

fn done_counter(cluster: &TestCluster, node_idx: usize) -> Arc<AtomicUsize> {
    let count = Arc::new(AtomicUsize::new(0));
    let hook = count.clone();
    cluster
        .node(node_idx)
        .migrate
        .set_done_hook(Box::new(move |_, _, _| {
            hook.fetch_add(1, Ordering::Relaxed);
        }));
    count
}

#[test]
fn single_record_migration_preserves_record() {
    let cluster = TestCluster::start(2, fast_config());
    cluster.set_all_partitions(0, PartitionState::Sync);
    cluster.set_all_partitions(1, PartitionState::Desync);

    let digest = Digest::from_key("users", b"alice");
    let pid = digest.partition_id(cluster.ns(0).n_partitions);
    install_record(
        cluster.ns(0),
        digest,
        int_bins(&[("x", 1)]),
        3,
        100,
        "users",
        Some(b"alice"),
    );

    let done = done_counter(&cluster, 1);
    cluster
        .node(0)
        .migrate
        .emigrate(cluster.ns(0), pid, 2, EmigrationFlag::Normal);

    assert!(wait_until(IO_TIMEOUT, || done.load(Ordering::Relaxed) == 1));

    let moved = cluster.node(1).read_record("test", &digest).expect("record on dest");
    assert_eq!(moved.meta.generation, 3);
    assert_eq!(moved.meta.last_update_time, 100);
    assert_eq!(moved.bins, int_bins(&[("x", 1)]));
    assert_eq!(moved.key.as_deref(), Some(b"alice".as_slice()));
    assert_eq!(
        cluster.ns(1).set_name(moved.meta.set_id).as_deref(),
        Some("users")
    );

    // Destination partition finished its hand-off.
    assert_eq!(cluster.ns(1).partition(pid).state(), PartitionState::Sync);
    // A clean transfer leaves the imbalance counter alone.
    assert_eq!(
        cluster.node(0).stats().snapshot().migrate_tx_partitions_imbalance,
        0
    );

    cluster.shutdown();
}

#[test]
fn client_write_wins_over_retransmitted_migration_insert() {
    let cluster = TestCluster::start(2, fast_config());
    cluster.set_all_partitions(0, PartitionState::Sync);
    cluster.set_all_partitions(1, PartitionState::Desync);

    // Old copy on A.
    let digest = Digest::from_key("users", b"bob");
    let pid = digest.partition_id(cluster.ns(0).n_partitions);
    install_record(
        cluster.ns(0),
        digest,
        int_bins(&[("x", 1)]),
        3,
        100,
        "users",
        Some(b"bob"),
    );

    // Newer client write lands on B (the incoming master) first.
    cluster
        .node(1)
        .client_write(
            "test",
            b"bob",
            int_bins(&[("x", 99)]),
            200,
            vec![],
            WriteOptions {
                set_name: "users".to_string(),
                ..WriteOptions::default()
            },
        )
        .expect("client write on B");

    // Force at least one INSERT retransmission by eating the first ack.
    let dropped_one = Arc::new(AtomicBool::new(false));
    let flag = dropped_one.clone();
    cluster.mesh.set_fault(Some(Box::new(move |_, _, msg| {
        if let FabricMsg::Migrate(m) = msg {
            if m.op == MigrateOp::InsertAck && !flag.swap(true, Ordering::AcqRel) {
                return true;
            }
        }
        false
    })));

    let done = done_counter(&cluster, 1);
    cluster
        .node(0)
        .migrate
        .emigrate(cluster.ns(0), pid, 2, EmigrationFlag::Normal);

    assert!(wait_until(IO_TIMEOUT, || done.load(Ordering::Relaxed) == 1));
    assert!(dropped_one.load(Ordering::Relaxed));
    cluster.mesh.set_fault(None);

    // The migration completed, but B kept the newer client write.
    let kept = cluster.node(1).read_record("test", &digest).expect("record on B");
    assert_eq!(kept.meta.last_update_time, 200);
    assert_eq!(kept.meta.generation, 1);
    assert_eq!(kept.bins, int_bins(&[("x", 99)]));

    cluster.shutdown();
}

#[test]
fn cluster_key_advance_aborts_migration_and_reaps_session() {
    let cluster = TestCluster::start(2, fast_config());
    cluster.set_all_partitions(0, PartitionState::Sync);
    cluster.set_all_partitions(1, PartitionState::Desync);

    // One partition with enough records that the stream is in flight when
    // the key changes. Digest prefixes are multiples of the partition
    // count, so every record routes to partition 0.
    let ns_a = cluster.ns(0);
    let pid = 0u32;
    for i in 0..300u32 {
        let mut raw = [0u8; 20];
        raw[..4].copy_from_slice(&(i * ns_a.n_partitions).to_be_bytes());
        let digest = Digest(raw);
        assert_eq!(digest.partition_id(ns_a.n_partitions), pid);
        install_record(ns_a, digest, int_bins(&[("v", i as i64)]), 1, 10, "bulk", None);
    }

    // Eat every INSERT ack: the emigrator ends up spinning in its
    // retransmit drain loop, DONE never sent.
    cluster.mesh.set_fault(Some(Box::new(|_, _, msg| {
        matches!(msg, FabricMsg::Migrate(m) if m.op == MigrateOp::InsertAck)
    })));

    let done = done_counter(&cluster, 1);
    cluster
        .node(0)
        .migrate
        .emigrate(ns_a, pid, 2, EmigrationFlag::Normal);

    // Wait until the destination has started installing records.
    assert!(wait_until(IO_TIMEOUT, || {
        !cluster.ns(1).partition(pid).tree().is_empty()
    }));

    // Membership changes.
    cluster.cluster.advance();
    cluster.mesh.set_fault(None);

    // The emigrator aborts without DONE...
    assert!(wait_until(IO_TIMEOUT, || {
        cluster.node(0).migrate.emigration_count() == 0
    }));
    assert_eq!(done.load(Ordering::Relaxed), 0);

    // ...and the reaper evicts the stale immigration session.
    assert!(wait_until(IO_TIMEOUT, || {
        cluster.node(1).migrate.immigration_count() == 0
    }));

    // Nothing on B is a partial record: every installed entry has bins.
    cluster.ns(1).partition(pid).tree().reduce(|record| {
        assert!(!record.lock().bins.is_empty());
        true
    });

    cluster.shutdown();
}

/// Side-channel observer: registers a bare mesh node and records every
/// migrate message sent to it.
struct Observer {
    endpoint: shard_fabric::MeshEndpoint<FabricMsg>,
    rx: mpsc::Receiver<(NodeId, MigrateMsg)>,
}

impl Observer {
    fn register(cluster: &TestCluster, id: NodeId) -> Observer {
        let (tx, rx) = mpsc::channel();
        let tx = Mutex::new(tx);
        let endpoint = cluster.mesh.register(
            id,
            Box::new(move |src, msg| {
                if let FabricMsg::Migrate(m) = msg {
                    if let Ok(tx) = tx.lock() {
                        let _ = tx.send((src, m));
                    }
                }
            }),
        );
        Observer { endpoint, rx }
    }

    fn send(&self, dest: NodeId, msg: MigrateMsg) {
        self.endpoint
            .send(dest, Channel::Ctrl, FabricMsg::Migrate(msg))
            .expect("observer send");
    }

    fn recv_op(&self, op: MigrateOp) -> MigrateMsg {
        loop {
            let (_, msg) = self
                .rx
                .recv_timeout(IO_TIMEOUT)
                .unwrap_or_else(|_| panic!("timed out waiting for {op:?}"));
            if msg.op == op {
                return msg;
            }
        }
    }

    fn assert_quiet(&self, for_ms: u64, op: MigrateOp) {
        let deadline = std::time::Instant::now() + Duration::from_millis(for_ms);
        while let Some(left) = deadline.checked_duration_since(std::time::Instant::now()) {
            match self.rx.recv_timeout(left) {
                Ok((_, msg)) => assert_ne!(msg.op, op, "unexpected {op:?}"),
                Err(_) => return,
            }
        }
    }
}

fn insert_msg(emig_id: u32, insert_id: u32, digest: Digest, generation: u32, lut: u64) -> MigrateMsg {
    MigrateMsg {
        op: MigrateOp::Insert,
        emig_id,
        insert_id: Some(insert_id),
        namespace: Some("test".to_string()),
        pid: None,
        digest: Some(digest),
        generation: Some(generation),
        void_time: Some(0),
        last_update_time: Some(lut),
        record: Some(shard_store::pickle::pickle_bins(&int_bins(&[("x", 5)]))),
        rec_props: None,
        cluster_key: None,
        info: 0,
        compat_type: None,
        version: 0,
    }
}

#[test]
fn duplicate_start_is_idempotent() {
    let cluster = TestCluster::start(1, fast_config());
    cluster.set_all_partitions(0, PartitionState::Desync);
    let observer = Observer::register(&cluster, 99);
    let key = cluster.cluster.key();

    observer.send(1, MigrateMsg::start(17, key, "test", 7));
    let ack = observer.recv_op(MigrateOp::StartAckOk);
    assert_eq!(ack.emig_id, 17);
    assert_eq!(cluster.node(0).migrate.immigration_count(), 1);

    // Retransmitted START: same ack, no new session, no state reset.
    observer.send(1, MigrateMsg::start(17, key, "test", 7));
    observer.recv_op(MigrateOp::StartAckOk);
    assert_eq!(cluster.node(0).migrate.immigration_count(), 1);

    cluster.shutdown();
}

#[test]
fn start_decisions_follow_partition_state() {
    let cluster = TestCluster::start(1, fast_config());
    let observer = Observer::register(&cluster, 99);
    let key = cluster.cluster.key();

    // Absent partition refuses immigration outright.
    observer.send(1, MigrateMsg::start(1, key, "test", 3));
    observer.recv_op(MigrateOp::StartAckFail);

    // Stale cluster key gets a soft try-again.
    cluster.set_all_partitions(0, PartitionState::Desync);
    observer.send(1, MigrateMsg::start(2, key + 1, "test", 3));
    observer.recv_op(MigrateOp::StartAckEagain);

    // A source that already completed gets ALREADY_DONE.
    cluster.ns(0).partition(3).record_immigration_done(99);
    observer.send(1, MigrateMsg::start(3, key, "test", 3));
    observer.recv_op(MigrateOp::StartAckAlreadyDone);

    cluster.shutdown();
}

#[test]
fn done_notification_fires_exactly_once_under_retransmission() {
    let cluster = TestCluster::start(1, fast_config());
    cluster.set_all_partitions(0, PartitionState::Desync);
    let observer = Observer::register(&cluster, 99);
    let done = done_counter(&cluster, 0);
    let key = cluster.cluster.key();

    observer.send(1, MigrateMsg::start(21, key, "test", 5));
    observer.recv_op(MigrateOp::StartAckOk);

    let digest = Digest::from_key("s", b"one");
    observer.send(1, insert_msg(21, 1, digest, 2, 50));
    observer.recv_op(MigrateOp::InsertAck);

    // DONE, retransmitted twice more.
    for _ in 0..3 {
        observer.send(1, MigrateMsg::done(21, "test", 5));
        observer.recv_op(MigrateOp::DoneAck);
    }
    assert_eq!(done.load(Ordering::Relaxed), 1);

    cluster.shutdown();
}

#[test]
fn insert_is_idempotent_and_fenced_by_cluster_key() {
    let cluster = TestCluster::start(1, fast_config());
    cluster.set_all_partitions(0, PartitionState::Desync);
    let observer = Observer::register(&cluster, 99);
    let key = cluster.cluster.key();

    observer.send(1, MigrateMsg::start(31, key, "test", 2));
    observer.recv_op(MigrateOp::StartAckOk);

    // Same INSERT delivered twice: identical final state, both acked.
    let digest = Digest::from_key("s", b"two");
    observer.send(1, insert_msg(31, 7, digest, 2, 50));
    observer.recv_op(MigrateOp::InsertAck);
    observer.send(1, insert_msg(31, 7, digest, 2, 50));
    observer.recv_op(MigrateOp::InsertAck);

    let record = cluster.node(0).read_record("test", &digest).expect("installed");
    assert_eq!(record.meta.generation, 2);
    assert_eq!(record.bins, int_bins(&[("x", 5)]));

    // After the key advances, inserts for the old session must not touch
    // the index, and are not acked.
    cluster.cluster.advance();
    let fresh = Digest::from_key("s", b"three");
    observer.send(1, insert_msg(31, 8, fresh, 2, 60));
    observer.assert_quiet(200, MigrateOp::InsertAck);
    assert!(cluster.node(0).read_record("test", &fresh).is_none());

    cluster.shutdown();
}

#[test]
fn binless_insert_without_drop_bit_is_counted_malformed() {
    let cluster = TestCluster::start(1, fast_config());
    cluster.set_all_partitions(0, PartitionState::Desync);
    let observer = Observer::register(&cluster, 99);
    let key = cluster.cluster.key();

    observer.send(1, MigrateMsg::start(41, key, "test", 0));
    observer.recv_op(MigrateOp::StartAckOk);

    let digest = Digest::from_key("s", b"empty");
    let mut msg = insert_msg(41, 1, digest, 1, 10);
    msg.record = Some(shard_store::pickle::drop_pickle());
    // No INFO_DROP bit: malformed by policy.
    observer.send(1, msg);
    observer.recv_op(MigrateOp::InsertAck);

    assert!(cluster.node(0).read_record("test", &digest).is_none());
    assert_eq!(cluster.node(0).stats().snapshot().malformed_pickles, 1);

    // With the drop bit it is a legitimate no-op delete.
    let mut msg = insert_msg(41, 2, digest, 1, 10);
    msg.record = Some(shard_store::pickle::drop_pickle());
    msg.info = shard_store::msg::INFO_DROP;
    observer.send(1, msg);
    observer.recv_op(MigrateOp::InsertAck);
    assert_eq!(cluster.node(0).stats().snapshot().malformed_pickles, 1);

    cluster.shutdown();
}
