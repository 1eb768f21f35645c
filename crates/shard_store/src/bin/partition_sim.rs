// In-process cluster simulator: spins up a few nodes on a mesh fabric,
// replicates client writes, migrates a partition between nodes, and prints
// the resulting counters. Useful for eyeballing the protocol under a
// debugger or tracing filter.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use clap::Parser;

use shard_fabric::MeshFabric;
use shard_store::migrate::EmigrationFlag;
use shard_store::msg::FabricMsg;
use shard_store::partition::PartitionState;
use shard_store::storage::MemoryStorage;
use shard_store::{Bin, ClusterView, Config, Namespace, Node, Particle, WriteOptions};

#[derive(Parser, Debug)]
#[command(about = "Drive a migration and replicated writes on an in-process cluster")]
struct SimArgs {
    /// Number of records to write before migrating.
    #[arg(long, default_value_t = 1000)]
    records: usize,

    /// Partitions per namespace.
    #[arg(long, default_value_t = 64)]
    partitions: u32,

    /// Seconds to wait for the migration to finish.
    #[arg(long, default_value_t = 30)]
    timeout_secs: u64,

    /// Emit counters as JSON instead of log lines.
    #[arg(long)]
    json: bool,
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = SimArgs::parse();
    let cfg = Config::from_env();

    let mesh = MeshFabric::<FabricMsg>::new();
    let cluster = ClusterView::new(1);

    let make_ns = || Namespace::new("sim", 1, args.partitions, MemoryStorage::unbounded());
    let ns_a = make_ns();
    let ns_b = make_ns();
    let ns_c = make_ns();

    let node_a = Node::start(1, &mesh, cluster.clone(), vec![ns_a.clone()], cfg);
    let node_b = Node::start(2, &mesh, cluster.clone(), vec![ns_b.clone()], cfg);
    let node_c = Node::start(3, &mesh, cluster.clone(), vec![ns_c.clone()], cfg);

    // Node A masters everything; B replicates; C starts empty.
    for pid in 0..args.partitions {
        ns_a.partition(pid).set_state(PartitionState::Sync);
        ns_b.partition(pid).set_state(PartitionState::Desync);
        ns_c.partition(pid).set_state(PartitionState::Desync);
    }

    // Replicated writes A -> B.
    let (ack_tx, ack_rx) = mpsc::channel();
    for i in 0..args.records {
        let ack_tx = ack_tx.clone();
        node_a.client_write(
            "sim",
            format!("key-{i}").as_bytes(),
            vec![
                Bin::new("seq", Particle::Integer(i as i64)),
                Bin::new("body", Particle::String(format!("payload-{i}"))),
            ],
            now_ms(),
            vec![node_b.id],
            WriteOptions {
                set_name: "events".to_string(),
                repl_write_cb: Some(Box::new(move |code| {
                    let _ = ack_tx.send(code);
                })),
                ..WriteOptions::default()
            },
        )?;
    }
    drop(ack_tx);

    let mut acked = 0usize;
    while ack_rx
        .recv_timeout(Duration::from_secs(args.timeout_secs))
        .is_ok()
    {
        acked += 1;
        if acked == args.records {
            break;
        }
    }
    tracing::info!(acked, total = args.records, "replicated writes complete");

    // Migrate every non-empty partition A -> C.
    let done = Arc::new(AtomicUsize::new(0));
    let done_hook = done.clone();
    node_c
        .migrate
        .set_done_hook(Box::new(move |_, _, _| {
            done_hook.fetch_add(1, Ordering::Relaxed);
        }));

    let mut expected = 0usize;
    for pid in 0..args.partitions {
        if ns_a.partition(pid).tree().is_empty() {
            continue;
        }
        node_a
            .migrate
            .emigrate(&ns_a, pid, node_c.id, EmigrationFlag::Normal);
        expected += 1;
    }

    let deadline = Instant::now() + Duration::from_secs(args.timeout_secs);
    while done.load(Ordering::Relaxed) < expected && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(50));
    }
    anyhow::ensure!(
        done.load(Ordering::Relaxed) == expected,
        "migration timed out: {}/{} partitions",
        done.load(Ordering::Relaxed),
        expected
    );

    let migrated: usize = (0..args.partitions)
        .map(|pid| ns_c.partition(pid).tree().len())
        .sum();
    tracing::info!(migrated, partitions = expected, "migration complete");

    for (name, node) in [("a", &node_a), ("b", &node_b), ("c", &node_c)] {
        let snap = node.stats().snapshot();
        if args.json {
            println!(
                "{}",
                serde_json::json!({
                    "node": name,
                    "migrate_msgs_sent": snap.migrate_msgs_sent,
                    "migrate_msgs_rcvd": snap.migrate_msgs_rcvd,
                    "repl_writes_started": snap.repl_writes_started,
                    "repl_writes_completed": snap.repl_writes_completed,
                    "repl_writes_timedout": snap.repl_writes_timedout,
                    "imbalance": snap.migrate_tx_partitions_imbalance,
                })
            );
        } else {
            tracing::info!(node = name, ?snap, "final counters");
        }
        node.migrate.dump();
    }

    node_a.shutdown();
    node_b.shutdown();
    node_c.shutdown();
    Ok(())
}
