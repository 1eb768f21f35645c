//! Shared helpers for the in-process cluster tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;

use shard_fabric::MeshFabric;
use shard_store::config::Config;
use shard_store::msg::FabricMsg;
use shard_store::partition::{ClusterView, Namespace, PartitionState};
use shard_store::record::{Bin, Digest, Particle, RecordMeta};
use shard_store::storage::{MemoryStorage, StorageEngine};
use shard_store::{pickle, Node};

pub const IO_TIMEOUT: Duration = Duration::from_secs(10);

/// Tight intervals so retransmit/timeout paths run inside test budgets.
pub fn fast_config() -> Config {
    let mut cfg = Config::default();
    cfg.migrate.retransmit_ms = 25;
    cfg.migrate.retransmit_startdone_ms = 25;
    cfg.migrate.n_migrate_threads = 2;
    cfg.transaction.retry_ms = 40;
    cfg.transaction.max_ms = 400;
    cfg
}

pub struct TestCluster {
    pub mesh: MeshFabric<FabricMsg>,
    pub cluster: Arc<ClusterView>,
    pub nodes: Vec<Arc<Node>>,
    pub namespaces: Vec<Arc<Namespace>>,
}

impl TestCluster {
    /// Build `n` nodes, each with its own copy of namespace "test".
    /// Storage defaults to unbounded memory; pass per-node engines to
    /// override (e.g. a full disk).
    pub fn start(n: usize, cfg: Config) -> TestCluster {
        let storages: Vec<Arc<dyn StorageEngine>> = (0..n)
            .map(|_| -> Arc<dyn StorageEngine> { MemoryStorage::unbounded() })
            .collect();
        TestCluster::start_with_storage(cfg, storages)
    }

    pub fn start_with_storage(cfg: Config, storages: Vec<Arc<dyn StorageEngine>>) -> TestCluster {
        let mesh = MeshFabric::new();
        let cluster = ClusterView::new(1);
        let mut nodes = Vec::new();
        let mut namespaces = Vec::new();

        for (idx, storage) in storages.into_iter().enumerate() {
            let ns = Namespace::new("test", 1, 64, storage);
            let node = Node::start(idx as u64 + 1, &mesh, cluster.clone(), vec![ns.clone()], cfg);
            namespaces.push(ns);
            nodes.push(node);
        }

        TestCluster {
            mesh,
            cluster,
            nodes,
            namespaces,
        }
    }

    pub fn node(&self, idx: usize) -> &Arc<Node> {
        &self.nodes[idx]
    }

    pub fn ns(&self, idx: usize) -> &Arc<Namespace> {
        &self.namespaces[idx]
    }

    /// Mark every partition `state` on node `idx`.
    pub fn set_all_partitions(&self, idx: usize, state: PartitionState) {
        let ns = self.ns(idx);
        for pid in 0..ns.n_partitions {
            ns.partition(pid).set_state(state);
        }
    }

    pub fn shutdown(&self) {
        for node in &self.nodes {
            node.shutdown();
        }
    }
}

/// Poll until `cond` holds or `deadline` elapses.
pub fn wait_until(deadline: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let end = Instant::now() + deadline;
    while Instant::now() < end {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    cond()
}

/// Install a record directly into a node's tree and storage, bypassing the
/// write path (pre-state setup).
pub fn install_record(
    ns: &Arc<Namespace>,
    digest: Digest,
    bins: Vec<Bin>,
    generation: u16,
    last_update_time: u64,
    set_name: &str,
    key: Option<&[u8]>,
) {
    let pid = digest.partition_id(ns.n_partitions);
    let set_id = ns.set_id(set_name);
    let (record, _) = ns.partition(pid).tree().get_or_create(digest);
    let pickled = {
        let mut core = record.lock();
        core.meta = RecordMeta {
            generation,
            last_update_time,
            void_time: 0,
            set_id,
        };
        core.bins = bins;
        core.key = key.map(Bytes::copy_from_slice);
        pickle::pickle_bins(&core.bins)
    };
    ns.storage()
        .write_record(&digest, &pickled)
        .expect("install record image");
}

pub fn int_bins(pairs: &[(&str, i64)]) -> Vec<Bin> {
    pairs
        .iter()
        .map(|(name, v)| Bin::new(*name, Particle::Integer(*v)))
        .collect()
}
