//! Node wiring: builds a node's services, registers its fabric handler,
//! and exposes the master-side write/delete entry points the client layer
//! calls after request routing.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use anyhow::Context;
use bytes::Bytes;

use shard_fabric::{FaultFn, MeshFabric, NodeId};

use crate::config::Config;
use crate::migrate::MigrateService;
use crate::msg::{FabricMsg, INFO_DROP};
use crate::partition::{ClusterView, Namespace};
use crate::pickle;
use crate::rec_props::RecProps;
use crate::record::{next_generation, Bin, Digest};
use crate::repl_write::{CompletionCb, ReplWriteParams, ReplWriteService};
use crate::stats::Stats;

/// Per-write knobs for the master path.
#[derive(Default)]
pub struct WriteOptions {
    pub set_name: String,
    /// Absolute expiry in seconds; 0 = never.
    pub void_time: u32,
    /// Keep the key bytes in the index entry and ship them to replicas.
    pub store_key: bool,
    /// Absolute deadline for replica acks; `None` uses the default.
    pub deadline_ms: Option<u64>,
    /// Respond to the origin before replicas ack.
    pub respond_on_master: bool,
    pub repl_write_cb: Option<CompletionCb>,
    pub timeout_cb: Option<CompletionCb>,
}

/// One shard-store node: namespaces plus the migration and replicated-write
/// services, hooked onto a fabric.
pub struct Node {
    pub id: NodeId,
    pub cluster: Arc<ClusterView>,
    namespaces: HashMap<String, Arc<Namespace>>,
    pub migrate: Arc<MigrateService>,
    pub repl: Arc<ReplWriteService>,
    stats: Arc<Stats>,
}

impl Node {
    /// Build a node, register it on the mesh, and start its background
    /// threads.
    pub fn start(
        id: NodeId,
        mesh: &MeshFabric<FabricMsg>,
        cluster: Arc<ClusterView>,
        namespaces: Vec<Arc<Namespace>>,
        cfg: Config,
    ) -> Arc<Node> {
        // The receive handler needs the services, the services need the
        // fabric endpoint, and the endpoint comes from registering the
        // handler. Break the cycle with a late-bound slot.
        let slot: Arc<OnceLock<Arc<Node>>> = Arc::new(OnceLock::new());

        let handler_slot = slot.clone();
        let endpoint = mesh.register(
            id,
            Box::new(move |src, msg| {
                let Some(node) = handler_slot.get() else {
                    tracing::warn!(src, "message before node wiring finished, dropping");
                    return;
                };
                match msg {
                    FabricMsg::Migrate(m) => node.migrate.handle_msg(src, m),
                    FabricMsg::Rw(m) => node.repl.handle_msg(src, m),
                }
            }),
        );
        let fabric = Arc::new(endpoint);

        let stats = Arc::new(Stats::new());
        let migrate = MigrateService::new(
            id,
            fabric.clone(),
            cluster.clone(),
            namespaces.clone(),
            cfg.migrate,
            stats.clone(),
        );
        let repl = ReplWriteService::new(
            id,
            fabric,
            cluster.clone(),
            namespaces.clone(),
            cfg.transaction,
            stats.clone(),
        );

        let node = Arc::new(Node {
            id,
            cluster,
            namespaces: namespaces
                .into_iter()
                .map(|ns| (ns.name.clone(), ns))
                .collect(),
            migrate,
            repl,
            stats,
        });
        let _ = slot.set(node.clone());

        node.migrate.start();
        node.repl.start();
        node
    }

    pub fn stats(&self) -> &Arc<Stats> {
        &self.stats
    }

    pub fn namespace(&self, name: &str) -> Option<&Arc<Namespace>> {
        self.namespaces.get(name)
    }

    pub fn shutdown(&self) {
        self.migrate.shutdown();
        self.repl.shutdown();
    }

    /// Master-side client write: apply locally, then fan out to replicas.
    /// `last_update_time` comes from the cluster-wide clock the caller
    /// holds. Returns the record digest.
    pub fn client_write(
        &self,
        ns_name: &str,
        key: &[u8],
        bins: Vec<Bin>,
        last_update_time: u64,
        dest_nodes: Vec<NodeId>,
        mut opts: WriteOptions,
    ) -> anyhow::Result<Digest> {
        anyhow::ensure!(!bins.is_empty(), "a write must carry at least one bin");
        let ns = self
            .namespaces
            .get(ns_name)
            .with_context(|| format!("unknown namespace {ns_name}"))?
            .clone();

        let digest = Digest::from_key(&opts.set_name, key);
        let pid = digest.partition_id(ns.n_partitions);
        let rsv = ns.reserve(pid, &self.cluster);
        let set_id = ns.set_id(&opts.set_name);

        anyhow::ensure!(
            !ns.is_truncated(set_id, last_update_time),
            "write forbidden by pending truncate"
        );

        let key_bytes = opts.store_key.then(|| Bytes::copy_from_slice(key));
        let (record, created) = rsv.tree().get_or_create(digest);
        let (generation, pickled) = {
            let mut core = record.lock();
            core.meta.generation = if created {
                1
            } else {
                next_generation(core.meta.generation)
            };
            core.meta.last_update_time = last_update_time;
            core.meta.void_time = opts.void_time;
            core.meta.set_id = set_id;
            core.bins = bins;
            core.key = key_bytes.clone();
            (core.meta.generation, pickle::pickle_bins(&core.bins))
        };
        ns.storage()
            .write_record(&digest, &pickled)
            .context("persist master write")?;
        drop(rsv);

        self.repl.replicate(ReplWriteParams {
            ns,
            digest,
            generation,
            void_time: opts.void_time,
            last_update_time,
            set_name: (!opts.set_name.is_empty()).then(|| opts.set_name.clone()),
            key: key_bytes,
            pickle: pickled,
            info: 0,
            dest_nodes,
            deadline_ms: opts.deadline_ms,
            respond_on_master: opts.respond_on_master,
            repl_write_cb: opts.repl_write_cb.take(),
            timeout_cb: opts.timeout_cb.take(),
        });

        Ok(digest)
    }

    /// Master-side client delete: remove locally, ship the drop pickle.
    pub fn client_delete(
        &self,
        ns_name: &str,
        key: &[u8],
        last_update_time: u64,
        dest_nodes: Vec<NodeId>,
        mut opts: WriteOptions,
    ) -> anyhow::Result<Digest> {
        let ns = self
            .namespaces
            .get(ns_name)
            .with_context(|| format!("unknown namespace {ns_name}"))?
            .clone();

        let digest = Digest::from_key(&opts.set_name, key);
        let pid = digest.partition_id(ns.n_partitions);
        let rsv = ns.reserve(pid, &self.cluster);

        rsv.tree().delete(&digest);
        if let Err(err) = ns.storage().delete_record(&digest) {
            tracing::warn!(%digest, error = ?err, "client delete: storage delete failed");
        }
        drop(rsv);

        self.repl.replicate(ReplWriteParams {
            ns,
            digest,
            generation: 0,
            void_time: 0,
            last_update_time,
            set_name: (!opts.set_name.is_empty()).then(|| opts.set_name.clone()),
            key: None,
            pickle: pickle::drop_pickle(),
            info: INFO_DROP,
            dest_nodes,
            deadline_ms: opts.deadline_ms,
            respond_on_master: opts.respond_on_master,
            repl_write_cb: opts.repl_write_cb.take(),
            timeout_cb: opts.timeout_cb.take(),
        });

        Ok(digest)
    }

    /// Read back one record's bins and metadata (test and tooling aid).
    pub fn read_record(&self, ns_name: &str, digest: &Digest) -> Option<crate::index::RecordCore> {
        let ns = self.namespaces.get(ns_name)?;
        let pid = digest.partition_id(ns.n_partitions);
        let record = ns.partition(pid).tree().get(digest)?;
        let core = record.lock();
        Some(core.clone())
    }
}

/// Re-export of the mesh fault hook type for test ergonomics.
pub type MeshFault = FaultFn<FabricMsg>;

/// Encode the side-band properties for a record the way the emigrator
/// does, exposed for tooling.
pub fn encode_rec_props(set_name: Option<&str>, key: Option<&[u8]>) -> Option<Bytes> {
    RecProps {
        set_name: set_name.map(str::to_string),
        key: key.map(Bytes::copy_from_slice),
    }
    .encode()
}
