//! Replicated writes: synchronous propagation of one client mutation from
//! the partition master to its replicas.
//!
//! The master applies the mutation locally, pickles the record, then hands
//! the pickle here. One `RwRequest` per inflight mutation lives in a
//! striped hash keyed by `(namespace id, digest)`; a retransmit thread
//! re-sends to unacked destinations with exponential backoff until every
//! destination acked or the deadline passes. Exactly one of the completion
//! and timeout callbacks runs, exactly once.
//!
//! The receiver side applies the pickle under the partition reservation:
//! a drop pickle deletes the replica copy, anything else overwrites it
//! with the master's image.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use bytes::Bytes;

use shard_fabric::{Channel, Fabric, NodeId, SendError};

use crate::config::TransactionConfig;
use crate::error::ResultCode;
use crate::migrate::now_ms;
use crate::msg::{FabricMsg, RwMsg, RwOp, INFO_DROP, INFO_NSUP_DELETE, INFO_XDR};
use crate::partition::{ClusterView, Namespace};
use crate::pickle;
use crate::record::{Digest, Generation, RecordMeta};
use crate::stats::Stats;

/// Retransmit thread tick.
const RETRANSMIT_TICK_MS: u64 = 50;
/// Stripes of the request hash.
const N_HASH_SHARDS: usize = 16;

/// Completion callback; receives the final wire result.
pub type CompletionCb = Box<dyn FnOnce(ResultCode) + Send>;

/// External shipping sink (cross-datacenter replication is out of scope;
/// this is the seam it attaches to).
pub trait ShipSink: Send + Sync {
    fn ship_write(&self, ns: &str, digest: &Digest, generation: Generation, master: NodeId);
    fn ship_drop(&self, ns: &str, digest: &Digest, master: NodeId);
}

/// Everything the master path needs to replicate one mutation.
pub struct ReplWriteParams {
    pub ns: Arc<Namespace>,
    pub digest: Digest,
    pub generation: Generation,
    pub void_time: u32,
    pub last_update_time: u64,
    pub set_name: Option<String>,
    pub key: Option<Bytes>,
    /// Pickled record image; ownership transfers to the wire message. The
    /// drop form (with `INFO_DROP`) deletes on replicas.
    pub pickle: Bytes,
    pub info: u32,
    pub dest_nodes: Vec<NodeId>,
    /// Absolute deadline (ms epoch); `None` uses the configured default.
    pub deadline_ms: Option<u64>,
    /// Respond-on-master-completion mode: the origin was already answered,
    /// so the completion callback must be `None` and acks only drain the
    /// request.
    pub respond_on_master: bool,
    pub repl_write_cb: Option<CompletionCb>,
    pub timeout_cb: Option<CompletionCb>,
}

struct RwInner {
    dest_complete: Vec<bool>,
    xmit_ms: u64,
    retry_interval_ms: u64,
    /// First non-OK replica result, surfaced to the completion callback.
    result: ResultCode,
    finished: bool,
    repl_write_cb: Option<CompletionCb>,
    timeout_cb: Option<CompletionCb>,
}

/// One inflight replicated write on the master.
pub struct RwRequest {
    ns_id: u32,
    digest: Digest,
    tid: u32,
    dest_nodes: Vec<NodeId>,
    deadline_ms: u64,
    msg: RwMsg,
    inner: Mutex<RwInner>,
}

impl RwRequest {
    fn lock(&self) -> std::sync::MutexGuard<'_, RwInner> {
        match self.inner.lock() {
            Ok(inner) => inner,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Per-node replicated-write service: master fan-out plus replica receive.
pub struct ReplWriteService {
    node_id: NodeId,
    fabric: Arc<dyn Fabric<FabricMsg>>,
    cluster: Arc<ClusterView>,
    namespaces: HashMap<String, Arc<Namespace>>,
    cfg: TransactionConfig,
    stats: Arc<Stats>,
    shards: Vec<Mutex<HashMap<(u32, Digest), Arc<RwRequest>>>>,
    next_tid: AtomicU32,
    ship: Mutex<Option<Arc<dyn ShipSink>>>,
    shutdown: AtomicBool,
}

impl ReplWriteService {
    pub fn new(
        node_id: NodeId,
        fabric: Arc<dyn Fabric<FabricMsg>>,
        cluster: Arc<ClusterView>,
        namespaces: Vec<Arc<Namespace>>,
        cfg: TransactionConfig,
        stats: Arc<Stats>,
    ) -> Arc<ReplWriteService> {
        Arc::new(ReplWriteService {
            node_id,
            fabric,
            cluster,
            namespaces: namespaces
                .into_iter()
                .map(|ns| (ns.name.clone(), ns))
                .collect(),
            cfg,
            stats,
            shards: (0..N_HASH_SHARDS)
                .map(|_| Mutex::new(HashMap::new()))
                .collect(),
            next_tid: AtomicU32::new(0),
            ship: Mutex::new(None),
            shutdown: AtomicBool::new(false),
        })
    }

    /// Spawn the retransmit thread.
    pub fn start(self: &Arc<Self>) {
        let service = self.clone();
        thread::Builder::new()
            .name("rw-retransmit".to_string())
            .spawn(move || service.run_retransmit())
            .expect("spawn rw retransmit thread");
    }

    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
    }

    pub fn set_ship_sink(&self, sink: Arc<dyn ShipSink>) {
        if let Ok(mut ship) = self.ship.lock() {
            *ship = Some(sink);
        }
    }

    pub fn inflight_count(&self) -> usize {
        self.shards
            .iter()
            .map(|shard| shard.lock().map(|s| s.len()).unwrap_or(0))
            .sum()
    }

    fn shard(&self, digest: &Digest) -> &Mutex<HashMap<(u32, Digest), Arc<RwRequest>>> {
        &self.shards[digest.0[0] as usize % N_HASH_SHARDS]
    }

    //----------------------------------------------------------
    // Master path.
    //

    /// Fan a mutation out to its replica destinations. Returns the
    /// transaction id correlating the acks.
    pub fn replicate(&self, params: ReplWriteParams) -> u32 {
        let tid = self.next_tid.fetch_add(1, Ordering::Relaxed) + 1;
        self.stats.repl_writes_started.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(
            node = self.node_id,
            tid,
            digest = %params.digest,
            dests = params.dest_nodes.len(),
            "replicating write"
        );

        debug_assert!(
            !params.respond_on_master || params.repl_write_cb.is_none(),
            "respond-on-master mode must not carry a completion callback"
        );

        if params.dest_nodes.is_empty() {
            // Replication factor 1: the master copy is the whole story.
            if let Some(cb) = params.repl_write_cb {
                cb(ResultCode::Ok);
            }
            self.stats
                .repl_writes_completed
                .fetch_add(1, Ordering::Relaxed);
            return tid;
        }

        let msg = RwMsg {
            op: RwOp::Write,
            ns_id: params.ns.id,
            namespace: Some(params.ns.name.clone()),
            digest: params.digest,
            tid,
            generation: Some(u32::from(params.generation)),
            void_time: (params.void_time != 0).then_some(params.void_time),
            last_update_time: Some(params.last_update_time),
            set_name: params.set_name,
            key: params.key,
            record: Some(params.pickle),
            info: params.info,
            result: None,
        };

        let now = now_ms();
        let deadline_ms = params.deadline_ms.unwrap_or(now + self.cfg.max_ms);
        let n_dests = params.dest_nodes.len();
        let request = Arc::new(RwRequest {
            ns_id: params.ns.id,
            digest: params.digest,
            tid,
            dest_nodes: params.dest_nodes,
            deadline_ms,
            msg,
            inner: Mutex::new(RwInner {
                dest_complete: vec![false; n_dests],
                xmit_ms: now + self.cfg.retry_ms,
                retry_interval_ms: self.cfg.retry_ms,
                result: ResultCode::Ok,
                finished: false,
                repl_write_cb: params.repl_write_cb,
                timeout_cb: params.timeout_cb,
            }),
        });

        let replaced = {
            let mut shard = match self.shard(&params.digest).lock() {
                Ok(shard) => shard,
                Err(poisoned) => poisoned.into_inner(),
            };
            shard.insert((params.ns.id, params.digest), request.clone())
        };
        if let Some(old) = replaced {
            // The master's per-record lock should serialize writes per
            // digest; finish the superseded request so its callback
            // contract still holds.
            tracing::warn!(digest = %params.digest, "superseding inflight repl write");
            self.finish_timeout(&old);
        }

        for dest in request.dest_nodes.iter().copied() {
            self.send_to_dest(&request, dest);
        }

        tid
    }

    fn send_to_dest(&self, request: &RwRequest, dest: NodeId) {
        match self
            .fabric
            .send(dest, Channel::Rw, FabricMsg::Rw(request.msg.clone()))
        {
            Ok(()) => {}
            Err(SendError::QueueFull(_)) => {
                // The retransmit thread picks it up.
            }
            Err(SendError::NoNode(_)) => {
                // Node dropped; rebalance will re-plan the replica set and
                // the deadline bounds the wait meanwhile.
                tracing::warn!(dest, digest = %request.digest, "repl write dest unreachable");
            }
        }
    }

    fn run_retransmit(self: Arc<Self>) {
        while !self.shutdown.load(Ordering::Acquire) {
            thread::sleep(Duration::from_millis(RETRANSMIT_TICK_MS));
            let now = now_ms();

            // Collect candidates per stripe, then work without the lock.
            let mut due: Vec<Arc<RwRequest>> = Vec::new();
            for shard in &self.shards {
                let Ok(shard) = shard.lock() else { continue };
                for request in shard.values() {
                    due.push(request.clone());
                }
            }

            for request in due {
                if now >= request.deadline_ms {
                    self.finish_timeout(&request);
                    continue;
                }

                let resend: Vec<NodeId> = {
                    let mut inner = request.lock();
                    if inner.finished || now < inner.xmit_ms {
                        continue;
                    }
                    inner.xmit_ms = now + inner.retry_interval_ms;
                    inner.retry_interval_ms = inner.retry_interval_ms.saturating_mul(2);
                    request
                        .dest_nodes
                        .iter()
                        .zip(inner.dest_complete.iter())
                        .filter_map(|(dest, complete)| (!*complete).then_some(*dest))
                        .collect()
                };
                for dest in resend {
                    self.send_to_dest(&request, dest);
                }
            }
        }
    }

    /// Deadline path: fire the timeout callback exactly once and drop the
    /// request from the hash.
    fn finish_timeout(&self, request: &Arc<RwRequest>) {
        let cb = {
            let mut inner = request.lock();
            if inner.finished {
                return;
            }
            inner.finished = true;
            inner.repl_write_cb = None;
            inner.timeout_cb.take()
        };
        self.remove(request);
        self.stats.repl_writes_timedout.fetch_add(1, Ordering::Relaxed);
        if let Some(cb) = cb {
            cb(ResultCode::Timeout);
        }
    }

    fn remove(&self, request: &Arc<RwRequest>) {
        let mut shard = match self.shard(&request.digest).lock() {
            Ok(shard) => shard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(current) = shard.get(&(request.ns_id, request.digest)) {
            // Only remove our own entry; a superseding request may already
            // occupy the slot.
            if Arc::ptr_eq(current, request) {
                shard.remove(&(request.ns_id, request.digest));
            }
        }
    }

    //----------------------------------------------------------
    // Fabric message handling.
    //

    pub fn handle_msg(&self, src: NodeId, msg: RwMsg) {
        match msg.op {
            RwOp::Write => self.handle_op(src, msg),
            RwOp::WriteAck => self.handle_ack(src, msg),
        }
    }

    fn handle_ack(&self, src: NodeId, msg: RwMsg) {
        let Some(result) = msg.result else {
            tracing::warn!(src, "repl-write ack: no result code");
            return;
        };
        let result = ResultCode::from_u32(result);
        if result == ResultCode::ClusterKeyMismatch {
            // Replica was fenced; rebalance will reissue. Let the
            // retransmit/deadline machinery run its course.
            return;
        }

        let request = {
            let shard = match self.shard(&msg.digest).lock() {
                Ok(shard) => shard,
                Err(poisoned) => poisoned.into_inner(),
            };
            shard.get(&(msg.ns_id, msg.digest)).cloned()
        };
        let Some(request) = request else {
            // Extra ack after the request already completed.
            return;
        };

        let cb = {
            let mut inner = request.lock();
            if request.tid != msg.tid {
                // Ack for a superseded transaction on the same digest.
                return;
            }
            let Some(idx) = request.dest_nodes.iter().position(|n| *n == src) else {
                tracing::warn!(src, "repl-write ack from non-dest node");
                return;
            };
            if inner.dest_complete[idx] {
                // Duplicate ack for this replica.
                return;
            }
            inner.dest_complete[idx] = true;
            if result != ResultCode::Ok && inner.result == ResultCode::Ok {
                inner.result = result;
            }

            if !inner.dest_complete.iter().all(|c| *c) {
                return;
            }
            if inner.finished {
                // Lost the race against the timeout path.
                return;
            }
            inner.finished = true;
            inner.timeout_cb = None;
            let result = inner.result;
            inner.repl_write_cb.take().map(|cb| (cb, result))
        };

        self.remove(&request);
        self.stats
            .repl_writes_completed
            .fetch_add(1, Ordering::Relaxed);
        if let Some((cb, result)) = cb {
            cb(result);
        }
    }

    /// Replica side: apply one replicated write or drop.
    fn handle_op(&self, src: NodeId, msg: RwMsg) {
        let Some(ns) = msg.namespace.as_deref().and_then(|n| self.namespaces.get(n)) else {
            tracing::warn!(src, "repl write: invalid namespace");
            self.ack(src, msg, ResultCode::Unknown);
            return;
        };
        let ns = ns.clone();

        let digest = msg.digest;
        let pid = digest.partition_id(ns.n_partitions);
        let rsv = ns.reserve(pid, &self.cluster);

        if !rsv.state.accepts_replica_writes() {
            drop(rsv);
            self.ack(src, msg, ResultCode::ClusterKeyMismatch);
            return;
        }

        let Some(record_buf) = msg.record.clone() else {
            tracing::warn!(src, %digest, "repl write: no pickle");
            self.ack(src, msg, ResultCode::Unknown);
            return;
        };

        let result = if pickle::is_drop(&record_buf, msg.info) {
            self.drop_replica(&ns, &digest, rsv.tree(), msg.info, src)
        } else {
            self.write_replica(&ns, &digest, rsv.tree(), &msg, &record_buf, src)
        };

        drop(rsv);
        self.ack(src, msg, result);
    }

    fn ack(&self, dest: NodeId, msg: RwMsg, result: ResultCode) {
        let ack = msg.into_ack(result.as_u32());
        if let Err(err) = self.fabric.send(dest, Channel::Rw, FabricMsg::Rw(ack)) {
            tracing::warn!(dest, ?err, "repl write ack send failed");
        }
    }

    fn drop_replica(
        &self,
        ns: &Arc<Namespace>,
        digest: &Digest,
        tree: &Arc<crate::index::IndexTree>,
        info: u32,
        master: NodeId,
    ) -> ResultCode {
        if !tree.delete(digest) {
            return ResultCode::NotFound;
        }
        if let Err(err) = ns.storage().delete_record(digest) {
            tracing::warn!(%digest, error = ?err, "drop replica: storage delete failed");
        }

        // Deletes driven by expiry or arriving from the shipping sink
        // itself are not shipped onward.
        if (info & (INFO_NSUP_DELETE | INFO_XDR)) == 0 {
            if let Ok(ship) = self.ship.lock() {
                if let Some(ship) = ship.as_ref() {
                    ship.ship_drop(&ns.name, digest, master);
                }
            }
        }

        ResultCode::Ok
    }

    fn write_replica(
        &self,
        ns: &Arc<Namespace>,
        digest: &Digest,
        tree: &Arc<crate::index::IndexTree>,
        msg: &RwMsg,
        record_buf: &Bytes,
        master: NodeId,
    ) -> ResultCode {
        if !ns.storage().has_space() {
            tracing::warn!(ns = %ns.name, "write replica: drives full");
            return ResultCode::OutOfSpace;
        }

        let Some(generation) = msg.generation else {
            tracing::warn!(%digest, "write replica: no generation");
            return ResultCode::Unknown;
        };
        let Some(last_update_time) = msg.last_update_time else {
            tracing::warn!(%digest, "write replica: no last-update-time");
            return ResultCode::Unknown;
        };
        let generation = generation.min(u32::from(u16::MAX)) as Generation;
        let void_time = msg.void_time.unwrap_or(0);
        let set_id = msg
            .set_name
            .as_deref()
            .map(|name| ns.set_id(name))
            .unwrap_or(0);

        let (record, created) = tree.get_or_create(*digest);

        if created && ns.is_truncated(set_id, last_update_time) {
            tree.delete(digest);
            return ResultCode::Forbidden;
        }

        {
            let mut core = record.lock();
            match pickle::unpickle(record_buf) {
                Err(err) => {
                    tracing::warn!(%digest, error = ?err, "write replica: unpickle failed");
                    self.stats.malformed_pickles.fetch_add(1, Ordering::Relaxed);
                    drop(core);
                    if created {
                        tree.delete(digest);
                    }
                    return ResultCode::Unknown;
                }
                Ok(bins) => {
                    core.bins = bins;
                    core.meta = RecordMeta {
                        generation,
                        last_update_time,
                        void_time,
                        set_id,
                    };
                    core.key = msg.key.clone();
                }
            }
        }

        if let Err(err) = ns.storage().write_record(digest, record_buf) {
            tracing::warn!(%digest, error = ?err, "write replica: storage write failed");
            return ResultCode::Unknown;
        }

        // Ship non-XDR-originated writes onward when a sink is attached.
        if (msg.info & INFO_XDR) == 0 {
            if let Ok(ship) = self.ship.lock() {
                if let Some(ship) = ship.as_ref() {
                    ship.ship_write(&ns.name, digest, generation, master);
                }
            }
        }

        ResultCode::Ok
    }
}

/// Build the info bits for a replicated-write message from the
/// transaction's flags, mirroring what the master knows about the
/// mutation.
pub fn pack_info_bits(
    is_xdr: bool,
    sindex_touched: bool,
    nsup_delete: bool,
    udf_write: bool,
    is_drop: bool,
) -> u32 {
    let mut info = 0;
    if is_xdr {
        info |= INFO_XDR;
    }
    if sindex_touched {
        info |= crate::msg::INFO_SINDEX_TOUCHED;
    }
    if nsup_delete {
        info |= INFO_NSUP_DELETE;
    }
    if udf_write {
        info |= crate::msg::INFO_UDF_WRITE;
    }
    if is_drop {
        info |= INFO_DROP;
    }
    info
}
