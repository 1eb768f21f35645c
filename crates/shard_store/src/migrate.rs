//! Partition migration: moves a partition's records from one node to
//! another while the cluster keeps serving requests.
//!
//! The outbound side (emigration) pops work from a process-wide queue,
//! runs the START handshake, streams every record of the tree as INSERT
//! messages, retransmits until each is acked, then closes with DONE. The
//! inbound side (immigration) installs arriving records through the merge
//! policy, deduplicates DONE, and reaps stale sessions in the background.
//!
//! Every loop rechecks the cluster key; a membership change is the
//! universal soft cancel. Aborted sessions release their resources and
//! rely on rebalance to reissue the transfer.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use shard_fabric::{Channel, Fabric, NodeId, SendError};

use crate::config::MigrateConfig;
use crate::error::StoreError;
use crate::msg::{FabricMsg, MigrateMsg, MigrateOp, INFO_DROP};
use crate::partition::{ClusterView, Namespace, PartitionState, Reservation, RxDecision};
use crate::pickle;
use crate::rec_props::RecProps;
use crate::record::{incoming_wins, Digest, Generation, RecordMeta};
use crate::stats::Stats;

/// Backpressure valve: an emigration stalls while this many bytes are
/// unacked in flight.
const MAX_BYTES_EMIGRATING: u64 = 32 * 1024 * 1024;
/// Reaper scan interval.
const REAPER_TICK_MS: u64 = 1_000;
/// Sleep between passes over a non-empty reinsert table.
const REINSERT_DRAIN_SLEEP_MS: u64 = 50;
/// Backoff when the bulk channel is full.
const QUEUE_FULL_BACKOFF_MS: u64 = 10;
/// Backpressure poll interval.
const BACKPRESSURE_SLEEP_MS: u64 = 1;
/// Warn about a silent destination after this many backpressure polls.
const MISSING_ACK_WARN_WAITS: u32 = 5_000;

pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis()
        .min(u128::from(u64::MAX)) as u64
}

/// Scheduling flag for an emigration. `Request` sessions bypass the
/// cost-ranked pop and run immediately.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EmigrationFlag {
    Normal,
    Request,
}

/// Notification that an immigration from `src` finished for `(ns, pid)`.
pub type DoneHook = Box<dyn Fn(&str, u32, NodeId) + Send + Sync>;

struct CtrlAck {
    emig_id: u32,
    op: MigrateOp,
}

struct ReinsertEntry {
    /// Time of the last transmit.
    xmit_ms: u64,
    msg: MigrateMsg,
}

/// One outbound partition transfer.
pub struct Emigration {
    id: u32,
    dest: NodeId,
    cluster_key: u64,
    flag: EmigrationFlag,
    aborted: AtomicBool,
    bytes_in_flight: AtomicU64,
    reinserts: Mutex<HashMap<u32, ReinsertEntry>>,
    ctrl_tx: mpsc::Sender<CtrlAck>,
    ctrl_rx: Mutex<mpsc::Receiver<CtrlAck>>,
    rsv: Mutex<Reservation>,
}

impl Emigration {
    fn new(id: u32, dest: NodeId, flag: EmigrationFlag, rsv: Reservation) -> Arc<Emigration> {
        let (ctrl_tx, ctrl_rx) = mpsc::channel();
        Arc::new(Emigration {
            id,
            dest,
            cluster_key: rsv.cluster_key,
            flag,
            aborted: AtomicBool::new(false),
            bytes_in_flight: AtomicU64::new(0),
            reinserts: Mutex::new(HashMap::new()),
            ctrl_tx,
            ctrl_rx: Mutex::new(ctrl_rx),
            rsv: Mutex::new(rsv),
        })
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn dest(&self) -> NodeId {
        self.dest
    }

    fn with_rsv<T>(&self, f: impl FnOnce(&Reservation) -> T) -> T {
        let rsv = match self.rsv.lock() {
            Ok(rsv) => rsv,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&rsv)
    }

    fn refresh_state(&self) -> PartitionState {
        let mut rsv = match self.rsv.lock() {
            Ok(rsv) => rsv,
            Err(poisoned) => poisoned.into_inner(),
        };
        rsv.refresh_state();
        rsv.state
    }

    fn tree_len(&self) -> usize {
        self.with_rsv(|rsv| rsv.tree().len())
    }

    fn migrate_order(&self) -> u32 {
        self.with_rsv(|rsv| rsv.ns().migrate_order)
    }

    fn abort(&self) {
        self.aborted.store(true, Ordering::Release);
    }

    fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::Acquire)
    }

    /// Unacked bytes currently in flight to the destination.
    pub fn bytes_in_flight(&self) -> u64 {
        self.bytes_in_flight.load(Ordering::Acquire)
    }
}

/// One inbound partition transfer, keyed by `(source, emig_id)`.
struct Immigration {
    src: NodeId,
    cluster_key: u64,
    done_recv: AtomicU32,
    start_recv_ms: u64,
    done_recv_ms: AtomicU64,
    rsv: Reservation,
}

enum QueueItem {
    Emig(Arc<Emigration>),
    /// Typed terminator: the consuming worker exits.
    Shutdown,
}

#[derive(Default)]
struct QueueInner {
    high: VecDeque<QueueItem>,
    normal: VecDeque<QueueItem>,
}

/// Emigration work queue with a scan-and-choose pop: among queued
/// sessions, prefer the one minimizing `(migrate_order, tree length)`, but
/// hand out immediately anything that needs no streaming work (empty tree,
/// request flag, stale cluster key) and any shutdown sentinel.
struct EmigrationQueue {
    inner: Mutex<QueueInner>,
    cv: Condvar,
}

impl EmigrationQueue {
    fn new() -> EmigrationQueue {
        EmigrationQueue {
            inner: Mutex::new(QueueInner::default()),
            cv: Condvar::new(),
        }
    }

    fn push_high(&self, item: QueueItem) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.high.push_back(item);
        }
        self.cv.notify_one();
    }

    fn push_normal(&self, item: QueueItem) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.normal.push_back(item);
        }
        self.cv.notify_one();
    }

    fn len(&self) -> usize {
        self.inner
            .lock()
            .map(|inner| inner.high.len() + inner.normal.len())
            .unwrap_or(0)
    }

    fn pop(&self, cluster_key: u64) -> QueueItem {
        let mut inner = match self.inner.lock() {
            Ok(inner) => inner,
            Err(poisoned) => poisoned.into_inner(),
        };
        loop {
            if let Some(item) = Self::choose(&mut inner, cluster_key) {
                return item;
            }
            inner = match self.cv.wait(inner) {
                Ok(inner) => inner,
                Err(poisoned) => poisoned.into_inner(),
            };
        }
    }

    fn choose(inner: &mut QueueInner, cluster_key: u64) -> Option<QueueItem> {
        let mut immediate: Option<(usize, usize)> = None;
        let mut best: Option<(usize, usize, u32, usize)> = None; // (deque, idx, order, len)

        'scan: for (deque_idx, deque) in [&inner.high, &inner.normal].into_iter().enumerate() {
            for (idx, item) in deque.iter().enumerate() {
                let emig = match item {
                    QueueItem::Shutdown => {
                        immediate = Some((deque_idx, idx));
                        break 'scan;
                    }
                    QueueItem::Emig(emig) => emig,
                };
                let tree_len = emig.tree_len();
                // No streaming work or already fenced off: run right away.
                if tree_len == 0
                    || emig.flag == EmigrationFlag::Request
                    || emig.cluster_key != cluster_key
                {
                    immediate = Some((deque_idx, idx));
                    break 'scan;
                }
                let order = emig.migrate_order();
                let better = match best {
                    None => true,
                    Some((_, _, best_order, best_len)) => {
                        (order, tree_len) < (best_order, best_len)
                    }
                };
                if better {
                    best = Some((deque_idx, idx, order, tree_len));
                }
            }
        }

        let (deque_idx, idx) = immediate.or_else(|| best.map(|(d, i, _, _)| (d, i)))?;
        Self::take(inner, deque_idx, idx)
    }

    fn take(inner: &mut QueueInner, deque_idx: usize, idx: usize) -> Option<QueueItem> {
        let deque = if deque_idx == 0 {
            &mut inner.high
        } else {
            &mut inner.normal
        };
        deque.remove(idx)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum SessionOutcome {
    Done,
    Error,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum StartOutcome {
    Stream,
    AlreadyDone,
    Error,
}

/// The migration service of one node: emigration workers, the immigration
/// registry, the reaper, and the fabric message handlers.
pub struct MigrateService {
    node_id: NodeId,
    fabric: Arc<dyn Fabric<FabricMsg>>,
    cluster: Arc<ClusterView>,
    namespaces: HashMap<String, Arc<Namespace>>,
    cfg: MigrateConfig,
    stats: Arc<Stats>,
    emigrations: Mutex<HashMap<u32, Arc<Emigration>>>,
    immigrations: Mutex<HashMap<(NodeId, u32), Arc<Immigration>>>,
    queue: EmigrationQueue,
    next_emig_id: AtomicU32,
    next_insert_id: AtomicU32,
    n_workers: AtomicUsize,
    shutdown: AtomicBool,
    done_hook: Mutex<Option<DoneHook>>,
}

impl MigrateService {
    pub fn new(
        node_id: NodeId,
        fabric: Arc<dyn Fabric<FabricMsg>>,
        cluster: Arc<ClusterView>,
        namespaces: Vec<Arc<Namespace>>,
        cfg: MigrateConfig,
        stats: Arc<Stats>,
    ) -> Arc<MigrateService> {
        Arc::new(MigrateService {
            node_id,
            fabric,
            cluster,
            namespaces: namespaces
                .into_iter()
                .map(|ns| (ns.name.clone(), ns))
                .collect(),
            cfg,
            stats,
            emigrations: Mutex::new(HashMap::new()),
            immigrations: Mutex::new(HashMap::new()),
            queue: EmigrationQueue::new(),
            next_emig_id: AtomicU32::new(0),
            next_insert_id: AtomicU32::new(0),
            n_workers: AtomicUsize::new(0),
            shutdown: AtomicBool::new(false),
            done_hook: Mutex::new(None),
        })
    }

    /// Spawn the worker pool and the immigration reaper.
    pub fn start(self: &Arc<Self>) {
        for _ in 0..self.cfg.n_migrate_threads.max(1) {
            self.spawn_worker();
        }
        let service = self.clone();
        thread::Builder::new()
            .name("migrate-reaper".to_string())
            .spawn(move || service.run_reaper())
            .expect("spawn immigration reaper");
    }

    /// Stop workers and the reaper. Queued sessions are abandoned; their
    /// reservations release as the queue drains on drop.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
        for _ in 0..self.n_workers.load(Ordering::Acquire) {
            self.queue.push_high(QueueItem::Shutdown);
        }
    }

    pub fn set_done_hook(&self, hook: DoneHook) {
        if let Ok(mut guard) = self.done_hook.lock() {
            *guard = Some(hook);
        }
    }

    /// Live worker-pool resize.
    pub fn set_migrate_threads(self: &Arc<Self>, n_threads: usize) {
        let n_threads = n_threads.max(1);
        loop {
            let current = self.n_workers.load(Ordering::Acquire);
            if current == n_threads {
                return;
            }
            if current < n_threads {
                self.spawn_worker();
            } else {
                self.queue.push_high(QueueItem::Shutdown);
                self.n_workers.fetch_sub(1, Ordering::AcqRel);
            }
        }
    }

    fn spawn_worker(self: &Arc<Self>) {
        let service = self.clone();
        self.n_workers.fetch_add(1, Ordering::AcqRel);
        thread::Builder::new()
            .name("migrate-tx".to_string())
            .spawn(move || service.run_emigration())
            .expect("spawn emigration worker");
    }

    /// Kick off an emigration of `(ns, pid)` to `dest`. Called by
    /// rebalance when it decides a transfer.
    pub fn emigrate(
        &self,
        ns: &Arc<Namespace>,
        pid: u32,
        dest: NodeId,
        flag: EmigrationFlag,
    ) -> u32 {
        let rsv = ns.reserve(pid, &self.cluster);
        let id = self.next_emig_id.fetch_add(1, Ordering::Relaxed) + 1;
        let emig = Emigration::new(id, dest, flag, rsv);
        self.stats.migrate_tx_objects.fetch_add(1, Ordering::Relaxed);
        self.queue.push_high(QueueItem::Emig(emig));
        id
    }

    pub fn emigration_count(&self) -> usize {
        self.emigrations.lock().map(|m| m.len()).unwrap_or(0)
    }

    pub fn immigration_count(&self) -> usize {
        self.immigrations.lock().map(|m| m.len()).unwrap_or(0)
    }

    /// Log migration state (the info-command dump).
    pub fn dump(&self) {
        tracing::info!(
            node = self.node_id,
            emigrations = self.emigration_count(),
            queued = self.queue.len(),
            immigrations = self.immigration_count(),
            emig_id = self.next_emig_id.load(Ordering::Relaxed),
            insert_id = self.next_insert_id.load(Ordering::Relaxed),
            "migration info"
        );
        if let Ok(emigrations) = self.emigrations.lock() {
            for (id, emig) in emigrations.iter() {
                tracing::info!(
                    id,
                    dest = emig.dest,
                    cluster_key = emig.cluster_key,
                    bytes_in_flight = emig.bytes_in_flight(),
                    "emigration"
                );
            }
        }
        if let Ok(immigrations) = self.immigrations.lock() {
            for ((src, id), immig) in immigrations.iter() {
                tracing::info!(
                    src,
                    id,
                    done_recv = immig.done_recv.load(Ordering::Relaxed),
                    start_recv_ms = immig.start_recv_ms,
                    done_recv_ms = immig.done_recv_ms.load(Ordering::Relaxed),
                    cluster_key = immig.cluster_key,
                    "immigration"
                );
            }
        }
    }

    //----------------------------------------------------------
    // Emigration worker.
    //

    fn run_emigration(self: Arc<Self>) {
        loop {
            let emig = match self.queue.pop(self.cluster.key()) {
                QueueItem::Shutdown => break,
                QueueItem::Emig(emig) => emig,
            };

            // A desync partition cannot stream yet; refresh and requeue.
            if emig.refresh_state() == PartitionState::Desync {
                tracing::debug!(id = emig.id, "requeueing desync emigration");
                self.queue.push_normal(QueueItem::Emig(emig));
                thread::sleep(Duration::from_millis(1));
                continue;
            }

            self.stats
                .migrate_progress_send
                .fetch_add(1, Ordering::Relaxed);

            let outcome = self.emigrate_session(&emig);

            if outcome == SessionOutcome::Done {
                // Tail of the hand-off: a zombie source lets go.
                emig.with_rsv(|rsv| {
                    let partition = rsv.partition();
                    if partition.state() == PartitionState::Zombie {
                        partition.set_state(PartitionState::Absent);
                    }
                });
            }

            Stats::progress_decr(&self.stats.migrate_progress_send, "migrate_progress_send");
            if let Ok(mut emigrations) = self.emigrations.lock() {
                emigrations.remove(&emig.id);
            }
            self.stats.migrate_tx_objects.fetch_sub(1, Ordering::Relaxed);
        }
    }

    fn emigrate_session(&self, emig: &Arc<Emigration>) -> SessionOutcome {
        if emig.cluster_key != self.cluster.key() {
            return SessionOutcome::Error;
        }

        let (state, pid) = emig.with_rsv(|rsv| (rsv.state, rsv.pid));
        match state {
            PartitionState::Desync => {
                // Checked at pop; reaching here is a programming error.
                panic!("can't emigrate from desync partition {pid}");
            }
            PartitionState::Sync | PartitionState::Zombie => {}
            PartitionState::Absent | PartitionState::Undef => {
                tracing::warn!(pid, state = ?state, "imbalance: unexpected partition state");
                self.stats
                    .migrate_tx_partitions_imbalance
                    .fetch_add(1, Ordering::Relaxed);
                return SessionOutcome::Error;
            }
        }

        // Register so acks can find the session.
        if let Ok(mut emigrations) = self.emigrations.lock() {
            emigrations.insert(emig.id, emig.clone());
        }

        match self.send_start(emig) {
            StartOutcome::Error => return SessionOutcome::Error,
            // The destination already has everything from a prior session.
            StartOutcome::AlreadyDone => return SessionOutcome::Done,
            StartOutcome::Stream => {}
        }

        if !self.emigrate_tree(emig) {
            return SessionOutcome::Error;
        }

        self.send_done(emig)
    }

    fn send_start(&self, emig: &Arc<Emigration>) -> StartOutcome {
        let (ns_name, pid) = emig.with_rsv(|rsv| (rsv.ns().name.clone(), rsv.pid));
        let start = MigrateMsg::start(emig.id, emig.cluster_key, &ns_name, pid);
        let mut xmit_ms = 0u64;

        loop {
            if emig.cluster_key != self.cluster.key() {
                return StartOutcome::Error;
            }

            let now = now_ms();
            if xmit_ms + self.cfg.retransmit_startdone_ms <= now {
                match self
                    .fabric
                    .send(emig.dest, Channel::Ctrl, FabricMsg::Migrate(start.clone()))
                {
                    Ok(()) => {
                        self.stats.migrate_msgs_sent.fetch_add(1, Ordering::Relaxed);
                    }
                    // NoNode is expected when the node drops; a new
                    // rebalance is imminent either way.
                    Err(SendError::NoNode(_)) => {}
                    Err(SendError::QueueFull(_)) => {}
                }
                xmit_ms = now;
            }

            match self.ctrl_recv(emig, self.cfg.retransmit_startdone_ms) {
                None => {}
                Some(ack) => {
                    debug_assert_eq!(ack.emig_id, emig.id);
                    match ack.op {
                        MigrateOp::StartAckOk => return StartOutcome::Stream,
                        MigrateOp::StartAckAlreadyDone => return StartOutcome::AlreadyDone,
                        MigrateOp::StartAckEagain => {
                            thread::sleep(Duration::from_millis(1));
                        }
                        MigrateOp::StartAckFail => {
                            tracing::warn!(
                                dest = emig.dest,
                                "destination refused migration with ACK_FAIL"
                            );
                            self.stats
                                .migrate_tx_partitions_imbalance
                                .fetch_add(1, Ordering::Relaxed);
                            return StartOutcome::Error;
                        }
                        other => {
                            tracing::warn!(op = ?other, "unexpected ctrl ack during start");
                        }
                    }
                }
            }
        }
    }

    fn emigrate_tree(&self, emig: &Arc<Emigration>) -> bool {
        let tree = emig.with_rsv(|rsv| rsv.tree().clone());
        if tree.is_empty() {
            return true;
        }

        let (ns, ns_name) = emig.with_rsv(|rsv| (rsv.ns().clone(), rsv.ns().name.clone()));

        tree.reduce(|record| {
            if emig.is_aborted() {
                return false;
            }
            if emig.cluster_key != self.cluster.key() {
                emig.abort();
                return false;
            }

            // Read and pickle under the record lock.
            let (pickled, meta, props) = {
                let core = record.lock();
                if core.bins.is_empty() {
                    // Entry emptied since the snapshot; nothing to ship.
                    return true;
                }
                let props = RecProps {
                    set_name: ns.set_name(core.meta.set_id),
                    key: core.key.clone(),
                };
                (pickle::pickle_bins(&core.bins), core.meta, props)
            };

            let msg = self.build_insert(emig, &ns_name, *record.digest(), &meta, pickled, &props);

            if !self.emigrate_record(emig, msg) {
                emig.abort();
                return false;
            }

            if self.cfg.sleep_us != 0 {
                thread::sleep(Duration::from_micros(self.cfg.sleep_us));
            }

            // The backpressure valve.
            let mut waits = 0u32;
            while emig.bytes_in_flight() > MAX_BYTES_EMIGRATING
                && emig.cluster_key == self.cluster.key()
            {
                thread::sleep(Duration::from_millis(BACKPRESSURE_SLEEP_MS));
                waits += 1;
                if waits % MISSING_ACK_WARN_WAITS == 0 {
                    tracing::warn!(dest = emig.dest, "missing acks from node");
                }
            }

            true
        });

        if emig.is_aborted() {
            return false;
        }

        self.drain_reinserts(emig)
    }

    fn build_insert(
        &self,
        emig: &Emigration,
        ns_name: &str,
        digest: Digest,
        meta: &RecordMeta,
        pickled: bytes::Bytes,
        props: &RecProps,
    ) -> MigrateMsg {
        MigrateMsg {
            op: MigrateOp::Insert,
            emig_id: emig.id,
            insert_id: Some(self.next_insert_id.fetch_add(1, Ordering::Relaxed) + 1),
            namespace: Some(ns_name.to_string()),
            pid: None,
            digest: Some(digest),
            generation: Some(u32::from(meta.generation)),
            void_time: Some(meta.void_time),
            last_update_time: Some(meta.last_update_time),
            record: Some(pickled),
            rec_props: props.encode(),
            cluster_key: None,
            info: 0,
            compat_type: None,
            version: 0,
        }
    }

    /// Park the message for retransmission, account its bytes, and send
    /// it. Returns false on a fatal send failure.
    fn emigrate_record(&self, emig: &Arc<Emigration>, msg: MigrateMsg) -> bool {
        let insert_id = msg.insert_id.unwrap_or(0);
        let size = msg.wire_size() as u64;

        {
            let mut reinserts = match emig.reinserts.lock() {
                Ok(reinserts) => reinserts,
                Err(poisoned) => poisoned.into_inner(),
            };
            reinserts.insert(
                insert_id,
                ReinsertEntry {
                    xmit_ms: now_ms(),
                    msg: msg.clone(),
                },
            );
        }
        emig.bytes_in_flight.fetch_add(size, Ordering::AcqRel);

        let mut msg = FabricMsg::Migrate(msg);
        loop {
            match self.fabric.send(emig.dest, Channel::Bulk, msg) {
                Ok(()) => {
                    self.stats.migrate_msgs_sent.fetch_add(1, Ordering::Relaxed);
                    return true;
                }
                Err(SendError::QueueFull(returned)) => {
                    if emig.cluster_key != self.cluster.key() {
                        return false;
                    }
                    msg = returned;
                    thread::sleep(Duration::from_millis(QUEUE_FULL_BACKOFF_MS));
                }
                Err(SendError::NoNode(_)) => {
                    // New rebalance expected.
                    return false;
                }
            }
        }
    }

    /// Reduce over the reinsert table until every INSERT is acked.
    fn drain_reinserts(&self, emig: &Arc<Emigration>) -> bool {
        loop {
            if emig.cluster_key != self.cluster.key() {
                return false;
            }

            let now = now_ms();
            let mut no_node = false;
            {
                let mut reinserts = match emig.reinserts.lock() {
                    Ok(reinserts) => reinserts,
                    Err(poisoned) => poisoned.into_inner(),
                };
                for entry in reinserts.values_mut() {
                    if entry.xmit_ms + self.cfg.retransmit_ms > now {
                        continue;
                    }
                    match self.fabric.send(
                        emig.dest,
                        Channel::Bulk,
                        FabricMsg::Migrate(entry.msg.clone()),
                    ) {
                        Ok(()) => {
                            self.stats.migrate_msgs_sent.fetch_add(1, Ordering::Relaxed);
                            entry.xmit_ms = now;
                        }
                        // Queue full: give the channel a breather and
                        // finish this pass later.
                        Err(SendError::QueueFull(_)) => break,
                        Err(SendError::NoNode(_)) => {
                            no_node = true;
                            break;
                        }
                    }
                }
                if !no_node && reinserts.is_empty() {
                    return true;
                }
            }
            if no_node {
                return false;
            }

            thread::sleep(Duration::from_millis(REINSERT_DRAIN_SLEEP_MS));
        }
    }

    fn send_done(&self, emig: &Arc<Emigration>) -> SessionOutcome {
        let (ns_name, pid) = emig.with_rsv(|rsv| (rsv.ns().name.clone(), rsv.pid));
        let done = MigrateMsg::done(emig.id, &ns_name, pid);
        let mut xmit_ms = 0u64;

        loop {
            if emig.cluster_key != self.cluster.key() {
                return SessionOutcome::Error;
            }

            let now = now_ms();
            if xmit_ms + self.cfg.retransmit_startdone_ms <= now {
                match self
                    .fabric
                    .send(emig.dest, Channel::Ctrl, FabricMsg::Migrate(done.clone()))
                {
                    Ok(()) => {
                        self.stats.migrate_msgs_sent.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(SendError::NoNode(_)) => return SessionOutcome::Error,
                    Err(SendError::QueueFull(_)) => {}
                }
                xmit_ms = now;
            }

            if let Some(ack) = self.ctrl_recv(emig, self.cfg.retransmit_startdone_ms) {
                if ack.emig_id == emig.id && ack.op == MigrateOp::DoneAck {
                    return SessionOutcome::Done;
                }
            }
        }
    }

    fn ctrl_recv(&self, emig: &Emigration, timeout_ms: u64) -> Option<CtrlAck> {
        let rx = match emig.ctrl_rx.lock() {
            Ok(rx) => rx,
            Err(poisoned) => poisoned.into_inner(),
        };
        match rx.recv_timeout(Duration::from_millis(timeout_ms)) {
            Ok(ack) => Some(ack),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
        }
    }

    //----------------------------------------------------------
    // Fabric message handling.
    //

    pub fn handle_msg(&self, src: NodeId, msg: MigrateMsg) {
        self.stats.migrate_msgs_rcvd.fetch_add(1, Ordering::Relaxed);

        match msg.op {
            MigrateOp::Start => self.handle_start(src, msg),
            MigrateOp::Insert => self.handle_insert(src, msg),
            MigrateOp::Done => self.handle_done(src, msg),
            MigrateOp::InsertAck => self.handle_insert_ack(src, msg),
            op if op.is_ctrl_ack() => self.handle_ctrl_ack(src, msg),
            op => {
                tracing::warn!(?op, "received unexpected migrate op");
            }
        }
    }

    fn reply(&self, dest: NodeId, channel: Channel, msg: MigrateMsg) {
        match self.fabric.send(dest, channel, FabricMsg::Migrate(msg)) {
            Ok(()) => {
                self.stats.migrate_msgs_sent.fetch_add(1, Ordering::Relaxed);
            }
            Err(err) => {
                tracing::debug!(dest, ?err, "migrate reply dropped");
            }
        }
    }

    fn handle_start(&self, src: NodeId, msg: MigrateMsg) {
        let emig_id = msg.emig_id;

        let Some(cluster_key) = msg.cluster_key else {
            tracing::warn!(src, "handle start: no cluster key");
            return;
        };
        if cluster_key != self.cluster.key() {
            // Sender may be ahead of us; tell it to try again.
            self.reply(src, Channel::Ctrl, msg.into_ack(MigrateOp::StartAckEagain));
            return;
        }

        let Some(ns) = msg.namespace.as_deref().and_then(|n| self.namespaces.get(n)) else {
            tracing::warn!(src, "handle start: bad namespace");
            return;
        };
        let ns = ns.clone();
        let Some(pid) = msg.pid else {
            tracing::warn!(src, "handle start: no partition");
            return;
        };

        match ns.partition(pid).immigration_decision(src) {
            RxDecision::Fail => {
                self.reply(src, Channel::Ctrl, msg.into_ack(MigrateOp::StartAckFail));
                return;
            }
            RxDecision::AlreadyDone => {
                self.reply(
                    src,
                    Channel::Ctrl,
                    msg.into_ack(MigrateOp::StartAckAlreadyDone),
                );
                return;
            }
            RxDecision::Ok => {}
        }

        let rsv = ns.reserve(pid, &self.cluster);
        if rsv.cluster_key != cluster_key {
            // The key moved between the check and the reservation.
            self.reply(src, Channel::Ctrl, msg.into_ack(MigrateOp::StartAckEagain));
            return;
        }

        {
            let mut immigrations = match self.immigrations.lock() {
                Ok(immigrations) => immigrations,
                Err(poisoned) => poisoned.into_inner(),
            };
            // Duplicate START is idempotent: the live session continues.
            immigrations.entry((src, emig_id)).or_insert_with(|| {
                self.stats.migrate_rx_objects.fetch_add(1, Ordering::Relaxed);
                self.stats
                    .migrate_progress_recv
                    .fetch_add(1, Ordering::Relaxed);
                Arc::new(Immigration {
                    src,
                    cluster_key,
                    done_recv: AtomicU32::new(0),
                    start_recv_ms: now_ms(),
                    done_recv_ms: AtomicU64::new(0),
                    rsv,
                })
            });
        }

        self.reply(src, Channel::Ctrl, msg.into_ack(MigrateOp::StartAckOk));
    }

    fn handle_insert(&self, src: NodeId, msg: MigrateMsg) {
        let Some(digest) = msg.digest else {
            tracing::warn!(src, "handle insert: no digest");
            return;
        };
        if msg.insert_id.is_none() {
            tracing::warn!(src, "handle insert: no insert id");
            return;
        }

        let immig = self
            .immigrations
            .lock()
            .ok()
            .and_then(|m| m.get(&(src, msg.emig_id)).cloned());

        if let Some(immig) = immig {
            if immig.cluster_key != self.cluster.key() {
                // Fenced off; the sender will notice the key change.
                return;
            }

            let generation = match msg.generation {
                None => {
                    tracing::warn!(src, %digest, "handle insert: no generation - making it 1");
                    1
                }
                Some(0) => {
                    tracing::warn!(src, %digest, "handle insert: generation 0 - making it 1");
                    1
                }
                Some(g) => g.min(u32::from(u16::MAX)) as Generation,
            };
            let last_update_time = msg.last_update_time.unwrap_or(0);
            let void_time = msg.void_time.unwrap_or(0);

            let Some(record_buf) = msg.record.clone() else {
                tracing::warn!(src, %digest, "handle insert: got no record");
                return;
            };
            let props = match msg.rec_props.as_deref().map(RecProps::decode) {
                None => RecProps::default(),
                Some(Ok(props)) => props,
                Some(Err(err)) => {
                    tracing::warn!(src, %digest, error = ?err, "handle insert: bad rec-props");
                    RecProps::default()
                }
            };

            match pickle::peek_bin_count(&record_buf) {
                Err(err) => {
                    tracing::warn!(src, %digest, error = ?err, "handle insert: malformed pickle");
                    self.stats.malformed_pickles.fetch_add(1, Ordering::Relaxed);
                }
                Ok(0) if (msg.info & INFO_DROP) != 0 => {
                    let tree = immig.rsv.tree();
                    if tree.delete(&digest) {
                        if let Err(err) = immig.rsv.ns().storage().delete_record(&digest) {
                            tracing::warn!(%digest, error = ?err, "drop: storage delete failed");
                        }
                    }
                }
                Ok(0) => {
                    // Binless pickle without the drop bit is malformed.
                    tracing::warn!(src, %digest, "handle insert: binless pickle without drop bit");
                    self.stats.malformed_pickles.fetch_add(1, Ordering::Relaxed);
                }
                Ok(_) => {
                    let meta = RecordMeta {
                        generation,
                        last_update_time,
                        void_time,
                        set_id: 0, // interned below
                    };
                    if let Err(err) =
                        self.apply_merge(&immig.rsv, digest, meta, &record_buf, &props)
                    {
                        match err {
                            StoreError::Forbidden | StoreError::OutOfSpace => {
                                tracing::warn!(%digest, error = %err, "handle insert: rejected");
                            }
                            StoreError::PickleMalformed(_) => {
                                self.stats.malformed_pickles.fetch_add(1, Ordering::Relaxed);
                                tracing::warn!(%digest, error = %err, "handle insert: rejected");
                            }
                            other => {
                                tracing::warn!(%digest, error = %other, "handle insert: failed");
                            }
                        }
                    }
                }
            }
        }

        // Always ack positively; the sender's retry stops either way.
        self.reply(src, Channel::Bulk, msg.into_ack(MigrateOp::InsertAck));
    }

    /// The merge policy, applied under the per-record lock. Larger
    /// `(last_update_time, generation)` wins; the incoming loser changes
    /// nothing.
    fn apply_merge(
        &self,
        rsv: &Reservation,
        digest: Digest,
        mut meta: RecordMeta,
        record_buf: &[u8],
        props: &RecProps,
    ) -> Result<(), StoreError> {
        let ns = rsv.ns();
        meta.set_id = props
            .set_name
            .as_deref()
            .map(|name| ns.set_id(name))
            .unwrap_or(0);

        if ns.is_truncated(meta.set_id, meta.last_update_time) {
            return Err(StoreError::Forbidden);
        }
        if !ns.storage().has_space() {
            return Err(StoreError::OutOfSpace);
        }

        let tree = rsv.tree();
        let (record, created) = tree.get_or_create(digest);
        let mut lost = false;
        let result = {
            let mut core = record.lock();
            if !created && !incoming_wins(meta.conflict_key(), core.meta.conflict_key()) {
                lost = true;
                Ok(())
            } else {
                match pickle::unpickle(record_buf) {
                    Err(err) => Err(StoreError::PickleMalformed(err.to_string())),
                    Ok(bins) => {
                        core.bins = bins;
                        core.meta = meta;
                        core.key = props.key.clone();
                        Ok(())
                    }
                }
            }
        };

        match &result {
            Err(_) => {
                // A created entry must not survive with zero bins.
                if created {
                    tree.delete(&digest);
                }
            }
            Ok(()) if !lost => {
                if let Err(err) = ns.storage().write_record(&digest, record_buf) {
                    tracing::warn!(%digest, error = ?err, "merge: storage write failed");
                }
            }
            Ok(()) => {}
        }
        result
    }

    fn handle_done(&self, src: NodeId, msg: MigrateMsg) {
        let emig_id = msg.emig_id;
        let immig = self
            .immigrations
            .lock()
            .ok()
            .and_then(|m| m.get(&(src, emig_id)).cloned());

        match immig {
            Some(immig) => {
                if immig.done_recv.fetch_add(1, Ordering::AcqRel) == 0 {
                    // First DONE observed for this session.
                    immig.done_recv_ms.store(now_ms(), Ordering::Release);
                    Stats::progress_decr(
                        &self.stats.migrate_progress_recv,
                        "migrate_progress_recv",
                    );

                    let partition = immig.rsv.partition();
                    if partition.record_immigration_done(immig.src) {
                        if let Ok(hook) = self.done_hook.lock() {
                            if let Some(hook) = hook.as_ref() {
                                hook(&immig.rsv.ns().name, immig.rsv.pid, immig.src);
                            }
                        }
                    }

                    if self.cfg.rx_lifetime_ms == 0 {
                        if let Ok(mut immigrations) = self.immigrations.lock() {
                            if immigrations.remove(&(src, emig_id)).is_some() {
                                self.stats.migrate_rx_objects.fetch_sub(1, Ordering::Relaxed);
                            }
                        }
                    }
                }
                // else - a retransmitted DONE; observably a no-op.
            }
            None => {
                tracing::debug!(src, emig_id, "done for unknown immigration, acking anyway");
            }
        }

        self.reply(src, Channel::Ctrl, msg.into_ack(MigrateOp::DoneAck));
    }

    fn handle_insert_ack(&self, src: NodeId, msg: MigrateMsg) {
        let emig = self
            .emigrations
            .lock()
            .ok()
            .and_then(|m| m.get(&msg.emig_id).cloned());
        let Some(emig) = emig else {
            // Probably from a migration prior to the latest rebalance.
            return;
        };
        let Some(insert_id) = msg.insert_id else {
            tracing::warn!(src, "insert ack: no insert id");
            return;
        };
        if src != emig.dest {
            tracing::warn!(src, dest = emig.dest, "insert ack: unexpected source");
            return;
        }

        let removed = {
            let mut reinserts = match emig.reinserts.lock() {
                Ok(reinserts) => reinserts,
                Err(poisoned) => poisoned.into_inner(),
            };
            reinserts.remove(&insert_id)
        };
        if let Some(entry) = removed {
            let size = entry.msg.wire_size() as u64;
            let prev = emig.bytes_in_flight.fetch_sub(size, Ordering::AcqRel);
            if prev < size {
                tracing::warn!("bytes_in_flight went negative");
                emig.bytes_in_flight.store(0, Ordering::Release);
            }
        }
        // Duplicate acks find nothing to remove and are ignored.
    }

    fn handle_ctrl_ack(&self, src: NodeId, msg: MigrateMsg) {
        let emig = self
            .emigrations
            .lock()
            .ok()
            .and_then(|m| m.get(&msg.emig_id).cloned());
        match emig {
            Some(emig) => {
                if src != emig.dest {
                    tracing::warn!(src, op = ?msg.op, "ctrl ack: unexpected source");
                    return;
                }
                let _ = emig.ctrl_tx.send(CtrlAck {
                    emig_id: msg.emig_id,
                    op: msg.op,
                });
            }
            None => {
                tracing::debug!(src, emig_id = msg.emig_id, op = ?msg.op, "ctrl ack: no session");
            }
        }
    }

    //----------------------------------------------------------
    // Immigration reaper.
    //

    fn run_reaper(self: Arc<Self>) {
        while !self.shutdown.load(Ordering::Acquire) {
            // Sleep in small steps so shutdown is prompt.
            for _ in 0..(REAPER_TICK_MS / 100).max(1) {
                thread::sleep(Duration::from_millis(100));
                if self.shutdown.load(Ordering::Acquire) {
                    return;
                }
            }
            self.reap_once();
        }
    }

    fn reap_once(&self) {
        let now = now_ms();
        let cluster_key = self.cluster.key();
        let mut immigrations = match self.immigrations.lock() {
            Ok(immigrations) => immigrations,
            Err(poisoned) => poisoned.into_inner(),
        };
        immigrations.retain(|(src, emig_id), immig| {
            if immig.start_recv_ms == 0 {
                return true;
            }
            let done = immig.done_recv.load(Ordering::Acquire) != 0;
            let stale = immig.cluster_key != cluster_key;
            let expired = self.cfg.rx_lifetime_ms > 0
                && done
                && now > immig.done_recv_ms.load(Ordering::Acquire) + self.cfg.rx_lifetime_ms;
            if !(stale || expired) {
                return true;
            }
            if !done {
                // Never completed; the progress gauge still counts it.
                Stats::progress_decr(&self.stats.migrate_progress_recv, "migrate_progress_recv");
            }
            self.stats.migrate_rx_objects.fetch_sub(1, Ordering::Relaxed);
            tracing::debug!(src, emig_id, stale, expired, "reaping immigration");
            false
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;

    fn queue_with(emigs: Vec<Arc<Emigration>>) -> EmigrationQueue {
        let queue = EmigrationQueue::new();
        for emig in emigs {
            queue.push_normal(QueueItem::Emig(emig));
        }
        queue
    }

    fn emig_for(ns: &Arc<Namespace>, pid: u32, id: u32, cluster: &ClusterView) -> Arc<Emigration> {
        let rsv = ns.reserve(pid, cluster);
        Emigration::new(id, 2, EmigrationFlag::Normal, rsv)
    }

    fn fill(ns: &Arc<Namespace>, pid: u32, count: u8) {
        for n in 0..count {
            let (record, _) = ns.partition(pid).tree().get_or_create(Digest([n + 1; 20]));
            record.lock().bins.push(crate::record::Bin::new(
                "x",
                crate::record::Particle::Integer(i64::from(n)),
            ));
        }
    }

    #[test]
    fn pop_prefers_smaller_tree_at_equal_order() {
        let cluster = ClusterView::new(1);
        let ns = Namespace::new("test", 1, 8, MemoryStorage::unbounded());
        fill(&ns, 0, 5);
        fill(&ns, 1, 2);

        let big = emig_for(&ns, 0, 1, &cluster);
        let small = emig_for(&ns, 1, 2, &cluster);
        let queue = queue_with(vec![big, small]);

        match queue.pop(cluster.key()) {
            QueueItem::Emig(emig) => assert_eq!(emig.id(), 2),
            QueueItem::Shutdown => panic!("unexpected shutdown"),
        }
    }

    #[test]
    fn pop_returns_empty_tree_session_immediately() {
        let cluster = ClusterView::new(1);
        let ns = Namespace::new("test", 1, 8, MemoryStorage::unbounded());
        fill(&ns, 0, 1);

        let nonempty = emig_for(&ns, 0, 1, &cluster);
        let empty = emig_for(&ns, 1, 2, &cluster);
        let queue = queue_with(vec![nonempty, empty]);

        match queue.pop(cluster.key()) {
            QueueItem::Emig(emig) => assert_eq!(emig.id(), 2),
            QueueItem::Shutdown => panic!("unexpected shutdown"),
        }
    }

    #[test]
    fn pop_returns_stale_cluster_key_session_immediately() {
        let cluster = ClusterView::new(1);
        let ns = Namespace::new("test", 1, 8, MemoryStorage::unbounded());
        fill(&ns, 0, 1);
        fill(&ns, 1, 3);

        let fresh = emig_for(&ns, 0, 1, &cluster);
        let stale = emig_for(&ns, 1, 2, &cluster);
        cluster.advance();
        let current = cluster.key();
        // Both are now stale relative to `current`; the scan should hand
        // one out immediately rather than rank them.
        let queue = queue_with(vec![fresh, stale]);
        match queue.pop(current) {
            QueueItem::Emig(emig) => assert_eq!(emig.id(), 1),
            QueueItem::Shutdown => panic!("unexpected shutdown"),
        }
    }

    #[test]
    fn shutdown_sentinel_wins_over_work() {
        let cluster = ClusterView::new(1);
        let ns = Namespace::new("test", 1, 8, MemoryStorage::unbounded());
        fill(&ns, 0, 1);
        let emig = emig_for(&ns, 0, 1, &cluster);

        let queue = queue_with(vec![emig]);
        queue.push_high(QueueItem::Shutdown);
        assert!(matches!(queue.pop(cluster.key()), QueueItem::Shutdown));
    }
}
