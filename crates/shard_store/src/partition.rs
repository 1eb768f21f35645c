//! Partitions, namespaces, and the reservation that pins a partition
//! against concurrent rebalance.
//!
//! A `Reservation` is the archetypal scoped resource: obtaining one bumps
//! the partition's pin count, dropping it releases the pin on every exit
//! path including panics. Rebalance must not move a partition away while
//! pins are outstanding.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use shard_fabric::NodeId;

use crate::index::IndexTree;
use crate::storage::StorageEngine;

/// Partition state. The graph is `Undef -> Absent -> Desync -> Sync <->
/// Zombie`; transitions are driven by rebalance only.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PartitionState {
    Undef,
    Absent,
    /// Local copy incomplete; expecting immigration.
    Desync,
    /// Local copy authoritative.
    Sync,
    /// Local copy exists and serves reads during the tail of a hand-off.
    Zombie,
}

impl PartitionState {
    /// States an emigration may stream from.
    pub fn can_emigrate(self) -> bool {
        matches!(self, PartitionState::Sync | PartitionState::Zombie)
    }

    /// States that accept replica writes.
    pub fn accepts_replica_writes(self) -> bool {
        matches!(self, PartitionState::Sync | PartitionState::Desync)
    }

    /// States that accept an inbound migration.
    pub fn accepts_immigration(self) -> bool {
        matches!(self, PartitionState::Sync | PartitionState::Desync)
    }

    fn transition_allowed(self, to: PartitionState) -> bool {
        use PartitionState::*;
        matches!(
            (self, to),
            (Undef, Absent)
                | (Absent, Desync)
                | (Desync, Sync)
                | (Sync, Zombie)
                | (Zombie, Sync)
                | (Zombie, Absent)
        )
    }
}

/// Decision for an inbound migration START.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RxDecision {
    Ok,
    Fail,
    AlreadyDone,
}

/// The cluster-key fence. The membership subsystem bumps the epoch on
/// every composition change; everything in this crate rechecks it before
/// applying work.
#[derive(Debug)]
pub struct ClusterView {
    key: AtomicU64,
}

impl ClusterView {
    pub fn new(initial_key: u64) -> Arc<ClusterView> {
        Arc::new(ClusterView {
            key: AtomicU64::new(initial_key),
        })
    }

    pub fn key(&self) -> u64 {
        self.key.load(Ordering::Acquire)
    }

    /// Bump the epoch (a membership change happened). Returns the new key.
    pub fn advance(&self) -> u64 {
        self.key.fetch_add(1, Ordering::AcqRel) + 1
    }
}

/// One partition of a namespace.
pub struct Partition {
    pub id: u32,
    state: RwLock<PartitionState>,
    tree: Arc<IndexTree>,
    reservations: AtomicU32,
    immigrations_done: Mutex<HashSet<NodeId>>,
}

impl Partition {
    fn new(id: u32) -> Arc<Partition> {
        Arc::new(Partition {
            id,
            state: RwLock::new(PartitionState::Absent),
            tree: Arc::new(IndexTree::new()),
            reservations: AtomicU32::new(0),
            immigrations_done: Mutex::new(HashSet::new()),
        })
    }

    pub fn state(&self) -> PartitionState {
        self.state.read().map(|s| *s).unwrap_or(PartitionState::Undef)
    }

    /// Rebalance-driven state change. Illegal transitions are applied but
    /// flagged; the state graph is a rebalance contract, not a local one.
    pub fn set_state(&self, to: PartitionState) {
        if let Ok(mut state) = self.state.write() {
            if !state.transition_allowed(to) && *state != to {
                tracing::warn!(
                    pid = self.id,
                    from = ?*state,
                    to = ?to,
                    "partition state transition outside the rebalance graph"
                );
            }
            *state = to;
        }
    }

    pub fn tree(&self) -> &Arc<IndexTree> {
        &self.tree
    }

    /// Outstanding reservations; rebalance waits for zero before moving
    /// the partition away.
    pub fn reservation_count(&self) -> u32 {
        self.reservations.load(Ordering::Acquire)
    }

    /// Evaluate an inbound migration START from `src`.
    pub fn immigration_decision(&self, src: NodeId) -> RxDecision {
        if !self.state().accepts_immigration() {
            return RxDecision::Fail;
        }
        let done = match self.immigrations_done.lock() {
            Ok(done) => done,
            Err(poisoned) => poisoned.into_inner(),
        };
        if done.contains(&src) {
            RxDecision::AlreadyDone
        } else {
            RxDecision::Ok
        }
    }

    /// Record that the immigration from `src` completed. First completion
    /// moves a desync partition to sync. Returns true on first completion.
    pub fn record_immigration_done(&self, src: NodeId) -> bool {
        let first = {
            let mut done = match self.immigrations_done.lock() {
                Ok(done) => done,
                Err(poisoned) => poisoned.into_inner(),
            };
            done.insert(src)
        };
        if first && self.state() == PartitionState::Desync {
            self.set_state(PartitionState::Sync);
        }
        first
    }

    /// Forget immigration history; called when rebalance re-plans under a
    /// new cluster key.
    pub fn reset_immigration_history(&self) {
        if let Ok(mut done) = self.immigrations_done.lock() {
            done.clear();
        }
    }
}

/// A namespace: a fixed number of partitions plus per-namespace policy.
pub struct Namespace {
    pub name: String,
    pub id: u32,
    pub n_partitions: u32,
    /// Lower orders migrate first when emigrations compete for workers.
    pub migrate_order: u32,
    partitions: Vec<Arc<Partition>>,
    storage: Arc<dyn StorageEngine>,
    set_names: RwLock<Vec<String>>,
    truncate_luts: RwLock<HashMap<u16, u64>>,
}

impl Namespace {
    pub fn new(
        name: impl Into<String>,
        id: u32,
        n_partitions: u32,
        storage: Arc<dyn StorageEngine>,
    ) -> Arc<Namespace> {
        let n_partitions = n_partitions.max(1);
        Arc::new(Namespace {
            name: name.into(),
            id,
            n_partitions,
            migrate_order: 5,
            partitions: (0..n_partitions).map(Partition::new).collect(),
            storage,
            set_names: RwLock::new(Vec::new()),
            truncate_luts: RwLock::new(HashMap::new()),
        })
    }

    pub fn partition(&self, pid: u32) -> &Arc<Partition> {
        &self.partitions[(pid % self.n_partitions) as usize]
    }

    pub fn storage(&self) -> &Arc<dyn StorageEngine> {
        &self.storage
    }

    /// Intern a set name into its small-integer tag. Tag 0 means no set.
    pub fn set_id(&self, set_name: &str) -> u16 {
        if set_name.is_empty() {
            return 0;
        }
        if let Ok(names) = self.set_names.read() {
            if let Some(idx) = names.iter().position(|n| n == set_name) {
                return idx as u16 + 1;
            }
        }
        let mut names = match self.set_names.write() {
            Ok(names) => names,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(idx) = names.iter().position(|n| n == set_name) {
            return idx as u16 + 1;
        }
        names.push(set_name.to_string());
        names.len() as u16
    }

    pub fn set_name(&self, set_id: u16) -> Option<String> {
        if set_id == 0 {
            return None;
        }
        self.set_names
            .read()
            .ok()?
            .get(set_id as usize - 1)
            .cloned()
    }

    /// Install a truncate floor: writes to `set_id` with a last-update-time
    /// strictly below `lut` are forbidden.
    pub fn truncate_before(&self, set_id: u16, lut: u64) {
        if let Ok(mut luts) = self.truncate_luts.write() {
            let floor = luts.entry(set_id).or_insert(0);
            *floor = (*floor).max(lut);
        }
    }

    pub fn is_truncated(&self, set_id: u16, lut: u64) -> bool {
        self.truncate_luts
            .read()
            .ok()
            .and_then(|luts| luts.get(&set_id).copied())
            .map(|floor| lut < floor)
            .unwrap_or(false)
    }

    /// Pin `pid` against rebalance. Infallible; callers must check the
    /// snapshot `state` before using the tree.
    pub fn reserve(self: &Arc<Self>, pid: u32, cluster: &ClusterView) -> Reservation {
        let partition = self.partition(pid).clone();
        partition.reservations.fetch_add(1, Ordering::AcqRel);
        Reservation {
            state: partition.state(),
            cluster_key: cluster.key(),
            tree: partition.tree().clone(),
            ns: self.clone(),
            partition,
            pid,
        }
    }
}

/// Scoped pin on a (namespace, partition). Holds the tree handle and a
/// snapshot of the partition state and cluster key at reservation time.
pub struct Reservation {
    ns: Arc<Namespace>,
    partition: Arc<Partition>,
    pub pid: u32,
    pub state: PartitionState,
    pub cluster_key: u64,
    tree: Arc<IndexTree>,
}

impl Reservation {
    pub fn ns(&self) -> &Arc<Namespace> {
        &self.ns
    }

    pub fn partition(&self) -> &Arc<Partition> {
        &self.partition
    }

    pub fn tree(&self) -> &Arc<IndexTree> {
        &self.tree
    }

    /// Re-snapshot the partition state (used when a queued emigration is
    /// popped long after it was planned).
    pub fn refresh_state(&mut self) {
        self.state = self.partition.state();
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        self.partition.reservations.fetch_sub(1, Ordering::AcqRel);
    }
}
