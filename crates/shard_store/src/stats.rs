//! Migration and replicated-write counters.
//!
//! One `Stats` block is shared by a node's services. Counters are plain
//! relaxed atomics; `snapshot` is for introspection and tests.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

#[derive(Default)]
pub struct Stats {
    pub migrate_msgs_sent: AtomicU64,
    pub migrate_msgs_rcvd: AtomicU64,
    pub migrate_tx_objects: AtomicU64,
    pub migrate_rx_objects: AtomicU64,
    pub migrate_progress_send: AtomicI64,
    pub migrate_progress_recv: AtomicI64,
    pub migrate_tx_partitions_imbalance: AtomicU64,
    pub malformed_pickles: AtomicU64,
    pub repl_writes_started: AtomicU64,
    pub repl_writes_completed: AtomicU64,
    pub repl_writes_timedout: AtomicU64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub migrate_msgs_sent: u64,
    pub migrate_msgs_rcvd: u64,
    pub migrate_tx_objects: u64,
    pub migrate_rx_objects: u64,
    pub migrate_progress_send: i64,
    pub migrate_progress_recv: i64,
    pub migrate_tx_partitions_imbalance: u64,
    pub malformed_pickles: u64,
    pub repl_writes_started: u64,
    pub repl_writes_completed: u64,
    pub repl_writes_timedout: u64,
}

impl Stats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            migrate_msgs_sent: self.migrate_msgs_sent.load(Ordering::Relaxed),
            migrate_msgs_rcvd: self.migrate_msgs_rcvd.load(Ordering::Relaxed),
            migrate_tx_objects: self.migrate_tx_objects.load(Ordering::Relaxed),
            migrate_rx_objects: self.migrate_rx_objects.load(Ordering::Relaxed),
            migrate_progress_send: self.migrate_progress_send.load(Ordering::Relaxed),
            migrate_progress_recv: self.migrate_progress_recv.load(Ordering::Relaxed),
            migrate_tx_partitions_imbalance: self
                .migrate_tx_partitions_imbalance
                .load(Ordering::Relaxed),
            malformed_pickles: self.malformed_pickles.load(Ordering::Relaxed),
            repl_writes_started: self.repl_writes_started.load(Ordering::Relaxed),
            repl_writes_completed: self.repl_writes_completed.load(Ordering::Relaxed),
            repl_writes_timedout: self.repl_writes_timedout.load(Ordering::Relaxed),
        }
    }

    /// Decrement a progress gauge, flagging if it would go negative.
    pub fn progress_decr(gauge: &AtomicI64, what: &str) {
        if gauge.fetch_sub(1, Ordering::Relaxed) <= 0 {
            tracing::warn!(gauge = what, "progress gauge went negative");
            gauge.fetch_add(1, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn negative_progress_is_clamped() {
        let stats = Stats::new();
        Stats::progress_decr(&stats.migrate_progress_recv, "recv");
        assert_eq!(stats.snapshot().migrate_progress_recv, 0);

        stats.migrate_progress_recv.store(2, Ordering::Relaxed);
        Stats::progress_decr(&stats.migrate_progress_recv, "recv");
        assert_eq!(stats.snapshot().migrate_progress_recv, 1);
    }
}
