//! Partition migration and replicated-write core of a sharded, replicated
//! key-value node.
//!
//! A namespace is split into a fixed number of partitions, each replicated
//! across nodes. This crate implements the two flows that make that
//! arrangement durable and convergent:
//!
//! - **Migration** ([`migrate`]): streaming every record of a partition
//!   from one node to another while the cluster keeps serving, with a
//!   START/INSERT/DONE protocol, retransmission, and backpressure.
//! - **Replicated writes** ([`repl_write`]): synchronous fan-out of each
//!   client mutation from the partition master to its replicas, with
//!   retransmits, deadlines, and exactly-once completion.
//!
//! Client protocol handling, the on-disk record format, and cluster
//! membership are external collaborators; they appear here only as the
//! seams in [`storage`], [`partition`], and `shard_fabric`.

pub mod config;
pub mod error;
pub mod index;
pub mod migrate;
pub mod msg;
pub mod node;
pub mod partition;
pub mod pickle;
pub mod rec_props;
pub mod record;
pub mod repl_write;
pub mod stats;
pub mod storage;

pub use config::Config;
pub use error::{ResultCode, StoreError};
pub use migrate::{EmigrationFlag, MigrateService};
pub use msg::FabricMsg;
pub use node::{Node, WriteOptions};
pub use partition::{ClusterView, Namespace, PartitionState, Reservation};
pub use record::{Bin, Digest, Particle};
pub use repl_write::{ReplWriteService, ShipSink};
pub use stats::{Stats, StatsSnapshot};
pub use storage::{FjallStorage, MemoryStorage, StorageEngine};
