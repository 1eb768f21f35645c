//! Node-to-node message bus used by the shard store.
//!
//! This crate provides the transport seam the node core is written against:
//! a typed, prioritized, reliable-enough send primitive with explicit
//! ownership transfer. `send` consumes the message on success; delivery
//! failures hand the message back to the caller so nothing is silently
//! dropped and nothing needs a refcount.
//!
//! The API surface is intentionally small: higher layers supply a payload
//! type and a per-node receive handler, then exchange messages through a
//! `Fabric` implementation. `MeshFabric` is the in-process implementation
//! used by tests and the simulator; a TCP implementation plugs in behind
//! the same trait.

pub mod mesh;

pub use mesh::{FaultFn, MeshEndpoint, MeshFabric};

use thiserror::Error;

/// Logical node identifier, unique per process lifetime.
pub type NodeId = u64;

/// Delivery channel. Each channel has its own bounded queue per peer, so
/// bulk traffic cannot starve control traffic.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Channel {
    /// Record streams (migration inserts). Largest queue, lowest urgency.
    Bulk,
    /// Handshakes and acks (migration start/done).
    Ctrl,
    /// Replicated-write traffic.
    Rw,
}

impl Channel {
    pub const ALL: [Channel; 3] = [Channel::Bulk, Channel::Ctrl, Channel::Rw];

    /// Queue capacity, in messages, for this channel.
    pub fn capacity(self) -> usize {
        match self {
            Channel::Bulk => 8192,
            Channel::Ctrl => 1024,
            Channel::Rw => 4096,
        }
    }
}

/// Payload requirements for messages carried by a fabric.
pub trait Payload: Send + 'static {
    /// Approximate on-wire size, used by senders for backpressure accounting.
    fn wire_size(&self) -> usize;
}

/// Send failure. Both variants return the message so the caller keeps
/// ownership and can retry, park, or drop it deliberately.
#[derive(Error)]
pub enum SendError<M> {
    #[error("destination queue full")]
    QueueFull(M),
    #[error("no such node")]
    NoNode(M),
}

impl<M> std::fmt::Debug for SendError<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SendError::QueueFull(_) => write!(f, "SendError::QueueFull"),
            SendError::NoNode(_) => write!(f, "SendError::NoNode"),
        }
    }
}

impl<M> SendError<M> {
    /// Recover the undelivered message.
    pub fn into_msg(self) -> M {
        match self {
            SendError::QueueFull(m) | SendError::NoNode(m) => m,
        }
    }

    pub fn is_queue_full(&self) -> bool {
        matches!(self, SendError::QueueFull(_))
    }

    pub fn is_no_node(&self) -> bool {
        matches!(self, SendError::NoNode(_))
    }
}

/// Receive handler registered by a node. Runs on the fabric's dispatch
/// thread; implementations must not block indefinitely.
pub type Handler<M> = Box<dyn Fn(NodeId, M) + Send + Sync>;

/// The transport seam. `send` takes ownership of the message on success and
/// returns it inside the error on failure.
pub trait Fabric<M: Payload>: Send + Sync {
    fn send(&self, dest: NodeId, channel: Channel, msg: M) -> Result<(), SendError<M>>;
}
