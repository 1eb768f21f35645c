//! In-process mesh fabric.
//!
//! Every registered node gets one bounded queue per channel and one
//! dispatcher thread per queue, so a backed-up bulk stream never delays
//! control acks. Delivery is at-most-once: an installed fault hook may drop
//! messages, which is how tests simulate silent peers and lossy links.

use std::collections::HashMap;
use std::sync::mpsc::{self, SyncSender, TrySendError};
use std::sync::{Arc, RwLock};
use std::thread;

use crate::{Channel, Fabric, Handler, NodeId, Payload, SendError};

/// Decide whether to drop a message: `(src, dest, msg) -> drop`.
pub type FaultFn<M> = Box<dyn Fn(NodeId, NodeId, &M) -> bool + Send + Sync>;

struct NodeQueues<M> {
    senders: HashMap<Channel, SyncSender<(NodeId, M)>>,
}

struct Inner<M> {
    nodes: RwLock<HashMap<NodeId, NodeQueues<M>>>,
    fault: RwLock<Option<FaultFn<M>>>,
}

/// Shared in-process mesh. Clone handles freely; all clones address the
/// same set of nodes.
pub struct MeshFabric<M: Payload> {
    inner: Arc<Inner<M>>,
}

impl<M: Payload> Clone for MeshFabric<M> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<M: Payload> Default for MeshFabric<M> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M: Payload> MeshFabric<M> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                nodes: RwLock::new(HashMap::new()),
                fault: RwLock::new(None),
            }),
        }
    }

    /// Register a node and its receive handler. Spawns one dispatcher
    /// thread per channel; they exit when the node is deregistered.
    pub fn register(&self, node: NodeId, handler: Handler<M>) -> MeshEndpoint<M> {
        let handler = Arc::new(handler);
        let mut senders = HashMap::new();

        for channel in Channel::ALL {
            let (tx, rx) = mpsc::sync_channel::<(NodeId, M)>(channel.capacity());
            let handler = handler.clone();
            thread::Builder::new()
                .name(format!("mesh-{node}-{channel:?}"))
                .spawn(move || {
                    while let Ok((src, msg)) = rx.recv() {
                        handler(src, msg);
                    }
                })
                .expect("spawn mesh dispatcher");
            senders.insert(channel, tx);
        }

        if let Ok(mut nodes) = self.inner.nodes.write() {
            if nodes.insert(node, NodeQueues { senders }).is_some() {
                tracing::warn!(node, "mesh node re-registered, replacing queues");
            }
        }

        MeshEndpoint {
            node,
            inner: self.inner.clone(),
        }
    }

    /// Remove a node. In-flight queue contents are still delivered; new
    /// sends to the node fail with `NoNode`.
    pub fn deregister(&self, node: NodeId) {
        if let Ok(mut nodes) = self.inner.nodes.write() {
            nodes.remove(&node);
        }
    }

    /// Install or clear the fault hook. A hook returning `true` drops the
    /// message on the floor, as a lossy link would.
    pub fn set_fault(&self, fault: Option<FaultFn<M>>) {
        if let Ok(mut guard) = self.inner.fault.write() {
            *guard = fault;
        }
    }
}

/// A node's sending handle onto the mesh.
pub struct MeshEndpoint<M: Payload> {
    node: NodeId,
    inner: Arc<Inner<M>>,
}

impl<M: Payload> MeshEndpoint<M> {
    pub fn node(&self) -> NodeId {
        self.node
    }
}

impl<M: Payload> Fabric<M> for MeshEndpoint<M> {
    fn send(&self, dest: NodeId, channel: Channel, msg: M) -> Result<(), SendError<M>> {
        if let Ok(fault) = self.inner.fault.read() {
            if let Some(fault) = fault.as_ref() {
                if fault(self.node, dest, &msg) {
                    // Dropped by fault injection - the wire ate it.
                    return Ok(());
                }
            }
        }

        let nodes = match self.inner.nodes.read() {
            Ok(nodes) => nodes,
            Err(_) => return Err(SendError::NoNode(msg)),
        };

        let Some(queues) = nodes.get(&dest) else {
            return Err(SendError::NoNode(msg));
        };
        let Some(tx) = queues.senders.get(&channel) else {
            return Err(SendError::NoNode(msg));
        };

        match tx.try_send((self.node, msg)) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full((_, msg))) => Err(SendError::QueueFull(msg)),
            Err(TrySendError::Disconnected((_, msg))) => Err(SendError::NoNode(msg)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::{Duration, Instant};

    struct TestMsg(u64);

    impl Payload for TestMsg {
        fn wire_size(&self) -> usize {
            8
        }
    }

    fn wait_until(deadline: Duration, mut cond: impl FnMut() -> bool) -> bool {
        let end = Instant::now() + deadline;
        while Instant::now() < end {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(1));
        }
        cond()
    }

    #[test]
    fn delivers_to_registered_node_with_source() {
        let mesh = MeshFabric::<TestMsg>::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let seen_rx = seen.clone();
        mesh.register(
            2,
            Box::new(move |src, msg: TestMsg| {
                seen_rx.lock().unwrap().push((src, msg.0));
            }),
        );
        let ep1 = mesh.register(1, Box::new(|_, _| {}));

        ep1.send(2, Channel::Ctrl, TestMsg(7)).unwrap();
        assert!(wait_until(Duration::from_secs(2), || {
            seen.lock().unwrap().as_slice() == [(1, 7)]
        }));
    }

    #[test]
    fn send_to_unknown_node_returns_message() {
        let mesh = MeshFabric::<TestMsg>::new();
        let ep = mesh.register(1, Box::new(|_, _| {}));

        let err = ep.send(99, Channel::Bulk, TestMsg(42)).unwrap_err();
        assert!(err.is_no_node());
        let TestMsg(v) = err.into_msg();
        assert_eq!(v, 42);
    }

    #[test]
    fn deregistered_node_is_no_node() {
        let mesh = MeshFabric::<TestMsg>::new();
        mesh.register(2, Box::new(|_, _| {}));
        let ep = mesh.register(1, Box::new(|_, _| {}));

        ep.send(2, Channel::Rw, TestMsg(1)).unwrap();
        mesh.deregister(2);
        assert!(ep.send(2, Channel::Rw, TestMsg(2)).unwrap_err().is_no_node());
    }

    #[test]
    fn fault_hook_drops_silently() {
        let mesh = MeshFabric::<TestMsg>::new();
        let count = Arc::new(AtomicUsize::new(0));

        let count_rx = count.clone();
        mesh.register(
            2,
            Box::new(move |_, _| {
                count_rx.fetch_add(1, Ordering::Relaxed);
            }),
        );
        let ep = mesh.register(1, Box::new(|_, _| {}));

        mesh.set_fault(Some(Box::new(|_, dest, _| dest == 2)));
        ep.send(2, Channel::Ctrl, TestMsg(1)).unwrap();
        mesh.set_fault(None);
        ep.send(2, Channel::Ctrl, TestMsg(2)).unwrap();

        assert!(wait_until(Duration::from_secs(2), || {
            count.load(Ordering::Relaxed) == 1
        }));
    }
}
