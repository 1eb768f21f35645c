//! Wire messages exchanged between nodes.
//!
//! Two fabric message types exist: `Migrate` for partition transfer and
//! `Rw` for replicated writes. Fields mirror the wire tables; anything a
//! given op does not use stays `None`. Acks are built from the request by
//! flipping the op and stripping payload fields while preserving the
//! routing fields the peer needs to correlate.

use bytes::Bytes;
use shard_fabric::Payload;

use crate::record::Digest;

pub const INFO_XDR: u32 = 0x01;
pub const INFO_SINDEX_TOUCHED: u32 = 0x02;
pub const INFO_NSUP_DELETE: u32 = 0x04;
pub const INFO_UDF_WRITE: u32 = 0x08;
pub const INFO_DROP: u32 = 0x10;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MigrateOp {
    Start,
    Insert,
    InsertAck,
    StartAckOk,
    StartAckEagain,
    StartAckFail,
    StartAckAlreadyDone,
    Done,
    DoneAck,
}

impl MigrateOp {
    pub fn is_ctrl_ack(self) -> bool {
        matches!(
            self,
            MigrateOp::StartAckOk
                | MigrateOp::StartAckEagain
                | MigrateOp::StartAckFail
                | MigrateOp::StartAckAlreadyDone
                | MigrateOp::DoneAck
        )
    }
}

/// Migration fabric message.
#[derive(Clone, Debug)]
pub struct MigrateMsg {
    pub op: MigrateOp,
    /// Sender-chosen session id; required on every op.
    pub emig_id: u32,
    /// Per-INSERT sequence; required on INSERT / INSERT_ACK.
    pub insert_id: Option<u32>,
    pub namespace: Option<String>,
    pub pid: Option<u32>,
    pub digest: Option<Digest>,
    pub generation: Option<u32>,
    pub void_time: Option<u32>,
    pub last_update_time: Option<u64>,
    pub record: Option<Bytes>,
    pub rec_props: Option<Bytes>,
    pub cluster_key: Option<u64>,
    pub info: u32,
    /// Compatibility field on START; always 0.
    pub compat_type: Option<u32>,
    /// Sub-collection version; always 0 here.
    pub version: u64,
}

impl MigrateMsg {
    fn blank(op: MigrateOp, emig_id: u32) -> MigrateMsg {
        MigrateMsg {
            op,
            emig_id,
            insert_id: None,
            namespace: None,
            pid: None,
            digest: None,
            generation: None,
            void_time: None,
            last_update_time: None,
            record: None,
            rec_props: None,
            cluster_key: None,
            info: 0,
            compat_type: None,
            version: 0,
        }
    }

    pub fn start(emig_id: u32, cluster_key: u64, namespace: &str, pid: u32) -> MigrateMsg {
        MigrateMsg {
            namespace: Some(namespace.to_string()),
            pid: Some(pid),
            cluster_key: Some(cluster_key),
            compat_type: Some(0),
            ..MigrateMsg::blank(MigrateOp::Start, emig_id)
        }
    }

    pub fn done(emig_id: u32, namespace: &str, pid: u32) -> MigrateMsg {
        MigrateMsg {
            namespace: Some(namespace.to_string()),
            pid: Some(pid),
            ..MigrateMsg::blank(MigrateOp::Done, emig_id)
        }
    }

    /// Turn this message into its ack: flip the op, keep routing fields,
    /// drop the payload.
    pub fn into_ack(mut self, op: MigrateOp) -> MigrateMsg {
        self.op = op;
        self.record = None;
        self.rec_props = None;
        self.generation = None;
        self.void_time = None;
        self.last_update_time = None;
        self.info = 0;
        self
    }

    pub fn wire_size(&self) -> usize {
        // Fixed header fields plus variable payloads; close enough for
        // backpressure accounting.
        let mut size = 64;
        if let Some(ns) = &self.namespace {
            size += ns.len();
        }
        if self.digest.is_some() {
            size += crate::record::DIGEST_LEN;
        }
        if let Some(record) = &self.record {
            size += record.len();
        }
        if let Some(props) = &self.rec_props {
            size += props.len();
        }
        size
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RwOp {
    Write,
    WriteAck,
}

/// Replicated-write fabric message.
#[derive(Clone, Debug)]
pub struct RwMsg {
    pub op: RwOp,
    pub ns_id: u32,
    pub namespace: Option<String>,
    pub digest: Digest,
    /// Transaction id; correlates acks with the inflight request.
    pub tid: u32,
    pub generation: Option<u32>,
    pub void_time: Option<u32>,
    pub last_update_time: Option<u64>,
    pub set_name: Option<String>,
    pub key: Option<Bytes>,
    pub record: Option<Bytes>,
    pub info: u32,
    pub result: Option<u32>,
}

impl RwMsg {
    /// Build the ack: preserve ns-id, digest and tid; strip the payload.
    pub fn into_ack(mut self, result: u32) -> RwMsg {
        self.op = RwOp::WriteAck;
        self.result = Some(result);
        self.namespace = None;
        self.generation = None;
        self.void_time = None;
        self.last_update_time = None;
        self.set_name = None;
        self.key = None;
        self.record = None;
        self.info = 0;
        self
    }

    pub fn wire_size(&self) -> usize {
        let mut size = 64 + crate::record::DIGEST_LEN;
        if let Some(ns) = &self.namespace {
            size += ns.len();
        }
        if let Some(set_name) = &self.set_name {
            size += set_name.len();
        }
        if let Some(key) = &self.key {
            size += key.len();
        }
        if let Some(record) = &self.record {
            size += record.len();
        }
        size
    }
}

/// Union of the fabric message types this node exchanges.
#[derive(Clone, Debug)]
pub enum FabricMsg {
    Migrate(MigrateMsg),
    Rw(RwMsg),
}

impl Payload for FabricMsg {
    fn wire_size(&self) -> usize {
        match self {
            FabricMsg::Migrate(m) => m.wire_size(),
            FabricMsg::Rw(m) => m.wire_size(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_ack_preserves_routing_and_drops_payload() {
        let mut msg = MigrateMsg::blank(MigrateOp::Insert, 17);
        msg.insert_id = Some(42);
        msg.digest = Some(Digest::from_key("s", b"k"));
        msg.record = Some(Bytes::from_static(&[0, 1]));
        msg.generation = Some(3);
        msg.last_update_time = Some(100);

        let ack = msg.into_ack(MigrateOp::InsertAck);
        assert_eq!(ack.op, MigrateOp::InsertAck);
        assert_eq!(ack.emig_id, 17);
        assert_eq!(ack.insert_id, Some(42));
        assert!(ack.digest.is_some());
        assert!(ack.record.is_none());
        assert!(ack.generation.is_none());
    }

    #[test]
    fn start_carries_compat_type_zero() {
        let msg = MigrateMsg::start(1, 0xABCD, "test", 7);
        assert_eq!(msg.compat_type, Some(0));
        assert_eq!(msg.version, 0);
        assert_eq!(msg.cluster_key, Some(0xABCD));
    }

    #[test]
    fn rw_ack_keeps_tid() {
        let msg = RwMsg {
            op: RwOp::Write,
            ns_id: 1,
            namespace: Some("test".to_string()),
            digest: Digest::from_key("s", b"k"),
            tid: 9,
            generation: Some(1),
            void_time: None,
            last_update_time: Some(5),
            set_name: Some("s".to_string()),
            key: None,
            record: Some(Bytes::from_static(&[0, 0])),
            info: INFO_DROP,
            result: None,
        };
        let ack = msg.into_ack(0);
        assert_eq!(ack.op, RwOp::WriteAck);
        assert_eq!(ack.tid, 9);
        assert_eq!(ack.result, Some(0));
        assert!(ack.record.is_none());
    }

    #[test]
    fn wire_size_tracks_payload() {
        let mut msg = MigrateMsg::blank(MigrateOp::Insert, 1);
        let small = msg.wire_size();
        msg.record = Some(Bytes::from(vec![0u8; 1024]));
        assert_eq!(msg.wire_size(), small + 1024);
    }
}
