//! Record primitives: digests, bins, metadata, and the conflict ordering
//! used by both the migration merge policy and replica writes.

use std::fmt;

use bytes::Bytes;
use sha2::{Digest as _, Sha256};

/// Length of a record digest in bytes.
pub const DIGEST_LEN: usize = 20;

/// 20-byte content digest identifying a record within a namespace.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Digest(pub [u8; DIGEST_LEN]);

impl Digest {
    /// Digest the user's key material (set name + key bytes).
    pub fn from_key(set_name: &str, key: &[u8]) -> Digest {
        let mut hasher = Sha256::new();
        hasher.update(set_name.as_bytes());
        hasher.update([0u8]);
        hasher.update(key);
        let out = hasher.finalize();
        let mut d = [0u8; DIGEST_LEN];
        d.copy_from_slice(&out[..DIGEST_LEN]);
        Digest(d)
    }

    pub fn from_slice(bytes: &[u8]) -> Option<Digest> {
        if bytes.len() != DIGEST_LEN {
            return None;
        }
        let mut d = [0u8; DIGEST_LEN];
        d.copy_from_slice(bytes);
        Some(Digest(d))
    }

    /// Partition this digest routes to, for a namespace with `n_partitions`.
    pub fn partition_id(&self, n_partitions: u32) -> u32 {
        let mut buf = [0u8; 4];
        buf.copy_from_slice(&self.0[..4]);
        u32::from_be_bytes(buf) % n_partitions.max(1)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.0 {
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Typed bin value.
#[derive(Clone, Debug, PartialEq)]
pub enum Particle {
    Integer(i64),
    Float(f64),
    String(String),
    Blob(Bytes),
}

impl Particle {
    pub fn type_tag(&self) -> u8 {
        match self {
            Particle::Integer(_) => 1,
            Particle::Float(_) => 2,
            Particle::String(_) => 3,
            Particle::Blob(_) => 4,
        }
    }

    /// Encoded value length on the wire.
    pub fn value_len(&self) -> usize {
        match self {
            Particle::Integer(_) | Particle::Float(_) => 8,
            Particle::String(s) => s.len(),
            Particle::Blob(b) => b.len(),
        }
    }
}

/// Named, typed bin.
#[derive(Clone, Debug, PartialEq)]
pub struct Bin {
    pub name: String,
    pub value: Particle,
}

impl Bin {
    pub fn new(name: impl Into<String>, value: Particle) -> Bin {
        Bin {
            name: name.into(),
            value,
        }
    }
}

pub type Generation = u16;

/// Advance a generation counter. Wraps, but is never zero after wrapping.
pub fn next_generation(generation: Generation) -> Generation {
    match generation.wrapping_add(1) {
        0 => 1,
        g => g,
    }
}

/// Record metadata stored alongside the bins in the index entry.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RecordMeta {
    /// Write counter; wraps per `next_generation`.
    pub generation: Generation,
    /// Millisecond epoch from the cluster-wide clock; primary tiebreaker.
    pub last_update_time: u64,
    /// Absolute expiration, seconds; 0 = never.
    pub void_time: u32,
    /// Interned set tag; 0 = no set.
    pub set_id: u16,
}

impl RecordMeta {
    /// Conflict ordering key. Last-update-time is primary so generation
    /// wrap cannot invert the outcome.
    pub fn conflict_key(&self) -> (u64, Generation) {
        (self.last_update_time, self.generation)
    }
}

/// Whether an incoming `(last_update_time, generation)` pair replaces the
/// local one. Ties keep the local copy.
pub fn incoming_wins(incoming: (u64, Generation), local: (u64, Generation)) -> bool {
    incoming > local
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_is_stable_and_partition_bounded() {
        let a = Digest::from_key("users", b"alice");
        let b = Digest::from_key("users", b"alice");
        let c = Digest::from_key("users", b"bob");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a.partition_id(4096) < 4096);
    }

    #[test]
    fn digest_slice_round_trip() {
        let d = Digest::from_key("s", b"k");
        assert_eq!(Digest::from_slice(d.as_bytes()), Some(d));
        assert_eq!(Digest::from_slice(&[0u8; 19]), None);
    }

    #[test]
    fn generation_wraps_to_one() {
        assert_eq!(next_generation(1), 2);
        assert_eq!(next_generation(u16::MAX), 1);
    }

    #[test]
    fn conflict_ordering_is_lut_primary() {
        // Higher LUT wins even against a "newer" generation.
        assert!(incoming_wins((200, 1), (100, 3)));
        assert!(!incoming_wins((100, 3), (200, 1)));
        // Equal LUT falls back to generation.
        assert!(incoming_wins((100, 4), (100, 3)));
        // Exact tie keeps local.
        assert!(!incoming_wins((100, 3), (100, 3)));
        // Wrapped generation loses on generation alone, which is why LUT
        // must be primary.
        assert!(!incoming_wins((100, 1), (100, u16::MAX)));
    }
}
