//! Pickle codec: the self-describing record buffer shipped on migration
//! inserts and replicated writes.
//!
//! Wire layout, big-endian:
//!
//! ```text
//!  2 bytes: bin_count N
//!  for each bin:
//!    1 byte:  name length L
//!    L bytes: name
//!    1 byte:  particle type tag
//!    1 byte:  flags (reserved, 0)
//!    4 bytes: value length V
//!    V bytes: value
//! ```
//!
//! The first two bytes are always the bin count so a receiver can peek it
//! without decoding. A pickle with zero bins is only legal as the
//! delete-on-replica form, which additionally requires the `DROP` info bit
//! on the carrying message.

use anyhow::{bail, ensure};
use bytes::Bytes;

use crate::msg::INFO_DROP;
use crate::record::{Bin, Particle};

/// Per-record overhead of the storage flat format.
const DEVICE_RECORD_OVERHEAD: u64 = 64;
/// Per-bin overhead of the storage flat format.
const DEVICE_BIN_OVERHEAD: u64 = 12;
/// Device write granularity; footprints round up to this.
const DEVICE_BLOCK: u64 = 16;

/// Serialize bins into a pickle.
pub fn pickle_bins(bins: &[Bin]) -> Bytes {
    let mut size = 2usize;
    for bin in bins {
        size += 1 + bin.name.len() + 1 + 1 + 4 + bin.value.value_len();
    }

    let mut out = Vec::with_capacity(size);
    out.extend_from_slice(&(bins.len() as u16).to_be_bytes());
    for bin in bins {
        out.push(bin.name.len() as u8);
        out.extend_from_slice(bin.name.as_bytes());
        out.push(bin.value.type_tag());
        out.push(0); // flags
        match &bin.value {
            Particle::Integer(v) => {
                out.extend_from_slice(&8u32.to_be_bytes());
                out.extend_from_slice(&v.to_be_bytes());
            }
            Particle::Float(v) => {
                out.extend_from_slice(&8u32.to_be_bytes());
                out.extend_from_slice(&v.to_bits().to_be_bytes());
            }
            Particle::String(v) => {
                out.extend_from_slice(&(v.len() as u32).to_be_bytes());
                out.extend_from_slice(v.as_bytes());
            }
            Particle::Blob(v) => {
                out.extend_from_slice(&(v.len() as u32).to_be_bytes());
                out.extend_from_slice(v);
            }
        }
    }
    out.into()
}

/// The delete-on-replica form: no bins. Must travel with the `DROP` info
/// bit set on the message.
pub fn drop_pickle() -> Bytes {
    Bytes::from_static(&[0, 0])
}

/// Read the bin count without decoding the rest.
pub fn peek_bin_count(buf: &[u8]) -> anyhow::Result<u16> {
    ensure!(buf.len() >= 2, "pickle shorter than bin count");
    Ok(u16::from_be_bytes([buf[0], buf[1]]))
}

/// True iff this is the delete-on-replica form.
pub fn is_drop(buf: &[u8], info: u32) -> bool {
    matches!(peek_bin_count(buf), Ok(0)) && (info & INFO_DROP) != 0
}

/// Decode a pickle into bins.
pub fn unpickle(buf: &[u8]) -> anyhow::Result<Vec<Bin>> {
    let count = peek_bin_count(buf)? as usize;
    let mut offset = 2usize;
    let mut bins = Vec::with_capacity(count);

    for _ in 0..count {
        ensure!(offset + 1 <= buf.len(), "short bin name length");
        let name_len = buf[offset] as usize;
        offset += 1;
        ensure!(offset + name_len + 2 + 4 <= buf.len(), "short bin header");
        let name = std::str::from_utf8(&buf[offset..offset + name_len])?.to_string();
        offset += name_len;
        let type_tag = buf[offset];
        offset += 2; // type + flags

        let mut len_buf = [0u8; 4];
        len_buf.copy_from_slice(&buf[offset..offset + 4]);
        let value_len = u32::from_be_bytes(len_buf) as usize;
        offset += 4;
        ensure!(offset + value_len <= buf.len(), "short bin value");
        let value = &buf[offset..offset + value_len];
        offset += value_len;

        let particle = match type_tag {
            1 => {
                ensure!(value_len == 8, "integer particle wrong width");
                let mut v = [0u8; 8];
                v.copy_from_slice(value);
                Particle::Integer(i64::from_be_bytes(v))
            }
            2 => {
                ensure!(value_len == 8, "float particle wrong width");
                let mut v = [0u8; 8];
                v.copy_from_slice(value);
                Particle::Float(f64::from_bits(u64::from_be_bytes(v)))
            }
            3 => Particle::String(std::str::from_utf8(value)?.to_string()),
            4 => Particle::Blob(Bytes::copy_from_slice(value)),
            other => bail!("unknown particle type tag {other}"),
        };
        bins.push(Bin { name, value: particle });
    }

    ensure!(offset == buf.len(), "trailing bytes after last bin");
    Ok(bins)
}

/// On-device footprint of a pickle, computed without decoding particles.
/// Replicas use this to refuse writes that would exceed disk capacity.
pub fn storage_footprint(buf: &[u8]) -> anyhow::Result<u64> {
    let count = peek_bin_count(buf)? as usize;
    let mut offset = 2usize;
    let mut size = DEVICE_RECORD_OVERHEAD;

    for _ in 0..count {
        ensure!(offset + 1 <= buf.len(), "short bin name length");
        let name_len = buf[offset] as usize;
        offset += 1 + name_len;
        ensure!(offset + 2 + 4 <= buf.len(), "short bin header");
        offset += 2;
        let mut len_buf = [0u8; 4];
        len_buf.copy_from_slice(&buf[offset..offset + 4]);
        let value_len = u32::from_be_bytes(len_buf) as usize;
        offset += 4 + value_len;
        ensure!(offset <= buf.len(), "short bin value");
        size += DEVICE_BIN_OVERHEAD + name_len as u64 + value_len as u64;
    }

    Ok(size.div_ceil(DEVICE_BLOCK) * DEVICE_BLOCK)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::Bin;

    fn sample_bins() -> Vec<Bin> {
        vec![
            Bin::new("x", Particle::Integer(1)),
            Bin::new("ratio", Particle::Float(0.5)),
            Bin::new("name", Particle::String("ada".to_string())),
            Bin::new("blob", Particle::Blob(Bytes::from_static(&[1, 2, 3]))),
        ]
    }

    #[test]
    fn round_trip() {
        let bins = sample_bins();
        let buf = pickle_bins(&bins);
        assert_eq!(unpickle(&buf).unwrap(), bins);
    }

    #[test]
    fn peek_matches_bin_count() {
        let buf = pickle_bins(&sample_bins());
        assert_eq!(peek_bin_count(&buf).unwrap(), 4);
        assert_eq!(peek_bin_count(&drop_pickle()).unwrap(), 0);
    }

    #[test]
    fn drop_form_requires_info_bit() {
        let buf = drop_pickle();
        assert!(is_drop(&buf, INFO_DROP));
        assert!(!is_drop(&buf, 0));
        // A pickle with bins is never a drop, whatever the info bits say.
        assert!(!is_drop(&pickle_bins(&sample_bins()), INFO_DROP));
    }

    #[test]
    fn truncated_pickle_is_rejected() {
        let buf = pickle_bins(&sample_bins());
        for cut in [1, 2, 5, buf.len() - 1] {
            assert!(unpickle(&buf[..cut]).is_err(), "cut at {cut} accepted");
        }
    }

    #[test]
    fn trailing_garbage_is_rejected() {
        let mut buf = pickle_bins(&sample_bins()).to_vec();
        buf.push(0xff);
        assert!(unpickle(&buf).is_err());
    }

    #[test]
    fn unknown_particle_tag_is_rejected() {
        let mut buf = pickle_bins(&[Bin::new("x", Particle::Integer(1))]).to_vec();
        // Corrupt the type tag (2 bytes count + 1 len + 1 name byte).
        buf[4] = 99;
        assert!(unpickle(&buf).is_err());
    }

    #[test]
    fn footprint_is_block_aligned_and_monotonic() {
        let small = pickle_bins(&[Bin::new("x", Particle::Integer(1))]);
        let large = pickle_bins(&sample_bins());
        let fp_small = storage_footprint(&small).unwrap();
        let fp_large = storage_footprint(&large).unwrap();
        assert_eq!(fp_small % DEVICE_BLOCK, 0);
        assert_eq!(fp_large % DEVICE_BLOCK, 0);
        assert!(fp_large > fp_small);
        // Footprint never requires decoding particles, so a drop pickle
        // still has the record overhead.
        assert_eq!(
            storage_footprint(&drop_pickle()).unwrap(),
            DEVICE_RECORD_OVERHEAD
        );
    }
}
