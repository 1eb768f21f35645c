//! Side-band record properties: the set name and optional stored key that
//! travel next to a pickle in the REC_PROPS message field.
//!
//! Layout is tagged fields, big-endian: `[tag u8][len u32][bytes]*`.

use anyhow::ensure;
use bytes::Bytes;

const FIELD_SET_NAME: u8 = 1;
const FIELD_KEY: u8 = 2;

#[derive(Clone, Debug, Default, PartialEq)]
pub struct RecProps {
    pub set_name: Option<String>,
    pub key: Option<Bytes>,
}

impl RecProps {
    pub fn is_empty(&self) -> bool {
        self.set_name.is_none() && self.key.is_none()
    }

    /// Encode, returning `None` when there is nothing to carry.
    pub fn encode(&self) -> Option<Bytes> {
        if self.is_empty() {
            return None;
        }
        let mut out = Vec::new();
        if let Some(set_name) = &self.set_name {
            out.push(FIELD_SET_NAME);
            out.extend_from_slice(&(set_name.len() as u32).to_be_bytes());
            out.extend_from_slice(set_name.as_bytes());
        }
        if let Some(key) = &self.key {
            out.push(FIELD_KEY);
            out.extend_from_slice(&(key.len() as u32).to_be_bytes());
            out.extend_from_slice(key);
        }
        Some(out.into())
    }

    pub fn decode(data: &[u8]) -> anyhow::Result<RecProps> {
        let mut props = RecProps::default();
        let mut offset = 0usize;
        while offset < data.len() {
            ensure!(offset + 5 <= data.len(), "short rec-props field header");
            let tag = data[offset];
            let mut len_buf = [0u8; 4];
            len_buf.copy_from_slice(&data[offset + 1..offset + 5]);
            let len = u32::from_be_bytes(len_buf) as usize;
            offset += 5;
            ensure!(offset + len <= data.len(), "short rec-props field value");
            let value = &data[offset..offset + len];
            offset += len;

            match tag {
                FIELD_SET_NAME => {
                    props.set_name = Some(String::from_utf8(value.to_vec())?);
                }
                FIELD_KEY => {
                    props.key = Some(Bytes::copy_from_slice(value));
                }
                // Unknown tags are skipped for forward compatibility.
                _ => {}
            }
        }
        Ok(props)
    }
}
