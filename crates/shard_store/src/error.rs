//! Error surface of the store core.
//!
//! `ResultCode` is the wire-level result carried in replicated-write acks;
//! `StoreError` is the typed error used inside the crate. Codec and storage
//! internals use `anyhow` and get folded into these at the seams.

use thiserror::Error;

/// Wire result codes carried in replicated-write acknowledgements.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResultCode {
    Ok,
    Unknown,
    NotFound,
    ClusterKeyMismatch,
    OutOfSpace,
    Timeout,
    Forbidden,
}

impl ResultCode {
    pub fn as_u32(self) -> u32 {
        match self {
            ResultCode::Ok => 0,
            ResultCode::Unknown => 1,
            ResultCode::NotFound => 2,
            ResultCode::ClusterKeyMismatch => 7,
            ResultCode::OutOfSpace => 8,
            ResultCode::Timeout => 9,
            ResultCode::Forbidden => 22,
        }
    }

    /// Decode a wire result code. Unrecognized values collapse to
    /// `Unknown` rather than failing the ack path.
    pub fn from_u32(raw: u32) -> ResultCode {
        match raw {
            0 => ResultCode::Ok,
            2 => ResultCode::NotFound,
            7 => ResultCode::ClusterKeyMismatch,
            8 => ResultCode::OutOfSpace,
            9 => ResultCode::Timeout,
            22 => ResultCode::Forbidden,
            _ => ResultCode::Unknown,
        }
    }
}

/// Typed failures inside the migration and replicated-write cores.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("cluster key mismatch")]
    ClusterKeyMismatch,

    #[error("destination node unreachable")]
    NoNode,

    #[error("storage out of space")]
    OutOfSpace,

    #[error("write forbidden by pending truncate")]
    Forbidden,

    #[error("record not found")]
    NotFound,

    #[error("malformed pickle: {0}")]
    PickleMalformed(String),

    #[error("request timed out")]
    Timeout,

    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

impl StoreError {
    pub fn result_code(&self) -> ResultCode {
        match self {
            StoreError::ClusterKeyMismatch => ResultCode::ClusterKeyMismatch,
            StoreError::OutOfSpace => ResultCode::OutOfSpace,
            StoreError::Forbidden => ResultCode::Forbidden,
            StoreError::NotFound => ResultCode::NotFound,
            StoreError::Timeout => ResultCode::Timeout,
            StoreError::NoNode
            | StoreError::PickleMalformed(_)
            | StoreError::Storage(_) => ResultCode::Unknown,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn result_code_round_trips() {
        for code in [
            ResultCode::Ok,
            ResultCode::NotFound,
            ResultCode::ClusterKeyMismatch,
            ResultCode::OutOfSpace,
            ResultCode::Timeout,
            ResultCode::Forbidden,
        ] {
            assert_eq!(ResultCode::from_u32(code.as_u32()), code);
        }
    }

    #[test]
    fn unknown_wire_values_collapse() {
        assert_eq!(ResultCode::from_u32(1234), ResultCode::Unknown);
    }
}
