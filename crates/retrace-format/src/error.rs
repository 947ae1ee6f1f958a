use std::io;

use thiserror::Error;

use crate::codec::CodecError;

#[derive(Debug, Error)]
pub enum TraceError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("invalid trace magic")]
    InvalidMagic,

    #[error("unsupported trace header size {0}")]
    UnsupportedHeaderSize(u32),

    #[error("unsupported trace format version {0}")]
    UnsupportedVersion(u32),

    #[error("trace truncated at byte {offset} while reading {what}")]
    Truncated { offset: u64, what: &'static str },

    #[error("chunk {chunk_index} at byte {offset} is corrupt: {reason}")]
    ChunkCorrupt {
        chunk_index: u64,
        offset: u64,
        reason: String,
    },

    #[error("ordinal {ordinal} in chunk {chunk_index} does not follow ordinal {previous}")]
    OrdinalRegression {
        chunk_index: u64,
        previous: u64,
        ordinal: u64,
    },

    #[error("corrupt chunk index: {0}")]
    CorruptToc(String),

    #[error("invalid trace metadata: {0}")]
    InvalidMeta(String),

    #[error("trace has no chunk index; seeking is unavailable")]
    NotSeekable,

    #[error("no entry at or after ordinal {0}")]
    OrdinalNotFound(u64),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error("invalid writer options: {0}")]
    InvalidOptions(&'static str),
}

impl TraceError {
    /// Whether the error describes bad trace bytes rather than an environment or usage problem.
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            TraceError::InvalidMagic
                | TraceError::UnsupportedHeaderSize(_)
                | TraceError::UnsupportedVersion(_)
                | TraceError::Truncated { .. }
                | TraceError::ChunkCorrupt { .. }
                | TraceError::OrdinalRegression { .. }
                | TraceError::CorruptToc(_)
                | TraceError::InvalidMeta(_)
        )
    }
}

/// Maps an unexpected EOF from `read_exact` to [`TraceError::Truncated`].
pub(crate) fn truncated(err: io::Error, offset: u64, what: &'static str) -> TraceError {
    if err.kind() == io::ErrorKind::UnexpectedEof {
        TraceError::Truncated { offset, what }
    } else {
        TraceError::Io(err)
    }
}
