use thiserror::Error;

use crate::types::Id;

/// Crate-wide error type. Every fallible public operation returns this.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The engine is not in the `Open` state.
    #[error("engine is not ready")]
    NotReady,

    /// Disk read/write failure, with the path and operation that triggered it.
    #[error("I/O error during {op} on {path}: {source}")]
    Io { path: String, op: &'static str, #[source] source: std::io::Error },

    /// A chunk's checksum did not match; the chunk was skipped during read.
    #[error("bad checksum in {file} (chunk {chunk_id})")]
    BadChecksum { file: String, chunk_id: u64 },

    /// On-disk schema version is newer than the running code.
    #[error("version mismatch: stored={stored}, code={code}")]
    VersionMismatch { stored: u32, code: u32 },

    /// A by-step operation referenced a series with no registered step.
    #[error("series {id} has no registered step")]
    UnknownSeries { id: Id },

    /// Dropper failed to convert a sealed WAL into a page.
    #[error("drop failed: {reason}")]
    DropFailed { reason: String },

    /// A manifest line could not be parsed.
    #[error("malformed manifest: {0}")]
    Manifest(String),

    #[error("bincode encode error: {0}")]
    Encode(#[from] bincode::error::EncodeError),

    #[error("bincode decode error: {0}")]
    Decode(#[from] bincode::error::DecodeError),
}

impl EngineError {
    #[must_use]
    pub fn io(path: impl Into<String>, op: &'static str, source: std::io::Error) -> Self {
        Self::Io { path: path.into(), op, source }
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
