//! Error types for BlockFS operations

use crate::types::BlockCoord;
use std::path::PathBuf;
use thiserror::Error;

/// Main error type for BlockFS operations
#[derive(Error, Debug)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("already exists: {0}")]
    AlreadyExists(PathBuf),

    #[error("not found: {0}")]
    NotFound(PathBuf),

    #[error("invalid BlockFS format: {0}")]
    Format(String),

    #[error("unsupported codec: {0}")]
    UnsupportedCodec(String),

    #[error("block coordinate {coord} outside grid extent ({nx}, {ny}, {nz})")]
    OutOfRange {
        coord: BlockCoord,
        nx: u32,
        ny: u32,
        nz: u32,
    },

    #[error("block shape mismatch: expected {expected} bytes, got {actual}")]
    ShapeMismatch { expected: usize, actual: usize },

    #[error("dtype mismatch: volume is {expected}, block is {actual}")]
    DtypeMismatch {
        expected: crate::types::DataType,
        actual: crate::types::DataType,
    },

    #[error("duplicate write for block {0}")]
    DuplicateWrite(BlockCoord),

    #[error("write failed for block {coord}: {reason}")]
    WriteFailure { coord: BlockCoord, reason: String },

    #[error("read failed: {0}")]
    ReadFailure(String),

    #[error("codec failure: {0}")]
    Codec(String),

    #[error("volume was opened read-only")]
    ReadOnly,

    #[error("directory has been closed")]
    Closed,
}

/// Specialized Result type for BlockFS operations
pub type Result<T> = std::result::Result<T, Error>;

/// A failed background submission, reported through the error log that
/// `flush` and `close` drain.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WriteError {
    #[error("duplicate write for block {0}")]
    DuplicateWrite(BlockCoord),

    #[error("write failed for block {coord}: {reason}")]
    WriteFailure { coord: BlockCoord, reason: String },
}

impl WriteError {
    /// The coordinate whose submission failed
    pub fn coord(&self) -> BlockCoord {
        match self {
            WriteError::DuplicateWrite(coord) => *coord,
            WriteError::WriteFailure { coord, .. } => *coord,
        }
    }

    pub fn is_duplicate(&self) -> bool {
        matches!(self, WriteError::DuplicateWrite(_))
    }
}

impl From<WriteError> for Error {
    fn from(err: WriteError) -> Self {
        match err {
            WriteError::DuplicateWrite(coord) => Error::DuplicateWrite(coord),
            WriteError::WriteFailure { coord, reason } => Error::WriteFailure { coord, reason },
        }
    }
}
