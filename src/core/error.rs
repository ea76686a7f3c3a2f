//! Error types for the voxmarch engine

use std::path::PathBuf;
use thiserror::Error;

/// Main error type for the engine
#[derive(Debug, Error)]
pub enum Error {
    #[error("IO error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid PLY: {0}")]
    InvalidPly(String),

    #[error("memory budget too small; smallest workable budget is {smallest_required} bytes")]
    OutOfBudget { smallest_required: u64 },

    #[error("worker task panicked: {0}")]
    TaskPanic(String),

    #[error("corrupt octree file: {0}")]
    CorruptOctree(String),

    #[error("insertion index {idx} past end of sequence of length {len}")]
    InvalidIndex { idx: u64, len: u64 },
}

impl Error {
    /// Attach a path to an `std::io::Error`
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Error::Io {
            path: path.into(),
            source,
        }
    }
}
