//! Error types for chorus-log.

use std::path::PathBuf;

use chorus_core::SourceId;
use thiserror::Error;

/// A replicated entry that cannot be applied in order.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReplayConflict {
    /// The entry is already in the log; replaying it again would duplicate it.
    #[error("duplicate entry {origin}#{seq} (already have up to {latest})")]
    Duplicate {
        origin: SourceId,
        seq: u64,
        latest: u64,
    },

    /// Entries between `latest` and `prev_seq` are missing.
    #[error("gap before {origin}#{seq}: entry follows {prev_seq} but log ends at {latest}")]
    Gap {
        origin: SourceId,
        seq: u64,
        prev_seq: u64,
        latest: u64,
    },
}

/// All errors that can arise from log operations.
#[derive(Debug, Error)]
pub enum LogError {
    /// An I/O error, with annotated path for context.
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// JSON serialization error (append path).
    #[error("log JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A persisted line that cannot be parsed and is not a torn tail write.
    #[error("corrupt log line {line} in {path}: {source}")]
    Corrupt {
        path: PathBuf,
        line: usize,
        #[source]
        source: serde_json::Error,
    },

    #[error("replay conflict: {0}")]
    Conflict(#[from] ReplayConflict),
}

/// Convenience constructor for [`LogError::Io`].
pub(crate) fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> LogError {
    LogError::Io {
        path: path.into(),
        source,
    }
}
