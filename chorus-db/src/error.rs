//! Error types for chorus-db.

use thiserror::Error;

use chorus_log::{LogError, ReplayConflict};

/// Rejections raised by a [`DatabaseImpl`](crate::DatabaseImpl).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// The operation would violate a uniqueness or integrity rule.
    #[error("constraint violation: {0}")]
    Constraint(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// The storage engine itself failed.
    #[error("storage backend error: {0}")]
    Backend(String),
}

/// Why a submitted command did not succeed.
#[derive(Debug, Error)]
pub enum CommandError {
    /// The store rejected the command. Nothing was logged.
    #[error("execution failed: {0}")]
    Execution(#[from] StoreError),

    /// The store was mutated but the log append failed; the store and the
    /// log disagree until reconciled.
    #[error("mutation applied but log append failed: {0}")]
    LogAppend(#[source] LogError),

    /// A replayed entry was already applied or arrived ahead of a gap.
    #[error("replay conflict: {0}")]
    Replay(#[from] ReplayConflict),

    /// A replayed entry names a command this build cannot decode.
    #[error("cannot decode replayed command '{command}': {source}")]
    Decode {
        command: String,
        #[source]
        source: serde_json::Error,
    },

    /// A replayed entry names a read-only command.
    #[error("command '{0}' does not mutate and cannot be replayed")]
    NotReplayable(String),

    /// The command panicked inside the store.
    #[error("command panicked: {0}")]
    Panicked(String),

    #[error("command cancelled before execution")]
    Cancelled,

    #[error("executor is shut down")]
    ExecutorClosed,
}
