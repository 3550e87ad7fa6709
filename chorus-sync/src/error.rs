//! Error types for chorus-sync.

use thiserror::Error;

use chorus_core::CoreError;
use chorus_db::CommandError;
use chorus_log::LogError;

use crate::session::Phase;

/// Why a peer session ended abnormally. None of these affect other
/// sessions or the local executor.
#[derive(Debug, Error)]
pub enum SyncError {
    /// The link closed or a frame could not be delivered.
    #[error("transport error: {0}")]
    Transport(String),

    /// The peer stopped responding.
    #[error("timed out while {phase}")]
    Timeout { phase: Phase },

    /// The peer sent something that makes no sense in the current phase.
    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("log error: {0}")]
    Log(#[from] LogError),

    /// A replayed entry failed in a way that cannot be skipped.
    #[error("replay failed: {0}")]
    Command(#[from] CommandError),

    #[error("source registry error: {0}")]
    Core(#[from] CoreError),

    #[error("sync message JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
