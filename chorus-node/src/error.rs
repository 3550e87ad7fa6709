use std::path::PathBuf;

use thiserror::Error;

/// Error surface for the node runtime.
#[derive(Debug, Error)]
pub enum NodeError {
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("network error on {addr}: {source}")]
    Net {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("config error: {0}")]
    Core(#[from] chorus_core::CoreError),

    #[error("log error: {0}")]
    Log(#[from] chorus_log::LogError),

    #[error("sync error: {0}")]
    Sync(#[from] chorus_sync::SyncError),

    #[error("node runtime error: {0}")]
    Runtime(String),
}

pub(crate) fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> NodeError {
    NodeError::Io {
        path: path.into(),
        source,
    }
}

pub(crate) fn net_err(addr: impl Into<String>, source: std::io::Error) -> NodeError {
    NodeError::Net {
        addr: addr.into(),
        source,
    }
}
