//! # chorus-log
//!
//! Append-only, per-source-sequenced record of applied mutations.
//!
//! [`MutationLog`] assigns gapless sequence numbers to local mutations,
//! mirrors peer-originated entries under their origin sequence, and serves
//! restartable [`ReadSince`] cursors to sync sessions. Durability comes from
//! a [`LogBackend`]: [`FileBackend`] for real nodes, [`MemoryBackend`] for
//! tests and ephemeral peers.

pub mod backend;
pub mod entry;
pub mod error;
pub mod log;

pub use backend::{FileBackend, LogBackend, MemoryBackend};
pub use entry::LogEntry;
pub use error::{LogError, ReplayConflict};
pub use log::{Appended, MutationLog, ReadSince};
