//! # chorus-sync
//!
//! Peer sessions that keep mutation logs converged.
//!
//! A [`SyncCoordinator`] runs one task per connected peer. Each task drives a
//! [`SyncSession`] state machine over a [`PeerLink`]: handshake with log
//! checkpoints, stream the backlog in acknowledged batches, then push new
//! entries as they are appended. Peer entries are applied through the
//! local [`Executor`](chorus_db::Executor) and mirrored into the local log.

pub mod coordinator;
pub mod error;
pub mod message;
pub mod session;
pub mod transport;

pub use coordinator::{SessionHandle, SessionStatus, SyncCoordinator};
pub use error::SyncError;
pub use message::SyncMessage;
pub use session::{Phase, SyncSession};
pub use transport::PeerLink;
