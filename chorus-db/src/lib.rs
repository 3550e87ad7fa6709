//! # chorus-db
//!
//! Commands against the collection store and the executor that runs them.
//!
//! Every read or write is a [`DatabaseCommand`] submitted to an
//! [`Executor`]. The executor runs commands one at a time, appends the
//! effect of each successful mutation to the [`MutationLog`](chorus_log::MutationLog)
//! and only then completes the caller's [`CommandHandle`].

pub mod command;
pub mod error;
pub mod executor;
pub mod store;

pub use command::{CollectionStats, CommandValue, DatabaseCommand, OwnedTrack};
pub use error::{CommandError, StoreError};
pub use executor::{CommandHandle, CommandId, CompletionEvent, Executor, Outcome};
pub use store::{DatabaseImpl, MemoryDatabase, Playlist, Track, TrackRef};
