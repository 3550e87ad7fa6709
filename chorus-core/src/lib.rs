//! chorus core library: source identity, the source arena and configuration.
//!
//! - [`types`]: [`SourceId`] and the [`Source`] record
//! - [`source`]: [`SourceRegistry`], the arena every other crate looks sources up in
//! - [`config`]: [`ChorusConfig`] load / save
//! - [`error`]: [`CoreError`]

pub mod config;
pub mod error;
pub mod source;
pub mod types;

pub use config::{ChorusConfig, LogConfig, SourceConfig, SyncConfig};
pub use error::CoreError;
pub use source::{SourceEvent, SourceRegistry};
pub use types::{Source, SourceId};
