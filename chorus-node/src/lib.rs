//! Node runtime: executor + mutation log + peer sessions over TCP.

mod error;
pub mod paths;
mod runtime;

pub use error::NodeError;
pub use runtime::{bind, init_tracing, run, start_blocking, Node};
