//! The unit of replication.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use chorus_core::SourceId;

/// One applied mutation, sequenced under the source that originated it.
///
/// `prev_seq` is `seq - 1` when appended. Compaction is the only thing
/// that rewrites it, pointing it at the previous surviving entry so that
/// replicas can still tell a compacted hole from a real gap.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub source: SourceId,
    pub seq: u64,
    pub prev_seq: u64,
    /// Command kind name, used to rebuild the command on replay.
    pub command: String,
    pub args: Value,
    /// Logical entity this entry overwrites, if it is a pure overwrite.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl LogEntry {
    /// Encode as a single JSON line (no trailing newline).
    pub fn to_line(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_line(line: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(line)
    }
}
