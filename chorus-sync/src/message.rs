//! Wire messages exchanged by two peer sessions.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use chorus_core::SourceId;
use chorus_log::LogEntry;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SyncMessage {
    /// First message on every link. `have` is the sender's log checkpoint
    /// per origin source.
    Hello {
        source: SourceId,
        name: String,
        #[serde(default)]
        have: BTreeMap<SourceId, u64>,
    },
    /// One batch of consecutive entries from a single origin.
    Entries {
        origin: SourceId,
        entries: Vec<LogEntry>,
    },
    /// The receiver has applied `origin` up to `seq`.
    Ack { origin: SourceId, seq: u64 },
    /// The sender has nothing more to stream right now.
    CaughtUp,
    /// The receiver found a gap; restart `origin` after `have`.
    Resync { origin: SourceId, have: u64 },
    Bye,
}

impl SyncMessage {
    /// Short name for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            SyncMessage::Hello { .. } => "hello",
            SyncMessage::Entries { .. } => "entries",
            SyncMessage::Ack { .. } => "ack",
            SyncMessage::CaughtUp => "caught_up",
            SyncMessage::Resync { .. } => "resync",
            SyncMessage::Bye => "bye",
        }
    }
}
