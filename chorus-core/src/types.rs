//! Domain types shared by every chorus crate.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::CoreError;

// ---------------------------------------------------------------------------
// SourceId
// ---------------------------------------------------------------------------

/// Opaque identifier of a collection owner (this machine or a remote peer).
///
/// Ordered so that maps keyed by source iterate deterministically.
/// Deserialization goes through [`SourceId::parse`], so ids read from disk
/// or from a peer are always valid.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SourceId(pub String);

impl SourceId {
    /// Validate `raw` and wrap it.
    ///
    /// Ids end up in file names and on the wire, so they are restricted to
    /// `[A-Za-z0-9_.-]{1,64}`.
    pub fn parse(raw: &str) -> Result<Self, CoreError> {
        let valid = !raw.is_empty()
            && raw.len() <= 64
            && raw
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'));
        if valid {
            Ok(Self(raw.to_owned()))
        } else {
            Err(CoreError::InvalidSourceId(raw.to_owned()))
        }
    }

    /// A fresh random id (uuid v4, hyphenated).
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl TryFrom<String> for SourceId {
    type Error = CoreError;

    fn try_from(raw: String) -> Result<Self, Self::Error> {
        Self::parse(&raw)
    }
}

impl From<SourceId> for String {
    fn from(id: SourceId) -> Self {
        id.0
    }
}

impl From<&str> for SourceId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

// ---------------------------------------------------------------------------
// Source
// ---------------------------------------------------------------------------

/// Identity and liveness of one collection owner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Source {
    pub id: SourceId,
    /// Human-readable name shown next to the collection.
    pub name: String,
    pub is_local: bool,
    pub online: bool,
    /// Highest sequence number this peer has acknowledged, per origin source.
    #[serde(default)]
    pub acked: BTreeMap<SourceId, u64>,
    pub first_seen: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_change: Option<DateTime<Utc>>,
}

impl Source {
    /// The source representing this process. Always online.
    pub fn local(id: SourceId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            is_local: true,
            online: true,
            acked: BTreeMap::new(),
            first_seen: Utc::now(),
            last_change: None,
        }
    }

    /// A peer seen for the first time; offline until its session comes up.
    pub fn remote(id: SourceId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            is_local: false,
            online: false,
            acked: BTreeMap::new(),
            first_seen: Utc::now(),
            last_change: None,
        }
    }

    /// Last sequence of `origin` this peer has confirmed, 0 if none.
    pub fn acked_for(&self, origin: &SourceId) -> u64 {
        self.acked.get(origin).copied().unwrap_or(0)
    }
}
