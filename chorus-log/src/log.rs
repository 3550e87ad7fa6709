//! The mutation log proper.
//!
//! Entries are partitioned by source. Each partition has its own lock, so
//! appends for different sources never wait on each other, and readers only
//! ever see whole entries.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, PoisonError, RwLock};

use chrono::Utc;
use serde_json::Value;
use tokio::sync::broadcast;

use chorus_core::SourceId;

use crate::backend::{LogBackend, MemoryBackend};
use crate::entry::LogEntry;
use crate::error::{LogError, ReplayConflict};

/// Notification sent after an entry is durably appended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Appended {
    pub source: SourceId,
    pub seq: u64,
}

#[derive(Debug, Default)]
struct Partition {
    /// Sorted by `seq`.
    entries: Vec<LogEntry>,
    /// Highest sequence ever appended; survives compaction.
    latest: u64,
}

impl Partition {
    fn check_replay(&self, origin: &SourceId, seq: u64, prev_seq: u64) -> Result<(), ReplayConflict> {
        if seq <= self.latest {
            return Err(ReplayConflict::Duplicate {
                origin: origin.clone(),
                seq,
                latest: self.latest,
            });
        }
        if prev_seq > self.latest {
            return Err(ReplayConflict::Gap {
                origin: origin.clone(),
                seq,
                prev_seq,
                latest: self.latest,
            });
        }
        Ok(())
    }
}

type SharedPartition = Arc<RwLock<Partition>>;

#[derive(Debug)]
pub struct MutationLog {
    backend: Box<dyn LogBackend>,
    partitions: RwLock<HashMap<SourceId, SharedPartition>>,
    appended: broadcast::Sender<Appended>,
}

impl MutationLog {
    /// Open on top of `backend`, loading everything it has persisted.
    pub fn open(backend: impl LogBackend + 'static) -> Result<Self, LogError> {
        let mut grouped: HashMap<SourceId, Vec<LogEntry>> = HashMap::new();
        for entry in backend.load()? {
            grouped.entry(entry.source.clone()).or_default().push(entry);
        }

        let mut partitions = HashMap::new();
        for (source, mut entries) in grouped {
            entries.sort_by_key(|e| e.seq);
            let before = entries.len();
            entries.dedup_by_key(|e| e.seq);
            if entries.len() != before {
                tracing::warn!(
                    source = %source,
                    dropped = before - entries.len(),
                    "duplicate sequence numbers on disk, keeping first copy",
                );
            }
            let latest = entries.last().map(|e| e.seq).unwrap_or(0);
            tracing::debug!(source = %source, latest, entries = entries.len(), "loaded log partition");
            partitions.insert(source, Arc::new(RwLock::new(Partition { entries, latest })));
        }

        let (appended, _) = broadcast::channel(1024);
        Ok(Self {
            backend: Box::new(backend),
            partitions: RwLock::new(partitions),
            appended,
        })
    }

    /// A log that persists nothing.
    pub fn in_memory() -> Self {
        let (appended, _) = broadcast::channel(1024);
        Self {
            backend: Box::new(MemoryBackend),
            partitions: RwLock::new(HashMap::new()),
            appended,
        }
    }

    fn partition(&self, source: &SourceId) -> SharedPartition {
        if let Some(p) = self
            .partitions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(source)
        {
            return p.clone();
        }
        self.partitions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(source.clone())
            .or_default()
            .clone()
    }

    fn existing(&self, source: &SourceId) -> Option<SharedPartition> {
        self.partitions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(source)
            .cloned()
    }

    /// Append a locally originated mutation under the next sequence number
    /// for `source`. Nothing is assigned if the backend write fails.
    pub fn append(
        &self,
        source: &SourceId,
        command: &str,
        args: Value,
        key: Option<String>,
    ) -> Result<LogEntry, LogError> {
        let partition = self.partition(source);
        let entry = {
            let mut p = partition.write().unwrap_or_else(PoisonError::into_inner);
            let entry = LogEntry {
                source: source.clone(),
                seq: p.latest + 1,
                prev_seq: p.latest,
                command: command.to_owned(),
                args,
                key,
                timestamp: Utc::now(),
            };
            self.backend.append(&entry)?;
            p.latest = entry.seq;
            p.entries.push(entry.clone());
            entry
        };
        tracing::debug!(source = %source, seq = entry.seq, command, "appended mutation");
        let _ = self.appended.send(Appended {
            source: entry.source.clone(),
            seq: entry.seq,
        });
        Ok(entry)
    }

    /// Whether `(origin, seq)` could be appended right now.
    pub fn check_replay(&self, origin: &SourceId, seq: u64, prev_seq: u64) -> Result<(), ReplayConflict> {
        match self.existing(origin) {
            Some(p) => p
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .check_replay(origin, seq, prev_seq),
            None => Partition::default().check_replay(origin, seq, prev_seq),
        }
    }

    /// Mirror a peer-originated entry under its origin sequence number.
    pub fn append_replicated(&self, entry: LogEntry) -> Result<(), LogError> {
        let partition = self.partition(&entry.source);
        {
            let mut p = partition.write().unwrap_or_else(PoisonError::into_inner);
            p.check_replay(&entry.source, entry.seq, entry.prev_seq)?;
            self.backend.append(&entry)?;
            p.latest = entry.seq;
            p.entries.push(entry.clone());
        }
        tracing::debug!(source = %entry.source, seq = entry.seq, "mirrored replicated mutation");
        let _ = self.appended.send(Appended {
            source: entry.source,
            seq: entry.seq,
        });
        Ok(())
    }

    /// Entries of `source` with `seq > after`, in order.
    ///
    /// The cursor is bounded by the latest sequence at the time of the call;
    /// call again from [`ReadSince::cursor`] to pick up later appends.
    pub fn read_since(&self, source: &SourceId, after: u64) -> ReadSince {
        let partition = self.existing(source);
        let until = partition
            .as_ref()
            .map(|p| p.read().unwrap_or_else(PoisonError::into_inner).latest)
            .unwrap_or(0);
        ReadSince {
            partition,
            cursor: after,
            until,
        }
    }

    /// Highest sequence number recorded for `source`, 0 if none.
    pub fn latest(&self, source: &SourceId) -> u64 {
        self.existing(source)
            .map(|p| p.read().unwrap_or_else(PoisonError::into_inner).latest)
            .unwrap_or(0)
    }

    /// `latest` for every source with at least one entry.
    pub fn checkpoints(&self) -> BTreeMap<SourceId, u64> {
        let partitions = self.partitions.read().unwrap_or_else(PoisonError::into_inner);
        partitions
            .iter()
            .map(|(id, p)| (id.clone(), p.read().unwrap_or_else(PoisonError::into_inner).latest))
            .filter(|(_, latest)| *latest > 0)
            .collect()
    }

    /// Sources with at least one entry, ordered by id.
    pub fn sources(&self) -> Vec<SourceId> {
        self.checkpoints().into_keys().collect()
    }

    /// Number of entries currently held for `source` (after compaction).
    pub fn len(&self, source: &SourceId) -> usize {
        self.existing(source)
            .map(|p| p.read().unwrap_or_else(PoisonError::into_inner).entries.len())
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.checkpoints().is_empty()
    }

    /// Coalesce superseded overwrites of `source` at or below `floor`.
    ///
    /// Among entries with `seq <= floor`, only the newest per entity key is
    /// kept; unkeyed entries and everything above `floor` are untouched.
    /// Returns the number of entries removed.
    pub fn compact(&self, source: &SourceId, floor: u64) -> Result<usize, LogError> {
        let Some(partition) = self.existing(source) else {
            return Ok(0);
        };
        let mut p = partition.write().unwrap_or_else(PoisonError::into_inner);
        let floor = floor.min(p.latest);

        let mut newest: HashMap<&str, u64> = HashMap::new();
        for entry in p.entries.iter().take_while(|e| e.seq <= floor) {
            if let Some(key) = entry.key.as_deref() {
                newest.insert(key, entry.seq);
            }
        }

        let mut survivors: Vec<LogEntry> = p
            .entries
            .iter()
            .filter(|e| {
                e.seq > floor
                    || e.key
                        .as_deref()
                        .map_or(true, |key| newest.get(key) == Some(&e.seq))
            })
            .cloned()
            .collect();
        let removed = p.entries.len() - survivors.len();
        if removed == 0 {
            return Ok(0);
        }

        let mut prev = 0;
        for entry in &mut survivors {
            entry.prev_seq = prev;
            prev = entry.seq;
        }

        self.backend.rewrite(source, &survivors)?;
        p.entries = survivors;
        tracing::info!(source = %source, floor, removed, "compacted mutation log");
        Ok(removed)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Appended> {
        self.appended.subscribe()
    }
}

/// Lazy, restartable cursor over one source's entries.
///
/// Each step takes the partition read lock just long enough to clone the
/// next entry, so it never observes a half-applied append and never blocks
/// appends for long.
#[derive(Debug)]
pub struct ReadSince {
    partition: Option<SharedPartition>,
    cursor: u64,
    until: u64,
}

impl ReadSince {
    /// Sequence number of the last entry yielded (or the starting checkpoint).
    pub fn cursor(&self) -> u64 {
        self.cursor
    }
}

impl Iterator for ReadSince {
    type Item = LogEntry;

    fn next(&mut self) -> Option<LogEntry> {
        if self.cursor >= self.until {
            return None;
        }
        let partition = self.partition.as_ref()?;
        let p = partition.read().unwrap_or_else(PoisonError::into_inner);
        let idx = p.entries.partition_point(|e| e.seq <= self.cursor);
        let entry = p.entries.get(idx).filter(|e| e.seq <= self.until)?.clone();
        self.cursor = entry.seq;
        Some(entry)
    }
}
