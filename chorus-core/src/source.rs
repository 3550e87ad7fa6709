//! Source arena.
//!
//! Commands, log entries and sync sessions all refer to sources by
//! [`SourceId`]; the records themselves live here and are looked up on
//! demand. Nothing outside the registry holds a `Source` by reference.

use std::collections::BTreeMap;
use std::sync::{PoisonError, RwLock};

use chrono::Utc;
use tokio::sync::broadcast;

use crate::error::CoreError;
use crate::types::{Source, SourceId};

/// Liveness and membership changes, for UI-facing listeners.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceEvent {
    Added(SourceId),
    Online(SourceId),
    Offline(SourceId),
}

/// Shared table of every source this process knows about.
#[derive(Debug)]
pub struct SourceRegistry {
    local: SourceId,
    sources: RwLock<BTreeMap<SourceId, Source>>,
    events: broadcast::Sender<SourceEvent>,
}

impl SourceRegistry {
    /// Create the registry with the local source already present.
    pub fn new(local: Source) -> Self {
        let (events, _) = broadcast::channel(64);
        let id = local.id.clone();
        let mut sources = BTreeMap::new();
        sources.insert(id.clone(), local);
        Self {
            local: id,
            sources: RwLock::new(sources),
            events,
        }
    }

    pub fn local_id(&self) -> &SourceId {
        &self.local
    }

    /// Register a remote source on first contact. Updates the display name
    /// when the source is already known. Returns `true` if it was new.
    pub fn upsert_remote(&self, id: &SourceId, name: &str) -> bool {
        let created = {
            let mut sources = self.sources.write().unwrap_or_else(PoisonError::into_inner);
            match sources.get_mut(id) {
                Some(existing) => {
                    if existing.name != name {
                        existing.name = name.to_owned();
                    }
                    false
                }
                None => {
                    sources.insert(id.clone(), Source::remote(id.clone(), name));
                    true
                }
            }
        };
        if created {
            tracing::info!(source = %id, name, "registered new source");
            let _ = self.events.send(SourceEvent::Added(id.clone()));
        }
        created
    }

    /// Flip the online flag. No-op (and no event) when the state is unchanged.
    pub fn set_online(&self, id: &SourceId, online: bool) -> Result<(), CoreError> {
        let changed = {
            let mut sources = self.sources.write().unwrap_or_else(PoisonError::into_inner);
            let source = sources
                .get_mut(id)
                .ok_or_else(|| CoreError::UnknownSource(id.0.clone()))?;
            if source.is_local || source.online == online {
                false
            } else {
                source.online = online;
                source.last_change = Some(Utc::now());
                true
            }
        };
        if changed {
            let event = if online {
                SourceEvent::Online(id.clone())
            } else {
                SourceEvent::Offline(id.clone())
            };
            tracing::info!(source = %id, online, "source liveness changed");
            let _ = self.events.send(event);
        }
        Ok(())
    }

    pub fn is_online(&self, id: &SourceId) -> bool {
        self.sources
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .map(|s| s.online)
            .unwrap_or(false)
    }

    pub fn get(&self, id: &SourceId) -> Option<Source> {
        self.sources
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
    }

    /// Every known source, ordered by id.
    pub fn list(&self) -> Vec<Source> {
        self.sources
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    /// Remote sources currently online.
    pub fn online_peers(&self) -> Vec<SourceId> {
        self.sources
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|s| !s.is_local && s.online)
            .map(|s| s.id.clone())
            .collect()
    }

    /// Record that `peer` confirmed having `origin` up to `seq`.
    ///
    /// Acknowledgements never move backwards.
    pub fn record_ack(&self, peer: &SourceId, origin: &SourceId, seq: u64) -> Result<(), CoreError> {
        let mut sources = self.sources.write().unwrap_or_else(PoisonError::into_inner);
        let source = sources
            .get_mut(peer)
            .ok_or_else(|| CoreError::UnknownSource(peer.0.clone()))?;
        let slot = source.acked.entry(origin.clone()).or_insert(0);
        if seq > *slot {
            *slot = seq;
        }
        Ok(())
    }

    pub fn acked(&self, peer: &SourceId, origin: &SourceId) -> u64 {
        self.get(peer).map(|s| s.acked_for(origin)).unwrap_or(0)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SourceEvent> {
        self.events.subscribe()
    }
}
