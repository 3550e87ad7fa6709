//! The collection store collaborator.
//!
//! [`DatabaseImpl`] is the primitive surface commands execute against. The
//! on-disk format of a real engine is not our concern; [`MemoryDatabase`]
//! is the implementation the node and the tests use.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use chorus_core::SourceId;

use crate::error::StoreError;

// ---------------------------------------------------------------------------
// Rows
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Track {
    pub id: String,
    pub artist: String,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub album: Option<String>,
    #[serde(default)]
    pub duration_secs: u32,
}

impl Track {
    pub fn new(id: impl Into<String>, artist: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            artist: artist.into(),
            title: title.into(),
            album: None,
            duration_secs: 0,
        }
    }

    pub fn with_album(mut self, album: impl Into<String>) -> Self {
        self.album = Some(album.into());
        self
    }

    pub fn with_duration(mut self, secs: u32) -> Self {
        self.duration_secs = secs;
        self
    }
}

/// A track in some source's collection, as referenced from a playlist.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackRef {
    pub source: SourceId,
    pub track_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Playlist {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub tracks: Vec<TrackRef>,
}

// ---------------------------------------------------------------------------
// Collaborator trait
// ---------------------------------------------------------------------------

/// Synchronous primitives over one store connection. Rows are partitioned
/// by owning source. Only the executor's worker ever holds one of these.
pub trait DatabaseImpl: Send {
    fn has_track(&self, owner: &SourceId, id: &str) -> Result<bool, StoreError>;

    /// Insert a new row; an existing `(owner, id)` is a constraint violation.
    fn insert_track(&mut self, owner: &SourceId, track: Track) -> Result<(), StoreError>;

    /// Insert or overwrite.
    fn upsert_track(&mut self, owner: &SourceId, track: Track) -> Result<(), StoreError>;

    /// Returns whether a row was removed.
    fn remove_track(&mut self, owner: &SourceId, id: &str) -> Result<bool, StoreError>;

    /// All tracks, or only those of `owner`, ordered by `(owner, id)`.
    fn tracks(&self, owner: Option<&SourceId>) -> Result<Vec<(SourceId, Track)>, StoreError>;

    fn has_playlist(&self, owner: &SourceId, id: &str) -> Result<bool, StoreError>;

    fn insert_playlist(&mut self, owner: &SourceId, playlist: Playlist) -> Result<(), StoreError>;

    /// Fails with [`StoreError::NotFound`] when the playlist does not exist.
    fn set_playlist_title(&mut self, owner: &SourceId, id: &str, title: &str) -> Result<(), StoreError>;

    fn remove_playlist(&mut self, owner: &SourceId, id: &str) -> Result<bool, StoreError>;

    fn playlists(&self, owner: Option<&SourceId>) -> Result<Vec<(SourceId, Playlist)>, StoreError>;
}

// ---------------------------------------------------------------------------
// In-memory implementation
// ---------------------------------------------------------------------------

type RowKey = (SourceId, String);

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemoryDatabase {
    tracks: BTreeMap<RowKey, Track>,
    playlists: BTreeMap<RowKey, Playlist>,
}

impl MemoryDatabase {
    pub fn new() -> Self {
        Self::default()
    }
}

fn key(owner: &SourceId, id: &str) -> RowKey {
    (owner.clone(), id.to_owned())
}

fn owned_by(owner: Option<&SourceId>, row_owner: &SourceId) -> bool {
    owner.map_or(true, |o| o == row_owner)
}

impl DatabaseImpl for MemoryDatabase {
    fn has_track(&self, owner: &SourceId, id: &str) -> Result<bool, StoreError> {
        Ok(self.tracks.contains_key(&key(owner, id)))
    }

    fn insert_track(&mut self, owner: &SourceId, track: Track) -> Result<(), StoreError> {
        let k = key(owner, &track.id);
        if self.tracks.contains_key(&k) {
            return Err(StoreError::Constraint(format!(
                "track '{}' already exists in {owner}",
                track.id
            )));
        }
        self.tracks.insert(k, track);
        Ok(())
    }

    fn upsert_track(&mut self, owner: &SourceId, track: Track) -> Result<(), StoreError> {
        self.tracks.insert(key(owner, &track.id), track);
        Ok(())
    }

    fn remove_track(&mut self, owner: &SourceId, id: &str) -> Result<bool, StoreError> {
        Ok(self.tracks.remove(&key(owner, id)).is_some())
    }

    fn tracks(&self, owner: Option<&SourceId>) -> Result<Vec<(SourceId, Track)>, StoreError> {
        Ok(self
            .tracks
            .iter()
            .filter(|((o, _), _)| owned_by(owner, o))
            .map(|((o, _), t)| (o.clone(), t.clone()))
            .collect())
    }

    fn has_playlist(&self, owner: &SourceId, id: &str) -> Result<bool, StoreError> {
        Ok(self.playlists.contains_key(&key(owner, id)))
    }

    fn insert_playlist(&mut self, owner: &SourceId, playlist: Playlist) -> Result<(), StoreError> {
        let k = key(owner, &playlist.id);
        if self.playlists.contains_key(&k) {
            return Err(StoreError::Constraint(format!(
                "playlist '{}' already exists in {owner}",
                playlist.id
            )));
        }
        self.playlists.insert(k, playlist);
        Ok(())
    }

    fn set_playlist_title(&mut self, owner: &SourceId, id: &str, title: &str) -> Result<(), StoreError> {
        match self.playlists.get_mut(&key(owner, id)) {
            Some(playlist) => {
                playlist.title = title.to_owned();
                Ok(())
            }
            None => Err(StoreError::NotFound(format!("playlist '{id}' in {owner}"))),
        }
    }

    fn remove_playlist(&mut self, owner: &SourceId, id: &str) -> Result<bool, StoreError> {
        Ok(self.playlists.remove(&key(owner, id)).is_some())
    }

    fn playlists(&self, owner: Option<&SourceId>) -> Result<Vec<(SourceId, Playlist)>, StoreError> {
        Ok(self
            .playlists
            .iter()
            .filter(|((o, _), _)| owned_by(owner, o))
            .map(|((o, _), p)| (o.clone(), p.clone()))
            .collect())
    }
}
