//! Command kinds.
//!
//! A command is dispatched by its kind name: the name goes into the log
//! entry next to the serialized arguments, and [`DatabaseCommand::from_entry`]
//! turns the pair back into a command on another source.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use chorus_core::SourceId;

use crate::error::StoreError;
use crate::store::{DatabaseImpl, Playlist, Track};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", content = "args", rename_all = "snake_case")]
pub enum DatabaseCommand {
    /// Add tracks to the source's collection. All or nothing.
    AddTracks { tracks: Vec<Track> },
    /// Overwrite a track's metadata, creating it if missing.
    UpdateTrack { track: Track },
    /// Remove tracks; ids that are not present are ignored.
    DeleteTracks { ids: Vec<String> },
    CreatePlaylist { playlist: Playlist },
    RenamePlaylist { id: String, title: String },
    DeletePlaylist { id: String },
    /// Counts for one source's collection; defaults to the executing source.
    CollectionStats {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        source: Option<SourceId>,
    },
    AllTracks {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        source: Option<SourceId>,
    },
    AllPlaylists {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        source: Option<SourceId>,
    },
}

/// A track together with the source that owns it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OwnedTrack {
    pub source: SourceId,
    pub track: Track,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionStats {
    pub source: Option<SourceId>,
    pub tracks: usize,
    pub artists: usize,
    pub albums: usize,
    pub playlists: usize,
    pub total_duration_secs: u64,
}

/// The result payload of a successful command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum CommandValue {
    Done,
    Removed(usize),
    Stats(CollectionStats),
    Tracks(Vec<OwnedTrack>),
    Playlists(Vec<(SourceId, Playlist)>),
    /// A replayed mutation the local store refused. It is still recorded as
    /// applied so the stream from that source keeps moving.
    Rejected(String),
}

impl DatabaseCommand {
    /// Kind name; stable, used in log entries.
    pub fn name(&self) -> &'static str {
        match self {
            DatabaseCommand::AddTracks { .. } => "add_tracks",
            DatabaseCommand::UpdateTrack { .. } => "update_track",
            DatabaseCommand::DeleteTracks { .. } => "delete_tracks",
            DatabaseCommand::CreatePlaylist { .. } => "create_playlist",
            DatabaseCommand::RenamePlaylist { .. } => "rename_playlist",
            DatabaseCommand::DeletePlaylist { .. } => "delete_playlist",
            DatabaseCommand::CollectionStats { .. } => "collection_stats",
            DatabaseCommand::AllTracks { .. } => "all_tracks",
            DatabaseCommand::AllPlaylists { .. } => "all_playlists",
        }
    }

    /// Fixed per kind.
    pub fn mutates(&self) -> bool {
        !matches!(
            self,
            DatabaseCommand::CollectionStats { .. }
                | DatabaseCommand::AllTracks { .. }
                | DatabaseCommand::AllPlaylists { .. }
        )
    }

    /// The logical entity a pure overwrite replaces, for log compaction.
    pub fn entity_key(&self) -> Option<String> {
        match self {
            DatabaseCommand::UpdateTrack { track } => Some(format!("track:{}", track.id)),
            DatabaseCommand::RenamePlaylist { id, .. } => Some(format!("playlist:{id}:title")),
            _ => None,
        }
    }

    /// Serialized arguments, without the kind tag.
    pub fn args(&self) -> Result<Value, serde_json::Error> {
        let mut tagged = serde_json::to_value(self)?;
        Ok(tagged
            .get_mut("args")
            .map(Value::take)
            .unwrap_or(Value::Null))
    }

    /// Rebuild a command from a log entry's `(command, args)` pair.
    pub fn from_entry(command: &str, args: Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(json!({ "command": command, "args": args }))
    }

    /// Run against `store` on behalf of `source`.
    pub fn execute(
        &self,
        store: &mut dyn DatabaseImpl,
        source: &SourceId,
    ) -> Result<CommandValue, StoreError> {
        match self {
            DatabaseCommand::AddTracks { tracks } => {
                // Validate the whole batch before touching the store.
                let mut seen = BTreeSet::new();
                for track in tracks {
                    if !seen.insert(track.id.as_str()) || store.has_track(source, &track.id)? {
                        return Err(StoreError::Constraint(format!(
                            "track '{}' already exists in {source}",
                            track.id
                        )));
                    }
                }
                for track in tracks {
                    store.insert_track(source, track.clone())?;
                }
                Ok(CommandValue::Done)
            }
            DatabaseCommand::UpdateTrack { track } => {
                store.upsert_track(source, track.clone())?;
                Ok(CommandValue::Done)
            }
            DatabaseCommand::DeleteTracks { ids } => {
                let mut removed = 0;
                for id in ids {
                    if store.remove_track(source, id)? {
                        removed += 1;
                    }
                }
                Ok(CommandValue::Removed(removed))
            }
            DatabaseCommand::CreatePlaylist { playlist } => {
                if store.has_playlist(source, &playlist.id)? {
                    return Err(StoreError::Constraint(format!(
                        "playlist '{}' already exists in {source}",
                        playlist.id
                    )));
                }
                store.insert_playlist(source, playlist.clone())?;
                Ok(CommandValue::Done)
            }
            DatabaseCommand::RenamePlaylist { id, title } => {
                store.set_playlist_title(source, id, title)?;
                Ok(CommandValue::Done)
            }
            DatabaseCommand::DeletePlaylist { id } => {
                let removed = store.remove_playlist(source, id)?;
                Ok(CommandValue::Removed(usize::from(removed)))
            }
            DatabaseCommand::CollectionStats { source: target } => {
                let owner = target.as_ref().unwrap_or(source);
                Ok(CommandValue::Stats(collection_stats(store, owner)?))
            }
            DatabaseCommand::AllTracks { source: target } => {
                let tracks = store
                    .tracks(target.as_ref())?
                    .into_iter()
                    .map(|(source, track)| OwnedTrack { source, track })
                    .collect();
                Ok(CommandValue::Tracks(tracks))
            }
            DatabaseCommand::AllPlaylists { source: target } => {
                Ok(CommandValue::Playlists(store.playlists(target.as_ref())?))
            }
        }
    }
}

fn collection_stats(store: &dyn DatabaseImpl, owner: &SourceId) -> Result<CollectionStats, StoreError> {
    let tracks = store.tracks(Some(owner))?;
    let artists: BTreeSet<&str> = tracks.iter().map(|(_, t)| t.artist.as_str()).collect();
    let albums: BTreeSet<(&str, &str)> = tracks
        .iter()
        .filter_map(|(_, t)| t.album.as_deref().map(|a| (t.artist.as_str(), a)))
        .collect();
    let total_duration_secs = tracks.iter().map(|(_, t)| u64::from(t.duration_secs)).sum();
    Ok(CollectionStats {
        source: Some(owner.clone()),
        tracks: tracks.len(),
        artists: artists.len(),
        albums: albums.len(),
        playlists: store.playlists(Some(owner))?.len(),
        total_duration_secs,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryDatabase;

    fn s1() -> SourceId {
        SourceId::from("s1")
    }

    #[test]
    fn mutates_is_fixed_per_kind() {
        assert!(DatabaseCommand::DeleteTracks { ids: vec![] }.mutates());
        assert!(!DatabaseCommand::CollectionStats { source: None }.mutates());
        assert!(!DatabaseCommand::AllTracks { source: None }.mutates());
    }

    #[test]
    fn args_and_from_entry_restore_the_command() {
        let cmd = DatabaseCommand::RenamePlaylist {
            id: "p1".into(),
            title: "Evening".into(),
        };
        let args = cmd.args().unwrap();
        assert_eq!(args, json!({ "id": "p1", "title": "Evening" }));
        assert_eq!(DatabaseCommand::from_entry(cmd.name(), args).unwrap(), cmd);
    }

    #[test]
    fn from_entry_rejects_unknown_kind() {
        assert!(DatabaseCommand::from_entry("drop_everything", json!({})).is_err());
    }

    #[test]
    fn add_tracks_is_all_or_nothing() {
        let mut db = MemoryDatabase::new();
        db.insert_track(&s1(), Track::new("b", "Low", "Lullaby")).unwrap();
        let cmd = DatabaseCommand::AddTracks {
            tracks: vec![Track::new("a", "Low", "Words"), Track::new("b", "Low", "Lullaby")],
        };
        let err = cmd.execute(&mut db, &s1()).unwrap_err();
        assert!(matches!(err, StoreError::Constraint(_)));
        assert!(!db.has_track(&s1(), "a").unwrap());
    }

    #[test]
    fn add_tracks_rejects_duplicates_within_batch() {
        let mut db = MemoryDatabase::new();
        let cmd = DatabaseCommand::AddTracks {
            tracks: vec![Track::new("a", "Low", "Words"), Track::new("a", "Low", "Words")],
        };
        assert!(cmd.execute(&mut db, &s1()).is_err());
        assert!(db.tracks(None).unwrap().is_empty());
    }

    #[test]
    fn collection_stats_counts_distinct_artists_and_albums() {
        let mut db = MemoryDatabase::new();
        DatabaseCommand::AddTracks {
            tracks: vec![
                Track::new("1", "Low", "Words").with_album("I Could Live in Hope").with_duration(200),
                Track::new("2", "Low", "Slide").with_album("I Could Live in Hope").with_duration(100),
                Track::new("3", "Codeine", "D").with_duration(50),
            ],
        }
        .execute(&mut db, &s1())
        .unwrap();

        let value = DatabaseCommand::CollectionStats { source: None }
            .execute(&mut db, &s1())
            .unwrap();
        let CommandValue::Stats(stats) = value else {
            panic!("expected stats");
        };
        assert_eq!(stats.tracks, 3);
        assert_eq!(stats.artists, 2);
        assert_eq!(stats.albums, 1);
        assert_eq!(stats.total_duration_secs, 350);
    }

    #[test]
    fn entity_keys_only_for_overwrites() {
        let update = DatabaseCommand::UpdateTrack {
            track: Track::new("t9", "Low", "Words"),
        };
        assert_eq!(update.entity_key().as_deref(), Some("track:t9"));
        assert_eq!(DatabaseCommand::DeletePlaylist { id: "p".into() }.entity_key(), None);
    }
}
