//! `chorus track` runs commands against the local collection.
//!
//! Each invocation opens the node offline, submits one command through the
//! executor, waits for it and shuts down again. The log is the only state
//! on disk, so this must not run alongside `chorus serve` on the same data
//! directory.

use std::path::Path;

use anyhow::{Context, Result};
use clap::{Args, Subcommand};
use colored::Colorize;
use tabled::{settings::Style, Table, Tabled};

use chorus_core::SourceId;
use chorus_db::{CommandValue, DatabaseCommand, OwnedTrack, Track};
use chorus_node::Node;

#[derive(Subcommand, Debug)]
pub enum TrackCommand {
    /// Add a track to the local collection.
    Add(AddArgs),

    /// Remove tracks from the local collection by id.
    Remove {
        #[arg(required = true)]
        ids: Vec<String>,
    },

    /// List tracks across every known source.
    List {
        /// Only tracks owned by this source.
        #[arg(long, value_name = "ID")]
        source: Option<String>,

        #[arg(long)]
        json: bool,
    },

    /// Collection counts for one source (defaults to the local one).
    Stats {
        #[arg(long, value_name = "ID")]
        source: Option<String>,
    },
}

#[derive(Args, Debug)]
pub struct AddArgs {
    pub id: String,

    #[arg(long)]
    pub artist: String,

    #[arg(long)]
    pub title: String,

    #[arg(long)]
    pub album: Option<String>,

    /// Length in seconds.
    #[arg(long, value_name = "SECS")]
    pub duration: Option<u32>,
}

#[derive(Tabled)]
struct TrackRow {
    source: String,
    id: String,
    artist: String,
    title: String,
    album: String,
    length: String,
}

impl From<&OwnedTrack> for TrackRow {
    fn from(owned: &OwnedTrack) -> Self {
        let track = &owned.track;
        Self {
            source: owned.source.to_string(),
            id: track.id.clone(),
            artist: track.artist.clone(),
            title: track.title.clone(),
            album: track.album.clone().unwrap_or_default(),
            length: format_duration(u64::from(track.duration_secs)),
        }
    }
}

fn format_duration(secs: u64) -> String {
    if secs == 0 {
        return String::new();
    }
    format!("{}:{:02}", secs / 60, secs % 60)
}

pub fn run(command: TrackCommand, config_path: &Path) -> Result<()> {
    let (config, data_dir) = super::load(config_path)?;

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to build runtime")?;

    runtime.block_on(async move {
        let node = Node::open(config, &data_dir)
            .with_context(|| format!("failed to open node at {}", data_dir.display()))?;
        let result = dispatch(&node, command).await;
        node.shutdown().await;
        result
    })
}

async fn dispatch(node: &Node, command: TrackCommand) -> Result<()> {
    match command {
        TrackCommand::Add(args) => {
            let mut track = Track::new(args.id, args.artist, args.title);
            if let Some(album) = args.album {
                track = track.with_album(album);
            }
            if let Some(secs) = args.duration {
                track = track.with_duration(secs);
            }
            let label = format!("{} - {}", track.artist, track.title);
            let outcome = submit(node, DatabaseCommand::AddTracks { tracks: vec![track] }).await?;
            match outcome.logged {
                Some(seq) => println!("{} Added {label} (seq {seq})", "✓".green()),
                None => println!("{} Added {label}", "✓".green()),
            }
        }
        TrackCommand::Remove { ids } => {
            let outcome = submit(node, DatabaseCommand::DeleteTracks { ids }).await?;
            let removed = match outcome.value {
                CommandValue::Removed(n) => n,
                _ => 0,
            };
            println!("{} Removed {removed} track(s)", "✓".green());
        }
        TrackCommand::List { source, json } => {
            let source = source.as_deref().map(parse_source).transpose()?;
            let outcome = submit(node, DatabaseCommand::AllTracks { source }).await?;
            let CommandValue::Tracks(tracks) = outcome.value else {
                anyhow::bail!("unexpected result from all_tracks");
            };
            if json {
                println!("{}", serde_json::to_string_pretty(&tracks)?);
            } else if tracks.is_empty() {
                println!("No tracks.");
            } else {
                let mut table = Table::new(tracks.iter().map(TrackRow::from));
                table.with(Style::rounded());
                println!("{table}");
            }
        }
        TrackCommand::Stats { source } => {
            let source = source.as_deref().map(parse_source).transpose()?;
            let outcome = submit(node, DatabaseCommand::CollectionStats { source }).await?;
            let CommandValue::Stats(stats) = outcome.value else {
                anyhow::bail!("unexpected result from collection_stats");
            };
            let owner = stats
                .source
                .as_ref()
                .unwrap_or_else(|| node.local_id())
                .to_string();
            println!("{}", owner.bold());
            println!("  tracks:    {}", stats.tracks);
            println!("  artists:   {}", stats.artists);
            println!("  albums:    {}", stats.albums);
            println!("  playlists: {}", stats.playlists);
            println!("  length:    {}", format_duration(stats.total_duration_secs));
        }
    }
    Ok(())
}

async fn submit(node: &Node, command: DatabaseCommand) -> Result<chorus_db::Outcome> {
    let name = command.name();
    node.executor()
        .submit(command)
        .wait()
        .await
        .with_context(|| format!("{name} failed"))
}

fn parse_source(raw: &str) -> Result<SourceId> {
    SourceId::parse(raw).with_context(|| format!("invalid source id '{raw}'"))
}
