//! `chorus log sources|show|compact`

use std::path::Path;

use anyhow::{Context, Result};
use clap::{Args, Subcommand};
use colored::Colorize;
use serde::Serialize;
use tabled::{settings::Style, Table, Tabled};

use chorus_core::SourceId;
use chorus_log::{FileBackend, LogEntry, MutationLog};
use chorus_node::paths::log_dir;

#[derive(Subcommand, Debug)]
pub enum LogCommand {
    /// One row per origin source: latest sequence and entries kept.
    Sources {
        #[arg(long)]
        json: bool,
    },

    /// List entries in sequence order.
    Show(ShowArgs),

    /// Drop superseded overwrites up to each source's latest entry.
    Compact {
        /// Only this source.
        #[arg(long, value_name = "ID")]
        source: Option<String>,
    },
}

#[derive(Args, Debug)]
pub struct ShowArgs {
    /// Only this source; defaults to every source.
    #[arg(long, value_name = "ID")]
    pub source: Option<String>,

    /// Only entries with a sequence number above this.
    #[arg(long, default_value_t = 0)]
    pub after: u64,

    #[arg(long)]
    pub json: bool,
}

#[derive(Tabled, Serialize)]
struct SourceRow {
    source: String,
    latest: u64,
    entries: usize,
}

#[derive(Tabled)]
struct EntryRow {
    source: String,
    seq: u64,
    prev: u64,
    command: String,
    key: String,
    at: String,
}

impl From<&LogEntry> for EntryRow {
    fn from(entry: &LogEntry) -> Self {
        Self {
            source: entry.source.to_string(),
            seq: entry.seq,
            prev: entry.prev_seq,
            command: entry.command.clone(),
            key: entry.key.clone().unwrap_or_default(),
            at: entry.timestamp.format("%Y-%m-%d %H:%M:%S").to_string(),
        }
    }
}

pub fn run(command: LogCommand, config_path: &Path) -> Result<()> {
    let (_, data_dir) = super::load(config_path)?;
    let dir = log_dir(&data_dir);
    let log = MutationLog::open(FileBackend::new(&dir)?)
        .with_context(|| format!("failed to open log at {}", dir.display()))?;

    match command {
        LogCommand::Sources { json } => sources(&log, json),
        LogCommand::Show(args) => show(&log, args),
        LogCommand::Compact { source } => compact(&log, source),
    }
}

fn parse_source(raw: &str) -> Result<SourceId> {
    SourceId::parse(raw).with_context(|| format!("invalid source id '{raw}'"))
}

fn sources(log: &MutationLog, json: bool) -> Result<()> {
    let rows: Vec<SourceRow> = log
        .checkpoints()
        .into_iter()
        .map(|(source, latest)| SourceRow {
            entries: log.len(&source),
            source: source.to_string(),
            latest,
        })
        .collect();

    if json {
        println!("{}", serde_json::to_string_pretty(&rows)?);
        return Ok(());
    }
    if rows.is_empty() {
        println!("Log is empty.");
        return Ok(());
    }
    let mut table = Table::new(rows);
    table.with(Style::rounded());
    println!("{table}");
    Ok(())
}

fn show(log: &MutationLog, args: ShowArgs) -> Result<()> {
    let sources = match args.source.as_deref() {
        Some(raw) => vec![parse_source(raw)?],
        None => log.sources(),
    };
    let entries: Vec<LogEntry> = sources
        .iter()
        .flat_map(|source| log.read_since(source, args.after))
        .collect();

    if args.json {
        println!("{}", serde_json::to_string_pretty(&entries)?);
        return Ok(());
    }
    if entries.is_empty() {
        println!("No entries.");
        return Ok(());
    }
    let mut table = Table::new(entries.iter().map(EntryRow::from));
    table.with(Style::rounded());
    println!("{table}");
    Ok(())
}

fn compact(log: &MutationLog, source: Option<String>) -> Result<()> {
    let sources = match source.as_deref() {
        Some(raw) => vec![parse_source(raw)?],
        None => log.sources(),
    };
    let mut removed = 0;
    for source in &sources {
        removed += log
            .compact(source, log.latest(source))
            .with_context(|| format!("failed to compact {source}"))?;
    }
    println!(
        "{} Removed {removed} superseded entries across {} source(s)",
        "✓".green(),
        sources.len()
    );
    Ok(())
}
