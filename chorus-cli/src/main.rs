//! chorus: peer-synchronized music collection node.
//!
//! # Usage
//!
//! ```text
//! chorus config init [--name <name>] [--listen <addr>] [--peer <addr>]... [--force]
//! chorus config show [--json]
//! chorus serve
//! chorus track add <id> --artist <artist> --title <title> [--album <album>] [--duration <secs>]
//! chorus track list [--source <id>] [--json]
//! chorus track stats [--source <id>]
//! chorus log sources [--json]
//! chorus log show [--source <id>] [--after <seq>] [--json]
//! chorus log compact [--source <id>]
//! ```
//!
//! Every command reads `~/.chorus/chorus.yaml` unless `--config` says otherwise.

mod commands;

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};

use commands::{config::ConfigCommand, log::LogCommand, track::TrackCommand};

// ---------------------------------------------------------------------------
// CLI entry point
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(
    name = "chorus",
    version,
    about = "Share music collections between peers",
    long_about = None,
)]
struct Cli {
    /// Path to chorus.yaml.
    #[arg(long, global = true, env = "CHORUS_CONFIG", value_name = "PATH")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create or inspect the node configuration.
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },

    /// Run the node in the foreground: listen, dial peers, sync.
    Serve,

    /// Read or change the local collection (node must not be serving).
    Track {
        #[command(subcommand)]
        command: TrackCommand,
    },

    /// Inspect or compact the mutation log.
    Log {
        #[command(subcommand)]
        command: LogCommand,
    },
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

fn main() -> Result<()> {
    let cli = Cli::parse();
    let config_path = commands::resolve_config_path(cli.config)?;
    match cli.command {
        Commands::Config { command } => commands::config::run(command, &config_path),
        Commands::Serve => commands::serve::run(&config_path),
        Commands::Track { command } => commands::track::run(command, &config_path),
        Commands::Log { command } => commands::log::run(command, &config_path),
    }
}
