//! `chorus config init` and `chorus config show`

use std::path::Path;

use anyhow::{Context, Result};
use clap::{Args, Subcommand};

use chorus_core::{config as core_config, ChorusConfig, SourceConfig, SourceId};

#[derive(Subcommand, Debug)]
pub enum ConfigCommand {
    /// Write a new config with a freshly generated source id.
    Init(InitArgs),

    /// Print the effective config.
    Show {
        /// Emit JSON instead of YAML.
        #[arg(long)]
        json: bool,
    },
}

#[derive(Args, Debug)]
pub struct InitArgs {
    /// Display name for this collection.
    #[arg(long, default_value = "local")]
    pub name: String,

    /// Use this source id instead of generating one.
    #[arg(long, value_name = "ID")]
    pub id: Option<String>,

    /// `host:port` to accept peers on.
    #[arg(long, value_name = "ADDR")]
    pub listen: Option<String>,

    /// `host:port` of a peer to dial. Repeatable.
    #[arg(long = "peer", value_name = "ADDR")]
    pub peers: Vec<String>,

    /// Overwrite an existing config.
    #[arg(long)]
    pub force: bool,
}

pub fn run(command: ConfigCommand, config_path: &Path) -> Result<()> {
    match command {
        ConfigCommand::Init(args) => init(args, config_path),
        ConfigCommand::Show { json } => show(config_path, json),
    }
}

fn init(args: InitArgs, config_path: &Path) -> Result<()> {
    if config_path.exists() && !args.force {
        anyhow::bail!(
            "{} already exists; pass --force to overwrite",
            config_path.display()
        );
    }

    let id = match args.id {
        Some(raw) => SourceId::parse(&raw).with_context(|| format!("invalid source id '{raw}'"))?,
        None => SourceId::generate(),
    };
    let config = ChorusConfig {
        source: SourceConfig {
            id,
            name: args.name,
        },
        listen: args.listen,
        peers: args.peers,
        ..ChorusConfig::default()
    };
    core_config::save_at(config_path, &config)
        .with_context(|| format!("failed to write {}", config_path.display()))?;

    println!("✓ Created source '{}' ({})", config.source.name, config.source.id);
    println!("  Saved to: {}", config_path.display());
    Ok(())
}

fn show(config_path: &Path, json: bool) -> Result<()> {
    let (config, data_dir) = super::load(config_path)?;
    if json {
        let mut value = serde_json::to_value(&config)?;
        value["effective_data_dir"] = serde_json::Value::String(data_dir.display().to_string());
        println!("{}", serde_json::to_string_pretty(&value)?);
    } else {
        print!("{}", serde_yaml::to_string(&config)?);
        println!("# data dir: {}", data_dir.display());
    }
    Ok(())
}
