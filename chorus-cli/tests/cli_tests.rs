use std::path::{Path, PathBuf};
use std::process::Command;

use assert_cmd::prelude::*;
use predicates::str::contains;
use tempfile::TempDir;

use chorus_core::{config as core_config, SourceId};

fn chorus_cmd(home: &Path, config: &Path) -> Command {
    let mut cmd = Command::new(assert_cmd::cargo::cargo_bin!("chorus"));
    cmd.env("HOME", home)
        .env("USERPROFILE", home)
        .env("NO_COLOR", "1")
        .env_remove("CHORUS_CONFIG")
        .arg("--config")
        .arg(config);
    cmd
}

fn init_node(home: &TempDir, id: &str) -> PathBuf {
    let config = home.path().join("chorus.yaml");
    chorus_cmd(home.path(), &config)
        .args(["config", "init", "--name", "den", "--id", id])
        .assert()
        .success()
        .stdout(contains("Created source 'den'"));
    config
}

fn add_track(home: &TempDir, config: &Path, id: &str, artist: &str, title: &str) {
    chorus_cmd(home.path(), config)
        .args(["track", "add", id, "--artist", artist, "--title", title])
        .assert()
        .success()
        .stdout(contains("Added"));
}

// ---------------------------------------------------------------------------
// config
// ---------------------------------------------------------------------------

#[test]
fn config_init_writes_a_loadable_config() {
    let home = TempDir::new().expect("home");
    let config = init_node(&home, "den-1");

    let loaded = core_config::load_at(&config).expect("load");
    assert_eq!(loaded.source.id, SourceId::from("den-1"));
    assert_eq!(loaded.source.name, "den");
    assert!(loaded.peers.is_empty());
}

#[test]
fn config_init_generates_an_id_and_records_peers() {
    let home = TempDir::new().expect("home");
    let config = home.path().join("chorus.yaml");
    chorus_cmd(home.path(), &config)
        .args([
            "config", "init", "--listen", "127.0.0.1:7400", "--peer", "10.0.0.2:7400", "--peer",
            "10.0.0.3:7400",
        ])
        .assert()
        .success();

    let loaded = core_config::load_at(&config).expect("load");
    assert!(SourceId::parse(loaded.source.id.as_str()).is_ok());
    assert_eq!(loaded.listen.as_deref(), Some("127.0.0.1:7400"));
    assert_eq!(loaded.peers, vec!["10.0.0.2:7400", "10.0.0.3:7400"]);
}

#[test]
fn config_init_refuses_to_overwrite_without_force() {
    let home = TempDir::new().expect("home");
    let config = init_node(&home, "den-1");

    chorus_cmd(home.path(), &config)
        .args(["config", "init", "--id", "den-2"])
        .assert()
        .failure()
        .stderr(contains("--force"));

    chorus_cmd(home.path(), &config)
        .args(["config", "init", "--id", "den-2", "--force"])
        .assert()
        .success();
    let loaded = core_config::load_at(&config).expect("load");
    assert_eq!(loaded.source.id, SourceId::from("den-2"));
}

#[test]
fn config_init_rejects_an_invalid_id() {
    let home = TempDir::new().expect("home");
    let config = home.path().join("chorus.yaml");
    chorus_cmd(home.path(), &config)
        .args(["config", "init", "--id", "has space"])
        .assert()
        .failure()
        .stderr(contains("invalid source id"));
    assert!(!config.exists());
}

#[test]
fn config_show_prints_json() {
    let home = TempDir::new().expect("home");
    let config = init_node(&home, "den-1");

    let output = chorus_cmd(home.path(), &config)
        .args(["config", "show", "--json"])
        .output()
        .expect("run");
    assert!(output.status.success());
    let value: serde_json::Value = serde_json::from_slice(&output.stdout).expect("json");
    assert_eq!(value["source"]["id"], "den-1");
    assert_eq!(
        value["effective_data_dir"],
        home.path().display().to_string()
    );
}

#[test]
fn commands_without_a_config_point_at_init() {
    let home = TempDir::new().expect("home");
    let config = home.path().join("missing.yaml");

    for args in [["track", "list"], ["log", "sources"], ["config", "show"]] {
        chorus_cmd(home.path(), &config)
            .args(args)
            .assert()
            .failure()
            .stderr(contains("chorus config init"));
    }
}

// ---------------------------------------------------------------------------
// track
// ---------------------------------------------------------------------------

#[test]
fn tracks_persist_between_invocations() {
    let home = TempDir::new().expect("home");
    let config = init_node(&home, "den-1");
    add_track(&home, &config, "t1", "Low", "Words");
    add_track(&home, &config, "t2", "Low", "Lullaby");

    let output = chorus_cmd(home.path(), &config)
        .args(["track", "list", "--json"])
        .output()
        .expect("run");
    assert!(output.status.success());
    let tracks: Vec<serde_json::Value> = serde_json::from_slice(&output.stdout).expect("json");
    assert_eq!(tracks.len(), 2);
    assert!(tracks.iter().all(|t| t["source"] == "den-1"));

    chorus_cmd(home.path(), &config)
        .args(["track", "stats"])
        .assert()
        .success()
        .stdout(contains("den-1"))
        .stdout(contains("tracks:    2"))
        .stdout(contains("artists:   1"));
}

#[test]
fn duplicate_track_is_rejected_and_not_logged() {
    let home = TempDir::new().expect("home");
    let config = init_node(&home, "den-1");
    add_track(&home, &config, "t1", "Low", "Words");

    chorus_cmd(home.path(), &config)
        .args(["track", "add", "t1", "--artist", "Low", "--title", "Again"])
        .assert()
        .failure()
        .stderr(contains("add_tracks failed"));

    chorus_cmd(home.path(), &config)
        .args(["log", "sources", "--json"])
        .assert()
        .success()
        .stdout(contains("\"latest\": 1"));
}

#[test]
fn removing_tracks_reports_the_count() {
    let home = TempDir::new().expect("home");
    let config = init_node(&home, "den-1");
    add_track(&home, &config, "t1", "Low", "Words");

    chorus_cmd(home.path(), &config)
        .args(["track", "remove", "t1", "nope"])
        .assert()
        .success()
        .stdout(contains("Removed 1 track(s)"));
    chorus_cmd(home.path(), &config)
        .args(["track", "list"])
        .assert()
        .success()
        .stdout(contains("No tracks."));
}

// ---------------------------------------------------------------------------
// log
// ---------------------------------------------------------------------------

#[test]
fn log_show_lists_entries_after_a_sequence() {
    let home = TempDir::new().expect("home");
    let config = init_node(&home, "den-1");
    add_track(&home, &config, "t1", "Low", "Words");
    add_track(&home, &config, "t2", "Low", "Lullaby");
    add_track(&home, &config, "t3", "Low", "Sunflower");

    let output = chorus_cmd(home.path(), &config)
        .args(["log", "show", "--source", "den-1", "--after", "1", "--json"])
        .output()
        .expect("run");
    assert!(output.status.success());
    let entries: Vec<serde_json::Value> = serde_json::from_slice(&output.stdout).expect("json");
    let seqs: Vec<u64> = entries
        .iter()
        .map(|e| e["seq"].as_u64().expect("seq"))
        .collect();
    assert_eq!(seqs, vec![2, 3]);
    assert!(entries.iter().all(|e| e["command"] == "add_tracks"));
}

#[test]
fn log_on_a_fresh_node_is_empty() {
    let home = TempDir::new().expect("home");
    let config = init_node(&home, "den-1");

    chorus_cmd(home.path(), &config)
        .args(["log", "sources"])
        .assert()
        .success()
        .stdout(contains("Log is empty."));
}

#[test]
fn log_compact_keeps_sequence_numbers() {
    let home = TempDir::new().expect("home");
    let config = init_node(&home, "den-1");
    add_track(&home, &config, "t1", "Low", "Words");

    chorus_cmd(home.path(), &config)
        .args(["log", "compact"])
        .assert()
        .success()
        .stdout(contains("Removed 0 superseded entries across 1 source(s)"));
    chorus_cmd(home.path(), &config)
        .args(["log", "sources", "--json"])
        .assert()
        .success()
        .stdout(contains("\"latest\": 1"));
}
