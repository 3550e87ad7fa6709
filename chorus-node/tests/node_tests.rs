use std::sync::Arc;
use std::time::Duration;

use chorus_core::{ChorusConfig, SourceConfig, SourceId};
use chorus_db::{CommandValue, DatabaseCommand, Track};
use chorus_node::{bind, Node};
use tempfile::TempDir;
use tokio::sync::broadcast;
use tokio::time::timeout;

fn config(id: &str) -> ChorusConfig {
    ChorusConfig {
        source: SourceConfig {
            id: SourceId::from(id),
            name: format!("{id}-box"),
        },
        ..ChorusConfig::default()
    }
}

async fn add_track(node: &Node, id: &str) {
    node.executor()
        .submit(DatabaseCommand::AddTracks {
            tracks: vec![Track::new(id, "Low", "Words")],
        })
        .wait()
        .await
        .expect("add track");
}

async fn track_count(node: &Node) -> usize {
    let outcome = node
        .executor()
        .submit(DatabaseCommand::AllTracks { source: None })
        .wait()
        .await
        .expect("all tracks");
    match outcome.value {
        CommandValue::Tracks(tracks) => tracks.len(),
        other => panic!("unexpected value {other:?}"),
    }
}

#[tokio::test]
async fn reopened_node_restores_store_from_log() {
    let data = TempDir::new().expect("data dir");
    {
        let node = Node::open(config("s1"), data.path()).expect("open");
        add_track(&node, "t1").await;
        add_track(&node, "t2").await;
        node.shutdown().await;
    }

    let node = Node::open(config("s1"), data.path()).expect("reopen");
    assert_eq!(node.log().latest(&SourceId::from("s1")), 2);
    assert_eq!(track_count(&node).await, 2);

    add_track(&node, "t3").await;
    assert_eq!(node.log().latest(&SourceId::from("s1")), 3);
    assert!(data.path().join("log").join("s1.jsonl").exists());
    node.shutdown().await;
}

#[tokio::test]
async fn serve_returns_on_shutdown_without_listener_or_peers() {
    let data = TempDir::new().expect("data dir");
    let node = Arc::new(Node::open(config("s1"), data.path()).expect("open"));
    let (shutdown, _) = broadcast::channel(4);

    let serving = {
        let node = node.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move { node.serve(None, shutdown).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    shutdown.send(()).expect("signal");

    timeout(Duration::from_secs(5), serving)
        .await
        .expect("serve returns")
        .expect("join")
        .expect("serve ok");
    node.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn two_nodes_sync_over_tcp() {
    let dir_a = TempDir::new().expect("dir a");
    let dir_b = TempDir::new().expect("dir b");

    let listener = bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");

    let a = Arc::new(Node::open(config("node-a"), dir_a.path()).expect("open a"));
    let mut b_config = config("node-b");
    b_config.peers = vec![addr.to_string()];
    b_config.sync.redial_interval_ms = 50;
    let b = Arc::new(Node::open(b_config, dir_b.path()).expect("open b"));

    add_track(&a, "t1").await;

    let (shutdown, _) = broadcast::channel(4);
    let serve_a = {
        let a = a.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move { a.serve(Some(listener), shutdown).await })
    };
    let serve_b = {
        let b = b.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move { b.serve(None, shutdown).await })
    };

    timeout(Duration::from_secs(10), async {
        while b.log().latest(&SourceId::from("node-a")) < 1 {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("b mirrors a's entry");
    assert_eq!(track_count(&b).await, 1);
    assert!(b.registry().is_online(&SourceId::from("node-a")));

    // And back the other way over the same session.
    add_track(&b, "t2").await;
    timeout(Duration::from_secs(10), async {
        while a.log().latest(&SourceId::from("node-b")) < 1 {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("a mirrors b's entry");

    shutdown.send(()).expect("signal");
    serve_a.await.expect("join a").expect("serve a");
    serve_b.await.expect("join b").expect("serve b");
    a.shutdown().await;
    b.shutdown().await;
}
