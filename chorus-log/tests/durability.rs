//! Mutation log durability and concurrency tests.
//!
//! Covers reopen-after-crash, concurrent appends across sources, readers
//! racing appends, and compaction against arbitrary peer checkpoints.

use std::fs::OpenOptions;
use std::io::Write;
use std::sync::Arc;
use std::thread;

use chorus_core::SourceId;
use chorus_log::{FileBackend, LogEntry, MutationLog};
use rstest::rstest;
use serde_json::json;
use tempfile::TempDir;

fn s(id: &str) -> SourceId {
    SourceId::from(id)
}

// ---------------------------------------------------------------------------
// 1. Reopen
// ---------------------------------------------------------------------------

#[test]
fn reopened_log_continues_sequence() {
    let tmp = TempDir::new().expect("tmp");
    {
        let log = MutationLog::open(FileBackend::new(tmp.path()).expect("backend")).expect("open");
        for _ in 0..3 {
            log.append(&s("s1"), "add_tracks", json!({}), None).expect("append");
        }
    }

    let log = MutationLog::open(FileBackend::new(tmp.path()).expect("backend")).expect("reopen");
    assert_eq!(log.latest(&s("s1")), 3);
    let next = log.append(&s("s1"), "add_tracks", json!({}), None).expect("append");
    assert_eq!(next.seq, 4);
}

#[test]
fn compaction_is_persisted() {
    let tmp = TempDir::new().expect("tmp");
    {
        let log = MutationLog::open(FileBackend::new(tmp.path()).expect("backend")).expect("open");
        for v in 0..4 {
            log.append(&s("s1"), "rename_playlist", json!({ "v": v }), Some("playlist:p:title".into()))
                .expect("append");
        }
        assert_eq!(log.compact(&s("s1"), 4).expect("compact"), 3);
    }

    let log = MutationLog::open(FileBackend::new(tmp.path()).expect("backend")).expect("reopen");
    let kept: Vec<LogEntry> = log.read_since(&s("s1"), 0).collect();
    assert_eq!(kept.len(), 1);
    assert_eq!(kept[0].seq, 4);
    assert_eq!(log.latest(&s("s1")), 4);
}

#[test]
fn torn_tail_does_not_poison_later_appends() {
    let tmp = TempDir::new().expect("tmp");
    let backend = FileBackend::new(tmp.path()).expect("backend");
    let path = backend.path_for(&s("s1"));
    {
        let log = MutationLog::open(backend).expect("open");
        log.append(&s("s1"), "add_tracks", json!({}), None).expect("append");
    }
    let mut file = OpenOptions::new().append(true).open(&path).expect("open file");
    file.write_all(br#"{"source":"s1","seq":2,"prev_se"#).expect("torn write");
    drop(file);

    {
        let log = MutationLog::open(FileBackend::new(tmp.path()).expect("backend")).expect("reopen");
        assert_eq!(log.latest(&s("s1")), 1);
        let next = log.append(&s("s1"), "add_tracks", json!({}), None).expect("append");
        assert_eq!(next.seq, 2);
    }

    let log = MutationLog::open(FileBackend::new(tmp.path()).expect("backend")).expect("second reopen");
    let seqs: Vec<u64> = log.read_since(&s("s1"), 0).map(|e| e.seq).collect();
    assert_eq!(seqs, vec![1, 2]);
}

#[test]
fn similar_source_ids_keep_separate_histories() {
    let tmp = TempDir::new().expect("tmp");
    {
        let log = MutationLog::open(FileBackend::new(tmp.path()).expect("backend")).expect("open");
        log.append(&s("host_a"), "add_tracks", json!({}), None).expect("append");
        for v in 0..2 {
            log.append(&s("host.a"), "rename_playlist", json!({ "v": v }), Some("playlist:p:title".into()))
                .expect("append");
        }
        log.compact(&s("host.a"), 2).expect("compact");
    }

    let log = MutationLog::open(FileBackend::new(tmp.path()).expect("backend")).expect("reopen");
    assert_eq!(log.latest(&s("host_a")), 1);
    assert_eq!(log.latest(&s("host.a")), 2);
    assert_eq!(log.len(&s("host_a")), 1);
}

// ---------------------------------------------------------------------------
// 2. Concurrency
// ---------------------------------------------------------------------------

#[test]
fn concurrent_appends_per_source_stay_gapless() {
    let log = Arc::new(MutationLog::in_memory());
    let mut workers = Vec::new();
    for source in ["s1", "s2"] {
        for _ in 0..4 {
            let log = log.clone();
            workers.push(thread::spawn(move || {
                for _ in 0..50 {
                    log.append(&s(source), "add_tracks", json!({}), None).expect("append");
                }
            }));
        }
    }
    for w in workers {
        w.join().expect("join");
    }

    for source in ["s1", "s2"] {
        let seqs: Vec<u64> = log.read_since(&s(source), 0).map(|e| e.seq).collect();
        assert_eq!(seqs, (1..=200).collect::<Vec<_>>(), "source {source}");
    }
}

#[test]
fn readers_never_observe_out_of_order_entries() {
    let log = Arc::new(MutationLog::in_memory());
    let writer = {
        let log = log.clone();
        thread::spawn(move || {
            for _ in 0..500 {
                log.append(&s("s1"), "add_tracks", json!({}), None).expect("append");
            }
        })
    };

    for _ in 0..50 {
        let mut last = 0;
        for entry in log.read_since(&s("s1"), 0) {
            assert_eq!(entry.seq, last + 1, "reader saw a hole");
            assert_eq!(entry.prev_seq, last);
            last = entry.seq;
        }
    }
    writer.join().expect("join");
}

// ---------------------------------------------------------------------------
// 3. Compaction vs. checkpoints
// ---------------------------------------------------------------------------

#[rstest]
#[case(6)]
#[case(7)]
#[case(9)]
#[case(10)]
fn compaction_preserves_reads_from_checkpoints_at_or_after_floor(#[case] checkpoint: u64) {
    let floor = 6;
    let log = MutationLog::in_memory();
    for i in 0..10u64 {
        let key = if i % 2 == 0 { Some("track:x".to_string()) } else { None };
        log.append(&s("s1"), "update_track", json!({ "i": i }), key).expect("append");
    }
    let before: Vec<u64> = log.read_since(&s("s1"), checkpoint).map(|e| e.seq).collect();

    log.compact(&s("s1"), floor).expect("compact");

    let after: Vec<u64> = log.read_since(&s("s1"), checkpoint).map(|e| e.seq).collect();
    assert_eq!(after, before);
    assert_eq!(log.latest(&s("s1")), 10);
}

#[test]
fn compacted_entries_can_still_be_mirrored() {
    let origin = MutationLog::in_memory();
    for i in 0..5u64 {
        origin
            .append(&s("s1"), "update_track", json!({ "i": i }), Some("track:x".into()))
            .expect("append");
    }
    origin.compact(&s("s1"), 4).expect("compact");

    let mirror = MutationLog::in_memory();
    for entry in origin.read_since(&s("s1"), 0) {
        mirror.append_replicated(entry).expect("mirror");
    }
    assert_eq!(mirror.latest(&s("s1")), 5);
}
