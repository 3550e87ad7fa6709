//! Per-peer sync state machine.
//!
//! [`SyncSession`] holds no I/O. The coordinator feeds it the peer's
//! messages and the current time, and asks it what to send next.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use tokio::time::Instant;

use chorus_core::{SourceId, SyncConfig};
use chorus_log::MutationLog;

use crate::error::SyncError;
use crate::message::SyncMessage;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Disconnected,
    Handshaking,
    Syncing,
    Idle,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Phase::Disconnected => "disconnected",
            Phase::Handshaking => "handshaking",
            Phase::Syncing => "syncing",
            Phase::Idle => "idle",
        };
        f.write_str(s)
    }
}

/// The one batch awaiting acknowledgement.
#[derive(Debug, Clone, PartialEq, Eq)]
struct InFlight {
    origin: SourceId,
    last_seq: u64,
    sent_at: Instant,
}

#[derive(Debug)]
pub struct SyncSession {
    local: SourceId,
    peer: Option<SourceId>,
    phase: Phase,
    /// Highest sequence per origin the peer is known to have.
    cursors: BTreeMap<SourceId, u64>,
    in_flight: Option<InFlight>,
    sent_caught_up: bool,
    peer_caught_up: bool,
    started_at: Instant,
    batch_size: usize,
    handshake_timeout: Duration,
    ack_timeout: Duration,
}

impl SyncSession {
    pub fn new(local: SourceId, config: &SyncConfig, now: Instant) -> Self {
        Self {
            local,
            peer: None,
            phase: Phase::Handshaking,
            cursors: BTreeMap::new(),
            in_flight: None,
            sent_caught_up: false,
            peer_caught_up: false,
            started_at: now,
            batch_size: config.batch(),
            handshake_timeout: config.handshake_timeout(),
            ack_timeout: config.ack_timeout(),
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn peer(&self) -> Option<&SourceId> {
        self.peer.as_ref()
    }

    /// What the peer is known to have of `origin`.
    pub fn cursor(&self, origin: &SourceId) -> u64 {
        self.cursors.get(origin).copied().unwrap_or(0)
    }

    pub fn has_in_flight(&self) -> bool {
        self.in_flight.is_some()
    }

    /// Whether entries may be exchanged.
    pub fn is_streaming(&self) -> bool {
        matches!(self.phase, Phase::Syncing | Phase::Idle)
    }

    pub fn on_hello(&mut self, peer: SourceId, have: BTreeMap<SourceId, u64>) -> Result<(), SyncError> {
        if self.phase != Phase::Handshaking {
            return Err(SyncError::Protocol(format!("unexpected hello while {}", self.phase)));
        }
        if peer == self.local {
            return Err(SyncError::Protocol(format!("peer claims our own source id {peer}")));
        }
        self.cursors = have.into_iter().filter(|(origin, _)| *origin != peer).collect();
        self.peer = Some(peer);
        self.phase = Phase::Syncing;
        Ok(())
    }

    /// The next message to push, if any.
    ///
    /// At most one `Entries` batch is outstanding. Once every origin is
    /// drained a single `CaughtUp` is emitted per sync round.
    pub fn next_outbound(&mut self, log: &MutationLog, now: Instant) -> Option<SyncMessage> {
        if !self.is_streaming() || self.in_flight.is_some() {
            return None;
        }
        let peer = self.peer.clone()?;

        for origin in log.sources() {
            if origin == peer {
                continue;
            }
            let entries: Vec<_> = log
                .read_since(&origin, self.cursor(&origin))
                .take(self.batch_size)
                .collect();
            if let Some(last) = entries.last() {
                self.in_flight = Some(InFlight {
                    origin: origin.clone(),
                    last_seq: last.seq,
                    sent_at: now,
                });
                return Some(SyncMessage::Entries { origin, entries });
            }
        }

        if !self.sent_caught_up {
            self.sent_caught_up = true;
            self.settle();
            return Some(SyncMessage::CaughtUp);
        }
        None
    }

    /// Returns `false` for an acknowledgement that matches nothing in flight,
    /// which can happen right after a resync.
    pub fn on_ack(&mut self, origin: &SourceId, seq: u64) -> bool {
        match &self.in_flight {
            Some(batch) if batch.origin == *origin && batch.last_seq == seq => {
                self.note_peer_has(origin, seq);
                self.in_flight = None;
                self.settle();
                true
            }
            _ => false,
        }
    }

    /// The peer sent us `origin`'s entries up to `seq`, so it already has
    /// them. Cursors only move forward here.
    pub fn note_peer_has(&mut self, origin: &SourceId, seq: u64) {
        let cursor = self.cursors.entry(origin.clone()).or_insert(0);
        *cursor = (*cursor).max(seq);
    }

    /// Push the ack deadline of the batch in flight back by `by`, for time
    /// spent on local work the peer could not have answered during.
    pub fn defer_deadlines(&mut self, by: Duration) {
        if let Some(batch) = &mut self.in_flight {
            batch.sent_at += by;
        }
    }

    pub fn on_caught_up(&mut self) {
        self.peer_caught_up = true;
        self.settle();
    }

    /// We detected a gap in `origin`; ask the peer to start over after `have`.
    pub fn request_resync(&mut self, origin: SourceId, have: u64) -> SyncMessage {
        self.phase = Phase::Syncing;
        self.peer_caught_up = false;
        SyncMessage::Resync { origin, have }
    }

    /// The peer detected a gap; rewind our cursor for `origin`.
    pub fn on_resync(&mut self, origin: SourceId, have: u64) {
        if self
            .in_flight
            .as_ref()
            .is_some_and(|batch| batch.origin == origin)
        {
            self.in_flight = None;
        }
        self.cursors.insert(origin, have);
        self.sent_caught_up = false;
        self.phase = Phase::Syncing;
    }

    pub fn check_timeouts(&self, now: Instant) -> Result<(), SyncError> {
        if self.phase == Phase::Handshaking && now.duration_since(self.started_at) >= self.handshake_timeout {
            return Err(SyncError::Timeout {
                phase: Phase::Handshaking,
            });
        }
        if let Some(batch) = &self.in_flight {
            if now.duration_since(batch.sent_at) >= self.ack_timeout {
                return Err(SyncError::Timeout { phase: self.phase });
            }
        }
        Ok(())
    }

    pub fn disconnect(&mut self) {
        self.phase = Phase::Disconnected;
        self.in_flight = None;
    }

    fn settle(&mut self) {
        if self.phase == Phase::Syncing
            && self.sent_caught_up
            && self.peer_caught_up
            && self.in_flight.is_none()
        {
            self.phase = Phase::Idle;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn s(id: &str) -> SourceId {
        SourceId::from(id)
    }

    fn config(batch_size: usize) -> SyncConfig {
        SyncConfig {
            batch_size,
            ..SyncConfig::default()
        }
    }

    fn log_with(source: &str, n: usize) -> MutationLog {
        let log = MutationLog::in_memory();
        for _ in 0..n {
            log.append(&s(source), "add_tracks", json!({}), None).unwrap();
        }
        log
    }

    fn connected(batch: usize) -> (SyncSession, Instant) {
        let now = Instant::now();
        let mut session = SyncSession::new(s("s1"), &config(batch), now);
        session.on_hello(s("s2"), BTreeMap::new()).unwrap();
        (session, now)
    }

    #[test]
    fn hello_moves_to_syncing() {
        let (session, _) = connected(10);
        assert_eq!(session.phase(), Phase::Syncing);
        assert_eq!(session.peer(), Some(&s("s2")));
    }

    #[test]
    fn second_hello_is_a_protocol_error() {
        let (mut session, _) = connected(10);
        let err = session.on_hello(s("s2"), BTreeMap::new()).unwrap_err();
        assert!(matches!(err, SyncError::Protocol(_)));
    }

    #[test]
    fn hello_from_ourselves_is_refused() {
        let mut session = SyncSession::new(s("s1"), &config(10), Instant::now());
        assert!(session.on_hello(s("s1"), BTreeMap::new()).is_err());
    }

    #[test]
    fn one_batch_in_flight_at_a_time() {
        let log = log_with("s1", 5);
        let (mut session, now) = connected(2);

        let Some(SyncMessage::Entries { entries, .. }) = session.next_outbound(&log, now) else {
            panic!("expected first batch");
        };
        assert_eq!(entries.iter().map(|e| e.seq).collect::<Vec<_>>(), [1, 2]);
        assert_eq!(session.next_outbound(&log, now), None);

        assert!(session.on_ack(&s("s1"), 2));
        let Some(SyncMessage::Entries { entries, .. }) = session.next_outbound(&log, now) else {
            panic!("expected second batch");
        };
        assert_eq!(entries[0].seq, 3);
    }

    #[test]
    fn streaming_starts_from_the_peer_checkpoint() {
        let log = log_with("s1", 5);
        let now = Instant::now();
        let mut session = SyncSession::new(s("s1"), &config(10), now);
        session
            .on_hello(s("s2"), BTreeMap::from([(s("s1"), 3)]))
            .unwrap();
        let Some(SyncMessage::Entries { entries, .. }) = session.next_outbound(&log, now) else {
            panic!("expected batch");
        };
        assert_eq!(entries.iter().map(|e| e.seq).collect::<Vec<_>>(), [4, 5]);
    }

    #[test]
    fn peer_entries_are_not_sent_back() {
        let log = log_with("s2", 3);
        let (mut session, now) = connected(10);
        assert_eq!(session.next_outbound(&log, now), Some(SyncMessage::CaughtUp));
    }

    #[test]
    fn idle_once_both_sides_caught_up() {
        let log = log_with("s1", 1);
        let (mut session, now) = connected(10);
        session.on_caught_up();
        assert!(matches!(session.next_outbound(&log, now), Some(SyncMessage::Entries { .. })));
        assert_eq!(session.phase(), Phase::Syncing);

        session.on_ack(&s("s1"), 1);
        assert_eq!(session.next_outbound(&log, now), Some(SyncMessage::CaughtUp));
        assert_eq!(session.phase(), Phase::Idle);
        assert_eq!(session.next_outbound(&log, now), None);
    }

    #[test]
    fn new_entries_flow_while_idle() {
        let log = log_with("s1", 1);
        let (mut session, now) = connected(10);
        session.on_caught_up();
        session.next_outbound(&log, now);
        session.on_ack(&s("s1"), 1);
        session.next_outbound(&log, now);
        assert_eq!(session.phase(), Phase::Idle);

        log.append(&s("s1"), "add_tracks", json!({}), None).unwrap();
        let Some(SyncMessage::Entries { entries, .. }) = session.next_outbound(&log, now) else {
            panic!("expected incremental push");
        };
        assert_eq!(entries[0].seq, 2);
    }

    #[test]
    fn resync_rewinds_and_repeats_caught_up() {
        let log = log_with("s1", 4);
        let (mut session, now) = connected(10);
        session.on_caught_up();
        session.next_outbound(&log, now);
        session.on_ack(&s("s1"), 4);
        session.next_outbound(&log, now);
        assert_eq!(session.phase(), Phase::Idle);

        session.on_resync(s("s1"), 2);
        assert_eq!(session.phase(), Phase::Syncing);
        let Some(SyncMessage::Entries { entries, .. }) = session.next_outbound(&log, now) else {
            panic!("expected replayed backlog");
        };
        assert_eq!(entries.iter().map(|e| e.seq).collect::<Vec<_>>(), [3, 4]);
        session.on_ack(&s("s1"), 4);
        assert_eq!(session.next_outbound(&log, now), Some(SyncMessage::CaughtUp));
        assert_eq!(session.phase(), Phase::Idle);
    }

    #[test]
    fn requesting_resync_waits_for_peer_caught_up_again() {
        let log = MutationLog::in_memory();
        let (mut session, now) = connected(10);
        session.on_caught_up();
        session.next_outbound(&log, now);
        assert_eq!(session.phase(), Phase::Idle);

        let msg = session.request_resync(s("s2"), 0);
        assert_eq!(msg, SyncMessage::Resync { origin: s("s2"), have: 0 });
        assert_eq!(session.phase(), Phase::Syncing);
        session.on_caught_up();
        assert_eq!(session.phase(), Phase::Idle);
    }

    #[test]
    fn stale_ack_is_ignored() {
        let (mut session, _) = connected(10);
        assert!(!session.on_ack(&s("s1"), 9));
    }

    #[test]
    fn handshake_timeout() {
        let now = Instant::now();
        let session = SyncSession::new(s("s1"), &SyncConfig::default(), now);
        assert!(session.check_timeouts(now).is_ok());
        let later = now + SyncConfig::default().handshake_timeout();
        assert!(matches!(
            session.check_timeouts(later),
            Err(SyncError::Timeout { phase: Phase::Handshaking })
        ));
    }

    #[test]
    fn ack_timeout_only_with_a_batch_in_flight() {
        let log = log_with("s1", 1);
        let (mut session, now) = connected(10);
        let ack_timeout = SyncConfig::default().ack_timeout();
        assert!(session.check_timeouts(now + ack_timeout * 2).is_ok());

        session.next_outbound(&log, now);
        assert!(session.check_timeouts(now + ack_timeout / 2).is_ok());
        assert!(session.check_timeouts(now + ack_timeout).is_err());
    }

    #[test]
    fn relayed_entries_are_not_echoed_to_their_sender() {
        let log = log_with("s3", 3);
        let (mut session, now) = connected(10);
        session.note_peer_has(&s("s3"), 3);
        assert_eq!(session.cursor(&s("s3")), 3);
        assert_eq!(session.next_outbound(&log, now), Some(SyncMessage::CaughtUp));

        session.note_peer_has(&s("s3"), 1);
        assert_eq!(session.cursor(&s("s3")), 3);
    }

    #[test]
    fn ack_never_moves_a_cursor_backwards() {
        let log = log_with("s1", 2);
        let (mut session, now) = connected(1);
        session.next_outbound(&log, now);
        session.note_peer_has(&s("s1"), 2);
        assert!(session.on_ack(&s("s1"), 1));
        assert_eq!(session.cursor(&s("s1")), 2);
    }

    #[test]
    fn deferring_pushes_the_ack_deadline_back() {
        let log = log_with("s1", 1);
        let (mut session, now) = connected(10);
        let ack_timeout = SyncConfig::default().ack_timeout();
        session.next_outbound(&log, now);

        session.defer_deadlines(ack_timeout);
        assert!(session.check_timeouts(now + ack_timeout).is_ok());
        assert!(session.check_timeouts(now + ack_timeout * 2).is_err());
    }
}
