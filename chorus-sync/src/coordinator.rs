//! Runs peer sessions.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use chorus_core::{SourceId, SourceRegistry, SyncConfig};
use chorus_db::{CommandError, Executor};
use chorus_log::{LogEntry, MutationLog, ReplayConflict};

use crate::error::SyncError;
use crate::message::SyncMessage;
use crate::session::{Phase, SyncSession};
use crate::transport::PeerLink;

/// Observable state of one session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionStatus {
    pub peer: Option<SourceId>,
    pub phase: Phase,
}

struct SessionControl {
    stop: watch::Sender<bool>,
    status: watch::Receiver<SessionStatus>,
}

struct Inner {
    registry: Arc<SourceRegistry>,
    log: Arc<MutationLog>,
    executor: Executor,
    config: SyncConfig,
    sessions: Mutex<HashMap<u64, SessionControl>>,
    /// Sessions that completed a handshake, per peer. A peer is online while
    /// its set is non-empty.
    peers: Mutex<HashMap<SourceId, HashSet<u64>>>,
    next_session: AtomicU64,
}

/// Owns every peer session of this process. Clones share state.
#[derive(Clone)]
pub struct SyncCoordinator {
    inner: Arc<Inner>,
}

/// Returned by [`SyncCoordinator::connect`].
#[derive(Debug)]
pub struct SessionHandle {
    id: u64,
    status: watch::Receiver<SessionStatus>,
    task: JoinHandle<Result<(), SyncError>>,
}

impl SessionHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn status(&self) -> SessionStatus {
        self.status.borrow().clone()
    }

    /// Wait until the session reaches `phase` or ends. Returns the status
    /// observed last.
    pub async fn wait_for(&mut self, phase: Phase) -> SessionStatus {
        if let Ok(status) = self.status.wait_for(|s| s.phase == phase).await {
            return status.clone();
        }
        self.status.borrow().clone()
    }

    /// Wait for the session task to end and return why it ended.
    pub async fn join(self) -> Result<(), SyncError> {
        self.task
            .await
            .unwrap_or_else(|err| Err(SyncError::Protocol(format!("session task join error: {err}"))))
    }
}

enum Flow {
    Continue,
    Stop,
}

impl SyncCoordinator {
    pub fn new(
        registry: Arc<SourceRegistry>,
        log: Arc<MutationLog>,
        executor: Executor,
        config: SyncConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                registry,
                log,
                executor,
                config,
                sessions: Mutex::new(HashMap::new()),
                peers: Mutex::new(HashMap::new()),
                next_session: AtomicU64::new(1),
            }),
        }
    }

    /// Start a session over `link`. Must be called from within a tokio runtime.
    pub fn connect(&self, link: PeerLink) -> SessionHandle {
        let id = self.inner.next_session.fetch_add(1, Ordering::Relaxed);
        let (stop, stop_rx) = watch::channel(false);
        let (status_tx, status) = watch::channel(SessionStatus {
            peer: None,
            phase: Phase::Handshaking,
        });
        self.inner
            .sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                id,
                SessionControl {
                    stop,
                    status: status.clone(),
                },
            );

        let inner = self.inner.clone();
        let task = tokio::spawn(async move { run_session(inner, id, link, status_tx, stop_rx).await });
        SessionHandle { id, status, task }
    }

    /// Ask the session with `peer` to say goodbye and stop. Returns whether
    /// such a session existed.
    pub fn disconnect(&self, peer: &SourceId) -> bool {
        let sessions = self.inner.sessions.lock().unwrap_or_else(PoisonError::into_inner);
        let mut found = false;
        for control in sessions.values() {
            if control.status.borrow().peer.as_ref() == Some(peer) {
                let _ = control.stop.send(true);
                found = true;
            }
        }
        found
    }

    /// Phase of the session with `peer`; `Disconnected` when there is none.
    pub fn phase(&self, peer: &SourceId) -> Phase {
        self.inner
            .sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(|control| control.status.borrow().clone())
            .find(|status| status.peer.as_ref() == Some(peer))
            .map(|status| status.phase)
            .unwrap_or(Phase::Disconnected)
    }

    /// Number of live sessions, including ones still handshaking.
    pub fn session_count(&self) -> usize {
        self.inner
            .sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Highest sequence of `origin` every connected peer has acknowledged,
    /// or our latest when no peer is connected.
    pub fn compaction_floor(&self, origin: &SourceId) -> u64 {
        let registry = &self.inner.registry;
        registry
            .online_peers()
            .iter()
            .filter(|peer| *peer != origin)
            .map(|peer| registry.acked(peer, origin))
            .min()
            .unwrap_or_else(|| self.inner.log.latest(origin))
    }

    /// Compact every origin up to its floor. Returns entries removed.
    pub fn compact_all(&self) -> Result<usize, SyncError> {
        let mut removed = 0;
        for origin in self.inner.log.sources() {
            let floor = self.compaction_floor(&origin);
            removed += self.inner.log.compact(&origin, floor)?;
        }
        Ok(removed)
    }

    /// Tell every session to stop. Sessions finish the replay they are on
    /// and send `Bye`; join their handles to wait for them.
    pub fn shutdown(&self) {
        let sessions = self.inner.sessions.lock().unwrap_or_else(PoisonError::into_inner);
        tracing::info!(sessions = sessions.len(), "stopping sync sessions");
        for control in sessions.values() {
            let _ = control.stop.send(true);
        }
    }
}

async fn run_session(
    inner: Arc<Inner>,
    id: u64,
    link: PeerLink,
    status_tx: watch::Sender<SessionStatus>,
    mut stop_rx: watch::Receiver<bool>,
) -> Result<(), SyncError> {
    let (label, outbound, mut inbound) = link.into_parts();
    let local = inner.registry.local_id().clone();
    let name = inner
        .registry
        .get(&local)
        .map(|source| source.name)
        .unwrap_or_default();
    let mut session = SyncSession::new(local.clone(), &inner.config, Instant::now());
    let mut appended = inner.log.subscribe();
    let mut tick = tokio::time::interval(inner.config.tick());
    tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

    tracing::debug!(session = id, link = %label, "sync session started");

    let hello = SyncMessage::Hello {
        source: local,
        name,
        have: inner.log.checkpoints(),
    };
    let mut result = send(&outbound, hello).await;

    while result.is_ok() {
        let step = tokio::select! {
            _ = stop_rx.changed() => {
                let _ = outbound.send(SyncMessage::Bye).await;
                Ok(Flow::Stop)
            }
            message = inbound.recv() => match message {
                Some(message) => handle_message(&inner, id, &mut session, &outbound, &stop_rx, message).await,
                None => Err(SyncError::Transport(format!("link {label} closed"))),
            },
            notice = appended.recv() => match notice {
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => Ok(Flow::Continue),
                Err(broadcast::error::RecvError::Closed) => Ok(Flow::Stop),
            },
            _ = tick.tick() => session.check_timeouts(Instant::now()).map(|()| Flow::Continue),
        };

        result = match step {
            Ok(Flow::Continue) => pump(&inner, &mut session, &outbound).await,
            Ok(Flow::Stop) => break,
            Err(err) => Err(err),
        };
        publish(&status_tx, &session);
    }

    session.disconnect();
    publish(&status_tx, &session);
    if let Some(peer) = session.peer() {
        detach(&inner, peer, id);
    }
    inner
        .sessions
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .remove(&id);

    match &result {
        Ok(()) => tracing::info!(session = id, peer = ?session.peer(), "sync session closed"),
        Err(err) => tracing::warn!(session = id, peer = ?session.peer(), error = %err, "sync session dropped"),
    }
    result
}

async fn send(outbound: &mpsc::Sender<SyncMessage>, message: SyncMessage) -> Result<(), SyncError> {
    let kind = message.kind();
    outbound
        .send(message)
        .await
        .map_err(|_| SyncError::Transport(format!("link closed while sending {kind}")))
}

/// Push whatever the session has ready.
async fn pump(
    inner: &Inner,
    session: &mut SyncSession,
    outbound: &mpsc::Sender<SyncMessage>,
) -> Result<(), SyncError> {
    while let Some(message) = session.next_outbound(&inner.log, Instant::now()) {
        if let SyncMessage::Entries { origin, entries } = &message {
            tracing::debug!(origin = %origin, count = entries.len(), "sending batch");
        }
        send(outbound, message).await?;
    }
    Ok(())
}

/// Record a handshaken session with `peer` and mark the peer online.
fn attach(inner: &Inner, peer: &SourceId, session: u64) -> Result<(), SyncError> {
    let mut peers = inner.peers.lock().unwrap_or_else(PoisonError::into_inner);
    peers.entry(peer.clone()).or_default().insert(session);
    inner.registry.set_online(peer, true)?;
    Ok(())
}

/// Forget `session`; the peer goes offline when it was its last one.
fn detach(inner: &Inner, peer: &SourceId, session: u64) {
    let mut peers = inner.peers.lock().unwrap_or_else(PoisonError::into_inner);
    let Some(ids) = peers.get_mut(peer) else {
        return;
    };
    if !ids.remove(&session) || !ids.is_empty() {
        return;
    }
    peers.remove(peer);
    if let Err(err) = inner.registry.set_online(peer, false) {
        tracing::warn!(peer = %peer, error = %err, "cannot mark peer offline");
    }
}

fn publish(status_tx: &watch::Sender<SessionStatus>, session: &SyncSession) {
    let status = SessionStatus {
        peer: session.peer().cloned(),
        phase: session.phase(),
    };
    status_tx.send_if_modified(|current| {
        if *current == status {
            false
        } else {
            *current = status;
            true
        }
    });
}

async fn handle_message(
    inner: &Inner,
    id: u64,
    session: &mut SyncSession,
    outbound: &mpsc::Sender<SyncMessage>,
    stop_rx: &watch::Receiver<bool>,
    message: SyncMessage,
) -> Result<Flow, SyncError> {
    let needs_stream = !matches!(message, SyncMessage::Hello { .. } | SyncMessage::Bye);
    if needs_stream && !session.is_streaming() {
        return Err(SyncError::Protocol(format!(
            "{} while {}",
            message.kind(),
            session.phase()
        )));
    }

    match message {
        SyncMessage::Hello { source, name, have } => {
            session.on_hello(source.clone(), have.clone())?;
            inner.registry.upsert_remote(&source, &name);
            for (origin, seq) in &have {
                inner.registry.record_ack(&source, origin, *seq)?;
            }
            attach(inner, &source, id)?;
            tracing::info!(peer = %source, name = %name, origins = have.len(), "peer handshake complete");
        }
        SyncMessage::Entries { origin, entries } => {
            if let Some(stray) = entries.iter().find(|e| e.source != origin) {
                return Err(SyncError::Protocol(format!(
                    "batch for {origin} carries entry from {}",
                    stray.source
                )));
            }
            let started = Instant::now();
            let outcome = apply_batch(inner, session, outbound, stop_rx, origin, entries).await;
            session.defer_deadlines(started.elapsed());
            outcome?;
        }
        SyncMessage::Ack { origin, seq } => {
            if !session.on_ack(&origin, seq) {
                tracing::debug!(origin = %origin, seq, "ignoring stale ack");
            }
            if let Some(peer) = session.peer() {
                inner.registry.record_ack(peer, &origin, seq)?;
            }
        }
        SyncMessage::CaughtUp => session.on_caught_up(),
        SyncMessage::Resync { origin, have } => {
            tracing::info!(origin = %origin, have, "peer requested resync");
            session.on_resync(origin, have);
        }
        SyncMessage::Bye => return Ok(Flow::Stop),
    }
    Ok(Flow::Continue)
}

/// Replay a peer batch in order, then acknowledge it.
///
/// Duplicates are skipped but still count as applied. Whatever the peer
/// sent, it has, so those entries are never relayed back to it. A gap stops
/// the batch and asks the peer to resend from what we have.
async fn apply_batch(
    inner: &Inner,
    session: &mut SyncSession,
    outbound: &mpsc::Sender<SyncMessage>,
    stop_rx: &watch::Receiver<bool>,
    origin: SourceId,
    entries: Vec<LogEntry>,
) -> Result<(), SyncError> {
    let mut applied = None;
    for entry in entries {
        if *stop_rx.borrow() {
            tracing::debug!(origin = %origin, "stop requested, abandoning batch");
            return Ok(());
        }
        let seq = entry.seq;
        match inner.executor.submit_replay(entry).wait().await {
            Ok(_) => {
                session.note_peer_has(&origin, seq);
                applied = Some(seq);
            }
            Err(CommandError::Replay(ReplayConflict::Duplicate { .. })) => {
                tracing::warn!(origin = %origin, seq, "skipping duplicate entry");
                session.note_peer_has(&origin, seq);
                applied = Some(seq);
            }
            Err(CommandError::Replay(ReplayConflict::Gap { latest, .. })) => {
                tracing::warn!(origin = %origin, seq, have = latest, "gap in peer stream, requesting resync");
                let resync = session.request_resync(origin, latest);
                return send(outbound, resync).await;
            }
            Err(err) => return Err(err.into()),
        }
    }
    if let Some(seq) = applied {
        send(outbound, SyncMessage::Ack { origin, seq }).await?;
    }
    Ok(())
}
