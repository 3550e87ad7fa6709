use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::time::Instant;

use chorus_core::config::load_at as load_config;
use chorus_core::{ChorusConfig, Source, SourceId, SourceRegistry};
use chorus_db::{DatabaseCommand, DatabaseImpl, Executor, MemoryDatabase};
use chorus_log::{FileBackend, LogBackend, MutationLog};
use chorus_sync::{PeerLink, SessionHandle, SyncCoordinator};

use crate::error::{io_err, net_err, NodeError};
use crate::paths::{log_dir, SESSION_DRAIN};

/// One running participant: the executor over its store, the mutation log,
/// and the coordinator for its peer sessions.
pub struct Node {
    config: ChorusConfig,
    registry: Arc<SourceRegistry>,
    log: Arc<MutationLog>,
    executor: Executor,
    sync: SyncCoordinator,
}

impl Node {
    /// Wire up a node on top of `backend` and `store`. Must be called from
    /// within a tokio runtime.
    pub fn start(
        config: ChorusConfig,
        backend: impl LogBackend + 'static,
        store: impl DatabaseImpl + 'static,
    ) -> Result<Self, NodeError> {
        let local = config.source.id.clone();
        let registry = Arc::new(SourceRegistry::new(Source::local(
            local.clone(),
            config.source.name.clone(),
        )));
        let log = Arc::new(MutationLog::open(backend)?);
        let executor = Executor::start(store, log.clone(), local.clone());
        let sync = SyncCoordinator::new(
            registry.clone(),
            log.clone(),
            executor.clone(),
            config.sync.clone(),
        );
        tracing::info!(
            source = %local,
            name = %config.source.name,
            origins = log.sources().len(),
            "node started",
        );
        Ok(Self {
            config,
            registry,
            log,
            executor,
            sync,
        })
    }

    /// Open the file-backed log under `data_dir` and rebuild the in-memory
    /// store from it.
    pub fn open(config: ChorusConfig, data_dir: &Path) -> Result<Self, NodeError> {
        let dir = log_dir(data_dir);
        let backend = FileBackend::new(&dir)?;
        let log = MutationLog::open(backend.clone())?;
        let store = restore_store(&log);
        drop(log);
        Self::start(config, backend, store)
    }

    pub fn local_id(&self) -> &SourceId {
        self.registry.local_id()
    }

    pub fn config(&self) -> &ChorusConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<SourceRegistry> {
        &self.registry
    }

    pub fn log(&self) -> &Arc<MutationLog> {
        &self.log
    }

    pub fn executor(&self) -> &Executor {
        &self.executor
    }

    pub fn sync(&self) -> &SyncCoordinator {
        &self.sync
    }

    pub fn connect(&self, link: PeerLink) -> SessionHandle {
        self.sync.connect(link)
    }

    /// Accept on `listener`, dial configured peers and compact periodically
    /// until `shutdown` fires.
    pub async fn serve(
        &self,
        listener: Option<TcpListener>,
        shutdown: broadcast::Sender<()>,
    ) -> Result<(), NodeError> {
        let mut stop = shutdown.subscribe();
        let listener_handle = listener.map(|listener| {
            let sync = self.sync.clone();
            let shutdown_rx = shutdown.subscribe();
            tokio::spawn(async move { accept_task(listener, sync, shutdown_rx).await })
        });

        let dial_handles: Vec<_> = self
            .config
            .peers
            .iter()
            .map(|addr| {
                let addr = addr.clone();
                let sync = self.sync.clone();
                let redial = self.config.sync.redial_interval();
                let shutdown_rx = shutdown.subscribe();
                tokio::spawn(async move { dial_task(addr, sync, redial, shutdown_rx).await })
            })
            .collect();

        let compaction_handle = self.config.log.compact_interval_secs.map(|secs| {
            let sync = self.sync.clone();
            let shutdown_rx = shutdown.subscribe();
            tokio::spawn(async move {
                compaction_task(sync, Duration::from_secs(secs.max(1)), shutdown_rx).await
            })
        });

        let _ = stop.recv().await;

        if let Some(handle) = listener_handle {
            handle_join("listener", handle.await)?;
        }
        for handle in dial_handles {
            handle_join("dialer", handle.await)?;
        }
        if let Some(handle) = compaction_handle {
            handle_join("compaction", handle.await)?;
        }
        Ok(())
    }

    /// Stop every session, then drain and stop the executor.
    pub async fn shutdown(&self) {
        self.sync.shutdown();
        let deadline = Instant::now() + SESSION_DRAIN;
        while self.sync.session_count() > 0 && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        if self.sync.session_count() > 0 {
            tracing::warn!(
                sessions = self.sync.session_count(),
                "sessions still open at shutdown",
            );
        }
        self.executor.shutdown().await;
        tracing::info!(source = %self.local_id(), "node stopped");
    }
}

/// Bind the peer listener.
pub async fn bind(addr: &str) -> Result<TcpListener, NodeError> {
    let listener = TcpListener::bind(addr).await.map_err(|e| net_err(addr, e))?;
    tracing::info!(addr = %addr, "listening for peers");
    Ok(listener)
}

/// Start the node runtime and block the current thread until it exits.
pub fn start_blocking(config_path: &Path) -> Result<(), NodeError> {
    init_tracing();
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| io_err("tokio-runtime", e))?;
    runtime.block_on(run(config_path.to_path_buf()))
}

/// Run a node from the config at `config_path` until ctrl-c.
pub async fn run(config_path: PathBuf) -> Result<(), NodeError> {
    let config = load_config(&config_path)?;
    let data_dir = config.data_dir_for(&config_path);
    fs::create_dir_all(&data_dir).map_err(|e| io_err(&data_dir, e))?;

    let node = Node::open(config, &data_dir)?;
    let listener = match node.config().listen.as_deref() {
        Some(addr) => Some(bind(addr).await?),
        None => None,
    };

    let (shutdown_tx, _) = broadcast::channel::<()>(16);
    let signal_handle = {
        let shutdown = shutdown_tx.clone();
        tokio::spawn(async move {
            let mut shutdown_rx = shutdown.subscribe();
            tokio::select! {
                _ = shutdown_rx.recv() => Ok(()),
                signal = tokio::signal::ctrl_c() => {
                    match signal {
                        Ok(()) => {
                            tracing::info!("received ctrl-c, shutting down node");
                            let _ = shutdown.send(());
                            Ok(())
                        }
                        Err(err) => Err(NodeError::Runtime(format!("ctrl-c handler failed: {err}"))),
                    }
                }
            }
        })
    };

    let served = node.serve(listener, shutdown_tx.clone()).await;
    let _ = shutdown_tx.send(());
    node.shutdown().await;
    served?;
    handle_join("signal_handler", signal_handle.await)
}

/// Apply every logged mutation, origin by origin, to a fresh store.
fn restore_store(log: &MutationLog) -> MemoryDatabase {
    let mut store = MemoryDatabase::new();
    let mut applied = 0usize;
    for origin in log.sources() {
        for entry in log.read_since(&origin, 0) {
            let command = match DatabaseCommand::from_entry(&entry.command, entry.args) {
                Ok(command) => command,
                Err(err) => {
                    tracing::warn!(origin = %origin, seq = entry.seq, error = %err, "skipping undecodable entry");
                    continue;
                }
            };
            match command.execute(&mut store, &entry.source) {
                Ok(_) => applied += 1,
                Err(err) => {
                    tracing::debug!(origin = %origin, seq = entry.seq, error = %err, "logged entry rejected on restore");
                }
            }
        }
    }
    tracing::info!(applied, "restored store from mutation log");
    store
}

async fn accept_task(
    listener: TcpListener,
    sync: SyncCoordinator,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), NodeError> {
    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            accepted = listener.accept() => {
                let (stream, addr) = match accepted {
                    Ok(accepted) => accepted,
                    Err(err) => {
                        tracing::warn!(error = %err, "accept failed");
                        continue;
                    }
                };
                tracing::info!(peer_addr = %addr, "accepted peer connection");
                let handle = sync.connect(PeerLink::over_stream(stream, addr.to_string()));
                tokio::spawn(async move {
                    if let Err(err) = handle.join().await {
                        tracing::warn!(peer_addr = %addr, error = %err, "inbound session ended");
                    }
                });
            }
        }
    }
    Ok(())
}

async fn dial_task(
    addr: String,
    sync: SyncCoordinator,
    redial: Duration,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), NodeError> {
    loop {
        match TcpStream::connect(&addr).await {
            Ok(stream) => {
                tracing::info!(peer_addr = %addr, "connected to peer");
                let handle = sync.connect(PeerLink::over_stream(stream, addr.clone()));
                tokio::select! {
                    _ = shutdown_rx.recv() => break,
                    result = handle.join() => {
                        if let Err(err) = result {
                            tracing::warn!(peer_addr = %addr, error = %err, "outbound session ended");
                        }
                    }
                }
            }
            Err(err) => {
                tracing::debug!(peer_addr = %addr, error = %err, "dial failed");
            }
        }

        tokio::select! {
            _ = shutdown_rx.recv() => break,
            _ = tokio::time::sleep(redial) => {}
        }
    }
    Ok(())
}

async fn compaction_task(
    sync: SyncCoordinator,
    every: Duration,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), NodeError> {
    let mut interval = tokio::time::interval(every);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    interval.tick().await; // consume the first immediate tick

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            _ = interval.tick() => {
                let sync = sync.clone();
                match tokio::task::spawn_blocking(move || sync.compact_all()).await {
                    Ok(Ok(removed)) => tracing::debug!(removed, "periodic compaction"),
                    Ok(Err(err)) => tracing::warn!(error = %err, "periodic compaction failed"),
                    Err(err) => tracing::error!(error = %err, "compaction task join failure"),
                }
            }
        }
    }
    Ok(())
}

fn handle_join(
    task: &str,
    result: Result<Result<(), NodeError>, tokio::task::JoinError>,
) -> Result<(), NodeError> {
    match result {
        Ok(inner) => inner,
        Err(err) => Err(NodeError::Runtime(format!("{task} task join failure: {err}"))),
    }
}

/// Install the global subscriber once. `RUST_LOG` overrides the `info` default;
/// `CHORUS_LOG_FORMAT=json` switches to one JSON object per line.
pub fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = fmt().with_env_filter(filter).with_target(false);
    let format = std::env::var(LOG_FORMAT_ENV).ok();
    let _ = if json_requested(format.as_deref()) {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
}

const LOG_FORMAT_ENV: &str = "CHORUS_LOG_FORMAT";

fn json_requested(format: Option<&str>) -> bool {
    format.is_some_and(|f| f.trim().eq_ignore_ascii_case("json"))
}
