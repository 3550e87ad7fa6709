//! Single-writer command executor.
//!
//! Callers submit from any thread; a single worker task drains the queue in
//! submission order and runs each command on the blocking pool, one at a
//! time. For a successful mutation the log append completes before the
//! caller's handle resolves, so anyone reacting to a completion can already
//! see its entry in the log.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;

use chorus_core::SourceId;
use chorus_log::{LogEntry, LogError, MutationLog};

use crate::command::{CommandValue, DatabaseCommand};
use crate::error::CommandError;
use crate::store::DatabaseImpl;

pub type CommandId = u64;

/// What a successful command hands back.
#[derive(Debug, Clone, PartialEq)]
pub struct Outcome {
    pub id: CommandId,
    pub command: &'static str,
    /// Source the command ran on behalf of.
    pub source: SourceId,
    pub value: CommandValue,
    /// Sequence number of the log entry written for this command, if any.
    pub logged: Option<u64>,
}

/// Broadcast to every completion listener after a command finishes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletionEvent {
    pub id: CommandId,
    pub command: &'static str,
    pub source: Option<SourceId>,
    pub logged: Option<u64>,
    pub error: Option<String>,
}

// -- job lifecycle --

const QUEUED: u8 = 0;
const RUNNING: u8 = 1;
const CANCELLED: u8 = 2;

#[derive(Debug)]
struct JobState(AtomicU8);

impl JobState {
    fn new() -> Self {
        Self(AtomicU8::new(QUEUED))
    }

    fn try_start(&self) -> bool {
        self.0
            .compare_exchange(QUEUED, RUNNING, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn try_cancel(&self) -> bool {
        self.0
            .compare_exchange(QUEUED, CANCELLED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

enum Work {
    Local(DatabaseCommand),
    Replay {
        command: DatabaseCommand,
        entry: LogEntry,
    },
}

struct Job {
    id: CommandId,
    name: &'static str,
    work: Work,
    state: Arc<JobState>,
    respond_to: oneshot::Sender<Result<Outcome, CommandError>>,
}

/// Caller's side of a submitted command.
#[derive(Debug)]
pub struct CommandHandle {
    id: CommandId,
    command: &'static str,
    state: Arc<JobState>,
    rx: oneshot::Receiver<Result<Outcome, CommandError>>,
}

impl CommandHandle {
    pub fn id(&self) -> CommandId {
        self.id
    }

    pub fn command(&self) -> &'static str {
        self.command
    }

    /// Wait for the command to finish. Never blocks the thread.
    pub async fn wait(self) -> Result<Outcome, CommandError> {
        self.rx.await.unwrap_or(Err(CommandError::ExecutorClosed))
    }
}

// -- executor --

type SharedStore = Arc<Mutex<Box<dyn DatabaseImpl>>>;

#[derive(Debug)]
struct Inner {
    local: SourceId,
    tx: Mutex<Option<mpsc::UnboundedSender<Job>>>,
    next_id: AtomicU64,
    completions: broadcast::Sender<CompletionEvent>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

/// Cheap to clone; all clones feed the same queue.
#[derive(Debug, Clone)]
pub struct Executor {
    inner: Arc<Inner>,
}

impl Executor {
    /// Start the worker. Must be called from within a tokio runtime.
    pub fn start(store: impl DatabaseImpl + 'static, log: Arc<MutationLog>, local: SourceId) -> Self {
        let (tx, rx) = mpsc::unbounded_channel::<Job>();
        let (completions, _) = broadcast::channel(256);
        let store: SharedStore = Arc::new(Mutex::new(Box::new(store)));

        let worker = {
            let local = local.clone();
            let completions = completions.clone();
            tokio::spawn(async move { worker_task(store, log, local, rx, completions).await })
        };

        Self {
            inner: Arc::new(Inner {
                local,
                tx: Mutex::new(Some(tx)),
                next_id: AtomicU64::new(1),
                completions,
                worker: Mutex::new(Some(worker)),
            }),
        }
    }

    pub fn local_id(&self) -> &SourceId {
        &self.inner.local
    }

    /// Queue a command from the local source.
    pub fn submit(&self, command: DatabaseCommand) -> CommandHandle {
        let name = command.name();
        self.enqueue(name, Work::Local(command))
    }

    /// Queue a peer's logged mutation for replay, attributed to the entry's
    /// source. Duplicates and gaps are detected by the worker right before
    /// execution.
    pub fn submit_replay(&self, entry: LogEntry) -> CommandHandle {
        let command = match DatabaseCommand::from_entry(&entry.command, entry.args.clone()) {
            Ok(command) => command,
            Err(source) => {
                return self.completed(
                    "unknown",
                    CommandError::Decode {
                        command: entry.command,
                        source,
                    },
                )
            }
        };
        if !command.mutates() {
            return self.completed(command.name(), CommandError::NotReplayable(entry.command));
        }
        let name = command.name();
        self.enqueue(name, Work::Replay { command, entry })
    }

    /// Prevent a queued command from running. Returns `false` if it already
    /// started or finished.
    pub fn cancel(&self, handle: &CommandHandle) -> bool {
        let cancelled = handle.state.try_cancel();
        if cancelled {
            tracing::debug!(id = handle.id, command = handle.command, "command cancelled");
        }
        cancelled
    }

    pub fn subscribe_completions(&self) -> broadcast::Receiver<CompletionEvent> {
        self.inner.completions.subscribe()
    }

    /// Stop accepting commands, let the worker finish what is queued, and
    /// wait for it to exit.
    pub async fn shutdown(&self) {
        drop(
            self.inner
                .tx
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take(),
        );
        let worker = self
            .inner
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(worker) = worker {
            if let Err(err) = worker.await {
                tracing::error!(error = %err, "executor worker join failure");
            }
        }
    }

    fn next_id(&self) -> CommandId {
        self.inner.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn enqueue(&self, name: &'static str, work: Work) -> CommandHandle {
        let id = self.next_id();
        let state = Arc::new(JobState::new());
        let (respond_to, rx) = oneshot::channel();
        let job = Job {
            id,
            name,
            work,
            state: state.clone(),
            respond_to,
        };

        let sent = match self
            .inner
            .tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
        {
            Some(tx) => tx.send(job).map_err(|rejected| rejected.0),
            None => Err(job),
        };
        if let Err(job) = sent {
            let _ = job.respond_to.send(Err(CommandError::ExecutorClosed));
        }

        CommandHandle {
            id,
            command: name,
            state,
            rx,
        }
    }

    /// A handle that is already resolved with `error`.
    fn completed(&self, name: &'static str, error: CommandError) -> CommandHandle {
        let id = self.next_id();
        let (tx, rx) = oneshot::channel();
        tracing::warn!(id, command = name, error = %error, "command rejected before queueing");
        let _ = self.inner.completions.send(CompletionEvent {
            id,
            command: name,
            source: None,
            logged: None,
            error: Some(error.to_string()),
        });
        let _ = tx.send(Err(error));
        CommandHandle {
            id,
            command: name,
            state: Arc::new(JobState::new()),
            rx,
        }
    }
}

async fn worker_task(
    store: SharedStore,
    log: Arc<MutationLog>,
    local: SourceId,
    mut rx: mpsc::UnboundedReceiver<Job>,
    completions: broadcast::Sender<CompletionEvent>,
) {
    while let Some(job) = rx.recv().await {
        let Job {
            id,
            name,
            work,
            state,
            respond_to,
        } = job;

        let result = if state.try_start() {
            let store = store.clone();
            let log = log.clone();
            let local = local.clone();
            tokio::task::spawn_blocking(move || run_job(id, name, work, &store, &log, &local))
                .await
                .unwrap_or_else(|err| Err(CommandError::Panicked(format!("job join error: {err}"))))
        } else {
            Err(CommandError::Cancelled)
        };

        let event = match &result {
            Ok(outcome) => CompletionEvent {
                id,
                command: name,
                source: Some(outcome.source.clone()),
                logged: outcome.logged,
                error: None,
            },
            Err(err) => {
                tracing::warn!(id, command = name, error = %err, "command failed");
                CompletionEvent {
                    id,
                    command: name,
                    source: None,
                    logged: None,
                    error: Some(err.to_string()),
                }
            }
        };
        let _ = completions.send(event);
        let _ = respond_to.send(result);
    }
    tracing::debug!("executor worker stopped");
}

fn run_job(
    id: CommandId,
    name: &'static str,
    work: Work,
    store: &Mutex<Box<dyn DatabaseImpl>>,
    log: &MutationLog,
    local: &SourceId,
) -> Result<Outcome, CommandError> {
    let mut store = store.lock().unwrap_or_else(PoisonError::into_inner);
    match work {
        Work::Local(command) => {
            let value = execute_guarded(&command, &mut **store, local)?;
            let logged = if command.mutates() {
                let entry = command
                    .args()
                    .map_err(LogError::from)
                    .and_then(|args| log.append(local, name, args, command.entity_key()))
                    .map_err(|err| {
                        tracing::error!(
                            id,
                            command = name,
                            error = %err,
                            "store mutated but log append failed",
                        );
                        CommandError::LogAppend(err)
                    })?;
                Some(entry.seq)
            } else {
                None
            };
            Ok(Outcome {
                id,
                command: name,
                source: local.clone(),
                value,
                logged,
            })
        }
        Work::Replay { command, entry } => {
            log.check_replay(&entry.source, entry.seq, entry.prev_seq)?;
            let value = match execute_guarded(&command, &mut **store, &entry.source) {
                Ok(value) => value,
                Err(err) => {
                    tracing::warn!(
                        origin = %entry.source,
                        seq = entry.seq,
                        command = name,
                        error = %err,
                        "replayed mutation rejected by local store",
                    );
                    CommandValue::Rejected(err.to_string())
                }
            };
            let source = entry.source.clone();
            let seq = entry.seq;
            log.append_replicated(entry).map_err(|err| match err {
                LogError::Conflict(conflict) => CommandError::Replay(conflict),
                other => CommandError::LogAppend(other),
            })?;
            Ok(Outcome {
                id,
                command: name,
                source,
                value,
                logged: Some(seq),
            })
        }
    }
}

fn execute_guarded(
    command: &DatabaseCommand,
    store: &mut dyn DatabaseImpl,
    source: &SourceId,
) -> Result<CommandValue, CommandError> {
    match catch_unwind(AssertUnwindSafe(|| command.execute(store, source))) {
        Ok(result) => result.map_err(CommandError::Execution),
        Err(panic) => {
            let message = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            Err(CommandError::Panicked(message))
        }
    }
}
