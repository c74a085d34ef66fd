//! The process supervisor.
//!
//! `Supervisor` owns the registry of runs, the event bus and the runtime
//! store. It is cheap to clone; clones share state. Background work for a run
//! (output readers, the exit watcher, port discovery) is spawned onto the
//! current Tokio runtime and reports back through the same shared state.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::{CommandCatalog, SupervisorSettings};
use crate::error::SupervisorError;
use crate::events::{EventBus, ProcessEvent, Subscription, SubscriptionId};
use crate::output::{OutputEntry, StreamKind};
use crate::persist::{MemoryStore, RuntimeEntry, RuntimeSnapshot, RuntimeStore};
use crate::ports;
use crate::process::{ExecutionOptions, ExecutionResult, ProcessRecord};
use crate::reconcile;
use crate::registry::{ExitOutcome, Registry, RunId};
use crate::runner::{self, Launched};
use crate::shell::Platform;
use crate::terminate;

/// How long the exit watcher waits for output readers to drain.
const READER_DRAIN: Duration = Duration::from_millis(500);

#[derive(Clone)]
pub struct Supervisor {
    inner: Arc<Inner>,
}

struct Inner {
    settings: SupervisorSettings,
    platform: Platform,
    registry: Mutex<Registry>,
    events: EventBus,
    store: Arc<dyn RuntimeStore>,
    /// Serializes snapshot load/modify/save cycles. Taken before `registry`.
    snapshot_lock: Mutex<()>,
}

/// How a one-off run finished.
#[derive(Debug)]
enum RunOutcome {
    Exited(Option<i32>),
    Failed(String),
}

impl Supervisor {
    /// Creates a supervisor backed by `store`, pruning stale snapshot entries
    /// first. The registry always starts empty.
    pub fn new(settings: SupervisorSettings, store: Arc<dyn RuntimeStore>) -> Self {
        match reconcile::reconcile(store.as_ref(), terminate::is_alive) {
            Ok(report) => debug!(kept = report.kept, pruned = report.pruned, "reconciled runtime snapshot"),
            Err(err) => warn!(error = %err, "failed to reconcile runtime snapshot"),
        }
        Self {
            inner: Arc::new(Inner {
                registry: Mutex::new(Registry::new(settings.output_capacity)),
                settings,
                platform: Platform::current(),
                events: EventBus::new(),
                store,
                snapshot_lock: Mutex::new(()),
            }),
        }
    }

    /// Creates a supervisor whose snapshot lives only in memory.
    pub fn ephemeral(settings: SupervisorSettings) -> Self {
        Self::new(settings, Arc::new(MemoryStore::new()))
    }

    pub fn settings(&self) -> &SupervisorSettings {
        &self.inner.settings
    }

    pub fn subscribe(&self) -> Subscription {
        self.inner.events.subscribe()
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.inner.events.unsubscribe(id)
    }

    /// Launches a command.
    ///
    /// Services return as soon as the process has a PID. One-off runs return
    /// once the process exits. Failures come back as a non-success result.
    pub async fn execute_command(&self, options: ExecutionOptions) -> ExecutionResult {
        let command_id = options.command_id.clone();
        let (launched, run) = {
            let mut registry = self.inner.registry();
            if registry.is_live(&command_id) {
                return ExecutionResult::failed(&command_id, SupervisorError::AlreadyRunning);
            }
            let launched = match runner::launch(&options, &self.inner.settings, self.inner.platform) {
                Ok(launched) => launched,
                Err(err) => return ExecutionResult::failed(&command_id, err),
            };
            let record = ProcessRecord::running(&command_id, &options.project_id, launched.pid);
            let run = registry.register(record, options.is_service);
            (launched, run)
        };
        let Launched { mut child, pid } = launched;
        info!(command_id = %command_id, pid, service = options.is_service, "started");

        self.inner.persist_run(&command_id, run);
        self.inner.events.emit(ProcessEvent::Started {
            command_id: command_id.clone(),
            pid,
        });

        if options.is_service {
            self.inner.push_output(
                &command_id,
                run,
                OutputEntry::now(StreamKind::Stdout, format!("$ {}\n", options.command)),
            );
            let mut readers = Vec::new();
            if let Some(stdout) = child.stdout.take() {
                readers.push(self.spawn_reader(&command_id, run, StreamKind::Stdout, stdout));
            }
            if let Some(stderr) = child.stderr.take() {
                readers.push(self.spawn_reader(&command_id, run, StreamKind::Stderr, stderr));
            }
            let inner = Arc::clone(&self.inner);
            let id = command_id.clone();
            tokio::spawn(async move { inner.watch_exit(id, run, child, readers, None).await });
            self.spawn_port_scout(&command_id, run, pid);
            return ExecutionResult::started(&command_id, pid);
        }

        let (done_tx, done_rx) = oneshot::channel();
        let inner = Arc::clone(&self.inner);
        let id = command_id.clone();
        tokio::spawn(async move { inner.watch_exit(id, run, child, Vec::new(), Some(done_tx)).await });
        match done_rx.await {
            Ok(RunOutcome::Exited(exit_code)) => ExecutionResult {
                exit_code,
                ..ExecutionResult::started(&command_id, pid)
            },
            Ok(RunOutcome::Failed(message)) => ExecutionResult {
                pid: Some(pid),
                ..ExecutionResult::failed(&command_id, message)
            },
            Err(_) => ExecutionResult {
                pid: Some(pid),
                ..ExecutionResult::failed(&command_id, "exit watcher ended unexpectedly")
            },
        }
    }

    /// Resolves a catalog command and executes it. The project path is the
    /// default working directory.
    pub async fn run_command(&self, catalog: &dyn CommandCatalog, project_id: &str, command_id: &str) -> ExecutionResult {
        let Some(definition) = catalog.command(project_id, command_id) else {
            return ExecutionResult::failed(command_id, "Command not found");
        };
        let working_directory = definition
            .working_directory
            .or_else(|| catalog.project(project_id).and_then(|p| p.path));
        let options = ExecutionOptions {
            command_id: definition.id,
            project_id: project_id.to_string(),
            command: definition.command,
            shell: definition.shell,
            working_directory,
            env: definition.env.unwrap_or_default(),
            is_service: definition.kind.is_service(),
        };
        self.execute_command(options).await
    }

    /// Runs several catalog commands in order.
    pub async fn execute_many(&self, catalog: &dyn CommandCatalog, project_id: &str, command_ids: &[String]) -> Vec<ExecutionResult> {
        let mut results = Vec::with_capacity(command_ids.len());
        for command_id in command_ids {
            results.push(self.run_command(catalog, project_id, command_id).await);
        }
        results
    }

    /// Stops the live run of `command_id` and its descendants.
    ///
    /// Returns `false` when nothing was running or the OS gave no
    /// confirmation. Local state is cleared either way.
    pub async fn stop_process(&self, command_id: &str) -> bool {
        let Some((pid, run)) = self.inner.registry().live_run(command_id) else {
            return false;
        };
        let result = terminate::terminate_tree(pid, self.inner.settings.stop_policy()).await;

        if self.inner.registry().remove_run(command_id, run).is_some() {
            self.inner.forget(command_id);
        }
        match result {
            Ok(()) => {
                info!(command_id, pid, "stopped");
                true
            }
            Err(err) => {
                warn!(command_id, pid, error = %err, "stop not confirmed");
                false
            }
        }
    }

    /// Stops several commands in order, returning each outcome.
    pub async fn stop_many(&self, command_ids: &[String]) -> Vec<(String, bool)> {
        let mut results = Vec::with_capacity(command_ids.len());
        for command_id in command_ids {
            results.push((command_id.clone(), self.stop_process(command_id).await));
        }
        results
    }

    /// Stops every live run, optionally limited to one project. Returns the
    /// number of successful stops.
    pub async fn stop_all_processes(&self, project_id: Option<&str>) -> usize {
        let ids = self.inner.registry().live_ids(project_id);
        let mut stopped = 0;
        for command_id in ids {
            if self.stop_process(&command_id).await {
                stopped += 1;
            }
        }
        stopped
    }

    pub fn get_process_info(&self, command_id: &str) -> Option<ProcessRecord> {
        self.inner.registry().record(command_id)
    }

    pub fn get_all_process_info(&self, project_id: Option<&str>) -> Vec<ProcessRecord> {
        self.inner.registry().records(project_id)
    }

    /// Most recent buffered output, oldest first. `None` uses the configured
    /// default limit.
    pub fn get_process_output(&self, command_id: &str, limit: Option<usize>) -> Vec<OutputEntry> {
        let limit = limit.unwrap_or(self.inner.settings.default_output_limit);
        self.inner.registry().output(command_id, limit)
    }

    pub fn is_process_running(&self, command_id: &str) -> bool {
        self.inner.registry().is_live(command_id)
    }

    fn spawn_reader<R>(&self, command_id: &str, run: RunId, stream: StreamKind, reader: R) -> JoinHandle<()>
    where
        R: tokio::io::AsyncRead + Unpin + Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        let command_id = command_id.to_string();
        let platform = self.inner.platform;
        tokio::spawn(async move {
            runner::read_stream(reader, stream, platform, |entry| {
                inner.push_output(&command_id, run, entry);
            })
            .await;
        })
    }

    fn spawn_port_scout(&self, command_id: &str, run: RunId, pid: u32) {
        let inner = Arc::clone(&self.inner);
        let command_id = command_id.to_string();
        let schedule = self.inner.settings.scan_schedule();
        let platform = self.inner.platform;
        tokio::spawn(async move {
            let found = ports::scout(
                schedule,
                || inner.registry().is_current(&command_id, run),
                || ports::discover_ports(pid, platform),
            )
            .await;
            let Some(found) = found else {
                return;
            };
            let updated = inner.registry().set_ports(&command_id, run, found.clone());
            if updated.is_some() {
                info!(command_id = %command_id, ports = ?found, "ports detected");
                inner.persist_run(&command_id, run);
                inner.events.emit(ProcessEvent::Ports {
                    command_id,
                    ports: found,
                });
            }
        });
    }
}

impl Inner {
    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn push_output(&self, command_id: &str, run: RunId, entry: OutputEntry) {
        let appended = self.registry().append_output(command_id, run, entry.clone());
        if appended {
            self.events.emit(ProcessEvent::Output {
                command_id: command_id.to_string(),
                entry,
            });
        }
    }

    /// Waits for the child to exit and applies the outcome. Exactly one
    /// `Exit` or `Error` event is emitted per run, even if it was stopped.
    async fn watch_exit(
        &self,
        command_id: String,
        run: RunId,
        mut child: tokio::process::Child,
        readers: Vec<JoinHandle<()>>,
        done: Option<oneshot::Sender<RunOutcome>>,
    ) {
        let waited = child.wait().await;
        let _ = tokio::time::timeout(READER_DRAIN, async {
            for reader in readers {
                let _ = reader.await;
            }
        })
        .await;

        let outcome = match waited {
            Ok(status) => {
                let exit_code = status.code();
                let signal = exit_signal(&status);
                let applied = self.registry().mark_exited(&command_id, run, exit_code);
                if applied != ExitOutcome::Stale {
                    self.forget(&command_id);
                }
                info!(command_id = %command_id, ?exit_code, ?signal, "exited");
                self.events.emit(ProcessEvent::Exit {
                    command_id,
                    exit_code,
                    signal,
                });
                RunOutcome::Exited(exit_code)
            }
            Err(err) => {
                let message = err.to_string();
                let applied = self.registry().mark_error(&command_id, run, &message);
                if applied != ExitOutcome::Stale {
                    self.forget(&command_id);
                }
                warn!(command_id = %command_id, error = %message, "process error");
                self.events.emit(ProcessEvent::Error {
                    command_id,
                    message: message.clone(),
                });
                RunOutcome::Failed(message)
            }
        };
        if let Some(done) = done {
            let _ = done.send(outcome);
        }
    }

    /// Current snapshot; an unreadable one is replaced by an empty snapshot.
    fn snapshot(&self) -> RuntimeSnapshot {
        self.store.load().unwrap_or_else(|err| {
            warn!(error = %err, "runtime snapshot unreadable, starting from empty");
            RuntimeSnapshot::default()
        })
    }

    fn snapshot_guard(&self) -> MutexGuard<'_, ()> {
        self.snapshot_lock.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Writes the record of `run` to the snapshot if it is still the live run.
    fn persist_run(&self, command_id: &str, run: RunId) {
        let _guard = self.snapshot_guard();
        let registry = self.registry();
        if !registry.is_current(command_id, run) {
            return;
        }
        let Some(record) = registry.record(command_id) else {
            return;
        };
        drop(registry);
        let mut snapshot = self.snapshot();
        snapshot.upsert(&record.project_id, RuntimeEntry::from(&record));
        if let Err(err) = self.store.save(&snapshot) {
            warn!(command_id, error = %err, "failed to persist runtime state");
        }
    }

    /// Drops `command_id` from the snapshot unless a newer run is live.
    fn forget(&self, command_id: &str) {
        let _guard = self.snapshot_guard();
        if self.registry().is_live(command_id) {
            return;
        }
        let mut snapshot = self.snapshot();
        if !snapshot.remove(command_id) {
            return;
        }
        if let Err(err) = self.store.save(&snapshot) {
            warn!(command_id, error = %err, "failed to remove persisted runtime state");
        }
    }
}

#[cfg(unix)]
fn exit_signal(status: &std::process::ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

#[cfg(not(unix))]
fn exit_signal(_status: &std::process::ExitStatus) -> Option<i32> {
    None
}
