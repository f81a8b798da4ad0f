//! Worker launcher with staggered start.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use ptyfleet_core::config::Config;
use ptyfleet_core::status::{self, COMPLETION_SENTINEL, INITIALIZING_MESSAGE, StatusChannel};
use ptyfleet_core::{WorkerId, WorkspaceLayout, pid_record};
use tokio::sync::watch;
use tracing::{info, warn};

use crate::backend::{BackendError, ProcessBackend, ProcessControl, SpawnRequest};
use crate::dispatcher::{Attach, DispatchClosed, DispatchHandle};
use crate::registry::{RegistryError, Worker, WorkerRegistry};

/// Launch parameters shared by every worker of a run.
#[derive(Debug, Clone)]
pub struct LaunchSettings {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub cols: u16,
    pub rows: u16,
    /// Pause between successive launches.
    pub stagger: Duration,
    /// Instruction sources beyond this count are ignored.
    pub max_workers: usize,
}

impl LaunchSettings {
    pub fn from_config(config: &Config, max_workers: usize) -> Self {
        Self {
            program: config.agent.program.clone(),
            args: config.agent.args.clone(),
            env: config.terminal.worker_env(),
            cols: config.terminal.cols,
            rows: config.terminal.rows,
            stagger: Duration::from_millis(config.runner.stagger_delay_ms),
            max_workers,
        }
    }
}

/// What the caller learns about a launched worker.
#[derive(Debug, Clone)]
pub struct WorkerHandle {
    pub id: WorkerId,
    pub pid: Option<u32>,
    pub launched_at: Instant,
}

/// An instruction slot that was not launched because its source is missing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedSlot {
    pub id: WorkerId,
    pub path: PathBuf,
}

/// Outcome of [`Launcher::start_all_workers`].
#[derive(Debug, Default)]
pub struct LaunchReport {
    pub launched: Vec<WorkerHandle>,
    pub skipped: Vec<SkippedSlot>,
    /// Shutdown was requested before every slot was visited.
    pub interrupted: bool,
}

/// Creates worker processes and wires them into the registry and dispatcher.
pub struct Launcher {
    layout: WorkspaceLayout,
    settings: LaunchSettings,
    backend: Arc<dyn ProcessBackend>,
    registry: WorkerRegistry,
    dispatch: DispatchHandle,
    shutdown: Option<watch::Receiver<bool>>,
}

impl Launcher {
    pub fn new(
        layout: WorkspaceLayout,
        settings: LaunchSettings,
        backend: Arc<dyn ProcessBackend>,
        registry: WorkerRegistry,
        dispatch: DispatchHandle,
    ) -> Self {
        Self {
            layout,
            settings,
            backend,
            registry,
            dispatch,
            shutdown: None,
        }
    }

    /// Stop issuing launches once `shutdown` turns true.
    ///
    /// A launch already in progress always runs to completion, so every
    /// spawned process ends up registered and visible to the terminator.
    #[must_use]
    pub fn with_shutdown(mut self, shutdown: watch::Receiver<bool>) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    /// Launch up to `max_workers` workers, one per existing instruction source.
    ///
    /// Slot `i` always gets id `i + 1`; missing sources are skipped with a
    /// warning. Launches are sequential with `stagger` between them. Returns
    /// once every launch has been issued, not when workers finish, or early
    /// with `interrupted` set when shutdown is requested.
    pub async fn start_all_workers(
        &self,
        instructions: &[PathBuf],
    ) -> Result<LaunchReport, LaunchError> {
        let mut report = LaunchReport::default();
        let mut shutdown = self.shutdown.clone();

        for (index, path) in instructions
            .iter()
            .take(self.settings.max_workers)
            .enumerate()
        {
            let Some(id) = WorkerId::from_slot(index) else {
                break;
            };
            if !path.exists() {
                warn!(worker_id = %id, path = %path.display(), "Instruction file not found");
                report.skipped.push(SkippedSlot {
                    id,
                    path: path.clone(),
                });
                continue;
            }
            if !report.launched.is_empty() {
                self.stagger(shutdown.as_mut()).await;
            }
            if shutdown.as_ref().is_some_and(|rx| *rx.borrow()) {
                info!(next_worker = %id, "Shutdown requested, no further workers launched");
                report.interrupted = true;
                break;
            }
            report.launched.push(self.start_worker(id, path).await?);
        }

        if instructions.len() > self.settings.max_workers {
            warn!(
                ignored = instructions.len() - self.settings.max_workers,
                max_workers = self.settings.max_workers,
                "Ignoring instruction files beyond worker limit"
            );
        }

        Ok(report)
    }

    /// Sleep for the stagger delay, cut short by a shutdown request.
    async fn stagger(&self, shutdown: Option<&mut watch::Receiver<bool>>) {
        let sleep = tokio::time::sleep(self.settings.stagger);
        let Some(rx) = shutdown else {
            return sleep.await;
        };
        tokio::select! {
            () = sleep => {}
            // A dropped sender disables this branch and the full delay runs.
            Ok(_) = rx.wait_for(|stop| *stop) => {}
        }
    }

    /// Spawn one worker for `instruction` and register it under `id`.
    pub async fn start_worker(
        &self,
        id: WorkerId,
        instruction: &Path,
    ) -> Result<WorkerHandle, LaunchError> {
        if self.registry.was_issued(id).await {
            return Err(RegistryError::IdReused { id }.into());
        }

        let channel = StatusChannel::for_worker(&self.layout, id);
        let log_path = self.layout.log_path(id);
        let log = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .await
            .map_err(|source| LaunchError::LogSink {
                path: log_path.clone(),
                source,
            })?;

        // The agent runs inside the workspace root, so every path it is
        // told about must be independent of the orchestrator's cwd.
        let cwd = absolute(self.layout.root())?;
        let instruction = absolute(instruction)?;
        let status_path = absolute(channel.path())?;

        let mut args = self.settings.args.clone();
        args.push(agent_prompt(id, &instruction, &status_path));
        let request = SpawnRequest {
            id,
            program: self.settings.program.clone(),
            args,
            env: self.settings.env.clone(),
            cwd,
            cols: self.settings.cols,
            rows: self.settings.rows,
        };

        info!(
            worker_id = %id,
            program = %request.program,
            instruction = %instruction.display(),
            "Starting worker"
        );
        let spawned = self.backend.spawn(request)?;
        let control = spawned.control;
        let pid = control.pid();

        if let Some(pid) = pid {
            let pid_path = self.layout.pid_path(id);
            if let Err(source) = pid_record::write(&pid_path, pid) {
                abandon(id, control.as_ref());
                return Err(LaunchError::PidRecord {
                    path: pid_path,
                    source,
                });
            }
        }

        if let Err(source) = channel.append(INITIALIZING_MESSAGE) {
            self.discard(id, control.as_ref());
            return Err(LaunchError::StatusChannel {
                path: channel.path().to_path_buf(),
                source,
            });
        }

        let worker = Worker::new(id, control, channel);
        let launched_at = worker.started_at();
        if let Err(rejected) = self.registry.insert(worker).await {
            if let Err(e) = rejected.terminate() {
                warn!(worker_id = %id, error = %e, "Failed to stop rejected worker");
            }
            let _ = pid_record::remove(&self.layout.pid_path(id));
            return Err(RegistryError::IdReused { id }.into());
        }

        if let Err(closed) = self.dispatch.attach(Attach {
            id,
            log,
            events: spawned.events,
        }) {
            // Nothing will ever observe this worker's exit, so undo the
            // registration here.
            if let Some(worker) = self.registry.remove(id).await
                && let Err(e) = worker.terminate()
            {
                warn!(worker_id = %id, error = %e, "Failed to stop unattached worker");
            }
            let _ = pid_record::remove(&self.layout.pid_path(id));
            return Err(closed.into());
        }

        info!(worker_id = %id, pid = ?pid, log = %log_path.display(), "Worker started");
        Ok(WorkerHandle {
            id,
            pid,
            launched_at,
        })
    }

    fn discard(&self, id: WorkerId, control: &dyn ProcessControl) {
        abandon(id, control);
        let _ = pid_record::remove(&self.layout.pid_path(id));
    }
}

fn abandon(id: WorkerId, control: &dyn ProcessControl) {
    if let Err(e) = control.terminate() {
        warn!(worker_id = %id, error = %e, "Failed to stop half-launched worker");
    }
}

fn absolute(path: &Path) -> Result<PathBuf, LaunchError> {
    std::path::absolute(path).map_err(|source| LaunchError::ResolvePath {
        path: path.to_path_buf(),
        source,
    })
}

/// Prompt handed to the agent: the task file plus the status protocol.
pub fn agent_prompt(id: WorkerId, instruction: &Path, status_path: &Path) -> String {
    format!(
        "Please read {} and execute the task. Write status updates to {} using the format: {}. \
         Mark completion with {COMPLETION_SENTINEL} when done.",
        instruction.display(),
        status_path.display(),
        status::append_command_hint(id, status_path),
    )
}

/// Errors from launching workers.
#[derive(Debug, thiserror::Error)]
pub enum LaunchError {
    #[error("Failed to resolve {path}: {source}")]
    ResolvePath {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to open worker log {path}: {source}")]
    LogSink {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error("Failed to write pid record {path}: {source}")]
    PidRecord {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to write status channel {path}: {source}")]
    StatusChannel {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Dispatch(#[from] DispatchClosed),
}
