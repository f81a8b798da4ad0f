//! Interactive process launching capability.
//!
//! The runner never talks to a terminal implementation directly. It asks a
//! [`ProcessBackend`] to spawn a program inside a terminal session and gets
//! back a [`ProcessControl`] (exclusively owned by the worker) plus a
//! per-worker receiver of [`ProcessEvent`]s.

pub mod pty;

#[cfg(test)]
pub(crate) mod fake;

use std::fmt;
use std::path::PathBuf;

use ptyfleet_core::WorkerId;
use tokio::sync::mpsc;

pub use pty::PtyBackend;

/// Everything needed to start one worker process.
#[derive(Debug, Clone)]
pub struct SpawnRequest {
    pub id: WorkerId,
    pub program: String,
    pub args: Vec<String>,
    /// Layered over the inherited environment.
    pub env: Vec<(String, String)>,
    pub cwd: PathBuf,
    pub cols: u16,
    pub rows: u16,
}

/// How a worker process ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitInfo {
    /// `None` when the exit status could not be collected.
    pub exit_code: Option<u32>,
    pub signal: Option<String>,
}

/// Events produced by one worker process, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessEvent {
    /// A raw chunk of combined terminal output.
    Output(Vec<u8>),
    /// The process is gone. Sent exactly once, as the last event.
    Exited(ExitInfo),
}

/// Owner-side handle to a running process.
pub trait ProcessControl: Send + Sync + fmt::Debug {
    fn pid(&self) -> Option<u32>;

    /// Whether the process has been observed to exit.
    fn has_exited(&self) -> bool;

    /// Ask the process to stop gracefully (SIGTERM on unix).
    fn terminate(&self) -> std::io::Result<()>;
}

/// A freshly spawned process and its event stream.
pub struct SpawnedProcess {
    pub control: Box<dyn ProcessControl>,
    pub events: mpsc::UnboundedReceiver<ProcessEvent>,
}

/// Capability to start programs inside a terminal-like session.
pub trait ProcessBackend: Send + Sync {
    fn spawn(&self, request: SpawnRequest) -> Result<SpawnedProcess, BackendError>;
}

/// Errors from process backends.
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("Failed to open pseudo-terminal: {reason}")]
    PtyOpen { reason: String },

    #[error("Failed to spawn {program}: {reason}")]
    Spawn { program: String, reason: String },
}
