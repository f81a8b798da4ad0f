//! ptyfleet Runner Library
//!
//! Launches a fixed list of agent workers, each in its own pseudo-terminal,
//! and supervises them until every worker reports completion through its
//! status channel or the operator aborts:
//! - Process backend capability (real PTY, fake in tests)
//! - Worker registry and per-worker event dispatch
//! - Staggered launcher
//! - Polling monitor with injected rendering
//! - Idempotent terminator

pub mod backend;
pub mod dispatcher;
pub mod launcher;
pub mod monitor;
pub mod registry;
pub mod render;
pub mod terminator;

#[cfg(test)]
pub(crate) mod test_support;

pub use backend::{ProcessBackend, PtyBackend};
pub use dispatcher::{DispatchHandle, Dispatcher};
pub use launcher::{LaunchError, LaunchReport, LaunchSettings, Launcher, WorkerHandle};
pub use monitor::{Completion, FleetSnapshot, Monitor, MonitorExit, MonitorState};
pub use registry::{Worker, WorkerRegistry};
pub use render::{ConsoleRenderer, Render};
pub use terminator::{TerminationReport, Terminator};
