//! Shared fixtures for orchestration tests.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use ptyfleet_core::{WorkerId, WorkspaceLayout};
use tempfile::TempDir;
use tokio::task::JoinHandle;

use crate::backend::fake::FakeBackend;
use crate::dispatcher::Dispatcher;
use crate::launcher::{LaunchSettings, Launcher};
use crate::monitor::{Completion, FleetSnapshot};
use crate::registry::WorkerRegistry;
use crate::render::Render;

pub(crate) fn id(n: u32) -> WorkerId {
    WorkerId::new(n).unwrap()
}

/// Temp workspace wired to a fake backend and a running dispatcher.
pub(crate) struct Rig {
    pub dir: TempDir,
    pub layout: WorkspaceLayout,
    pub registry: WorkerRegistry,
    pub backend: FakeBackend,
    pub launcher: Launcher,
    pub dispatcher: JoinHandle<()>,
}

impl Rig {
    pub fn new(max_workers: usize, stagger: Duration) -> Self {
        Self::in_dir(TempDir::new().unwrap(), max_workers, stagger)
    }

    /// Workspace under the current directory, addressed by a relative path.
    pub fn relative(max_workers: usize, stagger: Duration) -> Self {
        let dir = tempfile::Builder::new()
            .prefix("ptyfleet-rig")
            .tempdir_in(".")
            .unwrap();
        assert!(dir.path().is_relative());
        Self::in_dir(dir, max_workers, stagger)
    }

    fn in_dir(dir: TempDir, max_workers: usize, stagger: Duration) -> Self {
        let layout = WorkspaceLayout::new(dir.path());
        layout.ensure_dirs().unwrap();
        let registry = WorkerRegistry::new();
        let backend = FakeBackend::new();
        let (handle, dispatcher) = Dispatcher::new(layout.clone(), registry.clone());
        let dispatcher = tokio::spawn(dispatcher.run());
        let settings = LaunchSettings {
            program: "agent".to_string(),
            args: vec!["--yes".to_string()],
            env: vec![("TERM".to_string(), "xterm-256color".to_string())],
            cols: 80,
            rows: 30,
            stagger,
            max_workers,
        };
        let launcher = Launcher::new(
            layout.clone(),
            settings,
            Arc::new(backend.clone()),
            registry.clone(),
            handle,
        );
        Self {
            dir,
            layout,
            registry,
            backend,
            launcher,
            dispatcher,
        }
    }

    /// Create instruction files `task1.md..=taskN.md` and return their paths.
    pub fn instructions(&self, count: u32) -> Vec<PathBuf> {
        (1..=count)
            .map(|n| {
                let path = self.dir.path().join(format!("task{n}.md"));
                std::fs::write(&path, format!("# Task {n}\n")).unwrap();
                path
            })
            .collect()
    }

    pub fn write_status(&self, n: u32, message: &str) {
        ptyfleet_core::StatusChannel::for_worker(&self.layout, id(n))
            .append(message)
            .unwrap();
    }

    pub fn status_content(&self, n: u32) -> String {
        std::fs::read_to_string(self.layout.status_path(id(n))).unwrap_or_default()
    }

    /// Wait until the dispatcher has removed `n` from the registry.
    pub async fn wait_removed(&self, n: u32) {
        for _ in 0..400 {
            if !self.registry.contains(id(n)).await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("worker {n} was never removed from the registry");
    }
}

/// Renderer that keeps every frame for inspection.
#[derive(Clone, Default)]
pub(crate) struct RecordingRenderer {
    pub frames: Arc<Mutex<Vec<(FleetSnapshot, Completion)>>>,
}

impl Render for RecordingRenderer {
    fn render(&mut self, snapshot: &FleetSnapshot, completion: &Completion) {
        self.frames
            .lock()
            .unwrap()
            .push((snapshot.clone(), *completion));
    }
}

impl RecordingRenderer {
    pub fn frame_count(&self) -> usize {
        self.frames.lock().unwrap().len()
    }
}
