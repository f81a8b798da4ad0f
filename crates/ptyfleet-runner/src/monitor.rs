//! Polling monitor: snapshots workers, renders, and detects completion.
//!
//! Completion is only observable through the status channels on disk, so
//! the monitor polls on a fixed interval. Each tick returns promptly; once
//! every created channel carries the sentinel the monitor stops for good
//! and runs the terminator.

use std::time::Duration;

use chrono::{DateTime, Local};
use ptyfleet_core::status::NO_STATUS_PLACEHOLDER;
use ptyfleet_core::{StatusChannel, WorkerId, WorkspaceLayout};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::registry::WorkerRegistry;
use crate::render::Render;
use crate::terminator::{TerminationReport, Terminator};

/// Point-in-time view of one registered worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerSnapshot {
    pub id: WorkerId,
    pub pid: Option<u32>,
    pub running: bool,
    pub runtime: Duration,
    pub last_status: String,
}

/// Point-in-time view of the whole registry.
#[derive(Debug, Clone)]
pub struct FleetSnapshot {
    pub taken_at: DateTime<Local>,
    pub workers: Vec<WorkerSnapshot>,
}

impl FleetSnapshot {
    /// Number of workers still registered.
    pub fn active(&self) -> usize {
        self.workers.len()
    }
}

/// Completion accounting over every status channel that exists on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Completion {
    pub completed: usize,
    pub total: usize,
    pub all_completed: bool,
}

impl Completion {
    /// `all_completed` is never true while no channel exists.
    pub const fn new(completed: usize, total: usize) -> Self {
        Self {
            completed,
            total,
            all_completed: completed == total && total > 0,
        }
    }
}

/// Snapshot every registered worker together with its last status line.
pub async fn take_snapshot(registry: &WorkerRegistry) -> FleetSnapshot {
    let entries = registry.snapshot().await;
    let workers = entries
        .into_iter()
        .map(|entry| WorkerSnapshot {
            id: entry.id,
            pid: entry.pid,
            running: entry.running,
            runtime: entry.started_at.elapsed(),
            last_status: read_last_status(&entry.status),
        })
        .collect();
    FleetSnapshot {
        taken_at: Local::now(),
        workers,
    }
}

fn read_last_status(channel: &StatusChannel) -> String {
    match channel.last_status() {
        Ok(Some(line)) => line,
        Ok(None) => NO_STATUS_PLACEHOLDER.to_string(),
        Err(e) => {
            warn!(worker_id = %channel.id(), error = %e, "Failed to read status channel");
            NO_STATUS_PLACEHOLDER.to_string()
        }
    }
}

/// Count channels for ids `1..=max_workers`, registered or not.
pub fn check_completion(layout: &WorkspaceLayout, max_workers: usize) -> Completion {
    let mut completed = 0;
    let mut total = 0;
    for index in 0..max_workers {
        let Some(id) = WorkerId::from_slot(index) else {
            break;
        };
        let channel = StatusChannel::for_worker(layout, id);
        if !channel.exists() {
            continue;
        }
        total += 1;
        match channel.is_complete() {
            Ok(true) => completed += 1,
            Ok(false) => {}
            Err(e) => warn!(worker_id = %id, error = %e, "Failed to read status channel"),
        }
    }
    Completion::new(completed, total)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorState {
    Running,
    Stopped,
}

/// Why the monitor loop ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MonitorExit {
    /// Every channel carries the sentinel; the terminator has already run.
    AllCompleted {
        completion: Completion,
        termination: TerminationReport,
    },
    /// An external shutdown request stopped the loop.
    Shutdown,
}

pub struct Monitor<R> {
    registry: WorkerRegistry,
    layout: WorkspaceLayout,
    max_workers: usize,
    interval: Duration,
    terminator: Terminator,
    renderer: R,
    state: MonitorState,
}

impl<R: Render> Monitor<R> {
    pub const fn new(
        registry: WorkerRegistry,
        layout: WorkspaceLayout,
        max_workers: usize,
        interval: Duration,
        terminator: Terminator,
        renderer: R,
    ) -> Self {
        Self {
            registry,
            layout,
            max_workers,
            interval,
            terminator,
            renderer,
            state: MonitorState::Running,
        }
    }

    pub const fn state(&self) -> MonitorState {
        self.state
    }

    /// One monitoring step. Returns `Some` once the monitor has stopped.
    pub async fn tick(&mut self) -> Option<MonitorExit> {
        if self.state == MonitorState::Stopped {
            return None;
        }

        let snapshot = take_snapshot(&self.registry).await;
        let completion = check_completion(&self.layout, self.max_workers);
        self.renderer.render(&snapshot, &completion);
        debug!(
            active = snapshot.active(),
            completed = completion.completed,
            total = completion.total,
            "Monitor tick"
        );

        if !completion.all_completed {
            return None;
        }

        info!(total = completion.total, "All workers completed");
        self.state = MonitorState::Stopped;
        let termination = self.terminator.terminate().await;
        Some(MonitorExit::AllCompleted {
            completion,
            termination,
        })
    }

    /// Tick every `interval` until completion or until `shutdown` flips.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> MonitorExit {
        info!(interval = ?self.interval, "Starting worker monitoring");
        if *shutdown.borrow() {
            self.state = MonitorState::Stopped;
            return MonitorExit::Shutdown;
        }

        let mut timer = tokio::time::interval(self.interval.max(Duration::from_millis(1)));
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        timer.tick().await; // Skip first immediate tick

        loop {
            tokio::select! {
                _ = timer.tick() => {
                    if let Some(exit) = self.tick().await {
                        return exit;
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Monitor stopping on shutdown request");
                        self.state = MonitorState::Stopped;
                        return MonitorExit::Shutdown;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::backend::{ProcessBackend, SpawnRequest};
    use crate::registry::Worker;
    use crate::test_support::{RecordingRenderer, Rig, id};
    use std::path::PathBuf;

    fn monitor(rig: &Rig, max_workers: usize, renderer: RecordingRenderer) -> Monitor<RecordingRenderer> {
        Monitor::new(
            rig.registry.clone(),
            rig.layout.clone(),
            max_workers,
            Duration::from_millis(20),
            Terminator::new(rig.registry.clone()),
            renderer,
        )
    }

    #[tokio::test]
    async fn completion_is_false_without_channels() {
        let rig = Rig::new(3, Duration::ZERO);
        let completion = check_completion(&rig.layout, 3);
        assert_eq!(completion, Completion::new(0, 0));
        assert!(!completion.all_completed);
    }

    #[tokio::test]
    async fn completion_counts_only_existing_channels() {
        let rig = Rig::new(3, Duration::ZERO);
        rig.write_status(1, "COMPLETED: one");
        rig.write_status(3, "Status: working");

        let completion = check_completion(&rig.layout, 3);
        assert_eq!(completion.total, 2);
        assert_eq!(completion.completed, 1);
        assert!(!completion.all_completed);

        rig.write_status(3, "COMPLETED: three");
        assert!(check_completion(&rig.layout, 3).all_completed);
    }

    #[tokio::test]
    async fn completion_ignores_ids_beyond_max_workers() {
        let rig = Rig::new(1, Duration::ZERO);
        rig.write_status(1, "COMPLETED: one");
        rig.write_status(2, "Status: stray channel");
        assert!(check_completion(&rig.layout, 1).all_completed);
    }

    #[tokio::test]
    async fn exited_worker_still_counts_through_its_channel() {
        let rig = Rig::new(2, Duration::ZERO);
        let instructions = rig.instructions(2);
        rig.launcher.start_all_workers(&instructions).await.unwrap();
        rig.backend.exit(id(1), 1);
        rig.wait_removed(1).await;

        let completion = check_completion(&rig.layout, 2);
        assert_eq!(completion.total, 2);
        assert_eq!(completion.completed, 0);
    }

    #[tokio::test]
    async fn snapshot_uses_placeholder_for_empty_channel() {
        let rig = Rig::new(1, Duration::ZERO);
        let spawned = rig
            .backend
            .spawn(SpawnRequest {
                id: id(1),
                program: "agent".to_string(),
                args: Vec::new(),
                env: Vec::new(),
                cwd: PathBuf::from("."),
                cols: 80,
                rows: 30,
            })
            .unwrap();
        let worker = Worker::new(
            id(1),
            spawned.control,
            StatusChannel::for_worker(&rig.layout, id(1)),
        );
        assert!(rig.registry.insert(worker).await.is_ok());

        let snapshot = take_snapshot(&rig.registry).await;
        assert_eq!(snapshot.active(), 1);
        let worker = &snapshot.workers[0];
        assert!(worker.running);
        assert_eq!(worker.pid, rig.backend.pid_of(id(1)));
        assert_eq!(worker.last_status, NO_STATUS_PLACEHOLDER);
    }

    #[tokio::test]
    async fn tick_renders_latest_status() {
        let rig = Rig::new(1, Duration::ZERO);
        let instructions = rig.instructions(1);
        rig.launcher.start_all_workers(&instructions).await.unwrap();
        rig.write_status(1, "Status: reading files");

        let renderer = RecordingRenderer::default();
        let mut monitor = monitor(&rig, 1, renderer.clone());
        assert!(monitor.tick().await.is_none());
        assert_eq!(monitor.state(), MonitorState::Running);

        let frames = renderer.frames.lock().unwrap();
        let (snapshot, completion) = &frames[0];
        assert!(snapshot.workers[0].last_status.ends_with("[Worker1] Status: reading files"));
        assert_eq!(*completion, Completion::new(0, 1));
    }

    #[tokio::test]
    async fn all_completed_stops_monitor_and_terminates() {
        let rig = Rig::new(3, Duration::from_millis(20));
        let instructions = rig.instructions(3);
        let report = rig.launcher.start_all_workers(&instructions).await.unwrap();
        assert_eq!(report.launched.len(), 3);

        let renderer = RecordingRenderer::default();
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let running = tokio::spawn(monitor(&rig, 3, renderer.clone()).run(shutdown_rx));

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(!running.is_finished());
        for n in 1..=3 {
            rig.write_status(n, &format!("COMPLETED: task {n} done"));
        }

        let exit = tokio::time::timeout(Duration::from_secs(5), running)
            .await
            .expect("monitor should stop")
            .unwrap();
        let (completion, termination) = match exit {
            MonitorExit::AllCompleted {
                completion,
                termination,
            } => (completion, termination),
            other => panic!("expected completion, got {other:?}"),
        };
        assert_eq!(completion, Completion::new(3, 3));
        assert_eq!(termination.signalled, vec![id(1), id(2), id(3)]);
        assert!(rig.registry.is_empty().await);
        for n in 1..=3 {
            assert_eq!(rig.backend.term_signals(id(n)), 1);
        }

        let frames = renderer.frame_count();
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(renderer.frame_count(), frames);
    }

    #[tokio::test]
    async fn stopped_monitor_does_not_tick() {
        let rig = Rig::new(1, Duration::ZERO);
        rig.write_status(1, "COMPLETED: done");

        let renderer = RecordingRenderer::default();
        let mut monitor = monitor(&rig, 1, renderer.clone());
        assert!(matches!(
            monitor.tick().await,
            Some(MonitorExit::AllCompleted { .. })
        ));
        assert_eq!(monitor.state(), MonitorState::Stopped);
        assert!(monitor.tick().await.is_none());
        assert_eq!(renderer.frame_count(), 1);
    }

    #[tokio::test]
    async fn shutdown_request_stops_the_loop() {
        let rig = Rig::new(1, Duration::ZERO);
        let instructions = rig.instructions(1);
        rig.launcher.start_all_workers(&instructions).await.unwrap();

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let running = tokio::spawn(
            monitor(&rig, 1, RecordingRenderer::default()).run(shutdown_rx),
        );
        tokio::time::sleep(Duration::from_millis(30)).await;
        shutdown_tx.send(true).unwrap();

        let exit = tokio::time::timeout(Duration::from_secs(2), running)
            .await
            .expect("monitor should stop")
            .unwrap();
        assert_eq!(exit, MonitorExit::Shutdown);
        // the terminator is the caller's job on shutdown
        assert_eq!(rig.registry.len().await, 1);
    }

    #[test]
    fn completion_requires_at_least_one_channel() {
        assert!(!Completion::new(0, 0).all_completed);
        assert!(Completion::new(2, 2).all_completed);
        assert!(!Completion::new(1, 2).all_completed);
    }
}
