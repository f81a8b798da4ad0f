//! Coordinated shutdown of every live worker.

use ptyfleet_core::WorkerId;
use tracing::{debug, info, warn};

use crate::registry::WorkerRegistry;

/// What one [`Terminator::terminate`] call did.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TerminationReport {
    /// Workers that were sent a termination signal.
    pub signalled: Vec<WorkerId>,
    /// Workers whose process had already exited; not signalled.
    pub already_exited: Vec<WorkerId>,
    /// Workers whose signal could not be delivered.
    pub failed: Vec<WorkerId>,
}

impl TerminationReport {
    pub fn is_empty(&self) -> bool {
        self.signalled.is_empty() && self.already_exited.is_empty() && self.failed.is_empty()
    }
}

/// Idempotent "terminate everything" routine.
///
/// The registry is drained in one step, so a second call (or a call racing
/// with an exit reaction) sees only what is left and never signals a worker
/// twice.
#[derive(Debug, Clone)]
pub struct Terminator {
    registry: WorkerRegistry,
}

impl Terminator {
    pub const fn new(registry: WorkerRegistry) -> Self {
        Self { registry }
    }

    pub async fn terminate(&self) -> TerminationReport {
        let workers = self.registry.drain().await;
        let mut report = TerminationReport::default();
        if workers.is_empty() {
            debug!("No workers left to terminate");
            return report;
        }

        info!(count = workers.len(), "Terminating all workers");
        for worker in workers {
            let id = worker.id();
            if !worker.is_running() {
                report.already_exited.push(id);
                continue;
            }
            match worker.terminate() {
                Ok(()) => {
                    info!(worker_id = %id, pid = ?worker.pid(), "Terminated worker");
                    report.signalled.push(id);
                }
                Err(e) => {
                    warn!(worker_id = %id, pid = ?worker.pid(), error = %e, "Failed to signal worker");
                    report.failed.push(id);
                }
            }
        }
        info!(
            signalled = report.signalled.len(),
            failed = report.failed.len(),
            "All workers terminated"
        );
        report
    }
}
