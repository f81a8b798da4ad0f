//! In-memory backend for exercising orchestration without a terminal.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use ptyfleet_core::WorkerId;
use tokio::sync::mpsc;

use super::{
    BackendError, ExitInfo, ProcessBackend, ProcessControl, ProcessEvent, SpawnRequest,
    SpawnedProcess,
};

const FIRST_FAKE_PID: u32 = 40_000;

#[derive(Debug)]
struct FakeProcess {
    pid: u32,
    events: Option<mpsc::UnboundedSender<ProcessEvent>>,
    exited: Arc<AtomicBool>,
    term_signals: Arc<AtomicUsize>,
}

#[derive(Debug, Default)]
struct FakeState {
    next_pid: u32,
    processes: HashMap<WorkerId, FakeProcess>,
    requests: Vec<SpawnRequest>,
    fail_for: HashSet<WorkerId>,
}

/// Records spawn requests and lets tests drive output and exits by hand.
#[derive(Debug, Clone, Default)]
pub(crate) struct FakeBackend {
    state: Arc<Mutex<FakeState>>,
}

#[allow(clippy::unwrap_used)]
impl FakeBackend {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Make the next spawn of `id` fail.
    pub(crate) fn fail_spawn_for(&self, id: WorkerId) {
        self.state.lock().unwrap().fail_for.insert(id);
    }

    pub(crate) fn requests(&self) -> Vec<SpawnRequest> {
        self.state.lock().unwrap().requests.clone()
    }

    pub(crate) fn pid_of(&self, id: WorkerId) -> Option<u32> {
        self.state.lock().unwrap().processes.get(&id).map(|p| p.pid)
    }

    pub(crate) fn emit(&self, id: WorkerId, bytes: &[u8]) {
        let state = self.state.lock().unwrap();
        if let Some(tx) = state.processes.get(&id).and_then(|p| p.events.as_ref()) {
            let _ = tx.send(ProcessEvent::Output(bytes.to_vec()));
        }
    }

    /// Simulate the process ending; closes its event stream.
    pub(crate) fn exit(&self, id: WorkerId, exit_code: u32) {
        let mut state = self.state.lock().unwrap();
        if let Some(process) = state.processes.get_mut(&id) {
            process.exited.store(true, Ordering::SeqCst);
            if let Some(tx) = process.events.take() {
                let _ = tx.send(ProcessEvent::Exited(ExitInfo {
                    exit_code: Some(exit_code),
                    signal: None,
                }));
            }
        }
    }

    /// Number of graceful termination signals `id` has received.
    pub(crate) fn term_signals(&self, id: WorkerId) -> usize {
        self.state
            .lock()
            .unwrap()
            .processes
            .get(&id)
            .map_or(0, |p| p.term_signals.load(Ordering::SeqCst))
    }
}

impl ProcessBackend for FakeBackend {
    #[allow(clippy::unwrap_used)]
    fn spawn(&self, request: SpawnRequest) -> Result<SpawnedProcess, BackendError> {
        let mut state = self.state.lock().unwrap();
        if state.fail_for.remove(&request.id) {
            return Err(BackendError::Spawn {
                program: request.program,
                reason: "injected failure".to_string(),
            });
        }

        let pid = FIRST_FAKE_PID + state.next_pid;
        state.next_pid += 1;

        let (tx, rx) = mpsc::unbounded_channel();
        let exited = Arc::new(AtomicBool::new(false));
        let term_signals = Arc::new(AtomicUsize::new(0));

        state.processes.insert(
            request.id,
            FakeProcess {
                pid,
                events: Some(tx),
                exited: Arc::clone(&exited),
                term_signals: Arc::clone(&term_signals),
            },
        );
        state.requests.push(request);

        Ok(SpawnedProcess {
            control: Box::new(FakeControl {
                pid,
                exited,
                term_signals,
            }),
            events: rx,
        })
    }
}

#[derive(Debug)]
struct FakeControl {
    pid: u32,
    exited: Arc<AtomicBool>,
    term_signals: Arc<AtomicUsize>,
}

impl ProcessControl for FakeControl {
    fn pid(&self) -> Option<u32> {
        Some(self.pid)
    }

    fn has_exited(&self) -> bool {
        self.exited.load(Ordering::SeqCst)
    }

    fn terminate(&self) -> std::io::Result<()> {
        self.term_signals.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
