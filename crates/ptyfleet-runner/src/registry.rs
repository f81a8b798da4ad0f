//! Worker registry: the single source of truth for which workers may
//! still be alive.
//!
//! Mutated from exactly two places: the launcher inserts after a
//! successful spawn, and the exit reaction or the terminator removes.
//! Removing an id that is already gone is a no-op, so the two removal
//! paths may race freely.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use ptyfleet_core::{StatusChannel, WorkerId};
use tokio::sync::RwLock;
use tracing::debug;

use crate::backend::ProcessControl;

/// One supervised process plus its bookkeeping.
#[derive(Debug)]
pub struct Worker {
    id: WorkerId,
    control: Box<dyn ProcessControl>,
    status: StatusChannel,
    started_at: Instant,
}

impl Worker {
    pub fn new(id: WorkerId, control: Box<dyn ProcessControl>, status: StatusChannel) -> Self {
        Self {
            id,
            control,
            status,
            started_at: Instant::now(),
        }
    }

    pub const fn id(&self) -> WorkerId {
        self.id
    }

    pub fn pid(&self) -> Option<u32> {
        self.control.pid()
    }

    pub fn is_running(&self) -> bool {
        !self.control.has_exited()
    }

    pub const fn started_at(&self) -> Instant {
        self.started_at
    }

    pub const fn status(&self) -> &StatusChannel {
        &self.status
    }

    /// Send a graceful termination signal to the process.
    pub fn terminate(&self) -> std::io::Result<()> {
        self.control.terminate()
    }

    fn entry(&self) -> WorkerEntry {
        WorkerEntry {
            id: self.id,
            pid: self.pid(),
            running: self.is_running(),
            started_at: self.started_at,
            status: self.status.clone(),
        }
    }
}

/// Point-in-time copy of a registered worker's bookkeeping.
#[derive(Debug, Clone)]
pub struct WorkerEntry {
    pub id: WorkerId,
    pub pid: Option<u32>,
    pub running: bool,
    pub started_at: Instant,
    pub status: StatusChannel,
}

#[derive(Debug, Default)]
struct RegistryState {
    workers: BTreeMap<WorkerId, Worker>,
    /// Every id ever inserted during this run.
    issued: HashSet<WorkerId>,
}

/// Concurrency-safe map from worker id to [`Worker`].
#[derive(Debug, Clone, Default)]
pub struct WorkerRegistry {
    inner: Arc<RwLock<RegistryState>>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a freshly spawned worker. Ids are never reused within a run;
    /// a worker whose id was already used is handed back.
    pub async fn insert(&self, worker: Worker) -> Result<(), Worker> {
        let mut state = self.inner.write().await;
        let id = worker.id;
        if !state.issued.insert(id) {
            return Err(worker);
        }
        debug!(worker_id = %id, "Registering worker");
        state.workers.insert(id, worker);
        Ok(())
    }

    /// Remove a worker. Returns `None` if it was already removed.
    pub async fn remove(&self, id: WorkerId) -> Option<Worker> {
        let removed = self.inner.write().await.workers.remove(&id);
        if removed.is_some() {
            debug!(worker_id = %id, "Unregistered worker");
        }
        removed
    }

    /// Take every registered worker out, leaving the registry empty.
    pub async fn drain(&self) -> Vec<Worker> {
        let mut state = self.inner.write().await;
        std::mem::take(&mut state.workers).into_values().collect()
    }

    /// Consistent copy of all registered workers, ordered by id.
    pub async fn snapshot(&self) -> Vec<WorkerEntry> {
        self.inner
            .read()
            .await
            .workers
            .values()
            .map(Worker::entry)
            .collect()
    }

    /// Whether `id` has been registered at any point in this run.
    pub async fn was_issued(&self, id: WorkerId) -> bool {
        self.inner.read().await.issued.contains(&id)
    }

    pub async fn ids(&self) -> Vec<WorkerId> {
        self.inner.read().await.workers.keys().copied().collect()
    }

    pub async fn contains(&self, id: WorkerId) -> bool {
        self.inner.read().await.workers.contains_key(&id)
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.workers.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.workers.is_empty()
    }
}

/// Errors from registry mutations.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("Worker id {id} was already used in this run")]
    IdReused { id: WorkerId },
}
