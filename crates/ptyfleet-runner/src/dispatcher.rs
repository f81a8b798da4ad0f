//! Single task that consumes every worker's process events.
//!
//! The launcher hands over a worker's event receiver only after the worker
//! is registered, so an exit is never processed for an unregistered worker.
//! Output chunks are appended verbatim to the worker's log; the exit event
//! runs the exit reaction exactly once per worker.

use std::collections::HashMap;

use ptyfleet_core::status::{self, StatusChannel};
use ptyfleet_core::{WorkerId, WorkspaceLayout, pid_record};
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio_stream::StreamExt;
use tokio_stream::StreamMap;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, info, warn};

use crate::backend::{ExitInfo, ProcessEvent};
use crate::registry::WorkerRegistry;

/// A registered worker's log sink and event stream.
#[derive(Debug)]
pub struct Attach {
    pub id: WorkerId,
    pub log: File,
    pub events: mpsc::UnboundedReceiver<ProcessEvent>,
}

/// Sending half used by the launcher.
#[derive(Debug, Clone)]
pub struct DispatchHandle {
    tx: mpsc::UnboundedSender<Attach>,
}

impl DispatchHandle {
    pub fn attach(&self, attach: Attach) -> Result<(), DispatchClosed> {
        self.tx.send(attach).map_err(|_| DispatchClosed)
    }
}

/// The dispatcher task is no longer running.
#[derive(Debug, thiserror::Error)]
#[error("Event dispatcher has stopped")]
pub struct DispatchClosed;

/// Consumes process events for all workers.
pub struct Dispatcher {
    layout: WorkspaceLayout,
    registry: WorkerRegistry,
    attach_rx: mpsc::UnboundedReceiver<Attach>,
    logs: HashMap<WorkerId, File>,
    streams: StreamMap<WorkerId, UnboundedReceiverStream<ProcessEvent>>,
}

impl Dispatcher {
    pub fn new(layout: WorkspaceLayout, registry: WorkerRegistry) -> (DispatchHandle, Self) {
        let (tx, attach_rx) = mpsc::unbounded_channel();
        let dispatcher = Self {
            layout,
            registry,
            attach_rx,
            logs: HashMap::new(),
            streams: StreamMap::new(),
        };
        (DispatchHandle { tx }, dispatcher)
    }

    /// Run until every handle is dropped and every worker stream has ended.
    pub async fn run(mut self) {
        let mut accepting = true;
        loop {
            tokio::select! {
                attach = self.attach_rx.recv(), if accepting => match attach {
                    Some(attach) => self.on_attach(attach),
                    None => accepting = false,
                },
                Some((id, event)) = self.streams.next(), if !self.streams.is_empty() => {
                    self.on_event(id, event).await;
                }
                else => break,
            }
        }
        debug!("Event dispatcher finished");
    }

    fn on_attach(&mut self, attach: Attach) {
        debug!(worker_id = %attach.id, "Attaching worker event stream");
        self.logs.insert(attach.id, attach.log);
        self.streams
            .insert(attach.id, UnboundedReceiverStream::new(attach.events));
    }

    async fn on_event(&mut self, id: WorkerId, event: ProcessEvent) {
        match event {
            ProcessEvent::Output(bytes) => {
                let Some(log) = self.logs.get_mut(&id) else {
                    debug!(worker_id = %id, len = bytes.len(), "Dropping output after log close");
                    return;
                };
                if let Err(e) = log.write_all(&bytes).await {
                    warn!(worker_id = %id, error = %e, "Failed to write worker log");
                }
            }
            ProcessEvent::Exited(exit) => self.on_exit(id, &exit).await,
        }
    }

    async fn on_exit(&mut self, id: WorkerId, exit: &ExitInfo) {
        info!(
            worker_id = %id,
            exit_code = ?exit.exit_code,
            signal = ?exit.signal,
            "Worker exited"
        );

        let channel = StatusChannel::for_worker(&self.layout, id);
        let completed = channel.is_complete().unwrap_or_else(|e| {
            warn!(worker_id = %id, error = %e, "Failed to read status channel");
            false
        });
        if !completed {
            let message = status::terminated_message(exit.exit_code, exit.signal.as_deref());
            if let Err(e) = channel.append(&message) {
                warn!(worker_id = %id, error = %e, "Failed to record terminal status");
            }
        }

        if let Err(e) = pid_record::remove(&self.layout.pid_path(id)) {
            warn!(worker_id = %id, error = %e, "Failed to remove pid record");
        }

        if let Some(mut log) = self.logs.remove(&id) {
            if let Err(e) = log.flush().await {
                warn!(worker_id = %id, error = %e, "Failed to flush worker log");
            }
        }

        self.registry.remove(id).await;
    }
}
