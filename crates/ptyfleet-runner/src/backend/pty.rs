//! Pseudo-terminal backend built on `portable-pty`.

use std::fmt;
use std::io::{ErrorKind, Read};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use portable_pty::{CommandBuilder, MasterPty, PtySize, native_pty_system};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::{
    BackendError, ExitInfo, ProcessBackend, ProcessControl, ProcessEvent, SpawnRequest,
    SpawnedProcess,
};

/// How long the exit watcher waits for the output reader to drain.
const READER_DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

const READ_BUFFER_SIZE: usize = 8192;

/// Spawns every worker in its own native pseudo-terminal.
#[derive(Debug, Default, Clone, Copy)]
pub struct PtyBackend;

impl PtyBackend {
    pub const fn new() -> Self {
        Self
    }
}

impl ProcessBackend for PtyBackend {
    fn spawn(&self, request: SpawnRequest) -> Result<SpawnedProcess, BackendError> {
        let pair = native_pty_system()
            .openpty(PtySize {
                rows: request.rows,
                cols: request.cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| BackendError::PtyOpen {
                reason: e.to_string(),
            })?;

        let mut cmd = CommandBuilder::new(&request.program);
        cmd.args(&request.args);
        cmd.cwd(&request.cwd);
        for (key, value) in &request.env {
            cmd.env(key, value);
        }

        let spawn_err = |reason: String| BackendError::Spawn {
            program: request.program.clone(),
            reason,
        };

        let mut child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| spawn_err(e.to_string()))?;
        // The reader only sees EOF once every slave handle is closed.
        drop(pair.slave);

        let pid = child.process_id();
        let mut killer = child.clone_killer();

        let reader = match pair.master.try_clone_reader() {
            Ok(reader) => reader,
            Err(e) => {
                let _ = killer.kill();
                return Err(spawn_err(format!("failed to capture terminal output: {e}")));
            }
        };

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (drained_tx, drained_rx) = std::sync::mpsc::channel::<()>();
        let exited = Arc::new(AtomicBool::new(false));
        let id = request.id;

        let output_tx = events_tx.clone();
        let _reader = std::thread::Builder::new()
            .name(format!("worker{id}-output"))
            .spawn(move || {
                pump_output(reader, &output_tx);
                let _ = drained_tx.send(());
                debug!(worker_id = %id, "output reader finished");
            })
            .map_err(|e| {
                let _ = killer.kill();
                spawn_err(format!("failed to start output reader: {e}"))
            })?;

        let wait_exited = Arc::clone(&exited);
        let wait_spawned = std::thread::Builder::new()
            .name(format!("worker{id}-wait"))
            .spawn(move || {
                let exit = match child.wait() {
                    Ok(status) => ExitInfo {
                        exit_code: Some(status.exit_code()),
                        signal: status.signal().map(str::to_string),
                    },
                    Err(e) => {
                        warn!(worker_id = %id, error = %e, "Failed to collect exit status");
                        ExitInfo {
                            exit_code: None,
                            signal: None,
                        }
                    }
                };
                wait_exited.store(true, Ordering::SeqCst);
                // Let trailing output reach the log before the exit reaction closes it.
                let _ = drained_rx.recv_timeout(READER_DRAIN_TIMEOUT);
                let _ = events_tx.send(ProcessEvent::Exited(exit));
            });
        if let Err(e) = wait_spawned {
            let _ = killer.kill();
            return Err(spawn_err(format!("failed to start exit watcher: {e}")));
        }

        let control = PtyControl {
            pid,
            exited,
            _master: Mutex::new(pair.master),
            #[cfg(not(unix))]
            killer: Mutex::new(killer),
        };

        Ok(SpawnedProcess {
            control: Box::new(control),
            events: events_rx,
        })
    }
}

fn pump_output(mut reader: Box<dyn Read + Send>, tx: &mpsc::UnboundedSender<ProcessEvent>) {
    let mut buf = [0u8; READ_BUFFER_SIZE];
    loop {
        match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                if tx.send(ProcessEvent::Output(buf[..n].to_vec())).is_err() {
                    break;
                }
            }
            Err(ref e) if e.kind() == ErrorKind::Interrupted => {}
            Err(ref e) if e.kind() == ErrorKind::WouldBlock => {
                std::thread::sleep(Duration::from_millis(5));
            }
            // EIO once the child side of the terminal is gone
            Err(_) => break,
        }
    }
}

struct PtyControl {
    pid: Option<u32>,
    exited: Arc<AtomicBool>,
    // Keeps the terminal open for the lifetime of the worker.
    _master: Mutex<Box<dyn MasterPty + Send>>,
    #[cfg(not(unix))]
    killer: Mutex<Box<dyn portable_pty::ChildKiller + Send + Sync>>,
}

impl fmt::Debug for PtyControl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PtyControl")
            .field("pid", &self.pid)
            .field("exited", &self.exited.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

impl ProcessControl for PtyControl {
    fn pid(&self) -> Option<u32> {
        self.pid
    }

    fn has_exited(&self) -> bool {
        self.exited.load(Ordering::SeqCst)
    }

    #[cfg(unix)]
    fn terminate(&self) -> std::io::Result<()> {
        let Some(pid) = self.pid else {
            return Err(std::io::Error::new(
                ErrorKind::NotFound,
                "process id unavailable",
            ));
        };
        let pid = libc::pid_t::try_from(pid)
            .map_err(|e| std::io::Error::new(ErrorKind::InvalidInput, e))?;
        // SAFETY: pid comes from the Child we spawned and still own.
        // kill(2) with SIGTERM has no memory-safety implications.
        #[allow(unsafe_code)]
        let ret = unsafe { libc::kill(pid, libc::SIGTERM) };
        if ret == 0 {
            Ok(())
        } else {
            Err(std::io::Error::last_os_error())
        }
    }

    #[cfg(not(unix))]
    fn terminate(&self) -> std::io::Result<()> {
        self.killer
            .lock()
            .map_err(|_| std::io::Error::other("killer lock poisoned"))?
            .kill()
    }
}
