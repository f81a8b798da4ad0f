//! Rendering of monitor snapshots.

use std::io::{self, Stdout, Write};

use crossterm::cursor::MoveTo;
use crossterm::queue;
use crossterm::style::Stylize;
use crossterm::terminal::{Clear, ClearType};
use tracing::warn;

use crate::monitor::{Completion, FleetSnapshot};

/// Sink for computed monitor state.
pub trait Render: Send {
    fn render(&mut self, snapshot: &FleetSnapshot, completion: &Completion);
}

/// Redraws a plain-text dashboard on every tick.
pub struct ConsoleRenderer<W> {
    out: W,
    clear_screen: bool,
}

impl ConsoleRenderer<Stdout> {
    pub fn stdout() -> Self {
        Self::new(io::stdout(), true)
    }
}

impl<W: Write + Send> ConsoleRenderer<W> {
    pub const fn new(out: W, clear_screen: bool) -> Self {
        Self { out, clear_screen }
    }

    pub fn into_inner(self) -> W {
        self.out
    }

    fn write_frame(&mut self, snapshot: &FleetSnapshot, completion: &Completion) -> io::Result<()> {
        if self.clear_screen {
            queue!(self.out, Clear(ClearType::All), MoveTo(0, 0))?;
        }
        let out = &mut self.out;
        writeln!(out, "=== PARALLEL AGENT WORKER MONITOR ===")?;
        writeln!(out, "Time: {}", snapshot.taken_at.format("%Y-%m-%d %H:%M:%S"))?;
        writeln!(out)?;
        writeln!(out, "Active Workers: {}", snapshot.active())?;
        writeln!(out)?;

        for worker in &snapshot.workers {
            let marker = if worker.running {
                "RUNNING".green()
            } else {
                "EXITED".red()
            };
            let pid = worker
                .pid
                .map_or_else(|| "-".to_string(), |pid| pid.to_string());
            writeln!(
                out,
                "[{marker}] Worker {} (PID: {pid}, Runtime: {}s)",
                worker.id,
                worker.runtime.as_secs()
            )?;
            writeln!(out, "   Status: {}", worker.last_status)?;
            writeln!(out)?;
        }

        writeln!(
            out,
            "Progress: {}/{} workers completed",
            completion.completed, completion.total
        )?;
        if completion.all_completed {
            writeln!(out, "All workers completed!")?;
        }
        out.flush()
    }
}

impl<W: Write + Send> Render for ConsoleRenderer<W> {
    fn render(&mut self, snapshot: &FleetSnapshot, completion: &Completion) {
        if let Err(e) = self.write_frame(snapshot, completion) {
            warn!(error = %e, "Failed to render monitor frame");
        }
    }
}
