//! Status channel protocol.
//!
//! Each worker owns one append-only text file. Every line has the shape
//!
//! ```text
//! [<YYYY-MM-DD HH:MM:SS>] [Worker<id>] <message>
//! ```
//!
//! Lines are written by the supervised agent itself (it is told the exact
//! command form at launch) and by the runner, which only ever appends the
//! initial `Initializing` line and a synthetic `TERMINATED:` line on
//! abnormal exit.
//!
//! Readers only trust content up to the last newline: a line the agent is
//! still writing is ignored until its terminator lands. Sentinel detection
//! is therefore best-effort and not linearizable with the writer.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};

use crate::layout::{WorkerId, WorkspaceLayout};

/// Marker whose presence anywhere in a channel marks the worker complete.
pub const COMPLETION_SENTINEL: &str = "COMPLETED:";

/// Prefix of the synthetic line appended when a worker exits without the sentinel.
pub const TERMINATED_PREFIX: &str = "TERMINATED:";

/// Shown by readers when a channel has no committed line yet.
pub const NO_STATUS_PLACEHOLDER: &str = "No status yet";

/// First line the runner writes for every launched worker.
pub const INITIALIZING_MESSAGE: &str = "Initializing worker process";

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Handle to one worker's status channel. Cheap to clone; holds no file open.
#[derive(Debug, Clone)]
pub struct StatusChannel {
    id: WorkerId,
    path: PathBuf,
}

impl StatusChannel {
    pub fn new(id: WorkerId, path: impl Into<PathBuf>) -> Self {
        Self {
            id,
            path: path.into(),
        }
    }

    pub fn for_worker(layout: &WorkspaceLayout, id: WorkerId) -> Self {
        Self::new(id, layout.status_path(id))
    }

    pub const fn id(&self) -> WorkerId {
        self.id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether the channel has been created on disk.
    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Append one timestamped line. Creates the channel on first write.
    pub fn append(&self, message: &str) -> std::io::Result<()> {
        self.append_at(Utc::now(), message)
    }

    pub fn append_at(&self, at: DateTime<Utc>, message: &str) -> std::io::Result<()> {
        let line = format_line(self.id, at, message);
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        // single write so the line lands in one O_APPEND chunk
        file.write_all(line.as_bytes())
    }

    /// Whole channel content, `None` if the channel does not exist yet.
    pub fn read(&self) -> std::io::Result<Option<String>> {
        match std::fs::read(&self.path) {
            Ok(bytes) => Ok(Some(String::from_utf8_lossy(&bytes).into_owned())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Last committed non-empty line, or `None` when there is none.
    pub fn last_status(&self) -> std::io::Result<Option<String>> {
        Ok(self
            .read()?
            .and_then(|content| last_status_line(&content).map(str::to_string)))
    }

    /// Whether the sentinel appears in any committed line.
    pub fn is_complete(&self) -> std::io::Result<bool> {
        Ok(self
            .read()?
            .is_some_and(|content| contains_sentinel(&content)))
    }
}

/// Render one protocol line, including the trailing newline.
pub fn format_line(id: WorkerId, at: DateTime<Utc>, message: &str) -> String {
    format!("[{}] [Worker{id}] {message}\n", at.format(TIMESTAMP_FORMAT))
}

/// Portion of `content` that ends with a newline.
pub fn committed(content: &str) -> &str {
    content.rfind('\n').map_or("", |end| &content[..=end])
}

/// Last non-empty committed line, trimmed.
pub fn last_status_line(content: &str) -> Option<&str> {
    committed(content)
        .lines()
        .map(str::trim)
        .rfind(|line| !line.is_empty())
}

pub fn contains_sentinel(content: &str) -> bool {
    committed(content).contains(COMPLETION_SENTINEL)
}

/// Synthetic message for a worker that exited without the sentinel.
pub fn terminated_message(exit_code: Option<u32>, signal: Option<&str>) -> String {
    let code = exit_code.map_or_else(|| "unknown".to_string(), |c| c.to_string());
    match signal {
        Some(signal) => {
            format!("{TERMINATED_PREFIX} Process exited with code {code}, signal {signal}")
        }
        None => format!("{TERMINATED_PREFIX} Process exited with code {code}"),
    }
}

/// Shell command form the agent is told to use for status updates.
pub fn append_command_hint(id: WorkerId, path: &Path) -> String {
    format!(
        "echo \"[$(date -u '+{TIMESTAMP_FORMAT}')] [Worker{id}] Status: <message>\" >> {}",
        path.display()
    )
}
