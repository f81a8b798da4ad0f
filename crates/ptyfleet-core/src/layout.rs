//! On-disk layout of a run, relative to the working directory.
//!
//! ```text
//! <root>/logs/worker<id>.log          raw output capture
//! <root>/comm/worker<id>_status.txt   status channel
//! <root>/comm/worker<id>.pid          pid record
//! ```

use std::fmt;
use std::path::{Path, PathBuf};

/// Identity of one worker within a run. Always positive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WorkerId(u32);

impl WorkerId {
    /// Returns `None` for zero.
    pub const fn new(id: u32) -> Option<Self> {
        if id == 0 { None } else { Some(Self(id)) }
    }

    /// Id for the zero-based slot `index` of the instruction list.
    pub fn from_slot(index: usize) -> Option<Self> {
        u32::try_from(index)
            .ok()
            .and_then(|i| i.checked_add(1))
            .map(Self)
    }

    pub const fn get(self) -> u32 {
        self.0
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Resolved directories for a run.
#[derive(Debug, Clone)]
pub struct WorkspaceLayout {
    root: PathBuf,
    log_dir: PathBuf,
    comm_dir: PathBuf,
}

impl WorkspaceLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            log_dir: root.join("logs"),
            comm_dir: root.join("comm"),
            root,
        }
    }

    /// Create `logs/` and `comm/` if they do not exist yet.
    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.log_dir)?;
        std::fs::create_dir_all(&self.comm_dir)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn log_dir(&self) -> &Path {
        &self.log_dir
    }

    pub fn comm_dir(&self) -> &Path {
        &self.comm_dir
    }

    pub fn log_path(&self, id: WorkerId) -> PathBuf {
        self.log_dir.join(format!("worker{id}.log"))
    }

    pub fn status_path(&self, id: WorkerId) -> PathBuf {
        self.comm_dir.join(format!("worker{id}_status.txt"))
    }

    pub fn pid_path(&self, id: WorkerId) -> PathBuf {
        self.comm_dir.join(format!("worker{id}.pid"))
    }
}
