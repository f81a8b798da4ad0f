//! Pid records: one line holding the OS process id of a live worker.

use std::path::Path;

/// Write `pid` to `path`, replacing any previous record.
pub fn write(path: &Path, pid: u32) -> std::io::Result<()> {
    std::fs::write(path, pid.to_string())
}

/// Read a pid record. `Ok(None)` when the record is absent.
pub fn read(path: &Path) -> std::io::Result<Option<u32>> {
    match std::fs::read_to_string(path) {
        Ok(content) => content.trim().parse().map(Some).map_err(|e| {
            std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("invalid pid record {}: {e}", path.display()),
            )
        }),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

/// Remove a pid record. Removing an absent record is not an error.
pub fn remove(path: &Path) -> std::io::Result<()> {
    match std::fs::remove_file(path) {
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn write_read_remove() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("worker1.pid");

        assert_eq!(read(&path).unwrap(), None);
        write(&path, 4242).unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "4242");
        assert_eq!(read(&path).unwrap(), Some(4242));

        remove(&path).unwrap();
        assert!(!path.exists());
        remove(&path).unwrap();
    }

    #[test]
    fn garbage_record_is_invalid_data() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("worker1.pid");
        std::fs::write(&path, "not-a-pid").unwrap();
        let err = read(&path).unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidData);
    }
}
