//! Single-instance warmup lock

use inferlet_core::InferletResult;
use inferlet_runtime::{pid_alive, PidFile};
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

/// Lock file naming the process running a warmup sweep
#[derive(Debug, Clone)]
pub struct WarmupLock {
    path: PathBuf,
}

/// Held lock; removed on drop
#[derive(Debug)]
pub struct WarmupLockGuard {
    path: PathBuf,
    pid: u32,
}

impl WarmupLock {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// PID recorded in the lock if that process is alive
    pub fn holder(&self) -> InferletResult<Option<u32>> {
        PidFile::new(&self.path).live_pid()
    }

    /// Take the lock for `pid`.
    ///
    /// Returns `Ok(None)` when a live process already holds it. A lock left by
    /// a dead process is replaced. The file appears with its content in place,
    /// so readers never observe an empty lock.
    pub fn acquire(&self, pid: u32) -> InferletResult<Option<WarmupLockGuard>> {
        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        fs::create_dir_all(dir)?;

        for _ in 0..2 {
            let mut tmp = NamedTempFile::new_in(dir)?;
            writeln!(tmp, "{}", pid)?;
            tmp.as_file().sync_all()?;

            match tmp.persist_noclobber(&self.path) {
                Ok(_) => {
                    debug!(path = %self.path.display(), pid, "Acquired warmup lock");
                    return Ok(Some(WarmupLockGuard {
                        path: self.path.clone(),
                        pid,
                    }));
                }
                Err(e) if e.error.kind() == io::ErrorKind::AlreadyExists => {
                    if let Some(holder) = self.holder()? {
                        info!(holder, "Warmup already running, skipping");
                        return Ok(None);
                    }
                    warn!(path = %self.path.display(), "Removing stale warmup lock");
                    match fs::remove_file(&self.path) {
                        Ok(()) => {}
                        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                        Err(e) => return Err(e.into()),
                    }
                }
                Err(e) => return Err(e.error.into()),
            }
        }

        // lost the race to another process twice
        Ok(None)
    }
}

impl Drop for WarmupLockGuard {
    fn drop(&mut self) {
        // only remove a lock that still names us
        let ours = PidFile::new(&self.path).read().ok().flatten() == Some(self.pid);
        if ours {
            if let Err(e) = fs::remove_file(&self.path) {
                warn!(path = %self.path.display(), error = %e, "Failed to release warmup lock");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acquire_and_release() {
        let dir = tempfile::tempdir().unwrap();
        let lock = WarmupLock::new(dir.path().join(".run").join("warmup.lock"));

        let guard = lock.acquire(std::process::id()).unwrap().unwrap();
        assert_eq!(
            fs::read_to_string(lock.path()).unwrap().trim(),
            std::process::id().to_string()
        );
        drop(guard);
        assert!(!lock.path().exists());
    }

    #[cfg(unix)]
    #[test]
    fn test_live_holder_blocks() {
        let dir = tempfile::tempdir().unwrap();
        let lock = WarmupLock::new(dir.path().join("warmup.lock"));

        let _guard = lock.acquire(std::process::id()).unwrap().unwrap();
        assert!(lock.acquire(std::process::id()).unwrap().is_none());
        assert_eq!(lock.holder().unwrap(), Some(std::process::id()));
    }

    #[cfg(unix)]
    #[test]
    fn test_stale_lock_is_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let lock = WarmupLock::new(dir.path().join("warmup.lock"));

        let mut exited = std::process::Command::new("true").spawn().unwrap();
        let stale = exited.id();
        exited.wait().unwrap();
        fs::write(lock.path(), format!("{}\n", stale)).unwrap();

        let guard = lock.acquire(std::process::id()).unwrap();
        assert!(guard.is_some());
        assert_eq!(lock.holder().unwrap(), Some(std::process::id()));
    }

    #[test]
    fn test_guard_leaves_foreign_lock() {
        let dir = tempfile::tempdir().unwrap();
        let lock = WarmupLock::new(dir.path().join("warmup.lock"));

        let guard = lock.acquire(12345).unwrap().unwrap();
        fs::write(lock.path(), "67890\n").unwrap();
        drop(guard);
        assert!(lock.path().exists());
    }
}
