//! PID files and liveness

use inferlet_core::InferletResult;
use inferlet_store::write_atomic;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// A file holding one process id
#[derive(Debug, Clone)]
pub struct PidFile {
    path: PathBuf,
}

impl PidFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Stored PID. A missing or unreadable file counts as no PID.
    pub fn read(&self) -> InferletResult<Option<u32>> {
        let contents = match fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        match contents.trim().parse::<u32>() {
            Ok(pid) if pid > 0 => Ok(Some(pid)),
            _ => {
                warn!(path = %self.path.display(), contents = contents.trim(), "Ignoring malformed PID file");
                Ok(None)
            }
        }
    }

    pub fn write(&self, pid: u32) -> InferletResult<()> {
        write_atomic(&self.path, format!("{}\n", pid).as_bytes())?;
        debug!(path = %self.path.display(), pid, "Wrote PID file");
        Ok(())
    }

    pub fn remove(&self) -> InferletResult<()> {
        match fs::remove_file(&self.path) {
            Ok(()) => {
                debug!(path = %self.path.display(), "Removed PID file");
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Stored PID if that process is still alive
    pub fn live_pid(&self) -> InferletResult<Option<u32>> {
        Ok(self.read()?.filter(|pid| pid_alive(*pid)))
    }
}

/// Whether `pid` names a running (non-zombie) process
#[cfg(unix)]
pub fn pid_alive(pid: u32) -> bool {
    let Ok(raw) = libc::pid_t::try_from(pid) else {
        return false;
    };
    if raw <= 0 {
        return false;
    }

    // Reap our own exited children so they do not linger as zombies
    // SAFETY: WNOHANG never blocks and a null status pointer is permitted
    unsafe {
        libc::waitpid(raw, std::ptr::null_mut(), libc::WNOHANG);
    }

    // SAFETY: signal 0 performs only the existence and permission check
    let rc = unsafe { libc::kill(raw, 0) };
    if rc != 0 {
        // EPERM: exists but owned by someone else
        return io::Error::last_os_error().raw_os_error() == Some(libc::EPERM);
    }
    !is_zombie(pid)
}

#[cfg(not(unix))]
pub fn pid_alive(_pid: u32) -> bool {
    false
}

/// Zombies still answer `kill(pid, 0)`
#[cfg(unix)]
fn is_zombie(pid: u32) -> bool {
    let Ok(stat) = fs::read_to_string(format!("/proc/{}/stat", pid)) else {
        return false;
    };
    // the state field follows the parenthesised command name
    stat.rsplit_once(')')
        .and_then(|(_, rest)| rest.trim_start().chars().next())
        .map_or(false, |state| state == 'Z')
}
