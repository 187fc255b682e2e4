//! Detached server process supervision
//!
//! The server runs in its own session so that signals aimed at the invoking
//! terminal (Ctrl-C while following logs, a closed SSH session) never reach it.
//! The PID file is the only record of the process; it is written right after
//! spawn and removed on every stop path.

use async_trait::async_trait;
use inferlet_core::{InferletError, InferletResult};
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::logfile::rotate_if_needed;
use crate::pidfile::{pid_alive, PidFile};
use crate::traits::ManagedProcess;

const POLL_INTERVAL: Duration = Duration::from_millis(200);
/// How long to wait for the kernel to tear down a killed group
const KILL_CONFIRM: Duration = Duration::from_secs(5);

/// What to run
#[derive(Debug, Clone, Default)]
pub struct LaunchSpec {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    /// Working directory, usually the deployment root
    pub cwd: Option<PathBuf>,
}

impl LaunchSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Default::default()
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }
}

/// A started server
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerProcess {
    pub pid: u32,
    /// Session (and process group) id; the server is its session leader
    pub session_id: u32,
    pub pid_file: PathBuf,
    pub log_file: PathBuf,
}

/// Supervises the single server of one deployment root
#[derive(Debug, Clone)]
pub struct ProcessSupervisor {
    pid_file: PidFile,
    log_file: PathBuf,
    log_max_bytes: u64,
    log_keep_bytes: u64,
}

impl ProcessSupervisor {
    pub fn new(pid_file: impl Into<PathBuf>, log_file: impl Into<PathBuf>) -> Self {
        Self {
            pid_file: PidFile::new(pid_file),
            log_file: log_file.into(),
            log_max_bytes: 100 * 1024 * 1024,
            log_keep_bytes: 10 * 1024 * 1024,
        }
    }

    /// Set the rotation ceiling and the tail kept on rotation
    pub fn with_log_limits(mut self, max_bytes: u64, keep_bytes: u64) -> Self {
        self.log_max_bytes = max_bytes;
        self.log_keep_bytes = keep_bytes;
        self
    }

    pub fn pid_file(&self) -> &Path {
        self.pid_file.path()
    }

    pub fn log_file(&self) -> &Path {
        &self.log_file
    }

    /// Fail if a live server holds the PID file; clear a stale one
    pub fn guard_single_instance(&self) -> InferletResult<()> {
        let Some(pid) = self.pid_file.read()? else {
            return Ok(());
        };
        if pid_alive(pid) {
            return Err(InferletError::AlreadyRunning {
                pid,
                pid_file: self.pid_file.path().to_path_buf(),
            });
        }
        info!(pid, "Removing stale PID file");
        self.pid_file.remove()
    }

    fn build_command(&self, spec: &LaunchSpec) -> InferletResult<Command> {
        let log = OpenOptions::new().create(true).append(true).open(&self.log_file)?;
        let log_err = log.try_clone()?;

        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args);
        for (key, value) in &spec.env {
            cmd.env(key, value);
        }
        if let Some(cwd) = &spec.cwd {
            cmd.current_dir(cwd);
        }
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::from(log));
        cmd.stderr(Stdio::from(log_err));

        #[cfg(unix)]
        {
            // SAFETY: setsid is async-signal-safe and touches no parent state
            unsafe {
                cmd.pre_exec(|| {
                    if libc::setsid() == -1 {
                        return Err(std::io::Error::last_os_error());
                    }
                    Ok(())
                });
            }
        }

        Ok(cmd)
    }

    async fn wait_for_exit(pid: u32, limit: Duration) -> bool {
        let deadline = Instant::now() + limit;
        loop {
            if !pid_alive(pid) {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }
}

/// Signal the process group led by `pid`
#[cfg(unix)]
fn signal_group(pid: u32, signal: libc::c_int) {
    let Ok(raw) = libc::pid_t::try_from(pid) else {
        return;
    };
    // SAFETY: plain signal delivery, no memory is shared
    let rc = unsafe { libc::killpg(raw, signal) };
    if rc != 0 {
        debug!(pid, signal, error = %std::io::Error::last_os_error(), "killpg failed");
    }
}

/// Whether `pid` still leads the session `start` created for it. A reused
/// PID belongs to some other session.
#[cfg(unix)]
fn leads_own_session(pid: u32) -> bool {
    let Ok(raw) = libc::pid_t::try_from(pid) else {
        return false;
    };
    // SAFETY: getsid only reads process state
    let sid = unsafe { libc::getsid(raw) };
    sid == raw
}

#[cfg(not(unix))]
fn leads_own_session(_pid: u32) -> bool {
    true
}

#[cfg(unix)]
const SIGTERM: i32 = libc::SIGTERM;
#[cfg(unix)]
const SIGKILL: i32 = libc::SIGKILL;

#[cfg(not(unix))]
const SIGTERM: i32 = 15;
#[cfg(not(unix))]
const SIGKILL: i32 = 9;

#[cfg(not(unix))]
fn signal_group(pid: u32, _signal: i32) {
    warn!(pid, "Process signalling is not supported on this platform");
}

#[async_trait]
impl ManagedProcess for ProcessSupervisor {
    async fn start(&self, spec: &LaunchSpec) -> InferletResult<ServerProcess> {
        self.guard_single_instance()?;
        rotate_if_needed(&self.log_file, self.log_max_bytes, self.log_keep_bytes)?;

        info!(program = %spec.program, args = ?spec.args, log = %self.log_file.display(), "Starting server");
        let mut cmd = self.build_command(spec)?;
        let child = cmd.spawn().map_err(|e| {
            error!(program = %spec.program, error = %e, "Failed to spawn server");
            InferletError::Process(format!("failed to spawn {}: {}", spec.program, e))
        })?;
        let pid = child
            .id()
            .ok_or_else(|| InferletError::Process("server exited before its PID was read".to_string()))?;

        self.pid_file.write(pid)?;
        // detached: the child is reaped through the liveness checks
        drop(child);

        info!(pid, "Server started");
        Ok(ServerProcess {
            pid,
            session_id: pid,
            pid_file: self.pid_file.path().to_path_buf(),
            log_file: self.log_file.clone(),
        })
    }

    async fn stop(&self, grace: Duration) -> InferletResult<bool> {
        let Some(pid) = self.pid_file.read()? else {
            debug!("No PID file, nothing to stop");
            return Ok(false);
        };
        if !pid_alive(pid) {
            info!(pid, "Server already exited, clearing PID file");
            self.pid_file.remove()?;
            return Ok(false);
        }
        if !leads_own_session(pid) {
            warn!(pid, "PID belongs to a process outside the server's session, clearing stale PID file");
            self.pid_file.remove()?;
            return Ok(false);
        }

        info!(pid, grace_secs = grace.as_secs(), "Stopping server");
        signal_group(pid, SIGTERM);
        if !Self::wait_for_exit(pid, grace).await {
            warn!(pid, "Server ignored SIGTERM, killing");
            signal_group(pid, SIGKILL);
            if !Self::wait_for_exit(pid, KILL_CONFIRM).await {
                warn!(pid, "Could not confirm server exit, removing PID file anyway");
            }
        }

        self.pid_file.remove()?;
        info!(pid, "Server stopped");
        Ok(true)
    }

    fn is_alive(&self) -> InferletResult<Option<u32>> {
        self.pid_file.live_pid()
    }

    fn name(&self) -> &'static str {
        "process"
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::fs;

    fn supervisor(dir: &Path) -> ProcessSupervisor {
        ProcessSupervisor::new(dir.join("server.pid"), dir.join("server.log"))
    }

    #[tokio::test]
    async fn test_start_writes_pid_and_stop_clears_it() {
        let dir = tempfile::tempdir().unwrap();
        let supervisor = supervisor(dir.path());

        let process = supervisor.start(&LaunchSpec::new("sleep").arg("30")).await.unwrap();
        assert_eq!(process.session_id, process.pid);
        assert_eq!(fs::read_to_string(supervisor.pid_file()).unwrap().trim(), process.pid.to_string());
        assert_eq!(supervisor.is_alive().unwrap(), Some(process.pid));

        assert!(supervisor.stop(Duration::from_secs(5)).await.unwrap());
        assert!(!supervisor.pid_file().exists());
        assert!(!pid_alive(process.pid));
        assert_eq!(supervisor.is_alive().unwrap(), None);
    }

    #[tokio::test]
    async fn test_stop_leaves_reused_pid_alone() {
        let dir = tempfile::tempdir().unwrap();
        let supervisor = supervisor(dir.path());

        // a live process that never called setsid stands in for a reused PID
        let mut stranger = std::process::Command::new("sleep").arg("30").spawn().unwrap();
        fs::write(supervisor.pid_file(), stranger.id().to_string()).unwrap();

        assert!(!supervisor.stop(Duration::from_secs(1)).await.unwrap());
        assert!(!supervisor.pid_file().exists());
        assert!(pid_alive(stranger.id()));

        stranger.kill().unwrap();
        stranger.wait().unwrap();
    }

    #[tokio::test]
    async fn test_live_pid_blocks_second_start() {
        let dir = tempfile::tempdir().unwrap();
        let supervisor = supervisor(dir.path());
        supervisor.start(&LaunchSpec::new("sleep").arg("30")).await.unwrap();

        let err = supervisor.start(&LaunchSpec::new("sleep").arg("30")).await.unwrap_err();
        assert!(matches!(err, InferletError::AlreadyRunning { .. }));

        supervisor.stop(Duration::from_secs(5)).await.unwrap();
    }

    #[tokio::test]
    async fn test_stale_pid_is_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let supervisor = supervisor(dir.path());

        let mut exited = std::process::Command::new("true").spawn().unwrap();
        let stale = exited.id();
        exited.wait().unwrap();
        PidFile::new(supervisor.pid_file()).write(stale).unwrap();

        let process = supervisor.start(&LaunchSpec::new("sleep").arg("30")).await.unwrap();
        assert_ne!(process.pid, stale);
        assert_eq!(PidFile::new(supervisor.pid_file()).read().unwrap(), Some(process.pid));

        supervisor.stop(Duration::from_secs(5)).await.unwrap();
    }

    #[tokio::test]
    async fn test_stubborn_server_is_killed() {
        let dir = tempfile::tempdir().unwrap();
        let supervisor = supervisor(dir.path());
        let spec = LaunchSpec::new("sh").arg("-c").arg("trap '' TERM; sleep 30");

        let process = supervisor.start(&spec).await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(supervisor.stop(Duration::from_millis(400)).await.unwrap());
        assert!(!pid_alive(process.pid));
        assert!(!supervisor.pid_file().exists());
    }

    #[tokio::test]
    async fn test_output_goes_to_log() {
        let dir = tempfile::tempdir().unwrap();
        let supervisor = supervisor(dir.path());
        let spec = LaunchSpec::new("sh")
            .arg("-c")
            .arg("echo out-$MARKER; echo err >&2")
            .env("MARKER", "42");

        supervisor.start(&spec).await.unwrap();
        for _ in 0..50 {
            if supervisor.is_alive().unwrap().is_none() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        let log = fs::read_to_string(supervisor.log_file()).unwrap();
        assert!(log.contains("out-42"));
        assert!(log.contains("err"));
        assert!(!supervisor.stop(Duration::from_secs(1)).await.unwrap());
    }

    #[tokio::test]
    async fn test_stop_without_pid_file() {
        let dir = tempfile::tempdir().unwrap();
        assert!(!supervisor(dir.path()).stop(Duration::from_secs(1)).await.unwrap());
    }
}
