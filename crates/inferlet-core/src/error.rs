//! Error types for inferlet

use std::path::PathBuf;
use thiserror::Error;

/// Main error type for inferlet
#[derive(Error, Debug)]
pub enum InferletError {
    /// Missing or invalid settings, raised before any side effect
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Installed CUDA toolkit is older than the engine requires
    #[error("CUDA toolkit {found} is below the required minimum {required}")]
    Toolchain { found: String, required: String },

    /// Driver cannot run the required CUDA version even though the toolkit can
    #[error("GPU driver supports CUDA up to {found}, but {required} is required")]
    DriverCapability { found: String, required: String },

    /// A live server already holds the PID file
    #[error("Server already running with PID {pid} ({})", pid_file.display())]
    AlreadyRunning { pid: u32, pid_file: PathBuf },

    /// A package install step failed
    #[error("Failed to install {package}: {reason}")]
    DependencyInstall { package: String, reason: String },

    /// Server never answered its health endpoints
    #[error("Server did not become healthy within {timeout_secs}s (probed {urls})")]
    HealthCheckTimeout { timeout_secs: u64, urls: String },

    /// A warmup or benchmark phase failed; the deployment stays up
    #[error("Warmup phase failed: {0}")]
    WarmupPhaseFailure(String),

    /// Removing cached artifacts failed part-way through
    #[error("Full wipe incomplete: {0}")]
    Wipe(String),

    /// Spawning or signalling the server process failed
    #[error("Process error: {0}")]
    Process(String),

    /// The deployment was cancelled before health was confirmed
    #[error("Interrupted: {0}")]
    Interrupted(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Result type for inferlet operations
pub type InferletResult<T> = Result<T, InferletError>;

impl InferletError {
    /// Concrete next step shown to the operator next to the message
    pub fn hint(&self) -> &'static str {
        match self {
            InferletError::Configuration(_) => {
                "set the missing keys in the environment or the deployment root's .env file"
            }
            InferletError::Toolchain { .. } => {
                "upgrade the CUDA toolkit (nvcc) or set CUDA_TOOLKIT_VERSION if nvcc is not on PATH"
            }
            InferletError::DriverCapability { .. } => {
                "upgrade the NVIDIA driver; the toolkit is new enough but the driver cannot run it"
            }
            InferletError::AlreadyRunning { .. } => {
                "run `inferlet stop` first, or `inferlet restart` to redeploy in place"
            }
            InferletError::DependencyInstall { .. } => {
                "check network access and the package index, then rerun deploy (partial installs are kept)"
            }
            InferletError::HealthCheckTimeout { .. } => {
                "inspect server.log in the deployment root; the half-started server was stopped"
            }
            InferletError::WarmupPhaseFailure(_) => {
                "inspect logs/warmup.log; the server is still running"
            }
            InferletError::Wipe(_) => {
                "remove the listed paths by hand, then rerun deploy; cached state is not trusted"
            }
            InferletError::Process(_) => "check the server command and permissions on the deployment root",
            InferletError::Interrupted(_) => {
                "rerun deploy; the snapshot was not updated and the server may still be running"
            }
            InferletError::Io(_) => "check permissions and free space in the deployment root",
            InferletError::Serialization(_) => "fix or delete the offending file and retry",
        }
    }

    /// Process exit code for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            InferletError::Configuration(_) => 2,
            _ => 1,
        }
    }

    /// Whether this error must abort the deployment
    pub fn is_fatal(&self) -> bool {
        !matches!(self, InferletError::WarmupPhaseFailure(_))
    }
}

impl From<serde_json::Error> for InferletError {
    fn from(err: serde_json::Error) -> Self {
        InferletError::Serialization(err.to_string())
    }
}

impl From<toml::de::Error> for InferletError {
    fn from(err: toml::de::Error) -> Self {
        InferletError::Configuration(err.to_string())
    }
}

impl From<dotenvy::Error> for InferletError {
    fn from(err: dotenvy::Error) -> Self {
        match err {
            dotenvy::Error::Io(io) => InferletError::Io(io),
            other => InferletError::Serialization(other.to_string()),
        }
    }
}
