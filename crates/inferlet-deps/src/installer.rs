//! Package installation
//!
//! [`Installer`] executes an [`InstallPlan`] through a [`PackageManager`]. Only
//! network failures are retried; everything else aborts the deployment with the
//! partial installs left in place.

use async_trait::async_trait;
use inferlet_core::{retry, InferletError, InferletResult, RetryPolicy};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::manifest::Requirement;
use crate::resolver::{check, plan, DependencySpec, InstallPlan};

/// Failure of a single package-manager step
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct InstallStepError {
    pub message: String,
    /// Transient network failure that may succeed on retry
    pub network: bool,
}

impl InstallStepError {
    pub fn network(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            network: true,
        }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            network: false,
        }
    }
}

/// Options shared by every install call of one plan
#[derive(Debug, Clone, Default)]
pub struct InstallOptions {
    pub force_reinstall: bool,
    pub extra_index_url: Option<String>,
}

/// Package manager operations the installer relies on
#[async_trait]
pub trait PackageManager: Send + Sync {
    /// Make sure the target environment exists
    async fn prepare(&self) -> InferletResult<()> {
        Ok(())
    }

    /// Installed version of `name`, `None` when absent
    async fn installed_version(&self, name: &str) -> InferletResult<Option<String>>;

    /// Remove packages
    async fn uninstall(&self, names: &[String]) -> Result<(), InstallStepError>;

    /// Install `name==version`
    async fn install(&self, requirement: &str, options: &InstallOptions) -> Result<(), InstallStepError>;
}

/// What an applied plan did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstallReport {
    pub installed: Vec<String>,
    pub uninstalled: Vec<String>,
    pub skipped: usize,
}

/// Drives a package manager to the required state
pub struct Installer {
    manager: Arc<dyn PackageManager>,
    retry: RetryPolicy,
}

impl Installer {
    pub fn new(manager: Arc<dyn PackageManager>, retry: RetryPolicy) -> Self {
        Self { manager, retry }
    }

    /// Check every requirement against the environment
    pub async fn resolve(&self, requirements: &[Requirement]) -> InferletResult<Vec<DependencySpec>> {
        self.manager.prepare().await?;

        let mut specs = Vec::with_capacity(requirements.len());
        for requirement in requirements {
            let installed = self.manager.installed_version(&requirement.name).await?;
            let spec = check(&requirement.name, &requirement.version, |_| installed);
            debug!(
                package = %spec.name,
                required = %spec.required_version,
                installed = ?spec.installed_version,
                status = %spec.status,
                "Checked dependency"
            );
            specs.push(spec);
        }
        Ok(specs)
    }

    /// Execute `plan`
    pub async fn apply(
        &self,
        plan: &InstallPlan,
        extra_index_url: Option<String>,
        total: usize,
    ) -> InferletResult<InstallReport> {
        let mut report = InstallReport {
            skipped: total.saturating_sub(plan.install.len()),
            ..Default::default()
        };

        if plan.is_empty() {
            info!("All dependencies satisfied, nothing to install");
            return Ok(report);
        }

        if !plan.uninstall_first.is_empty() {
            let names: Vec<String> = plan.uninstall_first.iter().map(|s| s.name.clone()).collect();
            info!(packages = ?names, "Removing mismatched versions");
            self.manager
                .uninstall(&names)
                .await
                .map_err(|e| InferletError::DependencyInstall {
                    package: names.join(", "),
                    reason: e.message,
                })?;
            report.uninstalled = names;
        }

        let options = InstallOptions {
            force_reinstall: plan.force,
            extra_index_url,
        };

        let manager = &self.manager;
        let options = &options;
        for spec in &plan.install {
            let requirement = spec.requirement();
            let name = requirement.as_str();
            info!(package = %requirement, "Installing");
            retry(
                &self.retry,
                |e: &InstallStepError| e.network,
                move |_| manager.install(name, options),
            )
            .await
            .map_err(|e| InferletError::DependencyInstall {
                package: requirement.clone(),
                reason: e.message,
            })?;
            report.installed.push(requirement);
        }

        info!(
            installed = report.installed.len(),
            skipped = report.skipped,
            "Dependencies installed"
        );
        Ok(report)
    }

    /// Resolve, plan and apply in one pass
    pub async fn ensure(
        &self,
        requirements: &[Requirement],
        force: bool,
        extra_index_url: Option<String>,
    ) -> InferletResult<InstallReport> {
        let specs = self.resolve(requirements).await?;
        let plan = plan(&specs, force);
        self.apply(&plan, extra_index_url, specs.len()).await
    }
}

/// Markers pip prints when the index could not be reached
const NETWORK_MARKERS: &[&str] = &[
    "connectionerror",
    "connection reset",
    "connection refused",
    "read timed out",
    "readtimeouterror",
    "newconnectionerror",
    "temporary failure in name resolution",
    "name or service not known",
    "max retries exceeded",
    "remotedisconnected",
    "http error 5",
    "503 service unavailable",
];

/// Whether pip's stderr describes a transient network failure
pub fn is_network_failure(stderr: &str) -> bool {
    let lower = stderr.to_ascii_lowercase();
    NETWORK_MARKERS.iter().any(|m| lower.contains(m))
}

/// Extract the version from `pip show` output
pub fn parse_pip_show(output: &str) -> Option<String> {
    output
        .lines()
        .find_map(|line| line.strip_prefix("Version:"))
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// pip inside a virtual environment under the deployment root
pub struct PipPackageManager {
    python: String,
    venv: PathBuf,
}

impl PipPackageManager {
    /// `python` creates the venv at `venv` when it is missing
    pub fn new(python: impl Into<String>, venv: impl Into<PathBuf>) -> Self {
        Self {
            python: python.into(),
            venv: venv.into(),
        }
    }

    pub fn venv(&self) -> &Path {
        &self.venv
    }

    fn venv_python(&self) -> PathBuf {
        self.venv.join("bin").join("python")
    }

    fn pip(&self) -> Command {
        let mut cmd = Command::new(self.venv_python());
        cmd.arg("-m").arg("pip").arg("--disable-pip-version-check");
        cmd.stdin(Stdio::null());
        cmd
    }

    async fn run(mut cmd: Command) -> Result<(), InstallStepError> {
        let output = cmd
            .output()
            .await
            .map_err(|e| InstallStepError::fatal(format!("failed to run pip: {}", e)))?;
        if output.status.success() {
            return Ok(());
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        let lines: Vec<&str> = stderr.lines().collect();
        let tail = lines[lines.len().saturating_sub(5)..].join("\n");
        let message = format!("pip exited with {}: {}", output.status, tail.trim());
        if is_network_failure(&stderr) {
            Err(InstallStepError::network(message))
        } else {
            Err(InstallStepError::fatal(message))
        }
    }
}

#[async_trait]
impl PackageManager for PipPackageManager {
    async fn prepare(&self) -> InferletResult<()> {
        if self.venv_python().exists() {
            return Ok(());
        }

        info!(venv = %self.venv.display(), "Creating virtual environment");
        let status = Command::new(&self.python)
            .arg("-m")
            .arg("venv")
            .arg(&self.venv)
            .stdin(Stdio::null())
            .status()
            .await?;
        if !status.success() {
            return Err(InferletError::DependencyInstall {
                package: "venv".to_string(),
                reason: format!("{} -m venv exited with {}", self.python, status),
            });
        }
        Ok(())
    }

    async fn installed_version(&self, name: &str) -> InferletResult<Option<String>> {
        let output = self.pip().arg("show").arg(name).output().await?;
        if !output.status.success() {
            // pip show exits non-zero for packages that are not installed
            return Ok(None);
        }
        Ok(parse_pip_show(&String::from_utf8_lossy(&output.stdout)))
    }

    async fn uninstall(&self, names: &[String]) -> Result<(), InstallStepError> {
        let mut cmd = self.pip();
        cmd.arg("uninstall").arg("-y").args(names);
        Self::run(cmd).await
    }

    async fn install(&self, requirement: &str, options: &InstallOptions) -> Result<(), InstallStepError> {
        let mut cmd = self.pip();
        cmd.arg("install").arg(requirement);
        if options.force_reinstall {
            cmd.arg("--force-reinstall");
        }
        if let Some(url) = &options.extra_index_url {
            cmd.arg("--extra-index-url").arg(url);
        }
        debug!(requirement, "Running pip install");
        let result = Self::run(cmd).await;
        if let Err(e) = &result {
            warn!(requirement, network = e.network, error = %e, "pip install failed");
        }
        result
    }
}
