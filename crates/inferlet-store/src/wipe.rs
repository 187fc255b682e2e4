//! Full wipe of cached deployment state

use inferlet_core::{DeploymentPaths, InferletError, InferletResult};
use std::io;
use std::path::PathBuf;
use tracing::{info, warn};

/// What a wipe removed
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WipeReport {
    pub removed: Vec<PathBuf>,
}

/// Deletes engine artifacts and caches under a deployment root
#[derive(Debug, Clone)]
pub struct Wiper {
    paths: DeploymentPaths,
}

impl Wiper {
    pub fn new(paths: DeploymentPaths) -> Self {
        Self { paths }
    }

    /// Remove every engine's compiled artifacts, quantization caches and
    /// installed environment. With `include_models`, downloaded weights go too.
    ///
    /// Every path is attempted. If any removal fails the wipe is reported as
    /// failed; it is never retried.
    pub async fn wipe(&self, include_models: bool) -> InferletResult<WipeReport> {
        let mut targets = self.paths.all_engine_artifacts();
        if include_models {
            targets.push(self.paths.models_dir());
        }

        let mut report = WipeReport::default();
        let mut failures = Vec::new();
        for target in targets {
            match remove_path(&target).await {
                Ok(true) => {
                    info!(path = %target.display(), "Removed");
                    report.removed.push(target);
                }
                Ok(false) => {}
                Err(e) => {
                    warn!(path = %target.display(), error = %e, "Failed to remove");
                    failures.push(format!("{} ({})", target.display(), e));
                }
            }
        }

        if !failures.is_empty() {
            return Err(InferletError::Wipe(failures.join(", ")));
        }
        Ok(report)
    }
}

/// Remove a file or directory tree. `Ok(false)` when it did not exist.
async fn remove_path(path: &std::path::Path) -> io::Result<bool> {
    let metadata = match tokio::fs::symlink_metadata(path).await {
        Ok(metadata) => metadata,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(e),
    };
    if metadata.is_dir() {
        tokio::fs::remove_dir_all(path).await?;
    } else {
        tokio::fs::remove_file(path).await?;
    }
    Ok(true)
}
