//! CUDA toolkit and driver capability resolution

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tracing::{info, warn};

use crate::error::{InferletError, InferletResult};
use crate::gpu::HostProbe;

/// A CUDA `major.minor` version
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CudaVersion {
    pub major: u32,
    pub minor: u32,
}

impl CudaVersion {
    pub const fn new(major: u32, minor: u32) -> Self {
        Self { major, minor }
    }

    /// Decode the integer form reported by the driver API (e.g. 12040 -> 12.4)
    pub fn from_driver_int(version: i32) -> Option<Self> {
        if version <= 0 {
            return None;
        }
        let version = version as u32;
        Some(Self::new(version / 1000, (version % 1000) / 10))
    }

    /// Wheel tag suffix for CUDA builds of torch, e.g. `cu130`
    pub fn wheel_tag(&self) -> String {
        format!("cu{}{}", self.major, self.minor)
    }
}

impl fmt::Display for CudaVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

impl FromStr for CudaVersion {
    type Err = InferletError;

    /// Accepts `12.4`, `12.4.131`, `V12.4.131` and `12`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim().trim_start_matches(|c: char| c == 'V' || c == 'v');
        let mut parts = trimmed.split('.');
        let parse = |p: Option<&str>| p.and_then(|v| v.trim().parse::<u32>().ok());
        let major = parse(parts.next())
            .ok_or_else(|| InferletError::Configuration(format!("invalid CUDA version '{}'", s)))?;
        let minor = parse(parts.next()).unwrap_or(0);
        Ok(Self::new(major, minor))
    }
}

/// Where a toolkit version came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolkitSource {
    /// `nvcc --version`
    Compiler,
    /// `CUDA_TOOLKIT_VERSION`
    Override,
    /// nvidia-smi's reported ceiling; really a driver figure
    ManagementCli,
}

impl fmt::Display for ToolkitSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ToolkitSource::Compiler => write!(f, "nvcc"),
            ToolkitSource::Override => write!(f, "override"),
            ToolkitSource::ManagementCli => write!(f, "nvidia-smi"),
        }
    }
}

/// Resolved toolkit version and its provenance
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ToolkitVersion {
    pub version: CudaVersion,
    pub source: ToolkitSource,
}

/// Parse the release line of `nvcc --version`
pub fn parse_nvcc_version(output: &str) -> Option<CudaVersion> {
    output
        .lines()
        .find(|line| line.contains("release"))
        .and_then(|line| line.split("release").nth(1))
        .and_then(|rest| rest.split(',').next())
        .and_then(|v| v.trim().parse().ok())
}

/// Parse the `CUDA Version: X.Y` banner printed by `nvidia-smi`
pub fn parse_smi_cuda_ceiling(output: &str) -> Option<CudaVersion> {
    output
        .split("CUDA Version:")
        .nth(1)
        .and_then(|rest| rest.split_whitespace().next())
        .and_then(|v| v.trim_end_matches('|').parse().ok())
}

/// Resolve the installed CUDA toolkit.
///
/// The compiler is authoritative. An explicit override is used when no compiler is
/// found and only warned about when it disagrees. nvidia-smi reports the driver
/// ceiling rather than the toolkit, so it is only a last resort.
pub fn detect_cuda_toolkit(
    probe: &dyn HostProbe,
    override_version: Option<CudaVersion>,
) -> Option<ToolkitVersion> {
    if let Some(version) = probe.nvcc_version() {
        if let Some(requested) = override_version {
            if requested != version {
                warn!(
                    nvcc = %version,
                    override_version = %requested,
                    "CUDA_TOOLKIT_VERSION disagrees with nvcc; using nvcc"
                );
            }
        }
        return Some(ToolkitVersion {
            version,
            source: ToolkitSource::Compiler,
        });
    }

    if let Some(version) = override_version {
        return Some(ToolkitVersion {
            version,
            source: ToolkitSource::Override,
        });
    }

    let ceiling = probe.smi().and_then(|smi| smi.cuda_ceiling)?;
    warn!(
        version = %ceiling,
        "nvcc not found; using nvidia-smi's CUDA version, which is the driver ceiling and not the installed toolkit"
    );
    Some(ToolkitVersion {
        version: ceiling,
        source: ToolkitSource::ManagementCli,
    })
}

/// Resolve the highest CUDA version the installed driver can run
pub fn detect_cuda_driver_capability(probe: &dyn HostProbe) -> Option<CudaVersion> {
    if let Some(version) = probe.nvml().and_then(|nvml| nvml.driver_cuda) {
        return Some(version);
    }
    let ceiling = probe.smi().and_then(|smi| smi.cuda_ceiling);
    if ceiling.is_none() {
        warn!("Could not determine driver CUDA capability; continuing without a driver check");
    }
    ceiling
}

/// Fail unless both the toolkit and the driver reach `min`
pub fn assert_minimum_cuda(
    min: CudaVersion,
    toolkit: Option<ToolkitVersion>,
    driver: Option<CudaVersion>,
) -> InferletResult<()> {
    let toolkit = toolkit.ok_or_else(|| InferletError::Toolchain {
        found: "none".to_string(),
        required: min.to_string(),
    })?;

    if toolkit.version < min {
        return Err(InferletError::Toolchain {
            found: toolkit.version.to_string(),
            required: min.to_string(),
        });
    }

    match driver {
        Some(driver) if driver < min => {
            return Err(InferletError::DriverCapability {
                found: driver.to_string(),
                required: min.to_string(),
            });
        }
        Some(driver) => {
            info!(
                toolkit = %toolkit.version,
                toolkit_source = %toolkit.source,
                driver = %driver,
                "CUDA toolkit and driver satisfy minimum {}",
                min
            );
        }
        None => {
            warn!(
                toolkit = %toolkit.version,
                toolkit_source = %toolkit.source,
                "Driver CUDA capability unknown; toolkit satisfies minimum {}",
                min
            );
        }
    }

    Ok(())
}
