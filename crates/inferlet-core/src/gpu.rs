//! GPU detection and architecture classification

use serde::{Deserialize, Serialize};
use std::fmt;
use std::process::Command;
use std::str::FromStr;
use tracing::{debug, warn};

use crate::cuda::{parse_nvcc_version, parse_smi_cuda_ceiling, CudaVersion};
use crate::error::InferletError;

/// SM (compute capability) architecture, e.g. `sm90` for 9.0
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SmArch(pub u32);

impl SmArch {
    /// Used when neither a capability query nor the device name identifies the GPU
    pub const FALLBACK: SmArch = SmArch(80);

    pub fn from_compute_capability(major: u32, minor: u32) -> Self {
        SmArch(major * 10 + minor)
    }

    pub fn family(&self) -> GpuFamily {
        match self.0 {
            70..=72 => GpuFamily::Volta,
            75 => GpuFamily::Turing,
            80..=87 => GpuFamily::Ampere,
            89 => GpuFamily::Ada,
            90 => GpuFamily::Hopper,
            100..=129 => GpuFamily::Blackwell,
            _ => GpuFamily::Unknown,
        }
    }

    /// FP8 tensor cores arrived with Ada (sm89)
    pub fn supports_fp8(&self) -> bool {
        self.0 >= 89
    }
}

impl fmt::Display for SmArch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sm{}", self.0)
    }
}

impl FromStr for SmArch {
    type Err = InferletError;

    /// Accepts `sm90`, `sm_90`, `90` and `9.0`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim().to_ascii_lowercase();
        let digits = trimmed.trim_start_matches("sm").trim_start_matches('_');
        if let Some((major, minor)) = digits.split_once('.') {
            if let (Ok(major), Ok(minor)) = (major.parse(), minor.parse()) {
                return Ok(SmArch::from_compute_capability(major, minor));
            }
        }
        digits
            .parse()
            .map(SmArch)
            .map_err(|_| InferletError::Serialization(format!("invalid SM architecture '{}'", s)))
    }
}

/// GPU generation, used to scale defaults
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GpuFamily {
    Volta,
    Turing,
    Ampere,
    Ada,
    Hopper,
    Blackwell,
    Unknown,
}

impl fmt::Display for GpuFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GpuFamily::Volta => write!(f, "Volta"),
            GpuFamily::Turing => write!(f, "Turing"),
            GpuFamily::Ampere => write!(f, "Ampere"),
            GpuFamily::Ada => write!(f, "Ada"),
            GpuFamily::Hopper => write!(f, "Hopper"),
            GpuFamily::Blackwell => write!(f, "Blackwell"),
            GpuFamily::Unknown => write!(f, "Unknown"),
        }
    }
}

/// Detected GPU, fixed for the whole invocation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GpuProfile {
    /// Device name
    pub name: String,
    /// Compute capability
    pub sm_arch: SmArch,
    /// Total memory in GiB
    pub vram_gb: u32,
    /// Whether FP8 weights and KV cache are usable
    pub supports_fp8: bool,
}

impl GpuProfile {
    pub fn new(name: impl Into<String>, sm_arch: SmArch, vram_gb: u32) -> Self {
        Self {
            name: name.into(),
            sm_arch,
            vram_gb,
            supports_fp8: sm_arch.supports_fp8(),
        }
    }

    pub fn family(&self) -> GpuFamily {
        self.sm_arch.family()
    }
}

/// What NVML reported for device 0
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NvmlReading {
    pub name: Option<String>,
    pub compute_capability: Option<(u32, u32)>,
    pub memory_total_bytes: Option<u64>,
    /// CUDA version ceiling of the loaded driver
    pub driver_cuda: Option<CudaVersion>,
}

/// What `nvidia-smi` reported for device 0
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SmiReading {
    pub name: Option<String>,
    pub compute_capability: Option<(u32, u32)>,
    pub memory_total_mib: Option<u64>,
    /// `CUDA Version:` from the banner; a driver figure
    pub cuda_ceiling: Option<CudaVersion>,
}

/// Host queries the detector is built on
pub trait HostProbe: Send + Sync {
    /// Runtime-binding query through NVML
    fn nvml(&self) -> Option<NvmlReading>;

    /// Management CLI query
    fn smi(&self) -> Option<SmiReading>;

    /// Toolkit compiler version
    fn nvcc_version(&self) -> Option<CudaVersion>;
}

/// Probe backed by NVML, `nvidia-smi` and `nvcc` on the local host
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemProbe;

impl HostProbe for SystemProbe {
    fn nvml(&self) -> Option<NvmlReading> {
        let nvml = match nvml_wrapper::Nvml::init() {
            Ok(nvml) => nvml,
            Err(e) => {
                debug!(error = %e, "NVML unavailable");
                return None;
            }
        };

        let mut reading = NvmlReading {
            driver_cuda: nvml
                .sys_cuda_driver_version()
                .ok()
                .and_then(CudaVersion::from_driver_int),
            ..Default::default()
        };

        match nvml.device_by_index(0) {
            Ok(device) => {
                reading.name = device.name().ok();
                reading.compute_capability = device
                    .cuda_compute_capability()
                    .ok()
                    .map(|cc| (cc.major as u32, cc.minor as u32));
                reading.memory_total_bytes = device.memory_info().ok().map(|m| m.total);
            }
            Err(e) => debug!(error = %e, "NVML found no device 0"),
        }

        Some(reading)
    }

    fn smi(&self) -> Option<SmiReading> {
        let query = run_stdout(
            "nvidia-smi",
            &[
                "--query-gpu=name,memory.total,compute_cap",
                "--format=csv,noheader,nounits",
            ],
        );
        let banner = run_stdout("nvidia-smi", &[]);
        if query.is_none() && banner.is_none() {
            return None;
        }

        let mut reading = query
            .as_deref()
            .and_then(|out| out.lines().next())
            .map(parse_smi_query_line)
            .unwrap_or_default();
        reading.cuda_ceiling = banner.as_deref().and_then(parse_smi_cuda_ceiling);
        Some(reading)
    }

    fn nvcc_version(&self) -> Option<CudaVersion> {
        run_stdout("nvcc", &["--version"]).and_then(|out| parse_nvcc_version(&out))
    }
}

fn run_stdout(program: &str, args: &[&str]) -> Option<String> {
    let output = Command::new(program).args(args).output().ok()?;
    if !output.status.success() {
        debug!(program, status = %output.status, "Probe command failed");
        return None;
    }
    String::from_utf8(output.stdout).ok()
}

/// Parse one `name, memory.total, compute_cap` CSV row
pub fn parse_smi_query_line(line: &str) -> SmiReading {
    let mut fields = line.split(',').map(str::trim);
    let name = fields.next().filter(|s| !s.is_empty()).map(str::to_string);
    let memory_total_mib = fields.next().and_then(|s| s.parse().ok());
    let compute_capability = fields.next().and_then(|s| {
        let (major, minor) = s.split_once('.')?;
        Some((major.parse().ok()?, minor.parse().ok()?))
    });
    SmiReading {
        name,
        compute_capability,
        memory_total_mib,
        cuda_ceiling: None,
    }
}

/// Map a marketing name to an SM architecture
pub fn sm_arch_from_name(name: &str) -> Option<SmArch> {
    let name = name.to_ascii_lowercase();
    let has = |needle: &str| name.contains(needle);

    if has("b200") || has("b100") || has("gb200") {
        Some(SmArch(100))
    } else if has("rtx 50") || has("rtx pro 6000 blackwell") {
        // consumer and workstation Blackwell
        Some(SmArch(120))
    } else if has("h100") || has("h200") || has("h800") || has("gh200") || has("hopper") {
        Some(SmArch(90))
    } else if has("l40") || has(" l4") || has("ada") || has("rtx 40") {
        Some(SmArch(89))
    } else if has("a100") || has("a800") || has("a10") || has("a30") || has("a40") || has("a6000")
        || has("rtx 30")
        || has("ampere")
    {
        Some(SmArch(80))
    } else if has("t4") || has("turing") || has("rtx 20") {
        Some(SmArch(75))
    } else if has("v100") || has("volta") {
        Some(SmArch(70))
    } else {
        None
    }
}

/// Detect the GPU the deployment will run on.
///
/// Architecture precedence: NVML compute capability, then nvidia-smi's
/// compute_cap column, then name matching, then [`SmArch::FALLBACK`].
pub fn detect_gpu(probe: &dyn HostProbe) -> GpuProfile {
    let nvml = probe.nvml().unwrap_or_default();
    let smi = probe.smi().unwrap_or_default();

    let name = nvml
        .name
        .clone()
        .or_else(|| smi.name.clone())
        .unwrap_or_else(|| "unknown GPU".to_string());

    let sm_arch = if let Some((major, minor)) = nvml.compute_capability.or(smi.compute_capability)
    {
        SmArch::from_compute_capability(major, minor)
    } else if let Some(arch) = sm_arch_from_name(&name) {
        debug!(gpu = %name, arch = %arch, "SM architecture inferred from device name");
        arch
    } else {
        warn!(
            gpu = %name,
            fallback = %SmArch::FALLBACK,
            "Could not determine SM architecture; assuming a modern default"
        );
        SmArch::FALLBACK
    };

    let vram_gb = nvml
        .memory_total_bytes
        .map(|bytes| (bytes / (1024 * 1024 * 1024)) as u32)
        .or_else(|| smi.memory_total_mib.map(|mib| (mib / 1024) as u32))
        .unwrap_or(0);

    let profile = GpuProfile::new(name, sm_arch, vram_gb);
    debug!(
        gpu = %profile.name,
        arch = %profile.sm_arch,
        vram_gb = profile.vram_gb,
        fp8 = profile.supports_fp8,
        "Detected GPU"
    );
    profile
}
