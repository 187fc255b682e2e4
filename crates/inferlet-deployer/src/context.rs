//! Runtime context
//!
//! Everything a deploy needs to know about the host and the operator's
//! intent, detected and loaded once per invocation and then only read.

use inferlet_core::{
    assert_minimum_cuda, detect_cuda_driver_capability, detect_cuda_toolkit, detect_gpu, CudaVersion,
    DeploymentPaths, GpuProfile, HostProbe, InferletResult, OrchestratorConfig, Settings, ToolkitVersion,
};
use tracing::info;

/// Host facts, settings and paths for one invocation
#[derive(Debug, Clone)]
pub struct RuntimeContext {
    pub gpu: GpuProfile,
    pub toolkit: Option<ToolkitVersion>,
    pub driver: Option<CudaVersion>,
    pub paths: DeploymentPaths,
    pub settings: Settings,
    pub config: OrchestratorConfig,
}

impl RuntimeContext {
    /// Probe the host and assemble the context
    pub fn detect(
        probe: &dyn HostProbe,
        paths: DeploymentPaths,
        settings: Settings,
        config: OrchestratorConfig,
    ) -> Self {
        let gpu = detect_gpu(probe);
        let toolkit = detect_cuda_toolkit(probe, settings.cuda_toolkit_override);
        let driver = detect_cuda_driver_capability(probe);

        info!(
            gpu = %gpu.name,
            arch = %gpu.sm_arch,
            vram_gb = gpu.vram_gb,
            toolkit = ?toolkit.map(|t| t.version.to_string()),
            driver = ?driver.map(|d| d.to_string()),
            root = %paths.root().display(),
            "Runtime context ready"
        );

        Self {
            gpu,
            toolkit,
            driver,
            paths,
            settings,
            config,
        }
    }

    /// Fail unless the toolkit and driver reach the engine's minimum CUDA
    pub fn ensure_cuda(&self) -> InferletResult<()> {
        assert_minimum_cuda(self.settings.engine.min_cuda(), self.toolkit, self.driver)
    }

    /// Base URL the server listens on
    pub fn base_url(&self) -> String {
        format!("http://{}:{}", self.config.health.host, self.settings.server_port)
    }

    /// Equivalent health endpoints, in probe order
    pub fn health_urls(&self) -> Vec<String> {
        let base = self.base_url();
        self.config
            .health
            .paths
            .iter()
            .map(|path| format!("{}{}", base, path))
            .collect()
    }

    /// Interpreter inside the deployment's environment
    pub fn venv_python(&self) -> std::path::PathBuf {
        self.paths.venv_dir().join("bin").join("python")
    }
}
