//! Attention kernel selection

use inferlet_core::{AttentionBackend, Engine, SmArch};
use std::path::PathBuf;
use std::process::{Command, Stdio};
use tracing::{debug, warn};

/// Answers whether an optional kernel package is importable
pub trait KernelProbe: Send + Sync {
    fn is_installed(&self, package: &str) -> bool;
}

/// Checks packages with `importlib` inside the deployment's interpreter
#[derive(Debug, Clone)]
pub struct PythonKernelProbe {
    python: PathBuf,
}

impl PythonKernelProbe {
    pub fn new(python: impl Into<PathBuf>) -> Self {
        Self {
            python: python.into(),
        }
    }
}

/// Module name a distribution installs
fn import_name(package: &str) -> String {
    match package {
        "flashinfer-python" => "flashinfer".to_string(),
        other => other.replace('-', "_"),
    }
}

impl KernelProbe for PythonKernelProbe {
    fn is_installed(&self, package: &str) -> bool {
        let script = format!(
            "import importlib.util, sys; sys.exit(0 if importlib.util.find_spec('{}') else 1)",
            import_name(package)
        );
        let present = Command::new(&self.python)
            .arg("-c")
            .arg(script)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map(|status| status.success())
            .unwrap_or(false);
        debug!(package, present, "Probed kernel package");
        present
    }
}

/// Pick the attention kernel for `engine` on `sm_arch`.
///
/// TensorRT-LLM always uses its own plugin. vLLM takes the first preferred
/// kernel the probe finds and otherwise falls back to PyTorch SDPA.
pub fn choose_attention(engine: Engine, sm_arch: SmArch, probe: &dyn KernelProbe) -> AttentionBackend {
    if engine == Engine::Trt {
        return AttentionBackend::TrtLlm;
    }

    let preferred: &[AttentionBackend] = if sm_arch.0 >= 80 {
        &[AttentionBackend::FlashInfer, AttentionBackend::FlashAttn]
    } else {
        &[AttentionBackend::XFormers]
    };

    for backend in preferred {
        if let Some(package) = backend.package() {
            if probe.is_installed(package) {
                return *backend;
            }
        }
    }

    warn!(
        arch = %sm_arch,
        preferred = %preferred[0],
        "No optimized attention kernel found, falling back to TORCH_SDPA"
    );
    AttentionBackend::TorchSdpa
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::HashSet;

    /// Probe answering from a fixed package list
    pub(crate) struct Installed(pub HashSet<&'static str>);

    impl Installed {
        pub fn none() -> Self {
            Installed(HashSet::new())
        }

        pub fn of(packages: &[&'static str]) -> Self {
            Installed(packages.iter().copied().collect())
        }
    }

    impl KernelProbe for Installed {
        fn is_installed(&self, package: &str) -> bool {
            self.0.contains(package)
        }
    }

    #[test]
    fn test_trt_ignores_probe() {
        assert_eq!(
            choose_attention(Engine::Trt, SmArch(90), &Installed::none()),
            AttentionBackend::TrtLlm
        );
    }

    #[test]
    fn test_vllm_prefers_flashinfer() {
        let probe = Installed::of(&["flashinfer-python", "flash-attn"]);
        assert_eq!(
            choose_attention(Engine::Vllm, SmArch(90), &probe),
            AttentionBackend::FlashInfer
        );
        let probe = Installed::of(&["flash-attn"]);
        assert_eq!(
            choose_attention(Engine::Vllm, SmArch(80), &probe),
            AttentionBackend::FlashAttn
        );
    }

    #[test]
    fn test_older_gpus_use_xformers() {
        let probe = Installed::of(&["flashinfer-python", "xformers"]);
        assert_eq!(
            choose_attention(Engine::Vllm, SmArch(75), &probe),
            AttentionBackend::XFormers
        );
    }

    #[test]
    fn test_fallback_when_nothing_is_installed() {
        assert_eq!(
            choose_attention(Engine::Vllm, SmArch(90), &Installed::none()),
            AttentionBackend::TorchSdpa
        );
    }

    #[test]
    fn test_import_name() {
        assert_eq!(import_name("flashinfer-python"), "flashinfer");
        assert_eq!(import_name("flash-attn"), "flash_attn");
    }
}
