//! Quantization backend resolution
//!
//! Maps deploy mode, chat model id, requested level and GPU to a concrete
//! [`QuantizationPlan`]. Resolution never fails: unknown hardware gets
//! conservative defaults and a warning.

use inferlet_core::{
    classify_model_name, DeployMode, Engine, GpuProfile, KvCacheDtype, PrequantFormat,
    QuantBackend, QuantMode, QuantRequest, QuantizationPlan,
};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::attention::{choose_attention, KernelProbe};
use crate::limits::batch_limits;

/// Weight backend before GPU capability is applied
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Choice {
    Backend(QuantBackend),
    /// 8-bit, FP8 or INT8 depending on the GPU
    EightBit,
}

fn four_bit_backend(hint: Option<PrequantFormat>) -> QuantBackend {
    match hint {
        Some(PrequantFormat::Gptq) => QuantBackend::GptqMarlin,
        Some(PrequantFormat::Awq) | None => QuantBackend::Awq,
    }
}

/// Resolves quantization plans for one engine
pub struct QuantResolver {
    engine: Engine,
    /// Concurrent-connection capacity, bounds batch sizes
    capacity: u32,
    kernels: Arc<dyn KernelProbe>,
}

impl QuantResolver {
    pub fn new(engine: Engine, capacity: u32, kernels: Arc<dyn KernelProbe>) -> Self {
        Self {
            engine,
            capacity,
            kernels,
        }
    }

    /// Resolve the plan for a deployment.
    ///
    /// `pinned` is a backend carried over from an earlier resolution or set
    /// explicitly; it is kept unless the model id names pre-quantized weights.
    pub fn resolve(
        &self,
        deploy_mode: DeployMode,
        chat_model: Option<&str>,
        requested: QuantRequest,
        gpu: &GpuProfile,
        pinned: Option<QuantBackend>,
    ) -> QuantizationPlan {
        let traits = chat_model.map(classify_model_name).unwrap_or_default();

        let kv_cache_dtype = if gpu.supports_fp8 {
            KvCacheDtype::Fp8
        } else {
            KvCacheDtype::Int8
        };
        let attention_backend = choose_attention(self.engine, gpu.sm_arch, self.kernels.as_ref());
        let batch_limits = batch_limits(deploy_mode, gpu, self.capacity, traits.moe);

        if deploy_mode == DeployMode::Tool {
            debug!("Tool-only deployment, chat quantization skipped");
            return QuantizationPlan {
                mode: QuantMode::ToolOnly,
                backend: QuantBackend::None,
                kv_cache_dtype,
                attention_backend,
                batch_limits,
            };
        }

        let mut choice = match pinned {
            Some(backend) if backend != QuantBackend::None => {
                debug!(backend = %backend, "Keeping pinned quantization backend");
                Choice::Backend(backend)
            }
            _ => match requested {
                QuantRequest::FourBit => Choice::Backend(four_bit_backend(traits.format_hint())),
                QuantRequest::EightBit => Choice::EightBit,
                QuantRequest::Auto => match traits.format_hint() {
                    Some(hint) => Choice::Backend(four_bit_backend(Some(hint))),
                    None => Choice::EightBit,
                },
            },
        };

        if let Some(format) = traits.prequant {
            let forced = Choice::Backend(four_bit_backend(Some(format)));
            if choice != forced {
                warn!(
                    model = chat_model.unwrap_or_default(),
                    requested = %requested,
                    forced = %four_bit_backend(Some(format)),
                    "Model is already quantized and cannot be re-quantized, overriding backend"
                );
            }
            choice = forced;
        }

        let backend = match choice {
            Choice::EightBit if gpu.supports_fp8 => QuantBackend::Fp8,
            Choice::EightBit => QuantBackend::Int8SmoothQuant,
            Choice::Backend(backend) if backend.requires_fp8() && !gpu.supports_fp8 => {
                warn!(
                    gpu = %gpu.name,
                    arch = %gpu.sm_arch,
                    "FP8 backend is not supported on this GPU, using INT8"
                );
                QuantBackend::Int8SmoothQuant
            }
            Choice::Backend(backend) => backend,
        };

        let plan = QuantizationPlan {
            mode: backend.mode(),
            backend,
            kv_cache_dtype,
            attention_backend,
            batch_limits,
        };
        info!(
            mode = %plan.mode,
            backend = %plan.backend,
            kv_cache = %plan.kv_cache_dtype,
            attention = %plan.attention_backend,
            "Resolved quantization plan"
        );
        plan
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attention::tests::Installed;
    use inferlet_core::{AttentionBackend, SmArch};

    fn resolver(engine: Engine) -> QuantResolver {
        QuantResolver::new(engine, 64, Arc::new(Installed::of(&["flashinfer-python"])))
    }

    fn h100() -> GpuProfile {
        GpuProfile::new("NVIDIA H100", SmArch(90), 80)
    }

    fn a100() -> GpuProfile {
        GpuProfile::new("NVIDIA A100", SmArch(80), 80)
    }

    #[test]
    fn test_prequantized_name_overrides_auto() {
        let plan = resolver(Engine::Trt).resolve(
            DeployMode::Both,
            Some("org/model-AWQ-4bit"),
            QuantRequest::Auto,
            &h100(),
            None,
        );
        assert_eq!(plan.backend, QuantBackend::Awq);
        assert_eq!(plan.mode, QuantMode::FourBit);
    }

    #[test]
    fn test_prequantized_name_overrides_pin_and_request() {
        let plan = resolver(Engine::Vllm).resolve(
            DeployMode::Chat,
            Some("TheBloke/Llama-2-7B-GPTQ"),
            QuantRequest::EightBit,
            &h100(),
            Some(QuantBackend::Fp8),
        );
        assert_eq!(plan.backend, QuantBackend::GptqMarlin);
    }

    #[test]
    fn test_eight_bit_on_non_fp8_gpu_is_int8() {
        let plan = resolver(Engine::Trt).resolve(
            DeployMode::Both,
            Some("org/model"),
            QuantRequest::EightBit,
            &a100(),
            None,
        );
        assert_eq!(plan.backend, QuantBackend::Int8SmoothQuant);
        assert!(!plan.backend.requires_fp8());
        assert_eq!(plan.kv_cache_dtype, KvCacheDtype::Int8);
    }

    #[test]
    fn test_eight_bit_on_fp8_gpu() {
        let plan = resolver(Engine::Trt).resolve(
            DeployMode::Chat,
            Some("org/model"),
            QuantRequest::EightBit,
            &h100(),
            None,
        );
        assert_eq!(plan.backend, QuantBackend::Fp8);
        assert_eq!(plan.kv_cache_dtype, KvCacheDtype::Fp8);
    }

    #[test]
    fn test_auto_without_hint_is_eight_bit() {
        let plan = resolver(Engine::Vllm).resolve(
            DeployMode::Chat,
            Some("meta-llama/Llama-3.1-8B-Instruct"),
            QuantRequest::Auto,
            &h100(),
            None,
        );
        assert_eq!(plan.mode, QuantMode::EightBit);
        assert_eq!(plan.attention_backend, AttentionBackend::FlashInfer);
    }

    #[test]
    fn test_four_bit_follows_hint() {
        let r = resolver(Engine::Vllm);
        let gptq = r.resolve(DeployMode::Chat, Some("org/model-w4a16"), QuantRequest::FourBit, &h100(), None);
        assert_eq!(gptq.backend, QuantBackend::GptqMarlin);
        let plain = r.resolve(DeployMode::Chat, Some("org/model"), QuantRequest::FourBit, &h100(), None);
        assert_eq!(plain.backend, QuantBackend::Awq);
    }

    #[test]
    fn test_pin_is_kept() {
        let plan = resolver(Engine::Trt).resolve(
            DeployMode::Both,
            Some("org/model"),
            QuantRequest::Auto,
            &h100(),
            Some(QuantBackend::Awq),
        );
        assert_eq!(plan.backend, QuantBackend::Awq);
    }

    #[test]
    fn test_fp8_pin_never_lands_on_non_fp8_gpu() {
        let plan = resolver(Engine::Trt).resolve(
            DeployMode::Both,
            Some("org/model"),
            QuantRequest::Auto,
            &a100(),
            Some(QuantBackend::Fp8),
        );
        assert_eq!(plan.backend, QuantBackend::Int8SmoothQuant);
    }

    #[test]
    fn test_tool_mode_short_circuits() {
        let plan = resolver(Engine::Trt).resolve(
            DeployMode::Tool,
            Some("org/model-AWQ"),
            QuantRequest::FourBit,
            &h100(),
            Some(QuantBackend::Fp8),
        );
        assert_eq!(plan.mode, QuantMode::ToolOnly);
        assert_eq!(plan.backend, QuantBackend::None);
    }

    #[test]
    fn test_unknown_gpu_still_resolves() {
        let gpu = GpuProfile::new("Mystery", SmArch(61), 16);
        let plan = resolver(Engine::Vllm).resolve(DeployMode::Both, Some("org/model"), QuantRequest::Auto, &gpu, None);
        assert_eq!(plan.backend, QuantBackend::Int8SmoothQuant);
        assert_eq!(plan.attention_backend, AttentionBackend::TorchSdpa);
    }
}
