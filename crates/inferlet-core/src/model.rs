//! Deployment, engine and quantization type definitions

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::InferletError;
use crate::gpu::SmArch;

/// Which engines a deployment serves
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeployMode {
    /// Chat engine only
    Chat,
    /// Tool-classification engine only
    Tool,
    /// Chat and tool engines sharing one GPU
    Both,
}

impl DeployMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeployMode::Chat => "chat",
            DeployMode::Tool => "tool",
            DeployMode::Both => "both",
        }
    }

    /// Whether this mode runs a chat engine
    pub fn has_chat(&self) -> bool {
        matches!(self, DeployMode::Chat | DeployMode::Both)
    }

    /// Whether this mode runs a tool engine
    pub fn has_tool(&self) -> bool {
        matches!(self, DeployMode::Tool | DeployMode::Both)
    }
}

impl fmt::Display for DeployMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeployMode {
    type Err = InferletError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "chat" => Ok(DeployMode::Chat),
            "tool" => Ok(DeployMode::Tool),
            "both" => Ok(DeployMode::Both),
            other => Err(InferletError::Configuration(format!(
                "unknown deploy mode '{}' (expected chat, tool or both)",
                other
            ))),
        }
    }
}

/// Inference runtime. The two are binary-incompatible with each other.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Engine {
    /// TensorRT-LLM
    Trt,
    /// vLLM
    Vllm,
}

impl Engine {
    pub fn as_str(&self) -> &'static str {
        match self {
            Engine::Trt => "trt",
            Engine::Vllm => "vllm",
        }
    }

    /// Minimum CUDA version (toolkit and driver) this engine runs on
    pub fn min_cuda(&self) -> crate::cuda::CudaVersion {
        match self {
            Engine::Trt => crate::cuda::CudaVersion::new(13, 0),
            Engine::Vllm => crate::cuda::CudaVersion::new(12, 8),
        }
    }
}

impl fmt::Display for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Engine::Trt => write!(f, "TensorRT-LLM"),
            Engine::Vllm => write!(f, "vLLM"),
        }
    }
}

impl FromStr for Engine {
    type Err = InferletError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "trt" | "tensorrt" | "tensorrt-llm" | "trtllm" => Ok(Engine::Trt),
            "vllm" => Ok(Engine::Vllm),
            other => Err(InferletError::Configuration(format!(
                "unknown engine '{}' (expected trt or vllm)",
                other
            ))),
        }
    }
}

/// Quantization level requested by the operator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QuantRequest {
    #[serde(rename = "auto")]
    Auto,
    #[serde(rename = "4bit")]
    FourBit,
    #[serde(rename = "8bit")]
    EightBit,
}

impl QuantRequest {
    pub fn as_str(&self) -> &'static str {
        match self {
            QuantRequest::Auto => "auto",
            QuantRequest::FourBit => "4bit",
            QuantRequest::EightBit => "8bit",
        }
    }
}

impl fmt::Display for QuantRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QuantRequest {
    type Err = InferletError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "auto" => Ok(QuantRequest::Auto),
            "4bit" | "4" | "int4" | "awq" | "gptq" => Ok(QuantRequest::FourBit),
            "8bit" | "8" | "int8" | "fp8" => Ok(QuantRequest::EightBit),
            other => Err(InferletError::Configuration(format!(
                "unknown quantization '{}' (expected auto, 4bit or 8bit)",
                other
            ))),
        }
    }
}

/// Resolved weight precision class
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuantMode {
    FourBit,
    EightBit,
    ToolOnly,
}

impl QuantMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            QuantMode::FourBit => "4bit",
            QuantMode::EightBit => "8bit",
            QuantMode::ToolOnly => "tool_only",
        }
    }
}

impl fmt::Display for QuantMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QuantMode {
    type Err = InferletError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "4bit" => Ok(QuantMode::FourBit),
            "8bit" => Ok(QuantMode::EightBit),
            "tool_only" => Ok(QuantMode::ToolOnly),
            other => Err(InferletError::Serialization(format!(
                "unknown quantization mode '{}'",
                other
            ))),
        }
    }
}

/// Concrete weight quantization backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuantBackend {
    /// Pre-quantized or runtime AWQ 4-bit weights
    Awq,
    /// GPTQ 4-bit weights on Marlin kernels
    GptqMarlin,
    /// FP8 weights; Ada and newer only
    Fp8,
    /// INT8 weights with smooth-quant style activation scaling
    Int8SmoothQuant,
    /// Unquantized weights (tool-only deployments)
    None,
}

impl QuantBackend {
    pub fn as_str(&self) -> &'static str {
        match self {
            QuantBackend::Awq => "awq",
            QuantBackend::GptqMarlin => "gptq_marlin",
            QuantBackend::Fp8 => "fp8",
            QuantBackend::Int8SmoothQuant => "int8_sq",
            QuantBackend::None => "none",
        }
    }

    /// Whether the backend needs FP8 tensor cores
    pub fn requires_fp8(&self) -> bool {
        matches!(self, QuantBackend::Fp8)
    }

    /// Weight precision class this backend produces
    pub fn mode(&self) -> QuantMode {
        match self {
            QuantBackend::Awq | QuantBackend::GptqMarlin => QuantMode::FourBit,
            QuantBackend::Fp8 | QuantBackend::Int8SmoothQuant => QuantMode::EightBit,
            QuantBackend::None => QuantMode::ToolOnly,
        }
    }

    /// Value passed to the engine's quantization flag
    pub fn engine_arg(&self, engine: Engine) -> Option<&'static str> {
        match (engine, self) {
            (_, QuantBackend::None) => None,
            (Engine::Trt, QuantBackend::Awq) => Some("int4_awq"),
            (Engine::Trt, QuantBackend::GptqMarlin) => Some("int4_gptq"),
            (Engine::Trt, QuantBackend::Fp8) => Some("fp8"),
            (Engine::Trt, QuantBackend::Int8SmoothQuant) => Some("int8_sq"),
            (Engine::Vllm, QuantBackend::Awq) => Some("awq_marlin"),
            (Engine::Vllm, QuantBackend::GptqMarlin) => Some("gptq_marlin"),
            (Engine::Vllm, QuantBackend::Fp8) => Some("fp8"),
            (Engine::Vllm, QuantBackend::Int8SmoothQuant) => Some("compressed-tensors"),
        }
    }
}

impl fmt::Display for QuantBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QuantBackend {
    type Err = InferletError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "awq" | "awq_marlin" | "int4_awq" => Ok(QuantBackend::Awq),
            "gptq" | "gptq_marlin" | "int4_gptq" => Ok(QuantBackend::GptqMarlin),
            "fp8" => Ok(QuantBackend::Fp8),
            "int8_sq" | "int8" | "smoothquant" => Ok(QuantBackend::Int8SmoothQuant),
            "none" => Ok(QuantBackend::None),
            other => Err(InferletError::Configuration(format!(
                "unknown quantization backend '{}'",
                other
            ))),
        }
    }
}

/// Precision of the attention key/value cache
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KvCacheDtype {
    Fp8,
    Int8,
}

impl KvCacheDtype {
    pub fn as_str(&self) -> &'static str {
        match self {
            KvCacheDtype::Fp8 => "fp8",
            KvCacheDtype::Int8 => "int8",
        }
    }
}

impl fmt::Display for KvCacheDtype {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for KvCacheDtype {
    type Err = InferletError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "fp8" => Ok(KvCacheDtype::Fp8),
            "int8" => Ok(KvCacheDtype::Int8),
            other => Err(InferletError::Serialization(format!(
                "unknown kv cache dtype '{}'",
                other
            ))),
        }
    }
}

/// Attention kernel family the engine is told to use
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttentionBackend {
    /// TensorRT-LLM's built-in attention plugin
    TrtLlm,
    FlashInfer,
    FlashAttn,
    XFormers,
    /// Plain PyTorch SDPA; always available
    TorchSdpa,
}

impl AttentionBackend {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttentionBackend::TrtLlm => "TRTLLM",
            AttentionBackend::FlashInfer => "FLASHINFER",
            AttentionBackend::FlashAttn => "FLASH_ATTN",
            AttentionBackend::XFormers => "XFORMERS",
            AttentionBackend::TorchSdpa => "TORCH_SDPA",
        }
    }

    /// Python package whose presence enables this kernel
    pub fn package(&self) -> Option<&'static str> {
        match self {
            AttentionBackend::FlashInfer => Some("flashinfer-python"),
            AttentionBackend::FlashAttn => Some("flash-attn"),
            AttentionBackend::XFormers => Some("xformers"),
            AttentionBackend::TrtLlm | AttentionBackend::TorchSdpa => None,
        }
    }
}

impl fmt::Display for AttentionBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AttentionBackend {
    type Err = InferletError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "TRTLLM" => Ok(AttentionBackend::TrtLlm),
            "FLASHINFER" => Ok(AttentionBackend::FlashInfer),
            "FLASH_ATTN" => Ok(AttentionBackend::FlashAttn),
            "XFORMERS" => Ok(AttentionBackend::XFormers),
            "TORCH_SDPA" => Ok(AttentionBackend::TorchSdpa),
            other => Err(InferletError::Serialization(format!(
                "unknown attention backend '{}'",
                other
            ))),
        }
    }
}

/// Batching and memory knobs handed to the engine
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BatchLimits {
    /// Maximum concurrently scheduled sequences
    pub max_num_seqs: u32,
    /// Maximum tokens per scheduler step
    pub max_batched_tokens: u32,
    /// Fraction of GPU memory the chat engine may reserve
    pub gpu_memory_fraction: f32,
}

/// Resolved quantization for one deployment
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct QuantizationPlan {
    pub mode: QuantMode,
    pub backend: QuantBackend,
    pub kv_cache_dtype: KvCacheDtype,
    pub attention_backend: AttentionBackend,
    pub batch_limits: BatchLimits,
}

/// Desired deployment state for one invocation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeploymentConfig {
    pub deploy_mode: DeployMode,
    pub chat_model: Option<String>,
    pub tool_model: Option<String>,
    pub engine: Engine,
    /// Quantization level as requested, before resolution
    pub quantization: QuantRequest,
    pub quantization_plan: QuantizationPlan,
    /// Architecture the plan was resolved for
    pub gpu_sm_arch: SmArch,
}

impl DeploymentConfig {
    /// Check model/mode consistency and that every value is storable
    pub fn validate(&self) -> Result<(), InferletError> {
        validate_models(self.deploy_mode, &self.chat_model, &self.tool_model)
    }
}

/// Check that `mode` has the models it needs and that model ids are storable
pub fn validate_models(
    mode: DeployMode,
    chat_model: &Option<String>,
    tool_model: &Option<String>,
) -> Result<(), InferletError> {
    if mode.has_chat() && chat_model.as_deref().map_or(true, str::is_empty) {
        return Err(InferletError::Configuration(format!(
            "deploy mode '{}' requires CHAT_MODEL",
            mode
        )));
    }
    if mode.has_tool() && tool_model.as_deref().map_or(true, str::is_empty) {
        return Err(InferletError::Configuration(format!(
            "deploy mode '{}' requires TOOL_MODEL",
            mode
        )));
    }
    for model in [chat_model, tool_model].into_iter().flatten() {
        if model.contains(|c| matches!(c, '\'' | '\n' | '\r')) {
            return Err(InferletError::Configuration(format!(
                "model id {:?} contains quote or newline characters",
                model
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deploy_mode_parse() {
        assert_eq!("Both".parse::<DeployMode>().unwrap(), DeployMode::Both);
        assert!("dual".parse::<DeployMode>().is_err());
        assert!(DeployMode::Both.has_chat() && DeployMode::Both.has_tool());
        assert!(!DeployMode::Tool.has_chat());
    }

    #[test]
    fn test_engine_parse_aliases() {
        assert_eq!("tensorrt-llm".parse::<Engine>().unwrap(), Engine::Trt);
        assert_eq!("VLLM".parse::<Engine>().unwrap(), Engine::Vllm);
        assert_eq!(Engine::Vllm.to_string(), "vLLM");
    }

    #[test]
    fn test_quant_request_parse() {
        assert_eq!("".parse::<QuantRequest>().unwrap(), QuantRequest::Auto);
        assert_eq!("4bit".parse::<QuantRequest>().unwrap(), QuantRequest::FourBit);
        assert_eq!("fp8".parse::<QuantRequest>().unwrap(), QuantRequest::EightBit);
        assert!("2bit".parse::<QuantRequest>().is_err());
    }

    #[test]
    fn test_backend_engine_args() {
        assert_eq!(QuantBackend::Awq.engine_arg(Engine::Trt), Some("int4_awq"));
        assert_eq!(QuantBackend::Awq.engine_arg(Engine::Vllm), Some("awq_marlin"));
        assert_eq!(QuantBackend::None.engine_arg(Engine::Vllm), None);
        assert_eq!(QuantBackend::Int8SmoothQuant.mode(), QuantMode::EightBit);
        assert!(QuantBackend::Fp8.requires_fp8());
    }

    #[test]
    fn test_backend_display_parses_back() {
        for backend in [
            QuantBackend::Awq,
            QuantBackend::GptqMarlin,
            QuantBackend::Fp8,
            QuantBackend::Int8SmoothQuant,
            QuantBackend::None,
        ] {
            assert_eq!(backend.to_string().parse::<QuantBackend>().unwrap(), backend);
        }
    }

    #[test]
    fn test_validate_models() {
        assert!(validate_models(DeployMode::Both, &Some("a".into()), &None).is_err());
        assert!(validate_models(DeployMode::Chat, &Some("a".into()), &None).is_ok());
        assert!(validate_models(DeployMode::Tool, &None, &Some("".into())).is_err());
        assert!(validate_models(DeployMode::Chat, &Some("it's".into()), &None).is_err());
    }
}
