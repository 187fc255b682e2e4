//! Server launch parameters

use inferlet_core::{DeploymentConfig, InferletError, InferletResult};
use inferlet_runtime::LaunchSpec;
use std::ffi::OsString;

use crate::context::RuntimeContext;

/// Build the server command for `config`.
///
/// The server reads everything it needs from its environment; the command
/// line is taken verbatim from the process settings.
pub fn launch_spec(ctx: &RuntimeContext, config: &DeploymentConfig) -> InferletResult<LaunchSpec> {
    let Some((program, args)) = ctx.config.process.server_command.split_first() else {
        return Err(InferletError::Configuration(
            "process.server_command must name a program".to_string(),
        ));
    };

    let plan = &config.quantization_plan;
    let settings = &ctx.settings;
    let mut spec = LaunchSpec::new(program.clone());
    spec.args = args.to_vec();
    spec.cwd = Some(ctx.paths.root().to_path_buf());

    spec = spec
        .env("ENGINE", config.engine.as_str())
        .env("DEPLOY_MODE", config.deploy_mode.as_str())
        .env("CHAT_MODEL", config.chat_model.clone().unwrap_or_default())
        .env("TOOL_MODEL", config.tool_model.clone().unwrap_or_default())
        .env("QUANT_MODE", plan.mode.as_str())
        .env("QUANT_BACKEND", plan.backend.engine_arg(config.engine).unwrap_or(""))
        .env("KV_CACHE_DTYPE", plan.kv_cache_dtype.as_str())
        .env("ATTENTION_BACKEND", plan.attention_backend.as_str())
        .env("MAX_NUM_SEQS", plan.batch_limits.max_num_seqs.to_string())
        .env("MAX_BATCHED_TOKENS", plan.batch_limits.max_batched_tokens.to_string())
        .env("GPU_MEMORY_FRACTION", format!("{:.2}", plan.batch_limits.gpu_memory_fraction))
        .env("SERVER_PORT", settings.server_port.to_string())
        .env("API_KEY", settings.api_key.clone())
        .env("HF_TOKEN", settings.hf_token.clone())
        .env("MAX_CONCURRENT_CONNECTIONS", settings.max_concurrent_connections.to_string())
        .env("HF_HOME", ctx.paths.models_dir().to_string_lossy())
        .env("VIRTUAL_ENV", ctx.paths.venv_dir().to_string_lossy());

    let venv_bin = ctx.paths.venv_dir().join("bin");
    let mut path = OsString::from(venv_bin.as_os_str());
    if let Some(existing) = std::env::var_os("PATH") {
        path.push(":");
        path.push(existing);
    }
    Ok(spec.env("PATH", path.to_string_lossy()))
}
