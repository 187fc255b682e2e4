//! CLI commands implementation

use anyhow::Result;
use inferlet_core::{
    detect_cuda_driver_capability, detect_cuda_toolkit, detect_gpu, DeployOverrides, DeploymentPaths, InferletError,
    OrchestratorConfig, Settings, SystemProbe,
};
use inferlet_deployer::{DeployReport, Deployer, RuntimeContext};
use inferlet_network::WarmupOutcome;
use inferlet_runtime::{follow, tail_lines};
use serde_json::json;
use std::path::Path;
use std::time::Duration;
use tracing::warn;

/// Config file picked up from the deployment root when `--config` is absent
const DEFAULT_CONFIG_FILE: &str = "inferlet.toml";

/// Load settings and configuration, then probe the host
pub fn load_context(root: &Path, config: Option<&Path>, overrides: DeployOverrides) -> Result<RuntimeContext> {
    let settings = Settings::load(root)?.with_overrides(overrides);

    let config = match config {
        Some(path) => OrchestratorConfig::from_file(path)?,
        None => {
            let path = root.join(DEFAULT_CONFIG_FILE);
            if path.exists() {
                OrchestratorConfig::from_file(&path)?
            } else {
                OrchestratorConfig::default()
            }
        }
    };

    Ok(RuntimeContext::detect(&SystemProbe, DeploymentPaths::new(root), settings, config))
}

/// Deploy the configured models
pub async fn deploy(ctx: RuntimeContext) -> Result<()> {
    let deployer = Deployer::system(ctx)?;
    let mut report = tokio::select! {
        result = deployer.launch() => result?,
        _ = tokio::signal::ctrl_c() => {
            return Err(InferletError::Interrupted("deploy cancelled before it completed".to_string()).into());
        }
    };
    report.warmup = warmup_until_interrupted(&deployer).await;
    print_deploy_report(&deployer, &report);
    Ok(())
}

/// Stop the server
pub async fn stop(ctx: RuntimeContext, full_cleanup: bool) -> Result<()> {
    let deployer = Deployer::system(ctx)?;
    let report = deployer.stop(full_cleanup).await?;

    if report.was_running {
        println!("Server stopped");
    } else {
        println!("Server was not running");
    }
    if let Some(wipe) = report.wipe {
        println!("Removed {} cached path(s)", wipe.removed.len());
        for path in wipe.removed {
            println!("  {}", path.display());
        }
    }
    if report.snapshot_removed {
        println!("Deployment snapshot removed");
    }
    Ok(())
}

/// Redeploy with the same parameters
pub async fn restart(ctx: RuntimeContext, reset_models: bool) -> Result<()> {
    let deployer = Deployer::system(ctx)?;
    let mut report = tokio::select! {
        result = deployer.relaunch(reset_models) => result?,
        _ = tokio::signal::ctrl_c() => {
            return Err(InferletError::Interrupted("restart cancelled before it completed".to_string()).into());
        }
    };
    report.warmup = warmup_until_interrupted(&deployer).await;
    print_deploy_report(&deployer, &report);
    Ok(())
}

/// The server is healthy and recorded by now, so Ctrl-C only cuts the
/// warmup short.
async fn warmup_until_interrupted(deployer: &Deployer) -> Option<WarmupOutcome> {
    tokio::select! {
        outcome = deployer.warmup() => outcome,
        _ = tokio::signal::ctrl_c() => {
            warn!("Warmup interrupted; the deployment is recorded and the server keeps running");
            None
        }
    }
}

/// Show the server PID and the last deployment
pub fn status(ctx: RuntimeContext) -> Result<()> {
    let deployer = Deployer::system(ctx)?;
    let status = deployer.status()?;

    match status.running {
        Some(pid) => println!("Server: running (PID {})", pid),
        None => println!("Server: not running"),
    }
    println!("  PID file: {}", status.pid_file.display());
    println!("  Log: {}", status.log_file.display());

    match status.snapshot {
        Some(record) => {
            let config = &record.config;
            let plan = &config.quantization_plan;
            println!("\nLast deployment ({}):", record.deployed_at.to_rfc3339());
            println!("  Engine: {}", config.engine);
            println!("  Mode: {}", config.deploy_mode);
            println!("  Chat model: {}", config.chat_model.as_deref().unwrap_or("-"));
            println!("  Tool model: {}", config.tool_model.as_deref().unwrap_or("-"));
            println!("  Quantization: {} ({} / {})", config.quantization, plan.mode, plan.backend);
            println!("  KV cache: {}", plan.kv_cache_dtype);
            println!("  Attention: {}", plan.attention_backend);
            println!("  GPU arch: {}", config.gpu_sm_arch);
        }
        None => println!("\nNo successful deployment recorded"),
    }
    Ok(())
}

/// Show the detected GPU and CUDA versions
pub fn detect(root: &Path, as_json: bool) -> Result<()> {
    // settings are optional here; only the toolkit override is used
    let toolkit_override = Settings::load(root).ok().and_then(|s| s.cuda_toolkit_override);
    let gpu = detect_gpu(&SystemProbe);
    let toolkit = detect_cuda_toolkit(&SystemProbe, toolkit_override);
    let driver = detect_cuda_driver_capability(&SystemProbe);

    if as_json {
        let value = json!({
            "gpu": gpu,
            "family": gpu.family().to_string(),
            "cuda_toolkit": toolkit.map(|t| t.version.to_string()),
            "cuda_toolkit_source": toolkit.map(|t| t.source.to_string()),
            "cuda_driver": driver.map(|d| d.to_string()),
        });
        println!("{}", serde_json::to_string_pretty(&value)?);
        return Ok(());
    }

    println!("GPU: {}", gpu.name);
    println!("  Architecture: {} ({})", gpu.sm_arch, gpu.family());
    println!("  Memory: {} GB", gpu.vram_gb);
    println!("  FP8: {}", if gpu.supports_fp8 { "yes" } else { "no" });
    match toolkit {
        Some(t) => println!("CUDA toolkit: {} (from {})", t.version, t.source),
        None => println!("CUDA toolkit: not found"),
    }
    match driver {
        Some(d) => println!("CUDA driver capability: {}", d),
        None => println!("CUDA driver capability: unknown"),
    }
    Ok(())
}

/// Resolve the deployment without side effects
pub fn plan(ctx: RuntimeContext, as_json: bool) -> Result<()> {
    let deployer = Deployer::system(ctx)?;
    let plan = deployer.plan()?;

    if as_json {
        let value = json!({
            "config": plan.config,
            "decision": plan.decision,
            "changed": plan.changed,
            "running": plan.running,
        });
        println!("{}", serde_json::to_string_pretty(&value)?);
        return Ok(());
    }

    let config = &plan.config;
    let quant = &config.quantization_plan;
    let limits = &quant.batch_limits;
    println!("Decision: {}", plan.decision.as_str());
    if !plan.changed.is_empty() {
        println!("  Changed: {}", plan.changed.join(", "));
    }
    match plan.running {
        Some(pid) => println!("  Running: PID {}", pid),
        None => println!("  Running: no"),
    }
    println!("\nEngine: {}", config.engine);
    println!("Mode: {}", config.deploy_mode);
    println!("Chat model: {}", config.chat_model.as_deref().unwrap_or("-"));
    println!("Tool model: {}", config.tool_model.as_deref().unwrap_or("-"));
    println!("Quantization: {} -> {} / {}", config.quantization, quant.mode, quant.backend);
    println!("KV cache: {}", quant.kv_cache_dtype);
    println!("Attention: {}", quant.attention_backend);
    println!(
        "Batch: {} seqs, {} tokens, {:.0}% GPU memory",
        limits.max_num_seqs,
        limits.max_batched_tokens,
        limits.gpu_memory_fraction * 100.0
    );
    Ok(())
}

/// Print the log tail, optionally following it. Ctrl-C only ends the
/// follow; the server runs in its own session and never sees the signal.
pub async fn logs(root: &Path, follow_log: bool, lines: usize) -> Result<()> {
    let log = DeploymentPaths::new(root).log_file();
    for line in tail_lines(&log, lines)? {
        println!("{}", line);
    }
    if !follow_log {
        return Ok(());
    }

    let mut stdout = tokio::io::stdout();
    tokio::select! {
        result = follow(&log, &mut stdout, Duration::from_millis(500)) => result?,
        _ = tokio::signal::ctrl_c() => {}
    }
    Ok(())
}

fn print_deploy_report(deployer: &Deployer, report: &DeployReport) {
    let config = &report.config;
    let plan = &config.quantization_plan;
    let ctx = deployer.context();

    println!("Deployed ({})", report.decision.as_str());
    println!("  PID: {}", report.process.pid);
    println!("  URL: {}", ctx.base_url());
    println!("  Engine: {}", config.engine);
    println!("  Mode: {}", config.deploy_mode);
    println!("  Quantization: {} / {}", plan.mode, plan.backend);
    println!("  KV cache: {}", plan.kv_cache_dtype);
    println!("  Attention: {}", plan.attention_backend);
    if !report.install.installed.is_empty() {
        println!("  Installed: {}", report.install.installed.join(", "));
    }
    if let Some(wipe) = &report.wipe {
        println!("  Wiped {} cached path(s)", wipe.removed.len());
    }

    match &report.warmup {
        Some(WarmupOutcome::Completed(warmup)) if warmup.passed() => println!("  Warmup: passed"),
        Some(WarmupOutcome::Completed(warmup)) => {
            println!("  Warmup: FAILED ({}); server left running", warmup.failures().join(", "));
            println!("  See {}", ctx.paths.warmup_rollup().display());
        }
        Some(WarmupOutcome::Skipped { holder }) => match holder {
            Some(pid) => println!("  Warmup: skipped, already running in PID {}", pid),
            None => println!("  Warmup: skipped, another run holds the lock"),
        },
        Some(WarmupOutcome::Disabled) => println!("  Warmup: disabled"),
        None => println!("  Warmup: did not finish; see the log output above"),
    }
}
