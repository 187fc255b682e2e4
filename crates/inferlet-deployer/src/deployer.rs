//! Deployment lifecycle
//!
//! A deploy runs strictly in order: validate, check CUDA, plan, tear down
//! what the restart guard asks for, install, start, gate on health, record the
//! snapshot, warm up. The snapshot is only written once the server answered
//! its health endpoints, so a failed deploy never replaces the last good one.

use inferlet_core::{
    DeploymentConfig, InferletError, InferletResult, QuantBackend, Settings,
};
use inferlet_deps::{requirements_for, torch_index_url, InstallReport, Installer, PackageManager, PipPackageManager};
use inferlet_network::{
    CommandProbe, HealthChecker, HttpProbe, WarmupOrchestrator, WarmupOutcome, WarmupProbe,
};
use inferlet_planner::{changed_fields, choose_attention, decide, KernelProbe, PythonKernelProbe, QuantResolver, RestartDecision};
use inferlet_runtime::{ManagedProcess, ProcessSupervisor, ServerProcess};
use inferlet_store::{SnapshotRecord, SnapshotStore, WipeReport, Wiper};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::context::RuntimeContext;
use crate::server::launch_spec;

/// Resolved configuration and the guard's verdict, before any side effect
#[derive(Debug, Clone, PartialEq)]
pub struct DeployPlan {
    pub config: DeploymentConfig,
    pub decision: RestartDecision,
    /// Tracked fields that differ from the snapshot
    pub changed: Vec<&'static str>,
    /// PID of the live server, if any
    pub running: Option<u32>,
    pub snapshot: Option<DeploymentConfig>,
}

/// Outcome of a successful deploy
#[derive(Debug, Clone)]
pub struct DeployReport {
    pub decision: RestartDecision,
    pub config: DeploymentConfig,
    pub process: ServerProcess,
    pub install: InstallReport,
    pub wipe: Option<WipeReport>,
    /// `None` when warmup itself could not run
    pub warmup: Option<WarmupOutcome>,
}

/// Outcome of a stop
#[derive(Debug, Clone, Default)]
pub struct StopReport {
    pub was_running: bool,
    pub wipe: Option<WipeReport>,
    pub snapshot_removed: bool,
}

/// What is deployed right now
#[derive(Debug, Clone)]
pub struct StatusReport {
    pub running: Option<u32>,
    pub snapshot: Option<SnapshotRecord>,
    pub pid_file: PathBuf,
    pub log_file: PathBuf,
}

/// Backend kept from the last deployment when nothing that chose it changed.
///
/// An explicit pin always wins. Otherwise the snapshot's backend is reused
/// if engine, chat model and requested quantization are the same, so a
/// redeploy does not flip between equivalent backends.
pub fn carried_backend(settings: &Settings, snapshot: Option<&DeploymentConfig>) -> Option<QuantBackend> {
    if settings.pinned_backend.is_some() {
        return settings.pinned_backend;
    }
    let snapshot = snapshot?;
    let same_inputs = snapshot.engine == settings.engine
        && snapshot.chat_model == settings.chat_model
        && snapshot.quantization == settings.quantization;
    let backend = snapshot.quantization_plan.backend;
    (same_inputs && backend != QuantBackend::None).then_some(backend)
}

/// Drives one deployment root through its lifecycle
pub struct Deployer {
    ctx: RuntimeContext,
    packages: Arc<dyn PackageManager>,
    kernels: Arc<dyn KernelProbe>,
    process: Arc<dyn ManagedProcess>,
    probe: Arc<dyn WarmupProbe>,
}

impl Deployer {
    /// Create a deployer over explicit collaborators
    pub fn new(
        ctx: RuntimeContext,
        packages: Arc<dyn PackageManager>,
        kernels: Arc<dyn KernelProbe>,
        process: Arc<dyn ManagedProcess>,
        probe: Arc<dyn WarmupProbe>,
    ) -> Self {
        Self {
            ctx,
            packages,
            kernels,
            process,
            probe,
        }
    }

    /// Create a deployer backed by pip, the deployment's interpreter, a
    /// detached process supervisor and the configured warmup probes
    pub fn system(ctx: RuntimeContext) -> InferletResult<Self> {
        let install = &ctx.config.install;
        let packages = Arc::new(PipPackageManager::new(install.python.clone(), ctx.paths.venv_dir()));
        let kernels = Arc::new(PythonKernelProbe::new(ctx.venv_python()));

        let process_settings = &ctx.config.process;
        let process = Arc::new(
            ProcessSupervisor::new(ctx.paths.pid_file(), ctx.paths.log_file())
                .with_log_limits(process_settings.log_max_bytes, process_settings.log_keep_bytes),
        );

        let warmup = &ctx.config.warmup;
        let model = ctx
            .settings
            .chat_model
            .clone()
            .or_else(|| ctx.settings.tool_model.clone())
            .unwrap_or_default();
        let http = HttpProbe::new(
            format!("{}{}", ctx.base_url(), warmup.probe_path),
            ctx.settings.api_key.clone(),
            model,
            warmup.bench_concurrency,
            Duration::from_secs(warmup.request_timeout_secs),
        )?;
        let probe = Arc::new(
            CommandProbe::new(warmup.warmup_command.clone(), warmup.bench_command.clone(), ctx.base_url())
                .with_fallback(Box::new(http)),
        );

        Ok(Self::new(ctx, packages, kernels, process, probe))
    }

    pub fn context(&self) -> &RuntimeContext {
        &self.ctx
    }

    fn snapshots(&self) -> SnapshotStore {
        SnapshotStore::new(self.ctx.paths.snapshot_file())
    }

    fn grace(&self) -> Duration {
        Duration::from_secs(self.ctx.config.process.stop_grace_secs)
    }

    /// Resolve the desired configuration and the restart decision without
    /// touching anything
    pub fn plan(&self) -> InferletResult<DeployPlan> {
        let settings = &self.ctx.settings;
        settings.validate()?;

        let snapshot = self.snapshots().read()?;
        let pinned = carried_backend(settings, snapshot.as_ref());
        let resolver = QuantResolver::new(settings.engine, settings.max_concurrent_connections, self.kernels.clone());
        let quantization_plan = resolver.resolve(
            settings.deploy_mode,
            settings.chat_model.as_deref(),
            settings.quantization,
            &self.ctx.gpu,
            pinned,
        );

        let config = DeploymentConfig {
            deploy_mode: settings.deploy_mode,
            chat_model: settings.chat_model.clone(),
            tool_model: settings.tool_model.clone(),
            engine: settings.engine,
            quantization: settings.quantization,
            quantization_plan,
            gpu_sm_arch: self.ctx.gpu.sm_arch,
        };
        config.validate()?;

        let running = self.process.is_alive()?;
        let decision = decide(&config, snapshot.as_ref(), running.is_some());
        let changed = snapshot
            .as_ref()
            .map(|s| changed_fields(&config, s))
            .unwrap_or_default();

        debug!(
            decision = decision.as_str(),
            changed = ?changed,
            running = ?running,
            backend = %config.quantization_plan.backend,
            "Planned deployment"
        );

        Ok(DeployPlan {
            config,
            decision,
            changed,
            running,
            snapshot,
        })
    }

    /// Deploy the configured models and run the warmup against them
    pub async fn deploy(&self) -> InferletResult<DeployReport> {
        let mut report = self.launch().await?;
        report.warmup = self.warmup().await;
        Ok(report)
    }

    /// Everything up to and including the snapshot write: teardown, install,
    /// start and the health gate. The returned report carries no warmup.
    pub async fn launch(&self) -> InferletResult<DeployReport> {
        self.ctx.settings.validate()?;
        self.ctx.ensure_cuda()?;

        let DeployPlan {
            mut config,
            decision,
            changed,
            running,
            ..
        } = self.plan()?;
        info!(
            decision = decision.as_str(),
            changed = ?changed,
            engine = %config.engine,
            mode = %config.deploy_mode,
            backend = %config.quantization_plan.backend,
            "Restart guard decided"
        );

        let wipe = self.teardown(decision, running).await?;
        let install = self.install().await?;

        // kernels may have arrived with the install
        let attention = choose_attention(config.engine, self.ctx.gpu.sm_arch, self.kernels.as_ref());
        if attention != config.quantization_plan.attention_backend {
            info!(
                before = %config.quantization_plan.attention_backend,
                after = %attention,
                "Attention backend changed after install"
            );
            config.quantization_plan.attention_backend = attention;
        }

        let spec = launch_spec(&self.ctx, &config)?;
        let process = self.process.start(&spec).await?;
        self.gate_on_health().await?;

        self.snapshots().write(&config)?;
        info!(pid = process.pid, snapshot = %self.ctx.paths.snapshot_file().display(), "Deployment recorded");

        Ok(DeployReport {
            decision,
            config,
            process,
            install,
            wipe,
            warmup: None,
        })
    }

    /// Carry out the restart guard's decision
    async fn teardown(&self, decision: RestartDecision, running: Option<u32>) -> InferletResult<Option<WipeReport>> {
        match decision {
            RestartDecision::NoOp => {
                // a live server without a snapshot is not ours to replace
                if let Some(pid) = running {
                    return Err(InferletError::AlreadyRunning {
                        pid,
                        pid_file: self.ctx.paths.pid_file(),
                    });
                }
                Ok(None)
            }
            RestartDecision::LightRestart => {
                self.process.stop(self.grace()).await?;
                Ok(None)
            }
            RestartDecision::FullWipe => {
                self.process.stop(self.grace()).await?;
                let report = Wiper::new(self.ctx.paths.clone()).wipe(false).await?;
                self.snapshots().remove()?;
                Ok(Some(report))
            }
        }
    }

    async fn install(&self) -> InferletResult<InstallReport> {
        let settings = &self.ctx.settings;
        let install = &self.ctx.config.install;
        let requirements = requirements_for(settings.engine, &install.pins);
        let extra_index_url = self.ctx.toolkit.map(|t| torch_index_url(t.version));

        Installer::new(self.packages.clone(), install.retry)
            .ensure(&requirements, settings.force_reinstall, extra_index_url)
            .await
    }

    /// Wait for health; on failure stop the half-started server and fail
    async fn gate_on_health(&self) -> InferletResult<()> {
        let health = &self.ctx.config.health;
        let urls = self.ctx.health_urls();
        let checker = HealthChecker::new(Duration::from_secs(health.request_timeout_secs))?;
        let process = self.process.clone();

        let healthy = checker
            .await_health_while(
                &urls,
                Duration::from_secs(health.timeout_secs),
                Duration::from_secs(health.interval_secs),
                move || matches!(process.is_alive(), Ok(Some(_))),
            )
            .await;
        if healthy {
            return Ok(());
        }

        error!(log = %self.ctx.paths.log_file().display(), "Server never became healthy, stopping it");
        if let Err(e) = self.process.stop(self.grace()).await {
            warn!(error = %e, "Failed to stop unhealthy server");
        }
        Err(InferletError::HealthCheckTimeout {
            timeout_secs: health.timeout_secs,
            urls: urls.join(", "),
        })
    }

    /// Best-effort smoke gate; never fails the deploy
    pub async fn warmup(&self) -> Option<WarmupOutcome> {
        let paths = &self.ctx.paths;
        let orchestrator = WarmupOrchestrator::new(
            paths.warmup_lock(),
            paths.logs_dir(),
            paths.warmup_rollup(),
            self.probe.clone(),
        );

        match orchestrator.run_warmup(&self.ctx.config.warmup).await {
            Ok(WarmupOutcome::Completed(report)) if !report.passed() => {
                let failure = InferletError::WarmupPhaseFailure(report.failures().join(", "));
                warn!(error = %failure, hint = failure.hint(), "Warmup reported failures");
                Some(WarmupOutcome::Completed(report))
            }
            Ok(outcome) => Some(outcome),
            Err(e) => {
                let failure = InferletError::WarmupPhaseFailure(e.to_string());
                warn!(error = %failure, hint = failure.hint(), "Warmup could not run");
                None
            }
        }
    }

    /// Stop the server. `full_cleanup` also wipes artifacts, model caches and
    /// the snapshot.
    pub async fn stop(&self, full_cleanup: bool) -> InferletResult<StopReport> {
        let was_running = self.process.stop(self.grace()).await?;
        let mut report = StopReport {
            was_running,
            ..Default::default()
        };
        if full_cleanup {
            report.wipe = Some(Wiper::new(self.ctx.paths.clone()).wipe(true).await?);
            let store = self.snapshots();
            report.snapshot_removed = store.path().exists();
            store.remove()?;
        }
        Ok(report)
    }

    /// Redeploy with the current parameters. `reset_models` first removes
    /// model caches and artifacts, which makes the deploy a fresh one.
    pub async fn restart(&self, reset_models: bool) -> InferletResult<DeployReport> {
        let mut report = self.relaunch(reset_models).await?;
        report.warmup = self.warmup().await;
        Ok(report)
    }

    /// [`Deployer::restart`] without the warmup
    pub async fn relaunch(&self, reset_models: bool) -> InferletResult<DeployReport> {
        if reset_models {
            info!("Resetting models before restart");
            self.stop(true).await?;
        }
        self.launch().await
    }

    pub fn status(&self) -> InferletResult<StatusReport> {
        Ok(StatusReport {
            running: self.process.is_alive()?,
            snapshot: self.snapshots().read_record()?,
            pid_file: self.ctx.paths.pid_file(),
            log_file: self.ctx.paths.log_file(),
        })
    }
}
