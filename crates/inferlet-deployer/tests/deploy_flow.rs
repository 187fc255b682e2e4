//! End-to-end deploy flow against a scripted host, an in-memory package
//! manager and `sleep` standing in for the inference server

#![cfg(unix)]

use async_trait::async_trait;
use inferlet_core::{
    AttentionBackend, CudaVersion, DeployMode, DeploymentPaths, Engine, HostProbe, InferletError, KvCacheDtype,
    NvmlReading, OrchestratorConfig, QuantBackend, QuantMode, QuantRequest, Settings, SmArch, SmiReading,
};
use inferlet_deployer::{Deployer, RuntimeContext};
use inferlet_deps::{InstallOptions, InstallStepError, PackageManager};
use inferlet_network::{Phase, ProbeOutcome, WarmupOutcome, WarmupProbe};
use inferlet_planner::{KernelProbe, RestartDecision};
use inferlet_runtime::{pid_alive, ProcessSupervisor};
use inferlet_store::SnapshotStore;
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

struct H100Host;

impl HostProbe for H100Host {
    fn nvml(&self) -> Option<NvmlReading> {
        Some(NvmlReading {
            name: Some("NVIDIA H100 80GB HBM3".to_string()),
            compute_capability: Some((9, 0)),
            memory_total_bytes: Some(80 * 1024 * 1024 * 1024),
            driver_cuda: Some(CudaVersion::new(13, 0)),
        })
    }

    fn smi(&self) -> Option<SmiReading> {
        None
    }

    fn nvcc_version(&self) -> Option<CudaVersion> {
        Some(CudaVersion::new(13, 0))
    }
}

#[derive(Default)]
struct MemoryPackages {
    installed: Mutex<HashMap<String, String>>,
    installs: Mutex<Vec<String>>,
}

#[async_trait]
impl PackageManager for MemoryPackages {
    async fn installed_version(&self, name: &str) -> inferlet_core::InferletResult<Option<String>> {
        Ok(self.installed.lock().unwrap().get(name).cloned())
    }

    async fn uninstall(&self, names: &[String]) -> Result<(), InstallStepError> {
        let mut installed = self.installed.lock().unwrap();
        for name in names {
            installed.remove(name);
        }
        Ok(())
    }

    async fn install(&self, requirement: &str, _options: &InstallOptions) -> Result<(), InstallStepError> {
        let (name, version) = requirement
            .split_once("==")
            .ok_or_else(|| InstallStepError::fatal("bad requirement"))?;
        self.installed
            .lock()
            .unwrap()
            .insert(name.to_string(), format!("{}+cu130", version));
        self.installs.lock().unwrap().push(requirement.to_string());
        Ok(())
    }
}

struct NoKernels;

impl KernelProbe for NoKernels {
    fn is_installed(&self, _package: &str) -> bool {
        false
    }
}

#[derive(Default)]
struct CountingProbe {
    calls: Mutex<Vec<Phase>>,
}

#[async_trait]
impl WarmupProbe for CountingProbe {
    async fn run(&self, phase: Phase, _variant: &str, _attempt: u32) -> ProbeOutcome {
        self.calls.lock().unwrap().push(phase);
        ProbeOutcome::pass("ok")
    }
}

/// Port answering 200 to every request
async fn healthy_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut buf = [0u8; 2048];
                let _ = socket.read(&mut buf).await;
                let _ = socket
                    .write_all(b"HTTP/1.1 200 OK\r\ncontent-length: 2\r\nconnection: close\r\n\r\nok")
                    .await;
            });
        }
    });
    port
}

/// Port nothing listens on
async fn dead_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

struct Harness {
    deployer: Deployer,
    packages: Arc<MemoryPackages>,
    probe: Arc<CountingProbe>,
}

fn harness(root: &Path, port: u16, extra: &[(&str, &str)], health_timeout_secs: u64) -> Harness {
    let mut vars: HashMap<String, String> = [
        ("API_KEY", "secret"),
        ("HF_TOKEN", "hf_abc"),
        ("MAX_CONCURRENT_CONNECTIONS", "32"),
        ("ENGINE", "trt"),
        ("DEPLOY_MODE", "both"),
        ("CHAT_MODEL", "A"),
        ("TOOL_MODEL", "B"),
        ("QUANTIZATION", "auto"),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect();
    vars.insert("SERVER_PORT".to_string(), port.to_string());
    for (k, v) in extra {
        vars.insert(k.to_string(), v.to_string());
    }
    let settings = Settings::from_vars(&vars).unwrap();

    let mut config = OrchestratorConfig::default();
    config.process.server_command = vec!["sleep".to_string(), "30".to_string()];
    config.process.stop_grace_secs = 5;
    config.health.timeout_secs = health_timeout_secs;
    config.health.interval_secs = 1;
    config.warmup.variants = vec!["default".to_string()];

    let paths = DeploymentPaths::new(root);
    let ctx = RuntimeContext::detect(&H100Host, paths.clone(), settings, config);
    let packages = Arc::new(MemoryPackages::default());
    let probe = Arc::new(CountingProbe::default());
    let process = Arc::new(ProcessSupervisor::new(paths.pid_file(), paths.log_file()));
    let deployer = Deployer::new(ctx, packages.clone(), Arc::new(NoKernels), process, probe.clone());

    Harness {
        deployer,
        packages,
        probe,
    }
}

#[tokio::test]
async fn fresh_root_deploys_and_records_snapshot() {
    let root = tempfile::tempdir().unwrap();
    let port = healthy_port().await;
    let h = harness(root.path(), port, &[], 30);

    let report = h.deployer.deploy().await.unwrap();
    assert_eq!(report.decision, RestartDecision::NoOp);
    assert!(pid_alive(report.process.pid));
    assert_eq!(report.install.installed.len(), 4);
    assert!(h.packages.installs.lock().unwrap().contains(&"torch==2.9.1".to_string()));

    let snapshot = SnapshotStore::new(root.path().join(".run/last_config.env"))
        .read()
        .unwrap()
        .unwrap();
    assert_eq!(snapshot.engine, Engine::Trt);
    assert_eq!(snapshot.deploy_mode, DeployMode::Both);
    assert_eq!(snapshot.chat_model.as_deref(), Some("A"));
    assert_eq!(snapshot.tool_model.as_deref(), Some("B"));
    assert_eq!(snapshot.quantization, QuantRequest::Auto);
    assert_eq!(snapshot.quantization_plan.mode, QuantMode::EightBit);
    assert_eq!(snapshot.quantization_plan.backend, QuantBackend::Fp8);
    assert_eq!(snapshot.quantization_plan.kv_cache_dtype, KvCacheDtype::Fp8);
    assert_eq!(snapshot.quantization_plan.attention_backend, AttentionBackend::TrtLlm);
    assert_eq!(snapshot.gpu_sm_arch, SmArch(90));
    assert_eq!(snapshot, report.config);

    match report.warmup {
        Some(WarmupOutcome::Completed(warmup)) => assert!(warmup.passed()),
        other => panic!("expected a completed warmup, got {:?}", other),
    }
    assert_eq!(*h.probe.calls.lock().unwrap(), vec![Phase::Warmup, Phase::Benchmark]);
    assert!(root.path().join("logs/warmup.log").exists());

    let stop = h.deployer.stop(false).await.unwrap();
    assert!(stop.was_running);
    assert!(!pid_alive(report.process.pid));
    assert!(!root.path().join("server.pid").exists());
}

#[tokio::test]
async fn redeploy_restarts_light_then_wipes_on_change() {
    let root = tempfile::tempdir().unwrap();
    let port = healthy_port().await;

    let first = harness(root.path(), port, &[], 30).deployer.deploy().await.unwrap();

    // same settings, server running
    let h = harness(root.path(), port, &[], 30);
    let second = h.deployer.deploy().await.unwrap();
    assert_eq!(second.decision, RestartDecision::LightRestart);
    assert!(!pid_alive(first.process.pid));
    assert!(second.wipe.is_none());
    assert!(root.path().join(".run/last_config.env").exists());

    let venv_marker = root.path().join(".venv");
    std::fs::create_dir_all(&venv_marker).unwrap();

    let h = harness(root.path(), port, &[("TOOL_MODEL", "C")], 30);
    let plan = h.deployer.plan().unwrap();
    assert_eq!(plan.decision, RestartDecision::FullWipe);
    assert_eq!(plan.changed, vec!["tool_model"]);

    let third = h.deployer.deploy().await.unwrap();
    assert_eq!(third.decision, RestartDecision::FullWipe);
    assert!(third.wipe.unwrap().removed.contains(&venv_marker));
    assert!(!pid_alive(second.process.pid));
    assert_eq!(third.config.tool_model.as_deref(), Some("C"));

    let stop = h.deployer.stop(true).await.unwrap();
    assert!(stop.was_running);
    assert!(stop.snapshot_removed);
    assert!(h.deployer.status().unwrap().snapshot.is_none());
}

#[tokio::test]
async fn unhealthy_server_is_stopped_and_snapshot_untouched() {
    let root = tempfile::tempdir().unwrap();
    let port = dead_port().await;
    let h = harness(root.path(), port, &[], 1);

    let err = h.deployer.deploy().await.unwrap_err();
    assert!(matches!(err, InferletError::HealthCheckTimeout { .. }));
    assert!(!root.path().join("server.pid").exists());
    assert!(!root.path().join(".run/last_config.env").exists());
    assert!(h.probe.calls.lock().unwrap().is_empty());
}

#[tokio::test]
async fn missing_tool_model_fails_before_side_effects() {
    let root = tempfile::tempdir().unwrap();
    let port = dead_port().await;
    let h = harness(root.path(), port, &[("DEPLOY_MODE", "tool"), ("TOOL_MODEL", "")], 1);

    let err = h.deployer.deploy().await.unwrap_err();
    assert!(matches!(err, InferletError::Configuration(_)));
    assert_eq!(err.exit_code(), 2);
    assert!(h.packages.installs.lock().unwrap().is_empty());
    assert!(!root.path().join("server.pid").exists());
}

#[tokio::test]
async fn failed_wipe_aborts_before_the_new_server_starts() {
    let root = tempfile::tempdir().unwrap();
    let port = healthy_port().await;

    let first = harness(root.path(), port, &[], 30).deployer.deploy().await.unwrap();

    // a regular file where the cache directory belongs makes every artifact
    // lookup under it fail with ENOTDIR, root included
    let cache = root.path().join(".cache");
    if cache.exists() {
        std::fs::remove_dir_all(&cache).unwrap();
    }
    std::fs::write(&cache, b"not a directory").unwrap();

    let h = harness(root.path(), port, &[("TOOL_MODEL", "C")], 30);
    let err = h.deployer.deploy().await.unwrap_err();
    assert!(matches!(err, InferletError::Wipe(_)));
    assert!(!pid_alive(first.process.pid));
    assert!(!root.path().join("server.pid").exists());
    assert!(h.packages.installs.lock().unwrap().is_empty());

    let snapshot = SnapshotStore::new(root.path().join(".run/last_config.env"))
        .read()
        .unwrap()
        .unwrap();
    assert_eq!(snapshot.tool_model.as_deref(), Some("B"));
}

#[tokio::test]
async fn launch_records_the_deployment_without_warming_up() {
    let root = tempfile::tempdir().unwrap();
    let port = healthy_port().await;
    let h = harness(root.path(), port, &[], 30);

    let report = h.deployer.launch().await.unwrap();
    assert!(report.warmup.is_none());
    assert!(h.probe.calls.lock().unwrap().is_empty());
    assert!(root.path().join(".run/last_config.env").exists());
    assert!(pid_alive(report.process.pid));

    match h.deployer.warmup().await {
        Some(WarmupOutcome::Completed(warmup)) => assert!(warmup.passed()),
        other => panic!("expected a completed warmup, got {:?}", other),
    }

    h.deployer.stop(false).await.unwrap();
}
