//! Configuration types for inferlet
//!
//! Two layers: [`Settings`] come from environment-style key/value input (process
//! environment over the deployment root's `.env`), and [`OrchestratorConfig`] is an
//! optional TOML file with tuning knobs that all have defaults.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::debug;

use crate::cuda::CudaVersion;
use crate::error::{InferletError, InferletResult};
use crate::model::{validate_models, DeployMode, Engine, QuantBackend, QuantRequest};
use crate::retry::RetryPolicy;

/// Keys that must be present before any work starts
pub const REQUIRED_KEYS: [&str; 3] = ["API_KEY", "HF_TOKEN", "MAX_CONCURRENT_CONNECTIONS"];

/// Operator settings for one invocation
#[derive(Clone)]
pub struct Settings {
    pub api_key: String,
    pub hf_token: String,
    /// Concurrency capacity the server advertises
    pub max_concurrent_connections: u32,
    pub engine: Engine,
    pub deploy_mode: DeployMode,
    pub chat_model: Option<String>,
    pub tool_model: Option<String>,
    pub quantization: QuantRequest,
    /// Explicit backend pin; still subject to the pre-quantized override
    pub pinned_backend: Option<QuantBackend>,
    pub cuda_toolkit_override: Option<CudaVersion>,
    pub server_port: u16,
    /// Reinstall every dependency regardless of installed state
    pub force_reinstall: bool,
}

impl fmt::Debug for Settings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Settings")
            .field("api_key", &"<redacted>")
            .field("hf_token", &"<redacted>")
            .field("max_concurrent_connections", &self.max_concurrent_connections)
            .field("engine", &self.engine)
            .field("deploy_mode", &self.deploy_mode)
            .field("chat_model", &self.chat_model)
            .field("tool_model", &self.tool_model)
            .field("quantization", &self.quantization)
            .field("pinned_backend", &self.pinned_backend)
            .field("cuda_toolkit_override", &self.cuda_toolkit_override)
            .field("server_port", &self.server_port)
            .field("force_reinstall", &self.force_reinstall)
            .finish()
    }
}

/// Deploy parameters given on the command line; each wins over the environment
#[derive(Debug, Clone, Default)]
pub struct DeployOverrides {
    pub engine: Option<Engine>,
    pub deploy_mode: Option<DeployMode>,
    pub chat_model: Option<String>,
    pub tool_model: Option<String>,
    pub quantization: Option<QuantRequest>,
}

impl Settings {
    /// Load settings from `<root>/.env`, or `./.env` when the root has none,
    /// with the process environment on top
    pub fn load(root: &Path) -> InferletResult<Self> {
        let cwd = std::env::current_dir().ok();
        Self::load_with_fallback(root, cwd.as_deref())
    }

    fn load_with_fallback(root: &Path, fallback_dir: Option<&Path>) -> InferletResult<Self> {
        let mut vars = HashMap::new();
        if let Some(env_file) = env_file(root, fallback_dir) {
            for item in dotenvy::from_path_iter(&env_file)? {
                let (key, value) = item?;
                vars.insert(key, value);
            }
            debug!(path = %env_file.display(), "Loaded settings file");
        }
        vars.extend(std::env::vars());
        Self::from_vars(&vars)
    }

    /// Build settings from a key/value map
    pub fn from_vars(vars: &HashMap<String, String>) -> InferletResult<Self> {
        let get = |key: &str| {
            vars.get(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let missing: Vec<&str> = REQUIRED_KEYS
            .iter()
            .copied()
            .filter(|key| get(key).is_none())
            .collect();
        if !missing.is_empty() {
            return Err(InferletError::Configuration(format!(
                "missing required settings: {}",
                missing.join(", ")
            )));
        }

        let max_concurrent_connections = get("MAX_CONCURRENT_CONNECTIONS")
            .and_then(|v| v.parse::<u32>().ok())
            .filter(|v| *v > 0)
            .ok_or_else(|| {
                InferletError::Configuration(
                    "MAX_CONCURRENT_CONNECTIONS must be a positive integer".to_string(),
                )
            })?;

        let server_port = match get("SERVER_PORT") {
            Some(port) => port.parse::<u16>().map_err(|_| {
                InferletError::Configuration(format!("SERVER_PORT '{}' is not a valid port", port))
            })?,
            None => 8000,
        };

        Ok(Self {
            api_key: get("API_KEY").unwrap_or_default(),
            hf_token: get("HF_TOKEN").unwrap_or_default(),
            max_concurrent_connections,
            engine: parse_or(get("ENGINE"), Engine::Trt)?,
            deploy_mode: parse_or(get("DEPLOY_MODE"), DeployMode::Both)?,
            chat_model: get("CHAT_MODEL"),
            tool_model: get("TOOL_MODEL"),
            quantization: parse_or(get("QUANTIZATION"), QuantRequest::Auto)?,
            pinned_backend: get("QUANT_BACKEND").map(|v| v.parse()).transpose()?,
            cuda_toolkit_override: get("CUDA_TOOLKIT_VERSION").map(|v| v.parse()).transpose()?,
            server_port,
            force_reinstall: get("FORCE_REINSTALL").map_or(false, |v| parse_bool(&v)),
        })
    }

    /// Apply command-line deploy parameters
    pub fn with_overrides(mut self, overrides: DeployOverrides) -> Self {
        if let Some(engine) = overrides.engine {
            self.engine = engine;
        }
        if let Some(mode) = overrides.deploy_mode {
            self.deploy_mode = mode;
        }
        if overrides.chat_model.is_some() {
            self.chat_model = overrides.chat_model;
        }
        if overrides.tool_model.is_some() {
            self.tool_model = overrides.tool_model;
        }
        if let Some(quantization) = overrides.quantization {
            self.quantization = quantization;
        }
        self
    }

    /// Check that the chosen mode has the models it needs
    pub fn validate(&self) -> InferletResult<()> {
        validate_models(self.deploy_mode, &self.chat_model, &self.tool_model)
    }
}

fn parse_or<T: FromStr<Err = InferletError>>(value: Option<String>, default: T) -> InferletResult<T> {
    value.map_or(Ok(default), |v| v.parse())
}

fn parse_bool(value: &str) -> bool {
    matches!(value.to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on")
}

/// Tuning knobs, loaded from an optional TOML file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub health: HealthSettings,
    pub process: ProcessSettings,
    pub warmup: WarmupSettings,
    pub install: InstallSettings,
}

impl OrchestratorConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> InferletResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            InferletError::Configuration(format!("Failed to read config file {}: {}", path.display(), e))
        })?;
        toml::from_str(&content)
            .map_err(|e| InferletError::Configuration(format!("Failed to parse config: {}", e)))
    }
}

/// Health gate configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthSettings {
    /// Host the server's health endpoints listen on
    pub host: String,
    /// Equivalent health paths; the first success of any counts
    pub paths: Vec<String>,
    pub timeout_secs: u64,
    pub interval_secs: u64,
    /// Per-request timeout
    pub request_timeout_secs: u64,
}

impl Default for HealthSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            paths: vec!["/healthz".to_string(), "/health".to_string()],
            timeout_secs: 600,
            interval_secs: 2,
            request_timeout_secs: 5,
        }
    }
}

/// Server process configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessSettings {
    /// Program and arguments that start the inference server
    pub server_command: Vec<String>,
    /// Time between SIGTERM and SIGKILL
    pub stop_grace_secs: u64,
    /// Rotate `server.log` once it grows past this many bytes
    pub log_max_bytes: u64,
    /// Bytes kept from the end of the log when rotating
    pub log_keep_bytes: u64,
}

impl Default for ProcessSettings {
    fn default() -> Self {
        Self {
            server_command: vec!["python".to_string(), "-m".to_string(), "server".to_string()],
            stop_grace_secs: 30,
            log_max_bytes: 100 * 1024 * 1024,
            log_keep_bytes: 10 * 1024 * 1024,
        }
    }
}

/// Warmup and benchmark probe configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WarmupSettings {
    pub enabled: bool,
    /// Attempt ceiling for each warmup variant
    pub retries: u32,
    /// Attempt ceiling for each benchmark variant
    pub bench_retries: u32,
    /// Variants (persona, voice, ...) each phase is repeated for
    pub variants: Vec<String>,
    /// External warmup command; `{variant}` and `{url}` are substituted
    pub warmup_command: Option<Vec<String>>,
    /// External benchmark command; `{variant}` and `{url}` are substituted
    pub bench_command: Option<Vec<String>>,
    /// Path the built-in HTTP probe posts to
    pub probe_path: String,
    /// Concurrent requests the built-in benchmark issues
    pub bench_concurrency: usize,
    pub request_timeout_secs: u64,
}

impl Default for WarmupSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            retries: 3,
            bench_retries: 2,
            variants: vec!["default".to_string()],
            warmup_command: None,
            bench_command: None,
            probe_path: "/v1/chat/completions".to_string(),
            bench_concurrency: 8,
            request_timeout_secs: 120,
        }
    }
}

/// Dependency installation configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InstallSettings {
    /// Interpreter used to create the environment
    pub python: String,
    /// Retry policy for network-bound install steps
    pub retry: RetryPolicy,
    /// Version overrides keyed by engine (`trt`, `vllm`) then package name
    pub pins: BTreeMap<String, BTreeMap<String, String>>,
}

impl Default for InstallSettings {
    fn default() -> Self {
        Self {
            python: "python3".to_string(),
            retry: RetryPolicy::default(),
            pins: BTreeMap::new(),
        }
    }
}

/// Well-known locations inside a deployment root
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeploymentPaths {
    root: PathBuf,
}

impl DeploymentPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn pid_file(&self) -> PathBuf {
        self.root.join("server.pid")
    }

    pub fn log_file(&self) -> PathBuf {
        self.root.join("server.log")
    }

    pub fn run_dir(&self) -> PathBuf {
        self.root.join(".run")
    }

    pub fn snapshot_file(&self) -> PathBuf {
        self.run_dir().join("last_config.env")
    }

    pub fn warmup_lock(&self) -> PathBuf {
        self.run_dir().join("warmup.lock")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.root.join("logs")
    }

    pub fn warmup_rollup(&self) -> PathBuf {
        self.logs_dir().join("warmup.log")
    }

    /// Python environment the engine's packages are installed into
    pub fn venv_dir(&self) -> PathBuf {
        self.root.join(".venv")
    }

    /// Downloaded model weights
    pub fn models_dir(&self) -> PathBuf {
        self.root.join(".cache").join("huggingface")
    }

    /// Cached artifacts that are only valid for one engine and config
    pub fn engine_artifacts(&self, engine: Engine) -> Vec<PathBuf> {
        let cache = self.root.join(".cache");
        let mut paths = match engine {
            Engine::Trt => vec![cache.join("trt_engines"), cache.join("trt_checkpoints")],
            Engine::Vllm => vec![cache.join("vllm"), cache.join("torch_compile")],
        };
        paths.push(cache.join("quantized"));
        paths.push(self.venv_dir());
        paths
    }

    /// Artifacts of every engine, deduplicated
    pub fn all_engine_artifacts(&self) -> Vec<PathBuf> {
        let mut paths = self.engine_artifacts(Engine::Trt);
        for path in self.engine_artifacts(Engine::Vllm) {
            if !paths.contains(&path) {
                paths.push(path);
            }
        }
        paths
    }
}

/// `.env` in the deployment root, else in `fallback_dir`
fn env_file(root: &Path, fallback_dir: Option<&Path>) -> Option<PathBuf> {
    std::iter::once(root)
        .chain(fallback_dir)
        .map(|dir| dir.join(".env"))
        .find(|path| path.is_file())
}
