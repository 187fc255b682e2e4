//! Last successful deployment
//!
//! The snapshot is a `KEY=value` file under `.run/`. It is replaced atomically
//! and only written after the server answered its health check, so it always
//! describes a deployment that actually came up.

use chrono::{DateTime, Utc};
use inferlet_core::{
    BatchLimits, DeploymentConfig, InferletError, InferletResult, QuantizationPlan,
};
use std::collections::HashMap;
use std::fmt::Write as _;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::{debug, info};

use crate::atomic::write_atomic;

const ENGINE: &str = "ENGINE";
const DEPLOY_MODE: &str = "DEPLOY_MODE";
const CHAT_MODEL: &str = "CHAT_MODEL";
const TOOL_MODEL: &str = "TOOL_MODEL";
const QUANTIZATION: &str = "QUANTIZATION";
const QUANT_MODE: &str = "QUANT_MODE";
const QUANT_BACKEND: &str = "QUANT_BACKEND";
const KV_CACHE_DTYPE: &str = "KV_CACHE_DTYPE";
const ATTENTION_BACKEND: &str = "ATTENTION_BACKEND";
const MAX_NUM_SEQS: &str = "MAX_NUM_SEQS";
const MAX_BATCHED_TOKENS: &str = "MAX_BATCHED_TOKENS";
const GPU_MEMORY_FRACTION: &str = "GPU_MEMORY_FRACTION";
const GPU_SM_ARCH: &str = "GPU_SM_ARCH";
const DEPLOYED_AT: &str = "DEPLOYED_AT";

/// A stored snapshot with its write time
#[derive(Debug, Clone, PartialEq)]
pub struct SnapshotRecord {
    pub config: DeploymentConfig,
    pub deployed_at: DateTime<Utc>,
}

/// Reads and writes the snapshot file of one deployment root
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    path: PathBuf,
}

impl SnapshotStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Persist `config` as the last successful deployment
    pub fn write(&self, config: &DeploymentConfig) -> InferletResult<()> {
        self.write_at(config, Utc::now())
    }

    fn write_at(&self, config: &DeploymentConfig, deployed_at: DateTime<Utc>) -> InferletResult<()> {
        let contents = render(config, deployed_at)?;
        write_atomic(&self.path, contents.as_bytes())?;
        info!(
            path = %self.path.display(),
            engine = config.engine.as_str(),
            backend = %config.quantization_plan.backend,
            "Wrote deployment snapshot"
        );
        Ok(())
    }

    /// Last successful deployment, `None` when there is none
    pub fn read(&self) -> InferletResult<Option<DeploymentConfig>> {
        Ok(self.read_record()?.map(|record| record.config))
    }

    /// Like [`read`](Self::read), including the write time
    pub fn read_record(&self) -> InferletResult<Option<SnapshotRecord>> {
        if !self.path.exists() {
            debug!(path = %self.path.display(), "No deployment snapshot");
            return Ok(None);
        }

        let mut values = HashMap::new();
        for item in dotenvy::from_path_iter(&self.path)? {
            let (key, value) = item?;
            values.insert(key, value);
        }
        parse(&values).map(Some).map_err(|e| {
            InferletError::Serialization(format!("{}: {}", self.path.display(), e))
        })
    }

    /// Forget the last deployment
    pub fn remove(&self) -> InferletResult<()> {
        match fs::remove_file(&self.path) {
            Ok(()) => {
                info!(path = %self.path.display(), "Removed deployment snapshot");
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

fn is_safe(value: &str) -> bool {
    value
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-' | '/' | ':' | '+' | '@'))
}

/// Quote `value` when it contains anything outside the safe set
fn quote(key: &str, value: &str) -> InferletResult<String> {
    if value.contains(|c| matches!(c, '\'' | '\n' | '\r')) {
        return Err(InferletError::Configuration(format!(
            "{} value {:?} cannot be stored: it contains a quote or newline",
            key, value
        )));
    }
    if is_safe(value) {
        Ok(value.to_string())
    } else {
        Ok(format!("'{}'", value))
    }
}

fn render(config: &DeploymentConfig, deployed_at: DateTime<Utc>) -> InferletResult<String> {
    let plan = &config.quantization_plan;
    let limits = &plan.batch_limits;
    let entries: [(&str, String); 14] = [
        (ENGINE, config.engine.as_str().to_string()),
        (DEPLOY_MODE, config.deploy_mode.as_str().to_string()),
        (CHAT_MODEL, config.chat_model.clone().unwrap_or_default()),
        (TOOL_MODEL, config.tool_model.clone().unwrap_or_default()),
        (QUANTIZATION, config.quantization.as_str().to_string()),
        (QUANT_MODE, plan.mode.as_str().to_string()),
        (QUANT_BACKEND, plan.backend.as_str().to_string()),
        (KV_CACHE_DTYPE, plan.kv_cache_dtype.as_str().to_string()),
        (ATTENTION_BACKEND, plan.attention_backend.as_str().to_string()),
        (MAX_NUM_SEQS, limits.max_num_seqs.to_string()),
        (MAX_BATCHED_TOKENS, limits.max_batched_tokens.to_string()),
        (GPU_MEMORY_FRACTION, limits.gpu_memory_fraction.to_string()),
        (GPU_SM_ARCH, config.gpu_sm_arch.to_string()),
        (DEPLOYED_AT, deployed_at.to_rfc3339()),
    ];

    let mut out = String::new();
    for (key, value) in entries {
        let _ = writeln!(out, "{}={}", key, quote(key, &value)?);
    }
    Ok(out)
}

fn field<T>(values: &HashMap<String, String>, key: &str) -> Result<T, String>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let raw = values.get(key).ok_or_else(|| format!("missing {}", key))?;
    raw.parse().map_err(|e| format!("invalid {}: {}", key, e))
}

fn optional(values: &HashMap<String, String>, key: &str) -> Option<String> {
    values.get(key).filter(|v| !v.is_empty()).cloned()
}

fn parse(values: &HashMap<String, String>) -> Result<SnapshotRecord, String> {
    let config = DeploymentConfig {
        engine: field(values, ENGINE)?,
        deploy_mode: field(values, DEPLOY_MODE)?,
        chat_model: optional(values, CHAT_MODEL),
        tool_model: optional(values, TOOL_MODEL),
        quantization: field(values, QUANTIZATION)?,
        quantization_plan: QuantizationPlan {
            mode: field(values, QUANT_MODE)?,
            backend: field(values, QUANT_BACKEND)?,
            kv_cache_dtype: field(values, KV_CACHE_DTYPE)?,
            attention_backend: field(values, ATTENTION_BACKEND)?,
            batch_limits: BatchLimits {
                max_num_seqs: field(values, MAX_NUM_SEQS)?,
                max_batched_tokens: field(values, MAX_BATCHED_TOKENS)?,
                gpu_memory_fraction: field(values, GPU_MEMORY_FRACTION)?,
            },
        },
        gpu_sm_arch: field(values, GPU_SM_ARCH)?,
    };

    let deployed_at = values
        .get(DEPLOYED_AT)
        .ok_or_else(|| format!("missing {}", DEPLOYED_AT))?;
    let deployed_at = DateTime::parse_from_rfc3339(deployed_at)
        .map_err(|e| format!("invalid {}: {}", DEPLOYED_AT, e))?
        .with_timezone(&Utc);

    Ok(SnapshotRecord {
        config,
        deployed_at,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use inferlet_core::{
        AttentionBackend, DeployMode, Engine, KvCacheDtype, QuantBackend, QuantMode, QuantRequest,
        SmArch,
    };

    fn config() -> DeploymentConfig {
        DeploymentConfig {
            deploy_mode: DeployMode::Both,
            chat_model: Some("meta-llama/Llama-3.1-8B-Instruct".to_string()),
            tool_model: Some("org/tool-classifier".to_string()),
            engine: Engine::Trt,
            quantization: QuantRequest::Auto,
            quantization_plan: QuantizationPlan {
                mode: QuantMode::EightBit,
                backend: QuantBackend::Fp8,
                kv_cache_dtype: KvCacheDtype::Fp8,
                attention_backend: AttentionBackend::TrtLlm,
                batch_limits: BatchLimits {
                    max_num_seqs: 64,
                    max_batched_tokens: 16_384,
                    gpu_memory_fraction: 0.7,
                },
            },
            gpu_sm_arch: SmArch(90),
        }
    }

    fn store() -> (tempfile::TempDir, SnapshotStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::new(dir.path().join(".run").join("last_config.env"));
        (dir, store)
    }

    #[test]
    fn test_missing_snapshot_reads_none() {
        let (_dir, store) = store();
        assert_eq!(store.read().unwrap(), None);
        store.remove().unwrap();
    }

    #[test]
    fn test_write_then_read() {
        let (_dir, store) = store();
        let config = config();
        store.write(&config).unwrap();
        assert_eq!(store.read().unwrap(), Some(config));
    }

    #[test]
    fn test_tool_only_without_chat_model() {
        let (_dir, store) = store();
        let mut config = config();
        config.deploy_mode = DeployMode::Tool;
        config.chat_model = None;
        config.quantization_plan.mode = QuantMode::ToolOnly;
        config.quantization_plan.backend = QuantBackend::None;
        config.quantization_plan.batch_limits.gpu_memory_fraction = 0.9;
        store.write(&config).unwrap();
        assert_eq!(store.read().unwrap(), Some(config));
    }

    #[test]
    fn test_unsafe_values_are_quoted() {
        let (_dir, store) = store();
        let mut config = config();
        config.chat_model = Some("/models/my model $HOME #1".to_string());
        store.write(&config).unwrap();

        let raw = fs::read_to_string(store.path()).unwrap();
        assert!(raw.contains("CHAT_MODEL='/models/my model $HOME #1'"));
        assert!(raw.contains("ENGINE=trt\n"));
        assert_eq!(store.read().unwrap(), Some(config));
    }

    #[test]
    fn test_quotes_are_rejected() {
        let (_dir, store) = store();
        let mut config = config();
        config.chat_model = Some("it's".to_string());
        assert!(matches!(store.write(&config), Err(InferletError::Configuration(_))));
        assert!(!store.path().exists());
    }

    #[test]
    fn test_deployed_at_round_trips() {
        let (_dir, store) = store();
        let at = DateTime::parse_from_rfc3339("2026-01-02T03:04:05Z")
            .unwrap()
            .with_timezone(&Utc);
        store.write_at(&config(), at).unwrap();
        assert_eq!(store.read_record().unwrap().unwrap().deployed_at, at);
    }

    #[test]
    fn test_corrupt_snapshot_is_an_error() {
        let (_dir, store) = store();
        write_atomic(store.path(), b"ENGINE=trt\nDEPLOY_MODE=sideways\n").unwrap();
        assert!(matches!(store.read(), Err(InferletError::Serialization(_))));
    }

    #[test]
    fn test_remove() {
        let (_dir, store) = store();
        store.write(&config()).unwrap();
        store.remove().unwrap();
        assert_eq!(store.read().unwrap(), None);
    }
}
