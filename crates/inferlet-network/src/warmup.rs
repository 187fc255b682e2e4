//! Warmup orchestration
//!
//! Each phase is attempted per variant up to its ceiling, stopping at the first
//! success. A phase passes if any attempt within the ceiling succeeded; the run
//! passes if every phase of every variant passed. Failures never stop the
//! server, they are reported through the rollup log.

use chrono::Utc;
use inferlet_core::{retry, InferletResult, RetryPolicy, WarmupSettings};
use inferlet_store::write_atomic;
use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::{debug, error, info, warn};

use crate::lock::WarmupLock;
use crate::probe::{Phase, WarmupProbe};

/// One probe attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WarmupRun {
    pub phase: Phase,
    pub variant: String,
    pub attempt: u32,
    pub success: bool,
    pub log_path: PathBuf,
}

/// Pass/fail of one phase for one variant
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhaseResult {
    pub phase: Phase,
    pub variant: String,
    pub passed: bool,
    pub attempts: u32,
}

/// All attempts of a completed run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WarmupReport {
    pub runs: Vec<WarmupRun>,
    pub phases: Vec<PhaseResult>,
}

impl WarmupReport {
    pub fn passed(&self) -> bool {
        self.phases.iter().all(|p| p.passed)
    }

    /// `phase/variant` of every failed phase
    pub fn failures(&self) -> Vec<String> {
        self.phases
            .iter()
            .filter(|p| !p.passed)
            .map(|p| format!("{}/{}", p.phase, p.variant))
            .collect()
    }
}

/// How a warmup call ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WarmupOutcome {
    /// Another live process holds the warmup lock
    Skipped { holder: Option<u32> },
    /// Warmup is turned off
    Disabled,
    Completed(WarmupReport),
}

/// Runs warmup sweeps against one deployment root's server
pub struct WarmupOrchestrator {
    lock: WarmupLock,
    logs_dir: PathBuf,
    rollup: PathBuf,
    probe: Arc<dyn WarmupProbe>,
}

impl WarmupOrchestrator {
    pub fn new(
        lock_path: impl Into<PathBuf>,
        logs_dir: impl Into<PathBuf>,
        rollup: impl Into<PathBuf>,
        probe: Arc<dyn WarmupProbe>,
    ) -> Self {
        Self {
            lock: WarmupLock::new(lock_path),
            logs_dir: logs_dir.into(),
            rollup: rollup.into(),
            probe,
        }
    }

    /// Run every configured phase and variant under the warmup lock
    pub async fn run_warmup(&self, settings: &WarmupSettings) -> InferletResult<WarmupOutcome> {
        if !settings.enabled {
            debug!("Warmup disabled");
            return Ok(WarmupOutcome::Disabled);
        }

        let Some(_guard) = self.lock.acquire(std::process::id())? else {
            return Ok(WarmupOutcome::Skipped {
                holder: self.lock.holder()?,
            });
        };

        fs::create_dir_all(&self.logs_dir)?;
        self.clear_attempt_logs()?;

        let variants: Vec<String> = if settings.variants.is_empty() {
            vec!["default".to_string()]
        } else {
            settings.variants.clone()
        };

        let mut report = WarmupReport::default();
        let mut counters = [0u32; 2];
        for variant in &variants {
            for (index, phase, ceiling) in [
                (0, Phase::Warmup, settings.retries),
                (1, Phase::Benchmark, settings.bench_retries),
            ] {
                if ceiling == 0 {
                    continue;
                }
                let result = self
                    .run_phase(phase, variant, ceiling, &mut counters[index], &mut report.runs)
                    .await?;
                if result.passed {
                    info!(phase = %phase, variant = %variant, attempts = result.attempts, "Phase passed");
                } else {
                    error!(phase = %phase, variant = %variant, attempts = result.attempts, "Phase failed");
                }
                report.phases.push(result);
            }
        }

        self.write_rollup(&report)?;
        if report.passed() {
            info!(phases = report.phases.len(), "Warmup passed");
        } else {
            warn!(
                failed = ?report.failures(),
                rollup = %self.rollup.display(),
                "Warmup failed; the server keeps running"
            );
        }
        Ok(WarmupOutcome::Completed(report))
    }

    /// Attempt `phase` up to `ceiling` times, stopping at the first success
    async fn run_phase(
        &self,
        phase: Phase,
        variant: &str,
        ceiling: u32,
        counter: &mut u32,
        runs: &mut Vec<WarmupRun>,
    ) -> InferletResult<PhaseResult> {
        let attempts = Mutex::new(Vec::new());
        let first_log = *counter + 1;

        let result = retry(
            &RetryPolicy::immediate(ceiling),
            |_: &String| true,
            |attempt| {
                let attempts = &attempts;
                async move {
                    let outcome = self.probe.run(phase, variant, attempt).await;
                    let log_path = self
                        .logs_dir
                        .join(format!("{}_{}.log", phase.log_prefix(), first_log + attempt - 1));
                    let header = format!(
                        "# {} variant={} attempt={}/{} at {} result={}\n",
                        phase,
                        variant,
                        attempt,
                        ceiling,
                        Utc::now().to_rfc3339(),
                        if outcome.success { "pass" } else { "fail" }
                    );
                    let written = write_atomic(&log_path, format!("{}{}", header, outcome.output).as_bytes());
                    if let Err(e) = &written {
                        warn!(path = %log_path.display(), error = %e, "Failed to write attempt log");
                    }

                    if let Ok(mut attempts) = attempts.lock() {
                        attempts.push(WarmupRun {
                            phase,
                            variant: variant.to_string(),
                            attempt,
                            success: outcome.success,
                            log_path: log_path.clone(),
                        });
                    }

                    if outcome.success {
                        Ok(())
                    } else {
                        Err(format!("{} attempt {} failed, see {}", phase, attempt, log_path.display()))
                    }
                }
            },
        )
        .await;

        let attempts = attempts.into_inner().unwrap_or_else(|poisoned| poisoned.into_inner());
        *counter += attempts.len() as u32;
        let tried = attempts.len() as u32;
        runs.extend(attempts);

        Ok(PhaseResult {
            phase,
            variant: variant.to_string(),
            passed: result.is_ok(),
            attempts: tried,
        })
    }

    /// Drop attempt logs of an earlier run so numbering starts fresh
    fn clear_attempt_logs(&self) -> InferletResult<()> {
        for entry in fs::read_dir(&self.logs_dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            let is_attempt_log = (name.starts_with("warmup_run_") || name.starts_with("bench_run_"))
                && name.ends_with(".log");
            if is_attempt_log {
                fs::remove_file(entry.path())?;
            }
        }
        Ok(())
    }

    fn write_rollup(&self, report: &WarmupReport) -> InferletResult<()> {
        let mut out = String::new();
        let _ = writeln!(out, "# warmup run at {}", Utc::now().to_rfc3339());
        for run in &report.runs {
            let _ = writeln!(
                out,
                "{:<9} variant={} attempt={} {} {}",
                run.phase.as_str(),
                run.variant,
                run.attempt,
                if run.success { "PASS" } else { "FAIL" },
                display_relative(&run.log_path, &self.logs_dir)
            );
        }
        for phase in &report.phases {
            let _ = writeln!(
                out,
                "phase {} variant={}: {} after {} attempt(s)",
                phase.phase,
                phase.variant,
                if phase.passed { "PASS" } else { "FAIL" },
                phase.attempts
            );
        }
        let _ = writeln!(out, "overall: {}", if report.passed() { "PASS" } else { "FAIL" });
        write_atomic(&self.rollup, out.as_bytes())
    }
}

fn display_relative(path: &Path, base: &Path) -> String {
    path.strip_prefix(base).unwrap_or(path).display().to_string()
}
