//! Warmup and benchmark probes

use async_trait::async_trait;
use futures::future::join_all;
use inferlet_core::{InferletError, InferletResult};
use serde_json::json;
use std::fmt;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::process::Command;
use tracing::debug;

/// Smoke-test phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    /// A single request confirming the server answers real traffic
    Warmup,
    /// Concurrent synthetic load
    Benchmark,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Warmup => "warmup",
            Phase::Benchmark => "benchmark",
        }
    }

    /// Prefix of the per-attempt log file name
    pub fn log_prefix(&self) -> &'static str {
        match self {
            Phase::Warmup => "warmup_run",
            Phase::Benchmark => "bench_run",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of one probe attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeOutcome {
    pub success: bool,
    /// Captured output, written to the attempt's log
    pub output: String,
}

impl ProbeOutcome {
    pub fn pass(output: impl Into<String>) -> Self {
        Self {
            success: true,
            output: output.into(),
        }
    }

    pub fn fail(output: impl Into<String>) -> Self {
        Self {
            success: false,
            output: output.into(),
        }
    }
}

/// Sends smoke traffic to the server
#[async_trait]
pub trait WarmupProbe: Send + Sync {
    async fn run(&self, phase: Phase, variant: &str, attempt: u32) -> ProbeOutcome;
}

/// Runs an external command per phase. `{variant}` and `{url}` in the
/// arguments are substituted.
pub struct CommandProbe {
    warmup: Option<Vec<String>>,
    bench: Option<Vec<String>>,
    base_url: String,
    /// Used for phases without a command
    fallback: Option<Box<dyn WarmupProbe>>,
}

impl CommandProbe {
    pub fn new(
        warmup: Option<Vec<String>>,
        bench: Option<Vec<String>>,
        base_url: impl Into<String>,
    ) -> Self {
        Self {
            warmup,
            bench,
            base_url: base_url.into(),
            fallback: None,
        }
    }

    pub fn with_fallback(mut self, fallback: Box<dyn WarmupProbe>) -> Self {
        self.fallback = Some(fallback);
        self
    }

    fn command_for(&self, phase: Phase) -> Option<&Vec<String>> {
        match phase {
            Phase::Warmup => self.warmup.as_ref(),
            Phase::Benchmark => self.bench.as_ref(),
        }
    }

    fn render(&self, template: &[String], variant: &str) -> Vec<String> {
        template
            .iter()
            .map(|arg| arg.replace("{variant}", variant).replace("{url}", &self.base_url))
            .collect()
    }
}

#[async_trait]
impl WarmupProbe for CommandProbe {
    async fn run(&self, phase: Phase, variant: &str, attempt: u32) -> ProbeOutcome {
        let Some(template) = self.command_for(phase) else {
            return match &self.fallback {
                Some(fallback) => fallback.run(phase, variant, attempt).await,
                None => ProbeOutcome::pass(format!("no {} command configured", phase)),
            };
        };
        let argv = self.render(template, variant);
        let Some((program, args)) = argv.split_first() else {
            return ProbeOutcome::fail(format!("empty {} command", phase));
        };

        debug!(phase = %phase, variant, attempt, program = %program, "Running probe command");
        let output = Command::new(program)
            .args(args)
            .env("WARMUP_PHASE", phase.as_str())
            .env("WARMUP_VARIANT", variant)
            .env("WARMUP_ATTEMPT", attempt.to_string())
            .env("SERVER_URL", &self.base_url)
            .stdin(Stdio::null())
            .output()
            .await;

        match output {
            Ok(output) => {
                let mut text = format!("$ {}\n", argv.join(" "));
                text.push_str(&String::from_utf8_lossy(&output.stdout));
                text.push_str(&String::from_utf8_lossy(&output.stderr));
                text.push_str(&format!("\nexit: {}\n", output.status));
                ProbeOutcome {
                    success: output.status.success(),
                    output: text,
                }
            }
            Err(e) => ProbeOutcome::fail(format!("failed to run {}: {}", program, e)),
        }
    }
}

/// Built-in probe posting chat completions to the server
pub struct HttpProbe {
    client: reqwest::Client,
    url: String,
    api_key: String,
    model: String,
    concurrency: usize,
}

impl HttpProbe {
    pub fn new(
        url: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
        concurrency: usize,
        request_timeout: Duration,
    ) -> InferletResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .no_proxy()
            .build()
            .map_err(|e| InferletError::Configuration(format!("Failed to create HTTP client: {}", e)))?;
        Ok(Self {
            client,
            url: url.into(),
            api_key: api_key.into(),
            model: model.into(),
            concurrency: concurrency.max(1),
        })
    }

    /// One request; latency on success
    async fn request(&self, variant: &str, index: usize) -> Result<Duration, String> {
        let body = json!({
            "model": self.model,
            "messages": [
                {"role": "system", "content": format!("variant: {}", variant)},
                {"role": "user", "content": format!("Reply with the number {}.", index)},
            ],
            "max_tokens": 16,
            "temperature": 0,
        });

        let started = Instant::now();
        let response = self
            .client
            .post(&self.url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| e.to_string())?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(format!("HTTP {}: {}", status, text.trim()));
        }
        // drain the body so latency covers generation
        response.bytes().await.map_err(|e| e.to_string())?;
        Ok(started.elapsed())
    }
}

#[async_trait]
impl WarmupProbe for HttpProbe {
    async fn run(&self, phase: Phase, variant: &str, _attempt: u32) -> ProbeOutcome {
        match phase {
            Phase::Warmup => match self.request(variant, 0).await {
                Ok(latency) => ProbeOutcome::pass(format!(
                    "POST {} ok in {} ms\n",
                    self.url,
                    latency.as_millis()
                )),
                Err(e) => ProbeOutcome::fail(format!("POST {} failed: {}\n", self.url, e)),
            },
            Phase::Benchmark => {
                let started = Instant::now();
                let results = join_all((0..self.concurrency).map(|i| self.request(variant, i))).await;
                let wall = started.elapsed();

                let mut latencies = Vec::new();
                let mut output = String::new();
                for (i, result) in results.iter().enumerate() {
                    match result {
                        Ok(latency) => latencies.push(latency.as_millis()),
                        Err(e) => output.push_str(&format!("request {} failed: {}\n", i, e)),
                    }
                }
                latencies.sort_unstable();
                let ok = latencies.len();
                output.push_str(&format!(
                    "{}/{} requests ok, wall {} ms",
                    ok,
                    self.concurrency,
                    wall.as_millis()
                ));
                if let (Some(min), Some(max)) = (latencies.first(), latencies.last()) {
                    let median = latencies[ok / 2];
                    output.push_str(&format!(", latency min {} / p50 {} / max {} ms", min, median, max));
                }
                output.push('\n');

                ProbeOutcome {
                    success: ok == self.concurrency,
                    output,
                }
            }
        }
    }
}
