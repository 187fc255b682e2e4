//! inferlet-network: Health gating and warmup
//!
//! This crate talks to the freshly started server:
//! - Health polling across equivalent endpoints
//! - Warmup and benchmark probes (external command or built-in HTTP)
//! - Single-instance warmup runs with per-attempt logs and a rollup

pub mod health;
pub mod lock;
pub mod probe;
pub mod warmup;

pub use health::{await_health, HealthChecker};
pub use lock::{WarmupLock, WarmupLockGuard};
pub use probe::{CommandProbe, HttpProbe, Phase, ProbeOutcome, WarmupProbe};
pub use warmup::{PhaseResult, WarmupOrchestrator, WarmupOutcome, WarmupReport, WarmupRun};
