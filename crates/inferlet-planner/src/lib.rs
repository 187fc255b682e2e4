//! inferlet-planner: Deployment planning
//!
//! This crate turns detected hardware and requested settings into decisions:
//! - Quantization backend, KV-cache dtype and attention kernel
//! - Batch and memory limits
//! - Whether a redeploy is a no-op, a light restart or a full wipe

pub mod attention;
pub mod limits;
pub mod quant;
pub mod restart;

pub use attention::{choose_attention, KernelProbe, PythonKernelProbe};
pub use limits::batch_limits;
pub use quant::QuantResolver;
pub use restart::{changed_fields, decide, RestartDecision};
