//! inferlet-core: Core types for the inferlet deployment control plane
//!
//! This crate provides the fundamental types used throughout inferlet:
//! - Deployment, engine and quantization types
//! - Settings and orchestrator configuration
//! - Error handling
//! - GPU and CUDA environment detection
//! - Model-name classification
//! - Retry with backoff

pub mod config;
pub mod cuda;
pub mod error;
pub mod gpu;
pub mod model;
pub mod naming;
pub mod retry;

pub use config::*;
pub use cuda::*;
pub use error::*;
pub use gpu::*;
pub use model::*;
pub use naming::*;
pub use retry::*;
