//! inferlet-deployer: Deployment orchestration
//!
//! This crate wires the other crates into the deploy lifecycle:
//! - One immutable runtime context built from detection and settings
//! - Server launch parameters derived from the resolved configuration
//! - Deploy, stop, restart, status and dry-run planning

pub mod context;
pub mod deployer;
pub mod server;

pub use context::RuntimeContext;
pub use deployer::{carried_backend, DeployPlan, DeployReport, Deployer, StatusReport, StopReport};
pub use server::launch_spec;
