//! inferlet-deps: Dependency state resolution
//!
//! This crate decides which engine packages need work:
//! - Installed-vs-required comparison and install planning
//! - Per-engine requirement manifests
//! - Plan execution through a package manager, with retry on network failures

pub mod installer;
pub mod manifest;
pub mod resolver;

pub use installer::{InstallOptions, InstallReport, InstallStepError, Installer, PackageManager, PipPackageManager};
pub use manifest::{requirements_for, torch_index_url, Requirement};
pub use resolver::{check, plan, strip_local_version, DependencySpec, DependencyStatus, InstallPlan};
