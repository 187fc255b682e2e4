//! Installed-vs-required comparison
//!
//! Read-only: nothing here installs anything. Skipping a satisfied package only
//! avoids redundant work and never changes the final installed state.

use serde::Serialize;
use std::fmt;

/// Installed state of one package relative to its requirement
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DependencyStatus {
    Satisfied,
    Missing,
    WrongVersion,
}

impl fmt::Display for DependencyStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DependencyStatus::Satisfied => write!(f, "satisfied"),
            DependencyStatus::Missing => write!(f, "missing"),
            DependencyStatus::WrongVersion => write!(f, "wrong version"),
        }
    }
}

/// One package's requirement and installed state, recomputed every run
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DependencySpec {
    pub name: String,
    pub required_version: String,
    pub installed_version: Option<String>,
    pub status: DependencyStatus,
}

impl DependencySpec {
    /// `name==version` for the package manager
    pub fn requirement(&self) -> String {
        format!("{}=={}", self.name, self.required_version)
    }
}

/// Drop a local version label such as `+cu130`
pub fn strip_local_version(version: &str) -> &str {
    let version = version.trim();
    version.split_once('+').map_or(version, |(public, _)| public)
}

/// Compare the installed version of `name` against `required`.
///
/// Versions match only when equal after stripping local labels; there is no
/// range matching.
pub fn check<F>(name: &str, required: &str, query_installed: F) -> DependencySpec
where
    F: FnOnce(&str) -> Option<String>,
{
    let installed_version = query_installed(name);
    let status = match installed_version.as_deref() {
        None => DependencyStatus::Missing,
        Some(installed) if strip_local_version(installed) == strip_local_version(required) => {
            DependencyStatus::Satisfied
        }
        Some(_) => DependencyStatus::WrongVersion,
    };

    DependencySpec {
        name: name.to_string(),
        required_version: required.to_string(),
        installed_version,
        status,
    }
}

/// Work needed to reach the required state
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstallPlan {
    /// Packages to install, in requirement order
    pub install: Vec<DependencySpec>,
    /// Packages to remove before installing, so two versions never coexist
    pub uninstall_first: Vec<DependencySpec>,
    /// Reinstall even when the installed version matches
    pub force: bool,
}

impl InstallPlan {
    pub fn is_empty(&self) -> bool {
        self.install.is_empty() && self.uninstall_first.is_empty()
    }
}

/// Turn checked specs into an install plan
pub fn plan(specs: &[DependencySpec], force: bool) -> InstallPlan {
    if force {
        return InstallPlan {
            install: specs.to_vec(),
            uninstall_first: Vec::new(),
            force: true,
        };
    }

    let mut plan = InstallPlan::default();
    for spec in specs {
        match spec.status {
            DependencyStatus::Satisfied => {}
            DependencyStatus::Missing => plan.install.push(spec.clone()),
            DependencyStatus::WrongVersion => {
                plan.uninstall_first.push(spec.clone());
                plan.install.push(spec.clone());
            }
        }
    }
    plan
}

#[cfg(test)]
mod tests {
    use super::*;

    fn installed(version: &'static str) -> impl FnOnce(&str) -> Option<String> {
        move |_| Some(version.to_string())
    }

    #[test]
    fn test_local_suffix_is_ignored() {
        let spec = check("torch", "2.9.1", installed("2.9.1+cu130"));
        assert_eq!(spec.status, DependencyStatus::Satisfied);
        assert_eq!(spec.installed_version.as_deref(), Some("2.9.1+cu130"));
    }

    #[test]
    fn test_different_version_is_wrong() {
        let spec = check("torch", "2.9.1", installed("2.8.0+cu124"));
        assert_eq!(spec.status, DependencyStatus::WrongVersion);
    }

    #[test]
    fn test_no_range_matching() {
        assert_eq!(
            check("vllm", "0.11.0", installed("0.11.0.post1")).status,
            DependencyStatus::WrongVersion
        );
        assert_eq!(
            check("vllm", "0.11", installed("0.11.0")).status,
            DependencyStatus::WrongVersion
        );
    }

    #[test]
    fn test_missing() {
        let spec = check("flashinfer-python", "0.5.2", |_| None);
        assert_eq!(spec.status, DependencyStatus::Missing);
        assert_eq!(spec.requirement(), "flashinfer-python==0.5.2");
    }

    #[test]
    fn test_strip_local_version() {
        assert_eq!(strip_local_version("2.9.1+cu130"), "2.9.1");
        assert_eq!(strip_local_version(" 1.0 "), "1.0");
        assert_eq!(strip_local_version("1.0"), "1.0");
    }

    fn specs() -> Vec<DependencySpec> {
        vec![
            check("torch", "2.9.1", installed("2.9.1+cu130")),
            check("vllm", "0.11.0", |_| None),
            check("transformers", "4.57.1", installed("4.44.0")),
        ]
    }

    #[test]
    fn test_plan_skips_satisfied() {
        let plan = plan(&specs(), false);
        let install: Vec<&str> = plan.install.iter().map(|s| s.name.as_str()).collect();
        let uninstall: Vec<&str> = plan.uninstall_first.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(install, vec!["vllm", "transformers"]);
        assert_eq!(uninstall, vec!["transformers"]);
        assert!(!plan.force);
    }

    #[test]
    fn test_force_reinstalls_everything() {
        let plan = plan(&specs(), true);
        assert_eq!(plan.install.len(), 3);
        assert!(plan.uninstall_first.is_empty());
        assert!(plan.force);
    }

    #[test]
    fn test_empty_plan_when_all_satisfied() {
        let specs = vec![check("torch", "2.9.1", installed("2.9.1"))];
        assert!(plan(&specs, false).is_empty());
    }
}
