//! Restart decisions
//!
//! [`decide`] compares the desired deployment with the last successful one and
//! picks the cheapest safe transition. It is pure and never stored.

use inferlet_core::DeploymentConfig;
use serde::Serialize;
use std::fmt;

/// What to do with the current deployment before starting the new one
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RestartDecision {
    /// Nothing to tear down
    NoOp,
    /// Stop and start again, keeping every cache
    LightRestart,
    /// Stop and delete engine artifacts before starting
    FullWipe,
}

impl RestartDecision {
    pub fn as_str(&self) -> &'static str {
        match self {
            RestartDecision::NoOp => "no-op",
            RestartDecision::LightRestart => "light restart",
            RestartDecision::FullWipe => "full wipe",
        }
    }
}

impl fmt::Display for RestartDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Tracked fields that differ between `desired` and `snapshot`
pub fn changed_fields(desired: &DeploymentConfig, snapshot: &DeploymentConfig) -> Vec<&'static str> {
    let mut changed = Vec::new();
    if desired.deploy_mode != snapshot.deploy_mode {
        changed.push("deploy_mode");
    }
    if desired.chat_model != snapshot.chat_model {
        changed.push("chat_model");
    }
    if desired.tool_model != snapshot.tool_model {
        changed.push("tool_model");
    }
    if desired.quantization_plan.backend != snapshot.quantization_plan.backend {
        changed.push("quantization_backend");
    }
    if desired.quantization != snapshot.quantization {
        changed.push("chat_quantization");
    }
    if desired.engine != snapshot.engine {
        changed.push("engine");
    }
    changed
}

/// Decide how to get from `snapshot` to `desired`.
///
/// An engine change always wipes, even with nothing running, since the two
/// engines cannot share installed packages or compiled artifacts.
pub fn decide(desired: &DeploymentConfig, snapshot: Option<&DeploymentConfig>, running: bool) -> RestartDecision {
    let Some(snapshot) = snapshot else {
        return RestartDecision::NoOp;
    };
    if desired.engine != snapshot.engine {
        return RestartDecision::FullWipe;
    }
    if !running {
        return RestartDecision::NoOp;
    }
    if changed_fields(desired, snapshot).is_empty() {
        RestartDecision::LightRestart
    } else {
        RestartDecision::FullWipe
    }
}
