//! Process abstraction

use async_trait::async_trait;
use inferlet_core::InferletResult;
use std::time::Duration;

use crate::process::{LaunchSpec, ServerProcess};

/// A long-running server owned by one deployment root
#[async_trait]
pub trait ManagedProcess: Send + Sync {
    /// Launch the server; fails if one is already running
    async fn start(&self, spec: &LaunchSpec) -> InferletResult<ServerProcess>;

    /// Stop the server, escalating after `grace`. Returns whether one was running.
    async fn stop(&self, grace: Duration) -> InferletResult<bool>;

    /// PID of the live server, if any
    fn is_alive(&self) -> InferletResult<Option<u32>>;

    /// Get the supervisor name
    fn name(&self) -> &'static str;
}
