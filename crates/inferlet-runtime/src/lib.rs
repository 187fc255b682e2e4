//! inferlet-runtime: Server process supervision
//!
//! This crate runs the inference server as a detached OS process:
//! - PID file handling and liveness checks
//! - Detached start in a new session, graceful stop with escalation
//! - Server log rotation and following

pub mod logfile;
pub mod pidfile;
pub mod process;
pub mod traits;

pub use logfile::{follow, rotate_if_needed, tail_lines};
pub use pidfile::{pid_alive, PidFile};
pub use process::{LaunchSpec, ProcessSupervisor, ServerProcess};
pub use traits::ManagedProcess;
