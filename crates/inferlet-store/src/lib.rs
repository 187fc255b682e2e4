//! inferlet-store: Deployment state persistence
//!
//! This crate owns the on-disk state of a deployment root:
//! - Last successful deployment snapshot
//! - Atomic whole-file replacement
//! - Full wipe of engine artifacts and caches

pub mod atomic;
pub mod snapshot;
pub mod wipe;

pub use atomic::write_atomic;
pub use snapshot::{SnapshotRecord, SnapshotStore};
pub use wipe::{WipeReport, Wiper};
