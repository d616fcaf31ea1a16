//! Verified backups for walkeeper.
//!
//! [`BackupOrchestrator::backup`] runs a [`BackupJob`] under the per-database
//! [`LockManager`] lock: inspect, optional checkpoint, copy with the selected
//! backend, optional gzip, verification, retention pruning.

#![forbid(unsafe_code)]

pub mod backend;
pub mod compress;
pub mod error;
pub mod lock;
pub mod orchestrator;
pub mod retention;

pub use backend::select_backend;
pub use error::{BackupError, LockError, Result};
pub use lock::{lock_path, release_all_held, LockGuard, LockManager, LockRecord, LockStatus};
pub use orchestrator::{BackupJob, BackupOrchestrator, BackupResult};
