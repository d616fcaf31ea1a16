//! Database layer for walkeeper.
//!
//! - [`driver`]: the `DatabaseDriver` seam with embedded and `sqlite3` CLI
//!   implementations, chosen by capability probing
//! - [`checkpoint`]: WAL checkpointing in the four SQLite modes
//! - [`integrity`]: tiered verification of database files
//! - [`files`]: WAL/DB file sizes without opening the database
//! - [`retry`]: exponential backoff for lock/busy errors

#![forbid(unsafe_code)]

pub mod checkpoint;
pub mod driver;
pub mod error;
pub mod files;
pub mod integrity;
pub mod retry;

pub use checkpoint::{checkpoint, run_checkpoint, CheckpointRequest, CheckpointResult};
pub use driver::{
    driver_from_config, probe_driver, CliDriver, DatabaseDriver, DbSession, DriverKind,
    EmbeddedDriver, OpenMode,
};
pub use error::{DbError, DbResult};
pub use files::{inspect, wal_path, FileStats};
pub use integrity::{verify, VerificationResult, VerifyOptions};
pub use retry::{retry_sync, RetryPolicy};
