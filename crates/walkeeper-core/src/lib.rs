//! Core types, configuration, and metrics primitives for walkeeper.
//!
//! Everything here is shared by the database, backup, monitor and CLI crates:
//! the environment-driven [`Config`], the checkpoint/backup mode enums, the
//! injectable [`Clock`], and the lock-free metric cells used by the exporter.

#![forbid(unsafe_code)]

pub mod clock;
pub mod config;
pub mod error;
pub mod metrics;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{Config, DriverPreference, LogFormat};
pub use error::{ConfigError, ConfigResult};

use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// Bytes per MiB.
pub const MIB: u64 = 1024 * 1024;

/// SQLite checkpoint modes, weakest to strongest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum CheckpointMode {
    Passive,
    Full,
    Restart,
    Truncate,
}

impl CheckpointMode {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Passive => "PASSIVE",
            Self::Full => "FULL",
            Self::Restart => "RESTART",
            Self::Truncate => "TRUNCATE",
        }
    }

    /// Parse a mode name, case-insensitively.
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_uppercase().as_str() {
            "PASSIVE" => Some(Self::Passive),
            "FULL" => Some(Self::Full),
            "RESTART" => Some(Self::Restart),
            "TRUNCATE" => Some(Self::Truncate),
            _ => None,
        }
    }
}

impl std::fmt::Display for CheckpointMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which backup backend to run.
///
/// `Auto` defers the decision to the orchestrator, which inspects WAL size
/// relative to the database file before copying.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackupMode {
    Auto,
    /// `VACUUM INTO`: compact, transactionally consistent export.
    Snapshot,
    /// Online page-level copy while the database stays in use.
    OnlineCopy,
}

impl BackupMode {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Auto => "auto",
            Self::Snapshot => "snapshot",
            Self::OnlineCopy => "online_copy",
        }
    }

    /// Accepts both the backend names and the CLI aliases
    /// (`vacuum` for snapshot, `backup` for online copy).
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "auto" => Some(Self::Auto),
            "snapshot" | "vacuum" => Some(Self::Snapshot),
            "online_copy" | "online-copy" | "backup" => Some(Self::OnlineCopy),
            _ => None,
        }
    }
}

impl std::fmt::Display for BackupMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Microseconds since the Unix epoch.
#[must_use]
pub fn now_micros() -> i64 {
    let dur = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    i64::try_from(dur.as_micros()).unwrap_or(i64::MAX)
}

/// Convert a byte count to MiB as `f64`.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn bytes_to_mb(bytes: u64) -> f64 {
    bytes as f64 / MIB as f64
}

/// Convert a `Duration` to whole milliseconds, saturating.
#[must_use]
pub fn duration_ms(d: std::time::Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}
