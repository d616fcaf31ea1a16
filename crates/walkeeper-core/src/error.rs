//! Configuration error types.

use thiserror::Error;

pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    /// Auto-remediation must happen before users are alerted.
    #[error(
        "CHECKPOINT_THRESHOLD ({auto_mb} MB) must not exceed WAL_SIZE_WARN ({warn_mb} MB)"
    )]
    AutoCheckpointAboveWarning { auto_mb: u64, warn_mb: u64 },

    #[error("WAL_SIZE_WARN ({warn_mb} MB) must be below WAL_SIZE_CRITICAL ({critical_mb} MB)")]
    WarningAboveCritical { warn_mb: u64, critical_mb: u64 },

    #[error("invalid {key}: {message}")]
    InvalidValue { key: &'static str, message: String },
}

impl ConfigError {
    pub fn invalid(key: &'static str, message: impl Into<String>) -> Self {
        Self::InvalidValue {
            key,
            message: message.into(),
        }
    }
}
