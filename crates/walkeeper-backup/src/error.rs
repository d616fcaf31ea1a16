//! Error types for locking and backups.

use std::path::PathBuf;
use thiserror::Error;
use walkeeper_db::DbError;

pub type Result<T> = std::result::Result<T, BackupError>;

#[derive(Debug, Error)]
pub enum LockError {
    /// A live, non-stale lock record exists for this database.
    #[error("{} is locked by {holder}", .path.display())]
    AlreadyLocked { path: PathBuf, holder: String },

    #[error("lock file {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Error)]
pub enum BackupError {
    #[error("source database not found: {}", .0.display())]
    SourceMissing(PathBuf),

    #[error("destination {} unavailable: {reason}", .path.display())]
    DestinationUnavailable { path: PathBuf, reason: String },

    #[error("backup {} failed verification: {}", .path.display(), .details.join("; "))]
    VerificationFailed { path: PathBuf, details: Vec<String> },

    #[error("backup already in progress: {0}")]
    LockConflict(LockError),

    #[error("no usable backup backend: {0}")]
    BackendUnavailable(String),

    #[error("backup backend failed: {0}")]
    Backend(#[from] DbError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<LockError> for BackupError {
    fn from(err: LockError) -> Self {
        match err {
            LockError::AlreadyLocked { .. } => Self::LockConflict(err),
            LockError::Io { source, .. } => Self::Io(source),
        }
    }
}

impl BackupError {
    /// Process exit code for the `backup` command.
    #[must_use]
    pub const fn exit_code(&self) -> i32 {
        match self {
            Self::SourceMissing(_) => 2,
            Self::DestinationUnavailable { .. } => 3,
            Self::VerificationFailed { .. } => 4,
            Self::LockConflict(_) => 5,
            Self::BackendUnavailable(_) | Self::Backend(_) | Self::Io(_) => 1,
        }
    }

    #[must_use]
    pub const fn error_code(&self) -> &'static str {
        match self {
            Self::SourceMissing(_) => "SOURCE_MISSING",
            Self::DestinationUnavailable { .. } => "DESTINATION_UNAVAILABLE",
            Self::VerificationFailed { .. } => "VERIFICATION_FAILED",
            Self::LockConflict(_) => "LOCK_CONFLICT",
            Self::BackendUnavailable(_) => "BACKEND_UNAVAILABLE",
            Self::Backend(_) => "BACKEND_FAILED",
            Self::Io(_) => "IO_ERROR",
        }
    }
}
