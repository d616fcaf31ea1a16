//! Error types for the database layer

use std::time::Duration;
use thiserror::Error;

/// Database error types
#[derive(Error, Debug)]
pub enum DbError {
    /// `SQLite` error from the embedded driver
    #[error("SQLite error: {0}")]
    Sqlite(String),

    /// The external `sqlite3` process exited unsuccessfully.
    #[error("sqlite3 exited with {status}: {stderr}")]
    Process { status: String, stderr: String },

    /// An operation exceeded its deadline and was abandoned.
    #[error("{operation} timed out after {:.1}s", .after.as_secs_f64())]
    Timeout {
        operation: String,
        after: Duration,
    },

    /// No usable driver (neither the embedded library nor the CLI).
    #[error("database driver unavailable: {0}")]
    Unavailable(String),

    /// The file does not exist.
    #[error("database not found: {0}")]
    NotFound(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for database operations
pub type DbResult<T> = std::result::Result<T, DbError>;

impl DbError {
    /// Whether this error indicates a retryable lock/busy condition.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Sqlite(msg) | Self::Process { stderr: msg, .. } => is_lock_error(msg),
            Self::Timeout { .. } => true,
            _ => false,
        }
    }

    /// Stable short code for structured output.
    #[must_use]
    pub const fn error_code(&self) -> &'static str {
        match self {
            Self::Sqlite(_) => "SQLITE_ERROR",
            Self::Process { .. } => "PROCESS_FAILED",
            Self::Timeout { .. } => "TIMEOUT",
            Self::Unavailable(_) => "BACKEND_UNAVAILABLE",
            Self::NotFound(_) => "NOT_FOUND",
            Self::Io(_) => "IO_ERROR",
        }
    }
}

/// Check whether an error message indicates a database lock/busy condition.
#[must_use]
pub fn is_lock_error(msg: &str) -> bool {
    let lower = msg.to_lowercase();
    lower.contains("database is locked")
        || lower.contains("database is busy")
        || lower.contains("database table is locked")
        || lower.contains("sqlite_busy")
}

impl From<rusqlite::Error> for DbError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Sqlite(e.to_string())
    }
}
