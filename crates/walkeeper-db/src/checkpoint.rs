//! WAL checkpointing.
//!
//! One call is one attempt. A checkpoint that leaves WAL content behind
//! (active readers, `busy=1`) still succeeds; [`CheckpointResult::blocked`]
//! tells the caller to raise a warning.

use crate::driver::{query_scalar, DatabaseDriver, OpenMode};
use crate::error::{DbError, DbResult};
use crate::files::{file_size, wal_path};
use serde::Serialize;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use walkeeper_core::{duration_ms, CheckpointMode};

#[derive(Debug, Clone)]
pub struct CheckpointRequest {
    pub database_path: PathBuf,
    pub mode: CheckpointMode,
    pub busy_timeout: Duration,
    /// Wall-time bound on each statement of the checkpoint.
    pub timeout: Duration,
}

impl CheckpointRequest {
    #[must_use]
    pub fn new(database_path: impl Into<PathBuf>, mode: CheckpointMode) -> Self {
        Self {
            database_path: database_path.into(),
            mode,
            busy_timeout: Duration::from_millis(5_000),
            timeout: Duration::from_secs(30),
        }
    }

    #[must_use]
    pub const fn with_busy_timeout(mut self, busy_timeout: Duration) -> Self {
        self.busy_timeout = busy_timeout;
        self
    }

    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CheckpointResult {
    pub mode: CheckpointMode,
    pub wal_size_before: u64,
    pub wal_size_after: u64,
    pub duration_ms: u64,
    pub succeeded: bool,
    /// The database is not in WAL mode; nothing was done.
    pub skipped: bool,
    /// SQLite reported that the checkpoint could not complete.
    pub busy: bool,
    /// Frames in the WAL (`-1` when unknown).
    pub log_frames: i64,
    /// Frames moved into the database (`-1` when unknown).
    pub checkpointed_frames: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_detail: Option<String>,
}

impl CheckpointResult {
    fn failed(mode: CheckpointMode, wal_before: u64, wal_after: u64, elapsed: Duration, err: &DbError) -> Self {
        Self {
            mode,
            wal_size_before: wal_before,
            wal_size_after: wal_after,
            duration_ms: duration_ms(elapsed),
            succeeded: false,
            skipped: false,
            busy: err.is_retryable(),
            log_frames: -1,
            checkpointed_frames: -1,
            error_detail: Some(err.to_string()),
        }
    }

    /// Succeeded, but the WAL was not fully drained.
    #[must_use]
    pub fn blocked(&self) -> bool {
        self.succeeded
            && !self.skipped
            && (self.busy || (self.mode == CheckpointMode::Truncate && self.wal_size_after > 0))
    }
}

/// Run one checkpoint, propagating driver errors.
///
/// # Errors
///
/// Any failure to open the database or execute the pragma.
pub fn run_checkpoint(
    driver: &dyn DatabaseDriver,
    req: &CheckpointRequest,
) -> DbResult<CheckpointResult> {
    let start = Instant::now();
    let wal = wal_path(&req.database_path);
    let wal_before = file_size(&wal);

    let mut session = driver.open(&req.database_path, OpenMode::ReadWrite)?;
    session.set_statement_timeout(req.timeout)?;
    let journal = query_scalar(session.as_mut(), "PRAGMA journal_mode")?.unwrap_or_default();
    if !journal.eq_ignore_ascii_case("wal") {
        session.close()?;
        tracing::debug!(
            path = %req.database_path.display(),
            journal_mode = %journal,
            "not in WAL mode, checkpoint skipped"
        );
        return Ok(CheckpointResult {
            mode: req.mode,
            wal_size_before: wal_before,
            wal_size_after: file_size(&wal),
            duration_ms: duration_ms(start.elapsed()),
            succeeded: true,
            skipped: true,
            busy: false,
            log_frames: 0,
            checkpointed_frames: 0,
            error_detail: None,
        });
    }

    session.set_busy_timeout(req.busy_timeout)?;
    let row = session
        .query(&format!("PRAGMA wal_checkpoint({})", req.mode))?
        .into_iter()
        .next()
        .unwrap_or_default();
    // Sample the WAL before closing: the last connection to close may
    // checkpoint and remove it on its own.
    let wal_after = file_size(&wal);
    session.close()?;

    let field = |i: usize| -> i64 { row.get(i).and_then(|v| v.trim().parse().ok()).unwrap_or(-1) };
    let result = CheckpointResult {
        mode: req.mode,
        wal_size_before: wal_before,
        wal_size_after: wal_after,
        duration_ms: duration_ms(start.elapsed()),
        succeeded: true,
        skipped: false,
        busy: field(0) == 1,
        log_frames: field(1),
        checkpointed_frames: field(2),
        error_detail: None,
    };

    if result.blocked() {
        tracing::warn!(
            target: "maintenance",
            path = %req.database_path.display(),
            mode = %req.mode,
            wal_size_after = result.wal_size_after,
            log_frames = result.log_frames,
            checkpointed_frames = result.checkpointed_frames,
            "checkpoint blocked: WAL not fully drained"
        );
    } else {
        tracing::info!(
            target: "maintenance",
            path = %req.database_path.display(),
            mode = %req.mode,
            wal_size_before = result.wal_size_before,
            wal_size_after = result.wal_size_after,
            duration_ms = result.duration_ms,
            "checkpoint complete"
        );
    }
    Ok(result)
}

/// Run one checkpoint; failures are folded into the result
/// (`succeeded = false`, `error_detail` set).
#[must_use]
pub fn checkpoint(driver: &dyn DatabaseDriver, req: &CheckpointRequest) -> CheckpointResult {
    let start = Instant::now();
    let wal = wal_path(&req.database_path);
    let wal_before = file_size(&wal);
    run_checkpoint(driver, req).unwrap_or_else(|e| {
        tracing::error!(
            target: "maintenance",
            path = %req.database_path.display(),
            mode = %req.mode,
            error = %e,
            "checkpoint failed"
        );
        CheckpointResult::failed(req.mode, wal_before, file_size(&wal), start.elapsed(), &e)
    })
}

/// Failed result for an error raised outside [`checkpoint`] (retry wrappers).
#[must_use]
pub fn failed_result(req: &CheckpointRequest, elapsed: Duration, err: &DbError) -> CheckpointResult {
    let size = file_size(&wal_path(&req.database_path));
    CheckpointResult::failed(req.mode, size, size, elapsed, err)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::EmbeddedDriver;
    use rusqlite::Connection;
    use std::path::Path;

    /// Open a WAL database with autocheckpoint off and leave frames in the WAL.
    fn wal_db_with_frames(dir: &Path) -> (PathBuf, Connection) {
        let path = dir.join("app.db");
        let conn = Connection::open(&path).unwrap();
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;
             PRAGMA wal_autocheckpoint=0;
             CREATE TABLE t (id INTEGER PRIMARY KEY, payload BLOB);",
        )
        .unwrap();
        for _ in 0..50 {
            conn.execute("INSERT INTO t (payload) VALUES (zeroblob(4096))", [])
                .unwrap();
        }
        (path, conn)
    }

    #[test]
    fn truncate_drains_wal() {
        let dir = tempfile::tempdir().unwrap();
        let (path, writer) = wal_db_with_frames(dir.path());
        assert!(file_size(&wal_path(&path)) > 0);

        let req = CheckpointRequest::new(&path, CheckpointMode::Truncate);
        let result = checkpoint(&EmbeddedDriver, &req);
        assert!(result.succeeded, "{result:?}");
        assert!(!result.skipped);
        assert!(result.wal_size_before > 0);
        assert_eq!(result.wal_size_after, 0);
        assert!(!result.blocked());
        assert!(result.log_frames >= 0);
        drop(writer);
    }

    #[test]
    fn second_truncate_is_non_increasing() {
        let dir = tempfile::tempdir().unwrap();
        let (path, writer) = wal_db_with_frames(dir.path());
        let req = CheckpointRequest::new(&path, CheckpointMode::Truncate);
        let first = checkpoint(&EmbeddedDriver, &req);
        let second = checkpoint(&EmbeddedDriver, &req);
        assert!(first.succeeded && second.succeeded);
        assert!(second.wal_size_after <= first.wal_size_after);
        drop(writer);
    }

    #[test]
    fn passive_mode_succeeds() {
        let dir = tempfile::tempdir().unwrap();
        let (path, writer) = wal_db_with_frames(dir.path());
        let req = CheckpointRequest::new(&path, CheckpointMode::Passive);
        let result = checkpoint(&EmbeddedDriver, &req);
        assert!(result.succeeded);
        assert_eq!(result.mode, CheckpointMode::Passive);
        assert_eq!(result.log_frames, result.checkpointed_frames);
        drop(writer);
    }

    #[test]
    fn non_wal_database_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("plain.db");
        Connection::open(&path)
            .unwrap()
            .execute_batch("CREATE TABLE t (x);")
            .unwrap();
        let result = checkpoint(&EmbeddedDriver, &CheckpointRequest::new(&path, CheckpointMode::Truncate));
        assert!(result.succeeded);
        assert!(result.skipped);
        assert!(!result.blocked());
    }

    #[test]
    fn missing_database_fails_without_creating_it() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing.db");
        let result = checkpoint(&EmbeddedDriver, &CheckpointRequest::new(&path, CheckpointMode::Full));
        assert!(!result.succeeded);
        assert!(result.error_detail.unwrap().contains("not found"));
        assert!(!path.exists());
    }

    #[test]
    fn result_serializes_without_absent_error() {
        let dir = tempfile::tempdir().unwrap();
        let (path, writer) = wal_db_with_frames(dir.path());
        let result = checkpoint(&EmbeddedDriver, &CheckpointRequest::new(&path, CheckpointMode::Truncate));
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["mode"], "TRUNCATE");
        assert!(json.get("error_detail").is_none());
        drop(writer);
    }
}
