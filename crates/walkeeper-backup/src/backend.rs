//! Backup backend selection and execution.

use crate::error::{BackupError, Result};
use std::path::Path;
use std::time::Duration;
use walkeeper_core::{BackupMode, MIB};
use walkeeper_db::driver::sql_quote;
use walkeeper_db::{DatabaseDriver, FileStats, OpenMode};

/// WAL size at which `Auto` switches to the online copy.
pub const ONLINE_COPY_MIN_WAL_BYTES: u64 = 32 * MIB;
/// WAL/DB ratio above which `Auto` switches to the online copy.
pub const ONLINE_COPY_MIN_WAL_RATIO: f64 = 0.05;

/// Resolve `Auto` against the current file state.
///
/// `VACUUM INTO` must fold the whole WAL into its export, so a large WAL
/// (absolutely or relative to the database) goes through the page-level
/// online copy instead. A database that is not in WAL mode always snapshots.
#[must_use]
pub fn select_backend(requested: BackupMode, stats: &FileStats) -> BackupMode {
    match requested {
        BackupMode::Snapshot | BackupMode::OnlineCopy => requested,
        BackupMode::Auto if !stats.wal_mode => BackupMode::Snapshot,
        BackupMode::Auto => {
            if stats.wal_bytes >= ONLINE_COPY_MIN_WAL_BYTES
                || stats.wal_ratio() > ONLINE_COPY_MIN_WAL_RATIO
            {
                BackupMode::OnlineCopy
            } else {
                BackupMode::Snapshot
            }
        }
    }
}

/// Copy `source` into `dest` (which must not exist) with the given backend.
pub fn run_backend(
    driver: &dyn DatabaseDriver,
    mode: BackupMode,
    source: &Path,
    dest: &Path,
    busy_timeout: Duration,
    deadline: Duration,
) -> Result<()> {
    let mut session = driver.open(source, OpenMode::ReadOnly)?;
    session.set_busy_timeout(busy_timeout)?;
    session.set_statement_timeout(deadline)?;
    let outcome = match mode {
        BackupMode::Snapshot => {
            let sql = format!("VACUUM INTO {}", sql_quote(&dest.display().to_string()));
            session.execute(&sql)
        }
        BackupMode::OnlineCopy => session.online_copy(dest, deadline),
        BackupMode::Auto => {
            return Err(BackupError::BackendUnavailable(
                "backend must be resolved before running".to_string(),
            ));
        }
    };
    let closed = session.close();
    outcome?;
    closed?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stats(db_mb: u64, wal_mb: u64, wal_mode: bool) -> FileStats {
        FileStats {
            db_bytes: db_mb * MIB,
            wal_bytes: wal_mb * MIB,
            wal_mode,
        }
    }

    #[test]
    fn small_wal_snapshots() {
        assert_eq!(
            select_backend(BackupMode::Auto, &stats(500, 2, true)),
            BackupMode::Snapshot
        );
    }

    #[test]
    fn large_wal_uses_online_copy() {
        assert_eq!(
            select_backend(BackupMode::Auto, &stats(500, 40, true)),
            BackupMode::OnlineCopy
        );
    }

    #[test]
    fn high_ratio_uses_online_copy() {
        assert_eq!(
            select_backend(BackupMode::Auto, &stats(10, 1, true)),
            BackupMode::OnlineCopy
        );
    }

    #[test]
    fn non_wal_always_snapshots() {
        assert_eq!(
            select_backend(BackupMode::Auto, &stats(10, 0, false)),
            BackupMode::Snapshot
        );
    }

    #[test]
    fn forced_modes_are_respected() {
        let s = stats(500, 40, true);
        assert_eq!(select_backend(BackupMode::Snapshot, &s), BackupMode::Snapshot);
        assert_eq!(
            select_backend(BackupMode::OnlineCopy, &stats(500, 0, false)),
            BackupMode::OnlineCopy
        );
    }
}
