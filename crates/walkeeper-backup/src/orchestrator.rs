//! The backup pipeline.
//!
//! Stages run in a fixed order: lock, inspect, checkpoint, copy, compress,
//! verify, prune. An artifact that fails any stage after the copy is deleted
//! before the error is returned.

use crate::backend::{run_backend, select_backend};
use crate::compress::{compression_ratio, gunzip_to_temp, gzip_file};
use crate::error::{BackupError, Result};
use crate::lock::LockManager;
use crate::retention::{self, TIMESTAMP_FORMAT};
use serde::Serialize;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use walkeeper_core::config::db_base_name;
use walkeeper_core::{duration_ms, BackupMode, CheckpointMode, Clock, Config, SystemClock};
use walkeeper_db::{
    checkpoint, inspect, verify, CheckpointRequest, CheckpointResult, DatabaseDriver,
    VerificationResult, VerifyOptions,
};

/// One backup request.
#[derive(Debug, Clone)]
#[allow(clippy::struct_excessive_bools)]
pub struct BackupJob {
    pub source_path: PathBuf,
    pub destination_dir: PathBuf,
    pub backend: BackupMode,
    pub compress: bool,
    pub verify: bool,
    pub deep_verify: bool,
    /// Run a TRUNCATE checkpoint before copying.
    pub checkpoint_first: bool,
    /// 0 disables pruning.
    pub retention_days: u64,
    pub size_tolerance: f64,
    pub busy_timeout: Duration,
    /// Deadline for the copy itself.
    pub copy_timeout: Duration,
}

impl BackupJob {
    #[must_use]
    pub fn new(source_path: impl Into<PathBuf>, destination_dir: impl Into<PathBuf>) -> Self {
        Self {
            source_path: source_path.into(),
            destination_dir: destination_dir.into(),
            backend: BackupMode::Auto,
            compress: false,
            verify: true,
            deep_verify: false,
            checkpoint_first: true,
            retention_days: 7,
            size_tolerance: 0.10,
            busy_timeout: Duration::from_millis(5_000),
            copy_timeout: Duration::from_secs(30),
        }
    }

    /// A job for `config.db_path` into `config.backup_dir`, using every
    /// backup-related setting from `config`.
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self {
            backend: config.backup_mode,
            compress: config.compress,
            verify: config.verify,
            deep_verify: config.verify_deep,
            retention_days: config.max_backup_days,
            size_tolerance: config.verify_size_tolerance,
            busy_timeout: config.busy_timeout,
            copy_timeout: config.command_timeout,
            ..Self::new(&config.db_path, &config.backup_dir)
        }
    }

    /// Delete unfinished files this job's database left in its destination
    /// directory. Used on the signal path, before the lock is released.
    pub fn discard_unfinished(&self) -> Vec<PathBuf> {
        let base = db_base_name(&self.source_path);
        retention::remove_partials(&self.destination_dir, &base).unwrap_or_else(|e| {
            tracing::warn!(
                dir = %self.destination_dir.display(),
                error = %e,
                "could not remove unfinished backup files"
            );
            Vec::new()
        })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BackupResult {
    pub destination_path: PathBuf,
    pub size_bytes: u64,
    pub backend: BackupMode,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub verification: Option<VerificationResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub compression_ratio: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checkpoint: Option<CheckpointResult>,
    pub pruned: Vec<PathBuf>,
}

/// Deletes the listed files on drop unless disarmed.
struct Cleanup {
    paths: Vec<PathBuf>,
}

impl Cleanup {
    const fn new() -> Self {
        Self { paths: Vec::new() }
    }

    fn track(&mut self, path: &Path) {
        self.paths.push(path.to_path_buf());
    }

    fn untrack(&mut self, path: &Path) {
        self.paths.retain(|p| p != path);
    }

    fn disarm(&mut self) {
        self.paths.clear();
    }
}

impl Drop for Cleanup {
    fn drop(&mut self) {
        for path in &self.paths {
            match std::fs::remove_file(path) {
                Ok(()) => tracing::debug!(path = %path.display(), "removed unfinished backup file"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => tracing::warn!(path = %path.display(), error = %e, "cleanup failed"),
            }
        }
    }
}

fn append(path: &Path, suffix: &str) -> PathBuf {
    let mut name: OsString = path.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}

/// `<dir>/<base>-<stamp>.db`, with `-N` appended to the stamp when a backup
/// from the same second already exists.
fn artifact_path(dir: &Path, base: &str, stamp: &str) -> PathBuf {
    let taken = |p: &Path| p.exists() || append(p, ".gz").exists();
    let first = dir.join(format!("{base}-{stamp}.db"));
    if !taken(&first) {
        return first;
    }
    (1u32..)
        .map(|n| dir.join(format!("{base}-{stamp}-{n}.db")))
        .find(|p| !taken(p))
        .unwrap_or(first)
}

/// Runs backup jobs against one driver.
pub struct BackupOrchestrator {
    driver: Arc<dyn DatabaseDriver>,
    locks: LockManager,
    clock: Arc<dyn Clock>,
}

impl BackupOrchestrator {
    #[must_use]
    pub fn new(driver: Arc<dyn DatabaseDriver>, locks: LockManager) -> Self {
        Self::with_clock(driver, locks, Arc::new(SystemClock))
    }

    #[must_use]
    pub fn with_clock(
        driver: Arc<dyn DatabaseDriver>,
        locks: LockManager,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            driver,
            locks,
            clock,
        }
    }

    #[must_use]
    pub const fn locks(&self) -> &LockManager {
        &self.locks
    }

    /// Run one backup job end to end.
    #[allow(clippy::too_many_lines)]
    pub fn backup(&self, job: &BackupJob) -> Result<BackupResult> {
        let start = Instant::now();
        let source = job.source_path.as_path();
        if !source.is_file() {
            return Err(BackupError::SourceMissing(source.to_path_buf()));
        }
        let dest_dir = job.destination_dir.as_path();
        std::fs::create_dir_all(dest_dir).map_err(|e| BackupError::DestinationUnavailable {
            path: dest_dir.to_path_buf(),
            reason: e.to_string(),
        })?;

        let mut guard = self.locks.acquire(source)?;
        let base = db_base_name(source);
        match retention::remove_partials(dest_dir, &base) {
            Ok(swept) if !swept.is_empty() => tracing::warn!(
                target: "maintenance",
                dir = %dest_dir.display(),
                removed = swept.len(),
                "swept unfinished files from an interrupted backup"
            ),
            Ok(_) => {}
            Err(e) => tracing::warn!(
                dir = %dest_dir.display(),
                error = %e,
                "could not sweep unfinished files"
            ),
        }

        let stats = inspect(source);
        let needed = stats.db_bytes.saturating_add(stats.wal_bytes);
        match fs2::available_space(dest_dir) {
            Ok(free) if free < needed => {
                return Err(BackupError::DestinationUnavailable {
                    path: dest_dir.to_path_buf(),
                    reason: format!("{free} bytes free, need about {needed}"),
                });
            }
            Ok(_) => {}
            Err(e) => tracing::debug!(error = %e, "could not query free space"),
        }

        let backend = select_backend(job.backend, &stats);
        tracing::info!(
            target: "maintenance",
            source = %source.display(),
            requested = %job.backend,
            backend = %backend,
            db_bytes = stats.db_bytes,
            wal_bytes = stats.wal_bytes,
            wal_mode = stats.wal_mode,
            "backup started"
        );

        let checkpoint_result = (job.checkpoint_first && stats.wal_mode).then(|| {
            let req = CheckpointRequest::new(source, CheckpointMode::Truncate)
                .with_busy_timeout(job.busy_timeout)
                .with_timeout(job.copy_timeout);
            let result = checkpoint(self.driver.as_ref(), &req);
            if !result.succeeded {
                tracing::warn!(
                    error = result.error_detail.as_deref().unwrap_or_default(),
                    "pre-backup checkpoint failed, copying anyway"
                );
            }
            result
        });

        // Copy into `.partial`, then rename.
        let stamp = self.clock.now().format(TIMESTAMP_FORMAT).to_string();
        let final_path = artifact_path(dest_dir, &base, &stamp);
        let partial = append(&final_path, ".partial");
        let mut cleanup = Cleanup::new();
        cleanup.track(&partial);
        if partial.exists() {
            std::fs::remove_file(&partial)?;
        }
        run_backend(
            self.driver.as_ref(),
            backend,
            source,
            &partial,
            job.busy_timeout,
            job.copy_timeout,
        )?;
        std::fs::rename(&partial, &final_path)?;
        cleanup.untrack(&partial);
        cleanup.track(&final_path);
        let copied_bytes = std::fs::metadata(&final_path)?.len();

        let mut artifact = final_path.clone();
        let mut ratio = None;
        if job.compress {
            let gz = append(&final_path, ".gz");
            let gz_partial = append(&gz, ".partial");
            cleanup.track(&gz_partial);
            let compressed = gzip_file(&final_path, &gz_partial)?;
            std::fs::rename(&gz_partial, &gz)?;
            cleanup.untrack(&gz_partial);
            cleanup.track(&gz);
            std::fs::remove_file(&final_path)?;
            cleanup.untrack(&final_path);
            ratio = Some(compression_ratio(copied_bytes, compressed));
            artifact = gz;
        }

        let verification = if job.verify {
            let opts = VerifyOptions {
                deep: job.deep_verify,
                size_tolerance: job.size_tolerance,
            };
            let result = if job.compress {
                let tmp = gunzip_to_temp(&artifact)?;
                verify(self.driver.as_ref(), tmp.path(), Some(source), &opts)
            } else {
                verify(self.driver.as_ref(), &artifact, Some(source), &opts)
            };
            if !result.passed {
                tracing::error!(
                    target: "maintenance",
                    artifact = %artifact.display(),
                    details = ?result.details,
                    "backup failed verification, artifact removed"
                );
                drop(cleanup);
                return Err(BackupError::VerificationFailed {
                    path: artifact,
                    details: result.details,
                });
            }
            Some(result)
        } else {
            None
        };
        cleanup.disarm();

        let pruned = if job.retention_days > 0 {
            retention::prune(dest_dir, &base, job.retention_days, self.clock.now())
                .unwrap_or_else(|e| {
                    tracing::warn!(dir = %dest_dir.display(), error = %e, "retention pruning failed");
                    Vec::new()
                })
        } else {
            Vec::new()
        };

        let size_bytes = std::fs::metadata(&artifact)?.len();
        if let Err(e) = guard.release() {
            tracing::warn!(error = %e, "failed to release backup lock");
        }

        let result = BackupResult {
            destination_path: artifact,
            size_bytes,
            backend,
            duration_ms: duration_ms(start.elapsed()),
            verification,
            compression_ratio: ratio,
            checkpoint: checkpoint_result,
            pruned,
        };
        tracing::info!(
            target: "maintenance",
            artifact = %result.destination_path.display(),
            backend = %result.backend,
            size_bytes = result.size_bytes,
            duration_ms = result.duration_ms,
            compression_ratio = ?result.compression_ratio,
            pruned = result.pruned.len(),
            "backup complete"
        );
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn artifact_path_avoids_collisions() {
        let dir = tempfile::tempdir().unwrap();
        let first = artifact_path(dir.path(), "app", "20260101T000000Z");
        assert_eq!(first, dir.path().join("app-20260101T000000Z.db"));
        std::fs::write(&first, b"x").unwrap();
        let second = artifact_path(dir.path(), "app", "20260101T000000Z");
        assert_eq!(second, dir.path().join("app-20260101T000000Z-1.db"));

        std::fs::write(dir.path().join("app-20260101T000000Z-1.db.gz"), b"x").unwrap();
        let third = artifact_path(dir.path(), "app", "20260101T000000Z");
        assert_eq!(third, dir.path().join("app-20260101T000000Z-2.db"));
    }

    #[test]
    fn cleanup_removes_tracked_files_unless_disarmed() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a");
        let b = dir.path().join("b");
        std::fs::write(&a, b"x").unwrap();
        std::fs::write(&b, b"x").unwrap();
        {
            let mut c = Cleanup::new();
            c.track(&a);
            c.track(&b);
            c.untrack(&b);
        }
        assert!(!a.exists());
        assert!(b.exists());
        {
            let mut c = Cleanup::new();
            c.track(&b);
            c.disarm();
        }
        assert!(b.exists());
    }

    #[test]
    fn job_from_config_carries_backup_settings() {
        let config = Config {
            compress: true,
            verify_deep: true,
            max_backup_days: 3,
            ..Config::default()
        };
        let job = BackupJob::from_config(&config);
        assert_eq!(job.source_path, config.db_path);
        assert_eq!(job.destination_dir, config.backup_dir);
        assert!(job.compress && job.deep_verify && job.verify);
        assert_eq!(job.retention_days, 3);
    }
}
