//! Age-based pruning of backup artifacts.
//!
//! Artifacts are named `<base>-<YYYYmmddTHHMMSSZ>[...]`; the timestamp in the
//! name is the artifact's age. The newest artifact for a database is never
//! deleted, however old it is.
//!
//! Files whose name carries `.partial` are unfinished: a copy, its journal,
//! a compressed stream or a verification scratch file. They never count as
//! artifacts, and [`remove_partials`] sweeps the ones a dead process left.

use chrono::{DateTime, NaiveDateTime, Utc};
use std::path::{Path, PathBuf};

/// `strftime` format of the timestamp embedded in artifact names.
pub const TIMESTAMP_FORMAT: &str = "%Y%m%dT%H%M%SZ";
const TIMESTAMP_LEN: usize = 16;
const PARTIAL_MARKER: &str = ".partial";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    pub path: PathBuf,
    pub created_at: DateTime<Utc>,
}

/// Parse the creation time out of an artifact file name for database `base`.
#[must_use]
pub fn parse_artifact_time(file_name: &str, base: &str) -> Option<DateTime<Utc>> {
    if is_partial(file_name) {
        return None;
    }
    stamp_time(file_name, base)
}

/// Whether `file_name` is an unfinished file belonging to database `base`.
#[must_use]
pub fn is_partial_for(file_name: &str, base: &str) -> bool {
    is_partial(file_name) && stamp_time(file_name, base).is_some()
}

fn is_partial(file_name: &str) -> bool {
    file_name.contains(PARTIAL_MARKER)
}

fn stamp_time(file_name: &str, base: &str) -> Option<DateTime<Utc>> {
    let rest = file_name.strip_prefix(base)?.strip_prefix('-')?;
    let stamp = rest.get(..TIMESTAMP_LEN)?;
    NaiveDateTime::parse_from_str(stamp, TIMESTAMP_FORMAT)
        .ok()
        .map(|naive| naive.and_utc())
}

/// All finished artifacts for `base` in `dir`, oldest first.
pub fn list_artifacts(dir: &Path, base: &str) -> std::io::Result<Vec<Artifact>> {
    let mut out = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let name = entry.file_name();
        if let Some(created_at) = parse_artifact_time(&name.to_string_lossy(), base) {
            out.push(Artifact {
                path: entry.path(),
                created_at,
            });
        }
    }
    out.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.path.cmp(&b.path)));
    Ok(out)
}

/// Delete unfinished files for `base` in `dir`. Only safe while holding
/// the backup lock for that database. Returns the deleted paths.
pub fn remove_partials(dir: &Path, base: &str) -> std::io::Result<Vec<PathBuf>> {
    let mut removed = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_file()
            || !is_partial_for(&entry.file_name().to_string_lossy(), base)
        {
            continue;
        }
        let path = entry.path();
        match std::fs::remove_file(&path) {
            Ok(()) => {
                tracing::info!(
                    target: "maintenance",
                    path = %path.display(),
                    "removed unfinished backup file"
                );
                removed.push(path);
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
    }
    Ok(removed)
}

/// Indices into `artifacts` (sorted oldest first) that fall outside the
/// retention window. The last (newest) index is never included.
#[must_use]
pub fn expired(artifacts: &[Artifact], retention_days: u64, now: DateTime<Utc>) -> Vec<usize> {
    if retention_days == 0 || artifacts.len() <= 1 {
        return Vec::new();
    }
    let days = i64::try_from(retention_days).unwrap_or(i64::MAX);
    let Some(cutoff) = chrono::Duration::try_days(days).and_then(|d| now.checked_sub_signed(d))
    else {
        return Vec::new();
    };
    let newest = artifacts.len() - 1;
    (0..newest)
        .filter(|&i| artifacts[i].created_at < cutoff)
        .collect()
}

/// Delete expired artifacts for `base` in `dir`. Returns the deleted paths.
pub fn prune(
    dir: &Path,
    base: &str,
    retention_days: u64,
    now: DateTime<Utc>,
) -> std::io::Result<Vec<PathBuf>> {
    let artifacts = list_artifacts(dir, base)?;
    let mut deleted = Vec::new();
    for i in expired(&artifacts, retention_days, now) {
        let path = &artifacts[i].path;
        match std::fs::remove_file(path) {
            Ok(()) => {
                tracing::info!(
                    target: "maintenance",
                    path = %path.display(),
                    created_at = %artifacts[i].created_at,
                    "pruned expired backup"
                );
                deleted.push(path.clone());
            }
            Err(e) => tracing::warn!(path = %path.display(), error = %e, "failed to prune backup"),
        }
    }
    Ok(deleted)
}
