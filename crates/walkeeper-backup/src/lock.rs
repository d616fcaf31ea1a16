//! Per-database exclusive backup lock.
//!
//! The lock is a JSON sidecar, `<db>.backup.lock`. The record is written to
//! a temp file and linked into place without clobbering, so exactly one
//! acquirer wins and nobody ever reads a half-written record. A record older
//! than the staleness threshold (default 1 hour) is reclaimed by the next
//! acquirer; unreadable records are aged by file mtime instead.
//!
//! Every removal of the lock file (reclaim and release) happens under an
//! exclusive `flock` on `<db>.backup.lock.guard` and re-reads the record
//! first. Two acquirers that both saw the same stale record therefore cannot
//! delete each other's fresh lock. The guard file is left in place.
//!
//! Every lock held by this process is also tracked in a process-wide registry
//! so the signal path can call [`release_all_held`] before exiting.

use crate::error::LockError;
use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::ffi::OsString;
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock, Mutex};
use std::time::Duration;
use walkeeper_core::{Clock, SystemClock};

pub type LockResult<T> = std::result::Result<T, LockError>;

/// Default age after which a lock record is considered abandoned.
pub const DEFAULT_STALE_AFTER: Duration = Duration::from_secs(60 * 60);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockRecord {
    pub owner_pid: u32,
    pub hostname: String,
    pub acquired_at: DateTime<Utc>,
    pub database_path: PathBuf,
}

impl LockRecord {
    fn describe(&self) -> String {
        format!(
            "pid {} on {} since {}",
            self.owner_pid,
            self.hostname,
            self.acquired_at.to_rfc3339()
        )
    }
}

/// Snapshot of a lock sidecar, for `lock status`.
#[derive(Debug, Clone, Serialize)]
pub struct LockStatus {
    pub lock_path: PathBuf,
    pub locked: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub record: Option<LockRecord>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub age_secs: Option<i64>,
    pub stale: bool,
    /// Only known when the holder is on this host.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub owner_alive: Option<bool>,
}

static HELD: LazyLock<Mutex<HashMap<PathBuf, LockRecord>>> =
    LazyLock::new(|| Mutex::new(HashMap::new()));

fn held() -> std::sync::MutexGuard<'static, HashMap<PathBuf, LockRecord>> {
    HELD.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

/// `<db>.backup.lock`
#[must_use]
pub fn lock_path(db: &Path) -> PathBuf {
    let mut name: OsString = db.as_os_str().to_owned();
    name.push(".backup.lock");
    PathBuf::from(name)
}

fn guard_path(lock: &Path) -> PathBuf {
    let mut name: OsString = lock.as_os_str().to_owned();
    name.push(".guard");
    PathBuf::from(name)
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> LockError + '_ {
    move |source| LockError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Exclusive `flock` serializing removals of one lock file. Closing the
/// descriptor on drop releases it.
struct RemovalGuard {
    _file: fs::File,
}

impl RemovalGuard {
    fn lock(lock: &Path) -> LockResult<Self> {
        let path = guard_path(lock);
        let file = fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&path)
            .map_err(io_err(&path))?;
        file.lock_exclusive().map_err(io_err(&path))?;
        Ok(Self { _file: file })
    }
}

fn remove_lock_file(path: &Path) -> LockResult<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
        Err(source) => Err(LockError::Io {
            path: path.to_path_buf(),
            source,
        }),
    }
}

/// Write `record` and link it to `path` unless `path` already exists.
/// `Ok(false)` means someone else holds the lock.
fn publish(path: &Path, record: &LockRecord) -> std::io::Result<bool> {
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    let mut tmp = tempfile::Builder::new()
        .prefix(".backup-lock-")
        .tempfile_in(dir)?;
    let bytes = serde_json::to_vec(record).map_err(std::io::Error::other)?;
    tmp.write_all(&bytes)?;
    tmp.as_file().sync_all()?;
    match tmp.persist_noclobber(path) {
        Ok(_) => Ok(true),
        Err(e) if e.error.kind() == ErrorKind::AlreadyExists => Ok(false),
        Err(e) => Err(e.error),
    }
}

fn hostname() -> String {
    nix::unistd::gethostname()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "unknown".to_string())
}

fn pid_alive(pid: u32) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    match kill(Pid::from_raw(raw), None) {
        Ok(()) | Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

fn read_record(path: &Path) -> Option<LockRecord> {
    fs::read_to_string(path)
        .ok()
        .and_then(|s| serde_json::from_str(&s).ok())
}

/// Remove `path` only if it still holds `record`.
fn remove_if_ours(path: &Path, record: &LockRecord) -> LockResult<bool> {
    if read_record(path).as_ref() != Some(record) {
        return Ok(false);
    }
    let _guard = RemovalGuard::lock(path)?;
    if read_record(path).as_ref() != Some(record) {
        return Ok(false);
    }
    remove_lock_file(path)
}

/// Release every lock this process still holds. Returns how many lock files
/// were removed.
pub fn release_all_held() -> usize {
    release_held_where(|_| true)
}

fn release_held_where(filter: impl Fn(&Path) -> bool) -> usize {
    let drained: Vec<(PathBuf, LockRecord)> = {
        let mut map = held();
        let keys: Vec<PathBuf> = map.keys().filter(|p| filter(p)).cloned().collect();
        keys.into_iter()
            .filter_map(|k| map.remove_entry(&k))
            .collect()
    };
    let mut removed = 0;
    for (path, record) in drained {
        match remove_if_ours(&path, &record) {
            Ok(true) => removed += 1,
            Ok(false) => {}
            Err(e) => tracing::warn!(error = %e, "failed to release lock on shutdown"),
        }
    }
    if removed > 0 {
        tracing::info!(target: "maintenance", removed, "released held backup locks");
    }
    removed
}

/// Acquires and inspects backup locks.
#[derive(Clone)]
pub struct LockManager {
    clock: Arc<dyn Clock>,
    stale_after: Duration,
}

impl std::fmt::Debug for LockManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockManager")
            .field("stale_after", &self.stale_after)
            .finish_non_exhaustive()
    }
}

impl Default for LockManager {
    fn default() -> Self {
        Self::new(DEFAULT_STALE_AFTER)
    }
}

impl LockManager {
    #[must_use]
    pub fn new(stale_after: Duration) -> Self {
        Self::with_clock(Arc::new(SystemClock), stale_after)
    }

    #[must_use]
    pub fn with_clock(clock: Arc<dyn Clock>, stale_after: Duration) -> Self {
        Self { clock, stale_after }
    }

    #[must_use]
    pub const fn stale_after(&self) -> Duration {
        self.stale_after
    }

    /// Age of an existing lock file: from its record, else from its mtime.
    fn lock_age(&self, path: &Path, record: Option<&LockRecord>) -> Option<chrono::Duration> {
        let now = self.clock.now();
        if let Some(record) = record {
            return Some(now - record.acquired_at);
        }
        let modified: DateTime<Utc> = fs::metadata(path).ok()?.modified().ok()?.into();
        Some(now - modified)
    }

    fn is_stale(&self, age: Option<chrono::Duration>) -> bool {
        let Ok(limit) = chrono::Duration::from_std(self.stale_after) else {
            return false;
        };
        age.is_some_and(|a| a >= limit)
    }

    /// Acquire the lock for `db`, reclaiming a stale record at most once.
    pub fn acquire(&self, db: &Path) -> LockResult<LockGuard> {
        let path = lock_path(db);
        let mut reclaimed = false;

        loop {
            let record = LockRecord {
                owner_pid: std::process::id(),
                hostname: hostname(),
                acquired_at: self.clock.now(),
                database_path: db.to_path_buf(),
            };
            if publish(&path, &record).map_err(io_err(&path))? {
                return Ok(Self::install(path, record));
            }
            if !reclaimed && self.reclaim_if_stale(&path)? {
                reclaimed = true;
                continue;
            }
            let holder = read_record(&path)
                .as_ref()
                .map_or_else(|| "an unreadable lock record".to_string(), LockRecord::describe);
            return Err(LockError::AlreadyLocked { path, holder });
        }
    }

    /// Judge the existing lock file under the removal guard and delete it if
    /// it is stale. `true` means the path is free to retry.
    fn reclaim_if_stale(&self, path: &Path) -> LockResult<bool> {
        let _guard = RemovalGuard::lock(path)?;
        if !path.exists() {
            return Ok(true);
        }
        let record = read_record(path);
        let age = self.lock_age(path, record.as_ref());
        if !self.is_stale(age) {
            return Ok(false);
        }
        tracing::warn!(
            target: "maintenance",
            lock = %path.display(),
            holder = record.as_ref().map(LockRecord::describe).unwrap_or_default(),
            age_secs = age.map(|a| a.num_seconds()),
            "reclaiming stale backup lock"
        );
        remove_lock_file(path)?;
        Ok(true)
    }

    fn install(path: PathBuf, record: LockRecord) -> LockGuard {
        held().insert(path.clone(), record.clone());
        tracing::debug!(lock = %path.display(), pid = record.owner_pid, "backup lock acquired");
        LockGuard {
            path,
            record,
            released: false,
        }
    }

    /// Describe the lock for `db` without touching it.
    pub fn status(&self, db: &Path) -> LockStatus {
        let path = lock_path(db);
        if !path.exists() {
            return LockStatus {
                lock_path: path,
                locked: false,
                record: None,
                age_secs: None,
                stale: false,
                owner_alive: None,
            };
        }
        let record = read_record(&path);
        let age = self.lock_age(&path, record.as_ref());
        let local = hostname();
        let owner_alive = record
            .as_ref()
            .filter(|r| r.hostname == local)
            .map(|r| pid_alive(r.owner_pid));
        LockStatus {
            lock_path: path,
            locked: true,
            stale: self.is_stale(age),
            age_secs: age.map(|a| a.num_seconds()),
            record,
            owner_alive,
        }
    }
}

/// Held backup lock; released on drop.
#[derive(Debug)]
pub struct LockGuard {
    path: PathBuf,
    record: LockRecord,
    released: bool,
}

impl LockGuard {
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub const fn record(&self) -> &LockRecord {
        &self.record
    }

    /// Remove the lock file. Idempotent; a file that has since been reclaimed
    /// by another holder is left alone.
    pub fn release(&mut self) -> LockResult<()> {
        if self.released {
            return Ok(());
        }
        self.released = true;
        held().remove(&self.path);
        remove_if_ours(&self.path, &self.record)?;
        tracing::debug!(lock = %self.path.display(), "backup lock released");
        Ok(())
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            tracing::warn!(error = %e, "failed to release backup lock");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use walkeeper_core::ManualClock;

    #[test]
    fn lock_path_appends_suffix() {
        assert_eq!(
            lock_path(Path::new("/data/app.db")),
            PathBuf::from("/data/app.db.backup.lock")
        );
    }

    #[test]
    fn second_acquire_conflicts_until_release() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("app.db");
        let locks = LockManager::default();

        let mut first = locks.acquire(&db).expect("first acquire");
        let record: LockRecord =
            serde_json::from_str(&fs::read_to_string(lock_path(&db)).unwrap()).unwrap();
        assert_eq!(record.owner_pid, std::process::id());
        assert_eq!(record.database_path, db);

        let err = locks.acquire(&db).unwrap_err();
        assert!(matches!(err, LockError::AlreadyLocked { .. }));

        first.release().unwrap();
        first.release().unwrap();
        assert!(!lock_path(&db).exists());
        let _second = locks.acquire(&db).expect("free after release");
    }

    #[test]
    fn drop_releases() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("app.db");
        let locks = LockManager::default();
        {
            let _guard = locks.acquire(&db).unwrap();
            assert!(lock_path(&db).exists());
        }
        assert!(!lock_path(&db).exists());
    }

    #[test]
    fn stale_lock_is_reclaimed_under_simulated_clock() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("app.db");
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let locks = LockManager::with_clock(clock.clone(), Duration::from_secs(3600));

        let abandoned = locks.acquire(&db).unwrap();
        clock.advance(chrono::Duration::minutes(59));
        assert!(locks.acquire(&db).is_err(), "still fresh at 59 minutes");

        clock.advance(chrono::Duration::minutes(2));
        assert!(locks.status(&db).stale);
        let fresh = locks.acquire(&db).expect("stale lock reclaimed");

        // The abandoned guard must not remove the new holder's file.
        drop(abandoned);
        assert!(lock_path(&db).exists());
        assert_eq!(read_record(&lock_path(&db)).as_ref(), Some(fresh.record()));
    }

    #[test]
    fn unreadable_record_aged_by_mtime() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("app.db");
        fs::write(lock_path(&db), b"not json").unwrap();

        let clock = Arc::new(ManualClock::new(Utc::now()));
        let locks = LockManager::with_clock(clock.clone(), Duration::from_secs(60));
        assert!(matches!(
            locks.acquire(&db),
            Err(LockError::AlreadyLocked { .. })
        ));
        clock.advance(chrono::Duration::minutes(5));
        assert!(locks.acquire(&db).is_ok());
    }

    #[test]
    fn status_reports_live_owner() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("app.db");
        let locks = LockManager::default();
        assert!(!locks.status(&db).locked);

        let _guard = locks.acquire(&db).unwrap();
        let status = locks.status(&db);
        assert!(status.locked);
        assert!(!status.stale);
        assert_eq!(status.owner_alive, Some(true));
    }

    #[test]
    fn release_all_held_clears_registry() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("signal.db");
        let locks = LockManager::default();
        let guard = locks.acquire(&db).unwrap();
        assert_eq!(release_held_where(|p| p.starts_with(dir.path())), 1);
        assert!(!lock_path(&db).exists());
        // Dropping afterwards is a no-op.
        drop(guard);
        assert!(locks.acquire(&db).is_ok());
    }

    #[test]
    fn concurrent_acquires_have_one_winner() {
        let dir = tempfile::tempdir().unwrap();
        let db = Arc::new(dir.path().join("race.db"));
        let locks = LockManager::default();
        let barrier = Arc::new(std::sync::Barrier::new(8));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let db = Arc::clone(&db);
                let locks = locks.clone();
                let barrier = Arc::clone(&barrier);
                std::thread::spawn(move || {
                    barrier.wait();
                    locks.acquire(&db).ok()
                })
            })
            .collect();
        let guards: Vec<LockGuard> = handles
            .into_iter()
            .filter_map(|h| h.join().unwrap())
            .collect();
        assert_eq!(guards.len(), 1);
    }

    #[test]
    fn racing_reclaims_of_one_stale_record_have_one_winner() {
        let dir = tempfile::tempdir().unwrap();
        let db = Arc::new(dir.path().join("stale-race.db"));
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let locks = LockManager::with_clock(clock.clone(), Duration::from_secs(60));
        let abandoned = LockRecord {
            owner_pid: 1,
            hostname: "elsewhere".to_string(),
            acquired_at: clock.now() - chrono::Duration::minutes(5),
            database_path: db.to_path_buf(),
        };

        for round in 0..100 {
            fs::write(lock_path(&db), serde_json::to_vec(&abandoned).unwrap()).unwrap();
            let barrier = Arc::new(std::sync::Barrier::new(8));
            let handles: Vec<_> = (0..8)
                .map(|_| {
                    let db = Arc::clone(&db);
                    let locks = locks.clone();
                    let barrier = Arc::clone(&barrier);
                    std::thread::spawn(move || {
                        barrier.wait();
                        locks.acquire(&db).ok()
                    })
                })
                .collect();
            let guards: Vec<LockGuard> = handles
                .into_iter()
                .filter_map(|h| h.join().unwrap())
                .collect();

            assert_eq!(guards.len(), 1, "round {round}: live holders");
            assert_eq!(
                read_record(&lock_path(&db)).as_ref(),
                Some(guards[0].record()),
                "round {round}: the file belongs to the winner"
            );
            drop(guards);
            assert!(!lock_path(&db).exists(), "round {round}");
        }
    }

    #[test]
    fn publishing_leaves_no_temp_files() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("app.db");
        let locks = LockManager::default();
        let _guard = locks.acquire(&db).unwrap();
        let names: Vec<String> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .filter(|n| n.starts_with(".backup-lock-"))
            .collect();
        assert!(names.is_empty(), "temp record files left behind: {names:?}");
        assert!(read_record(&lock_path(&db)).is_some());
    }
}
