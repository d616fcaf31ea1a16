//! Filesystem view of a database: the main file and its `-wal` companion.

use serde::Serialize;
use std::ffi::OsString;
use std::path::{Path, PathBuf};

fn with_suffix(db: &Path, suffix: &str) -> PathBuf {
    let mut name: OsString = db.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}

/// `<db>-wal`
#[must_use]
pub fn wal_path(db: &Path) -> PathBuf {
    with_suffix(db, "-wal")
}

/// Size of a file in bytes; a missing file counts as empty.
#[must_use]
pub fn file_size(path: &Path) -> u64 {
    std::fs::metadata(path).map_or(0, |m| m.len())
}

/// Byte offset of the "file format write version" in the database header.
const HEADER_WRITE_VERSION: usize = 18;
const HEADER_MAGIC: &[u8] = b"SQLite format 3\0";

/// Whether the database header marks the file as WAL mode.
///
/// Bytes 18/19 of the header are 2 for WAL, 1 for rollback journal. This is a
/// cheap check that needs no driver; an unreadable or short file is treated
/// as not-WAL.
#[must_use]
pub fn header_says_wal(db: &Path) -> bool {
    use std::io::Read;
    let mut header = [0u8; 20];
    let Ok(mut file) = std::fs::File::open(db) else {
        return false;
    };
    if file.read_exact(&mut header).is_err() {
        return false;
    }
    header.starts_with(HEADER_MAGIC) && header[HEADER_WRITE_VERSION] == 2
}

/// Point-in-time sizes of a database and its WAL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FileStats {
    pub db_bytes: u64,
    pub wal_bytes: u64,
    pub wal_mode: bool,
}

impl FileStats {
    /// WAL size relative to the database; 0 when the database is empty.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn wal_ratio(&self) -> f64 {
        if self.db_bytes == 0 {
            0.0
        } else {
            self.wal_bytes as f64 / self.db_bytes as f64
        }
    }
}

/// Stat the database and its WAL. A present `-wal` file also counts as WAL
/// mode, since the header flag is only written on the first WAL transaction.
#[must_use]
pub fn inspect(db: &Path) -> FileStats {
    let wal = wal_path(db);
    FileStats {
        db_bytes: file_size(db),
        wal_bytes: file_size(&wal),
        wal_mode: header_says_wal(db) || wal.exists(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn companion_paths_append_suffix() {
        let db = Path::new("/var/lib/app/state.db");
        assert_eq!(wal_path(db), PathBuf::from("/var/lib/app/state.db-wal"));
    }

    #[test]
    fn missing_files_are_empty() {
        let dir = tempfile::tempdir().unwrap();
        let stats = inspect(&dir.path().join("absent.db"));
        assert_eq!(stats.db_bytes, 0);
        assert_eq!(stats.wal_bytes, 0);
        assert!(!stats.wal_mode);
        assert!(stats.wal_ratio().abs() < f64::EPSILON);
    }

    #[test]
    fn detects_wal_header() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("w.db");
        let conn = rusqlite::Connection::open(&path).unwrap();
        conn.execute_batch("PRAGMA journal_mode=WAL; CREATE TABLE t(x);")
            .unwrap();
        assert!(header_says_wal(&path));
        drop(conn);

        let plain = dir.path().join("p.db");
        let conn = rusqlite::Connection::open(&plain).unwrap();
        conn.execute_batch("CREATE TABLE t(x);").unwrap();
        drop(conn);
        assert!(!header_says_wal(&plain));
        assert!(!inspect(&plain).wal_mode);
    }

    #[test]
    fn ratio_uses_sparse_sizes() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("big.db");
        std::fs::File::create(&db).unwrap().set_len(500 * 1024 * 1024).unwrap();
        std::fs::File::create(wal_path(&db))
            .unwrap()
            .set_len(40 * 1024 * 1024)
            .unwrap();
        let stats = inspect(&db);
        assert_eq!(stats.db_bytes, 500 * 1024 * 1024);
        assert!(stats.wal_mode);
        assert!((stats.wal_ratio() - 0.08).abs() < 1e-9);
    }
}
