//! The narrow seam between walkeeper and SQLite.
//!
//! Two implementations exist:
//!
//! - [`EmbeddedDriver`]: links SQLite through `rusqlite` (bundled build).
//! - [`CliDriver`]: shells out to the `sqlite3` command-line tool, one process
//!   per statement, each bounded by an explicit timeout.
//!
//! [`probe_driver`] picks one at startup by capability probing. Callers only
//! ever see `dyn DatabaseDriver` / `dyn DbSession`.

use crate::error::{DbError, DbResult};
use rusqlite::backup::{Backup, StepResult};
use rusqlite::types::ValueRef;
use rusqlite::{Connection, OpenFlags};
use serde::Serialize;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::time::{Duration, Instant};
use walkeeper_core::{Config, DriverPreference};

/// Pages copied per online-backup step.
const PAGES_PER_STEP: i32 = 256;
/// Pause between online-backup steps when the source is busy.
const STEP_PAUSE: Duration = Duration::from_millis(25);
/// Virtual-machine instructions between deadline checks on the embedded
/// connection.
const PROGRESS_OPS: i32 = 1_000;
/// Column separator for CLI output (ASCII unit separator).
const CLI_SEPARATOR: &str = "\u{1f}";
const PROCESS_POLL: Duration = Duration::from_millis(20);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DriverKind {
    Embedded,
    Cli,
}

impl DriverKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Embedded => "embedded",
            Self::Cli => "cli",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    ReadWrite,
    ReadOnly,
}

/// Opens sessions against an existing database file.
pub trait DatabaseDriver: Send + Sync + std::fmt::Debug {
    fn kind(&self) -> DriverKind;

    /// Open `path`. Never creates the file: a missing path is `NotFound`.
    fn open(&self, path: &Path, mode: OpenMode) -> DbResult<Box<dyn DbSession>>;
}

/// An open handle on one database file.
pub trait DbSession {
    fn set_busy_timeout(&mut self, timeout: Duration) -> DbResult<()>;

    /// Bound every later statement on this session to `timeout` of wall
    /// time. An expired statement is abandoned with [`DbError::Timeout`].
    /// Sessions that cannot interrupt a statement ignore this.
    fn set_statement_timeout(&mut self, _timeout: Duration) -> DbResult<()> {
        Ok(())
    }

    /// Run a statement that returns rows; every value is rendered as text
    /// (`NULL` as the empty string).
    fn query(&mut self, sql: &str) -> DbResult<Vec<Vec<String>>>;

    /// Run statements for their side effects only.
    fn execute(&mut self, sql: &str) -> DbResult<()>;

    /// Copy the database page-by-page into `dest` while it stays open for
    /// other connections. Must finish within `deadline`.
    fn online_copy(&mut self, dest: &Path, deadline: Duration) -> DbResult<()>;

    fn close(self: Box<Self>) -> DbResult<()>;
}

/// First column of the first row of a query, if any.
pub fn query_scalar(session: &mut dyn DbSession, sql: &str) -> DbResult<Option<String>> {
    Ok(session
        .query(sql)?
        .into_iter()
        .next()
        .and_then(|row| row.into_iter().next()))
}

/// Quote a string as an SQL literal.
#[must_use]
pub fn sql_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

// ---------------------------------------------------------------------------
// Embedded (rusqlite)
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Clone, Copy)]
pub struct EmbeddedDriver;

impl EmbeddedDriver {
    /// Confirm the linked library actually works.
    pub fn probe() -> DbResult<String> {
        let conn = Connection::open_in_memory()?;
        let version: String = conn.query_row("SELECT sqlite_version()", [], |r| r.get(0))?;
        Ok(version)
    }
}

impl DatabaseDriver for EmbeddedDriver {
    fn kind(&self) -> DriverKind {
        DriverKind::Embedded
    }

    fn open(&self, path: &Path, mode: OpenMode) -> DbResult<Box<dyn DbSession>> {
        if !path.exists() {
            return Err(DbError::NotFound(path.display().to_string()));
        }
        let access = match mode {
            OpenMode::ReadWrite => OpenFlags::SQLITE_OPEN_READ_WRITE,
            OpenMode::ReadOnly => OpenFlags::SQLITE_OPEN_READ_ONLY,
        };
        let flags = access | OpenFlags::SQLITE_OPEN_NO_MUTEX | OpenFlags::SQLITE_OPEN_URI;
        let conn = Connection::open_with_flags(path, flags)?;
        Ok(Box::new(EmbeddedSession {
            conn,
            statement_timeout: None,
        }))
    }
}

struct EmbeddedSession {
    conn: Connection,
    statement_timeout: Option<Duration>,
}

impl EmbeddedSession {
    /// Run `work` under the statement deadline, if one is set. The progress
    /// handler interrupts the statement once the deadline passes.
    fn bounded<T>(
        &self,
        sql: &str,
        work: impl FnOnce(&Connection) -> rusqlite::Result<T>,
    ) -> DbResult<T> {
        let Some(timeout) = self.statement_timeout else {
            return Ok(work(&self.conn)?);
        };
        let start = Instant::now();
        let deadline = start + timeout;
        self.conn
            .progress_handler(PROGRESS_OPS, Some(move || Instant::now() >= deadline));
        let result = work(&self.conn);
        self.conn.progress_handler(0, None::<fn() -> bool>);
        result.map_err(|e| {
            if is_interrupt(&e) {
                tracing::warn!(sql, timeout_ms = timeout.as_millis(), "statement interrupted");
                DbError::Timeout {
                    operation: sql.to_string(),
                    after: start.elapsed(),
                }
            } else {
                e.into()
            }
        })
    }
}

fn is_interrupt(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _) if e.code == rusqlite::ErrorCode::OperationInterrupted
    )
}

fn value_to_text(value: ValueRef<'_>) -> String {
    match value {
        ValueRef::Null => String::new(),
        ValueRef::Integer(i) => i.to_string(),
        ValueRef::Real(f) => f.to_string(),
        ValueRef::Text(t) => String::from_utf8_lossy(t).into_owned(),
        ValueRef::Blob(b) => format!("<blob {} bytes>", b.len()),
    }
}

impl DbSession for EmbeddedSession {
    fn set_busy_timeout(&mut self, timeout: Duration) -> DbResult<()> {
        self.conn.busy_timeout(timeout)?;
        Ok(())
    }

    fn set_statement_timeout(&mut self, timeout: Duration) -> DbResult<()> {
        self.statement_timeout = Some(timeout);
        Ok(())
    }

    fn query(&mut self, sql: &str) -> DbResult<Vec<Vec<String>>> {
        self.bounded(sql, |conn| {
            let mut stmt = conn.prepare(sql)?;
            let ncols = stmt.column_count();
            let rows = stmt.query_map([], |row| {
                (0..ncols)
                    .map(|i| row.get_ref(i).map(value_to_text))
                    .collect::<rusqlite::Result<Vec<String>>>()
            })?;
            rows.collect()
        })
    }

    fn execute(&mut self, sql: &str) -> DbResult<()> {
        self.bounded(sql, |conn| conn.execute_batch(sql))
    }

    fn online_copy(&mut self, dest: &Path, deadline: Duration) -> DbResult<()> {
        let start = Instant::now();
        let mut dst = Connection::open(dest)?;
        {
            let backup = Backup::new(&self.conn, &mut dst)?;
            loop {
                match backup.step(PAGES_PER_STEP)? {
                    StepResult::Done => break,
                    StepResult::More => {}
                    _ => std::thread::sleep(STEP_PAUSE),
                }
                if start.elapsed() >= deadline {
                    return Err(DbError::Timeout {
                        operation: "online copy".to_string(),
                        after: start.elapsed(),
                    });
                }
            }
        }
        // The copy is a standalone artifact: no WAL companions.
        dst.execute_batch("PRAGMA journal_mode=DELETE;")?;
        dst.close().map_err(|(_, e)| DbError::from(e))
    }

    fn close(self: Box<Self>) -> DbResult<()> {
        self.conn.close().map_err(|(_, e)| DbError::from(e))
    }
}

// ---------------------------------------------------------------------------
// External process (sqlite3 CLI)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct CliDriver {
    bin: String,
    command_timeout: Duration,
}

impl CliDriver {
    #[must_use]
    pub fn new(bin: impl Into<String>, command_timeout: Duration) -> Self {
        Self {
            bin: bin.into(),
            command_timeout,
        }
    }

    /// Run `sqlite3 -version` to confirm the binary is present.
    pub fn probe(&self) -> DbResult<String> {
        let mut cmd = Command::new(&self.bin);
        cmd.arg("-version");
        let out = run_with_timeout(cmd, self.command_timeout, "sqlite3 -version")?;
        Ok(out.trim().to_string())
    }
}

impl DatabaseDriver for CliDriver {
    fn kind(&self) -> DriverKind {
        DriverKind::Cli
    }

    fn open(&self, path: &Path, mode: OpenMode) -> DbResult<Box<dyn DbSession>> {
        if !path.exists() {
            return Err(DbError::NotFound(path.display().to_string()));
        }
        Ok(Box::new(CliSession {
            bin: self.bin.clone(),
            path: path.to_path_buf(),
            read_only: mode == OpenMode::ReadOnly,
            busy_timeout: Duration::ZERO,
            command_timeout: self.command_timeout,
        }))
    }
}

struct CliSession {
    bin: String,
    path: PathBuf,
    read_only: bool,
    busy_timeout: Duration,
    command_timeout: Duration,
}

impl CliSession {
    fn command(&self, sql: &str) -> Command {
        let mut cmd = Command::new(&self.bin);
        cmd.arg("-batch")
            .arg("-noheader")
            .arg("-separator")
            .arg(CLI_SEPARATOR);
        if self.read_only {
            cmd.arg("-readonly");
        }
        if !self.busy_timeout.is_zero() {
            cmd.arg("-cmd")
                .arg(format!(".timeout {}", self.busy_timeout.as_millis()));
        }
        cmd.arg(&self.path).arg(sql);
        cmd
    }
}

impl DbSession for CliSession {
    fn set_busy_timeout(&mut self, timeout: Duration) -> DbResult<()> {
        self.busy_timeout = timeout;
        Ok(())
    }

    fn set_statement_timeout(&mut self, timeout: Duration) -> DbResult<()> {
        self.command_timeout = timeout;
        Ok(())
    }

    fn query(&mut self, sql: &str) -> DbResult<Vec<Vec<String>>> {
        let stdout = run_with_timeout(self.command(sql), self.command_timeout, sql)?;
        Ok(stdout
            .lines()
            .filter(|line| !line.is_empty())
            .map(|line| line.split(CLI_SEPARATOR).map(str::to_string).collect())
            .collect())
    }

    fn execute(&mut self, sql: &str) -> DbResult<()> {
        run_with_timeout(self.command(sql), self.command_timeout, sql).map(|_| ())
    }

    fn online_copy(&mut self, dest: &Path, deadline: Duration) -> DbResult<()> {
        let dot = format!(".backup {}", sql_quote(&dest.display().to_string()));
        run_with_timeout(self.command(&dot), deadline, ".backup")?;
        let mut copy = CliSession {
            bin: self.bin.clone(),
            path: dest.to_path_buf(),
            read_only: false,
            busy_timeout: Duration::ZERO,
            command_timeout: self.command_timeout,
        };
        copy.query("PRAGMA journal_mode=DELETE;").map(|_| ())
    }

    fn close(self: Box<Self>) -> DbResult<()> {
        Ok(())
    }
}

fn read_pipe<R: Read>(pipe: Option<R>) -> String {
    let mut buf = Vec::new();
    if let Some(mut p) = pipe {
        let _ = p.read_to_end(&mut buf);
    }
    String::from_utf8_lossy(&buf).into_owned()
}

/// Spawn `cmd`, wait at most `timeout`, kill it on expiry.
fn run_with_timeout(mut cmd: Command, timeout: Duration, operation: &str) -> DbResult<String> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    let mut child = cmd.spawn().map_err(|e| {
        DbError::Unavailable(format!("cannot spawn {:?}: {e}", cmd.get_program()))
    })?;

    // Drain both pipes on their own threads so a chatty child never blocks.
    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    let out_reader = std::thread::spawn(move || read_pipe(stdout));
    let err_reader = std::thread::spawn(move || read_pipe(stderr));

    let start = Instant::now();
    let status = loop {
        if let Some(status) = child.try_wait()? {
            break status;
        }
        if start.elapsed() >= timeout {
            let _ = child.kill();
            let _ = child.wait();
            tracing::warn!(operation, timeout_ms = timeout.as_millis(), "sqlite3 process killed");
            return Err(DbError::Timeout {
                operation: operation.to_string(),
                after: start.elapsed(),
            });
        }
        std::thread::sleep(PROCESS_POLL);
    };

    let stdout = out_reader.join().unwrap_or_default();
    let stderr = err_reader.join().unwrap_or_default();
    // sqlite3 reports some errors on stderr while still exiting 0.
    if !status.success() || stderr.trim_start().starts_with("Error") {
        return Err(DbError::Process {
            status: status.to_string(),
            stderr: stderr.trim().to_string(),
        });
    }
    Ok(stdout)
}

// ---------------------------------------------------------------------------
// Capability probing
// ---------------------------------------------------------------------------

/// Select a driver according to `preference`.
///
/// `Auto` tries the embedded library first and falls back to the CLI.
pub fn probe_driver(
    preference: DriverPreference,
    sqlite3_bin: &str,
    command_timeout: Duration,
) -> DbResult<Arc<dyn DatabaseDriver>> {
    let try_embedded = || -> DbResult<Arc<dyn DatabaseDriver>> {
        let version = EmbeddedDriver::probe()?;
        tracing::debug!(driver = "embedded", sqlite_version = %version, "driver probe ok");
        Ok(Arc::new(EmbeddedDriver))
    };
    let try_cli = || -> DbResult<Arc<dyn DatabaseDriver>> {
        let cli = CliDriver::new(sqlite3_bin, command_timeout);
        let version = cli.probe()?;
        tracing::debug!(driver = "cli", sqlite_version = %version, "driver probe ok");
        Ok(Arc::new(cli))
    };

    match preference {
        DriverPreference::Embedded => try_embedded(),
        DriverPreference::Cli => try_cli(),
        DriverPreference::Auto => try_embedded().or_else(|embedded_err| {
            tracing::warn!(error = %embedded_err, "embedded driver unusable, probing sqlite3 CLI");
            try_cli().map_err(|cli_err| {
                DbError::Unavailable(format!("embedded: {embedded_err}; cli: {cli_err}"))
            })
        }),
    }
}

/// [`probe_driver`] with settings from `config`.
pub fn driver_from_config(config: &Config) -> DbResult<Arc<dyn DatabaseDriver>> {
    probe_driver(config.driver, &config.sqlite3_bin, config.command_timeout)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_db(dir: &Path) -> PathBuf {
        let path = dir.join("probe.db");
        let conn = Connection::open(&path).unwrap();
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;
             CREATE TABLE t (id INTEGER PRIMARY KEY, v TEXT);
             INSERT INTO t (v) VALUES ('a'), ('b'), (NULL);",
        )
        .unwrap();
        path
    }

    #[test]
    fn embedded_probe_reports_version() {
        let version = EmbeddedDriver::probe().expect("bundled sqlite works");
        assert!(version.starts_with('3'));
    }

    #[test]
    fn embedded_open_missing_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let err = EmbeddedDriver
            .open(&dir.path().join("nope.db"), OpenMode::ReadWrite)
            .err()
            .expect("missing file");
        assert!(matches!(err, DbError::NotFound(_)));
        assert!(!dir.path().join("nope.db").exists(), "open must not create");
    }

    #[test]
    fn embedded_query_renders_text() {
        let dir = tempfile::tempdir().unwrap();
        let path = make_db(dir.path());
        let mut session = EmbeddedDriver.open(&path, OpenMode::ReadOnly).unwrap();
        let rows = session.query("SELECT id, v FROM t ORDER BY id").unwrap();
        assert_eq!(
            rows,
            vec![
                vec!["1".to_string(), "a".to_string()],
                vec!["2".to_string(), "b".to_string()],
                vec!["3".to_string(), String::new()],
            ]
        );
        assert_eq!(
            query_scalar(session.as_mut(), "PRAGMA journal_mode").unwrap(),
            Some("wal".to_string())
        );
        session.close().unwrap();
    }

    #[test]
    fn embedded_online_copy_produces_standalone_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = make_db(dir.path());
        let dest = dir.path().join("copy.db");
        let mut session = EmbeddedDriver.open(&path, OpenMode::ReadWrite).unwrap();
        session
            .online_copy(&dest, Duration::from_secs(10))
            .expect("online copy");
        session.close().unwrap();

        let copy = Connection::open(&dest).unwrap();
        let n: i64 = copy.query_row("SELECT COUNT(*) FROM t", [], |r| r.get(0)).unwrap();
        assert_eq!(n, 3);
        let mode: String = copy
            .query_row("PRAGMA journal_mode", [], |r| r.get(0))
            .unwrap();
        assert_eq!(mode, "delete");
    }

    #[test]
    fn embedded_statement_timeout_interrupts_long_query() {
        let dir = tempfile::tempdir().unwrap();
        let path = make_db(dir.path());
        let mut session = EmbeddedDriver.open(&path, OpenMode::ReadOnly).unwrap();
        session
            .set_statement_timeout(Duration::from_millis(50))
            .unwrap();

        let start = Instant::now();
        let err = session
            .query(
                "WITH RECURSIVE c(x) AS (SELECT 1 UNION ALL SELECT x + 1 FROM c WHERE x < 2000000000)
                 SELECT count(*) FROM c",
            )
            .unwrap_err();
        assert!(matches!(err, DbError::Timeout { .. }), "{err}");
        assert!(start.elapsed() < Duration::from_secs(5));

        // The deadline is per statement: a short query still runs.
        let rows = session.query("SELECT count(*) FROM t").unwrap();
        assert_eq!(rows, vec![vec!["3".to_string()]]);
        session.close().unwrap();
    }

    #[test]
    fn sql_quote_escapes_single_quotes() {
        assert_eq!(sql_quote("/tmp/it's.db"), "'/tmp/it''s.db'");
    }

    #[test]
    fn missing_cli_binary_is_unavailable() {
        let cli = CliDriver::new("/definitely/not/sqlite3", Duration::from_secs(1));
        assert!(matches!(cli.probe(), Err(DbError::Unavailable(_))));
        assert!(matches!(
            probe_driver(
                DriverPreference::Cli,
                "/definitely/not/sqlite3",
                Duration::from_secs(1)
            ),
            Err(DbError::Unavailable(_))
        ));
    }

    #[test]
    fn auto_prefers_embedded() {
        let driver =
            probe_driver(DriverPreference::Auto, "/definitely/not/sqlite3", Duration::from_secs(1))
                .expect("embedded available");
        assert_eq!(driver.kind(), DriverKind::Embedded);
    }

    #[cfg(unix)]
    #[test]
    fn process_timeout_kills_child() {
        let mut cmd = Command::new("sleep");
        cmd.arg("5");
        let start = Instant::now();
        let err = run_with_timeout(cmd, Duration::from_millis(100), "sleep").unwrap_err();
        assert!(matches!(err, DbError::Timeout { .. }));
        assert!(start.elapsed() < Duration::from_secs(4));
    }
}
