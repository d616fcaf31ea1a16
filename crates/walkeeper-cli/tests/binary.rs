//! The `walkeeper` binary end to end.

use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

fn walkeeper(dir: &Path) -> Command {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_walkeeper"));
    cmd.current_dir(dir)
        .env("LOGS_DIR", dir.join("logs"))
        .env("BACKUP_DIR", dir.join("backups"))
        .env("METRICS_PORT", "0")
        .env("RUST_LOG", "info");
    cmd
}

fn wal_db(dir: &Path) -> PathBuf {
    let path = dir.join("app.db");
    let conn = rusqlite::Connection::open(&path).unwrap();
    conn.execute_batch(
        "PRAGMA journal_mode=WAL;
         CREATE TABLE t (id INTEGER PRIMARY KEY, v TEXT);
         INSERT INTO t (v) VALUES ('x');",
    )
    .unwrap();
    path
}

fn single_json_line(stdout: &[u8]) -> serde_json::Value {
    let text = String::from_utf8_lossy(stdout);
    let lines: Vec<&str> = text.lines().filter(|l| !l.trim().is_empty()).collect();
    assert_eq!(lines.len(), 1, "stdout: {text}");
    serde_json::from_str(lines[0]).unwrap()
}

#[test]
fn stdout_carries_exactly_one_report() {
    let dir = tempfile::tempdir().unwrap();
    let db = wal_db(dir.path());
    let out = walkeeper(dir.path())
        .args(["checkpoint", db.to_str().unwrap(), "--truncate"])
        .output()
        .unwrap();
    assert_eq!(out.status.code(), Some(0));
    let v = single_json_line(&out.stdout);
    assert_eq!(v["command"], "checkpoint");
    assert!(!out.stderr.is_empty(), "logs go to stderr");
}

#[test]
fn db_path_comes_from_dotenv() {
    let dir = tempfile::tempdir().unwrap();
    let db = wal_db(dir.path());
    std::fs::write(
        dir.path().join(".env"),
        format!("DB_PATH={}\n", db.display()),
    )
    .unwrap();
    let out = walkeeper(dir.path())
        .env_remove("DB_PATH")
        .args(["health"])
        .output()
        .unwrap();
    let v = single_json_line(&out.stdout);
    assert_eq!(v["database"], "app");
    assert_eq!(out.status.code(), Some(0));
}

#[test]
fn usage_error_is_reported_as_json() {
    let dir = tempfile::tempdir().unwrap();
    let out = walkeeper(dir.path()).args(["backup"]).output().unwrap();
    assert_eq!(out.status.code(), Some(1));
    let v = single_json_line(&out.stdout);
    assert_eq!(v["error_code"], "INVALID_ARGUMENT");
}

#[cfg(unix)]
#[test]
fn scheduler_stops_cleanly_on_sigterm() {
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;
    use std::io::{BufRead, BufReader};

    let dir = tempfile::tempdir().unwrap();
    let db = wal_db(dir.path());
    let mut child = walkeeper(dir.path())
        .args(["scheduler", "start", db.to_str().unwrap()])
        .env("CHECKPOINT_INTERVAL", "1")
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .unwrap();

    let (tx, rx) = std::sync::mpsc::channel::<String>();
    let stderr = child.stderr.take().unwrap();
    let drain = std::thread::spawn(move || {
        for line in BufReader::new(stderr).lines().map_while(Result::ok) {
            let _ = tx.send(line);
        }
    });

    let deadline = Instant::now() + Duration::from_secs(20);
    let mut started = false;
    while !started && Instant::now() < deadline {
        if let Ok(line) = rx.recv_timeout(Duration::from_millis(200)) {
            started = line.contains("scheduler started");
        }
    }
    assert!(started, "scheduler never reported start");
    // Let the select loop install its signal handlers and run a tick.
    std::thread::sleep(Duration::from_millis(1_500));

    let pid = Pid::from_raw(i32::try_from(child.id()).unwrap());
    kill(pid, Signal::SIGTERM).unwrap();
    let out = child.wait_with_output().unwrap();
    drain.join().unwrap();
    let logs: Vec<String> = rx.try_iter().collect();

    assert_eq!(out.status.code(), Some(0), "stderr: {logs:?}");
    let v = single_json_line(&out.stdout);
    assert_eq!(v["command"], "scheduler start");
    assert_eq!(v["state"]["phase"], "shutting_down");
    assert_eq!(v["final_checkpoint"]["mode"], "TRUNCATE");
    assert_eq!(v["final_checkpoint"]["succeeded"], true);
    assert!(logs.iter().any(|l| l.contains("scheduler stopped")), "{logs:?}");
}

#[cfg(unix)]
#[test]
fn sigterm_mid_backup_leaves_no_lock_or_partial_files() {
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;

    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("big.db");
    let conn = rusqlite::Connection::open(&db).unwrap();
    conn.execute_batch(
        "PRAGMA journal_mode=WAL;
         CREATE TABLE blobs (id INTEGER PRIMARY KEY, data BLOB);
         WITH RECURSIVE n(i) AS (SELECT 1 UNION ALL SELECT i + 1 FROM n WHERE i < 16000)
         INSERT INTO blobs (data) SELECT randomblob(4096) FROM n;",
    )
    .unwrap();
    drop(conn);
    let dest = dir.path().join("out");
    let lock = walkeeper_backup::lock_path(&db);

    let mut child = walkeeper(dir.path())
        .args(["backup", db.to_str().unwrap(), dest.to_str().unwrap()])
        .args(["--mode", "vacuum", "--deep"])
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .unwrap();

    let deadline = Instant::now() + Duration::from_secs(20);
    let mut signalled = false;
    while Instant::now() < deadline {
        if child.try_wait().unwrap().is_some() {
            break;
        }
        if lock.exists() {
            let pid = Pid::from_raw(i32::try_from(child.id()).unwrap());
            kill(pid, Signal::SIGTERM).unwrap();
            signalled = true;
            break;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    let out = child.wait_with_output().unwrap();
    let v = single_json_line(&out.stdout);
    assert_eq!(v["command"], "backup");

    if v["ok"] == true {
        // The backup won the race.
        assert_eq!(out.status.code(), Some(0));
    } else {
        assert!(signalled, "{v}");
        assert_eq!(out.status.code(), Some(1), "{v}");
        assert_eq!(v["error_code"], "INTERRUPTED");
    }
    assert!(!lock.exists(), "lock file survived: {v}");
    if dest.exists() {
        let partials: Vec<String> = std::fs::read_dir(&dest)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .filter(|name| name.contains(".partial"))
            .collect();
        assert!(partials.is_empty(), "{partials:?}");
    }
}
