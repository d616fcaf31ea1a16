//! CLI commands for walkeeper.
//!
//! - `checkpoint`: one WAL checkpoint
//! - `backup`: a locked, verified backup with retention pruning
//! - `health`: one sample, a continuous loop, or a loop plus metrics endpoint
//! - `scheduler`: the long-running daemon and its one-shot ticks
//! - `verify`: integrity tiers against an optional reference
//! - `lock status`: inspect the backup lock sidecar
//!
//! Every command finishes with one JSON [`Report`] line on stdout and a
//! matching exit code; logs go to stderr.

#![forbid(unsafe_code)]

pub mod output;
pub mod scheduler;

use clap::{Args, Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing_subscriber::EnvFilter;
use walkeeper_backup::{
    BackupError, BackupJob, BackupOrchestrator, BackupResult, LockManager, release_all_held,
};
use walkeeper_core::{BackupMode, CheckpointMode, Config, ConfigError, LogFormat};
use walkeeper_db::{
    CheckpointRequest, CheckpointResult, DatabaseDriver, DbError, VerifyOptions,
    driver_from_config, verify,
};
use walkeeper_monitor::{HealthMonitor, HealthSample, exporter};

pub use output::Report;
pub use scheduler::{Scheduler, SchedulerState};

/// Port used by `health --export-metrics` when `METRICS_PORT` is unset.
pub const DEFAULT_METRICS_PORT: u16 = 9187;

#[derive(Debug, thiserror::Error)]
pub enum CliError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Db(#[from] DbError),
    #[error(transparent)]
    Backup(#[from] BackupError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl CliError {
    #[must_use]
    pub const fn exit_code(&self) -> i32 {
        match self {
            Self::Backup(e) => e.exit_code(),
            Self::Config(_) | Self::Db(_) | Self::Io(_) => 1,
        }
    }

    #[must_use]
    pub const fn error_code(&self) -> &'static str {
        match self {
            Self::Config(_) => "CONFIG_INVALID",
            Self::Db(e) => e.error_code(),
            Self::Backup(e) => e.error_code(),
            Self::Io(_) => "IO_ERROR",
        }
    }
}

pub type CliResult<T> = Result<T, CliError>;

#[derive(Parser, Debug)]
#[command(
    name = "walkeeper",
    version,
    about = "WAL checkpointing, verified backups and health monitoring for SQLite"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Fold the WAL back into the database file
    Checkpoint {
        /// Database path (default: DB_PATH)
        db: Option<PathBuf>,
        /// Shorthand for --mode truncate
        #[arg(long, conflicts_with = "mode")]
        truncate: bool,
        /// passive, full, restart or truncate (default: CHECKPOINT_MODE)
        #[arg(long, value_parser = parse_checkpoint_mode)]
        mode: Option<CheckpointMode>,
    },
    /// Take a verified backup
    Backup(BackupArgs),
    /// Sample WAL health
    Health(HealthArgs),
    /// Run the maintenance daemon or one of its ticks
    Scheduler {
        #[command(subcommand)]
        action: SchedulerCommand,
    },
    /// Check a database file's integrity
    Verify {
        candidate: PathBuf,
        /// Compare size and schema against this database
        #[arg(long)]
        reference: Option<PathBuf>,
        /// Add quick_check and schema-count parity
        #[arg(long)]
        deep: bool,
    },
    /// Inspect backup locks
    Lock {
        #[command(subcommand)]
        action: LockCommand,
    },
}

#[derive(Args, Debug)]
pub struct BackupArgs {
    pub source: PathBuf,
    pub dest_dir: PathBuf,
    /// auto, vacuum (snapshot) or backup (online copy)
    #[arg(long, value_parser = parse_backup_mode)]
    pub mode: Option<BackupMode>,
    /// Gzip the artifact
    #[arg(long)]
    pub compress: bool,
    /// Skip post-copy verification
    #[arg(long)]
    pub no_verify: bool,
    /// Deep verification (quick_check and schema parity)
    #[arg(long)]
    pub deep: bool,
    /// Prune artifacts older than this many days (default: MAX_BACKUP_DAYS)
    #[arg(long)]
    pub keep_days: Option<u64>,
}

#[derive(Args, Debug)]
pub struct HealthArgs {
    /// Database path (default: DB_PATH)
    pub db: Option<PathBuf>,
    /// Sample every CHECK_INTERVAL until interrupted
    #[arg(long, conflicts_with_all = ["check_once", "export_metrics"])]
    pub continuous: bool,
    /// Take a single sample (default)
    #[arg(long, conflicts_with = "export_metrics")]
    pub check_once: bool,
    /// Sample continuously and serve /metrics and /health
    #[arg(long)]
    pub export_metrics: bool,
}

#[derive(Subcommand, Debug)]
pub enum SchedulerCommand {
    /// Run timers until SIGINT/SIGTERM
    Start { db: Option<PathBuf> },
    /// Run one checkpoint tick
    Checkpoint { db: Option<PathBuf> },
    /// Run one backup tick into BACKUP_DIR
    Backup { db: Option<PathBuf> },
    /// Run one health tick
    Health { db: Option<PathBuf> },
}

#[derive(Subcommand, Debug)]
pub enum LockCommand {
    /// Show the current lock record for a database
    Status { db: PathBuf },
}

fn parse_checkpoint_mode(raw: &str) -> Result<CheckpointMode, String> {
    CheckpointMode::parse(raw)
        .ok_or_else(|| format!("unknown mode {raw:?} (expected passive, full, restart, truncate)"))
}

fn parse_backup_mode(raw: &str) -> Result<BackupMode, String> {
    BackupMode::parse(raw).ok_or_else(|| format!("unknown mode {raw:?} (expected auto, vacuum, backup)"))
}

impl Commands {
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Checkpoint { .. } => "checkpoint",
            Self::Backup(_) => "backup",
            Self::Health(_) => "health",
            Self::Scheduler { action } => match action {
                SchedulerCommand::Start { .. } => "scheduler start",
                SchedulerCommand::Checkpoint { .. } => "scheduler checkpoint",
                SchedulerCommand::Backup { .. } => "scheduler backup",
                SchedulerCommand::Health { .. } => "scheduler health",
            },
            Self::Verify { .. } => "verify",
            Self::Lock { .. } => "lock status",
        }
    }
}

/// Install the stderr subscriber. `RUST_LOG` filters (default `info`).
pub fn init_logging(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    // A subscriber may already be installed (tests, embedding); keep it.
    let _ = match format {
        LogFormat::Json => builder.json().try_init(),
        LogFormat::Text => builder.try_init(),
    };
}

/// Parse the process arguments, run, and return the exit code.
pub fn run() -> i32 {
    run_from(std::env::args_os())
}

pub fn run_from<I, T>(args: I) -> i32
where
    I: IntoIterator<Item = T>,
    T: Into<std::ffi::OsString> + Clone,
{
    let cli = match Cli::try_parse_from(args) {
        Ok(cli) => cli,
        Err(err) => {
            use clap::error::ErrorKind;
            let _ = err.print();
            if matches!(err.kind(), ErrorKind::DisplayHelp | ErrorKind::DisplayVersion) {
                return 0;
            }
            let message = err.to_string();
            let first = message.lines().next().unwrap_or("invalid arguments");
            let report = Report::failure("walkeeper", 1, "INVALID_ARGUMENT", first);
            report.emit();
            return report.exit_code();
        }
    };

    let config = Config::from_env();
    init_logging(config.log_format);
    for warning in &config.load_warnings {
        tracing::warn!(%warning, "configuration");
    }

    let report = execute(cli, config);
    report.emit();
    report.exit_code()
}

/// Run a parsed command against `config`. Never fails: errors become a
/// failed [`Report`] with the matching exit code.
#[must_use]
pub fn execute(cli: Cli, mut config: Config) -> Report {
    let name = cli.command.name();
    match dispatch(cli.command, &mut config) {
        Ok(report) => report,
        Err(err) => {
            tracing::error!(command = name, error_code = err.error_code(), error = %err, "command failed");
            Report::failure(name, err.exit_code(), err.error_code(), err.to_string())
        }
    }
}

fn dispatch(command: Commands, config: &mut Config) -> CliResult<Report> {
    match command {
        Commands::Checkpoint { db, truncate, mode } => {
            let driver = prepare(config, db)?;
            let mode = if truncate {
                CheckpointMode::Truncate
            } else {
                mode.unwrap_or(config.checkpoint_mode)
            };
            let req = CheckpointRequest::new(&config.db_path, mode)
                .with_busy_timeout(config.busy_timeout)
                .with_timeout(config.command_timeout);
            let result = walkeeper_db::checkpoint(driver.as_ref(), &req);
            Ok(checkpoint_report("checkpoint", config, &result))
        }
        Commands::Backup(args) => handle_backup(config, args),
        Commands::Health(args) => handle_health(config, &args),
        Commands::Scheduler { action } => handle_scheduler(config, action),
        Commands::Verify {
            candidate,
            reference,
            deep,
        } => {
            let driver = driver_from_config(config)?;
            let opts = VerifyOptions {
                deep: deep || config.verify_deep,
                size_tolerance: config.verify_size_tolerance,
            };
            let result = verify(driver.as_ref(), &candidate, reference.as_deref(), &opts);
            let mut report = Report::new("verify")
                .with("candidate", &candidate)
                .with_fields(&result);
            if !result.passed {
                report = report
                    .with_exit_code(4)
                    .with("error_code", "VERIFICATION_FAILED");
            }
            Ok(report)
        }
        Commands::Lock {
            action: LockCommand::Status { db },
        } => {
            let status = LockManager::new(config.lock_stale_after).status(&db);
            Ok(Report::new("lock status")
                .with("database", &db)
                .with_fields(&status))
        }
    }
}

/// Point `config` at `db` (when given), validate it, and pick a driver.
fn prepare(config: &mut Config, db: Option<PathBuf>) -> CliResult<Arc<dyn DatabaseDriver>> {
    if let Some(db) = db {
        config.db_path = db;
    }
    for warning in config.validate()? {
        tracing::warn!(%warning, "configuration");
    }
    Ok(driver_from_config(config)?)
}

fn checkpoint_report(command: &str, config: &Config, result: &CheckpointResult) -> Report {
    let mut report = Report::new(command)
        .with("database", &config.db_path)
        .with_fields(result);
    if !result.succeeded {
        report = report
            .with_exit_code(1)
            .with("error_code", "CHECKPOINT_FAILED");
    } else if result.blocked() {
        report = report.with("warning", "CHECKPOINT_BLOCKED");
    }
    report
}

/// Health exit codes follow the sample status: 0 normal, 1 warning,
/// 2 critical.
fn health_report(command: &str, sample: &HealthSample) -> Report {
    Report::new(command)
        .with_exit_code(i32::from(sample.status as u8))
        .with_fields(sample)
}

fn handle_backup(config: &mut Config, args: BackupArgs) -> CliResult<Report> {
    let driver = prepare(config, Some(args.source))?;
    let mut job = BackupJob::from_config(config);
    job.destination_dir = args.dest_dir;
    if let Some(mode) = args.mode {
        job.backend = mode;
    }
    job.compress |= args.compress;
    job.verify = job.verify && !args.no_verify;
    job.deep_verify |= args.deep;
    if let Some(days) = args.keep_days {
        job.retention_days = days;
    }

    let orchestrator = BackupOrchestrator::new(driver, LockManager::new(config.lock_stale_after));
    let work = {
        let job = job.clone();
        move || orchestrator.backup(&job)
    };
    interruptible_backup("backup", &job, work)
}

/// Run a one-shot backup on the blocking pool, racing it against SIGINT and
/// SIGTERM. On a signal the job's unfinished files are deleted, then every
/// lock this process holds is released, and the copy thread is abandoned.
fn interruptible_backup<W>(command: &'static str, job: &BackupJob, work: W) -> CliResult<Report>
where
    W: FnOnce() -> Result<BackupResult, BackupError> + Send + 'static,
{
    let rt = runtime()?;
    let outcome = rt.block_on(async {
        let signal = scheduler::shutdown_signal();
        tokio::pin!(signal);
        // The first poll installs the handlers; do it before the copy can
        // take the lock.
        tokio::select! {
            biased;
            () = &mut signal => return None,
            () = std::future::ready(()) => {}
        }
        let task = tokio::task::spawn_blocking(work);
        tokio::select! {
            joined = task => Some(joined),
            () = &mut signal => None,
        }
    });
    rt.shutdown_background();

    match outcome {
        Some(Ok(result)) => Ok(Report::new(command).with_fields(&result?)),
        Some(Err(e)) => Err(CliError::Io(std::io::Error::other(e))),
        None => {
            let removed = job.discard_unfinished();
            let locks_released = release_all_held();
            tracing::warn!(
                target: "maintenance",
                source = %job.source_path.display(),
                removed = removed.len(),
                locks_released,
                "backup interrupted"
            );
            Ok(
                Report::failure(command, 1, "INTERRUPTED", "backup interrupted by signal")
                    .with("source_path", &job.source_path)
                    .with("removed", &removed)
                    .with("locks_released", locks_released),
            )
        }
    }
}

fn handle_health(config: &mut Config, args: &HealthArgs) -> CliResult<Report> {
    let driver = prepare(config, args.db.clone())?;
    let monitor = HealthMonitor::from_config(config, driver);

    if args.continuous || args.export_metrics {
        let port = if args.export_metrics && config.metrics_port == 0 {
            DEFAULT_METRICS_PORT
        } else {
            config.metrics_port
        };
        let samples = run_continuous(monitor, config.check_interval, port)?;
        return Ok(Report::new("health")
            .with("mode", if args.export_metrics { "export_metrics" } else { "continuous" })
            .with("database", &config.db_path)
            .with("samples", samples)
            .with("metrics_port", port));
    }

    Ok(health_report("health", &monitor.sample()))
}

fn runtime() -> std::io::Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("walkeeper")
        .build()
}

/// Sample on the blocking pool until a termination signal, optionally
/// serving metrics on `metrics_port`. Returns the number of samples taken.
fn run_continuous(monitor: HealthMonitor, interval: Duration, metrics_port: u16) -> CliResult<u64> {
    let rt = runtime()?;
    let monitor = Arc::new(monitor);
    let stop = Arc::new(AtomicBool::new(false));

    let samples = rt.block_on(async {
        let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
        let endpoint = (metrics_port != 0).then(|| {
            let addr = SocketAddr::from(([0, 0, 0, 0], metrics_port));
            let metrics = monitor.metrics();
            tokio::spawn(async move {
                let stopped = async move {
                    let _ = stop_rx.await;
                };
                if let Err(e) = exporter::serve(addr, metrics, stopped).await {
                    tracing::error!(%addr, error = %e, "metrics endpoint failed");
                }
            })
        });

        let worker = {
            let monitor = Arc::clone(&monitor);
            let stop = Arc::clone(&stop);
            tokio::task::spawn_blocking(move || monitor.run(interval, &stop))
        };

        scheduler::shutdown_signal().await;
        stop.store(true, Ordering::Release);
        let _ = stop_tx.send(());
        let samples = worker.await.unwrap_or_else(|e| {
            tracing::error!(error = %e, "health loop task failed");
            0
        });
        if let Some(endpoint) = endpoint {
            let _ = endpoint.await;
        }
        samples
    });
    Ok(samples)
}

fn handle_scheduler(config: &mut Config, action: SchedulerCommand) -> CliResult<Report> {
    match action {
        SchedulerCommand::Start { db } => {
            let driver = prepare(config, db)?;
            let daemon = Arc::new(Scheduler::new(config.clone(), driver));
            let report = runtime()?.block_on(daemon.run(scheduler::shutdown_signal()));
            Ok(Report::new("scheduler start")
                .with("database", &config.db_path)
                .with_fields(&report))
        }
        SchedulerCommand::Checkpoint { db } => {
            let driver = prepare(config, db)?;
            let scheduler = Scheduler::new(config.clone(), driver);
            let result = scheduler.checkpoint_tick();
            Ok(checkpoint_report("scheduler checkpoint", config, &result))
        }
        SchedulerCommand::Backup { db } => {
            let driver = prepare(config, db)?;
            let job = BackupJob::from_config(config);
            let scheduler = Scheduler::new(config.clone(), driver);
            interruptible_backup("scheduler backup", &job, move || scheduler.backup_tick())
        }
        SchedulerCommand::Health { db } => {
            let driver = prepare(config, db)?;
            let scheduler = Scheduler::new(config.clone(), driver);
            Ok(health_report("scheduler health", &scheduler.health_tick()))
        }
    }
}
