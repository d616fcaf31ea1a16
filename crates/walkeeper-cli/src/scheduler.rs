//! The long-running maintenance scheduler.
//!
//! One `tokio::select!` loop owns three timers (checkpoint, health, backup)
//! and the shutdown future. Checkpoint and health ticks run one at a time on
//! the blocking pool. Backups are spawned into a `JoinSet` so a long copy
//! does not hold up checkpoints; at most `MAX_CONCURRENT` run at once and a
//! backup tick that finds every slot taken is skipped. On shutdown the timers
//! are dropped, in-flight backups are awaited, any backup locks this process
//! still holds are released, and a final TRUNCATE checkpoint folds the WAL
//! back into the database before exit.

#![forbid(unsafe_code)]

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;
use tokio::sync::{Semaphore, oneshot};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{Instant, Interval, MissedTickBehavior};
use walkeeper_backup::{
    BackupError, BackupJob, BackupOrchestrator, BackupResult, LockManager, release_all_held,
};
use walkeeper_core::metrics::Counter;
use walkeeper_core::{CheckpointMode, Config};
use walkeeper_db::{CheckpointRequest, CheckpointResult, DatabaseDriver, checkpoint};
use walkeeper_monitor::{HealthMonitor, HealthSample, exporter};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum Phase {
    Idle = 0,
    Running = 1,
    ShuttingDown = 2,
}

impl Phase {
    const fn from_u8(raw: u8) -> Self {
        match raw {
            1 => Self::Running,
            2 => Self::ShuttingDown,
            _ => Self::Idle,
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::ShuttingDown => "shutting_down",
        }
    }
}

/// Counters owned by one scheduler run.
#[derive(Debug)]
pub struct SchedulerState {
    started_at: DateTime<Utc>,
    phase: AtomicU8,
    pub checkpoints_performed: Counter,
    pub checkpoints_failed: Counter,
    pub samples_taken: Counter,
    pub backups_performed: Counter,
    pub backups_failed: Counter,
    /// Backup ticks dropped because every slot was busy.
    pub backups_skipped: Counter,
}

impl Default for SchedulerState {
    fn default() -> Self {
        Self::new()
    }
}

impl SchedulerState {
    #[must_use]
    pub fn new() -> Self {
        Self {
            started_at: Utc::now(),
            phase: AtomicU8::new(Phase::Idle as u8),
            checkpoints_performed: Counter::new(),
            checkpoints_failed: Counter::new(),
            samples_taken: Counter::new(),
            backups_performed: Counter::new(),
            backups_failed: Counter::new(),
            backups_skipped: Counter::new(),
        }
    }

    #[must_use]
    pub fn phase(&self) -> Phase {
        Phase::from_u8(self.phase.load(Ordering::Acquire))
    }

    fn set_phase(&self, next: Phase) {
        let prev = Phase::from_u8(self.phase.swap(next as u8, Ordering::AcqRel));
        if prev != next {
            tracing::debug!(from = prev.as_str(), to = next.as_str(), "scheduler phase");
        }
    }

    #[must_use]
    pub const fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    #[must_use]
    pub fn snapshot(&self) -> StateSnapshot {
        StateSnapshot {
            phase: self.phase(),
            started_at: self.started_at,
            uptime_secs: (Utc::now() - self.started_at).num_seconds().max(0),
            checkpoints_performed: self.checkpoints_performed.load(),
            checkpoints_failed: self.checkpoints_failed.load(),
            samples_taken: self.samples_taken.load(),
            backups_performed: self.backups_performed.load(),
            backups_failed: self.backups_failed.load(),
            backups_skipped: self.backups_skipped.load(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StateSnapshot {
    pub phase: Phase,
    pub started_at: DateTime<Utc>,
    pub uptime_secs: i64,
    pub checkpoints_performed: u64,
    pub checkpoints_failed: u64,
    pub samples_taken: u64,
    pub backups_performed: u64,
    pub backups_failed: u64,
    pub backups_skipped: u64,
}

/// What [`Scheduler::run`] did on the way out.
#[derive(Debug, Clone, Serialize)]
pub struct ShutdownReport {
    pub state: StateSnapshot,
    pub locks_released: usize,
    /// `None` only if the final checkpoint task itself panicked.
    pub final_checkpoint: Option<CheckpointResult>,
}

pub struct Scheduler {
    config: Config,
    driver: Arc<dyn DatabaseDriver>,
    monitor: Arc<HealthMonitor>,
    orchestrator: BackupOrchestrator,
    state: Arc<SchedulerState>,
    backup_slots: Arc<Semaphore>,
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("database", &self.config.db_path)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl Scheduler {
    #[must_use]
    pub fn new(config: Config, driver: Arc<dyn DatabaseDriver>) -> Self {
        let monitor = HealthMonitor::from_config(&config, Arc::clone(&driver));
        let orchestrator = BackupOrchestrator::new(
            Arc::clone(&driver),
            LockManager::new(config.lock_stale_after),
        );
        Self {
            backup_slots: Arc::new(Semaphore::new(config.max_concurrent.max(1))),
            state: Arc::new(SchedulerState::new()),
            monitor: Arc::new(monitor),
            orchestrator,
            driver,
            config,
        }
    }

    /// Replace the health monitor (custom sinks, retry policy, clock).
    #[must_use]
    pub fn with_monitor(mut self, monitor: HealthMonitor) -> Self {
        self.monitor = Arc::new(monitor);
        self
    }

    #[must_use]
    pub fn state(&self) -> Arc<SchedulerState> {
        Arc::clone(&self.state)
    }

    #[must_use]
    pub const fn monitor(&self) -> &Arc<HealthMonitor> {
        &self.monitor
    }

    #[must_use]
    pub const fn config(&self) -> &Config {
        &self.config
    }

    /// One checkpoint in the configured mode.
    pub fn checkpoint_tick(&self) -> CheckpointResult {
        self.checkpoint_with(self.config.checkpoint_mode)
    }

    /// The forced TRUNCATE checkpoint run on shutdown.
    pub fn final_checkpoint(&self) -> CheckpointResult {
        self.checkpoint_with(CheckpointMode::Truncate)
    }

    fn checkpoint_with(&self, mode: CheckpointMode) -> CheckpointResult {
        let req = CheckpointRequest::new(&self.config.db_path, mode)
            .with_busy_timeout(self.config.busy_timeout)
            .with_timeout(self.config.command_timeout);
        let result = checkpoint(self.driver.as_ref(), &req);
        let metrics = self.monitor.metrics();
        if result.succeeded {
            self.state.checkpoints_performed.inc();
            metrics.checkpoints_total.inc();
        } else {
            self.state.checkpoints_failed.inc();
            metrics.checkpoint_failures_total.inc();
            tracing::error!(
                target: "maintenance",
                path = %self.config.db_path.display(),
                mode = %mode,
                error = result.error_detail.as_deref().unwrap_or("unknown"),
                "scheduled checkpoint failed"
            );
        }
        result
    }

    pub fn health_tick(&self) -> HealthSample {
        let sample = self.monitor.sample();
        self.state.samples_taken.inc();
        sample
    }

    /// One backup of the configured database into `BACKUP_DIR`.
    pub fn backup_tick(&self) -> Result<BackupResult, BackupError> {
        let job = BackupJob::from_config(&self.config);
        match self.orchestrator.backup(&job) {
            Ok(result) => {
                self.state.backups_performed.inc();
                Ok(result)
            }
            Err(e) => {
                self.state.backups_failed.inc();
                tracing::error!(
                    target: "maintenance",
                    source = %job.source_path.display(),
                    error_code = e.error_code(),
                    error = %e,
                    "scheduled backup failed"
                );
                Err(e)
            }
        }
    }

    /// Run timers until `shutdown` resolves, then shut down cleanly.
    pub async fn run<F>(self: Arc<Self>, shutdown: F) -> ShutdownReport
    where
        F: Future<Output = ()> + Send,
    {
        self.state.set_phase(Phase::Running);
        let mut checkpoint_timer = timer(self.config.checkpoint_interval);
        let mut health_timer = timer(self.config.health_interval);
        let mut backup_timer = timer(self.config.backup_interval);
        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let endpoint = self.spawn_metrics_endpoint(stop_rx);

        tracing::info!(
            target: "maintenance",
            database = %self.config.db_path.display(),
            checkpoint_interval_secs = self.config.checkpoint_interval.as_secs(),
            health_interval_secs = self.config.health_interval.as_secs(),
            backup_interval_secs = self.config.backup_interval.as_secs(),
            metrics_port = self.config.metrics_port,
            "scheduler started"
        );

        let mut backups = JoinSet::new();
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                biased;
                () = &mut shutdown => break,
                () = next_tick(&mut checkpoint_timer) => {
                    self.tick("checkpoint", |s| {
                        s.checkpoint_tick();
                    })
                    .await;
                }
                () = next_tick(&mut health_timer) => {
                    self.tick("health", |s| {
                        s.health_tick();
                    })
                    .await;
                }
                () = next_tick(&mut backup_timer) => {
                    self.spawn_backup(&mut backups);
                }
                Some(joined) = backups.join_next(), if !backups.is_empty() => {
                    if let Err(e) = joined {
                        tracing::error!(tick = "backup", error = %e, "scheduler tick panicked");
                    }
                }
            }
        }

        self.state.set_phase(Phase::ShuttingDown);
        tracing::info!(target: "maintenance", "shutdown requested, stopping timers");
        drop((checkpoint_timer, health_timer, backup_timer));
        let _ = stop_tx.send(());
        if !backups.is_empty() {
            tracing::info!(
                target: "maintenance",
                in_flight = backups.len(),
                "waiting for running backups"
            );
        }
        while let Some(joined) = backups.join_next().await {
            if let Err(e) = joined {
                tracing::error!(tick = "backup", error = %e, "scheduler tick panicked");
            }
        }

        let locks_released = release_all_held();
        let final_checkpoint = {
            let me = Arc::clone(&self);
            match tokio::task::spawn_blocking(move || me.final_checkpoint()).await {
                Ok(result) => Some(result),
                Err(e) => {
                    tracing::error!(error = %e, "final checkpoint task failed");
                    None
                }
            }
        };
        if let Some(handle) = endpoint {
            let _ = handle.await;
        }

        let state = self.state.snapshot();
        tracing::info!(
            target: "maintenance",
            checkpoints = state.checkpoints_performed,
            samples = state.samples_taken,
            backups = state.backups_performed,
            locks_released,
            final_checkpoint_ok = final_checkpoint.as_ref().is_some_and(|r| r.succeeded),
            "scheduler stopped"
        );
        ShutdownReport {
            state,
            locks_released,
            final_checkpoint,
        }
    }

    /// Start a backup on the blocking pool if a slot is free; otherwise count
    /// the tick as skipped.
    fn spawn_backup(self: &Arc<Self>, backups: &mut JoinSet<()>) {
        let Ok(permit) = Arc::clone(&self.backup_slots).try_acquire_owned() else {
            self.state.backups_skipped.inc();
            tracing::warn!(
                target: "maintenance",
                running = backups.len(),
                max_concurrent = self.config.max_concurrent,
                "backup tick skipped, all slots busy"
            );
            return;
        };
        let me = Arc::clone(self);
        backups.spawn_blocking(move || {
            let _permit = permit;
            let _ = me.backup_tick();
        });
    }

    /// Run one tick on the blocking pool; a panic is logged, never propagated.
    async fn tick<W>(self: &Arc<Self>, name: &'static str, work: W)
    where
        W: FnOnce(&Self) + Send + 'static,
    {
        let me = Arc::clone(self);
        if let Err(e) = tokio::task::spawn_blocking(move || work(&me)).await {
            tracing::error!(tick = name, error = %e, "scheduler tick panicked");
        }
    }

    fn spawn_metrics_endpoint(&self, stop: oneshot::Receiver<()>) -> Option<JoinHandle<()>> {
        if self.config.metrics_port == 0 {
            return None;
        }
        let addr = SocketAddr::from(([0, 0, 0, 0], self.config.metrics_port));
        let metrics = self.monitor.metrics();
        Some(tokio::spawn(async move {
            let stopped = async move {
                let _ = stop.await;
            };
            if let Err(e) = exporter::serve(addr, metrics, stopped).await {
                tracing::error!(%addr, error = %e, "metrics endpoint failed");
            }
        }))
    }
}

/// `None` for a zero period (timer disabled). The first tick fires one full
/// period after start.
fn timer(period: Duration) -> Option<Interval> {
    if period.is_zero() {
        return None;
    }
    let mut interval = tokio::time::interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    Some(interval)
}

async fn next_tick(timer: &mut Option<Interval>) {
    match timer {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

/// Resolves on SIGINT or SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to install Ctrl-C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => tracing::info!("received SIGINT, shutting down"),
        () = terminate => tracing::info!("received SIGTERM, shutting down"),
    }
}
