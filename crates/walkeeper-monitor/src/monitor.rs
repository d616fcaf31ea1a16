//! WAL health sampling with auto-remediation.

use crate::alerts::{AlertDispatcher, AlertEvent, AlertKind, AlertLevel};
use crate::exporter::MonitorMetrics;
use crate::series::SeriesWriter;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use walkeeper_core::{bytes_to_mb, CheckpointMode, Clock, Config, SystemClock, MIB};
use walkeeper_db::checkpoint::failed_result;
use walkeeper_db::{
    inspect, retry_sync, run_checkpoint, CheckpointRequest, CheckpointResult, DatabaseDriver,
    FileStats, RetryPolicy,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum HealthStatus {
    Normal = 0,
    Warning = 1,
    Critical = 2,
}

impl HealthStatus {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Normal => "normal",
            Self::Warning => "warning",
            Self::Critical => "critical",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthSample {
    pub timestamp: DateTime<Utc>,
    pub database: String,
    pub wal_size_mb: f64,
    pub db_size_mb: f64,
    pub wal_to_db_ratio: f64,
    pub status: HealthStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checkpoint: Option<CheckpointResult>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub alerts: Vec<AlertKind>,
}

/// Thresholds and behavior of one monitor.
#[derive(Debug, Clone)]
pub struct MonitorSettings {
    pub database_path: PathBuf,
    pub wal_size_warn_mb: u64,
    pub wal_size_critical_mb: u64,
    pub wal_ratio_warn: f64,
    pub auto_checkpoint: bool,
    pub checkpoint_threshold_mb: u64,
    pub busy_timeout: Duration,
    /// Wall-time bound on each auto-checkpoint attempt.
    pub command_timeout: Duration,
    /// Prune the time series every N samples; 0 disables.
    pub prune_every: u64,
}

impl MonitorSettings {
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self {
            database_path: config.db_path.clone(),
            wal_size_warn_mb: config.wal_size_warn_mb,
            wal_size_critical_mb: config.wal_size_critical_mb,
            wal_ratio_warn: config.wal_ratio_warn,
            auto_checkpoint: config.auto_checkpoint,
            checkpoint_threshold_mb: config.checkpoint_threshold_mb,
            busy_timeout: config.busy_timeout,
            command_timeout: config.command_timeout,
            prune_every: config.prune_every,
        }
    }
}

/// Severity of the given WAL size and WAL/DB ratio.
#[must_use]
pub fn classify(settings: &MonitorSettings, wal_bytes: u64, ratio: f64) -> HealthStatus {
    if wal_bytes > settings.wal_size_critical_mb.saturating_mul(MIB) {
        HealthStatus::Critical
    } else if wal_bytes > settings.wal_size_warn_mb.saturating_mul(MIB)
        || ratio > settings.wal_ratio_warn
    {
        HealthStatus::Warning
    } else {
        HealthStatus::Normal
    }
}

pub struct HealthMonitor {
    settings: MonitorSettings,
    database: String,
    driver: Arc<dyn DatabaseDriver>,
    dispatcher: AlertDispatcher,
    series: SeriesWriter,
    metrics: Arc<MonitorMetrics>,
    retry: RetryPolicy,
    clock: Arc<dyn Clock>,
    samples: AtomicU64,
}

impl std::fmt::Debug for HealthMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HealthMonitor")
            .field("settings", &self.settings)
            .field("database", &self.database)
            .field("dispatcher", &self.dispatcher)
            .field("series", &self.series)
            .finish_non_exhaustive()
    }
}

impl HealthMonitor {
    #[must_use]
    pub fn new(
        settings: MonitorSettings,
        driver: Arc<dyn DatabaseDriver>,
        dispatcher: AlertDispatcher,
        series: SeriesWriter,
    ) -> Self {
        let database = walkeeper_core::config::db_base_name(&settings.database_path);
        Self {
            metrics: Arc::new(MonitorMetrics::new(database.clone())),
            database,
            settings,
            driver,
            dispatcher,
            series,
            retry: RetryPolicy::default(),
            clock: Arc::new(SystemClock),
            samples: AtomicU64::new(0),
        }
    }

    /// Monitor for `config.db_path` with sinks, series and thresholds from
    /// `config`.
    #[must_use]
    pub fn from_config(config: &Config, driver: Arc<dyn DatabaseDriver>) -> Self {
        Self::new(
            MonitorSettings::from_config(config),
            driver,
            AlertDispatcher::from_urls(
                config.alert_webhook.as_deref(),
                config.error_tracker_url.as_deref(),
            ),
            SeriesWriter::new(&config.logs_dir, config.metrics_retention_days),
        )
    }

    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    #[must_use]
    pub fn with_metrics(mut self, metrics: Arc<MonitorMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    #[must_use]
    pub fn metrics(&self) -> Arc<MonitorMetrics> {
        Arc::clone(&self.metrics)
    }

    #[must_use]
    pub const fn dispatcher(&self) -> &AlertDispatcher {
        &self.dispatcher
    }

    #[must_use]
    pub const fn series(&self) -> &SeriesWriter {
        &self.series
    }

    #[must_use]
    pub const fn settings(&self) -> &MonitorSettings {
        &self.settings
    }

    #[allow(clippy::too_many_arguments)]
    fn alert(
        &self,
        level: AlertLevel,
        kind: AlertKind,
        message: String,
        threshold: f64,
        actual_value: f64,
        recommended_action: &str,
        timestamp: DateTime<Utc>,
    ) -> AlertEvent {
        AlertEvent {
            level,
            kind,
            message,
            threshold,
            actual_value,
            recommended_action: recommended_action.to_string(),
            timestamp,
            database: self.database.clone(),
        }
    }

    #[allow(clippy::cast_precision_loss)]
    fn threshold_alerts(&self, stats: &FileStats, now: DateTime<Utc>) -> Vec<AlertEvent> {
        let s = &self.settings;
        let wal_mb = bytes_to_mb(stats.wal_bytes);
        let ratio = stats.wal_ratio();
        let mut alerts = Vec::new();

        if stats.wal_bytes > s.wal_size_critical_mb.saturating_mul(MIB) {
            alerts.push(self.alert(
                AlertLevel::Critical,
                AlertKind::WalSizeCritical,
                format!(
                    "WAL is {wal_mb:.1} MB, above the critical threshold of {} MB",
                    s.wal_size_critical_mb
                ),
                s.wal_size_critical_mb as f64,
                wal_mb,
                "Run `walkeeper checkpoint --truncate` now and look for long-running readers",
                now,
            ));
        } else if stats.wal_bytes > s.wal_size_warn_mb.saturating_mul(MIB) {
            alerts.push(self.alert(
                AlertLevel::Warning,
                AlertKind::WalSizeWarning,
                format!(
                    "WAL is {wal_mb:.1} MB, above the warning threshold of {} MB",
                    s.wal_size_warn_mb
                ),
                s.wal_size_warn_mb as f64,
                wal_mb,
                "Schedule a checkpoint; lower CHECKPOINT_THRESHOLD if this recurs",
                now,
            ));
        }

        if ratio > s.wal_ratio_warn {
            alerts.push(self.alert(
                AlertLevel::Warning,
                AlertKind::WalRatioHigh,
                format!("WAL is {:.0}% of the database size", ratio * 100.0),
                s.wal_ratio_warn,
                ratio,
                "Checkpoint more often or shorten CHECKPOINT_INTERVAL",
                now,
            ));
        }
        alerts
    }

    fn auto_checkpoint(&self, stats: &FileStats) -> Option<CheckpointResult> {
        let s = &self.settings;
        if !s.auto_checkpoint
            || !stats.wal_mode
            || stats.wal_bytes <= s.checkpoint_threshold_mb.saturating_mul(MIB)
        {
            return None;
        }

        tracing::info!(
            target: "maintenance",
            database = %self.database,
            wal_bytes = stats.wal_bytes,
            threshold_mb = s.checkpoint_threshold_mb,
            "WAL above auto-checkpoint threshold, checkpointing"
        );
        let req = CheckpointRequest::new(&s.database_path, CheckpointMode::Truncate)
            .with_busy_timeout(s.busy_timeout)
            .with_timeout(s.command_timeout);
        let start = Instant::now();
        let result = retry_sync(&self.retry, || run_checkpoint(self.driver.as_ref(), &req))
            .unwrap_or_else(|e| {
                tracing::error!(
                    target: "maintenance",
                    database = %self.database,
                    error = %e,
                    "auto-checkpoint failed after retries"
                );
                failed_result(&req, start.elapsed(), &e)
            });

        if result.succeeded {
            self.metrics.checkpoints_total.inc();
        } else {
            self.metrics.checkpoint_failures_total.inc();
        }
        Some(result)
    }

    /// Take one sample: measure, classify, remediate, alert, persist.
    ///
    /// Sink and series failures are logged; sampling itself never fails.
    #[allow(clippy::cast_precision_loss)]
    pub fn sample(&self) -> HealthSample {
        let now = self.clock.now();
        let stats = inspect(&self.settings.database_path);
        if stats.db_bytes == 0 && !self.settings.database_path.exists() {
            tracing::warn!(
                path = %self.settings.database_path.display(),
                "database file missing, sampling empty sizes"
            );
        }
        let ratio = stats.wal_ratio();
        let status = classify(&self.settings, stats.wal_bytes, ratio);
        self.metrics
            .record_sizes(stats.wal_bytes, stats.db_bytes, Instant::now());
        self.metrics.record_status(status);

        let mut alerts = self.threshold_alerts(&stats, now);
        let checkpoint = self.auto_checkpoint(&stats);
        if let Some(cp) = &checkpoint {
            if !cp.succeeded {
                let wal_mb = bytes_to_mb(stats.wal_bytes);
                alerts.push(self.alert(
                    AlertLevel::Critical,
                    AlertKind::CheckpointFailed,
                    format!(
                        "Automatic checkpoint failed: {}",
                        cp.error_detail.as_deref().unwrap_or("unknown error")
                    ),
                    self.settings.checkpoint_threshold_mb as f64,
                    wal_mb,
                    "Check for processes holding the database locked, then run `walkeeper checkpoint --truncate`",
                    now,
                ));
            }
        }

        for event in &alerts {
            self.dispatcher.dispatch(event);
            self.metrics.alerts_total.inc();
        }

        let sample = HealthSample {
            timestamp: now,
            database: self.database.clone(),
            wal_size_mb: bytes_to_mb(stats.wal_bytes),
            db_size_mb: bytes_to_mb(stats.db_bytes),
            wal_to_db_ratio: ratio,
            status,
            checkpoint,
            alerts: alerts.iter().map(|a| a.kind).collect(),
        };

        if let Err(e) = self.series.append(&sample) {
            tracing::warn!(dir = %self.series.dir().display(), error = %e, "failed to append health sample");
        }
        self.metrics.samples_total.inc();
        let n = self.samples.fetch_add(1, Ordering::Relaxed) + 1;
        if self.settings.prune_every > 0 && n % self.settings.prune_every == 0 {
            if let Err(e) = self.series.prune(now) {
                tracing::warn!(error = %e, "health series pruning failed");
            }
        }

        tracing::debug!(
            database = %self.database,
            status = status.as_str(),
            wal_mb = sample.wal_size_mb,
            db_mb = sample.db_size_mb,
            ratio,
            "health sample"
        );
        sample
    }

    /// Sample every `interval` until `shutdown` is set. Cancellation is
    /// checked between samples, never during one. Returns the samples taken.
    pub fn run(&self, interval: Duration, shutdown: &AtomicBool) -> u64 {
        let interval = interval.max(Duration::from_secs(1));
        tracing::info!(
            target: "maintenance",
            database = %self.database,
            interval_secs = interval.as_secs(),
            "health monitor started"
        );
        let mut taken = 0;
        loop {
            if shutdown.load(Ordering::Acquire) {
                tracing::info!(target: "maintenance", samples = taken, "health monitor stopping");
                return taken;
            }
            self.sample();
            taken += 1;

            // Sleep in small increments to allow quick shutdown.
            let mut remaining = interval;
            while !remaining.is_zero() {
                if shutdown.load(Ordering::Acquire) {
                    break;
                }
                let chunk = remaining.min(Duration::from_millis(250));
                std::thread::sleep(chunk);
                remaining = remaining.saturating_sub(chunk);
            }
        }
    }
}
