//! Configuration management for walkeeper.
//!
//! Configuration is read from environment variables (a `.env` file in the
//! working directory is loaded by the binary before this runs). Unparseable
//! values fall back to their defaults with a warning; cross-field ordering
//! rules are enforced by [`Config::validate`].

use crate::error::{ConfigError, ConfigResult};
use crate::{BackupMode, CheckpointMode};
use std::cell::RefCell;
use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// Which database driver to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverPreference {
    /// Probe capabilities at startup: embedded first, then the `sqlite3` CLI.
    Auto,
    Embedded,
    Cli,
}

/// Log line format on stderr.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

impl LogFormat {
    /// `json` (any case) selects JSON; anything else is text.
    #[must_use]
    pub fn parse(raw: &str) -> Self {
        if raw.trim().eq_ignore_ascii_case("json") {
            Self::Json
        } else {
            Self::Text
        }
    }
}

/// Main configuration struct for walkeeper
#[derive(Debug, Clone)]
#[allow(clippy::struct_excessive_bools)]
pub struct Config {
    // Database
    pub db_path: PathBuf,
    pub driver: DriverPreference,
    pub sqlite3_bin: String,
    /// `PRAGMA busy_timeout` applied before checkpoints and copies.
    pub busy_timeout: Duration,
    /// Upper bound on any external `sqlite3` invocation.
    pub command_timeout: Duration,

    // Checkpointing
    pub checkpoint_mode: CheckpointMode,
    pub checkpoint_interval: Duration,

    // WAL health thresholds (MB)
    pub wal_size_warn_mb: u64,
    pub wal_size_critical_mb: u64,
    /// Auto-remediation trigger; must be <= `wal_size_warn_mb`.
    pub checkpoint_threshold_mb: u64,
    pub auto_checkpoint: bool,
    pub wal_ratio_warn: f64,
    /// Interval of the continuous `health` loop.
    pub check_interval: Duration,
    /// Interval of the scheduler's health timer.
    pub health_interval: Duration,
    pub logs_dir: PathBuf,
    pub metrics_retention_days: u64,
    /// Prune the time series every N samples.
    pub prune_every: u64,
    /// 0 disables the HTTP metrics endpoint.
    pub metrics_port: u16,

    // Alerts
    pub alert_webhook: Option<String>,
    pub error_tracker_url: Option<String>,

    // Backups
    pub backup_dir: PathBuf,
    pub backup_mode: BackupMode,
    /// 0 disables the scheduler's backup timer.
    pub backup_interval: Duration,
    pub max_concurrent: usize,
    pub compress: bool,
    pub verify: bool,
    pub verify_deep: bool,
    pub verify_size_tolerance: f64,
    pub max_backup_days: u64,
    pub lock_stale_after: Duration,

    // Logging
    pub log_format: LogFormat,

    /// Values that could not be parsed and fell back to their defaults.
    /// Collected here rather than logged so they can be reported after the
    /// log subscriber is installed.
    pub load_warnings: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("data/app.db"),
            driver: DriverPreference::Auto,
            sqlite3_bin: "sqlite3".to_string(),
            busy_timeout: Duration::from_millis(5_000),
            command_timeout: Duration::from_secs(30),

            checkpoint_mode: CheckpointMode::Truncate,
            checkpoint_interval: Duration::from_secs(60 * 60),

            wal_size_warn_mb: 64,
            wal_size_critical_mb: 256,
            checkpoint_threshold_mb: 32,
            auto_checkpoint: true,
            wal_ratio_warn: 0.5,
            check_interval: Duration::from_secs(300),
            health_interval: Duration::from_secs(6 * 60 * 60),
            logs_dir: PathBuf::from("logs"),
            metrics_retention_days: 7,
            prune_every: 100,
            metrics_port: 0,

            alert_webhook: None,
            error_tracker_url: None,

            backup_dir: PathBuf::from("backups"),
            backup_mode: BackupMode::Auto,
            backup_interval: Duration::ZERO,
            max_concurrent: 1,
            compress: false,
            verify: true,
            verify_deep: false,
            verify_size_tolerance: 0.10,
            max_backup_days: 7,
            lock_stale_after: Duration::from_secs(60 * 60),

            log_format: LogFormat::Text,

            load_warnings: Vec::new(),
        }
    }
}

impl Config {
    /// Load configuration from environment variables
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration from an arbitrary key lookup (used by tests so they
    /// never have to mutate the process environment).
    #[must_use]
    #[allow(clippy::too_many_lines)]
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = EnvSource {
            lookup: &lookup,
            warnings: RefCell::new(Vec::new()),
        };
        let mut config = Self::default();

        // Database
        if let Some(v) = env.string("DB_PATH") {
            config.db_path = PathBuf::from(v);
        }
        if let Some(v) = env.string("DB_DRIVER") {
            config.driver = match v.to_ascii_lowercase().as_str() {
                "embedded" => DriverPreference::Embedded,
                "cli" => DriverPreference::Cli,
                "auto" => DriverPreference::Auto,
                other => {
                    env.warn(format!("unknown DB_DRIVER {other:?}, using auto"));
                    DriverPreference::Auto
                }
            };
        }
        if let Some(v) = env.string("SQLITE3_BIN") {
            config.sqlite3_bin = v;
        }
        config.busy_timeout = Duration::from_millis(
            env.u64("BUSY_TIMEOUT", duration_millis(config.busy_timeout)),
        );
        config.command_timeout =
            Duration::from_secs(env.u64("COMMAND_TIMEOUT", config.command_timeout.as_secs()));

        // Checkpointing
        if let Some(v) = env.string("CHECKPOINT_MODE") {
            match CheckpointMode::parse(&v) {
                Some(mode) => config.checkpoint_mode = mode,
                None => env.warn(format!("unknown CHECKPOINT_MODE {v:?}, using TRUNCATE")),
            }
        }
        config.checkpoint_interval = Duration::from_secs(
            env.u64("CHECKPOINT_INTERVAL", config.checkpoint_interval.as_secs()),
        );

        // WAL health
        config.wal_size_warn_mb = env.u64("WAL_SIZE_WARN", config.wal_size_warn_mb);
        config.wal_size_critical_mb = env.u64("WAL_SIZE_CRITICAL", config.wal_size_critical_mb);
        config.checkpoint_threshold_mb =
            env.u64("CHECKPOINT_THRESHOLD", config.checkpoint_threshold_mb);
        config.auto_checkpoint = env.bool("AUTO_CHECKPOINT", config.auto_checkpoint);
        config.wal_ratio_warn = env.f64("WAL_RATIO_WARN", config.wal_ratio_warn);
        config.check_interval =
            Duration::from_secs(env.u64("CHECK_INTERVAL", config.check_interval.as_secs()));
        config.health_interval =
            Duration::from_secs(env.u64("HEALTH_INTERVAL", config.health_interval.as_secs()));
        if let Some(v) = env.string("LOGS_DIR") {
            config.logs_dir = PathBuf::from(v);
        }
        config.metrics_retention_days =
            env.u64("METRICS_RETENTION_DAYS", config.metrics_retention_days);
        config.prune_every = env.u64("PRUNE_EVERY", config.prune_every);
        config.metrics_port = env.u16("METRICS_PORT", config.metrics_port);

        // Alerts
        config.alert_webhook = env.string("ALERT_WEBHOOK");
        config.error_tracker_url = env.string("ERROR_TRACKER_URL");

        // Backups
        if let Some(v) = env.string("BACKUP_DIR") {
            config.backup_dir = PathBuf::from(v);
        }
        if let Some(v) = env.string("BACKUP_MODE") {
            match BackupMode::parse(&v) {
                Some(mode) => config.backup_mode = mode,
                None => env.warn(format!("unknown BACKUP_MODE {v:?}, using auto")),
            }
        }
        config.backup_interval =
            Duration::from_secs(env.u64("BACKUP_INTERVAL", config.backup_interval.as_secs()));
        config.max_concurrent = env.usize("MAX_CONCURRENT", config.max_concurrent);
        config.compress = env.bool("COMPRESS", config.compress);
        config.verify = env.bool("VERIFY", config.verify);
        config.verify_deep = env.bool("VERIFY_DEEP", config.verify_deep);
        config.verify_size_tolerance =
            env.f64("VERIFY_SIZE_TOLERANCE", config.verify_size_tolerance);
        config.max_backup_days = env.u64("MAX_BACKUP_DAYS", config.max_backup_days);
        config.lock_stale_after =
            Duration::from_secs(env.u64("LOCK_STALE_SECS", config.lock_stale_after.as_secs()));

        // Logging
        if let Some(v) = env.string("LOG_FORMAT") {
            config.log_format = LogFormat::parse(&v);
        }

        config.load_warnings = env.warnings.into_inner();
        config
    }

    /// Check cross-field invariants.
    ///
    /// Hard violations are returned as `Err`; soft issues come back as
    /// human-readable warnings for the caller to log.
    pub fn validate(&self) -> ConfigResult<Vec<String>> {
        if self.checkpoint_threshold_mb > self.wal_size_warn_mb {
            return Err(ConfigError::AutoCheckpointAboveWarning {
                auto_mb: self.checkpoint_threshold_mb,
                warn_mb: self.wal_size_warn_mb,
            });
        }
        if self.wal_size_warn_mb >= self.wal_size_critical_mb {
            return Err(ConfigError::WarningAboveCritical {
                warn_mb: self.wal_size_warn_mb,
                critical_mb: self.wal_size_critical_mb,
            });
        }
        if self.max_concurrent == 0 {
            return Err(ConfigError::invalid("MAX_CONCURRENT", "must be at least 1"));
        }
        if !(0.0..=1.0).contains(&self.verify_size_tolerance) {
            return Err(ConfigError::invalid(
                "VERIFY_SIZE_TOLERANCE",
                format!("{} is outside 0.0..=1.0", self.verify_size_tolerance),
            ));
        }
        if self.wal_ratio_warn <= 0.0 {
            return Err(ConfigError::invalid("WAL_RATIO_WARN", "must be positive"));
        }

        let mut warnings = Vec::new();
        if self.checkpoint_interval.is_zero() {
            warnings.push("CHECKPOINT_INTERVAL is 0; periodic checkpoints disabled".to_string());
        }
        if self.health_interval.is_zero() {
            warnings.push("HEALTH_INTERVAL is 0; periodic health sampling disabled".to_string());
        }
        if self.max_backup_days == 0 {
            warnings.push("MAX_BACKUP_DAYS is 0; backup pruning disabled".to_string());
        }
        if self.auto_checkpoint && self.checkpoint_threshold_mb == 0 {
            warnings.push(
                "CHECKPOINT_THRESHOLD is 0; every sample with a WAL will checkpoint".to_string(),
            );
        }
        if self.prune_every == 0 {
            warnings.push("PRUNE_EVERY is 0; time-series pruning disabled".to_string());
        }
        Ok(warnings)
    }

    /// Database name used as the metrics label and backup file prefix.
    #[must_use]
    pub fn db_name(&self) -> String {
        db_base_name(&self.db_path)
    }
}

/// File stem of a database path (`/data/app.db` → `app`).
#[must_use]
pub fn db_base_name(path: &std::path::Path) -> String {
    path.file_stem()
        .map_or_else(|| "database".to_string(), |s| s.to_string_lossy().into_owned())
}

fn duration_millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

struct EnvSource<'a, F: Fn(&str) -> Option<String>> {
    lookup: &'a F,
    warnings: RefCell<Vec<String>>,
}

impl<F: Fn(&str) -> Option<String>> EnvSource<'_, F> {
    fn string(&self, key: &str) -> Option<String> {
        (self.lookup)(key).and_then(|v| {
            let trimmed = v.trim();
            if trimmed.is_empty() {
                None
            } else {
                Some(trimmed.to_string())
            }
        })
    }

    fn warn(&self, message: String) {
        self.warnings.borrow_mut().push(message);
    }

    fn parsed<T: std::str::FromStr>(&self, key: &str, default: T) -> T {
        match self.string(key) {
            None => default,
            Some(raw) => raw.parse().unwrap_or_else(|_| {
                self.warn(format!("{key}={raw:?} is not valid, using the default"));
                default
            }),
        }
    }

    fn bool(&self, key: &str, default: bool) -> bool {
        self.string(key).map_or(default, |v| parse_bool(&v, default))
    }

    fn u16(&self, key: &str, default: u16) -> u16 {
        self.parsed(key, default)
    }

    fn u64(&self, key: &str, default: u64) -> u64 {
        self.parsed(key, default)
    }

    fn usize(&self, key: &str, default: usize) -> usize {
        self.parsed(key, default)
    }

    fn f64(&self, key: &str, default: f64) -> f64 {
        self.parsed(key, default)
    }
}

fn parse_bool(value: &str, default: bool) -> bool {
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "t" | "yes" | "y" | "on" => true,
        "0" | "false" | "f" | "no" | "n" | "off" => false,
        _ => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::HashMap;

    fn config_from(pairs: &[(&str, &str)]) -> Config {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        Config::from_lookup(|k| map.get(k).cloned())
    }

    #[test]
    fn defaults_validate_cleanly() {
        let config = Config::default();
        let warnings = config.validate().expect("defaults are valid");
        assert!(warnings.is_empty(), "unexpected warnings: {warnings:?}");
    }

    #[test]
    fn reads_recognized_keys() {
        let config = config_from(&[
            ("DB_PATH", "/srv/game/state.db"),
            ("CHECKPOINT_MODE", "passive"),
            ("WAL_SIZE_WARN", "10"),
            ("WAL_SIZE_CRITICAL", "40"),
            ("CHECKPOINT_THRESHOLD", "5"),
            ("CHECK_INTERVAL", "30"),
            ("MAX_CONCURRENT", "2"),
            ("COMPRESS", "yes"),
            ("VERIFY_DEEP", "1"),
            ("MAX_BACKUP_DAYS", "14"),
            ("METRICS_PORT", "9464"),
            ("ALERT_WEBHOOK", "http://hooks.local/wal"),
            ("BUSY_TIMEOUT", "2500"),
        ]);
        assert_eq!(config.db_path, PathBuf::from("/srv/game/state.db"));
        assert_eq!(config.checkpoint_mode, CheckpointMode::Passive);
        assert_eq!(config.wal_size_warn_mb, 10);
        assert_eq!(config.wal_size_critical_mb, 40);
        assert_eq!(config.checkpoint_threshold_mb, 5);
        assert_eq!(config.check_interval, Duration::from_secs(30));
        assert_eq!(config.max_concurrent, 2);
        assert!(config.compress);
        assert!(config.verify_deep);
        assert_eq!(config.max_backup_days, 14);
        assert_eq!(config.metrics_port, 9464);
        assert_eq!(config.alert_webhook.as_deref(), Some("http://hooks.local/wal"));
        assert_eq!(config.busy_timeout, Duration::from_millis(2500));
        assert_eq!(config.db_name(), "state");
    }

    #[test]
    fn garbage_values_fall_back_to_defaults() {
        let config = config_from(&[
            ("WAL_SIZE_WARN", "lots"),
            ("CHECKPOINT_MODE", "eager"),
            ("COMPRESS", "maybe"),
            ("ALERT_WEBHOOK", "   "),
        ]);
        let defaults = Config::default();
        assert_eq!(config.wal_size_warn_mb, defaults.wal_size_warn_mb);
        assert_eq!(config.checkpoint_mode, CheckpointMode::Truncate);
        assert!(!config.compress);
        assert!(config.alert_webhook.is_none());
        assert_eq!(config.load_warnings.len(), 2, "{:?}", config.load_warnings);
        assert!(config.load_warnings.iter().any(|w| w.contains("WAL_SIZE_WARN")));
        assert!(config.load_warnings.iter().any(|w| w.contains("CHECKPOINT_MODE")));
    }

    #[test]
    fn log_format_is_read_from_environment() {
        assert_eq!(config_from(&[("LOG_FORMAT", "JSON")]).log_format, LogFormat::Json);
        assert_eq!(config_from(&[("LOG_FORMAT", "pretty")]).log_format, LogFormat::Text);
        assert_eq!(config_from(&[]).log_format, LogFormat::Text);
    }

    #[test]
    fn rejects_auto_checkpoint_above_warning() {
        let config = config_from(&[
            ("WAL_SIZE_WARN", "4"),
            ("WAL_SIZE_CRITICAL", "16"),
            ("CHECKPOINT_THRESHOLD", "8"),
        ]);
        assert_eq!(
            config.validate(),
            Err(ConfigError::AutoCheckpointAboveWarning {
                auto_mb: 8,
                warn_mb: 4
            })
        );
    }

    #[test]
    fn rejects_warning_at_or_above_critical() {
        let config = config_from(&[
            ("WAL_SIZE_WARN", "16"),
            ("WAL_SIZE_CRITICAL", "16"),
            ("CHECKPOINT_THRESHOLD", "8"),
        ]);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::WarningAboveCritical { .. })
        ));
    }

    #[test]
    fn rejects_zero_concurrency() {
        let config = config_from(&[("MAX_CONCURRENT", "0")]);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue {
                key: "MAX_CONCURRENT",
                ..
            })
        ));
    }

    #[test]
    fn zero_retention_is_a_warning_not_an_error() {
        let config = config_from(&[("MAX_BACKUP_DAYS", "0")]);
        let warnings = config.validate().unwrap();
        assert!(warnings.iter().any(|w| w.contains("MAX_BACKUP_DAYS")));
    }

    #[test]
    fn db_base_name_falls_back() {
        assert_eq!(db_base_name(std::path::Path::new("/")), "database");
        assert_eq!(db_base_name(std::path::Path::new("saves/world.sqlite3")), "world");
    }

    proptest! {
        #[test]
        fn threshold_ordering_is_enforced(auto in 0u64..500, warn in 1u64..500, extra in 1u64..500) {
            let config = Config {
                checkpoint_threshold_mb: auto,
                wal_size_warn_mb: warn,
                wal_size_critical_mb: warn + extra,
                ..Config::default()
            };
            let result = config.validate();
            if auto > warn {
                let is_ordering_error =
                    matches!(result, Err(ConfigError::AutoCheckpointAboveWarning { .. }));
                prop_assert!(is_ordering_error);
            } else {
                prop_assert!(result.is_ok());
            }
        }
    }
}
