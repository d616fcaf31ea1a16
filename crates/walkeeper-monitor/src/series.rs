//! Day-partitioned JSON-lines time series of health samples.
//!
//! Layout: `<logs>/wal-monitor/metrics-<YYYY-MM-DD>.log`, one sample per
//! line, partitioned by the sample's UTC date.

use crate::error::MonitorResult;
use crate::monitor::HealthSample;
use chrono::{DateTime, NaiveDate, Utc};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

const FILE_PREFIX: &str = "metrics-";
const FILE_SUFFIX: &str = ".log";

#[derive(Debug, Clone)]
pub struct SeriesWriter {
    dir: PathBuf,
    retention_days: u64,
}

impl SeriesWriter {
    /// Series under `<logs_dir>/wal-monitor`.
    #[must_use]
    pub fn new(logs_dir: &Path, retention_days: u64) -> Self {
        Self {
            dir: logs_dir.join("wal-monitor"),
            retention_days,
        }
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    #[must_use]
    pub fn file_for(&self, date: NaiveDate) -> PathBuf {
        self.dir
            .join(format!("{FILE_PREFIX}{}{FILE_SUFFIX}", date.format("%Y-%m-%d")))
    }

    /// Append one sample; returns the file written.
    pub fn append(&self, sample: &HealthSample) -> MonitorResult<PathBuf> {
        std::fs::create_dir_all(&self.dir)?;
        let path = self.file_for(sample.timestamp.date_naive());
        let mut line = serde_json::to_vec(sample)?;
        line.push(b'\n');
        let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
        file.write_all(&line)?;
        Ok(path)
    }

    /// Delete day files older than the retention window. 0 days disables.
    pub fn prune(&self, now: DateTime<Utc>) -> MonitorResult<Vec<PathBuf>> {
        if self.retention_days == 0 || !self.dir.is_dir() {
            return Ok(Vec::new());
        }
        let days = i64::try_from(self.retention_days).unwrap_or(i64::MAX);
        let Some(cutoff) = chrono::Duration::try_days(days)
            .and_then(|d| now.date_naive().checked_sub_signed(d))
        else {
            return Ok(Vec::new());
        };

        let mut removed = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let entry = entry?;
            let Some(date) = parse_day(&entry.file_name().to_string_lossy()) else {
                continue;
            };
            if date < cutoff {
                std::fs::remove_file(entry.path())?;
                removed.push(entry.path());
            }
        }
        if !removed.is_empty() {
            tracing::info!(
                dir = %self.dir.display(),
                removed = removed.len(),
                retention_days = self.retention_days,
                "pruned health time series"
            );
        }
        Ok(removed)
    }
}

fn parse_day(file_name: &str) -> Option<NaiveDate> {
    let stamp = file_name
        .strip_prefix(FILE_PREFIX)?
        .strip_suffix(FILE_SUFFIX)?;
    NaiveDate::parse_from_str(stamp, "%Y-%m-%d").ok()
}

/// Read back every sample in one day file.
pub fn read_samples(path: &Path) -> MonitorResult<Vec<serde_json::Value>> {
    let text = std::fs::read_to_string(path)?;
    text.lines()
        .filter(|l| !l.trim().is_empty())
        .map(|l| serde_json::from_str(l).map_err(Into::into))
        .collect()
}
