//! Continuous WAL health monitoring for walkeeper.
//!
//! [`HealthMonitor::sample`] measures the WAL and database files, classifies
//! the result, auto-checkpoints past the remediation threshold, dispatches
//! alerts to every configured sink and appends the sample to a
//! day-partitioned series. [`exporter`] serves the resulting metrics.

#![forbid(unsafe_code)]

pub mod alerts;
pub mod error;
pub mod exporter;
pub mod monitor;
pub mod series;

pub use alerts::{
    AlertDispatcher, AlertEvent, AlertKind, AlertLevel, AlertSink, ErrorTrackerSink, LogSink,
    WebhookSink,
};
pub use error::{MonitorError, MonitorResult, SinkError};
pub use exporter::MonitorMetrics;
pub use monitor::{classify, HealthMonitor, HealthSample, HealthStatus, MonitorSettings};
pub use series::SeriesWriter;
