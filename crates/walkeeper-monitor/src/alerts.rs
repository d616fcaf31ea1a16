//! Alert events, sinks and dispatch.
//!
//! Sinks are synchronous and called one after another; a failing sink is
//! logged and skipped so the rest still receive the event. Every dispatched
//! event also lands in a bounded in-process history.

use crate::error::SinkError;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

/// Events kept in the in-process history.
pub const HISTORY_LIMIT: usize = 1000;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertLevel {
    Warning,
    Critical,
}

impl AlertLevel {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Warning => "warning",
            Self::Critical => "critical",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    WalSizeCritical,
    WalSizeWarning,
    WalRatioHigh,
    CheckpointFailed,
}

impl AlertKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::WalSizeCritical => "wal_size_critical",
            Self::WalSizeWarning => "wal_size_warning",
            Self::WalRatioHigh => "wal_ratio_high",
            Self::CheckpointFailed => "checkpoint_failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AlertEvent {
    pub level: AlertLevel,
    #[serde(rename = "type")]
    pub kind: AlertKind,
    pub message: String,
    pub threshold: f64,
    pub actual_value: f64,
    pub recommended_action: String,
    pub timestamp: DateTime<Utc>,
    pub database: String,
}

/// A destination for alert events.
pub trait AlertSink: Send + Sync {
    fn name(&self) -> &str;
    fn deliver(&self, event: &AlertEvent) -> Result<(), SinkError>;
}

/// Writes alerts to the log stream. Always installed.
#[derive(Debug, Default)]
pub struct LogSink;

impl AlertSink for LogSink {
    fn name(&self) -> &str {
        "log"
    }

    fn deliver(&self, event: &AlertEvent) -> Result<(), SinkError> {
        match event.level {
            AlertLevel::Critical => tracing::error!(
                target: "maintenance",
                alert = event.kind.as_str(),
                database = %event.database,
                threshold = event.threshold,
                actual = event.actual_value,
                action = %event.recommended_action,
                "{}",
                event.message
            ),
            AlertLevel::Warning => tracing::warn!(
                target: "maintenance",
                alert = event.kind.as_str(),
                database = %event.database,
                threshold = event.threshold,
                actual = event.actual_value,
                action = %event.recommended_action,
                "{}",
                event.message
            ),
        }
        Ok(())
    }
}

/// One blocking client per delivery: it may not be created or dropped on an
/// async runtime thread.
fn post_json(url: &str, body: &serde_json::Value) -> Result<(), SinkError> {
    let client = reqwest::blocking::Client::builder()
        .timeout(REQUEST_TIMEOUT)
        .build()?;
    let response = client.post(url).json(body).send()?;
    if !response.status().is_success() {
        return Err(SinkError::HttpStatus(response.status().as_u16()));
    }
    Ok(())
}

/// POSTs the event as JSON to a generic webhook.
#[derive(Debug, Clone)]
pub struct WebhookSink {
    url: String,
}

impl WebhookSink {
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

impl AlertSink for WebhookSink {
    fn name(&self) -> &str {
        "webhook"
    }

    fn deliver(&self, event: &AlertEvent) -> Result<(), SinkError> {
        let body = serde_json::to_value(event).map_err(|e| SinkError::Other(e.to_string()))?;
        post_json(&self.url, &body)
    }
}

/// POSTs an error-tracker style envelope (message, level, tags, extra).
#[derive(Debug, Clone)]
pub struct ErrorTrackerSink {
    url: String,
}

impl ErrorTrackerSink {
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }

    #[must_use]
    pub fn envelope(event: &AlertEvent) -> serde_json::Value {
        serde_json::json!({
            "message": event.message,
            "level": match event.level {
                AlertLevel::Critical => "error",
                AlertLevel::Warning => "warning",
            },
            "logger": "walkeeper.monitor",
            "timestamp": event.timestamp.to_rfc3339(),
            "tags": {
                "alert_type": event.kind.as_str(),
                "database": event.database,
            },
            "extra": {
                "threshold": event.threshold,
                "actual_value": event.actual_value,
                "recommended_action": event.recommended_action,
            },
        })
    }
}

impl AlertSink for ErrorTrackerSink {
    fn name(&self) -> &str {
        "error_tracker"
    }

    fn deliver(&self, event: &AlertEvent) -> Result<(), SinkError> {
        post_json(&self.url, &Self::envelope(event))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DispatchReport {
    pub delivered: usize,
    pub failed: usize,
}

/// Fans events out to every sink and records them.
pub struct AlertDispatcher {
    sinks: Vec<Box<dyn AlertSink>>,
    history: Mutex<VecDeque<AlertEvent>>,
    limit: usize,
}

impl std::fmt::Debug for AlertDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<&str> = self.sinks.iter().map(|s| s.name()).collect();
        f.debug_struct("AlertDispatcher")
            .field("sinks", &names)
            .field("limit", &self.limit)
            .finish_non_exhaustive()
    }
}

impl AlertDispatcher {
    #[must_use]
    pub fn new(sinks: Vec<Box<dyn AlertSink>>) -> Self {
        Self::with_limit(sinks, HISTORY_LIMIT)
    }

    #[must_use]
    pub fn with_limit(sinks: Vec<Box<dyn AlertSink>>, limit: usize) -> Self {
        Self {
            sinks,
            history: Mutex::new(VecDeque::new()),
            limit: limit.max(1),
        }
    }

    /// The log sink plus whichever HTTP sinks are configured.
    #[must_use]
    pub fn from_urls(webhook: Option<&str>, error_tracker: Option<&str>) -> Self {
        let mut sinks: Vec<Box<dyn AlertSink>> = vec![Box::new(LogSink)];
        if let Some(url) = webhook {
            sinks.push(Box::new(WebhookSink::new(url)));
        }
        if let Some(url) = error_tracker {
            sinks.push(Box::new(ErrorTrackerSink::new(url)));
        }
        Self::new(sinks)
    }

    pub fn dispatch(&self, event: &AlertEvent) -> DispatchReport {
        let mut report = DispatchReport::default();
        for sink in &self.sinks {
            match sink.deliver(event) {
                Ok(()) => report.delivered += 1,
                Err(e) => {
                    report.failed += 1;
                    tracing::warn!(
                        sink = sink.name(),
                        alert = event.kind.as_str(),
                        error = %e,
                        "alert delivery failed"
                    );
                }
            }
        }

        let mut history = self
            .history
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if history.len() == self.limit {
            history.pop_front();
        }
        history.push_back(event.clone());
        report
    }

    /// Oldest first.
    #[must_use]
    pub fn history(&self) -> Vec<AlertEvent> {
        self.history
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Failing;
    impl AlertSink for Failing {
        fn name(&self) -> &str {
            "failing"
        }
        fn deliver(&self, _: &AlertEvent) -> Result<(), SinkError> {
            Err(SinkError::HttpStatus(503))
        }
    }

    struct Counting(Arc<AtomicUsize>);
    impl AlertSink for Counting {
        fn name(&self) -> &str {
            "counting"
        }
        fn deliver(&self, _: &AlertEvent) -> Result<(), SinkError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn event(kind: AlertKind) -> AlertEvent {
        AlertEvent {
            level: AlertLevel::Warning,
            kind,
            message: "WAL is large".into(),
            threshold: 4.0,
            actual_value: 12.0,
            recommended_action: "run a TRUNCATE checkpoint".into(),
            timestamp: Utc::now(),
            database: "app".into(),
        }
    }

    #[test]
    fn failing_sink_does_not_block_others() {
        let hits = Arc::new(AtomicUsize::new(0));
        let dispatcher = AlertDispatcher::new(vec![
            Box::new(Failing),
            Box::new(Counting(Arc::clone(&hits))),
        ]);
        let report = dispatcher.dispatch(&event(AlertKind::WalSizeWarning));
        assert_eq!(report, DispatchReport { delivered: 1, failed: 1 });
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(dispatcher.history().len(), 1);
    }

    #[test]
    fn history_is_bounded() {
        let dispatcher = AlertDispatcher::with_limit(vec![], 3);
        for kind in [
            AlertKind::WalSizeWarning,
            AlertKind::WalRatioHigh,
            AlertKind::WalSizeCritical,
            AlertKind::CheckpointFailed,
        ] {
            dispatcher.dispatch(&event(kind));
        }
        let kinds: Vec<AlertKind> = dispatcher.history().iter().map(|e| e.kind).collect();
        assert_eq!(
            kinds,
            vec![
                AlertKind::WalRatioHigh,
                AlertKind::WalSizeCritical,
                AlertKind::CheckpointFailed
            ]
        );
    }

    #[test]
    fn event_serializes_kind_as_type() {
        let json = serde_json::to_value(event(AlertKind::WalRatioHigh)).unwrap();
        assert_eq!(json["type"], "wal_ratio_high");
        assert_eq!(json["level"], "warning");
    }

    #[test]
    fn error_tracker_envelope_maps_levels() {
        let mut e = event(AlertKind::CheckpointFailed);
        e.level = AlertLevel::Critical;
        let env = ErrorTrackerSink::envelope(&e);
        assert_eq!(env["level"], "error");
        assert_eq!(env["tags"]["alert_type"], "checkpoint_failed");
    }

    #[test]
    fn unreachable_webhook_is_a_sink_error() {
        let sink = WebhookSink::new("http://127.0.0.1:9/unreachable");
        assert!(sink.deliver(&event(AlertKind::WalSizeWarning)).is_err());
    }

    #[test]
    fn from_urls_always_logs() {
        let d = AlertDispatcher::from_urls(None, None);
        let report = d.dispatch(&event(AlertKind::WalSizeWarning));
        assert_eq!(report, DispatchReport { delivered: 1, failed: 0 });
    }
}
