//! Pull-based metrics: lock-free cells updated by the sampler, rendered as
//! Prometheus text and served with axum on `/metrics` and `/health`.

use crate::error::{MonitorError, MonitorResult};
use crate::monitor::HealthStatus;
use axum::extract::State;
use axum::http::header;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use walkeeper_core::metrics::{Counter, GaugeF64, GaugeU64, MetricKind, PromText};

const PROM_CONTENT_TYPE: &str = "text/plain; version=0.0.4; charset=utf-8";

#[derive(Debug)]
pub struct MonitorMetrics {
    database: String,
    started: Instant,
    pub wal_bytes: GaugeU64,
    pub db_bytes: GaugeU64,
    /// Bytes per second between the last two samples; negative after a checkpoint.
    pub wal_growth_rate: GaugeF64,
    pub checkpoints_total: Counter,
    pub checkpoint_failures_total: Counter,
    pub samples_total: Counter,
    pub alerts_total: Counter,
    /// `HealthStatus` as 0/1/2; 255 before the first sample.
    status: AtomicU8,
    last_wal: Mutex<Option<(Instant, u64)>>,
}

impl MonitorMetrics {
    #[must_use]
    pub fn new(database: impl Into<String>) -> Self {
        Self {
            database: database.into(),
            started: Instant::now(),
            wal_bytes: GaugeU64::new(),
            db_bytes: GaugeU64::new(),
            wal_growth_rate: GaugeF64::new(),
            checkpoints_total: Counter::new(),
            checkpoint_failures_total: Counter::new(),
            samples_total: Counter::new(),
            alerts_total: Counter::new(),
            status: AtomicU8::new(u8::MAX),
            last_wal: Mutex::new(None),
        }
    }

    #[must_use]
    pub fn database(&self) -> &str {
        &self.database
    }

    #[must_use]
    pub fn uptime_secs(&self) -> f64 {
        self.started.elapsed().as_secs_f64()
    }

    /// Record file sizes observed at `at` and update the growth rate.
    #[allow(clippy::cast_precision_loss)]
    pub fn record_sizes(&self, wal_bytes: u64, db_bytes: u64, at: Instant) {
        self.wal_bytes.set(wal_bytes);
        self.db_bytes.set(db_bytes);
        let mut last = self
            .last_wal
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Some((prev_at, prev_wal)) = *last {
            let secs = at.saturating_duration_since(prev_at).as_secs_f64();
            if secs > 0.0 {
                self.wal_growth_rate
                    .set((wal_bytes as f64 - prev_wal as f64) / secs);
            }
        }
        *last = Some((at, wal_bytes));
    }

    pub fn record_status(&self, status: HealthStatus) {
        self.status.store(status as u8, Ordering::Relaxed);
    }

    #[must_use]
    pub fn last_status(&self) -> Option<HealthStatus> {
        match self.status.load(Ordering::Relaxed) {
            0 => Some(HealthStatus::Normal),
            1 => Some(HealthStatus::Warning),
            2 => Some(HealthStatus::Critical),
            _ => None,
        }
    }

    /// Prometheus text exposition of every metric.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn render(&self) -> String {
        let labels = [("database", self.database.as_str())];
        let mut out = PromText::new();

        let gauges: [(&str, &str, f64); 4] = [
            (
                "walkeeper_wal_size_bytes",
                "Current WAL file size",
                self.wal_bytes.load() as f64,
            ),
            (
                "walkeeper_db_size_bytes",
                "Current database file size",
                self.db_bytes.load() as f64,
            ),
            (
                "walkeeper_wal_growth_bytes_per_second",
                "WAL growth rate between the last two samples",
                self.wal_growth_rate.load(),
            ),
            (
                "walkeeper_uptime_seconds",
                "Seconds since the monitor started",
                self.uptime_secs(),
            ),
        ];
        for (name, help, value) in gauges {
            out.family(name, MetricKind::Gauge, help);
            out.sample(name, &labels, value);
        }

        let counters: [(&str, &str, &Counter); 4] = [
            (
                "walkeeper_checkpoints_total",
                "Checkpoints performed by the monitor",
                &self.checkpoints_total,
            ),
            (
                "walkeeper_checkpoint_failures_total",
                "Checkpoints that failed after retries",
                &self.checkpoint_failures_total,
            ),
            (
                "walkeeper_samples_total",
                "Health samples taken",
                &self.samples_total,
            ),
            (
                "walkeeper_alerts_total",
                "Alert events dispatched",
                &self.alerts_total,
            ),
        ];
        for (name, help, counter) in counters {
            out.family(name, MetricKind::Counter, help);
            out.sample(name, &labels, counter.load() as f64);
        }

        if let Some(status) = self.last_status() {
            out.family(
                "walkeeper_health_status",
                MetricKind::Gauge,
                "Last health classification (0 normal, 1 warning, 2 critical)",
            );
            out.sample("walkeeper_health_status", &labels, f64::from(status as u8));
        }
        out.finish()
    }
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    database: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    wal_status: Option<HealthStatus>,
    uptime_secs: u64,
    samples: u64,
    version: &'static str,
}

async fn metrics_handler(State(metrics): State<Arc<MonitorMetrics>>) -> impl IntoResponse {
    ([(header::CONTENT_TYPE, PROM_CONTENT_TYPE)], metrics.render())
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
async fn health_handler(State(metrics): State<Arc<MonitorMetrics>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        database: metrics.database().to_string(),
        wal_status: metrics.last_status(),
        uptime_secs: metrics.uptime_secs() as u64,
        samples: metrics.samples_total.load(),
        version: env!("CARGO_PKG_VERSION"),
    })
}

pub fn router(metrics: Arc<MonitorMetrics>) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/health", get(health_handler))
        .with_state(metrics)
}

/// Serve the metrics endpoint until `shutdown` resolves.
pub async fn serve<F>(
    addr: SocketAddr,
    metrics: Arc<MonitorMetrics>,
    shutdown: F,
) -> MonitorResult<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let endpoint_err = |source| MonitorError::Endpoint { addr, source };
    let listener = tokio::net::TcpListener::bind(addr).await.map_err(endpoint_err)?;
    let bound = listener.local_addr().map_err(endpoint_err)?;
    tracing::info!(addr = %bound, "metrics endpoint listening");
    axum::serve(listener, router(metrics))
        .with_graceful_shutdown(shutdown)
        .await
        .map_err(endpoint_err)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn growth_rate_tracks_wal_delta() {
        let m = MonitorMetrics::new("app");
        let t0 = Instant::now();
        m.record_sizes(1_000, 10_000, t0);
        assert!(m.wal_growth_rate.load().abs() < f64::EPSILON);
        m.record_sizes(3_000, 10_000, t0 + Duration::from_secs(2));
        assert!((m.wal_growth_rate.load() - 1_000.0).abs() < 1e-9);
        m.record_sizes(0, 10_000, t0 + Duration::from_secs(3));
        assert!(m.wal_growth_rate.load() < 0.0);
    }

    #[test]
    fn render_labels_every_sample_with_database() {
        let m = MonitorMetrics::new("state");
        m.record_sizes(4096, 8192, Instant::now());
        m.samples_total.inc();
        m.checkpoints_total.add(2);
        m.record_status(HealthStatus::Warning);
        let text = m.render();
        assert!(text.contains("walkeeper_wal_size_bytes{database=\"state\"} 4096\n"));
        assert!(text.contains("walkeeper_db_size_bytes{database=\"state\"} 8192\n"));
        assert!(text.contains("walkeeper_checkpoints_total{database=\"state\"} 2\n"));
        assert!(text.contains("walkeeper_samples_total{database=\"state\"} 1\n"));
        assert!(text.contains("# TYPE walkeeper_uptime_seconds gauge"));
        assert!(text.contains("walkeeper_health_status{database=\"state\"} 1\n"));
        for line in text.lines().filter(|l| !l.starts_with('#')) {
            assert!(line.contains("{database=\"state\"}"), "{line}");
        }
    }

    #[test]
    fn no_status_before_first_sample() {
        let m = MonitorMetrics::new("app");
        assert_eq!(m.last_status(), None);
        assert!(!m.render().contains("walkeeper_health_status"));
    }

    #[tokio::test]
    async fn endpoint_serves_metrics_and_health() {
        let metrics = Arc::new(MonitorMetrics::new("app"));
        metrics.samples_total.inc();
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = router(Arc::clone(&metrics));
        let server = tokio::spawn(async move { axum::serve(listener, app).await });

        let body = reqwest::get(format!("http://{addr}/metrics"))
            .await
            .unwrap()
            .text()
            .await
            .unwrap();
        assert!(body.contains("walkeeper_samples_total{database=\"app\"} 1"));

        let health: serde_json::Value = reqwest::get(format!("http://{addr}/health"))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(health["status"], "ok");
        assert_eq!(health["database"], "app");
        assert_eq!(health["samples"], 1);
        server.abort();
    }

    #[tokio::test]
    async fn port_in_use_is_an_endpoint_error() {
        let taken = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = taken.local_addr().unwrap();
        let metrics = Arc::new(MonitorMetrics::new("app"));
        let err = serve(addr, metrics, std::future::ready(()))
            .await
            .unwrap_err();
        assert!(matches!(err, MonitorError::Endpoint { addr: a, .. } if a == addr), "{err}");
        assert!(err.to_string().contains(&addr.to_string()));
    }
}
