//! Error types for the health monitor.

use thiserror::Error;

pub type MonitorResult<T> = std::result::Result<T, MonitorError>;

#[derive(Debug, Error)]
pub enum MonitorError {
    #[error("time series io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("metrics endpoint on {addr}: {source}")]
    Endpoint {
        addr: std::net::SocketAddr,
        #[source]
        source: std::io::Error,
    },
}

/// Delivery failure of a single alert sink. Logged and swallowed by the
/// dispatcher, never propagated to the sampler.
#[derive(Debug, Error)]
pub enum SinkError {
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("sink returned HTTP {0}")]
    HttpStatus(u16),

    #[error("{0}")]
    Other(String),
}
