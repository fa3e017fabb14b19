//! Prometheus relay metrics
//!
//! One [`RelayMetrics`] instance is installed globally by [`init_metrics`];
//! library code records through [`metrics()`], which is a no-op before
//! initialization.

use prometheus::{
    Counter, CounterVec, Encoder, Gauge, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder,
};
use tracing::info;

use crate::config::MetricsConfig;
use crate::error::{ObservabilityError, Result};

/// Which way a relayed request is travelling
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Public HTTP request entering the server leg
    Inbound,
    /// Tunnel request leaving the client leg for a private endpoint
    Outbound,
}

impl Direction {
    /// Label value
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Inbound => "inbound",
            Self::Outbound => "outbound",
        }
    }
}

fn init_err(e: prometheus::Error) -> ObservabilityError {
    ObservabilityError::MetricsInit(e.to_string())
}

/// Metrics recorded by the relay on both legs
pub struct RelayMetrics {
    registry: Registry,

    /// HTTP requests seen by the forwarder, by outcome and direction
    pub http_requests_total: CounterVec,
    /// Tunnel requests seen by the dispatcher, by outcome and direction
    pub ws_requests_total: CounterVec,
    /// Size of relayed response bodies in bytes
    pub response_size_bytes: HistogramVec,
    /// Responses whose body size could not be determined
    pub unable_to_size_response_total: Counter,
    /// Live tunnel connections across all tokens
    pub active_connections: Gauge,
    /// Streamed responses waiting for or receiving data
    pub active_streams: Gauge,
}

impl RelayMetrics {
    /// Create and register every metric on a fresh registry
    ///
    /// # Errors
    ///
    /// Returns an error if a metric definition is rejected by prometheus.
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let http_requests_total = CounterVec::new(
            Opts::new("zbroker_http_requests_total", "HTTP requests handled by the relay"),
            &["blocked", "direction"],
        )
        .map_err(init_err)?;

        let ws_requests_total = CounterVec::new(
            Opts::new("zbroker_ws_requests_total", "Tunnel requests handled by the relay"),
            &["blocked", "direction"],
        )
        .map_err(init_err)?;

        let response_size_bytes = HistogramVec::new(
            HistogramOpts::new("zbroker_response_size_bytes", "Relayed response body size")
                .buckets(prometheus::exponential_buckets(64.0, 4.0, 12).map_err(init_err)?),
            &["streaming"],
        )
        .map_err(init_err)?;

        let unable_to_size_response_total = Counter::new(
            "zbroker_unable_to_size_response_total",
            "Responses whose body size could not be measured",
        )
        .map_err(init_err)?;

        let active_connections =
            Gauge::new("zbroker_active_connections", "Live tunnel connections")
                .map_err(init_err)?;

        let active_streams = Gauge::new("zbroker_active_streams", "In-flight streamed responses")
            .map_err(init_err)?;

        registry
            .register(Box::new(http_requests_total.clone()))
            .map_err(init_err)?;
        registry
            .register(Box::new(ws_requests_total.clone()))
            .map_err(init_err)?;
        registry
            .register(Box::new(response_size_bytes.clone()))
            .map_err(init_err)?;
        registry
            .register(Box::new(unable_to_size_response_total.clone()))
            .map_err(init_err)?;
        registry
            .register(Box::new(active_connections.clone()))
            .map_err(init_err)?;
        registry
            .register(Box::new(active_streams.clone()))
            .map_err(init_err)?;

        Ok(Self {
            registry,
            http_requests_total,
            ws_requests_total,
            response_size_bytes,
            unable_to_size_response_total,
            active_connections,
            active_streams,
        })
    }

    /// Get the Prometheus registry
    #[must_use]
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Encode metrics in Prometheus text format
    ///
    /// # Errors
    ///
    /// Returns an error if encoding fails.
    pub fn encode(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer).map_err(init_err)?;
        String::from_utf8(buffer).map_err(|e| ObservabilityError::MetricsInit(e.to_string()))
    }

    /// Count an HTTP request on the forwarder
    pub fn record_http_request(&self, blocked: bool, direction: Direction) {
        self.http_requests_total
            .with_label_values(&[bool_label(blocked), direction.as_str()])
            .inc();
    }

    /// Count a tunnel request on the dispatcher
    pub fn record_ws_request(&self, blocked: bool, direction: Direction) {
        self.ws_requests_total
            .with_label_values(&[bool_label(blocked), direction.as_str()])
            .inc();
    }

    /// Record a response body size
    #[allow(clippy::cast_precision_loss)]
    pub fn observe_response_size(&self, bytes: u64, streaming: bool) {
        self.response_size_bytes
            .with_label_values(&[bool_label(streaming)])
            .observe(bytes as f64);
    }

    /// Count a response whose size is unknown, such as a destroyed stream
    pub fn record_unsized_response(&self) {
        self.unable_to_size_response_total.inc();
    }

    /// Set the live connection count
    #[allow(clippy::cast_precision_loss)]
    pub fn set_active_connections(&self, count: usize) {
        self.active_connections.set(count as f64);
    }

    /// Set the in-flight stream count
    #[allow(clippy::cast_precision_loss)]
    pub fn set_active_streams(&self, count: usize) {
        self.active_streams.set(count as f64);
    }
}

fn bool_label(value: bool) -> &'static str {
    if value {
        "true"
    } else {
        "false"
    }
}

/// Global metrics instance
static METRICS: std::sync::OnceLock<RelayMetrics> = std::sync::OnceLock::new();

/// Initialize global metrics
///
/// Repeated calls return the instance created by the first.
///
/// # Errors
///
/// Returns an error if the metrics cannot be created.
pub fn init_metrics(config: &MetricsConfig) -> Result<&'static RelayMetrics> {
    if let Some(existing) = METRICS.get() {
        return Ok(existing);
    }
    if !config.enabled {
        info!("Metrics endpoint disabled by configuration");
    }

    let created = RelayMetrics::new()?;
    let _ = METRICS.set(created);
    METRICS
        .get()
        .ok_or_else(|| ObservabilityError::MetricsInit("metrics were not installed".to_string()))
}

/// Get the global metrics instance
#[must_use]
pub fn metrics() -> Option<&'static RelayMetrics> {
    METRICS.get()
}
