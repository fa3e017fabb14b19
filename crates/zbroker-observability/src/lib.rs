//! `ZBroker` Observability - logging and metrics
//!
//! - Structured logging with pretty/JSON/compact console output and optional
//!   rolling JSON files
//! - Prometheus relay metrics exposed by the server leg
//!
//! # Quick Start
//!
//! ```no_run
//! use zbroker_observability::{init_observability, ObservabilityConfig};
//!
//! let config = ObservabilityConfig::default();
//! let _guard = init_observability(&config).expect("failed to init observability");
//!
//! tracing::info!("broker started");
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod error;
pub mod logging;
pub mod metrics;

pub use config::{
    FileLoggingConfig, LogFormat, LogLevel, LoggingConfig, MetricsConfig, ObservabilityConfig,
    RotationStrategy,
};
pub use error::{ObservabilityError, Result};
pub use logging::{init_logging, LogGuard};
pub use metrics::{init_metrics, metrics, Direction, RelayMetrics};

/// Initialize logging, then metrics
///
/// Returns the logging guard, which must be held for the lifetime of the process.
///
/// # Errors
///
/// Returns an error if either subsystem fails to initialize.
pub fn init_observability(config: &ObservabilityConfig) -> Result<LogGuard> {
    let log_guard = init_logging(&config.logging)?;
    init_metrics(&config.metrics)?;

    tracing::info!(
        format = ?config.logging.format,
        metrics = config.metrics.enabled,
        "Observability initialized"
    );
    Ok(log_guard)
}
