//! Error types for observability

use thiserror::Error;

/// Errors raised while setting up logging or metrics
#[derive(Debug, Error)]
pub enum ObservabilityError {
    /// The global subscriber could not be installed
    #[error("Failed to initialize logging: {0}")]
    LoggingInit(String),

    /// A metric could not be created, registered or encoded
    #[error("Failed to initialize metrics: {0}")]
    MetricsInit(String),

    /// Invalid observability configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// File system error (log directory)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for observability operations
pub type Result<T> = std::result::Result<T, ObservabilityError>;
