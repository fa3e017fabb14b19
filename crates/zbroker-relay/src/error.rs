//! Error types for relay operations

use thiserror::Error;
use zbroker_filter::FilterError;
use zbroker_tunnel::TunnelError;

/// Errors that can occur while relaying a request
#[derive(Debug, Error)]
pub enum RelayError {
    /// The downstream response body exceeded the inline size cap
    #[error("body size of {size} is greater than max allowed of {limit} bytes")]
    BodyTooLarge {
        /// Bytes actually received
        size: u64,
        /// Configured cap
        limit: u64,
    },

    /// The stream framing could not be parsed
    #[error("Malformed stream framing: {message}")]
    Framing {
        /// What was wrong with the frame
        message: String,
    },

    /// The outbound request could not be built
    #[error("Invalid outbound request: {message}")]
    InvalidRequest {
        /// What was wrong with the request
        message: String,
    },

    /// An outbound HTTP call failed
    #[error("HTTP error: {source}")]
    Http {
        /// Underlying client error
        #[from]
        source: reqwest::Error,
    },

    /// The response-data POST was refused by the server
    #[error("Stream upload rejected with status {status}")]
    UploadRejected {
        /// Status returned by the server
        status: u16,
    },

    /// A plugin failed during startup or request preparation
    #[error("Plugin {code} failed: {message}")]
    Plugin {
        /// Plugin code
        code: String,
        /// Failure description
        message: String,
    },

    /// Tunnel error (closed connection, unknown stream)
    #[error(transparent)]
    Tunnel(#[from] TunnelError),

    /// Filter error (rule loading)
    #[error(transparent)]
    Filter(#[from] FilterError),

    /// JSON encoding or decoding failed
    #[error("JSON error: {source}")]
    Json {
        /// Underlying serde error
        #[from]
        source: serde_json::Error,
    },

    /// Configuration error
    #[error("Configuration error: {message}")]
    Config {
        /// Error message describing the configuration issue
        message: String,
    },

    /// Operation timed out
    #[error("Operation timed out")]
    Timeout,
}

impl RelayError {
    /// Create a framing error
    #[must_use]
    pub fn framing(message: impl Into<String>) -> Self {
        Self::Framing {
            message: message.into(),
        }
    }

    /// Create an invalid-request error
    #[must_use]
    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::InvalidRequest {
            message: message.into(),
        }
    }

    /// Create a plugin error
    #[must_use]
    pub fn plugin(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Plugin {
            code: code.into(),
            message: message.into(),
        }
    }

    /// Create a configuration error
    #[must_use]
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }
}

/// Result type alias for relay operations
pub type Result<T> = std::result::Result<T, RelayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = RelayError::BodyTooLarge {
            size: 26_214_400,
            limit: 20_971_520,
        };
        assert_eq!(
            err.to_string(),
            "body size of 26214400 is greater than max allowed of 20971520 bytes"
        );

        let err = RelayError::framing("truncated length prefix");
        assert_eq!(err.to_string(), "Malformed stream framing: truncated length prefix");

        let err = RelayError::plugin("GHA", "no installation");
        assert_eq!(err.to_string(), "Plugin GHA failed: no installation");
    }

    #[test]
    fn test_tunnel_error_is_transparent() {
        let err: RelayError = TunnelError::unknown_stream("abc").into();
        assert_eq!(err.to_string(), "Unknown streaming id abc");
    }
}
