//! Error types for tunnel operations

use thiserror::Error;

/// Errors that can occur during tunnel operations
#[derive(Debug, Error)]
pub enum TunnelError {
    /// Protocol-level error (malformed message, unexpected message type)
    #[error("Protocol error: {message}")]
    Protocol {
        /// Error message describing the protocol violation
        message: String,
    },

    /// The peer failed to identify (missing token, unsupported version)
    #[error("Identify failed: {reason}")]
    Identify {
        /// Reason for the failure
        reason: String,
    },

    /// Connection error (connection refused, reset, closed)
    #[error("Connection error: {source}")]
    Connection {
        /// Underlying I/O error
        #[from]
        source: std::io::Error,
    },

    /// No live connection exists for a token
    #[error("No connection for token {masked_token}")]
    NoConnection {
        /// Masked form of the token
        masked_token: String,
    },

    /// A streaming id was not registered, already finished or evicted
    #[error("Unknown streaming id {streaming_id}")]
    UnknownStream {
        /// The streaming id that missed
        streaming_id: String,
    },

    /// A streaming id is already registered
    #[error("Streaming id {streaming_id} is already registered")]
    DuplicateStream {
        /// The duplicated streaming id
        streaming_id: String,
    },

    /// Configuration error (invalid config, missing required field)
    #[error("Configuration error: {message}")]
    Config {
        /// Error message describing the configuration issue
        message: String,
    },

    /// JSON encoding or decoding of a tunnel message failed
    #[error("Message encoding error: {source}")]
    Json {
        /// Underlying serde error
        #[from]
        source: serde_json::Error,
    },

    /// Operation timed out
    #[error("Operation timed out")]
    Timeout,

    /// Service is shutting down
    #[error("Service is shutting down")]
    Shutdown,
}

impl TunnelError {
    /// Create a new protocol error
    #[must_use]
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    /// Create a new identify error
    #[must_use]
    pub fn identify(reason: impl Into<String>) -> Self {
        Self::Identify {
            reason: reason.into(),
        }
    }

    /// Create a new configuration error
    #[must_use]
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Create a new unknown-stream error
    #[must_use]
    pub fn unknown_stream(streaming_id: impl Into<String>) -> Self {
        Self::UnknownStream {
            streaming_id: streaming_id.into(),
        }
    }

    /// Create a new connection error from any error type
    #[must_use]
    pub fn connection<E: std::error::Error>(err: E) -> Self {
        Self::Connection {
            source: std::io::Error::other(err.to_string()),
        }
    }

    /// Create a new connection error with a message
    #[must_use]
    pub fn connection_msg(message: impl Into<String>) -> Self {
        Self::Connection {
            source: std::io::Error::other(message.into()),
        }
    }

    /// Create a timeout error
    #[must_use]
    pub fn timeout() -> Self {
        Self::Timeout
    }
}

/// Result type alias for tunnel operations
pub type Result<T> = std::result::Result<T, TunnelError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = TunnelError::protocol("unknown message type");
        assert_eq!(err.to_string(), "Protocol error: unknown message type");

        let err = TunnelError::identify("missing token");
        assert_eq!(err.to_string(), "Identify failed: missing token");

        let err = TunnelError::unknown_stream("abc");
        assert_eq!(err.to_string(), "Unknown streaming id abc");

        let err = TunnelError::NoConnection {
            masked_token: "abcd-...-wxyz".to_string(),
        };
        assert_eq!(err.to_string(), "No connection for token abcd-...-wxyz");

        let err = TunnelError::Timeout;
        assert_eq!(err.to_string(), "Operation timed out");
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        let tunnel_err: TunnelError = io_err.into();
        assert!(matches!(tunnel_err, TunnelError::Connection { .. }));
    }
}
