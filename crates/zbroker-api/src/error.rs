//! API error types

use axum::{
    http::{HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use zbroker_relay::{RelayError, FAILURE_HEADER};
use zbroker_tunnel::TunnelError;

/// API error type
#[derive(Debug, Error)]
pub enum ApiError {
    /// No tunnel connection is registered for the token
    #[error("No connection for token")]
    NoConnection,

    /// A response-data upload named a stream that is not waiting
    #[error("unable to find request matching streaming id")]
    UnknownStream(String),

    /// A response-data upload was not validly framed
    #[error("Invalid response stream: {0}")]
    Framing(String),

    /// The response-data upload broke off or its consumer went away
    #[error("Response stream failed: {0}")]
    Upload(String),

    /// Unexpected failure
    #[error("Internal error: {0}")]
    Internal(String),
}

/// JSON error response body
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Machine readable error kind
    pub error: String,
    /// Human readable message
    pub message: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error_type) = match &self {
            ApiError::NoConnection => {
                let mut response = (StatusCode::NOT_FOUND, Json(json!({ "ok": false }))).into_response();
                response
                    .headers_mut()
                    .insert(FAILURE_HEADER, HeaderValue::from_static("no-connection"));
                return response;
            }
            ApiError::UnknownStream(_) => (StatusCode::INTERNAL_SERVER_ERROR, "unknown_stream"),
            ApiError::Framing(_) => (StatusCode::BAD_REQUEST, "bad_request"),
            ApiError::Upload(_) | ApiError::Internal(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "internal_error")
            }
        };

        let body = ErrorResponse {
            error: error_type.to_string(),
            message: self.to_string(),
        };

        (status, Json(body)).into_response()
    }
}

impl From<TunnelError> for ApiError {
    fn from(err: TunnelError) -> Self {
        match err {
            TunnelError::UnknownStream { streaming_id } => ApiError::UnknownStream(streaming_id),
            TunnelError::NoConnection { .. } => ApiError::NoConnection,
            TunnelError::Protocol { message } => ApiError::Framing(message),
            other => ApiError::Upload(other.to_string()),
        }
    }
}

impl From<RelayError> for ApiError {
    fn from(err: RelayError) -> Self {
        match err {
            RelayError::Framing { message } => ApiError::Framing(message),
            RelayError::Tunnel(inner) => inner.into(),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        ApiError::Internal(err.to_string())
    }
}

/// Result type for handlers
pub type Result<T> = std::result::Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_stream_message() {
        let err: ApiError = TunnelError::unknown_stream("abc").into();
        assert_eq!(err.to_string(), "unable to find request matching streaming id");
        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn test_no_connection_carries_failure_header() {
        let response = ApiError::NoConnection.into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(response.headers()[FAILURE_HEADER], "no-connection");
    }

    #[test]
    fn test_framing_is_bad_request() {
        let err: ApiError = RelayError::framing("metadata length 0").into();
        assert!(matches!(err, ApiError::Framing(_)));
        assert_eq!(err.into_response().status(), StatusCode::BAD_REQUEST);
    }
}
