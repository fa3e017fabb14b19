//! Tunnel wire protocol
//!
//! Messages travel as WebSocket text frames holding one JSON object each,
//! tagged by `type`:
//!
//! ```json
//! {"type": "request", "request_id": "...", "url": "/repos/a/b", "method": "GET",
//!  "headers": {"accept": "application/json"}, "body": "", "streaming_id": ""}
//! ```
//!
//! Binary payloads (request/response bodies, chunk data) are base64 encoded.

use std::collections::BTreeMap;

use bytes::Bytes;
use http::{HeaderMap, HeaderName, HeaderValue};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{Result, TunnelError};

/// Broker client version announced at identify
pub const CLIENT_VERSION: &str = "4.190.0";

/// Capability: the client wants responses to be delivered as streamed POSTs
pub const CAPABILITY_POST_STREAMS: &str = "post-streams";

/// Capability: the server accepts streamed POSTs on `/response-data`
pub const CAPABILITY_RECEIVE_POST_STREAMS: &str = "receive-post-streams";

/// Get current timestamp in milliseconds since Unix epoch
#[inline]
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub fn current_timestamp_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0)
        .min(u128::from(u64::MAX)) as u64
}

// =============================================================================
// Headers
// =============================================================================

/// A header value on the wire: one string or a list for repeated headers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum HeaderField {
    /// Single value
    One(String),
    /// Repeated header
    Many(Vec<String>),
}

impl HeaderField {
    /// First value, if any
    #[must_use]
    pub fn first(&self) -> Option<&str> {
        match self {
            Self::One(v) => Some(v),
            Self::Many(vs) => vs.first().map(String::as_str),
        }
    }

    fn values(&self) -> impl Iterator<Item = &str> {
        let slice: &[String] = match self {
            Self::One(v) => std::slice::from_ref(v),
            Self::Many(vs) => vs,
        };
        slice.iter().map(String::as_str)
    }
}

/// Headers as carried in tunnel messages and stream metadata
pub type WireHeaders = BTreeMap<String, HeaderField>;

/// Convert an HTTP header map to wire form (names are lowercase)
#[must_use]
pub fn headers_to_wire(headers: &HeaderMap) -> WireHeaders {
    let mut wire = WireHeaders::new();
    for name in headers.keys() {
        let mut values: Vec<String> = headers
            .get_all(name)
            .iter()
            .map(|v| String::from_utf8_lossy(v.as_bytes()).into_owned())
            .collect();
        let field = if values.len() == 1 {
            HeaderField::One(values.remove(0))
        } else {
            HeaderField::Many(values)
        };
        wire.insert(name.as_str().to_string(), field);
    }
    wire
}

/// Convert wire headers to an HTTP header map, skipping invalid entries
#[must_use]
pub fn headers_from_wire(wire: &WireHeaders) -> HeaderMap {
    let mut headers = HeaderMap::with_capacity(wire.len());
    for (name, field) in wire {
        let Ok(name) = HeaderName::from_bytes(name.as_bytes()) else {
            tracing::debug!(header = %name, "skipping invalid header name");
            continue;
        };
        for value in field.values() {
            match HeaderValue::from_str(value) {
                Ok(v) => {
                    headers.append(name.clone(), v);
                }
                Err(_) => tracing::debug!(header = %name, "skipping invalid header value"),
            }
        }
    }
    headers
}

// =============================================================================
// Payloads
// =============================================================================

/// Role of a tunnel endpoint for high-availability routing
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionRole {
    /// Preferred endpoint
    #[default]
    Primary,
    /// Standby endpoint
    Secondary,
}

impl std::fmt::Display for ConnectionRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Primary => f.write_str("primary"),
            Self::Secondary => f.write_str("secondary"),
        }
    }
}

/// Metadata a client sends with `identify`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientMetadata {
    /// Client version (`4.190.0`, or `local` for development builds)
    pub version: String,
    /// Capabilities the client supports
    #[serde(default)]
    pub capabilities: Vec<String>,
    /// Stable id of the client process
    #[serde(default)]
    pub client_id: String,
    /// HA role of this endpoint
    #[serde(default)]
    pub role: ConnectionRole,
    /// Connection type selecting a per-type ruleset (`github`, `gitlab`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_type: Option<String>,
    /// The client's accept rules, reported back on `/connection-status`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filters: Option<serde_json::Value>,
}

/// Status line and headers of a relayed response
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseMeta {
    /// HTTP status
    pub status: u16,
    /// Response headers
    #[serde(default)]
    pub headers: WireHeaders,
}

/// A request descriptor sent from the server to a client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestPayload {
    /// Correlates the inline `response`
    pub request_id: Uuid,
    /// Path, query and fragment relative to the client's origin rules
    pub url: String,
    /// HTTP method
    pub method: String,
    /// Request headers
    #[serde(default)]
    pub headers: WireHeaders,
    /// Request body
    #[serde(default, with = "base64_bytes")]
    pub body: Bytes,
    /// Streaming id for out-of-band responses; empty for inline responses
    #[serde(default)]
    pub streaming_id: String,
}

/// An inline response sent from a client to the server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponsePayload {
    /// Id of the request this answers
    pub request_id: Uuid,
    /// HTTP status
    pub status: u16,
    /// Response headers
    #[serde(default)]
    pub headers: WireHeaders,
    /// Response body
    #[serde(default, with = "base64_bytes")]
    pub body: Bytes,
    /// Machine-readable failure class (`BODY_TOO_LARGE`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_type: Option<String>,
    /// Size of a body that was not forwarded
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_body_size: Option<u64>,
}

/// A legacy streamed-response chunk sent from a client to the server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkPayload {
    /// Stream this chunk belongs to
    pub streaming_id: String,
    /// Body bytes (empty on the first chunk)
    #[serde(default, with = "base64_bytes")]
    pub data: Bytes,
    /// Whether this is the last chunk
    pub finished: bool,
    /// Status and headers, carried by the first chunk only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<ResponseMeta>,
    /// Set when the client aborts the stream after the head was sent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Severity of a server notification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[allow(missing_docs)]
pub enum NotificationLevel {
    Info,
    Warning,
    Error,
}

// =============================================================================
// Message
// =============================================================================

/// A tunnel message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    /// Client handshake
    Identify {
        /// Broker token selecting the connection pool
        token: String,
        /// Client description
        metadata: ClientMetadata,
    },
    /// Handshake accepted
    IdentifyOk {
        /// Server-assigned id of this connection
        connection_id: Uuid,
        /// Capabilities the server supports
        #[serde(default)]
        capabilities: Vec<String>,
    },
    /// Handshake rejected
    IdentifyFail {
        /// Reason for rejection
        reason: String,
    },
    /// Request descriptor (server to client)
    Request(RequestPayload),
    /// Inline response (client to server)
    Response(ResponsePayload),
    /// Legacy streamed response chunk (client to server)
    Chunk(ChunkPayload),
    /// Liveness probe
    Heartbeat {
        /// Sender timestamp in milliseconds
        timestamp: u64,
    },
    /// Liveness probe answer
    HeartbeatAck {
        /// Timestamp echoed from the heartbeat
        timestamp: u64,
    },
    /// Informational message from the server
    Notification {
        /// Severity
        level: NotificationLevel,
        /// Human-readable text
        message: String,
    },
    /// Orderly shutdown of the connection
    Disconnect {
        /// Reason for disconnecting
        reason: String,
    },
}

impl Message {
    /// Encode as a JSON text frame
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_text(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Decode from a JSON text frame
    ///
    /// # Errors
    ///
    /// Returns a protocol error if the text is not a known message.
    pub fn from_text(text: &str) -> Result<Self> {
        serde_json::from_str(text)
            .map_err(|e| TunnelError::protocol(format!("invalid tunnel message: {e}")))
    }

    /// Message type name for logging
    #[must_use]
    pub fn message_type(&self) -> &'static str {
        match self {
            Self::Identify { .. } => "identify",
            Self::IdentifyOk { .. } => "identify_ok",
            Self::IdentifyFail { .. } => "identify_fail",
            Self::Request(_) => "request",
            Self::Response(_) => "response",
            Self::Chunk(_) => "chunk",
            Self::Heartbeat { .. } => "heartbeat",
            Self::HeartbeatAck { .. } => "heartbeat_ack",
            Self::Notification { .. } => "notification",
            Self::Disconnect { .. } => "disconnect",
        }
    }
}

mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use bytes::Bytes;
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &Bytes, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Bytes, D::Error> {
        let text = String::deserialize(deserializer)?;
        STANDARD
            .decode(text)
            .map(Bytes::from)
            .map_err(de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identify_wire_shape() {
        let msg = Message::Identify {
            token: "tok".to_string(),
            metadata: ClientMetadata {
                version: "4.190.0".to_string(),
                capabilities: vec![CAPABILITY_POST_STREAMS.to_string()],
                client_id: "client-1".to_string(),
                role: ConnectionRole::Secondary,
                connection_type: Some("github".to_string()),
                filters: None,
            },
        };

        let value: serde_json::Value = serde_json::from_str(&msg.to_text().unwrap()).unwrap();
        assert_eq!(value["type"], "identify");
        assert_eq!(value["metadata"]["role"], "secondary");
        assert_eq!(value["metadata"]["capabilities"][0], "post-streams");
        assert!(value["metadata"].get("filters").is_none());
    }

    #[test]
    fn test_request_body_is_base64() {
        let msg = Message::Request(RequestPayload {
            request_id: Uuid::nil(),
            url: "/echo".to_string(),
            method: "POST".to_string(),
            headers: WireHeaders::new(),
            body: Bytes::from_static(b"hello"),
            streaming_id: String::new(),
        });

        let text = msg.to_text().unwrap();
        assert!(text.contains(r#""body":"aGVsbG8=""#));
        assert_eq!(Message::from_text(&text).unwrap(), msg);
    }

    #[test]
    fn test_minimal_messages_use_defaults() {
        let msg = Message::from_text(
            r#"{"type":"chunk","streaming_id":"s1","finished":true}"#,
        )
        .unwrap();
        let Message::Chunk(chunk) = msg else {
            panic!("expected chunk");
        };
        assert!(chunk.data.is_empty());
        assert!(chunk.meta.is_none());
        assert!(chunk.error.is_none());

        let msg = Message::from_text(
            r#"{"type":"chunk","streaming_id":"s1","finished":true,"error":"reset by peer"}"#,
        )
        .unwrap();
        let Message::Chunk(chunk) = msg else {
            panic!("expected chunk");
        };
        assert_eq!(chunk.error.as_deref(), Some("reset by peer"));

        let msg = Message::from_text(
            r#"{"type":"identify","token":"t","metadata":{"version":"local"}}"#,
        )
        .unwrap();
        let Message::Identify { metadata, .. } = msg else {
            panic!("expected identify");
        };
        assert_eq!(metadata.role, ConnectionRole::Primary);
        assert!(metadata.capabilities.is_empty());
    }

    #[test]
    fn test_unknown_message_is_protocol_error() {
        let err = Message::from_text(r#"{"type":"bogus"}"#).unwrap_err();
        assert!(matches!(err, TunnelError::Protocol { .. }));
    }

    #[test]
    fn test_header_conversion() {
        let mut headers = HeaderMap::new();
        headers.insert("content-type", HeaderValue::from_static("text/plain"));
        headers.append("set-cookie", HeaderValue::from_static("a=1"));
        headers.append("set-cookie", HeaderValue::from_static("b=2"));

        let wire = headers_to_wire(&headers);
        assert_eq!(wire["content-type"], HeaderField::One("text/plain".to_string()));
        assert_eq!(
            wire["set-cookie"],
            HeaderField::Many(vec!["a=1".to_string(), "b=2".to_string()])
        );

        let back = headers_from_wire(&wire);
        assert_eq!(back.get_all("set-cookie").iter().count(), 2);
        assert_eq!(back["content-type"], "text/plain");
    }

    #[test]
    fn test_invalid_wire_headers_are_skipped() {
        let mut wire = WireHeaders::new();
        wire.insert("bad header".to_string(), HeaderField::One("x".to_string()));
        wire.insert("x-ok".to_string(), HeaderField::One("fine".to_string()));
        wire.insert("x-bad-value".to_string(), HeaderField::One("a\nb".to_string()));

        let headers = headers_from_wire(&wire);
        assert_eq!(headers.len(), 1);
        assert_eq!(headers["x-ok"], "fine");
    }
}
