//! Relay forwarder: public HTTP request in, tunnel request out
//!
//! The forwarder runs on the server leg. It picks a live connection for the
//! token, checks the request against the server's accept rules and either
//! waits for an inline `response` or registers a stream and returns its body
//! as it arrives.

use std::sync::Arc;

use bytes::Bytes;
use http::{HeaderMap, HeaderValue, Method, StatusCode};
use serde_json::{json, Value};
use tokio::time::timeout;
use uuid::Uuid;
use zbroker_filter::{CompiledRuleSet, FilterRequest, BLOCKED_HTTP_REASON};
use zbroker_observability::{metrics, Direction, RelayMetrics};
use zbroker_tunnel::{
    headers_from_wire, headers_to_wire, mask_token, ConnectionEntry, ConnectionRegistry,
    ConnectionRole, Message, RequestPayload, ResponsePayload, SelectionPolicy, StreamBody,
    StreamReceiver, StreamingTable, WireHeaders, CAPABILITY_POST_STREAMS,
};

use crate::context::CorrelationContext;
use crate::RelayConfig;

/// Request header asking for an inline response over the tunnel
pub const WS_RESPONSE_HEADER: &str = "x-broker-ws-response";

/// Response header naming why the broker could not relay
pub const FAILURE_HEADER: &str = "x-broker-failure";

/// Query parameter selecting the connection role
pub const CONNECTION_ROLE_PARAM: &str = "connection_role";

/// Headers describing the tunnel hop rather than the response body
const HOP_RESPONSE_HEADERS: [&str; 4] = ["content-length", "transfer-encoding", "connection", "keep-alive"];

/// A public request addressed to `/broker/{token}/...`
#[derive(Debug, Clone)]
pub struct InboundRequest {
    /// HTTP method
    pub method: Method,
    /// Original path and query, including the `/broker/{token}` prefix
    pub uri: String,
    /// Request headers
    pub headers: HeaderMap,
    /// Request body
    pub body: Bytes,
}

/// Body of a relayed response
#[derive(Debug)]
pub enum RelayBody {
    /// Complete body
    Full(Bytes),
    /// Body streamed from the streaming table
    Stream(StreamBody),
}

/// A response produced by the forwarder
#[derive(Debug)]
pub struct RelayResponse {
    /// HTTP status
    pub status: StatusCode,
    /// Response headers
    pub headers: HeaderMap,
    /// Response body
    pub body: RelayBody,
}

impl RelayResponse {
    /// A JSON response generated by the broker itself
    #[must_use]
    pub fn json(status: StatusCode, body: &Value) -> Self {
        let mut headers = HeaderMap::new();
        headers.insert(http::header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
        Self {
            status,
            headers,
            body: RelayBody::Full(Bytes::from(body.to_string())),
        }
    }

    /// Whether the body is streamed
    #[must_use]
    pub fn is_streamed(&self) -> bool {
        matches!(self.body, RelayBody::Stream(_))
    }

    fn no_connection() -> Self {
        let mut response = Self::json(StatusCode::NOT_FOUND, &json!({ "ok": false }));
        response
            .headers
            .insert(FAILURE_HEADER, HeaderValue::from_static("no-connection"));
        response
    }

    fn failure(status: StatusCode, message: &str) -> Self {
        Self::json(status, &json!({ "message": message }))
    }
}

/// Split a broker URI into the relayed path and the requested role
///
/// Removes the `/broker/{token}` prefix and the `connection_role` query
/// parameter.
#[must_use]
pub fn strip_broker_prefix(uri: &str, token: &str) -> (String, Option<ConnectionRole>) {
    let prefix = format!("/broker/{token}");
    let rest = uri.strip_prefix(&prefix).unwrap_or(uri);

    let (path, query) = match rest.split_once('?') {
        Some((path, query)) => (path, Some(query)),
        None => (rest, None),
    };
    let path = if path.starts_with('/') {
        path.to_string()
    } else {
        format!("/{path}")
    };

    let Some(query) = query else {
        return (path, None);
    };

    let mut role = None;
    let kept: Vec<&str> = query
        .split('&')
        .filter(|pair| {
            let key = pair.split_once('=').map_or(*pair, |(k, _)| k);
            if key != CONNECTION_ROLE_PARAM {
                return true;
            }
            role = match pair.split_once('=').map(|(_, v)| v) {
                Some("primary") => Some(ConnectionRole::Primary),
                Some("secondary") => Some(ConnectionRole::Secondary),
                _ => role,
            };
            false
        })
        .collect();

    if kept.is_empty() {
        (path, role)
    } else {
        (format!("{path}?{}", kept.join("&")), role)
    }
}

/// Forwards public requests over the tunnel
pub struct Forwarder {
    registry: Arc<ConnectionRegistry>,
    streams: Arc<StreamingTable>,
    rules: Arc<CompiledRuleSet>,
    config: RelayConfig,
    policy: SelectionPolicy,
}

impl Forwarder {
    /// Create a forwarder
    #[must_use]
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        streams: Arc<StreamingTable>,
        rules: Arc<CompiledRuleSet>,
        config: RelayConfig,
    ) -> Self {
        Self {
            registry,
            streams,
            rules,
            config,
            policy: SelectionPolicy::default(),
        }
    }

    /// Set the default connection selection policy
    #[must_use]
    pub fn with_policy(mut self, policy: SelectionPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Relay one public request for `token`
    pub async fn forward(&self, token: &str, request: InboundRequest) -> RelayResponse {
        let masked = mask_token(token);
        let (url, role) = strip_broker_prefix(&request.uri, token);
        let policy = match role {
            Some(ConnectionRole::Primary) => SelectionPolicy::PreferPrimary,
            _ => self.policy,
        };

        let Some(entry) = self.registry.select(token, policy) else {
            tracing::warn!(token = %masked, url = %url, "no tunnel connection for token");
            return RelayResponse::no_connection();
        };

        let InboundRequest {
            method,
            mut headers,
            body,
            ..
        } = request;
        let ctx = CorrelationContext::ensure(&mut headers);

        let filter_request = FilterRequest::new(method.as_str(), &url, &headers)
            .with_body(&body)
            .with_capabilities(&entry.capabilities);
        let Some(result) = self
            .rules
            .evaluate(entry.connection_type.as_deref(), &filter_request)
        else {
            if let Some(m) = metrics() {
                m.record_http_request(true, Direction::Inbound);
            }
            tracing::warn!(
                token = %masked,
                request_id = %ctx.request_id,
                method = %method,
                url = %url,
                "blocked request"
            );
            return RelayResponse::json(
                StatusCode::UNAUTHORIZED,
                &json!({ "message": "blocked", "reason": BLOCKED_HTTP_REASON, "url": url }),
            );
        };

        if let Some(m) = metrics() {
            m.record_http_request(false, Direction::Inbound);
        }

        let wants_inline = headers.contains_key(WS_RESPONSE_HEADER);
        let streamed = !wants_inline && (entry.has_capability(CAPABILITY_POST_STREAMS) || result.stream);

        let payload = RequestPayload {
            request_id: Uuid::new_v4(),
            url: result.url,
            method: method.to_string(),
            headers: headers_to_wire(&headers),
            body,
            streaming_id: String::new(),
        };

        tracing::info!(
            token = %masked,
            request_id = %ctx.request_id,
            connection_id = %entry.id,
            streamed,
            "brokering request through tunnel"
        );

        if streamed {
            self.forward_streamed(&entry, payload).await
        } else {
            self.forward_inline(&entry, payload, &ctx).await
        }
    }

    async fn forward_streamed(&self, entry: &ConnectionEntry, mut payload: RequestPayload) -> RelayResponse {
        let streaming_id = Uuid::new_v4().to_string();

        // The id must exist before the request referencing it goes out
        let StreamReceiver { head, body } = match self.streams.begin(&streaming_id) {
            Ok(receiver) => receiver,
            Err(e) => {
                tracing::error!(error = %e, "failed to register stream");
                return RelayResponse::failure(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string());
            }
        };

        payload.streaming_id.clone_from(&streaming_id);
        if let Err(e) = entry.send(Message::Request(payload)).await {
            self.streams.destroy(&streaming_id, "tunnel connection closed");
            tracing::warn!(streaming_id = %streaming_id, error = %e, "failed to send request");
            return RelayResponse::failure(StatusCode::BAD_GATEWAY, "tunnel connection closed");
        }
        if let Some(m) = metrics() {
            m.record_ws_request(false, Direction::Outbound);
        }

        match timeout(self.config.inline_response_timeout, head).await {
            Ok(Ok(meta)) => RelayResponse {
                status: status_or_bad_gateway(meta.status),
                headers: response_headers(&meta.headers),
                body: RelayBody::Stream(body),
            },
            Ok(Err(_)) => {
                tracing::warn!(streaming_id = %streaming_id, "stream closed before response headers");
                RelayResponse::failure(StatusCode::BAD_GATEWAY, "stream closed before response headers")
            }
            Err(_) => {
                self.streams.destroy(&streaming_id, "timeout");
                tracing::warn!(streaming_id = %streaming_id, "timed out waiting for stream headers");
                RelayResponse::failure(StatusCode::GATEWAY_TIMEOUT, "timed out waiting for response")
            }
        }
    }

    async fn forward_inline(
        &self,
        entry: &ConnectionEntry,
        payload: RequestPayload,
        ctx: &CorrelationContext,
    ) -> RelayResponse {
        let request_id = payload.request_id;
        let waiter = match entry.request(payload).await {
            Ok(waiter) => waiter,
            Err(e) => {
                tracing::warn!(request_id = %ctx.request_id, error = %e, "failed to send request");
                return RelayResponse::failure(StatusCode::BAD_GATEWAY, "tunnel connection closed");
            }
        };
        if let Some(m) = metrics() {
            m.record_ws_request(false, Direction::Outbound);
        }

        match timeout(self.config.inline_response_timeout, waiter).await {
            Ok(Ok(response)) => inline_response(response, ctx),
            Ok(Err(_)) => {
                tracing::warn!(request_id = %ctx.request_id, "tunnel closed before response");
                RelayResponse::failure(StatusCode::BAD_GATEWAY, "tunnel connection closed")
            }
            Err(_) => {
                entry.cancel(&request_id);
                tracing::warn!(request_id = %ctx.request_id, "timed out waiting for inline response");
                RelayResponse::failure(StatusCode::GATEWAY_TIMEOUT, "timed out waiting for response")
            }
        }
    }
}

/// Inline bodies are always buffered, so even an empty one has a known size
fn record_inline_size(m: &RelayMetrics, body: &[u8]) {
    m.observe_response_size(body.len() as u64, false);
}

fn inline_response(response: ResponsePayload, ctx: &CorrelationContext) -> RelayResponse {
    if response.status < 300 {
        if let Some(m) = metrics() {
            record_inline_size(m, &response.body);
        }
        tracing::debug!(request_id = %ctx.request_id, status = response.status, "inline response");
    } else {
        tracing::warn!(
            request_id = %ctx.request_id,
            status = response.status,
            error_type = response.error_type.as_deref().unwrap_or_default(),
            original_body_size = response.original_body_size,
            "non-2xx inline response"
        );
    }

    RelayResponse {
        status: status_or_bad_gateway(response.status),
        headers: response_headers(&response.headers),
        body: RelayBody::Full(response.body),
    }
}

fn response_headers(wire: &WireHeaders) -> HeaderMap {
    let mut headers = headers_from_wire(wire);
    for name in HOP_RESPONSE_HEADERS {
        headers.remove(name);
    }
    headers
}

fn status_or_bad_gateway(status: u16) -> StatusCode {
    StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_GATEWAY)
}
