//! Relay dispatcher: tunnel request in, private HTTP call out
//!
//! The dispatcher runs on the client leg. Every request descriptor is checked
//! against the client's own accept rules (the second half of the symmetric
//! trust boundary), prepared, sent downstream and answered in one of three
//! ways:
//! - inline `response` for an empty streaming id
//! - framed POST to `/response-data` when the server accepts uploads
//! - legacy `chunk` messages otherwise

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use http::HeaderMap;
use serde_json::{json, Value};
use url::Url;
use uuid::Uuid;
use zbroker_filter::{CompiledRuleSet, FilterRequest, Variables, BLOCKED_TUNNEL_REASON};
use zbroker_observability::{metrics, Direction};
use zbroker_tunnel::{
    headers_from_wire, headers_to_wire, mask_token, HeaderField, Message, RequestHandler,
    RequestPayload, ResponsePayload, TunnelSender, CAPABILITY_RECEIVE_POST_STREAMS,
};

use crate::context::{CorrelationContext, REQUEST_ID_HEADER};
use crate::downstream::{BufferedResponse, Downstream};
use crate::forwarder::WS_RESPONSE_HEADER;
use crate::legacy::LegacyStreamWriter;
use crate::plugin::PluginRegistry;
use crate::post_stream::{json_response_parts, response_data_url, PostStreamWriter};
use crate::prepare::{strip_context_prefix, PreparedRequest, RequestPreparer};
use crate::{RelayConfig, RelayError, Result};

/// `error_type` of an inline response whose body exceeded the cap
pub const BODY_TOO_LARGE: &str = "BODY_TOO_LARGE";

/// Inline response for a body that exceeded the size cap
#[must_use]
pub fn oversized_response(request_id: Uuid, size: u64, limit: u64) -> ResponsePayload {
    let message = RelayError::BodyTooLarge { size, limit }.to_string();
    ResponsePayload {
        request_id,
        status: 502,
        headers: Default::default(),
        body: Bytes::from(json!({ "message": message }).to_string()),
        error_type: Some(BODY_TOO_LARGE.to_string()),
        original_body_size: Some(size),
    }
}

/// Answers tunnel requests by calling into the private network
pub struct Dispatcher {
    rules: Arc<CompiledRuleSet>,
    vars: Arc<Variables>,
    config: RelayConfig,
    downstream: Downstream,
    plugins: PluginRegistry,
    token: String,
    connection_type: Option<String>,
    server_facing: bool,
}

impl Dispatcher {
    /// Create a dispatcher for the connection identified by `token`
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or the HTTP client
    /// cannot be built.
    pub fn new(
        rules: Arc<CompiledRuleSet>,
        vars: Arc<Variables>,
        config: RelayConfig,
        token: impl Into<String>,
    ) -> Result<Self> {
        config.validate().map_err(RelayError::config)?;
        let downstream = Downstream::new(&config)?;
        Ok(Self {
            rules,
            vars,
            config,
            downstream,
            plugins: PluginRegistry::new(),
            token: token.into(),
            connection_type: None,
            server_facing: false,
        })
    }

    /// Select the per-type ruleset and plugins for this connection
    #[must_use]
    pub fn with_connection_type(mut self, connection_type: impl Into<String>) -> Self {
        self.connection_type = Some(connection_type.into());
        self
    }

    /// Use `plugins` during request preparation
    #[must_use]
    pub fn with_plugins(mut self, plugins: PluginRegistry) -> Self {
        self.plugins = plugins;
        self
    }

    /// Tag outbound calls with the broker token, for dispatchers on the server leg
    #[must_use]
    pub fn server_facing(mut self) -> Self {
        self.server_facing = true;
        self
    }

    /// Run plugin startup for this connection's type
    ///
    /// # Errors
    ///
    /// Returns the first plugin failure.
    pub async fn startup(&self) -> Result<()> {
        match &self.connection_type {
            Some(connection_type) => self.plugins.startup(connection_type, &self.vars).await,
            None => Ok(()),
        }
    }

    /// Handle one request descriptor
    pub async fn dispatch(&self, request: RequestPayload, tunnel: &TunnelSender) {
        let url = strip_context_prefix(&request.url).to_string();
        let headers = headers_from_wire(&request.headers);
        let ctx = CorrelationContext::from_headers(&headers);

        let filter_request = FilterRequest::new(&request.method, &url, &headers)
            .with_body(&request.body)
            .with_capabilities(tunnel.server_capabilities());
        let Some(result) = self
            .rules
            .evaluate(self.connection_type.as_deref(), &filter_request)
        else {
            if let Some(m) = metrics() {
                m.record_ws_request(true, Direction::Inbound);
            }
            tracing::warn!(
                request_id = %ctx.request_id,
                method = %request.method,
                url = %url,
                "blocked tunnel request"
            );
            let body = json!({ "message": "blocked", "reason": BLOCKED_TUNNEL_REASON, "url": url });
            self.respond_json(&request, tunnel, 401, &body).await;
            return;
        };

        if let Some(m) = metrics() {
            m.record_ws_request(false, Direction::Inbound);
        }

        let mut preparer = RequestPreparer::new(&self.config, &self.vars);
        if self.server_facing {
            preparer = preparer.server_facing(&self.token);
        }
        let mut prepared = match preparer.prepare(&result, &request.method, headers, request.body.clone()) {
            Ok(prepared) => prepared,
            Err(e) => {
                tracing::warn!(request_id = %ctx.request_id, error = %e, "failed to prepare request");
                self.respond_json(&request, tunnel, 500, &json!({ "error": e.to_string() }))
                    .await;
                return;
            }
        };

        if let Some(connection_type) = &self.connection_type {
            if let Err(e) = self
                .plugins
                .pre_request(connection_type, &self.vars, &mut prepared)
                .await
            {
                tracing::error!(request_id = %ctx.request_id, error = %e, "plugin pre-request failed");
                self.respond_json(&request, tunnel, 500, &json!({ "error": e.to_string() }))
                    .await;
                return;
            }
        }

        if let Some(m) = metrics() {
            m.record_http_request(false, Direction::Outbound);
        }

        tracing::debug!(
            request_id = %ctx.request_id,
            method = %prepared.method,
            host = prepared.url.host_str().unwrap_or_default(),
            streamed = !request.streaming_id.is_empty(),
            "relaying request downstream"
        );

        if request.streaming_id.is_empty() {
            self.respond_buffered(&request, &prepared, tunnel, &ctx).await;
        } else {
            self.respond_streamed(&request, &prepared, tunnel, &ctx).await;
        }
    }

    async fn respond_buffered(
        &self,
        request: &RequestPayload,
        prepared: &PreparedRequest,
        tunnel: &TunnelSender,
        ctx: &CorrelationContext,
    ) {
        let limit = self.config.socket_max_response_length;
        let payload = match self.downstream.fetch_buffered(prepared, limit).await {
            Ok(BufferedResponse { status, headers, body }) => {
                if status > 404 {
                    tracing::warn!(request_id = %ctx.request_id, status, "downstream error response");
                }
                ResponsePayload {
                    request_id: request.request_id,
                    status,
                    headers: inline_headers(&headers, &ctx.request_id),
                    body,
                    error_type: None,
                    original_body_size: None,
                }
            }
            Err(RelayError::BodyTooLarge { size, limit }) => {
                tracing::warn!(request_id = %ctx.request_id, size, limit, "response body too large");
                oversized_response(request.request_id, size, limit)
            }
            Err(e) => {
                tracing::warn!(request_id = %ctx.request_id, error = %e, "downstream request failed");
                json_payload(request.request_id, 500, &json!({ "error": e.to_string() }))
            }
        };

        if let Err(e) = tunnel.send(Message::Response(payload)).await {
            tracing::warn!(request_id = %ctx.request_id, error = %e, "failed to send response");
        }
    }

    async fn respond_streamed(
        &self,
        request: &RequestPayload,
        prepared: &PreparedRequest,
        tunnel: &TunnelSender,
        ctx: &CorrelationContext,
    ) {
        let response = self.downstream.send(prepared).await;

        let result = match self.upload_target(&request.streaming_id, tunnel) {
            Some(target) => {
                PostStreamWriter::new(&self.downstream, target, ctx.request_id.clone())
                    .stream_response(response)
                    .await
            }
            None => {
                LegacyStreamWriter::new(tunnel.clone(), request.streaming_id.clone())
                    .stream_response(response)
                    .await
            }
        };

        match result {
            Ok(bytes) => tracing::debug!(
                request_id = %ctx.request_id,
                streaming_id = %request.streaming_id,
                bytes,
                "streamed response complete"
            ),
            Err(e) => tracing::warn!(
                request_id = %ctx.request_id,
                streaming_id = %request.streaming_id,
                error = %e,
                "streamed response failed"
            ),
        }
    }

    /// Answer with a JSON body generated by the relay, in the request's mode
    async fn respond_json(&self, request: &RequestPayload, tunnel: &TunnelSender, status: u16, body: &Value) {
        let result = if request.streaming_id.is_empty() {
            tunnel
                .send(Message::Response(json_payload(request.request_id, status, body)))
                .await
                .map_err(RelayError::from)
        } else {
            let (meta, body) = json_response_parts(status, body);
            match self.upload_target(&request.streaming_id, tunnel) {
                Some(target) => {
                    PostStreamWriter::new(&self.downstream, target, request.request_id.to_string())
                        .send_json(meta, body)
                        .await
                        .map(|_| ())
                }
                None => LegacyStreamWriter::new(tunnel.clone(), request.streaming_id.clone())
                    .send_json(meta, body)
                    .await
                    .map(|_| ()),
            }
        };

        if let Err(e) = result {
            tracing::warn!(request_id = %request.request_id, status, error = %e, "failed to send relay response");
        }
    }

    /// Upload URL when the server accepts POSTed streams and we know where it is
    fn upload_target(&self, streaming_id: &str, tunnel: &TunnelSender) -> Option<Url> {
        if !tunnel.server_has_capability(CAPABILITY_RECEIVE_POST_STREAMS) {
            return None;
        }
        let server_url = self.config.broker_server_url.as_deref()?;
        match response_data_url(server_url, &self.token, streaming_id, self.config.server_id.as_deref()) {
            Ok(url) => Some(url),
            Err(e) => {
                tracing::warn!(token = %mask_token(&self.token), error = %e, "falling back to legacy chunks");
                None
            }
        }
    }
}

#[async_trait]
impl RequestHandler for Dispatcher {
    async fn handle(&self, request: RequestPayload, tunnel: TunnelSender) {
        self.dispatch(request, &tunnel).await;
    }
}

fn json_payload(request_id: Uuid, status: u16, body: &Value) -> ResponsePayload {
    let (meta, body) = json_response_parts(status, body);
    ResponsePayload {
        request_id,
        status,
        headers: meta.headers,
        body,
        error_type: None,
        original_body_size: None,
    }
}

/// Downstream headers plus the correlation and inline-mode markers
fn inline_headers(headers: &HeaderMap, request_id: &str) -> zbroker_tunnel::WireHeaders {
    let mut wire = headers_to_wire(headers);
    if !request_id.is_empty() {
        wire.entry(REQUEST_ID_HEADER.to_string())
            .or_insert_with(|| HeaderField::One(request_id.to_string()));
    }
    wire.entry(WS_RESPONSE_HEADER.to_string())
        .or_insert_with(|| HeaderField::One("true".to_string()));
    wire
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;
    use zbroker_filter::{Rule, RuleSet};

    fn dispatcher(rules: Vec<Rule>) -> Dispatcher {
        let vars = Arc::new(Variables::new());
        let rules = CompiledRuleSet::compile(&RuleSet::Flat(rules), Arc::clone(&vars)).unwrap();
        Dispatcher::new(Arc::new(rules), vars, RelayConfig::default(), "dispatch-token-01").unwrap()
    }

    fn request(url: &str, streaming_id: &str) -> RequestPayload {
        RequestPayload {
            request_id: Uuid::new_v4(),
            url: url.to_string(),
            method: "GET".to_string(),
            headers: Default::default(),
            body: Bytes::new(),
            streaming_id: streaming_id.to_string(),
        }
    }

    #[test]
    fn test_oversized_response() {
        let id = Uuid::new_v4();
        let payload = oversized_response(id, 26_214_400, 20_971_520);
        assert_eq!(payload.status, 502);
        assert_eq!(payload.error_type.as_deref(), Some("BODY_TOO_LARGE"));
        assert_eq!(payload.original_body_size, Some(26_214_400));

        let body: Value = serde_json::from_slice(&payload.body).unwrap();
        assert_eq!(
            body["message"],
            "body size of 26214400 is greater than max allowed of 20971520 bytes"
        );
    }

    #[test]
    fn test_inline_headers_keep_existing_values() {
        let mut headers = HeaderMap::new();
        headers.insert(REQUEST_ID_HEADER, http::HeaderValue::from_static("upstream-id"));
        let wire = inline_headers(&headers, "req-1");
        assert_eq!(wire[REQUEST_ID_HEADER], HeaderField::One("upstream-id".to_string()));
        assert_eq!(wire[WS_RESPONSE_HEADER], HeaderField::One("true".to_string()));
    }

    #[tokio::test]
    async fn test_blocked_inline_request() {
        let d = dispatcher(vec![Rule::new("GET", "/allowed").with_origin("http://127.0.0.1:1")]);
        let (tx, mut rx) = mpsc::channel(16);
        let tunnel = TunnelSender::new(tx, Vec::new());

        let req = request("/ctx/0f8fad5b-d9cb-469f-a165-70867728950e/secret", "");
        let id = req.request_id;
        d.dispatch(req, &tunnel).await;

        let Some(Message::Response(response)) = rx.recv().await else {
            panic!("expected response");
        };
        assert_eq!(response.request_id, id);
        assert_eq!(response.status, 401);
        let body: Value = serde_json::from_slice(&response.body).unwrap();
        assert_eq!(body["message"], "blocked");
        assert_eq!(body["reason"], BLOCKED_TUNNEL_REASON);
        assert_eq!(body["url"], "/secret");
    }

    #[tokio::test]
    async fn test_blocked_streamed_request_uses_legacy_chunks() {
        let d = dispatcher(vec![Rule::new("GET", "/allowed")]);
        let (tx, mut rx) = mpsc::channel(16);
        // No receive-post-streams: legacy chunks carry the answer
        let tunnel = TunnelSender::new(tx, Vec::new());

        d.dispatch(request("/secret", "stream-9"), &tunnel).await;

        let Some(Message::Chunk(head)) = rx.recv().await else {
            panic!("expected head chunk");
        };
        assert_eq!(head.streaming_id, "stream-9");
        assert_eq!(head.meta.map(|m| m.status), Some(401));

        let Some(Message::Chunk(tail)) = rx.recv().await else {
            panic!("expected final chunk");
        };
        assert!(tail.finished);
        let body: Value = serde_json::from_slice(&tail.data).unwrap();
        assert_eq!(body["message"], "blocked");
    }

    #[tokio::test]
    async fn test_unreachable_downstream_is_500() {
        let d = dispatcher(vec![Rule::new("GET", "/down").with_origin("http://127.0.0.1:1")]);
        let (tx, mut rx) = mpsc::channel(16);
        let tunnel = TunnelSender::new(tx, Vec::new());

        d.dispatch(request("/down", ""), &tunnel).await;

        let Some(Message::Response(response)) = rx.recv().await else {
            panic!("expected response");
        };
        assert_eq!(response.status, 500);
        let body: Value = serde_json::from_slice(&response.body).unwrap();
        assert!(body["error"].is_string());
    }
}
