//! Public relay endpoint
//!
//! Anything under `/broker/{token}` is filtered and sent down the tunnel
//! registered for that token.

use std::collections::HashMap;

use axum::{
    body::{Body, Bytes},
    extract::{OriginalUri, Path, State},
    http::{HeaderMap, Method},
    response::Response,
};
use zbroker_relay::{InboundRequest, RelayBody, RelayResponse};

use crate::state::BrokerState;

/// Relay a public request through the tunnel
pub async fn forward(
    State(state): State<BrokerState>,
    Path(params): Path<HashMap<String, String>>,
    OriginalUri(uri): OriginalUri,
    method: Method,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let token = params.get("token").cloned().unwrap_or_default();
    let uri = uri
        .path_and_query()
        .map_or_else(|| uri.path().to_string(), ToString::to_string);

    let request = InboundRequest {
        method,
        uri,
        headers,
        body,
    };
    into_response(state.forwarder.forward(&token, request).await)
}

/// Turn a relay response into an HTTP response, streaming when needed
#[must_use]
pub fn into_response(relay: RelayResponse) -> Response {
    let body = match relay.body {
        RelayBody::Full(bytes) => Body::from(bytes),
        RelayBody::Stream(body) => Body::from_stream(body.into_stream()),
    };

    let mut response = Response::new(body);
    *response.status_mut() = relay.status;
    *response.headers_mut() = relay.headers;
    response
}
