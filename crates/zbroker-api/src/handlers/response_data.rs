//! Streamed response uploads from broker clients
//!
//! The client POSTs a length-prefixed metadata block followed by the raw
//! response body. Frames are decoded incrementally and fed into the
//! streaming table, where the waiting public request picks them up.

use axum::{
    body::Body,
    extract::{Path, Query, State},
    http::HeaderMap,
    Json,
};
use futures_util::StreamExt;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::Instrument;
use zbroker_observability::{metrics, Direction};
use zbroker_relay::{CorrelationContext, Frame, FrameDecoder};
use zbroker_tunnel::{hash_token, mask_token, StreamingTable};

use crate::error::{ApiError, Result};
use crate::state::BrokerState;

/// Query string of a response-data upload
#[derive(Debug, Default, Deserialize)]
pub struct ResponseDataQuery {
    /// Server instance the client believes it is talking to
    pub server_id: Option<String>,
}

/// Receive a framed response body for `streaming_id`
pub async fn response_data(
    State(state): State<BrokerState>,
    Path((token, streaming_id)): Path<(String, String)>,
    Query(query): Query<ResponseDataQuery>,
    headers: HeaderMap,
    body: Body,
) -> Result<Json<Value>> {
    if let Some(m) = metrics() {
        m.record_http_request(false, Direction::Inbound);
    }
    let ctx = CorrelationContext::from_headers(&headers);
    tracing::info!(
        token = %mask_token(&token),
        hashed_token = %hash_token(&token),
        streaming_id = %streaming_id,
        request_id = %ctx.request_id,
        acting_org_id = ?ctx.acting_org_id,
        server_id = ?query.server_id,
        "Handling response-data request"
    );

    if !state.streams.contains(&streaming_id) {
        tracing::error!(streaming_id = %streaming_id, "unable to find request matching streaming id");
        return Err(ApiError::UnknownStream(streaming_id));
    }

    let span = tracing::info_span!("response_data", streaming_id = %streaming_id);
    match pump(&state.streams, &streaming_id, body).instrument(span).await {
        Ok(bytes) => {
            tracing::debug!(streaming_id = %streaming_id, bytes, "Response stream complete");
            Ok(Json(json!({})))
        }
        Err(e) => {
            tracing::error!(
                streaming_id = %streaming_id,
                error = %e,
                "failed handling streamed response upload"
            );
            state.streams.destroy(&streaming_id, &e.to_string());
            Err(e)
        }
    }
}

async fn pump(streams: &StreamingTable, streaming_id: &str, body: Body) -> Result<u64> {
    let mut decoder = FrameDecoder::new();
    let mut data = body.into_data_stream();

    while let Some(chunk) = data.next().await {
        let chunk = chunk.map_err(|e| ApiError::Upload(e.to_string()))?;
        for frame in decoder.decode(chunk)? {
            match frame {
                Frame::Head(meta) => {
                    if meta.status > 299 && meta.status != 404 {
                        tracing::info!(status = meta.status, "Response head received");
                    } else {
                        tracing::debug!(status = meta.status, "Response head received");
                    }
                    streams.set_head(streaming_id, meta)?;
                }
                Frame::Body(bytes) => {
                    if !streams.write(streaming_id, bytes).await? {
                        tracing::trace!("Consumer applied back-pressure");
                    }
                }
            }
        }
    }

    decoder.finish()?;
    Ok(streams.finish(streaming_id)?)
}
