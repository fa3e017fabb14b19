//! Out-of-band upload of streamed responses
//!
//! The client answers a streamed request by POSTing a framed body to
//! `{broker_server_url}/response-data/{token}/{streaming_id}`. Body chunks
//! flow through a bounded channel, so a slow server pauses the read from the
//! downstream response until the upload drains.

use std::io;

use bytes::Bytes;
use futures_util::StreamExt;
use http::header::{CONNECTION, CONTENT_LENGTH, CONTENT_TYPE, USER_AGENT};
use http::HeaderValue;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use url::Url;
use zbroker_tunnel::{
    headers_to_wire, BodyChunk, HeaderField, ResponseMeta, WireHeaders, STREAM_BUFFER_CHUNKS,
};

use crate::context::REQUEST_ID_HEADER;
use crate::downstream::Downstream;
use crate::framing::{encode_header, BROKER_STREAM_CONTENT_TYPE};
use crate::prepare::DEFAULT_USER_AGENT;
use crate::{RelayError, Result};

/// Build the response-data URL for a stream
///
/// # Errors
///
/// Returns a configuration error if `server_url` is not a valid base URL.
pub fn response_data_url(
    server_url: &str,
    token: &str,
    streaming_id: &str,
    server_id: Option<&str>,
) -> Result<Url> {
    let mut url = Url::parse(server_url)
        .map_err(|e| RelayError::config(format!("invalid broker_server_url: {e}")))?;
    url.path_segments_mut()
        .map_err(|()| RelayError::config("broker_server_url cannot be a base"))?
        .pop_if_empty()
        .extend(["response-data", token, streaming_id]);
    url.query_pairs_mut()
        .append_pair("server_id", server_id.unwrap_or_default());
    Ok(url)
}

/// Metadata and body describing a relay-generated JSON response
#[must_use]
pub fn json_response_parts(status: u16, body: &Value) -> (ResponseMeta, Bytes) {
    let body = Bytes::from(body.to_string());
    let mut headers = WireHeaders::new();
    headers.insert(
        CONTENT_TYPE.as_str().to_string(),
        HeaderField::One("application/json".to_string()),
    );
    headers.insert(
        CONTENT_LENGTH.as_str().to_string(),
        HeaderField::One(body.len().to_string()),
    );
    (ResponseMeta { status, headers }, body)
}

/// Writes one framed response-data upload
pub struct PostStreamWriter<'a> {
    downstream: &'a Downstream,
    target: Url,
    request_id: String,
}

impl<'a> PostStreamWriter<'a> {
    /// Create a writer uploading to `target`
    #[must_use]
    pub fn new(downstream: &'a Downstream, target: Url, request_id: impl Into<String>) -> Self {
        Self {
            downstream,
            target,
            request_id: request_id.into(),
        }
    }

    /// Relay a downstream response, or a 500 if the call itself failed
    ///
    /// Returns the number of body bytes uploaded.
    ///
    /// # Errors
    ///
    /// Returns an error if the upload fails or the server rejects it.
    pub async fn stream_response(self, response: Result<reqwest::Response>) -> Result<u64> {
        match response {
            Ok(response) => {
                let meta = ResponseMeta {
                    status: response.status().as_u16(),
                    headers: headers_to_wire(response.headers()),
                };
                self.upload(meta, response.bytes_stream()).await
            }
            Err(e) => {
                tracing::warn!(error = %e, "downstream call failed before headers; uploading error");
                let (meta, body) =
                    json_response_parts(500, &serde_json::json!({ "error": e.to_string() }));
                self.send_json(meta, body).await
            }
        }
    }

    /// Upload a relay-generated response
    ///
    /// # Errors
    ///
    /// Returns an error if the upload fails or the server rejects it.
    pub async fn send_json(self, meta: ResponseMeta, body: Bytes) -> Result<u64> {
        let single = futures_util::stream::once(async move { Ok::<_, reqwest::Error>(body) });
        self.upload(meta, single).await
    }

    async fn upload<S>(self, meta: ResponseMeta, body: S) -> Result<u64>
    where
        S: futures_util::Stream<Item = std::result::Result<Bytes, reqwest::Error>>,
    {
        let mut body = std::pin::pin!(body);
        let header = encode_header(&meta)?;
        let (tx, rx) = mpsc::channel::<BodyChunk>(STREAM_BUFFER_CHUNKS);

        let mut request = self
            .downstream
            .client()
            .post(self.target.clone())
            .timeout(self.downstream.stream_timeout())
            .header(CONTENT_TYPE, BROKER_STREAM_CONTENT_TYPE)
            .header(CONNECTION, "Keep-Alive")
            .header("keep-alive", "timeout=60, max=1000")
            .header(USER_AGENT, DEFAULT_USER_AGENT)
            .body(reqwest::Body::wrap_stream(ReceiverStream::new(rx)));
        if let Ok(value) = HeaderValue::from_str(&self.request_id) {
            request = request.header(REQUEST_ID_HEADER, value);
        }
        let upload = tokio::spawn(request.send());

        let pumped = async {
            tx.send(Ok(header))
                .await
                .map_err(|_| RelayError::framing("upload closed before metadata"))?;

            let mut total = 0u64;
            while let Some(chunk) = body.next().await {
                match chunk {
                    Ok(bytes) => {
                        total += bytes.len() as u64;
                        if tx.capacity() == 0 {
                            tracing::trace!(request_id = %self.request_id, "upload buffer full; pausing");
                        }
                        tx.send(Ok(bytes))
                            .await
                            .map_err(|_| RelayError::framing("upload closed mid-stream"))?;
                    }
                    Err(e) => {
                        // Aborts the upload so the server destroys the stream
                        let _ = tx.send(Err(io::Error::other(e.to_string()))).await;
                        return Err(RelayError::from(e));
                    }
                }
            }
            Ok::<u64, RelayError>(total)
        }
        .await;
        drop(tx);

        let response = upload
            .await
            .map_err(|e| RelayError::framing(format!("upload task failed: {e}")))??;

        if !response.status().is_success() {
            return Err(RelayError::UploadRejected {
                status: response.status().as_u16(),
            });
        }
        let total = pumped?;

        tracing::debug!(request_id = %self.request_id, bytes = total, "stream upload complete");
        Ok(total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_response_data_url() {
        let url = response_data_url("https://broker.example.com", "tok", "sid", None).unwrap();
        assert_eq!(
            url.as_str(),
            "https://broker.example.com/response-data/tok/sid?server_id="
        );

        let url = response_data_url("http://broker:8000/base/", "tok", "sid", Some("s1")).unwrap();
        assert_eq!(url.as_str(), "http://broker:8000/base/response-data/tok/sid?server_id=s1");
    }

    #[test]
    fn test_json_response_parts() {
        let (meta, body) = json_response_parts(500, &serde_json::json!({"error": "boom"}));
        assert_eq!(meta.status, 500);
        assert_eq!(body, Bytes::from_static(br#"{"error":"boom"}"#));
        assert_eq!(
            meta.headers.get("content-length"),
            Some(&HeaderField::One("16".to_string()))
        );
        assert_eq!(
            meta.headers.get("content-type").and_then(HeaderField::first),
            Some("application/json")
        );
    }
}
