//! Streamed responses over the tunnel itself, for servers without
//! `receive-post-streams`
//!
//! The sequence is a head chunk (`meta`, no data), data chunks, then a
//! `finished` chunk. Failures end the stream with a `500` head or, once the
//! head was sent, a finished chunk carrying an `error` so the server aborts
//! the response instead of completing it.

use bytes::Bytes;
use futures_util::StreamExt;
use zbroker_tunnel::{headers_to_wire, ChunkPayload, Message, ResponseMeta, TunnelSender};

use crate::Result;

/// Sends one legacy chunked response
pub struct LegacyStreamWriter {
    tunnel: TunnelSender,
    streaming_id: String,
}

impl LegacyStreamWriter {
    /// Create a writer for `streaming_id`
    #[must_use]
    pub fn new(tunnel: TunnelSender, streaming_id: impl Into<String>) -> Self {
        Self {
            tunnel,
            streaming_id: streaming_id.into(),
        }
    }

    /// Relay a downstream response, or a 500 if the call itself failed
    ///
    /// Returns the number of body bytes sent.
    ///
    /// # Errors
    ///
    /// Returns an error if the tunnel closes or the body read fails.
    pub async fn stream_response(self, response: Result<reqwest::Response>) -> Result<u64> {
        let response = match response {
            Ok(response) => response,
            Err(e) => {
                self.send(ChunkPayload {
                    data: Bytes::from(e.to_string()),
                    finished: true,
                    meta: Some(ResponseMeta {
                        status: 500,
                        headers: Default::default(),
                    }),
                    ..self.chunk()
                })
                .await?;
                return Err(e);
            }
        };

        let meta = ResponseMeta {
            status: response.status().as_u16(),
            headers: headers_to_wire(response.headers()),
        };
        self.send(ChunkPayload {
            meta: Some(meta),
            ..self.chunk()
        })
        .await?;

        let mut total = 0u64;
        let mut body = response.bytes_stream();
        while let Some(chunk) = body.next().await {
            match chunk {
                Ok(bytes) => {
                    total += bytes.len() as u64;
                    self.send(ChunkPayload {
                        data: bytes,
                        ..self.chunk()
                    })
                    .await?;
                }
                Err(e) => {
                    tracing::warn!(streaming_id = %self.streaming_id, error = %e, "downstream body failed");
                    self.send(ChunkPayload {
                        finished: true,
                        error: Some(e.to_string()),
                        ..self.chunk()
                    })
                    .await?;
                    return Err(e.into());
                }
            }
        }

        self.send(ChunkPayload {
            finished: true,
            ..self.chunk()
        })
        .await?;
        Ok(total)
    }

    /// Send a relay-generated response as a head chunk plus one final chunk
    ///
    /// # Errors
    ///
    /// Returns an error if the tunnel closes.
    pub async fn send_json(self, meta: ResponseMeta, body: Bytes) -> Result<u64> {
        let len = body.len() as u64;
        self.send(ChunkPayload {
            meta: Some(meta),
            ..self.chunk()
        })
        .await?;
        self.send(ChunkPayload {
            data: body,
            finished: true,
            ..self.chunk()
        })
        .await?;
        Ok(len)
    }

    /// An empty, unfinished chunk for this stream
    fn chunk(&self) -> ChunkPayload {
        ChunkPayload {
            streaming_id: self.streaming_id.clone(),
            data: Bytes::new(),
            finished: false,
            meta: None,
            error: None,
        }
    }

    async fn send(&self, chunk: ChunkPayload) -> Result<()> {
        self.tunnel.send(Message::Chunk(chunk)).await?;
        Ok(())
    }
}
