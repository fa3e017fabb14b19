//! Outbound HTTP client used by the dispatcher

use std::time::Duration;

use bytes::{Bytes, BytesMut};
use futures_util::StreamExt;
use http::HeaderMap;

use crate::prepare::PreparedRequest;
use crate::{RelayConfig, RelayError, Result};

/// A fully buffered downstream response
#[derive(Debug, Clone)]
pub struct BufferedResponse {
    /// HTTP status
    pub status: u16,
    /// Response headers
    pub headers: HeaderMap,
    /// Response body
    pub body: Bytes,
}

/// Collects a body up to a size cap, counting whatever lies beyond it
#[derive(Debug)]
pub struct BodyCollector {
    limit: u64,
    total: u64,
    buf: BytesMut,
}

impl BodyCollector {
    /// Create a collector that keeps at most `limit` bytes
    #[must_use]
    pub fn new(limit: u64) -> Self {
        Self {
            limit,
            total: 0,
            buf: BytesMut::new(),
        }
    }

    /// Add a chunk; bytes past the cap are counted but dropped
    pub fn push(&mut self, chunk: &[u8]) {
        self.total += chunk.len() as u64;
        if self.total <= self.limit {
            self.buf.extend_from_slice(chunk);
        } else if !self.buf.is_empty() {
            self.buf = BytesMut::new();
        }
    }

    /// Bytes seen so far
    #[must_use]
    pub fn total(&self) -> u64 {
        self.total
    }

    /// The collected body
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::BodyTooLarge`] if the body exceeded the cap.
    pub fn finish(self) -> Result<Bytes> {
        if self.total > self.limit {
            return Err(RelayError::BodyTooLarge {
                size: self.total,
                limit: self.limit,
            });
        }
        Ok(self.buf.freeze())
    }
}

/// HTTP client for calls into the private network and uploads to the server
#[derive(Debug, Clone)]
pub struct Downstream {
    client: reqwest::Client,
    timeout: Duration,
    stream_timeout: Duration,
}

impl Downstream {
    /// Build a client from relay configuration
    ///
    /// # Errors
    ///
    /// Returns an error if the TLS backend cannot be initialised.
    pub fn new(config: &RelayConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(config.downstream_timeout)
            .build()?;
        Ok(Self {
            client,
            timeout: config.downstream_timeout,
            stream_timeout: config.post_stream_timeout,
        })
    }

    /// Underlying client
    #[must_use]
    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }

    /// Timeout applied to streamed calls and uploads
    #[must_use]
    pub fn stream_timeout(&self) -> Duration {
        self.stream_timeout
    }

    /// Send a request whose body will be streamed by the caller
    ///
    /// # Errors
    ///
    /// Returns an error if the call fails before response headers arrive.
    pub async fn send(&self, request: &PreparedRequest) -> Result<reqwest::Response> {
        let response = self
            .builder(request)
            .timeout(self.stream_timeout)
            .send()
            .await?;
        Ok(response)
    }

    /// Send a request and buffer its body, refusing bodies above `limit`
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::BodyTooLarge`] carrying the full body size when
    /// the cap is exceeded, or an HTTP error if the call fails.
    pub async fn fetch_buffered(
        &self,
        request: &PreparedRequest,
        limit: u64,
    ) -> Result<BufferedResponse> {
        let response = self.builder(request).timeout(self.timeout).send().await?;
        let status = response.status().as_u16();
        let headers = response.headers().clone();

        let mut collector = BodyCollector::new(limit);
        let mut body = response.bytes_stream();
        while let Some(chunk) = body.next().await {
            collector.push(&chunk?);
        }

        Ok(BufferedResponse {
            status,
            headers,
            body: collector.finish()?,
        })
    }

    fn builder(&self, request: &PreparedRequest) -> reqwest::RequestBuilder {
        let builder = self
            .client
            .request(request.method.clone(), request.url.clone())
            .headers(request.headers.clone());
        if request.body.is_empty() {
            builder
        } else {
            builder.body(request.body.clone())
        }
    }
}
