//! Response-data stream framing
//!
//! A streamed response travels as one continuous HTTP POST body:
//!
//! ```text
//! [u32 little-endian N][N bytes of JSON {status, headers}][raw body until EOF]
//! ```
//!
//! There is no delimiter other than the length prefix. [`encode_header`]
//! writes the prefix and metadata; [`FrameDecoder`] reads them back from
//! arbitrarily split chunks and passes the body through untouched.

use bytes::{BufMut, Bytes, BytesMut};
use zbroker_tunnel::ResponseMeta;

use crate::{RelayError, Result};

/// Content type of a response-data upload
pub const BROKER_STREAM_CONTENT_TYPE: &str = "application/vnd.broker.stream+octet-stream";

/// Largest metadata block the decoder accepts
pub const MAX_HEADER_LEN: usize = 1024 * 1024;

const PREFIX_LEN: usize = 4;

/// Encode the length prefix and metadata block that open a stream
///
/// # Errors
///
/// Returns an error if the metadata cannot be serialized or exceeds
/// [`MAX_HEADER_LEN`].
pub fn encode_header(meta: &ResponseMeta) -> Result<Bytes> {
    let json = serde_json::to_vec(meta)?;
    if json.len() > MAX_HEADER_LEN {
        return Err(RelayError::framing(format!(
            "metadata block of {} bytes exceeds {MAX_HEADER_LEN}",
            json.len()
        )));
    }
    let len = u32::try_from(json.len())
        .map_err(|_| RelayError::framing("metadata block length overflows u32"))?;

    let mut buf = BytesMut::with_capacity(PREFIX_LEN + json.len());
    buf.put_u32_le(len);
    buf.extend_from_slice(&json);
    Ok(buf.freeze())
}

/// A decoded piece of a response-data stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Status and headers, emitted once
    Head(ResponseMeta),
    /// Raw body bytes
    Body(Bytes),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DecodeState {
    Length,
    Header(usize),
    Body,
}

/// Incremental reader for response-data streams
///
/// Feed chunks as they arrive; the prefix and metadata may be split across
/// any number of them.
#[derive(Debug)]
pub struct FrameDecoder {
    state: DecodeState,
    buf: BytesMut,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameDecoder {
    /// Create a decoder expecting a length prefix
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: DecodeState::Length,
            buf: BytesMut::with_capacity(PREFIX_LEN),
        }
    }

    /// Whether the metadata block has been decoded
    #[must_use]
    pub fn head_received(&self) -> bool {
        self.state == DecodeState::Body
    }

    /// Decode one incoming chunk
    ///
    /// # Errors
    ///
    /// Returns an error if the declared metadata length is zero or too large,
    /// or if the metadata is not valid JSON.
    pub fn decode(&mut self, mut chunk: Bytes) -> Result<Vec<Frame>> {
        let mut frames = Vec::new();

        loop {
            match self.state {
                DecodeState::Length => {
                    self.fill(&mut chunk, PREFIX_LEN);
                    if self.buf.len() < PREFIX_LEN {
                        return Ok(frames);
                    }
                    let prefix = [self.buf[0], self.buf[1], self.buf[2], self.buf[3]];
                    self.buf.clear();

                    let len = u32::from_le_bytes(prefix) as usize;
                    if len == 0 || len > MAX_HEADER_LEN {
                        return Err(RelayError::framing(format!(
                            "invalid metadata length {len}"
                        )));
                    }
                    tracing::trace!(metadata_len = len, "read stream length prefix");
                    self.buf.reserve(len);
                    self.state = DecodeState::Header(len);
                }

                DecodeState::Header(len) => {
                    self.fill(&mut chunk, len);
                    if self.buf.len() < len {
                        return Ok(frames);
                    }
                    let meta: ResponseMeta = serde_json::from_slice(&self.buf)
                        .map_err(|e| RelayError::framing(format!("invalid metadata: {e}")))?;
                    self.buf.clear();
                    frames.push(Frame::Head(meta));
                    self.state = DecodeState::Body;
                }

                DecodeState::Body => {
                    if !chunk.is_empty() {
                        frames.push(Frame::Body(chunk));
                    }
                    return Ok(frames);
                }
            }
        }
    }

    /// Check the stream ended in a consistent state
    ///
    /// # Errors
    ///
    /// Returns an error if the stream ended before the metadata block was
    /// complete.
    pub fn finish(&self) -> Result<()> {
        match self.state {
            DecodeState::Body => Ok(()),
            DecodeState::Length => Err(RelayError::framing("stream ended inside length prefix")),
            DecodeState::Header(len) => Err(RelayError::framing(format!(
                "stream ended after {} of {len} metadata bytes",
                self.buf.len()
            ))),
        }
    }

    fn fill(&mut self, chunk: &mut Bytes, target: usize) {
        let take = (target - self.buf.len()).min(chunk.len());
        self.buf.extend_from_slice(&chunk.split_to(take));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use zbroker_tunnel::{HeaderField, WireHeaders};

    fn meta() -> ResponseMeta {
        let mut headers = WireHeaders::new();
        headers.insert("x".to_string(), HeaderField::One("y".to_string()));
        ResponseMeta {
            status: 200,
            headers,
        }
    }

    fn framed(body: &[u8]) -> Vec<u8> {
        let mut bytes = encode_header(&meta()).unwrap().to_vec();
        bytes.extend_from_slice(body);
        bytes
    }

    fn collect(frames: Vec<Frame>, head: &mut Option<ResponseMeta>, body: &mut Vec<u8>) {
        for frame in frames {
            match frame {
                Frame::Head(m) => {
                    assert!(head.is_none(), "head emitted twice");
                    *head = Some(m);
                }
                Frame::Body(b) => body.extend_from_slice(&b),
            }
        }
    }

    #[test]
    fn test_header_layout() {
        let header = encode_header(&meta()).unwrap();
        let json = br#"{"status":200,"headers":{"x":"y"}}"#;
        assert_eq!(&header[..4], &u32::try_from(json.len()).unwrap().to_le_bytes());
        assert_eq!(&header[4..], json);
    }

    #[test]
    fn test_decode_single_chunk() {
        let mut decoder = FrameDecoder::new();
        let frames = decoder.decode(Bytes::from(framed(b"hello"))).unwrap();
        assert_eq!(
            frames,
            vec![Frame::Head(meta()), Frame::Body(Bytes::from_static(b"hello"))]
        );
        assert!(decoder.finish().is_ok());
    }

    #[test]
    fn test_decode_split_length_prefix() {
        let bytes = framed(b"hello");
        let mut decoder = FrameDecoder::new();
        let (mut head, mut body) = (None, Vec::new());

        collect(decoder.decode(Bytes::copy_from_slice(&bytes[..2])).unwrap(), &mut head, &mut body);
        assert!(head.is_none());
        assert!(!decoder.head_received());
        collect(decoder.decode(Bytes::copy_from_slice(&bytes[2..])).unwrap(), &mut head, &mut body);

        assert_eq!(head, Some(meta()));
        assert_eq!(body, b"hello");
    }

    #[test]
    fn test_decode_byte_at_a_time() {
        let bytes = framed(b"hello world");
        let mut decoder = FrameDecoder::new();
        let (mut head, mut body) = (None, Vec::new());

        for byte in bytes {
            collect(decoder.decode(Bytes::from(vec![byte])).unwrap(), &mut head, &mut body);
        }

        assert_eq!(head, Some(meta()));
        assert_eq!(body, b"hello world");
        assert!(decoder.finish().is_ok());
    }

    #[test]
    fn test_body_bytes_are_not_reparsed() {
        // A body that itself looks like a length prefix passes through unchanged
        let inner = encode_header(&meta()).unwrap();
        let mut decoder = FrameDecoder::new();
        let frames = decoder.decode(Bytes::from(framed(&inner))).unwrap();
        assert_eq!(frames[1], Frame::Body(inner));
    }

    #[test]
    fn test_truncated_stream_fails_finish() {
        let bytes = framed(b"");
        let mut decoder = FrameDecoder::new();
        decoder.decode(Bytes::copy_from_slice(&bytes[..3])).unwrap();
        assert!(decoder.finish().is_err());

        let mut decoder = FrameDecoder::new();
        decoder.decode(Bytes::copy_from_slice(&bytes[..10])).unwrap();
        let err = decoder.finish().unwrap_err();
        assert!(err.to_string().contains("metadata bytes"));
    }

    #[test]
    fn test_invalid_metadata() {
        let mut decoder = FrameDecoder::new();
        let mut bytes = 3u32.to_le_bytes().to_vec();
        bytes.extend_from_slice(b"{x}");
        assert!(matches!(
            decoder.decode(Bytes::from(bytes)),
            Err(RelayError::Framing { .. })
        ));

        let mut decoder = FrameDecoder::new();
        assert!(decoder.decode(Bytes::from(vec![0, 0, 0, 0])).is_err());

        let mut decoder = FrameDecoder::new();
        assert!(decoder.decode(Bytes::from(u32::MAX.to_le_bytes().to_vec())).is_err());
    }
}
