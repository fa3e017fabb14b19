//! `ZBroker` Relay - moving requests and responses across the tunnel
//!
//! - **Forwarder** (server leg): public request to tunnel request, inline or
//!   streamed response back ([`Forwarder`])
//! - **Dispatcher** (client leg): tunnel request to a private HTTP call,
//!   answered inline, by framed upload or by legacy chunks ([`Dispatcher`])
//! - **Framing**: the length-prefixed response-data stream
//!   ([`encode_header`], [`FrameDecoder`])
//! - **Preparation**: auth precedence, header hygiene and variable
//!   substitution ([`RequestPreparer`])
//!
//! # Example
//!
//! ```rust
//! use bytes::Bytes;
//! use zbroker_relay::{encode_header, Frame, FrameDecoder};
//! use zbroker_tunnel::{ResponseMeta, WireHeaders};
//!
//! let meta = ResponseMeta { status: 200, headers: WireHeaders::new() };
//! let mut upload = encode_header(&meta).unwrap().to_vec();
//! upload.extend_from_slice(b"hello");
//!
//! let mut decoder = FrameDecoder::new();
//! let frames = decoder.decode(Bytes::from(upload)).unwrap();
//! assert_eq!(frames[0], Frame::Head(meta));
//! assert_eq!(frames[1], Frame::Body(Bytes::from_static(b"hello")));
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod context;
pub mod dispatcher;
pub mod downstream;
pub mod error;
pub mod forwarder;
pub mod framing;
pub mod legacy;
pub mod plugin;
pub mod post_stream;
pub mod prepare;
pub mod varsub;

pub use config::RelayConfig;
pub use context::{CorrelationContext, REQUEST_ID_HEADER};
pub use dispatcher::{oversized_response, Dispatcher, BODY_TOO_LARGE};
pub use downstream::{BodyCollector, BufferedResponse, Downstream};
pub use error::{RelayError, Result};
pub use forwarder::{
    strip_broker_prefix, Forwarder, InboundRequest, RelayBody, RelayResponse, FAILURE_HEADER,
    WS_RESPONSE_HEADER,
};
pub use framing::{encode_header, Frame, FrameDecoder, BROKER_STREAM_CONTENT_TYPE, MAX_HEADER_LEN};
pub use legacy::LegacyStreamWriter;
pub use plugin::{disable_key, BrokerPlugin, PluginRegistry};
pub use post_stream::{json_response_parts, response_data_url, PostStreamWriter};
pub use prepare::{strip_context_prefix, PreparedRequest, RequestPreparer, DEFAULT_USER_AGENT};
pub use varsub::{substitute_body, substitute_headers};
