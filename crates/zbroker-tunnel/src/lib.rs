//! `ZBroker` Tunnel - the persistent link between broker client and server
//!
//! A broker client inside a private network dials out to the broker server
//! and keeps one WebSocket open. Public requests travel down the tunnel as
//! request descriptors; responses come back inline or as streams.
//!
//! - **Protocol**: JSON text frames tagged by `type` ([`Message`])
//! - **Registry**: live connections per broker token ([`ConnectionRegistry`])
//! - **Streaming table**: in-flight streamed responses with TTL eviction
//!   ([`StreamingTable`])
//! - **Server**: identify, version gating and heartbeats ([`ControlHandler`])
//! - **Client**: reconnecting agent dispatching requests ([`TunnelAgent`])
//!
//! # Example
//!
//! ```rust
//! use zbroker_tunnel::{ConnectionRole, TunnelClientConfig};
//!
//! let config = TunnelClientConfig::new("wss://broker.example.com:8001", "my-token")
//!     .with_role(ConnectionRole::Secondary)
//!     .with_connection_type("github");
//!
//! config.validate().expect("invalid config");
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod client;
pub mod config;
pub mod error;
pub mod protocol;
pub mod server;
pub mod streaming;
pub mod token;
pub mod version;

pub use client::{AgentState, RequestHandler, TunnelAgent, TunnelSender};
pub use config::{TunnelClientConfig, TunnelServerConfig};
pub use error::{Result, TunnelError};
pub use protocol::{
    current_timestamp_ms, headers_from_wire, headers_to_wire, ChunkPayload, ClientMetadata,
    ConnectionRole, HeaderField, Message, NotificationLevel, RequestPayload, ResponseMeta,
    ResponsePayload, WireHeaders, CAPABILITY_POST_STREAMS, CAPABILITY_RECEIVE_POST_STREAMS,
    CLIENT_VERSION,
};
pub use server::{
    ConnectionEntry, ConnectionRegistry, ConnectionSummary, ControlHandler, SelectionPolicy,
};
pub use streaming::{
    BodyChunk, StreamBody, StreamReceiver, StreamingTable, STREAM_BUFFER_CHUNKS,
};
pub use token::{hash_token, mask_token, normalize_token};
pub use version::{check_client_version, VersionCheck, LOCAL_VERSION};
