//! Shared server state

use std::sync::Arc;

use zbroker_relay::Forwarder;
use zbroker_tunnel::{ConnectionRegistry, StreamingTable};

/// State shared by every HTTP handler
#[derive(Clone)]
pub struct BrokerState {
    /// Live tunnel connections
    pub registry: Arc<ConnectionRegistry>,
    /// Streamed responses awaiting their upload
    pub streams: Arc<StreamingTable>,
    /// Public request relay
    pub forwarder: Arc<Forwarder>,
}

impl BrokerState {
    /// Create the state from its parts
    #[must_use]
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        streams: Arc<StreamingTable>,
        forwarder: Arc<Forwarder>,
    ) -> Self {
        Self {
            registry,
            streams,
            forwarder,
        }
    }
}
