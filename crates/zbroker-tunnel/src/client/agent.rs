//! Tunnel client agent
//!
//! The [`TunnelAgent`] keeps one tunnel connection to the server alive:
//! - WebSocket connection and `identify`
//! - Heartbeat answers
//! - Automatic reconnection with exponential backoff
//! - Dispatch of incoming requests to a [`RequestHandler`]

use std::sync::Arc;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use parking_lot::RwLock;
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;
use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage};
use uuid::Uuid;

use crate::protocol::{ClientMetadata, Message, NotificationLevel, RequestPayload, CLIENT_VERSION};
use crate::token::mask_token;
use crate::{Result, TunnelClientConfig, TunnelError};

/// Messages queued from request handlers to the server
const OUTBOUND_QUEUE: usize = 256;

// =============================================================================
// Agent State
// =============================================================================

/// Current state of the tunnel agent
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum AgentState {
    /// Not connected to the server
    #[default]
    Disconnected,
    /// Attempting to connect
    Connecting,
    /// Identified with the server
    Connected {
        /// Server-assigned connection id
        connection_id: Uuid,
    },
    /// Waiting to reconnect after a disconnection
    Reconnecting {
        /// Current reconnection attempt number
        attempt: u32,
    },
}

// =============================================================================
// Request Handling
// =============================================================================

/// Handle used by request handlers to answer over the tunnel
#[derive(Debug, Clone)]
pub struct TunnelSender {
    tx: mpsc::Sender<Message>,
    server_capabilities: Arc<Vec<String>>,
}

impl TunnelSender {
    /// Create a sender over a message channel
    #[must_use]
    pub fn new(tx: mpsc::Sender<Message>, server_capabilities: Vec<String>) -> Self {
        Self {
            tx,
            server_capabilities: Arc::new(server_capabilities),
        }
    }

    /// Queue a message for the server
    ///
    /// # Errors
    ///
    /// Returns an error if the tunnel connection has closed.
    pub async fn send(&self, message: Message) -> Result<()> {
        self.tx
            .send(message)
            .await
            .map_err(|_| TunnelError::connection_msg("tunnel connection closed"))
    }

    /// Whether the server announced a capability in `identify_ok`
    #[must_use]
    pub fn server_has_capability(&self, capability: &str) -> bool {
        self.server_capabilities.iter().any(|c| c == capability)
    }

    /// Capabilities the server announced
    #[must_use]
    pub fn server_capabilities(&self) -> &[String] {
        &self.server_capabilities
    }
}

/// Processes requests arriving over the tunnel
///
/// Each request runs in its own task; the handler answers through the
/// [`TunnelSender`] (inline `response` or legacy `chunk` messages) or out of
/// band.
#[async_trait]
pub trait RequestHandler: Send + Sync + 'static {
    /// Handle one request descriptor
    async fn handle(&self, request: RequestPayload, tunnel: TunnelSender);
}

// =============================================================================
// Tunnel Agent
// =============================================================================

/// Tunnel client with automatic reconnection
///
/// # Example
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use async_trait::async_trait;
/// use zbroker_tunnel::{RequestHandler, RequestPayload, TunnelAgent, TunnelClientConfig, TunnelSender};
///
/// struct Discard;
///
/// #[async_trait]
/// impl RequestHandler for Discard {
///     async fn handle(&self, _request: RequestPayload, _tunnel: TunnelSender) {}
/// }
///
/// # async fn run() {
/// let config = TunnelClientConfig::new("wss://broker.example.com:8001", "my-token");
/// let agent = TunnelAgent::new(config, Arc::new(Discard));
/// if let Err(e) = agent.run().await {
///     eprintln!("Agent error: {e}");
/// }
/// # }
/// ```
pub struct TunnelAgent {
    config: TunnelClientConfig,
    handler: Arc<dyn RequestHandler>,
    filters: Option<serde_json::Value>,
    state: Arc<RwLock<AgentState>>,
    shutdown_tx: Arc<watch::Sender<bool>>,
}

impl TunnelAgent {
    /// Create a new agent
    #[must_use]
    pub fn new(config: TunnelClientConfig, handler: Arc<dyn RequestHandler>) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            config,
            handler,
            filters: None,
            state: Arc::new(RwLock::new(AgentState::Disconnected)),
            shutdown_tx: Arc::new(shutdown_tx),
        }
    }

    /// Report the client's accept rules at identify (builder pattern)
    #[must_use]
    pub fn with_filters(mut self, filters: serde_json::Value) -> Self {
        self.filters = Some(filters);
        self
    }

    /// Get the current agent state
    #[must_use]
    pub fn state(&self) -> AgentState {
        self.state.read().clone()
    }

    /// Check if the agent is connected
    #[must_use]
    pub fn is_connected(&self) -> bool {
        matches!(*self.state.read(), AgentState::Connected { .. })
    }

    /// Stop the agent; `run` returns after the current connection closes
    pub fn disconnect(&self) {
        *self.state.write() = AgentState::Disconnected;
        let _ = self.shutdown_tx.send(true);
    }

    /// Run the agent with automatic reconnection
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or the server rejects
    /// `identify`; connection failures are retried.
    pub async fn run(&self) -> Result<()> {
        self.config.validate().map_err(TunnelError::config)?;

        let mut shutdown = self.shutdown_tx.subscribe();
        let mut current_interval = self.config.reconnect_interval;
        let mut attempt = 0u32;

        loop {
            if *shutdown.borrow() {
                return Ok(());
            }

            attempt += 1;
            tracing::info!(
                attempt,
                token = %mask_token(&self.config.token),
                "connecting to broker server"
            );

            match self.run_once().await {
                Ok(()) | Err(TunnelError::Shutdown) => {
                    tracing::info!("agent shutting down");
                    *self.state.write() = AgentState::Disconnected;
                    return Ok(());
                }
                Err(e @ TunnelError::Identify { .. }) => {
                    tracing::error!(error = %e, "server rejected identify");
                    *self.state.write() = AgentState::Disconnected;
                    return Err(e);
                }
                Err(e) => {
                    tracing::warn!(
                        error = %e,
                        retry_in_ms = current_interval.as_millis(),
                        "tunnel connection lost, will retry"
                    );
                }
            }

            if matches!(*self.state.read(), AgentState::Connected { .. }) {
                current_interval = self.config.reconnect_interval;
            }
            *self.state.write() = AgentState::Reconnecting { attempt };

            tokio::select! {
                () = tokio::time::sleep(current_interval) => {}
                _ = shutdown.changed() => {}
            }

            current_interval = std::cmp::min(
                current_interval.saturating_mul(2),
                self.config.max_reconnect_interval,
            );
        }
    }

    /// Run a single connection until it closes
    ///
    /// # Errors
    ///
    /// Returns an error if the connection fails, `identify` is rejected or the
    /// server disconnects us.
    pub async fn run_once(&self) -> Result<()> {
        *self.state.write() = AgentState::Connecting;
        let mut shutdown = self.shutdown_tx.subscribe();

        let (ws_stream, _response) = connect_async(self.config.server_url.as_str())
            .await
            .map_err(TunnelError::connection)?;
        let (mut ws_sink, mut ws_stream) = ws_stream.split();

        let identify = Message::Identify {
            token: self.config.token.clone(),
            metadata: ClientMetadata {
                version: CLIENT_VERSION.to_string(),
                capabilities: self.config.capabilities.clone(),
                client_id: self.config.client_id.clone(),
                role: self.config.role,
                connection_type: self.config.connection_type.clone(),
                filters: self.filters.clone(),
            },
        };
        ws_sink
            .send(WsMessage::Text(identify.to_text()?.into()))
            .await
            .map_err(TunnelError::connection)?;

        let identify_timeout = std::time::Duration::from_secs(10);
        let (connection_id, capabilities) = timeout(identify_timeout, async {
            while let Some(frame) = ws_stream.next().await {
                match frame {
                    Ok(WsMessage::Text(text)) => match Message::from_text(text.as_str())? {
                        Message::IdentifyOk {
                            connection_id,
                            capabilities,
                        } => return Ok((connection_id, capabilities)),
                        Message::IdentifyFail { reason } => {
                            return Err(TunnelError::identify(reason));
                        }
                        Message::Notification { level, message } => {
                            log_notification(level, &message);
                        }
                        other => {
                            return Err(TunnelError::protocol(format!(
                                "expected identify_ok, got {}",
                                other.message_type()
                            )));
                        }
                    },
                    Ok(WsMessage::Close(frame)) => {
                        let reason = frame.map_or_else(
                            || "connection closed".to_string(),
                            |f| f.reason.to_string(),
                        );
                        return Err(TunnelError::connection_msg(reason));
                    }
                    Ok(_) => {}
                    Err(e) => return Err(TunnelError::connection(e)),
                }
            }
            Err(TunnelError::connection_msg("connection closed before identify_ok"))
        })
        .await
        .map_err(|_| TunnelError::timeout())??;

        *self.state.write() = AgentState::Connected { connection_id };
        tracing::info!(
            connection_id = %connection_id,
            server_capabilities = ?capabilities,
            "identified with broker server"
        );

        let (tx, mut outbound) = mpsc::channel::<Message>(OUTBOUND_QUEUE);
        let sender = TunnelSender::new(tx, capabilities);

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        let bye = Message::Disconnect { reason: "client shutting down".to_string() };
                        if let Ok(text) = bye.to_text() {
                            let _ = ws_sink.send(WsMessage::Text(text.into())).await;
                        }
                        let _ = ws_sink.close().await;
                        return Err(TunnelError::Shutdown);
                    }
                }

                Some(msg) = outbound.recv() => {
                    ws_sink
                        .send(WsMessage::Text(msg.to_text()?.into()))
                        .await
                        .map_err(TunnelError::connection)?;
                }

                frame = ws_stream.next() => {
                    match frame {
                        Some(Ok(WsMessage::Text(text))) => {
                            let msg = match Message::from_text(text.as_str()) {
                                Ok(msg) => msg,
                                Err(e) => {
                                    tracing::warn!(error = %e, "dropping malformed message");
                                    continue;
                                }
                            };
                            match msg {
                                Message::Request(request) => {
                                    let handler = Arc::clone(&self.handler);
                                    let tunnel = sender.clone();
                                    tokio::spawn(async move { handler.handle(request, tunnel).await });
                                }
                                Message::Heartbeat { timestamp } => {
                                    tracing::trace!(timestamp, "heartbeat received");
                                    let ack = Message::HeartbeatAck { timestamp };
                                    ws_sink
                                        .send(WsMessage::Text(ack.to_text()?.into()))
                                        .await
                                        .map_err(TunnelError::connection)?;
                                }
                                Message::Notification { level, message } => {
                                    log_notification(level, &message);
                                }
                                Message::Disconnect { reason } => {
                                    tracing::info!(reason = %reason, "server requested disconnect");
                                    return Err(TunnelError::connection_msg(reason));
                                }
                                other => {
                                    tracing::warn!(
                                        msg_type = other.message_type(),
                                        "unexpected message from server"
                                    );
                                }
                            }
                        }
                        Some(Ok(WsMessage::Ping(data))) => {
                            ws_sink
                                .send(WsMessage::Pong(data))
                                .await
                                .map_err(TunnelError::connection)?;
                        }
                        Some(Ok(WsMessage::Close(frame))) => {
                            let reason = frame.map_or_else(
                                || "server closed connection".to_string(),
                                |f| f.reason.to_string(),
                            );
                            return Err(TunnelError::connection_msg(reason));
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => return Err(TunnelError::connection(e)),
                        None => return Err(TunnelError::connection_msg("server closed connection")),
                    }
                }
            }
        }
    }
}

impl Clone for TunnelAgent {
    fn clone(&self) -> Self {
        Self {
            config: self.config.clone(),
            handler: Arc::clone(&self.handler),
            filters: self.filters.clone(),
            state: Arc::clone(&self.state),
            shutdown_tx: Arc::clone(&self.shutdown_tx),
        }
    }
}

fn log_notification(level: NotificationLevel, message: &str) {
    match level {
        NotificationLevel::Info => tracing::info!(message = %message, "server notification"),
        NotificationLevel::Warning => tracing::warn!(message = %message, "server notification"),
        NotificationLevel::Error => tracing::error!(message = %message, "server notification"),
    }
}
