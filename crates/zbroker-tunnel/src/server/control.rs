//! WebSocket control channel handler for the tunnel server
//!
//! Each client connection is upgraded to a WebSocket, must `identify` within
//! the configured timeout, and is then registered in the
//! [`ConnectionRegistry`] until it disconnects or misses heartbeats.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::time::{interval, timeout, Instant};
use tokio_tungstenite::{accept_async, tungstenite::Message as WsMessage, WebSocketStream};

use crate::protocol::{
    current_timestamp_ms, ChunkPayload, Message, NotificationLevel, CAPABILITY_RECEIVE_POST_STREAMS,
};
use crate::server::registry::{ConnectionEntry, ConnectionRegistry};
use crate::streaming::StreamingTable;
use crate::token::mask_token;
use crate::version::{check_client_version, VersionCheck};
use crate::{Result, TunnelError, TunnelServerConfig};

type WsSink = SplitSink<WebSocketStream<TcpStream>, WsMessage>;
type WsStream = SplitStream<WebSocketStream<TcpStream>>;

/// Outbound messages queued per connection
const OUTBOUND_QUEUE: usize = 256;

/// Control channel handler shared by all tunnel connections
pub struct ControlHandler {
    registry: Arc<ConnectionRegistry>,
    streams: Arc<StreamingTable>,
    config: TunnelServerConfig,
}

impl ControlHandler {
    /// Create a new control handler
    #[must_use]
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        streams: Arc<StreamingTable>,
        config: TunnelServerConfig,
    ) -> Self {
        Self {
            registry,
            streams,
            config,
        }
    }

    /// Accept tunnel connections until `shutdown` flips to `true`
    ///
    /// # Errors
    ///
    /// Currently infallible once the listener is bound; accept errors are logged.
    pub async fn serve(
        self: Arc<Self>,
        listener: TcpListener,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        tracing::info!("Shutting down tunnel listener");
                        break;
                    }
                }

                result = listener.accept() => {
                    match result {
                        Ok((stream, client_addr)) => {
                            let handler = Arc::clone(&self);
                            tokio::spawn(async move {
                                if let Err(e) = handler.handle_connection(stream, client_addr).await {
                                    tracing::debug!(
                                        error = %e,
                                        client_addr = %client_addr,
                                        "Tunnel connection ended with error"
                                    );
                                }
                            });
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "Failed to accept tunnel connection");
                        }
                    }
                }
            }
        }

        Ok(())
    }

    /// Handle a single tunnel connection from upgrade to disconnect
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - WebSocket upgrade fails
    /// - `identify` times out, is malformed or is rejected
    /// - the connection fails or misses heartbeats
    pub async fn handle_connection(&self, stream: TcpStream, client_addr: SocketAddr) -> Result<()> {
        let ws_stream = accept_async(stream)
            .await
            .map_err(TunnelError::connection)?;
        let (mut ws_sink, mut ws_stream) = ws_stream.split();

        let first = timeout(self.config.identify_timeout, next_message(&mut ws_stream))
            .await
            .map_err(|_| TunnelError::timeout())??;

        let Message::Identify { token, metadata } = first else {
            send_fail(&mut ws_sink, "Expected identify message").await;
            return Err(TunnelError::identify("Expected identify message"));
        };

        if token.trim().is_empty() {
            send_fail(&mut ws_sink, "Missing broker token").await;
            return Err(TunnelError::identify("Missing broker token"));
        }

        let outdated = match check_client_version(
            &metadata.version,
            &self.config.min_client_version,
            &self.config.recommended_client_version,
        ) {
            VersionCheck::Accepted => None,
            VersionCheck::Outdated { message } => Some(message),
            VersionCheck::Rejected { message } => {
                tracing::warn!(
                    token = %mask_token(&token),
                    version = %metadata.version,
                    "Rejecting outdated client"
                );
                let notification = Message::Notification {
                    level: NotificationLevel::Error,
                    message: message.clone(),
                };
                let _ = send(&mut ws_sink, &notification).await;
                send_fail(&mut ws_sink, &message).await;
                return Err(TunnelError::identify(message));
            }
        };

        let (tx, mut outbound) = mpsc::channel::<Message>(OUTBOUND_QUEUE);
        let entry = self.registry.register(&token, ConnectionEntry::new(metadata, tx));

        send(
            &mut ws_sink,
            &Message::IdentifyOk {
                connection_id: entry.id,
                capabilities: vec![CAPABILITY_RECEIVE_POST_STREAMS.to_string()],
            },
        )
        .await?;

        if let Some(message) = outdated {
            send(
                &mut ws_sink,
                &Message::Notification {
                    level: NotificationLevel::Warning,
                    message,
                },
            )
            .await?;
        }

        tracing::info!(
            token = %mask_token(&token),
            connection_id = %entry.id,
            client_addr = %client_addr,
            "Tunnel identified"
        );

        let result = self
            .run_message_loop(&entry, &mut ws_sink, &mut ws_stream, &mut outbound)
            .await;

        self.registry.deregister(&token, entry.id);
        entry.fail_pending();

        tracing::info!(connection_id = %entry.id, "Tunnel disconnected");

        result
    }

    async fn run_message_loop(
        &self,
        entry: &ConnectionEntry,
        ws_sink: &mut WsSink,
        ws_stream: &mut WsStream,
        outbound: &mut mpsc::Receiver<Message>,
    ) -> Result<()> {
        let mut heartbeat_interval = interval(self.config.heartbeat_interval);
        let heartbeat_timeout = self.config.heartbeat_timeout;
        let mut last_heartbeat_ack = Instant::now();
        let mut chunks = ChunkRouter::new(Arc::clone(&self.streams));

        loop {
            tokio::select! {
                _ = heartbeat_interval.tick() => {
                    if last_heartbeat_ack.elapsed() > heartbeat_timeout {
                        tracing::warn!(connection_id = %entry.id, "Heartbeat timeout");
                        return Err(TunnelError::timeout());
                    }
                    send(ws_sink, &Message::Heartbeat { timestamp: current_timestamp_ms() }).await?;
                }

                Some(msg) = outbound.recv() => {
                    let closing = matches!(msg, Message::Disconnect { .. });
                    send(ws_sink, &msg).await?;
                    if closing {
                        let _ = ws_sink.close().await;
                        return Ok(());
                    }
                }

                frame = ws_stream.next() => {
                    match frame {
                        Some(Ok(WsMessage::Text(text))) => {
                            let msg = match Message::from_text(text.as_str()) {
                                Ok(msg) => msg,
                                Err(e) => {
                                    tracing::warn!(connection_id = %entry.id, error = %e, "Dropping malformed message");
                                    continue;
                                }
                            };
                            if matches!(msg, Message::HeartbeatAck { .. }) {
                                last_heartbeat_ack = Instant::now();
                            }
                            if !self.handle_client_message(entry, msg, ws_sink, &mut chunks).await? {
                                return Ok(());
                            }
                        }
                        Some(Ok(WsMessage::Ping(data))) => {
                            ws_sink
                                .send(WsMessage::Pong(data))
                                .await
                                .map_err(TunnelError::connection)?;
                        }
                        Some(Ok(WsMessage::Close(_))) | None => return Ok(()),
                        Some(Ok(_)) => {}
                        Some(Err(e)) => return Err(TunnelError::connection(e)),
                    }
                }
            }
        }
    }

    /// Handle a message from the client; returns `false` when the client is leaving
    async fn handle_client_message(
        &self,
        entry: &ConnectionEntry,
        msg: Message,
        ws_sink: &mut WsSink,
        chunks: &mut ChunkRouter,
    ) -> Result<bool> {
        match msg {
            Message::Response(response) => {
                let request_id = response.request_id;
                if !entry.complete(response) {
                    tracing::debug!(
                        connection_id = %entry.id,
                        request_id = %request_id,
                        "Response arrived with no waiter"
                    );
                }
            }

            Message::Chunk(chunk) => chunks.route(chunk),

            Message::HeartbeatAck { timestamp } => {
                let latency_ms = current_timestamp_ms().saturating_sub(timestamp);
                tracing::trace!(connection_id = %entry.id, latency_ms, "Heartbeat ack received");
            }

            Message::Heartbeat { timestamp } => {
                send(ws_sink, &Message::HeartbeatAck { timestamp }).await?;
            }

            Message::Disconnect { reason } => {
                tracing::info!(connection_id = %entry.id, reason = %reason, "Client disconnecting");
                return Ok(false);
            }

            Message::Identify { .. }
            | Message::IdentifyOk { .. }
            | Message::IdentifyFail { .. }
            | Message::Request(_)
            | Message::Notification { .. } => {
                tracing::warn!(
                    connection_id = %entry.id,
                    msg_type = msg.message_type(),
                    "Unexpected message from client"
                );
            }
        }

        Ok(true)
    }
}

/// Routes legacy chunks of one connection to per-stream writer tasks
///
/// Each stream has its own ordered queue. A consumer that stops reading
/// stalls only that queue, never the message loop; the parked writer is
/// released once the stream is destroyed or evicted.
struct ChunkRouter {
    streams: Arc<StreamingTable>,
    writers: HashMap<String, mpsc::UnboundedSender<ChunkPayload>>,
}

impl ChunkRouter {
    fn new(streams: Arc<StreamingTable>) -> Self {
        Self {
            streams,
            writers: HashMap::new(),
        }
    }

    fn route(&mut self, chunk: ChunkPayload) {
        let streaming_id = chunk.streaming_id.clone();
        let finished = chunk.finished;

        let writer = self
            .writers
            .entry(streaming_id.clone())
            .or_insert_with(|| spawn_stream_writer(Arc::clone(&self.streams), streaming_id.clone()));

        if writer.send(chunk).is_err() {
            tracing::debug!(streaming_id = %streaming_id, "Dropping chunk for closed stream");
            self.writers.remove(&streaming_id);
        } else if finished {
            self.writers.remove(&streaming_id);
        }
    }
}

fn spawn_stream_writer(
    streams: Arc<StreamingTable>,
    streaming_id: String,
) -> mpsc::UnboundedSender<ChunkPayload> {
    let (tx, mut rx) = mpsc::unbounded_channel::<ChunkPayload>();

    tokio::spawn(async move {
        while let Some(chunk) = rx.recv().await {
            let finished = chunk.finished;
            if let Err(e) = apply_chunk(&streams, &streaming_id, chunk).await {
                tracing::warn!(streaming_id = %streaming_id, error = %e, "Dropping stream chunk");
                streams.destroy(&streaming_id, &e.to_string());
                break;
            }
            if finished {
                break;
            }
        }
    });

    tx
}

/// Apply one legacy chunk to the streaming table
async fn apply_chunk(streams: &StreamingTable, streaming_id: &str, chunk: ChunkPayload) -> Result<()> {
    if let Some(reason) = chunk.error {
        return Err(TunnelError::connection_msg(format!("client aborted stream: {reason}")));
    }
    if let Some(meta) = chunk.meta {
        streams.set_head(streaming_id, meta)?;
    }
    if !chunk.data.is_empty() {
        streams.write(streaming_id, chunk.data).await?;
    }
    if chunk.finished {
        streams.finish(streaming_id)?;
    }
    Ok(())
}

async fn next_message(ws_stream: &mut WsStream) -> Result<Message> {
    while let Some(frame) = ws_stream.next().await {
        match frame {
            Ok(WsMessage::Text(text)) => return Message::from_text(text.as_str()),
            Ok(WsMessage::Close(_)) => {
                return Err(TunnelError::connection_msg("Client closed connection"));
            }
            Ok(_) => {}
            Err(e) => return Err(TunnelError::connection(e)),
        }
    }
    Err(TunnelError::connection_msg("Connection closed before identify"))
}

async fn send(ws_sink: &mut WsSink, msg: &Message) -> Result<()> {
    ws_sink
        .send(WsMessage::Text(msg.to_text()?.into()))
        .await
        .map_err(TunnelError::connection)
}

async fn send_fail(ws_sink: &mut WsSink, reason: &str) {
    let fail = Message::IdentifyFail {
        reason: reason.to_string(),
    };
    let _ = send(ws_sink, &fail).await;
}
