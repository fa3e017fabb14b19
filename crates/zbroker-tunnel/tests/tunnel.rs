//! End-to-end tests: a real tunnel server and agent over loopback

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage};
use uuid::Uuid;
use zbroker_tunnel::{
    ChunkPayload, ClientMetadata, ConnectionRegistry, ConnectionRole, ControlHandler, Message,
    NotificationLevel, RequestHandler, RequestPayload, ResponseMeta, ResponsePayload,
    SelectionPolicy, StreamingTable, TunnelAgent, TunnelClientConfig, TunnelSender,
    TunnelServerConfig, WireHeaders, STREAM_BUFFER_CHUNKS,
};

/// Answers inline requests by echoing the body; streamed requests get three
/// legacy chunks.
struct Echo;

#[async_trait]
impl RequestHandler for Echo {
    async fn handle(&self, request: RequestPayload, tunnel: TunnelSender) {
        if request.streaming_id.is_empty() {
            let _ = tunnel
                .send(Message::Response(ResponsePayload {
                    request_id: request.request_id,
                    status: 200,
                    headers: WireHeaders::new(),
                    body: request.body,
                    error_type: None,
                    original_body_size: None,
                }))
                .await;
            return;
        }

        let id = request.streaming_id;
        let chunks = [
            ChunkPayload {
                streaming_id: id.clone(),
                data: Bytes::new(),
                finished: false,
                meta: Some(ResponseMeta {
                    status: 201,
                    headers: WireHeaders::new(),
                }),
                error: None,
            },
            ChunkPayload {
                streaming_id: id.clone(),
                data: Bytes::from_static(b"streamed"),
                finished: false,
                meta: None,
                error: None,
            },
            ChunkPayload {
                streaming_id: id,
                data: Bytes::new(),
                finished: true,
                meta: None,
                error: None,
            },
        ];
        for chunk in chunks {
            let _ = tunnel.send(Message::Chunk(chunk)).await;
        }
    }
}

struct Server {
    url: String,
    registry: Arc<ConnectionRegistry>,
    streams: Arc<StreamingTable>,
    _shutdown: watch::Sender<bool>,
}

async fn start_server() -> Server {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());

    let registry = Arc::new(ConnectionRegistry::new());
    let streams = Arc::new(StreamingTable::new(Duration::from_secs(60)));
    let handler = Arc::new(ControlHandler::new(
        Arc::clone(&registry),
        Arc::clone(&streams),
        TunnelServerConfig::default(),
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(handler.serve(listener, shutdown_rx));

    Server {
        url,
        registry,
        streams,
        _shutdown: shutdown_tx,
    }
}

async fn wait_for_connection(registry: &ConnectionRegistry, token: &str) {
    for _ in 0..100 {
        if registry.has_live_connection(token) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("agent never identified");
}

#[tokio::test]
async fn test_inline_request_roundtrip() {
    let server = start_server().await;
    let agent = TunnelAgent::new(
        TunnelClientConfig::new(server.url.clone(), "Broker-Token-123456"),
        Arc::new(Echo),
    );
    let runner = agent.clone();
    let task = tokio::spawn(async move { runner.run().await });

    wait_for_connection(&server.registry, "broker-token-123456").await;
    let entry = server
        .registry
        .select("broker-token-123456", SelectionPolicy::Newest)
        .unwrap();
    assert!(entry.has_capability("post-streams"));
    assert_eq!(entry.role, ConnectionRole::Primary);

    let waiter = entry
        .request(RequestPayload {
            request_id: Uuid::new_v4(),
            url: "/echo".to_string(),
            method: "POST".to_string(),
            headers: WireHeaders::new(),
            body: Bytes::from_static(b"ping"),
            streaming_id: String::new(),
        })
        .await
        .unwrap();

    let response = tokio::time::timeout(Duration::from_secs(5), waiter)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(response.status, 200);
    assert_eq!(response.body, Bytes::from_static(b"ping"));

    agent.disconnect();
    tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn test_legacy_chunks_fill_stream() {
    let server = start_server().await;
    let agent = TunnelAgent::new(
        TunnelClientConfig::new(server.url.clone(), "chunk-token-abcdef"),
        Arc::new(Echo),
    );
    let runner = agent.clone();
    tokio::spawn(async move { runner.run().await });

    wait_for_connection(&server.registry, "chunk-token-abcdef").await;
    let entry = server
        .registry
        .select("chunk-token-abcdef", SelectionPolicy::Newest)
        .unwrap();

    let mut receiver = server.streams.begin("stream-1").unwrap();
    entry
        .send(Message::Request(RequestPayload {
            request_id: Uuid::new_v4(),
            url: "/big".to_string(),
            method: "GET".to_string(),
            headers: WireHeaders::new(),
            body: Bytes::new(),
            streaming_id: "stream-1".to_string(),
        }))
        .await
        .unwrap();

    let head = tokio::time::timeout(Duration::from_secs(5), receiver.head)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(head.status, 201);

    let mut body = Vec::new();
    while let Some(chunk) = receiver.body.recv().await {
        body.extend_from_slice(&chunk.unwrap());
    }
    assert_eq!(body, b"streamed");
    assert!(!server.streams.contains("stream-1"));

    agent.disconnect();
}

#[tokio::test]
async fn test_outdated_client_is_rejected() {
    let server = start_server().await;
    let (mut ws, _) = connect_async(server.url.as_str()).await.unwrap();

    let identify = Message::Identify {
        token: "old-client-token".to_string(),
        metadata: ClientMetadata {
            version: "4.50.0".to_string(),
            capabilities: Vec::new(),
            client_id: "old".to_string(),
            role: ConnectionRole::Primary,
            connection_type: None,
            filters: None,
        },
    };
    ws.send(WsMessage::Text(identify.to_text().unwrap().into()))
        .await
        .unwrap();

    let mut received = Vec::new();
    while let Some(Ok(WsMessage::Text(text))) = ws.next().await {
        received.push(Message::from_text(text.as_str()).unwrap());
        if received.len() == 2 {
            break;
        }
    }

    assert!(matches!(
        &received[0],
        Message::Notification { level: NotificationLevel::Error, message }
            if message.contains("Minimal version: 4.100.0")
    ));
    assert!(matches!(&received[1], Message::IdentifyFail { .. }));
    assert!(!server.registry.has_live_connection("old-client-token"));
}

#[tokio::test]
async fn test_disconnect_deregisters() {
    let server = start_server().await;
    let (mut ws, _) = connect_async(server.url.as_str()).await.unwrap();

    let identify = Message::Identify {
        token: "leaving-token".to_string(),
        metadata: ClientMetadata {
            version: "local".to_string(),
            capabilities: Vec::new(),
            client_id: "c".to_string(),
            role: ConnectionRole::Secondary,
            connection_type: Some("github".to_string()),
            filters: None,
        },
    };
    ws.send(WsMessage::Text(identify.to_text().unwrap().into()))
        .await
        .unwrap();

    let Some(Ok(WsMessage::Text(text))) = ws.next().await else {
        panic!("expected identify_ok");
    };
    assert!(matches!(
        Message::from_text(text.as_str()).unwrap(),
        Message::IdentifyOk { ref capabilities, .. } if capabilities == &["receive-post-streams".to_string()]
    ));
    assert!(server.registry.has_live_connection("leaving-token"));

    ws.close(None).await.unwrap();
    for _ in 0..100 {
        if !server.registry.has_live_connection("leaving-token") {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("connection was not deregistered");
}

#[tokio::test]
async fn test_stalled_stream_does_not_block_tunnel() {
    let server = start_server().await;
    let (mut ws, _) = connect_async(server.url.as_str()).await.unwrap();

    let identify = Message::Identify {
        token: "stall-token-000001".to_string(),
        metadata: ClientMetadata {
            version: "local".to_string(),
            capabilities: Vec::new(),
            client_id: "stall".to_string(),
            role: ConnectionRole::Primary,
            connection_type: None,
            filters: None,
        },
    };
    ws.send(WsMessage::Text(identify.to_text().unwrap().into()))
        .await
        .unwrap();
    let Some(Ok(WsMessage::Text(_))) = ws.next().await else {
        panic!("expected identify_ok");
    };
    wait_for_connection(&server.registry, "stall-token-000001").await;

    // Overfill a legacy stream nobody is reading yet
    let mut receiver = server.streams.begin("stalled").unwrap();
    let head = ChunkPayload {
        streaming_id: "stalled".to_string(),
        data: Bytes::new(),
        finished: false,
        meta: Some(ResponseMeta {
            status: 200,
            headers: WireHeaders::new(),
        }),
        error: None,
    };
    ws.send(WsMessage::Text(Message::Chunk(head).to_text().unwrap().into()))
        .await
        .unwrap();
    let mut expected = String::new();
    for i in 0..STREAM_BUFFER_CHUNKS * 2 {
        let part = format!("{i},");
        expected.push_str(&part);
        let chunk = ChunkPayload {
            streaming_id: "stalled".to_string(),
            data: Bytes::from(part),
            finished: false,
            meta: None,
            error: None,
        };
        ws.send(WsMessage::Text(Message::Chunk(chunk).to_text().unwrap().into()))
            .await
            .unwrap();
    }

    // An inline request on the same tunnel still completes
    let entry = server
        .registry
        .select("stall-token-000001", SelectionPolicy::Newest)
        .unwrap();
    let request_id = Uuid::new_v4();
    let waiter = entry
        .request(RequestPayload {
            request_id,
            url: "/quick".to_string(),
            method: "GET".to_string(),
            headers: WireHeaders::new(),
            body: Bytes::new(),
            streaming_id: String::new(),
        })
        .await
        .unwrap();

    loop {
        let Some(Ok(WsMessage::Text(text))) = ws.next().await else {
            panic!("tunnel closed before the request arrived");
        };
        if let Message::Request(request) = Message::from_text(text.as_str()).unwrap() {
            assert_eq!(request.request_id, request_id);
            break;
        }
    }
    let response = Message::Response(ResponsePayload {
        request_id,
        status: 200,
        headers: WireHeaders::new(),
        body: Bytes::from_static(b"quick"),
        error_type: None,
        original_body_size: None,
    });
    ws.send(WsMessage::Text(response.to_text().unwrap().into()))
        .await
        .unwrap();

    let response = tokio::time::timeout(Duration::from_secs(5), waiter)
        .await
        .expect("inline response stuck behind a stalled stream")
        .unwrap();
    assert_eq!(response.body, Bytes::from_static(b"quick"));

    // The stalled stream resumes in order once its consumer reads
    let done = ChunkPayload {
        streaming_id: "stalled".to_string(),
        data: Bytes::new(),
        finished: true,
        meta: None,
        error: None,
    };
    ws.send(WsMessage::Text(Message::Chunk(done).to_text().unwrap().into()))
        .await
        .unwrap();

    assert_eq!(receiver.head.await.unwrap().status, 200);
    let mut body = Vec::new();
    while let Some(chunk) = receiver.body.recv().await {
        body.extend_from_slice(&chunk.unwrap());
    }
    assert_eq!(String::from_utf8(body).unwrap(), expected);
}
