//! Dispatcher tests against a real downstream and response-data endpoint

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, post};
use axum::Router;
use bytes::Bytes;
use futures_util::StreamExt;
use serde_json::Value;
use tokio::sync::mpsc;
use uuid::Uuid;
use zbroker_filter::{CompiledRuleSet, Rule, RuleSet, Variables};
use zbroker_relay::{Dispatcher, Frame, FrameDecoder, RelayConfig};
use zbroker_tunnel::{
    HeaderField, Message, RequestPayload, StreamingTable, TunnelSender,
    CAPABILITY_RECEIVE_POST_STREAMS,
};

const MIB: usize = 1024 * 1024;
const TOKEN: &str = "dispatch-test-token";

async fn response_data(
    State(streams): State<Arc<StreamingTable>>,
    Path((_token, streaming_id)): Path<(String, String)>,
    body: Body,
) -> StatusCode {
    let mut decoder = FrameDecoder::new();
    let mut data = body.into_data_stream();
    while let Some(chunk) = data.next().await {
        let Ok(chunk) = chunk else {
            streams.destroy(&streaming_id, "upload failed");
            return StatusCode::INTERNAL_SERVER_ERROR;
        };
        for frame in decoder.decode(chunk).unwrap() {
            match frame {
                Frame::Head(meta) => streams.set_head(&streaming_id, meta).unwrap(),
                Frame::Body(bytes) => {
                    streams.write(&streaming_id, bytes).await.unwrap();
                }
            }
        }
    }
    streams.finish(&streaming_id).unwrap();
    StatusCode::OK
}

async fn start(streams: Arc<StreamingTable>) -> SocketAddr {
    let app = Router::new()
        .route("/hello", get(|| async { ([("x-upstream", "1")], "hello") }))
        .route("/big", get(|| async { vec![b'a'; 25 * MIB] }))
        .route(
            "/whoami",
            get(|headers: HeaderMap| async move {
                headers
                    .get("authorization")
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or_default()
                    .to_string()
            }),
        )
        .route("/response-data/{token}/{streaming_id}", post(response_data))
        .with_state(streams);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
    addr
}

fn dispatcher(addr: SocketAddr, origin: &str) -> Dispatcher {
    let vars = Arc::new(Variables::new());
    let rules = vec![Rule::new("GET", "/*").with_origin(origin)];
    let rules = CompiledRuleSet::compile(&RuleSet::Flat(rules), Arc::clone(&vars)).unwrap();
    let config = RelayConfig::default().with_broker_server_url(format!("http://{addr}"));
    Dispatcher::new(Arc::new(rules), vars, config, TOKEN).unwrap()
}

fn request(url: &str, streaming_id: &str) -> RequestPayload {
    RequestPayload {
        request_id: Uuid::new_v4(),
        url: url.to_string(),
        method: "GET".to_string(),
        headers: Default::default(),
        body: Bytes::new(),
        streaming_id: streaming_id.to_string(),
    }
}

#[tokio::test]
async fn test_inline_response_carries_markers() {
    let streams = Arc::new(StreamingTable::new(Duration::from_secs(60)));
    let addr = start(streams).await;
    let d = dispatcher(addr, &format!("http://{addr}"));

    let (tx, mut rx) = mpsc::channel(16);
    d.dispatch(request("/hello", ""), &TunnelSender::new(tx, Vec::new())).await;

    let Some(Message::Response(response)) = rx.recv().await else {
        panic!("expected response");
    };
    assert_eq!(response.status, 200);
    assert_eq!(response.body, Bytes::from_static(b"hello"));
    assert_eq!(response.headers["x-upstream"], HeaderField::One("1".to_string()));
    assert_eq!(response.headers["x-broker-ws-response"], HeaderField::One("true".to_string()));
}

#[tokio::test]
async fn test_url_token_becomes_authorization_header() {
    let streams = Arc::new(StreamingTable::new(Duration::from_secs(60)));
    let addr = start(streams).await;
    let d = dispatcher(addr, &format!("http://abc123@{addr}"));

    let (tx, mut rx) = mpsc::channel(16);
    d.dispatch(request("/whoami", ""), &TunnelSender::new(tx, Vec::new())).await;

    let Some(Message::Response(response)) = rx.recv().await else {
        panic!("expected response");
    };
    assert_eq!(response.body, Bytes::from_static(b"token abc123"));
}

#[tokio::test]
async fn test_oversized_body_is_refused() {
    let streams = Arc::new(StreamingTable::new(Duration::from_secs(60)));
    let addr = start(streams).await;
    let d = dispatcher(addr, &format!("http://{addr}"));

    let (tx, mut rx) = mpsc::channel(16);
    d.dispatch(request("/big", ""), &TunnelSender::new(tx, Vec::new())).await;

    let Some(Message::Response(response)) = rx.recv().await else {
        panic!("expected response");
    };
    assert_eq!(response.status, 502);
    assert_eq!(response.error_type.as_deref(), Some("BODY_TOO_LARGE"));
    assert_eq!(response.original_body_size, Some(26_214_400));
    let body: Value = serde_json::from_slice(&response.body).unwrap();
    assert!(body["message"].as_str().unwrap().contains("26214400"));
}

#[tokio::test]
async fn test_streamed_response_is_uploaded() {
    let streams = Arc::new(StreamingTable::new(Duration::from_secs(60)));
    let addr = start(Arc::clone(&streams)).await;
    let d = dispatcher(addr, &format!("http://{addr}"));

    let streaming_id = Uuid::new_v4().to_string();
    let receiver = streams.begin(&streaming_id).unwrap();

    let (tx, mut rx) = mpsc::channel(16);
    let tunnel = TunnelSender::new(tx, vec![CAPABILITY_RECEIVE_POST_STREAMS.to_string()]);
    tokio::spawn(async move { d.dispatch(request("/hello", &streaming_id), &tunnel).await });

    let head = tokio::time::timeout(Duration::from_secs(5), receiver.head)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(head.status, 200);
    assert_eq!(head.headers["x-upstream"], HeaderField::One("1".to_string()));

    let mut body = Vec::new();
    let mut chunks = receiver.body;
    while let Some(chunk) = chunks.recv().await {
        body.extend_from_slice(&chunk.unwrap());
    }
    assert_eq!(body, b"hello");
    // Nothing travelled over the tunnel itself
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn test_streamed_response_falls_back_to_legacy_chunks() {
    let streams = Arc::new(StreamingTable::new(Duration::from_secs(60)));
    let addr = start(streams).await;
    let d = dispatcher(addr, &format!("http://{addr}"));

    let (tx, mut rx) = mpsc::channel(64);
    d.dispatch(request("/hello", "legacy-1"), &TunnelSender::new(tx, Vec::new())).await;

    let mut chunks = Vec::new();
    while let Ok(Message::Chunk(chunk)) = rx.try_recv() {
        chunks.push(chunk);
    }
    assert_eq!(chunks.first().and_then(|c| c.meta.as_ref()).map(|m| m.status), Some(200));
    assert!(chunks.last().unwrap().finished);
    let data: Vec<u8> = chunks.iter().flat_map(|c| c.data.to_vec()).collect();
    assert_eq!(data, b"hello");
}
