//! API integration tests

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Body,
    http::{Request, StatusCode},
    routing::get,
    Router,
};
use bytes::Bytes;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tower::ServiceExt;
use zbroker_api::{build_router, ApiConfig, ApiServer, ServerConfig};
use zbroker_filter::{CompiledRuleSet, Rule, RuleSet, Variables};
use zbroker_relay::{encode_header, Dispatcher, RelayConfig, FAILURE_HEADER};
use zbroker_tunnel::{
    ClientMetadata, ConnectionEntry, ConnectionRole, HeaderField, Message, ResponseMeta,
    ResponsePayload, TunnelAgent, TunnelClientConfig, WireHeaders,
};

const TOKEN: &str = "0b1c2d3e-aaaa-bbbb-cccc-1234567890ab";

fn server_rules() -> Arc<CompiledRuleSet> {
    let rules = RuleSet::Flat(vec![Rule::new("GET", "/repos/*"), Rule::new("GET", "/hello")]);
    Arc::new(CompiledRuleSet::compile(&rules, Arc::new(Variables::new())).unwrap())
}

fn metadata(capabilities: Vec<String>) -> ClientMetadata {
    ClientMetadata {
        version: "4.190.0".to_string(),
        capabilities,
        client_id: "client-1".to_string(),
        role: ConnectionRole::Primary,
        connection_type: None,
        filters: Some(json!({ "public": [] })),
    }
}

async fn read_json(response: axum::response::Response) -> Value {
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&body).unwrap()
}

fn get_request(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

#[tokio::test]
async fn test_healthcheck() {
    let server = ApiServer::new(ServerConfig::default(), server_rules());
    let app = build_router(&ApiConfig::default(), server.state());

    let response = app.oneshot(get_request("/healthcheck")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let json = read_json(response).await;
    assert_eq!(json["ok"], true);
    assert_eq!(json["version"], env!("CARGO_PKG_VERSION"));
}

#[tokio::test]
async fn test_connection_status_unknown_token() {
    let server = ApiServer::new(ServerConfig::default(), server_rules());
    let app = build_router(&ApiConfig::default(), server.state());

    let response = app
        .oneshot(get_request("/connection-status/nobody"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(read_json(response).await, json!({ "ok": false }));
}

#[tokio::test]
async fn test_connection_status_lists_clients() {
    let server = ApiServer::new(ServerConfig::default(), server_rules());
    let (tx, _rx) = mpsc::channel(16);
    server
        .registry()
        .register(TOKEN, ConnectionEntry::new(metadata(Vec::new()), tx));
    let app = build_router(&ApiConfig::default(), server.state());

    let response = app
        .clone()
        .oneshot(get_request(&format!("/connection-status/{TOKEN}")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let json = read_json(response).await;
    assert_eq!(json["ok"], true);
    assert_eq!(json["clients"][0]["version"], "4.190.0");
    assert_eq!(json["clients"][0]["filters"], json!({ "public": [] }));

    let response = app.oneshot(get_request("/connections")).await.unwrap();
    let json = read_json(response).await;
    assert_eq!(json[0]["masked_identifier"], "0b1c-...-90ab");
    assert_eq!(json[0]["client_ids"], json!(["client-1"]));
    assert!(!json.to_string().contains(TOKEN));
}

#[tokio::test]
async fn test_broker_without_connection() {
    let server = ApiServer::new(ServerConfig::default(), server_rules());
    let app = build_router(&ApiConfig::default(), server.state());

    let response = app
        .oneshot(get_request(&format!("/broker/{TOKEN}/repos/a/b")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(response.headers()[FAILURE_HEADER], "no-connection");
    assert_eq!(read_json(response).await, json!({ "ok": false }));
}

#[tokio::test]
async fn test_broker_inline_round_trip() {
    let server = ApiServer::new(ServerConfig::default(), server_rules());
    let (tx, mut rx) = mpsc::channel(16);
    let entry = server
        .registry()
        .register(TOKEN, ConnectionEntry::new(metadata(Vec::new()), tx));
    let app = build_router(&ApiConfig::default(), server.state());

    // Fake client answering over the channel
    tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            if let Message::Request(request) = message {
                assert_eq!(request.url, "/repos/a/b?page=2");
                assert!(request.streaming_id.is_empty());
                let mut headers = WireHeaders::new();
                headers.insert("x-upstream".to_string(), HeaderField::One("yes".to_string()));
                entry.complete(ResponsePayload {
                    request_id: request.request_id,
                    status: 200,
                    headers,
                    body: Bytes::from_static(b"{\"name\":\"b\"}"),
                    error_type: None,
                    original_body_size: None,
                });
            }
        }
    });

    let response = app
        .oneshot(get_request(&format!(
            "/broker/{TOKEN}/repos/a/b?page=2&connection_role=primary"
        )))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["x-upstream"], "yes");
    assert_eq!(read_json(response).await, json!({ "name": "b" }));
}

#[tokio::test]
async fn test_broker_blocked_request() {
    let server = ApiServer::new(ServerConfig::default(), server_rules());
    let (tx, mut rx) = mpsc::channel(16);
    server
        .registry()
        .register(TOKEN, ConnectionEntry::new(metadata(Vec::new()), tx));
    let app = build_router(&ApiConfig::default(), server.state());

    let response = app
        .oneshot(
            Request::builder()
                .method("DELETE")
                .uri(format!("/broker/{TOKEN}/repos/a/b"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let json = read_json(response).await;
    assert_eq!(json["message"], "blocked");
    assert_eq!(json["url"], "/repos/a/b");
    // Nothing reached the tunnel
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn test_response_data_unknown_stream() {
    let server = ApiServer::new(ServerConfig::default(), server_rules());
    let app = build_router(&ApiConfig::default(), server.state());

    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri(format!("/response-data/{TOKEN}/missing"))
                .body(Body::from("ignored"))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let json = read_json(response).await;
    assert_eq!(json["message"], "unable to find request matching streaming id");
}

#[tokio::test]
async fn test_response_data_feeds_waiting_stream() {
    let server = ApiServer::new(ServerConfig::default(), server_rules());
    let state = server.state();
    let receiver = state.streams.begin("s-1").unwrap();
    let app = build_router(&ApiConfig::default(), state.clone());

    let mut headers = WireHeaders::new();
    headers.insert("content-type".to_string(), HeaderField::One("text/plain".to_string()));
    let meta = ResponseMeta {
        status: 201,
        headers,
    };
    let mut upload = encode_header(&meta).unwrap().to_vec();
    upload.extend_from_slice(b"streamed body");

    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri(format!("/response-data/{TOKEN}/s-1?server_id=abc"))
                .body(Body::from(upload))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(read_json(response).await, json!({}));

    assert_eq!(receiver.head.await.unwrap(), meta);
    let mut body = Vec::new();
    let mut chunks = receiver.body;
    while let Some(chunk) = chunks.recv().await {
        body.extend_from_slice(&chunk.unwrap());
    }
    assert_eq!(body, b"streamed body");
    assert!(!state.streams.contains("s-1"));
}

#[tokio::test]
async fn test_response_data_bad_framing_destroys_stream() {
    let server = ApiServer::new(ServerConfig::default(), server_rules());
    let state = server.state();
    let _receiver = state.streams.begin("s-2").unwrap();
    let app = build_router(&ApiConfig::default(), state.clone());

    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri(format!("/response-data/{TOKEN}/s-2"))
                .body(Body::from(vec![0u8, 0, 0, 0, b'x']))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert!(!state.streams.contains("s-2"));
}

async fn start_downstream() -> SocketAddr {
    let app = Router::new().route(
        "/hello",
        get(|| async { ([("x-upstream", "private")], "hello from inside") }),
    );
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
    addr
}

#[tokio::test]
async fn test_end_to_end_streamed_relay() {
    let downstream = start_downstream().await;

    let http = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let tunnel = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let http_addr = http.local_addr().unwrap();
    let tunnel_addr = tunnel.local_addr().unwrap();

    let server = ApiServer::new(ServerConfig::default(), server_rules());
    let registry = server.registry();
    tokio::spawn(server.serve(http, tunnel, std::future::pending()));

    let vars = Arc::new(Variables::new());
    let client_rules = RuleSet::Flat(vec![
        Rule::new("GET", "/hello").with_origin(format!("http://{downstream}"))
    ]);
    let client_rules = CompiledRuleSet::compile(&client_rules, Arc::clone(&vars)).unwrap();
    let relay = RelayConfig::default().with_broker_server_url(format!("http://{http_addr}"));
    let dispatcher = Dispatcher::new(Arc::new(client_rules), vars, relay, TOKEN).unwrap();

    let agent = TunnelAgent::new(
        TunnelClientConfig::new(format!("ws://{tunnel_addr}"), TOKEN),
        Arc::new(dispatcher),
    );
    let running = agent.clone();
    tokio::spawn(async move { running.run().await });

    tokio::time::timeout(Duration::from_secs(5), async {
        while !registry.has_live_connection(TOKEN) {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .unwrap();

    let response = reqwest::get(format!("http://{http_addr}/broker/{TOKEN}/hello"))
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(response.headers()["x-upstream"], "private");
    assert_eq!(response.text().await.unwrap(), "hello from inside");

    let response = reqwest::get(format!("http://{http_addr}/broker/{TOKEN}/repos/x/y"))
        .await
        .unwrap();
    // Accepted by the server, refused by the client's own rules
    assert_eq!(response.status(), 401);

    agent.disconnect();
}
