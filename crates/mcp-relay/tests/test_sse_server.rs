//! Legacy SSE transport, driven through the axum router: the GET stream
//! advertises the POST endpoint, POSTs are acknowledged with 202, and every
//! answer flows back over the stream.

use std::time::Duration;

use axum::{Router, body::Body};
use http::{Method, Request, StatusCode, header};
use http_body_util::BodyExt;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;

use mcp_relay::transport::sse_server::{SseServer, SseServerConfig};

mod common;
use common::{SseEvent, greeter::GreeterAgent, init_tracing, parse_sse};

fn sse_router() -> Router {
    init_tracing();
    let config = SseServerConfig {
        bind: "127.0.0.1:0".parse().unwrap(),
        sse_path: "/sse".to_string(),
        post_path: "/message".to_string(),
        ct: CancellationToken::new(),
        sse_keep_alive: None,
        max_body_bytes: 4 * 1024 * 1024,
        property_extractor: None,
    };
    let (sse_server, router) = SseServer::new(config);
    sse_server.with_agent(GreeterAgent::default);
    router
}

async fn next_event(body: &mut Body) -> SseEvent {
    loop {
        let frame = tokio::time::timeout(Duration::from_secs(5), body.frame())
            .await
            .expect("event within the timeout")
            .expect("stream still open")
            .expect("no transport error");
        if let Ok(data) = frame.into_data() {
            let text = std::str::from_utf8(&data).expect("utf-8 frame");
            if let Some(event) = parse_sse(text).into_iter().next() {
                return event;
            }
        }
    }
}

async fn post_message(router: &Router, session_id: &str, message: Value) -> StatusCode {
    let response = router
        .clone()
        .oneshot(
            Request::builder()
                .method(Method::POST)
                .uri(format!("/message?sessionId={session_id}"))
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(serde_json::to_vec(&message).unwrap()))
                .unwrap(),
        )
        .await
        .unwrap();
    response.status()
}

#[tokio::test]
async fn endpoint_event_then_message_round_trip() -> anyhow::Result<()> {
    let router = sse_router();

    let response = router
        .clone()
        .oneshot(
            Request::builder()
                .method(Method::GET)
                .uri("/sse")
                .header(header::ACCEPT, "text/event-stream")
                .body(Body::empty())?,
        )
        .await?;
    assert_eq!(response.status(), StatusCode::OK);
    assert!(
        response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.starts_with("text/event-stream"))
    );

    let mut body = response.into_body();
    let endpoint = next_event(&mut body).await;
    assert_eq!(endpoint.event.as_deref(), Some("endpoint"));
    let session_id = endpoint
        .data
        .split_once("sessionId=")
        .map(|(_, sid)| sid.to_string())
        .expect("endpoint event carries the session id");
    assert!(endpoint.data.starts_with("/message?"));

    // initialize over the POST endpoint; the reply arrives on the stream
    let status = post_message(
        &router,
        &session_id,
        json!({"jsonrpc": "2.0", "id": 1, "method": "initialize", "params": {}}),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);

    let event = next_event(&mut body).await;
    assert_eq!(event.event.as_deref(), Some("message"));
    let reply: Value = serde_json::from_str(&event.data)?;
    assert_eq!(reply["id"], 1);
    assert!(reply["result"]["protocolVersion"].is_string());

    let status = post_message(
        &router,
        &session_id,
        json!({
            "jsonrpc": "2.0",
            "id": 2,
            "method": "tools/call",
            "params": {"name": "greet", "arguments": {"name": "X"}},
        }),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);

    let event = next_event(&mut body).await;
    assert!(event.id.is_some());
    let reply: Value = serde_json::from_str(&event.data)?;
    assert_eq!(reply["id"], 2);
    assert_eq!(reply["result"]["content"][0]["text"], "Hello, X!");
    Ok(())
}

#[tokio::test]
async fn post_to_unknown_session_is_404() {
    let router = sse_router();
    let status = post_message(
        &router,
        "not-a-session",
        json!({"jsonrpc": "2.0", "id": 1, "method": "ping"}),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn post_with_garbage_body_is_400() {
    let router = sse_router();
    let response = router
        .clone()
        .oneshot(
            Request::builder()
                .method(Method::POST)
                .uri("/message?sessionId=whatever")
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from("not json"))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn bound_server_accepts_connections() -> anyhow::Result<()> {
    init_tracing();
    let sse_server = SseServer::serve("127.0.0.1:0".parse()?).await?;
    let bind = sse_server.config.bind;
    let ct = sse_server.with_agent(GreeterAgent::default);

    // the listener is real: a plain TCP connect succeeds
    let stream = tokio::net::TcpStream::connect(bind).await?;
    drop(stream);

    ct.cancel();
    Ok(())
}
