//! WebSocket transport: one JSON-RPC message per text frame, undecodable
//! frames dropped, origin allow-list enforced on upgrade.

use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{Message, client::IntoClientRequest},
};
use tokio_util::sync::CancellationToken;

use mcp_relay::transport::ws_server::{WsServer, WsServerConfig};

mod common;
use common::{greeter::GreeterAgent, init_tracing};

async fn started_server(allowed_origins: Vec<String>) -> (std::net::SocketAddr, CancellationToken) {
    init_tracing();
    let ws_server = WsServer::serve_with_config(WsServerConfig {
        bind: "127.0.0.1:0".parse().unwrap(),
        path: "/ws".to_string(),
        ct: CancellationToken::new(),
        allowed_origins,
        max_frame_bytes: 4 * 1024 * 1024,
        property_extractor: None,
    })
    .await
    .expect("bind ws server");
    let bind = ws_server.config.bind;
    let ct = ws_server.with_agent(GreeterAgent::default);
    (bind, ct)
}

#[tokio::test]
async fn frames_carry_json_rpc_in_both_directions() -> anyhow::Result<()> {
    let (bind, ct) = started_server(Vec::new()).await;
    let (mut socket, _response) = connect_async(format!("ws://{bind}/ws")).await?;

    socket
        .send(Message::Text(
            serde_json::to_string(
                &json!({"jsonrpc": "2.0", "id": 1, "method": "initialize", "params": {}}),
            )?
            .into(),
        ))
        .await?;
    let reply = tokio::time::timeout(Duration::from_secs(5), socket.next())
        .await?
        .expect("reply frame")?;
    let Message::Text(text) = reply else {
        panic!("expected a text frame, got {reply:?}");
    };
    let reply: Value = serde_json::from_str(text.as_str())?;
    assert_eq!(reply["id"], 1);
    assert!(reply["result"]["protocolVersion"].is_string());

    // a frame that is not JSON-RPC is dropped, not answered and not fatal
    socket
        .send(Message::Text("{\"internal\": \"state-broadcast\"}".into()))
        .await?;
    socket
        .send(Message::Text(
            serde_json::to_string(&json!({"jsonrpc": "2.0", "id": 2, "method": "ping"}))?.into(),
        ))
        .await?;
    let reply = tokio::time::timeout(Duration::from_secs(5), socket.next())
        .await?
        .expect("reply frame")?;
    let Message::Text(text) = reply else {
        panic!("expected a text frame, got {reply:?}");
    };
    let reply: Value = serde_json::from_str(text.as_str())?;
    // the garbage frame produced nothing: the next reply answers the ping
    assert_eq!(reply["id"], 2);

    socket.close(None).await?;
    ct.cancel();
    Ok(())
}

#[tokio::test]
async fn origin_allow_list_is_enforced() -> anyhow::Result<()> {
    let (bind, ct) = started_server(vec!["http://allowed.example".to_string()]).await;

    // no origin header: rejected during the upgrade
    let denied = connect_async(format!("ws://{bind}/ws")).await;
    assert!(denied.is_err(), "upgrade without an allowed origin must fail");

    // an allowed origin passes
    let mut request = format!("ws://{bind}/ws").into_client_request()?;
    request
        .headers_mut()
        .insert("origin", "http://allowed.example".parse()?);
    let (mut socket, _response) = connect_async(request).await?;
    socket
        .send(Message::Text(
            serde_json::to_string(&json!({"jsonrpc": "2.0", "id": 1, "method": "ping"}))?.into(),
        ))
        .await?;
    let reply = tokio::time::timeout(Duration::from_secs(5), socket.next())
        .await?
        .expect("reply frame")?;
    assert!(matches!(reply, Message::Text(_)));

    socket.close(None).await?;
    ct.cancel();
    Ok(())
}
