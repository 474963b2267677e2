//! WebSocket server transport.
//!
//! A single upgrade yields a duplex channel carrying one JSON-RPC message
//! per text frame in either direction. Frames that do not parse as JSON-RPC
//! are dropped: session-owner runtimes may emit internal state-change
//! broadcasts on the same channel, and those must never leak to MCP clients.

use std::{io, net::SocketAddr, sync::Arc};

use axum::{
    Router,
    extract::{
        State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    http::{StatusCode, header, request::Parts},
    response::{IntoResponse, Response},
    routing::get,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::{
    handler::{McpAgent, Properties, serve_agent},
    model::{JsonRpcMessage, RequestId},
    transport::{
        SessionId, Transport, TransportError,
        common::server_side_http::{DEFAULT_MAX_BODY_BYTES, PropertyExtractor, session_id},
    },
};

#[derive(Clone)]
pub struct WsServerConfig {
    pub bind: SocketAddr,
    pub path: String,
    pub ct: CancellationToken,
    /// Origins accepted on upgrade; empty disables the check.
    pub allowed_origins: Vec<String>,
    /// Frames above this size are rejected by the websocket layer.
    pub max_frame_bytes: usize,
    pub property_extractor: Option<PropertyExtractor>,
}

impl std::fmt::Debug for WsServerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WsServerConfig")
            .field("bind", &self.bind)
            .field("path", &self.path)
            .field("allowed_origins", &self.allowed_origins)
            .field("max_frame_bytes", &self.max_frame_bytes)
            .finish()
    }
}

#[derive(Clone)]
struct App {
    transport_tx: mpsc::UnboundedSender<WsServerTransport>,
    allowed_origins: Arc<[String]>,
    max_frame_bytes: usize,
    property_extractor: Option<PropertyExtractor>,
}

async fn ws_handler(
    State(app): State<App>,
    parts: Parts,
    ws: WebSocketUpgrade,
) -> Response {
    if !app.allowed_origins.is_empty() {
        let origin = parts
            .headers
            .get(header::ORIGIN)
            .and_then(|value| value.to_str().ok());
        if !origin.is_some_and(|origin| app.allowed_origins.iter().any(|o| o == origin)) {
            return (StatusCode::FORBIDDEN, "origin not allowed").into_response();
        }
    }

    let session = session_id();
    tracing::info!(session_id = %session, "websocket connection");
    let properties = match &app.property_extractor {
        Some(extractor) => extractor(&parts),
        None => Properties::new(),
    };

    let (from_client_tx, from_client_rx) = mpsc::channel(64);
    let (to_client_tx, to_client_rx) = mpsc::channel(64);
    let transport = WsServerTransport {
        session_id: session.clone(),
        properties,
        to_client: Some(to_client_tx),
        from_client: from_client_rx,
        started: false,
    };
    if app.transport_tx.send(transport).is_err() {
        return (StatusCode::INTERNAL_SERVER_ERROR, "server is shutting down").into_response();
    }

    ws.max_message_size(app.max_frame_bytes)
        .on_upgrade(move |socket| {
            relay(socket, to_client_rx, from_client_tx)
                .instrument(tracing::debug_span!("ws-relay", session_id = %session))
        })
}

/// Pump frames between the socket and the transport channels until either
/// side goes away.
async fn relay(
    mut socket: WebSocket,
    mut to_client_rx: mpsc::Receiver<JsonRpcMessage>,
    from_client_tx: mpsc::Sender<JsonRpcMessage>,
) {
    loop {
        tokio::select! {
            incoming = socket.recv() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    match serde_json::from_str::<JsonRpcMessage>(text.as_str()) {
                        Ok(message) => {
                            if from_client_tx.send(message).await.is_err() {
                                break;
                            }
                        }
                        Err(_) => tracing::debug!("dropping non JSON-RPC frame"),
                    }
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(error)) => {
                    tracing::debug!(%error, "websocket read error");
                    break;
                }
            },
            outgoing = to_client_rx.recv() => match outgoing {
                Some(message) => {
                    let text = match serde_json::to_string(&message) {
                        Ok(text) => text,
                        Err(error) => {
                            tracing::error!(%error, "failed to serialize outbound frame");
                            continue;
                        }
                    };
                    if socket.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                None => {
                    let _ = socket.send(Message::Close(None)).await;
                    break;
                }
            },
        }
    }
}

/// The transport of one WebSocket connection.
pub struct WsServerTransport {
    session_id: SessionId,
    properties: Properties,
    to_client: Option<mpsc::Sender<JsonRpcMessage>>,
    from_client: mpsc::Receiver<JsonRpcMessage>,
    started: bool,
}

impl WsServerTransport {
    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    pub fn properties(&self) -> &Properties {
        &self.properties
    }
}

impl Transport for WsServerTransport {
    type Error = TransportError;

    fn start(&mut self) -> Result<(), Self::Error> {
        if self.started {
            return Err(TransportError::AlreadyStarted);
        }
        self.started = true;
        Ok(())
    }

    async fn send(
        &mut self,
        message: JsonRpcMessage,
        _related: Option<RequestId>,
    ) -> Result<(), Self::Error> {
        let Some(tx) = &self.to_client else {
            return Err(TransportError::Closed);
        };
        tx.send(message).await.map_err(|_| TransportError::Closed)
    }

    async fn receive(&mut self) -> Option<JsonRpcMessage> {
        self.from_client.recv().await
    }

    async fn close(&mut self) -> Result<(), Self::Error> {
        self.to_client = None;
        Ok(())
    }
}

#[derive(Debug)]
pub struct WsServer {
    transport_rx: mpsc::UnboundedReceiver<WsServerTransport>,
    pub config: WsServerConfig,
}

impl WsServer {
    pub async fn serve(bind: SocketAddr) -> io::Result<Self> {
        Self::serve_with_config(WsServerConfig {
            bind,
            path: "/ws".to_string(),
            ct: CancellationToken::new(),
            allowed_origins: Vec::new(),
            max_frame_bytes: DEFAULT_MAX_BODY_BYTES,
            property_extractor: None,
        })
        .await
    }

    pub async fn serve_with_config(mut config: WsServerConfig) -> io::Result<Self> {
        let listener = tokio::net::TcpListener::bind(config.bind).await?;
        config.bind = listener.local_addr()?;
        let (ws_server, service) = Self::new(config);
        let ct = ws_server.config.ct.child_token();
        let server = axum::serve(listener, service).with_graceful_shutdown(async move {
            ct.cancelled().await;
            tracing::info!("ws server cancelled");
        });
        tokio::spawn(
            async move {
                if let Err(e) = server.await {
                    tracing::error!(error = %e, "ws server shutdown with error");
                }
            }
            .instrument(tracing::info_span!("ws-server", bind_address = %ws_server.config.bind)),
        );
        Ok(ws_server)
    }

    pub fn new(config: WsServerConfig) -> (WsServer, Router) {
        let (transport_tx, transport_rx) = mpsc::unbounded_channel();
        let app = App {
            transport_tx,
            allowed_origins: config.allowed_origins.clone().into(),
            max_frame_bytes: config.max_frame_bytes,
            property_extractor: config.property_extractor.clone(),
        };
        let router = Router::new()
            .route(&config.path, get(ws_handler))
            .with_state(app);
        (
            WsServer {
                transport_rx,
                config,
            },
            router,
        )
    }

    /// Spawn one agent per accepted connection until cancelled.
    pub fn with_agent<A, F>(mut self, agent_factory: F) -> CancellationToken
    where
        A: McpAgent,
        F: Fn() -> A + Send + 'static,
    {
        let ct = self.config.ct.clone();
        tokio::spawn(async move {
            while let Some(transport) = self.next_transport().await {
                let agent = agent_factory();
                let session_id = transport.session_id().clone();
                let properties = transport.properties().clone();
                tokio::spawn(async move {
                    if let Err(error) =
                        serve_agent(agent, session_id.clone(), properties, transport).await
                    {
                        tracing::error!(%session_id, %error, "agent terminated");
                    }
                });
            }
        });
        ct
    }

    pub fn cancel(&self) {
        self.config.ct.cancel();
    }

    pub async fn next_transport(&mut self) -> Option<WsServerTransport> {
        self.transport_rx.recv().await
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[tokio::test]
    async fn transport_round_trip() {
        let (from_client_tx, from_client_rx) = mpsc::channel(4);
        let (to_client_tx, mut to_client_rx) = mpsc::channel(4);
        let mut transport = WsServerTransport {
            session_id: session_id(),
            properties: Properties::new(),
            to_client: Some(to_client_tx),
            from_client: from_client_rx,
            started: false,
        };
        transport.start().unwrap();
        assert!(matches!(
            transport.start(),
            Err(TransportError::AlreadyStarted)
        ));

        transport
            .send(JsonRpcMessage::response(1.into(), json!({})), None)
            .await
            .unwrap();
        assert!(to_client_rx.recv().await.is_some());

        from_client_tx
            .send(JsonRpcMessage::request(2, "ping", None))
            .await
            .unwrap();
        assert!(transport.receive().await.is_some());

        transport.close().await.unwrap();
        assert!(matches!(
            transport
                .send(JsonRpcMessage::response(3.into(), json!({})), None)
                .await,
            Err(TransportError::Closed)
        ));
    }
}
