//! Legacy SSE server transport.
//!
//! A GET on the SSE path opens the event stream: the server assigns a
//! session id, emits an initial `endpoint` event whose payload is the POST
//! URL for this session, then keeps the stream open. Clients POST single
//! JSON-RPC messages to that URL and are answered over the stream.

use std::{collections::HashMap, io, net::SocketAddr, sync::Arc, time::Duration};

use axum::{
    Extension, Router,
    extract::{DefaultBodyLimit, Query, State},
    http::{StatusCode, request::Parts},
    response::{
        Response,
        sse::{Event, KeepAlive, Sse},
    },
    routing::{get, post},
};
use bytes::Bytes;
use futures::{Stream, StreamExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::{
    handler::{McpAgent, Properties, serve_agent},
    model::{JsonRpcMessage, RequestId},
    transport::{
        SessionId, Transport, TransportError,
        common::server_side_http::{
            DEFAULT_AUTO_PING_INTERVAL, DEFAULT_MAX_BODY_BYTES, PropertyExtractor, session_id,
        },
    },
};

#[derive(Clone)]
pub struct SseServerConfig {
    pub bind: SocketAddr,
    pub sse_path: String,
    pub post_path: String,
    pub ct: CancellationToken,
    pub sse_keep_alive: Option<Duration>,
    pub max_body_bytes: usize,
    pub property_extractor: Option<PropertyExtractor>,
}

impl std::fmt::Debug for SseServerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SseServerConfig")
            .field("bind", &self.bind)
            .field("sse_path", &self.sse_path)
            .field("post_path", &self.post_path)
            .field("sse_keep_alive", &self.sse_keep_alive)
            .field("max_body_bytes", &self.max_body_bytes)
            .finish()
    }
}

type TxStore = Arc<tokio::sync::RwLock<HashMap<SessionId, mpsc::Sender<JsonRpcMessage>>>>;

#[derive(Clone)]
struct App {
    txs: TxStore,
    transport_tx: mpsc::UnboundedSender<SseServerTransport>,
    post_path: Arc<str>,
    sse_ping_interval: Duration,
    property_extractor: Option<PropertyExtractor>,
}

impl App {
    fn new(
        post_path: String,
        sse_ping_interval: Duration,
        property_extractor: Option<PropertyExtractor>,
    ) -> (Self, mpsc::UnboundedReceiver<SseServerTransport>) {
        let (transport_tx, transport_rx) = mpsc::unbounded_channel();
        (
            Self {
                txs: Default::default(),
                transport_tx,
                post_path: post_path.into(),
                sse_ping_interval,
                property_extractor,
            },
            transport_rx,
        )
    }
}

#[derive(Debug, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
struct PostEventQuery {
    session_id: String,
}

async fn post_event_handler(
    State(app): State<App>,
    Query(PostEventQuery { session_id }): Query<PostEventQuery>,
    body: Bytes,
) -> Result<StatusCode, StatusCode> {
    tracing::debug!(session_id, "new client message");
    let message: JsonRpcMessage =
        serde_json::from_slice(&body).map_err(|_| StatusCode::BAD_REQUEST)?;
    let tx = {
        let rg = app.txs.read().await;
        rg.get(session_id.as_str())
            .ok_or(StatusCode::NOT_FOUND)?
            .clone()
    };
    if tx.send(message).await.is_err() {
        tracing::error!(session_id, "send message error");
        return Err(StatusCode::GONE);
    }
    Ok(StatusCode::ACCEPTED)
}

async fn sse_handler(
    State(app): State<App>,
    nested_path: Option<Extension<axum::extract::NestedPath>>,
    parts: Parts,
) -> Result<Sse<impl Stream<Item = Result<Event, io::Error>>>, Response<String>> {
    let session = session_id();
    tracing::info!(%session, "sse connection");
    let (from_client_tx, from_client_rx) = mpsc::channel(64);
    let (to_client_tx, to_client_rx) = mpsc::channel::<JsonRpcMessage>(64);
    let to_client_tx_clone = to_client_tx.clone();

    app.txs
        .write()
        .await
        .insert(session.clone(), from_client_tx);

    let properties = match &app.property_extractor {
        Some(extractor) => extractor(&parts),
        None => Properties::new(),
    };
    let transport = SseServerTransport {
        session_id: session.clone(),
        properties,
        to_client: Some(to_client_tx),
        from_client: from_client_rx,
        started: false,
        tx_store: app.txs.clone(),
    };
    if app.transport_tx.send(transport).is_err() {
        tracing::warn!("send transport out error");
        let mut response =
            Response::new("fail to send out transport, it seems server is closed".to_string());
        *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
        return Err(response);
    }

    let nested_path = nested_path
        .as_deref()
        .map(axum::extract::NestedPath::as_str)
        .unwrap_or("");
    let post_path = app.post_path.as_ref();
    let endpoint = format!("{nested_path}{post_path}?sessionId={session}");
    let ping_interval = app.sse_ping_interval;

    // monotonic `id:` lines let clients detect missed events
    let mut event_id = 0u64;
    let stream = futures::stream::once(futures::future::ok(
        Event::default().event("endpoint").data(endpoint),
    ))
    .chain(futures::stream::unfold(
        to_client_rx,
        move |mut rx| {
            let id = {
                event_id += 1;
                event_id
            };
            async move {
                let message = rx.recv().await?;
                let event = match serde_json::to_string(&message) {
                    Ok(data) => Ok(Event::default()
                        .id(id.to_string())
                        .event("message")
                        .data(data)),
                    Err(e) => Err(io::Error::new(io::ErrorKind::InvalidData, e)),
                };
                Some((event, rx))
            }
        },
    ));

    tokio::spawn(async move {
        // wait for connection closure, then clean up the session entry
        to_client_tx_clone.closed().await;
        let mut txs = app.txs.write().await;
        txs.remove(&session);
        tracing::debug!(session_id = %session, "closed session and cleaned up resources");
    });

    Ok(Sse::new(stream).keep_alive(KeepAlive::new().interval(ping_interval)))
}

/// The transport of one SSE connection: outbound messages become `message`
/// events on the stream, inbound messages arrive from the POST endpoint.
pub struct SseServerTransport {
    session_id: SessionId,
    properties: Properties,
    to_client: Option<mpsc::Sender<JsonRpcMessage>>,
    from_client: mpsc::Receiver<JsonRpcMessage>,
    started: bool,
    tx_store: TxStore,
}

impl SseServerTransport {
    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    pub fn properties(&self) -> &Properties {
        &self.properties
    }
}

impl Transport for SseServerTransport {
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
        let session_id = self.session_id.clone();
        let tx_store = self.tx_store.clone();
        tokio::spawn(async move {
            tx_store.write().await.remove(&session_id);
        });
        Ok(())
    }
}

#[derive(Debug)]
pub struct SseServer {
    transport_rx: mpsc::UnboundedReceiver<SseServerTransport>,
    pub config: SseServerConfig,
}

impl SseServer {
    pub async fn serve(bind: SocketAddr) -> io::Result<Self> {
        Self::serve_with_config(SseServerConfig {
            bind,
            sse_path: "/sse".to_string(),
            post_path: "/message".to_string(),
            ct: CancellationToken::new(),
            sse_keep_alive: None,
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
            property_extractor: None,
        })
        .await
    }

    pub async fn serve_with_config(mut config: SseServerConfig) -> io::Result<Self> {
        let listener = tokio::net::TcpListener::bind(config.bind).await?;
        // update config with actual bound address (important when port is 0)
        config.bind = listener.local_addr()?;
        let (sse_server, service) = Self::new(config);
        let ct = sse_server.config.ct.child_token();
        let server = axum::serve(listener, service).with_graceful_shutdown(async move {
            ct.cancelled().await;
            tracing::info!("sse server cancelled");
        });
        tokio::spawn(
            async move {
                if let Err(e) = server.await {
                    tracing::error!(error = %e, "sse server shutdown with error");
                }
            }
            .instrument(tracing::info_span!("sse-server", bind_address = %sse_server.config.bind)),
        );
        Ok(sse_server)
    }

    pub fn new(config: SseServerConfig) -> (SseServer, Router) {
        let (app, transport_rx) = App::new(
            config.post_path.clone(),
            config.sse_keep_alive.unwrap_or(DEFAULT_AUTO_PING_INTERVAL),
            config.property_extractor.clone(),
        );
        let router = Router::new()
            .route(&config.sse_path, get(sse_handler))
            .route(&config.post_path, post(post_event_handler))
            .layer(DefaultBodyLimit::max(config.max_body_bytes))
            .with_state(app);

        let server = SseServer {
            transport_rx,
            config,
        };

        (server, router)
    }

    /// Spawn one agent per incoming SSE connection until cancelled.
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

    pub async fn next_transport(&mut self) -> Option<SseServerTransport> {
        self.transport_rx.recv().await
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[tokio::test]
    async fn session_entries_are_tracked() {
        let (app, transport_rx) = App::new("/message".to_string(), Duration::from_secs(15), None);

        let session_id = session_id();
        let (tx, _rx) = mpsc::channel(64);

        app.txs.write().await.insert(session_id.clone(), tx);
        assert!(app.txs.read().await.contains_key(&session_id));

        app.txs.write().await.remove(&session_id);
        assert!(!app.txs.read().await.contains_key(&session_id));

        drop(transport_rx);
    }

    #[tokio::test]
    async fn transport_round_trip() {
        let (from_client_tx, from_client_rx) = mpsc::channel(4);
        let (to_client_tx, mut to_client_rx) = mpsc::channel(4);

        let mut transport = SseServerTransport {
            session_id: session_id(),
            properties: Properties::new(),
            to_client: Some(to_client_tx),
            from_client: from_client_rx,
            started: false,
            tx_store: Default::default(),
        };
        transport.start().unwrap();

        transport
            .send(JsonRpcMessage::response(1.into(), json!({})), None)
            .await
            .unwrap();
        assert!(matches!(
            to_client_rx.recv().await,
            Some(JsonRpcMessage::Response(_))
        ));

        from_client_tx
            .send(JsonRpcMessage::notification("notifications/initialized", None))
            .await
            .unwrap();
        assert!(matches!(
            transport.receive().await,
            Some(JsonRpcMessage::Notification(_))
        ));

        transport.close().await.unwrap();
        assert!(matches!(
            transport
                .send(JsonRpcMessage::response(2.into(), json!({})), None)
                .await,
            Err(TransportError::Closed)
        ));
    }

    #[tokio::test]
    async fn post_event_handler_rejects_unknown_session() {
        let (app, _transport_rx) =
            App::new("/message".to_string(), Duration::from_secs(15), None);

        let query = PostEventQuery {
            session_id: "non-existent".to_string(),
        };
        let body = Bytes::from(
            serde_json::to_vec(&JsonRpcMessage::request(1, "ping", None)).unwrap(),
        );

        let result = post_event_handler(State(app), Query(query), body).await;
        assert_eq!(result, Err(StatusCode::NOT_FOUND));
    }

    #[tokio::test]
    async fn post_event_handler_rejects_garbage() {
        let (app, _transport_rx) =
            App::new("/message".to_string(), Duration::from_secs(15), None);
        let query = PostEventQuery {
            session_id: "whatever".to_string(),
        };
        let result =
            post_event_handler(State(app), Query(query), Bytes::from_static(b"not json")).await;
        assert_eq!(result, Err(StatusCode::BAD_REQUEST));
    }

    #[tokio::test]
    async fn server_with_cancellation() {
        let config = SseServerConfig {
            bind: "127.0.0.1:0".parse().unwrap(),
            sse_path: "/sse".to_string(),
            post_path: "/message".to_string(),
            ct: CancellationToken::new(),
            sse_keep_alive: None,
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
            property_extractor: None,
        };

        let (mut sse_server, router) = SseServer::new(config);
        drop(router);
        sse_server.cancel();

        // no transports can arrive after cancellation closed the app side
        let transport = tokio::time::timeout(
            Duration::from_millis(100),
            sse_server.next_transport(),
        )
        .await;
        assert!(transport.is_ok_and(|t| t.is_none()));
    }
}
