//! The contract between the session layer and an MCP server instance, plus
//! the in-process transports built directly on channels.
//!
//! A [`Transport`] carries JSON-RPC messages in both directions. The MCP
//! server consumes the transport: it reads client messages with
//! [`Transport::receive`] and writes its own with [`Transport::send`]. The
//! callback style of other MCP runtimes maps onto this surface as follows:
//! `onmessage` is a `receive()` that yielded a message, `onclose` is
//! `receive()` yielding `None`, and `onerror` is an `Err` from the send side,
//! which callers report and survive.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use tokio::sync::mpsc;

use crate::model::{JsonRpcMessage, RequestId};

#[cfg(feature = "server-side-http")]
pub mod common;
#[cfg(feature = "transport-sse-server")]
pub mod sse_server;
#[cfg(feature = "transport-streamable-http-server")]
pub mod streamable_http_server;
#[cfg(feature = "transport-ws-server")]
pub mod ws_server;

#[cfg(feature = "transport-sse-server")]
pub use sse_server::{SseServer, SseServerConfig, SseServerTransport};
#[cfg(feature = "transport-streamable-http-server")]
pub use streamable_http_server::{StreamableHttpServerConfig, StreamableHttpService};
#[cfg(feature = "transport-ws-server")]
pub use ws_server::{WsServer, WsServerConfig, WsServerTransport};

/// Opaque identifier of one session. Printable ASCII, unique per node, never
/// reused after the session is torn down.
pub type SessionId = Arc<str>;

/// Error type shared by the transports in this crate.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("transport already started")]
    AlreadyStarted,
    #[error("transport closed")]
    Closed,
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A bidirectional JSON-RPC channel as consumed by an MCP server.
///
/// `send` takes an optional `related` request id: for responses and errors
/// the message's own `id` selects the destination stream, while
/// server-initiated requests and notifications may name the client request
/// they relate to so the transport can deliver them on the stream that
/// carried it. Transports without per-stream routing ignore the hint.
pub trait Transport: Send + 'static {
    type Error: std::error::Error + Send + Sync + 'static;

    /// Arm the transport. The first call succeeds; any further call fails.
    fn start(&mut self) -> Result<(), Self::Error>;

    /// Serialize and dispatch one message toward the client.
    fn send(
        &mut self,
        message: JsonRpcMessage,
        related: Option<RequestId>,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send;

    /// The next client message, or `None` once the transport is gone.
    fn receive(&mut self) -> impl Future<Output = Option<JsonRpcMessage>> + Send;

    /// Cease delivery. Further sends fail; `receive` drains and ends.
    fn close(&mut self) -> impl Future<Output = Result<(), Self::Error>> + Send;
}

/// One side of an in-process transport pair.
///
/// This is the cheap bidirectional channel between an HTTP dispatcher task
/// and the task owning a session: what a networked deployment would do with
/// an internal WebSocket hop, a single process does with a channel pair
/// carrying the same frames.
pub struct DuplexTransport {
    tx: Option<mpsc::Sender<JsonRpcMessage>>,
    rx: mpsc::Receiver<JsonRpcMessage>,
    started: bool,
}

/// Create a connected transport pair; messages sent on one side are received
/// on the other, in order.
pub fn duplex(buffer: usize) -> (DuplexTransport, DuplexTransport) {
    let (a_tx, a_rx) = mpsc::channel(buffer);
    let (b_tx, b_rx) = mpsc::channel(buffer);
    (
        DuplexTransport {
            tx: Some(a_tx),
            rx: b_rx,
            started: false,
        },
        DuplexTransport {
            tx: Some(b_tx),
            rx: a_rx,
            started: false,
        },
    )
}

impl Transport for DuplexTransport {
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
        let Some(tx) = &self.tx else {
            return Err(TransportError::Closed);
        };
        tx.send(message).await.map_err(|_| TransportError::Closed)
    }

    async fn receive(&mut self) -> Option<JsonRpcMessage> {
        self.rx.recv().await
    }

    async fn close(&mut self) -> Result<(), Self::Error> {
        self.tx = None;
        Ok(())
    }
}

/// A transport pre-loaded with one inbound POST body.
///
/// Serves the stateless mode: the server drains the inbound messages, its
/// outbound messages flow to the returned receiver, and the outbound channel
/// closes as soon as every inbound request has been answered (or when the
/// transport is dropped), which ends the response stream.
///
/// Servers that process requests concurrently must finish their in-flight
/// handlers before returning from `serve`, otherwise late responses are lost
/// with the transport.
pub struct OneshotTransport {
    inbound: VecDeque<JsonRpcMessage>,
    outstanding: HashSet<RequestId>,
    to_client: Option<mpsc::Sender<JsonRpcMessage>>,
    started: bool,
}

impl OneshotTransport {
    pub fn new(messages: Vec<JsonRpcMessage>) -> (Self, mpsc::Receiver<JsonRpcMessage>) {
        let outstanding = messages
            .iter()
            .filter_map(|message| message.as_request().map(|request| request.id.clone()))
            .collect::<HashSet<_>>();
        let (tx, rx) = mpsc::channel(16);
        let transport = Self {
            inbound: messages.into(),
            to_client: (!outstanding.is_empty()).then_some(tx),
            outstanding,
            started: false,
        };
        (transport, rx)
    }
}

impl Transport for OneshotTransport {
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
        let answered = message.response_id().cloned();
        let Some(tx) = &self.to_client else {
            return Err(TransportError::Closed);
        };
        tx.send(message).await.map_err(|_| TransportError::Closed)?;
        if let Some(id) = answered {
            self.outstanding.remove(&id);
            if self.outstanding.is_empty() {
                self.to_client = None;
            }
        }
        Ok(())
    }

    async fn receive(&mut self) -> Option<JsonRpcMessage> {
        self.inbound.pop_front()
    }

    async fn close(&mut self) -> Result<(), Self::Error> {
        self.to_client = None;
        self.inbound.clear();
        Ok(())
    }
}
