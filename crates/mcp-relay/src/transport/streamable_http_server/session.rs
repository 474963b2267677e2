//! Session management for the streamable HTTP transport.
//!
//! A *session* groups the logically related interactions between a single
//! MCP client and the server, starting from the `initialize` handshake. The
//! server assigns each session a unique [`SessionId`] (returned to the
//! client via the `mcp-session-id` response header) and the client includes
//! that id on every subsequent request.
//!
//! # Implementations
//!
//! * [`local::LocalSessionManager`] — in-memory session store (default).
//! * [`never::NeverSessionManager`] — rejects all session operations, used
//!   when stateful mode is disabled.
//!
//! # Custom session managers
//!
//! Implement the [`SessionManager`] trait to back sessions with an external
//! store. `properties` and the initialized flag are the only state that must
//! survive hibernation; streams and history are rebuilt from client
//! reconnects.

use futures::Stream;

use crate::{
    handler::Properties,
    model::JsonRpcMessage,
    transport::{SessionId, Transport, common::server_side_http::ServerSseMessage},
};

pub mod local;
pub mod never;

/// Failures of the built-in session managers.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("session not found")]
    SessionNotFound,
    #[error("session already initialized")]
    AlreadyInitialized,
    #[error("expected an initialize request")]
    ExpectedInitializeRequest,
    #[error("invalid last event id: {0}")]
    InvalidEventId(String),
    #[error("transport closed")]
    TransportClosed,
    #[error("session management is disabled")]
    SessionsDisabled,
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Controls how MCP sessions are created, validated, and closed.
///
/// The [`StreamableHttpService`](super::StreamableHttpService) calls into
/// this trait for every HTTP request that carries (or should carry) a
/// session id.
pub trait SessionManager: Send + Sync + 'static {
    type Error: std::error::Error + Send + Sync + 'static;
    type Transport: Transport;

    /// Create a new session and return its id together with the transport
    /// the MCP server will consume for this session.
    fn create_session(
        &self,
        properties: Properties,
    ) -> impl Future<Output = Result<(SessionId, Self::Transport), Self::Error>> + Send;

    /// Forward the `initialize` request to the session and return the
    /// server's reply, stamped for the response stream. Exactly one call per
    /// session succeeds; any further call fails.
    fn initialize_session(
        &self,
        id: &SessionId,
        message: JsonRpcMessage,
    ) -> impl Future<Output = Result<ServerSseMessage, Self::Error>> + Send;

    /// Return `true` if a session with the given id exists.
    fn has_session(&self, id: &SessionId)
    -> impl Future<Output = Result<bool, Self::Error>> + Send;

    /// Return `true` once the session's `initialize` exchange completed.
    fn is_initialized(
        &self,
        id: &SessionId,
    ) -> impl Future<Output = Result<bool, Self::Error>> + Send;

    /// Close and remove the session. Corresponds to an HTTP DELETE request
    /// with `mcp-session-id`.
    fn close_session(&self, id: &SessionId)
    -> impl Future<Output = Result<(), Self::Error>> + Send;

    /// Route client messages containing at least one request into the
    /// session and return an SSE stream carrying the responses. The stream
    /// ends once every request in the batch has been answered.
    fn create_stream(
        &self,
        id: &SessionId,
        messages: Vec<JsonRpcMessage>,
    ) -> impl Future<
        Output = Result<impl Stream<Item = ServerSseMessage> + Send + 'static, Self::Error>,
    > + Send;

    /// Accept notifications, responses, or errors from the client without
    /// producing a response stream.
    fn accept_messages(
        &self,
        id: &SessionId,
        messages: Vec<JsonRpcMessage>,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send;

    /// Create an SSE stream not tied to a specific client request (HTTP GET).
    fn create_standalone_stream(
        &self,
        id: &SessionId,
    ) -> impl Future<
        Output = Result<impl Stream<Item = ServerSseMessage> + Send + 'static, Self::Error>,
    > + Send;

    /// Resume an SSE stream from the given `Last-Event-ID`, replaying any
    /// events the client missed.
    fn resume(
        &self,
        id: &SessionId,
        last_event_id: String,
    ) -> impl Future<
        Output = Result<impl Stream<Item = ServerSseMessage> + Send + 'static, Self::Error>,
    > + Send;
}
