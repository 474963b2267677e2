//! Application-facing contract.
//!
//! Applications implement [`McpAgent`]: lifecycle hooks plus an accessor for
//! the MCP server that will consume the session's [`Transport`]. The gateway
//! never inspects what the server does with tools, prompts or resources; it
//! only drives the agent through [`serve_agent`] once per session.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    model::JsonRpcMessage,
    transport::{SessionId, Transport},
};

/// Opaque caller-supplied data attached to a session at initialization,
/// typically authenticated-user claims. Propagated to the agent before any
/// message is dispatched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Properties(pub serde_json::Map<String, Value>);

impl Properties {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: Value) -> Option<Value> {
        self.0.insert(key.into(), value)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<(String, Value)> for Properties {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// An MCP server instance. Out of scope for this crate beyond the transport
/// it consumes: `serve` reads client messages, answers requests, and returns
/// when the transport ends.
pub trait McpServer: Send + 'static {
    type Error: std::error::Error + Send + Sync + 'static;

    fn serve(
        self,
        transport: impl Transport,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send;
}

/// One application agent per session.
///
/// `init` runs exactly once per session lifetime, before any message reaches
/// the server; `on_start` runs when the session's transport is attached;
/// `on_message` observes every client message before the server sees it.
pub trait McpAgent: Send + 'static {
    type Server: McpServer;
    type Error: std::error::Error + Send + Sync + 'static;

    fn init(
        &mut self,
        _properties: &Properties,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send {
        async { Ok(()) }
    }

    fn on_start(&mut self, _session_id: &SessionId) -> impl Future<Output = ()> + Send {
        async {}
    }

    fn on_message(&mut self, _message: &JsonRpcMessage) -> impl Future<Output = ()> + Send {
        async {}
    }

    /// Hand out the MCP server that will consume this session's transport.
    fn server(&mut self) -> Self::Server;
}

/// Why an agent stopped serving.
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("agent initialization failed: {0}")]
    Init(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("server terminated with error: {0}")]
    Serve(#[source] Box<dyn std::error::Error + Send + Sync>),
}

/// Drive one agent over one transport: `init`, `on_start`, then the server
/// loop until the transport ends. The transport is wrapped so the agent's
/// `on_message` hook observes each inbound message on its way to the server.
pub async fn serve_agent<A, T>(
    mut agent: A,
    session_id: SessionId,
    properties: Properties,
    transport: T,
) -> Result<(), AgentError>
where
    A: McpAgent,
    T: Transport,
{
    agent
        .init(&properties)
        .await
        .map_err(|e| AgentError::Init(Box::new(e)))?;
    agent.on_start(&session_id).await;
    let server = agent.server();
    tracing::debug!(%session_id, "agent serving");
    let result = server
        .serve(TapTransport {
            inner: transport,
            agent,
        })
        .await
        .map_err(|e| AgentError::Serve(Box::new(e)));
    tracing::debug!(%session_id, ok = result.is_ok(), "agent finished");
    result
}

/// Forwards to an inner transport, invoking the agent's `on_message` hook for
/// every received message.
struct TapTransport<T, A> {
    inner: T,
    agent: A,
}

impl<T, A> Transport for TapTransport<T, A>
where
    T: Transport,
    A: McpAgent,
{
    type Error = T::Error;

    fn start(&mut self) -> Result<(), Self::Error> {
        self.inner.start()
    }

    async fn send(
        &mut self,
        message: JsonRpcMessage,
        related: Option<crate::model::RequestId>,
    ) -> Result<(), Self::Error> {
        self.inner.send(message, related).await
    }

    async fn receive(&mut self) -> Option<JsonRpcMessage> {
        let message = self.inner.receive().await?;
        self.agent.on_message(&message).await;
        Some(message)
    }

    async fn close(&mut self) -> Result<(), Self::Error> {
        self.inner.close().await
    }
}
