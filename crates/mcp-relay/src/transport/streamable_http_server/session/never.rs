//! A session manager that refuses every operation. Used when stateful mode
//! is disabled: nothing in the service should ever reach for a session, and
//! reaching one is a bug worth surfacing.

use futures::stream::Empty;

use super::{SessionError, SessionManager};
use crate::{
    handler::Properties,
    model::JsonRpcMessage,
    transport::{DuplexTransport, SessionId, common::server_side_http::ServerSseMessage},
};

#[derive(Debug, Clone, Copy, Default)]
pub struct NeverSessionManager;

impl SessionManager for NeverSessionManager {
    type Error = SessionError;
    type Transport = DuplexTransport;

    async fn create_session(
        &self,
        _properties: Properties,
    ) -> Result<(SessionId, DuplexTransport), SessionError> {
        Err(SessionError::SessionsDisabled)
    }

    async fn initialize_session(
        &self,
        _id: &SessionId,
        _message: JsonRpcMessage,
    ) -> Result<ServerSseMessage, SessionError> {
        Err(SessionError::SessionsDisabled)
    }

    async fn has_session(&self, _id: &SessionId) -> Result<bool, SessionError> {
        Ok(false)
    }

    async fn is_initialized(&self, _id: &SessionId) -> Result<bool, SessionError> {
        Ok(false)
    }

    async fn close_session(&self, _id: &SessionId) -> Result<(), SessionError> {
        Err(SessionError::SessionsDisabled)
    }

    async fn create_stream(
        &self,
        _id: &SessionId,
        _messages: Vec<JsonRpcMessage>,
    ) -> Result<Empty<ServerSseMessage>, SessionError> {
        Err(SessionError::SessionsDisabled)
    }

    async fn accept_messages(
        &self,
        _id: &SessionId,
        _messages: Vec<JsonRpcMessage>,
    ) -> Result<(), SessionError> {
        Err(SessionError::SessionsDisabled)
    }

    async fn create_standalone_stream(
        &self,
        _id: &SessionId,
    ) -> Result<Empty<ServerSseMessage>, SessionError> {
        Err(SessionError::SessionsDisabled)
    }

    async fn resume(
        &self,
        _id: &SessionId,
        _last_event_id: String,
    ) -> Result<Empty<ServerSseMessage>, SessionError> {
        Err(SessionError::SessionsDisabled)
    }
}
