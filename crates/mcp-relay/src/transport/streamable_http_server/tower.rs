//! The streamable HTTP endpoint as a framework-neutral tower service.
//!
//! The service owns no per-session state: it validates the envelope, routes
//! the request to the session manager, and renders whatever comes back as an
//! SSE stream or a plain response. Sessions live in their own tasks; the
//! handler borrows one through the manager for the duration of a request.

use std::{
    convert::Infallible,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};

use bytes::Bytes;
use futures::StreamExt;
use http::{HeaderValue, Method, Request, StatusCode, header};
use tokio_stream::wrappers::ReceiverStream;

use super::{
    StreamableHttpServerConfig,
    session::{SessionManager, local::LocalSessionManager},
};
use crate::{
    handler::{McpAgent, Properties, serve_agent},
    model::{ErrorData, JsonRpcMessage},
    transport::{
        OneshotTransport, SessionId,
        common::{
            envelope::{
                check_get_headers, check_lifecycle, check_post_headers, parse_messages,
                session_id_header,
            },
            http_header::{HEADER_LAST_EVENT_ID, HEADER_SESSION_ID},
            server_side_http::{
                BoxResponse, ServerSseMessage, accepted_response, collect_body, empty_response,
                json_rpc_error_response, session_id, sse_stream_response,
            },
        },
    },
};

/// Serves the MCP streamable HTTP endpoint. `A` is the application agent
/// spawned once per session (or once per POST in stateless mode); `M` keeps
/// the sessions.
pub struct StreamableHttpService<A, M = LocalSessionManager> {
    agent_factory: Arc<dyn Fn() -> Result<A, std::io::Error> + Send + Sync>,
    session_manager: Arc<M>,
    config: StreamableHttpServerConfig,
}

impl<A, M> Clone for StreamableHttpService<A, M> {
    fn clone(&self) -> Self {
        Self {
            agent_factory: self.agent_factory.clone(),
            session_manager: self.session_manager.clone(),
            config: self.config.clone(),
        }
    }
}

impl<A, M> StreamableHttpService<A, M>
where
    A: McpAgent,
    M: SessionManager,
{
    pub fn new(
        agent_factory: impl Fn() -> Result<A, std::io::Error> + Send + Sync + 'static,
        session_manager: Arc<M>,
        config: StreamableHttpServerConfig,
    ) -> Self {
        Self {
            agent_factory: Arc::new(agent_factory),
            session_manager,
            config,
        }
    }

    pub async fn handle<B>(&self, request: Request<B>) -> BoxResponse
    where
        B: http_body::Body<Data = Bytes> + Send + 'static,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        let method = request.method().clone();
        let response = if method == Method::POST {
            self.handle_post(request).await
        } else if method == Method::GET {
            self.handle_get(request).await
        } else if method == Method::DELETE {
            self.handle_delete(request).await
        } else if method == Method::OPTIONS {
            self.handle_preflight()
        } else {
            self.method_not_allowed()
        };
        self.apply_cors(response)
    }

    fn allowed_methods(&self) -> &'static str {
        if self.config.stateful_mode {
            "GET, POST, DELETE"
        } else {
            "POST"
        }
    }

    fn method_not_allowed(&self) -> BoxResponse {
        let mut response = json_rpc_error_response(
            StatusCode::METHOD_NOT_ALLOWED,
            ErrorData::bad_request("method not allowed"),
        );
        response.headers_mut().insert(
            header::ALLOW,
            HeaderValue::from_static(self.allowed_methods()),
        );
        response
    }

    fn handle_preflight(&self) -> BoxResponse {
        if self.config.cors.is_none() {
            return self.method_not_allowed();
        }
        let mut response = empty_response(StatusCode::NO_CONTENT);
        // the remaining Access-Control-* headers are filled by apply_cors
        if let Some(cors) = &self.config.cors {
            let headers = response.headers_mut();
            if let Ok(value) = HeaderValue::from_str(&cors.allow_methods) {
                headers.insert(header::ACCESS_CONTROL_ALLOW_METHODS, value);
            }
            if let Ok(value) = HeaderValue::from_str(&cors.allow_headers) {
                headers.insert(header::ACCESS_CONTROL_ALLOW_HEADERS, value);
            }
            headers.insert(header::ACCESS_CONTROL_MAX_AGE, cors.max_age_secs.into());
        }
        response
    }

    fn apply_cors(&self, mut response: BoxResponse) -> BoxResponse {
        if let Some(cors) = &self.config.cors
            && let Ok(value) = HeaderValue::from_str(&cors.allow_origin)
        {
            response
                .headers_mut()
                .insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, value);
        }
        response
    }

    fn extract_properties(&self, parts: &http::request::Parts) -> Properties {
        match &self.config.property_extractor {
            Some(extractor) => extractor(parts),
            None => Properties::new(),
        }
    }

    fn internal_error(&self, error: impl std::fmt::Display) -> BoxResponse {
        tracing::error!(%error, "request failed");
        json_rpc_error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            ErrorData::internal_error(error.to_string()),
        )
    }

    fn session_not_found(&self) -> BoxResponse {
        json_rpc_error_response(
            StatusCode::NOT_FOUND,
            ErrorData::session_not_found("session not found"),
        )
    }

    fn with_session_header(&self, mut response: BoxResponse, session_id: &SessionId) -> BoxResponse {
        if let Ok(value) = HeaderValue::from_str(session_id) {
            response.headers_mut().insert(HEADER_SESSION_ID, value);
        }
        response
    }

    async fn handle_post<B>(&self, request: Request<B>) -> BoxResponse
    where
        B: http_body::Body<Data = Bytes> + Send + 'static,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        let (parts, body) = request.into_parts();
        if let Err(violation) = check_post_headers(&parts, self.config.max_body_bytes) {
            return violation.into_response();
        }
        let bytes = match collect_body(body, self.config.max_body_bytes).await {
            Ok(bytes) => bytes,
            Err((status, error)) => return json_rpc_error_response(status, error),
        };
        let messages = match parse_messages(&bytes) {
            Ok(messages) => messages,
            Err(violation) => return violation.into_response(),
        };
        let session_header = match session_id_header(&parts) {
            Ok(header) => header.map(str::to_owned),
            Err(violation) => return violation.into_response(),
        };

        if self.config.stateful_mode {
            self.handle_post_stateful(parts, messages, session_header)
                .await
        } else {
            self.handle_post_stateless(parts, messages, session_header)
                .await
        }
    }

    async fn handle_post_stateful(
        &self,
        parts: http::request::Parts,
        messages: Vec<JsonRpcMessage>,
        session_header: Option<String>,
    ) -> BoxResponse {
        if let Err(violation) = check_lifecycle(&messages, session_header.as_deref()) {
            return violation.into_response();
        }

        let has_initialize = messages.iter().any(JsonRpcMessage::is_initialize_request);
        if has_initialize {
            return self.handle_initialize(parts, messages).await;
        }

        let Some(session_header) = session_header else {
            // unreachable: check_lifecycle demands the header on this path
            return json_rpc_error_response(
                StatusCode::BAD_REQUEST,
                ErrorData::bad_request("missing mcp-session-id header"),
            );
        };
        let session_id: SessionId = session_header.into();

        match self.session_manager.has_session(&session_id).await {
            Ok(true) => {}
            Ok(false) => return self.session_not_found(),
            Err(error) => return self.internal_error(error),
        }
        match self.session_manager.is_initialized(&session_id).await {
            Ok(true) => {}
            Ok(false) => return self.session_not_found(),
            Err(error) => return self.internal_error(error),
        }

        if messages.iter().any(JsonRpcMessage::is_request) {
            match self.session_manager.create_stream(&session_id, messages).await {
                Ok(stream) => {
                    let response = sse_stream_response(stream, self.config.sse_keep_alive);
                    self.with_session_header(response, &session_id)
                }
                Err(error) => self.internal_error(error),
            }
        } else {
            // notifications and responses only: accept and finish
            match self
                .session_manager
                .accept_messages(&session_id, messages)
                .await
            {
                Ok(()) => self.with_session_header(accepted_response(), &session_id),
                Err(error) => self.internal_error(error),
            }
        }
    }

    async fn handle_initialize(
        &self,
        parts: http::request::Parts,
        messages: Vec<JsonRpcMessage>,
    ) -> BoxResponse {
        let properties = self.extract_properties(&parts);
        let (session_id, transport) = match self
            .session_manager
            .create_session(properties.clone())
            .await
        {
            Ok(created) => created,
            Err(error) => return self.internal_error(error),
        };
        let agent = match (self.agent_factory)() {
            Ok(agent) => agent,
            Err(error) => return self.internal_error(error),
        };

        // the agent task outlives this request; the session is torn down
        // when the server loop ends, however it ends
        tokio::spawn({
            let session_manager = self.session_manager.clone();
            let session_id = session_id.clone();
            async move {
                if let Err(error) =
                    serve_agent(agent, session_id.clone(), properties, transport).await
                {
                    tracing::error!(%session_id, %error, "agent terminated");
                }
                let _ = session_manager.close_session(&session_id).await;
            }
        });

        let Some(message) = messages.into_iter().next() else {
            // unreachable: lifecycle checks guarantee exactly one message
            return self.internal_error("empty initialize batch");
        };
        match self
            .session_manager
            .initialize_session(&session_id, message)
            .await
        {
            Ok(event) => {
                let stream = futures::stream::once(std::future::ready(event));
                let response = sse_stream_response(stream, self.config.sse_keep_alive);
                self.with_session_header(response, &session_id)
            }
            Err(error) => self.internal_error(error),
        }
    }

    async fn handle_post_stateless(
        &self,
        parts: http::request::Parts,
        messages: Vec<JsonRpcMessage>,
        session_header: Option<String>,
    ) -> BoxResponse {
        if session_header.is_some() {
            return json_rpc_error_response(
                StatusCode::BAD_REQUEST,
                ErrorData::bad_request("mcp-session-id is not accepted in stateless mode"),
            );
        }
        let has_initialize = messages.iter().any(JsonRpcMessage::is_initialize_request);
        if has_initialize && messages.len() != 1 {
            return json_rpc_error_response(
                StatusCode::BAD_REQUEST,
                ErrorData::invalid_request("initialize request must not be batched"),
            );
        }

        let has_request = messages.iter().any(JsonRpcMessage::is_request);
        let agent = match (self.agent_factory)() {
            Ok(agent) => agent,
            Err(error) => return self.internal_error(error),
        };
        let properties = self.extract_properties(&parts);
        let (transport, receiver) = OneshotTransport::new(messages);
        let ephemeral = session_id();
        tokio::spawn(async move {
            if let Err(error) = serve_agent(agent, ephemeral.clone(), properties, transport).await {
                tracing::error!(session_id = %ephemeral, %error, "agent terminated");
            }
        });

        if !has_request {
            return accepted_response();
        }
        let stream = ReceiverStream::new(receiver)
            .enumerate()
            .map(|(index, message)| ServerSseMessage {
                event_id: Some(index.to_string()),
                message,
            });
        sse_stream_response(stream, self.config.sse_keep_alive)
    }

    async fn handle_get<B>(&self, request: Request<B>) -> BoxResponse
    where
        B: http_body::Body<Data = Bytes> + Send + 'static,
    {
        if !self.config.stateful_mode {
            return self.method_not_allowed();
        }
        let (parts, _body) = request.into_parts();
        if let Err(violation) = check_get_headers(&parts) {
            return violation.into_response();
        }
        let session_id: SessionId = match session_id_header(&parts) {
            Ok(Some(session_id)) => session_id.into(),
            Ok(None) => {
                return json_rpc_error_response(
                    StatusCode::BAD_REQUEST,
                    ErrorData::bad_request("missing mcp-session-id header"),
                );
            }
            Err(violation) => return violation.into_response(),
        };

        match self.session_manager.has_session(&session_id).await {
            Ok(true) => {}
            Ok(false) => return self.session_not_found(),
            Err(error) => return self.internal_error(error),
        }
        match self.session_manager.is_initialized(&session_id).await {
            Ok(true) => {}
            Ok(false) => return self.session_not_found(),
            Err(error) => return self.internal_error(error),
        }

        let last_event_id = parts
            .headers
            .get(HEADER_LAST_EVENT_ID)
            .and_then(|value| value.to_str().ok())
            .map(str::to_owned);

        let response = match last_event_id {
            Some(cursor) => {
                tracing::debug!(%session_id, %cursor, "resuming listener stream");
                match self.session_manager.resume(&session_id, cursor).await {
                    Ok(stream) => sse_stream_response(stream, self.config.sse_keep_alive),
                    Err(error) => return self.internal_error(error),
                }
            }
            None => match self
                .session_manager
                .create_standalone_stream(&session_id)
                .await
            {
                Ok(stream) => sse_stream_response(stream, self.config.sse_keep_alive),
                Err(error) => return self.internal_error(error),
            },
        };
        self.with_session_header(response, &session_id)
    }

    async fn handle_delete<B>(&self, request: Request<B>) -> BoxResponse {
        if !self.config.stateful_mode {
            return self.method_not_allowed();
        }
        let (parts, _body) = request.into_parts();
        let session_id: SessionId = match session_id_header(&parts) {
            Ok(Some(session_id)) => session_id.into(),
            Ok(None) => {
                return json_rpc_error_response(
                    StatusCode::BAD_REQUEST,
                    ErrorData::bad_request("missing mcp-session-id header"),
                );
            }
            Err(violation) => return violation.into_response(),
        };
        match self.session_manager.has_session(&session_id).await {
            Ok(true) => {}
            Ok(false) => return self.session_not_found(),
            Err(error) => return self.internal_error(error),
        }
        match self.session_manager.close_session(&session_id).await {
            Ok(()) => empty_response(StatusCode::NO_CONTENT),
            Err(error) => self.internal_error(error),
        }
    }
}

impl<A, M, B> tower_service::Service<Request<B>> for StreamableHttpService<A, M>
where
    A: McpAgent,
    M: SessionManager,
    B: http_body::Body<Data = Bytes> + Send + 'static,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    type Response = BoxResponse;
    type Error = Infallible;
    type Future = Pin<Box<dyn Future<Output = Result<BoxResponse, Infallible>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, request: Request<B>) -> Self::Future {
        let service = self.clone();
        Box::pin(async move { Ok(service.handle(request).await) })
    }
}
