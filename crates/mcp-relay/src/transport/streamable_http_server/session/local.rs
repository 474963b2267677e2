//! In-memory session store.
//!
//! Each session is owned by a single worker task: the request-origin table,
//! the replayable message history and the set of open streams are mutated
//! only from that task, so no locking is needed within a session. HTTP
//! handler tasks talk to the worker over a channel of [`SessionEvent`]s with
//! oneshot responders; the MCP server talks to it through the
//! [`WorkerTransport`] handed out at session creation.

use std::{
    collections::{HashMap, HashSet, VecDeque},
    fmt,
    str::FromStr,
};

use tokio::sync::{RwLock, mpsc, oneshot};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use super::{SessionError, SessionManager};
use crate::{
    handler::Properties,
    model::{ErrorData, JsonRpcMessage, ProgressToken, RequestId},
    transport::{
        SessionId, Transport, TransportError,
        common::server_side_http::{ServerSseMessage, session_id},
    },
};

/// Identifies one outbound stream (one POST's SSE response, or the GET
/// listener) within a session.
pub type HttpRequestId = u64;

/// A replay cursor: the per-session event index, plus the stream the event
/// was targeted at. Rendered as `<index>` for untargeted events and
/// `<index>.<stream>` for stream-targeted ones, so a `Last-Event-ID` tells
/// the worker both where to resume and which stream the client was reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventId {
    pub index: u64,
    pub stream: Option<HttpRequestId>,
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.stream {
            Some(stream) => write!(f, "{}.{}", self.index, stream),
            None => write!(f, "{}", self.index),
        }
    }
}

impl FromStr for EventId {
    type Err = SessionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || SessionError::InvalidEventId(s.to_string());
        match s.split_once('.') {
            Some((index, stream)) => Ok(EventId {
                index: index.parse().map_err(|_| invalid())?,
                stream: Some(stream.parse().map_err(|_| invalid())?),
            }),
            None => Ok(EventId {
                index: s.parse().map_err(|_| invalid())?,
                stream: None,
            }),
        }
    }
}

/// Tuning knobs for the in-memory store.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Capacity of every channel between handlers, worker and server.
    pub channel_capacity: usize,
    /// Replay history cap; the oldest event is evicted beyond this.
    pub history_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 64,
            history_capacity: 1000,
        }
    }
}

/// The transport handed to the MCP server for one session. Outbound messages
/// flow to the session worker, which routes them onto the right client
/// stream; inbound messages arrive in the order the worker accepted them.
pub struct WorkerTransport {
    to_worker: Option<mpsc::Sender<OutboundEnvelope>>,
    from_worker: mpsc::Receiver<JsonRpcMessage>,
    started: bool,
}

struct OutboundEnvelope {
    message: JsonRpcMessage,
    related: Option<RequestId>,
}

impl Transport for WorkerTransport {
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
        related: Option<RequestId>,
    ) -> Result<(), Self::Error> {
        let Some(tx) = &self.to_worker else {
            return Err(TransportError::Closed);
        };
        tx.send(OutboundEnvelope { message, related })
            .await
            .map_err(|_| TransportError::Closed)
    }

    async fn receive(&mut self) -> Option<JsonRpcMessage> {
        self.from_worker.recv().await
    }

    async fn close(&mut self) -> Result<(), Self::Error> {
        self.to_worker = None;
        Ok(())
    }
}

enum SessionEvent {
    Initialize {
        message: JsonRpcMessage,
        responder: oneshot::Sender<Result<ServerSseMessage, SessionError>>,
    },
    IsInitialized {
        responder: oneshot::Sender<bool>,
    },
    OpenRequestStream {
        messages: Vec<JsonRpcMessage>,
        responder: oneshot::Sender<Result<ReceiverStream<ServerSseMessage>, SessionError>>,
    },
    AcceptMessages {
        messages: Vec<JsonRpcMessage>,
        responder: oneshot::Sender<Result<(), SessionError>>,
    },
    OpenListenerStream {
        last_event_id: Option<EventId>,
        responder: oneshot::Sender<Result<ReceiverStream<ServerSseMessage>, SessionError>>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LifecycleState {
    Fresh,
    Initializing,
    Initialized,
}

struct RequestStream {
    tx: mpsc::Sender<ServerSseMessage>,
    /// Requests whose responses must still flow out on this stream; the
    /// stream closes when this empties.
    outstanding: HashSet<RequestId>,
}

struct HistoryEntry {
    index: u64,
    stream: Option<HttpRequestId>,
    message: JsonRpcMessage,
}

struct SessionHandle {
    event_tx: mpsc::Sender<SessionEvent>,
    ct: CancellationToken,
    properties: Properties,
}

/// In-memory [`SessionManager`]: one worker task per session.
pub struct LocalSessionManager {
    sessions: RwLock<HashMap<SessionId, SessionHandle>>,
    config: SessionConfig,
}

impl Default for LocalSessionManager {
    fn default() -> Self {
        Self::new(SessionConfig::default())
    }
}

impl LocalSessionManager {
    pub fn new(config: SessionConfig) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            config,
        }
    }

    /// The properties attached to a live session at initialization.
    pub async fn properties(&self, id: &SessionId) -> Result<Properties, SessionError> {
        self.sessions
            .read()
            .await
            .get(id)
            .map(|handle| handle.properties.clone())
            .ok_or(SessionError::SessionNotFound)
    }

    async fn event_tx(&self, id: &SessionId) -> Result<mpsc::Sender<SessionEvent>, SessionError> {
        self.sessions
            .read()
            .await
            .get(id)
            .map(|handle| handle.event_tx.clone())
            .ok_or(SessionError::SessionNotFound)
    }

    async fn dispatch<T>(
        &self,
        id: &SessionId,
        make: impl FnOnce(oneshot::Sender<Result<T, SessionError>>) -> SessionEvent,
    ) -> Result<T, SessionError> {
        let event_tx = self.event_tx(id).await?;
        let (responder, response) = oneshot::channel();
        event_tx
            .send(make(responder))
            .await
            .map_err(|_| SessionError::SessionNotFound)?;
        response.await.map_err(|_| SessionError::SessionNotFound)?
    }
}

impl SessionManager for LocalSessionManager {
    type Error = SessionError;
    type Transport = WorkerTransport;

    async fn create_session(
        &self,
        properties: Properties,
    ) -> Result<(SessionId, WorkerTransport), SessionError> {
        let id = session_id();
        let capacity = self.config.channel_capacity.max(1);
        let (event_tx, event_rx) = mpsc::channel(capacity);
        let (to_server_tx, from_worker) = mpsc::channel(capacity);
        let (to_worker, from_server_rx) = mpsc::channel(capacity);
        let ct = CancellationToken::new();

        let worker = SessionWorker {
            state: LifecycleState::Fresh,
            pending_initialize: None,
            next_http_request_id: 0,
            next_event_index: 0,
            to_server_tx,
            from_server_rx,
            event_rx,
            request_origin: HashMap::new(),
            request_tokens: HashMap::new(),
            progress_origin: HashMap::new(),
            streams: HashMap::new(),
            listener: None,
            history: VecDeque::new(),
            config: self.config.clone(),
            ct: ct.clone(),
        };
        tokio::spawn(
            worker
                .run()
                .instrument(tracing::info_span!("session-worker", session_id = %id)),
        );

        self.sessions.write().await.insert(
            id.clone(),
            SessionHandle {
                event_tx,
                ct,
                properties,
            },
        );
        tracing::info!(session_id = %id, "session created");

        Ok((
            id,
            WorkerTransport {
                to_worker: Some(to_worker),
                from_worker,
                started: false,
            },
        ))
    }

    async fn initialize_session(
        &self,
        id: &SessionId,
        message: JsonRpcMessage,
    ) -> Result<ServerSseMessage, SessionError> {
        self.dispatch(id, |responder| SessionEvent::Initialize { message, responder })
            .await
    }

    async fn has_session(&self, id: &SessionId) -> Result<bool, SessionError> {
        Ok(self.sessions.read().await.contains_key(id))
    }

    async fn is_initialized(&self, id: &SessionId) -> Result<bool, SessionError> {
        let event_tx = self.event_tx(id).await?;
        let (responder, response) = oneshot::channel();
        event_tx
            .send(SessionEvent::IsInitialized { responder })
            .await
            .map_err(|_| SessionError::SessionNotFound)?;
        response.await.map_err(|_| SessionError::SessionNotFound)
    }

    async fn close_session(&self, id: &SessionId) -> Result<(), SessionError> {
        if let Some(handle) = self.sessions.write().await.remove(id) {
            handle.ct.cancel();
            tracing::info!(session_id = %id, "session closed");
        }
        Ok(())
    }

    async fn create_stream(
        &self,
        id: &SessionId,
        messages: Vec<JsonRpcMessage>,
    ) -> Result<ReceiverStream<ServerSseMessage>, SessionError> {
        self.dispatch(id, |responder| SessionEvent::OpenRequestStream {
            messages,
            responder,
        })
        .await
    }

    async fn accept_messages(
        &self,
        id: &SessionId,
        messages: Vec<JsonRpcMessage>,
    ) -> Result<(), SessionError> {
        self.dispatch(id, |responder| SessionEvent::AcceptMessages {
            messages,
            responder,
        })
        .await
    }

    async fn create_standalone_stream(
        &self,
        id: &SessionId,
    ) -> Result<ReceiverStream<ServerSseMessage>, SessionError> {
        self.dispatch(id, |responder| SessionEvent::OpenListenerStream {
            last_event_id: None,
            responder,
        })
        .await
    }

    async fn resume(
        &self,
        id: &SessionId,
        last_event_id: String,
    ) -> Result<ReceiverStream<ServerSseMessage>, SessionError> {
        let cursor = EventId::from_str(last_event_id.trim())?;
        self.dispatch(id, |responder| SessionEvent::OpenListenerStream {
            last_event_id: Some(cursor),
            responder,
        })
        .await
    }
}

struct SessionWorker {
    state: LifecycleState,
    pending_initialize: Option<(
        RequestId,
        oneshot::Sender<Result<ServerSseMessage, SessionError>>,
    )>,
    next_http_request_id: HttpRequestId,
    next_event_index: u64,
    to_server_tx: mpsc::Sender<JsonRpcMessage>,
    from_server_rx: mpsc::Receiver<OutboundEnvelope>,
    event_rx: mpsc::Receiver<SessionEvent>,
    request_origin: HashMap<RequestId, HttpRequestId>,
    request_tokens: HashMap<RequestId, ProgressToken>,
    progress_origin: HashMap<ProgressToken, HttpRequestId>,
    streams: HashMap<HttpRequestId, RequestStream>,
    listener: Option<mpsc::Sender<ServerSseMessage>>,
    history: VecDeque<HistoryEntry>,
    config: SessionConfig,
    ct: CancellationToken,
}

impl SessionWorker {
    async fn run(mut self) {
        loop {
            tokio::select! {
                _ = self.ct.cancelled() => break,
                event = self.event_rx.recv() => match event {
                    Some(event) => self.handle_event(event).await,
                    None => break,
                },
                envelope = self.from_server_rx.recv() => match envelope {
                    Some(envelope) => self.handle_outbound(envelope).await,
                    // server dropped its transport; nothing can answer anymore
                    None => break,
                },
            }
        }
        tracing::debug!("session worker stopped");
    }

    async fn handle_event(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::Initialize { message, responder } => {
                if self.state != LifecycleState::Fresh {
                    let _ = responder.send(Err(SessionError::AlreadyInitialized));
                    return;
                }
                let id = match message.as_request() {
                    Some(request) if request.is_initialize() => request.id.clone(),
                    _ => {
                        let _ = responder.send(Err(SessionError::ExpectedInitializeRequest));
                        return;
                    }
                };
                if self.to_server_tx.send(message).await.is_err() {
                    let _ = responder.send(Err(SessionError::TransportClosed));
                    return;
                }
                self.state = LifecycleState::Initializing;
                self.pending_initialize = Some((id, responder));
            }
            SessionEvent::IsInitialized { responder } => {
                let _ = responder.send(self.state == LifecycleState::Initialized);
            }
            SessionEvent::OpenRequestStream {
                messages,
                responder,
            } => {
                if self.state != LifecycleState::Initialized {
                    let _ = responder.send(Err(SessionError::SessionNotFound));
                    return;
                }
                self.open_request_stream(messages, responder).await;
            }
            SessionEvent::AcceptMessages {
                messages,
                responder,
            } => {
                if self.state != LifecycleState::Initialized {
                    let _ = responder.send(Err(SessionError::SessionNotFound));
                    return;
                }
                for message in messages {
                    if message.is_initialize_request() {
                        tracing::warn!("dropping initialize request outside a response stream");
                        continue;
                    }
                    if self.to_server_tx.send(message).await.is_err() {
                        let _ = responder.send(Err(SessionError::TransportClosed));
                        return;
                    }
                }
                let _ = responder.send(Ok(()));
            }
            SessionEvent::OpenListenerStream {
                last_event_id,
                responder,
            } => {
                if self.state != LifecycleState::Initialized {
                    let _ = responder.send(Err(SessionError::SessionNotFound));
                    return;
                }
                self.open_listener_stream(last_event_id, responder);
            }
        }
    }

    async fn open_request_stream(
        &mut self,
        messages: Vec<JsonRpcMessage>,
        responder: oneshot::Sender<Result<ReceiverStream<ServerSseMessage>, SessionError>>,
    ) {
        let stream_id = self.next_http_request_id;
        self.next_http_request_id += 1;

        let mut outstanding = HashSet::new();
        let mut rejected_initialize = Vec::new();
        let mut accepted = Vec::new();
        for message in messages {
            let request_info = message
                .as_request()
                .map(|request| (request.id.clone(), request.is_initialize(), request.progress_token()));
            match request_info {
                // a second initialize on a live session is a lifecycle
                // violation, answered without reaching the server
                Some((id, true, _)) => {
                    outstanding.insert(id.clone());
                    rejected_initialize.push(id);
                }
                Some((id, false, token)) => {
                    outstanding.insert(id.clone());
                    self.request_origin.insert(id.clone(), stream_id);
                    if let Some(token) = token {
                        self.request_tokens.insert(id, token.clone());
                        self.progress_origin.insert(token, stream_id);
                    }
                    accepted.push(message);
                }
                None => accepted.push(message),
            }
        }

        for message in accepted {
            if self.to_server_tx.send(message).await.is_err() {
                self.drop_stream(stream_id);
                let _ = responder.send(Err(SessionError::TransportClosed));
                return;
            }
        }

        let (tx, rx) = mpsc::channel(self.config.channel_capacity.max(1));
        if !outstanding.is_empty() {
            self.streams.insert(stream_id, RequestStream { tx, outstanding });
        }
        // a batch with no requests yields a stream that ends immediately
        let _ = responder.send(Ok(ReceiverStream::new(rx)));

        for id in rejected_initialize {
            let error = JsonRpcMessage::error(
                Some(id.clone()),
                ErrorData::invalid_request("session already initialized"),
            );
            self.answer_on_stream(stream_id, id, error).await;
        }
    }

    fn open_listener_stream(
        &mut self,
        last_event_id: Option<EventId>,
        responder: oneshot::Sender<Result<ReceiverStream<ServerSseMessage>, SessionError>>,
    ) {
        let replay: Vec<ServerSseMessage> = match last_event_id {
            Some(cursor) => self
                .history
                .iter()
                .filter(|entry| {
                    entry.index > cursor.index
                        && (entry.stream.is_none() || entry.stream == cursor.stream)
                })
                .map(|entry| ServerSseMessage {
                    event_id: Some(
                        EventId {
                            index: entry.index,
                            stream: entry.stream,
                        }
                        .to_string(),
                    ),
                    message: entry.message.clone(),
                })
                .collect(),
            None => Vec::new(),
        };

        let capacity = self.config.channel_capacity.max(1) + replay.len();
        let (tx, rx) = mpsc::channel(capacity);
        for event in replay {
            // capacity covers the whole replay, so this cannot fail
            let _ = tx.try_send(event);
        }
        // a new listener replaces the previous one, whose stream ends
        if self.listener.replace(tx).is_some() {
            tracing::debug!("listener stream replaced");
        }
        let _ = responder.send(Ok(ReceiverStream::new(rx)));
    }

    async fn handle_outbound(&mut self, envelope: OutboundEnvelope) {
        let OutboundEnvelope { message, related } = envelope;

        if let Some(id) = message.response_id().cloned() {
            // the initialize reply resolves the pending handshake instead of
            // routing through a stream
            if let Some((pending_id, responder)) = self.pending_initialize.take() {
                if pending_id == id {
                    let event_id = self.allocate_event_id(None);
                    // a rejected initialize leaves the session fresh
                    self.state = match &message {
                        JsonRpcMessage::Error(_) => LifecycleState::Fresh,
                        _ => LifecycleState::Initialized,
                    };
                    let _ = responder.send(Ok(ServerSseMessage {
                        event_id: Some(event_id),
                        message,
                    }));
                    return;
                }
                self.pending_initialize = Some((pending_id, responder));
            }

            if let Some(token) = self.request_tokens.remove(&id) {
                self.progress_origin.remove(&token);
            }
            match self.request_origin.remove(&id) {
                Some(stream_id) if self.streams.contains_key(&stream_id) => {
                    self.answer_on_stream(stream_id, id, message).await;
                }
                _ => {
                    tracing::debug!(%id, "origin stream gone, response diverted");
                    self.send_on_listener(message).await;
                }
            }
        } else {
            // server-initiated request or notification: prefer the stream
            // carrying the related request, then a matching progress token,
            // then the listener
            let target = related
                .as_ref()
                .and_then(|request_id| self.request_origin.get(request_id).copied())
                .or_else(|| self.progress_target(&message));
            match target {
                Some(stream_id) if self.streams.contains_key(&stream_id) => {
                    self.send_on_stream(stream_id, message).await;
                }
                _ => self.send_on_listener(message).await,
            }
        }
    }

    fn progress_target(&self, message: &JsonRpcMessage) -> Option<HttpRequestId> {
        let JsonRpcMessage::Notification(notification) = message else {
            return None;
        };
        let token = notification.progress_token()?;
        self.progress_origin.get(&token).copied()
    }

    /// Deliver a response on its origin stream and retire the answered
    /// request; the stream closes once its outstanding set empties.
    async fn answer_on_stream(
        &mut self,
        stream_id: HttpRequestId,
        answered: RequestId,
        message: JsonRpcMessage,
    ) {
        let event_id = self.stamp(Some(stream_id), message.clone());
        let delivered = match self.streams.get_mut(&stream_id) {
            Some(stream) => {
                match stream
                    .tx
                    .send(ServerSseMessage {
                        event_id: Some(event_id),
                        message,
                    })
                    .await
                {
                    Ok(()) => {
                        stream.outstanding.remove(&answered);
                        Some(stream.outstanding.is_empty())
                    }
                    Err(_) => None,
                }
            }
            None => return,
        };
        match delivered {
            Some(true) => {
                self.streams.remove(&stream_id);
            }
            Some(false) => {}
            // client went away mid-request; history keeps the event
            None => self.drop_stream(stream_id),
        }
    }

    async fn send_on_stream(&mut self, stream_id: HttpRequestId, message: JsonRpcMessage) {
        let event_id = self.stamp(Some(stream_id), message.clone());
        let Some(stream) = self.streams.get_mut(&stream_id) else {
            return;
        };
        if stream
            .tx
            .send(ServerSseMessage {
                event_id: Some(event_id),
                message,
            })
            .await
            .is_err()
        {
            self.drop_stream(stream_id);
        }
    }

    async fn send_on_listener(&mut self, message: JsonRpcMessage) {
        let event_id = self.stamp(None, message.clone());
        let Some(listener) = self.listener.clone() else {
            // no listener; the event stays in history for replay
            return;
        };
        if listener
            .send(ServerSseMessage {
                event_id: Some(event_id),
                message,
            })
            .await
            .is_err()
        {
            self.listener = None;
        }
    }

    /// Record an event in the bounded history and hand back its id.
    fn stamp(&mut self, stream: Option<HttpRequestId>, message: JsonRpcMessage) -> String {
        let index = self.next_event_index;
        self.next_event_index += 1;
        self.history.push_back(HistoryEntry {
            index,
            stream,
            message,
        });
        while self.history.len() > self.config.history_capacity {
            self.history.pop_front();
        }
        EventId { index, stream }.to_string()
    }

    fn allocate_event_id(&mut self, stream: Option<HttpRequestId>) -> String {
        let index = self.next_event_index;
        self.next_event_index += 1;
        EventId { index, stream }.to_string()
    }

    /// Remove a dead stream and every correlation pointing at it.
    fn drop_stream(&mut self, stream_id: HttpRequestId) {
        self.streams.remove(&stream_id);
        self.request_origin.retain(|_, origin| *origin != stream_id);
        self.progress_origin.retain(|_, origin| *origin != stream_id);
    }
}
