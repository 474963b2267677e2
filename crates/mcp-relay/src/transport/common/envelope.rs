//! Per-request HTTP envelope validation.
//!
//! Every check runs before any session state is touched; the first failure
//! short-circuits into a JSON-RPC error with `id: null` and the matching
//! HTTP status.

use http::{StatusCode, request::Parts};

use super::{
    http_header::{EVENT_STREAM_MIME_TYPE, HEADER_SESSION_ID, JSON_MIME_TYPE},
    server_side_http::BoxResponse,
};
use crate::model::{ErrorData, JsonRpcBatch, JsonRpcMessage};

/// An envelope violation: which HTTP status to answer with and the JSON-RPC
/// error carried in the body.
#[derive(Debug)]
pub struct EnvelopeError {
    pub status: StatusCode,
    pub error: ErrorData,
}

impl EnvelopeError {
    pub(crate) fn new(status: StatusCode, error: ErrorData) -> Self {
        Self { status, error }
    }

    pub(crate) fn into_response(self) -> BoxResponse {
        super::server_side_http::json_rpc_error_response(self.status, self.error)
    }
}

impl From<(StatusCode, ErrorData)> for EnvelopeError {
    fn from((status, error): (StatusCode, ErrorData)) -> Self {
        Self { status, error }
    }
}

fn header_str<'a>(parts: &'a Parts, name: &str) -> Option<&'a str> {
    parts.headers.get(name).and_then(|value| value.to_str().ok())
}

/// The `mcp-session-id` header, when present and well-formed.
pub(crate) fn session_id_header(parts: &Parts) -> Result<Option<&str>, EnvelopeError> {
    match parts.headers.get(HEADER_SESSION_ID) {
        None => Ok(None),
        Some(value) => value.to_str().map(Some).map_err(|_| {
            EnvelopeError::new(
                StatusCode::BAD_REQUEST,
                ErrorData::bad_request("mcp-session-id header is not printable ASCII"),
            )
        }),
    }
}

/// Checks common to every POST at the streamable endpoint, in order: accept,
/// content type, declared length.
pub(crate) fn check_post_headers(
    parts: &Parts,
    max_body_bytes: usize,
) -> Result<(), EnvelopeError> {
    let accept = header_str(parts, http::header::ACCEPT.as_str());
    if !accept.is_some_and(|accept| {
        accept.contains(JSON_MIME_TYPE) && accept.contains(EVENT_STREAM_MIME_TYPE)
    }) {
        return Err(EnvelopeError::new(
            StatusCode::NOT_ACCEPTABLE,
            ErrorData::bad_request(
                "Accept must include both application/json and text/event-stream",
            ),
        ));
    }

    let content_type = header_str(parts, http::header::CONTENT_TYPE.as_str());
    if !content_type.is_some_and(|content_type| content_type.starts_with(JSON_MIME_TYPE)) {
        return Err(EnvelopeError::new(
            StatusCode::UNSUPPORTED_MEDIA_TYPE,
            ErrorData::bad_request("Content-Type must be application/json"),
        ));
    }

    if let Some(length) = header_str(parts, http::header::CONTENT_LENGTH.as_str())
        .and_then(|value| value.parse::<u64>().ok())
        && length > max_body_bytes as u64
    {
        return Err(EnvelopeError::new(
            StatusCode::PAYLOAD_TOO_LARGE,
            ErrorData::bad_request("request body exceeds the 4 MiB limit"),
        ));
    }

    Ok(())
}

/// A GET opening an event stream must accept `text/event-stream`.
pub(crate) fn check_get_headers(parts: &Parts) -> Result<(), EnvelopeError> {
    let accept = header_str(parts, http::header::ACCEPT.as_str());
    if !accept.is_some_and(|accept| accept.contains(EVENT_STREAM_MIME_TYPE)) {
        return Err(EnvelopeError::new(
            StatusCode::NOT_ACCEPTABLE,
            ErrorData::bad_request("Accept must include text/event-stream"),
        ));
    }
    Ok(())
}

/// Parse a POST body into its messages, preserving wire order.
pub(crate) fn parse_messages(body: &[u8]) -> Result<Vec<JsonRpcMessage>, EnvelopeError> {
    let batch: JsonRpcBatch = serde_json::from_slice(body).map_err(|error| {
        EnvelopeError::new(
            StatusCode::BAD_REQUEST,
            ErrorData::parse_error(format!("invalid JSON-RPC payload: {error}")),
        )
    })?;
    if batch.is_empty() {
        return Err(EnvelopeError::new(
            StatusCode::BAD_REQUEST,
            ErrorData::invalid_request("empty batch"),
        ));
    }
    Ok(batch.into_messages())
}

/// MCP lifecycle rules tying the batch to the session header: an
/// `initialize` request must travel alone and without a session id; anything
/// else needs the session id.
pub(crate) fn check_lifecycle(
    messages: &[JsonRpcMessage],
    session_id: Option<&str>,
) -> Result<(), EnvelopeError> {
    let has_initialize = messages
        .iter()
        .any(JsonRpcMessage::is_initialize_request);
    if has_initialize {
        if messages.len() != 1 {
            return Err(EnvelopeError::new(
                StatusCode::BAD_REQUEST,
                ErrorData::invalid_request("initialize request must not be batched"),
            ));
        }
        if session_id.is_some() {
            return Err(EnvelopeError::new(
                StatusCode::BAD_REQUEST,
                ErrorData::invalid_request(
                    "initialize request must not carry an mcp-session-id header",
                ),
            ));
        }
    } else if session_id.is_none() {
        return Err(EnvelopeError::new(
            StatusCode::BAD_REQUEST,
            ErrorData::bad_request("missing mcp-session-id header"),
        ));
    }
    Ok(())
}
