//! JSON-RPC 2.0 wire types and message classification.
//!
//! The gateway treats payloads as opaque JSON-RPC values: a message is
//! classified by shape (request / notification / response / error), never by
//! the MCP method it carries. The only method the transport layer inspects is
//! `initialize`, which drives the session lifecycle.

use std::{borrow::Cow, fmt, sync::Arc};

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Method name of the lifecycle request that creates a session.
pub const INITIALIZE_METHOD: &str = "initialize";
/// Method name of progress notifications, routed by their `progressToken`.
pub const PROGRESS_NOTIFICATION_METHOD: &str = "notifications/progress";

/// The literal `"2.0"` version tag.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JsonRpcVersion2_0;

impl Serialize for JsonRpcVersion2_0 {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str("2.0")
    }
}

impl<'de> Deserialize<'de> for JsonRpcVersion2_0 {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let version: Cow<'de, str> = Deserialize::deserialize(deserializer)?;
        if version == "2.0" {
            Ok(JsonRpcVersion2_0)
        } else {
            Err(serde::de::Error::custom(format!(
                "unsupported JSON-RPC version: {version}"
            )))
        }
    }
}

/// A JSON-RPC request id: a number or a string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    Number(i64),
    String(Arc<str>),
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestId::Number(n) => n.fmt(f),
            RequestId::String(s) => s.fmt(f),
        }
    }
}

impl From<i64> for RequestId {
    fn from(value: i64) -> Self {
        RequestId::Number(value)
    }
}

impl From<&str> for RequestId {
    fn from(value: &str) -> Self {
        RequestId::String(value.into())
    }
}

impl From<String> for RequestId {
    fn from(value: String) -> Self {
        RequestId::String(value.into())
    }
}

/// The `progressToken` a client may attach to a request's `_meta`. Shares the
/// number-or-string representation of [`RequestId`] but is unrelated to any
/// request id on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProgressToken(pub RequestId);

/// A JSON-RPC error code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ErrorCode(pub i32);

impl ErrorCode {
    pub const PARSE_ERROR: Self = Self(-32700);
    pub const INVALID_REQUEST: Self = Self(-32600);
    pub const METHOD_NOT_FOUND: Self = Self(-32601);
    pub const INVALID_PARAMS: Self = Self(-32602);
    pub const INTERNAL_ERROR: Self = Self(-32603);
    /// Generic bad request: unacceptable media type, accept header, size or
    /// HTTP method.
    pub const BAD_REQUEST: Self = Self(-32000);
    /// The addressed session does not exist or could not be established.
    pub const SESSION_NOT_FOUND: Self = Self(-32001);
}

/// The `error` member of a JSON-RPC error message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorData {
    pub code: ErrorCode,
    pub message: Cow<'static, str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl ErrorData {
    pub fn new(
        code: ErrorCode,
        message: impl Into<Cow<'static, str>>,
        data: Option<Value>,
    ) -> Self {
        Self {
            code,
            message: message.into(),
            data,
        }
    }

    pub fn parse_error(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorCode::PARSE_ERROR, message, None)
    }

    pub fn invalid_request(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorCode::INVALID_REQUEST, message, None)
    }

    pub fn method_not_found(method: &str) -> Self {
        Self::new(
            ErrorCode::METHOD_NOT_FOUND,
            format!("method not found: {method}"),
            None,
        )
    }

    pub fn invalid_params(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorCode::INVALID_PARAMS, message, None)
    }

    pub fn internal_error(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorCode::INTERNAL_ERROR, message, None)
    }

    pub fn bad_request(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorCode::BAD_REQUEST, message, None)
    }

    pub fn session_not_found(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorCode::SESSION_NOT_FOUND, message, None)
    }
}

/// A client→server call expecting a response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    #[serde(default)]
    pub jsonrpc: JsonRpcVersion2_0,
    pub id: RequestId,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcRequest {
    pub fn is_initialize(&self) -> bool {
        self.method == INITIALIZE_METHOD
    }

    /// The `params._meta.progressToken` of this request, when present.
    pub fn progress_token(&self) -> Option<ProgressToken> {
        let token = self.params.as_ref()?.get("_meta")?.get("progressToken")?;
        serde_json::from_value(token.clone()).ok()
    }
}

/// A one-way message; no response will ever be produced for it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcNotification {
    #[serde(default)]
    pub jsonrpc: JsonRpcVersion2_0,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcNotification {
    /// The `params.progressToken` of a progress notification.
    pub fn progress_token(&self) -> Option<ProgressToken> {
        if self.method != PROGRESS_NOTIFICATION_METHOD {
            return None;
        }
        let token = self.params.as_ref()?.get("progressToken")?;
        serde_json::from_value(token.clone()).ok()
    }
}

/// A successful reply to a request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    #[serde(default)]
    pub jsonrpc: JsonRpcVersion2_0,
    pub id: RequestId,
    pub result: Value,
}

/// A failed reply. `id` is `null` when the failure could not be correlated
/// with any request (e.g. a parse error).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcError {
    #[serde(default)]
    pub jsonrpc: JsonRpcVersion2_0,
    pub id: Option<RequestId>,
    pub error: ErrorData,
}

/// Any JSON-RPC 2.0 value, classified by shape.
///
/// Classification tie-breaks: `id` + `method` is a request, `method` alone a
/// notification, `id` + `result` a response, `id` + `error` an error. Values
/// matching none of these fail deserialization, which callers surface as a
/// `-32700` parse error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum JsonRpcMessage {
    Request(JsonRpcRequest),
    Response(JsonRpcResponse),
    Error(JsonRpcError),
    Notification(JsonRpcNotification),
}

impl JsonRpcMessage {
    pub fn request(id: impl Into<RequestId>, method: impl Into<String>, params: Option<Value>) -> Self {
        JsonRpcMessage::Request(JsonRpcRequest {
            jsonrpc: JsonRpcVersion2_0,
            id: id.into(),
            method: method.into(),
            params,
        })
    }

    pub fn notification(method: impl Into<String>, params: Option<Value>) -> Self {
        JsonRpcMessage::Notification(JsonRpcNotification {
            jsonrpc: JsonRpcVersion2_0,
            method: method.into(),
            params,
        })
    }

    pub fn response(id: RequestId, result: Value) -> Self {
        JsonRpcMessage::Response(JsonRpcResponse {
            jsonrpc: JsonRpcVersion2_0,
            id,
            result,
        })
    }

    pub fn error(id: Option<RequestId>, error: ErrorData) -> Self {
        JsonRpcMessage::Error(JsonRpcError {
            jsonrpc: JsonRpcVersion2_0,
            id,
            error,
        })
    }

    pub fn is_request(&self) -> bool {
        matches!(self, JsonRpcMessage::Request(_))
    }

    pub fn as_request(&self) -> Option<&JsonRpcRequest> {
        match self {
            JsonRpcMessage::Request(request) => Some(request),
            _ => None,
        }
    }

    pub fn is_initialize_request(&self) -> bool {
        self.as_request().is_some_and(JsonRpcRequest::is_initialize)
    }

    /// For a response or error, the id of the request being answered.
    pub fn response_id(&self) -> Option<&RequestId> {
        match self {
            JsonRpcMessage::Response(response) => Some(&response.id),
            JsonRpcMessage::Error(error) => error.id.as_ref(),
            _ => None,
        }
    }
}

/// A POST body: one message or a JSON array of messages, wire order preserved.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum JsonRpcBatch {
    Single(JsonRpcMessage),
    Batch(Vec<JsonRpcMessage>),
}

impl JsonRpcBatch {
    pub fn is_batch(&self) -> bool {
        matches!(self, JsonRpcBatch::Batch(_))
    }

    pub fn len(&self) -> usize {
        match self {
            JsonRpcBatch::Single(_) => 1,
            JsonRpcBatch::Batch(messages) => messages.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn into_messages(self) -> Vec<JsonRpcMessage> {
        match self {
            JsonRpcBatch::Single(message) => vec![message],
            JsonRpcBatch::Batch(messages) => messages,
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn classify_request() {
        let message: JsonRpcMessage = serde_json::from_value(json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": "tools/call",
            "params": {"name": "greet"}
        }))
        .unwrap();
        let JsonRpcMessage::Request(request) = message else {
            panic!("expected request");
        };
        assert_eq!(request.id, RequestId::Number(1));
        assert_eq!(request.method, "tools/call");
    }

    #[test]
    fn classify_notification() {
        let message: JsonRpcMessage = serde_json::from_value(json!({
            "jsonrpc": "2.0",
            "method": "notifications/initialized"
        }))
        .unwrap();
        assert!(matches!(message, JsonRpcMessage::Notification(_)));
    }

    #[test]
    fn classify_response() {
        let message: JsonRpcMessage = serde_json::from_value(json!({
            "jsonrpc": "2.0",
            "id": "abc",
            "result": {}
        }))
        .unwrap();
        let JsonRpcMessage::Response(response) = message else {
            panic!("expected response");
        };
        assert_eq!(response.id, RequestId::String("abc".into()));
    }

    #[test]
    fn classify_error() {
        let message: JsonRpcMessage = serde_json::from_value(json!({
            "jsonrpc": "2.0",
            "id": null,
            "error": {"code": -32700, "message": "Parse error"}
        }))
        .unwrap();
        let JsonRpcMessage::Error(error) = message else {
            panic!("expected error");
        };
        assert_eq!(error.id, None);
        assert_eq!(error.error.code, ErrorCode::PARSE_ERROR);
    }

    #[test]
    fn id_and_method_wins_over_extra_members() {
        // Tie-break: presence of both id and method classifies as a request,
        // whatever else the object carries.
        let message: JsonRpcMessage = serde_json::from_value(json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": "ping",
            "extra": true
        }))
        .unwrap();
        assert!(message.is_request());
    }

    #[test]
    fn missing_version_tag_is_tolerated() {
        let message: JsonRpcMessage =
            serde_json::from_value(json!({"id": 2, "method": "ping"})).unwrap();
        assert!(message.is_request());
    }

    #[test]
    fn wrong_version_tag_is_rejected() {
        let result: Result<JsonRpcMessage, _> =
            serde_json::from_value(json!({"jsonrpc": "1.0", "id": 2, "method": "ping"}));
        assert!(result.is_err());
    }

    #[test]
    fn unclassifiable_value_is_rejected() {
        let result: Result<JsonRpcMessage, _> =
            serde_json::from_value(json!({"jsonrpc": "2.0", "foo": "bar"}));
        assert!(result.is_err());
    }

    #[test]
    fn batch_preserves_wire_order() {
        let batch: JsonRpcBatch = serde_json::from_value(json!([
            {"jsonrpc": "2.0", "id": 2, "method": "ping"},
            {"jsonrpc": "2.0", "method": "notifications/initialized"},
            {"jsonrpc": "2.0", "id": 1, "method": "ping"}
        ]))
        .unwrap();
        assert!(batch.is_batch());
        let messages = batch.into_messages();
        assert_eq!(messages.len(), 3);
        assert_eq!(
            messages[0].as_request().map(|r| &r.id),
            Some(&RequestId::Number(2))
        );
        assert!(matches!(messages[1], JsonRpcMessage::Notification(_)));
        assert_eq!(
            messages[2].as_request().map(|r| &r.id),
            Some(&RequestId::Number(1))
        );
    }

    #[test]
    fn single_message_body_is_accepted() {
        let batch: JsonRpcBatch =
            serde_json::from_value(json!({"jsonrpc": "2.0", "id": 1, "method": "initialize"}))
                .unwrap();
        assert!(!batch.is_batch());
        assert!(batch.into_messages()[0].is_initialize_request());
    }

    #[test]
    fn error_serializes_null_id() {
        let message = JsonRpcMessage::error(None, ErrorData::parse_error("bad json"));
        let value = serde_json::to_value(&message).unwrap();
        assert_eq!(value["jsonrpc"], "2.0");
        assert_eq!(value["id"], Value::Null);
        assert_eq!(value["error"]["code"], -32700);
    }

    #[test]
    fn request_progress_token() {
        let message: JsonRpcMessage = serde_json::from_value(json!({
            "jsonrpc": "2.0",
            "id": 7,
            "method": "tools/call",
            "params": {"name": "slow", "_meta": {"progressToken": "tok-1"}}
        }))
        .unwrap();
        let token = message.as_request().unwrap().progress_token().unwrap();
        assert_eq!(token, ProgressToken(RequestId::String("tok-1".into())));
    }

    #[test]
    fn notification_progress_token() {
        let JsonRpcMessage::Notification(notification) = serde_json::from_value(json!({
            "jsonrpc": "2.0",
            "method": "notifications/progress",
            "params": {"progressToken": 3, "progress": 50}
        }))
        .unwrap() else {
            panic!("expected notification");
        };
        assert_eq!(
            notification.progress_token(),
            Some(ProgressToken(RequestId::Number(3)))
        );
    }
}
