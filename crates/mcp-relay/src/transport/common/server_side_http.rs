//! Server-side HTTP plumbing: SSE framing, keep-alive, response builders and
//! body collection shared by the streamable HTTP service and the routers.

use std::{
    convert::Infallible,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
    time::Duration,
};

use bytes::Bytes;
use futures::{Stream, StreamExt};
use http::{HeaderValue, Response, StatusCode, header};
use http_body::Frame;
use http_body_util::{BodyExt, Empty, Full, StreamBody, combinators::UnsyncBoxBody};

use super::http_header::{EVENT_STREAM_MIME_TYPE, HEADER_X_ACCEL_BUFFERING, JSON_MIME_TYPE};
use crate::{
    handler::Properties,
    model::{ErrorData, JsonRpcMessage},
    transport::SessionId,
};

/// Ping cadence on otherwise idle SSE streams.
pub const DEFAULT_AUTO_PING_INTERVAL: Duration = Duration::from_secs(15);

/// Envelope limit: bodies above this are rejected before parsing.
pub const DEFAULT_MAX_BODY_BYTES: usize = 4 * 1024 * 1024;

pub fn session_id() -> SessionId {
    uuid::Uuid::new_v4().to_string().into()
}

/// Derives session [`Properties`] from the request head, e.g. claims placed
/// there by an authentication layer running in front of the gateway.
pub type PropertyExtractor = Arc<dyn Fn(&http::request::Parts) -> Properties + Send + Sync>;

/// One event bound for an SSE stream: the message plus the `id:` line it
/// will carry, when it has one.
#[derive(Debug, Clone)]
pub struct ServerSseMessage {
    pub event_id: Option<String>,
    pub message: JsonRpcMessage,
}

/// HTTP response type of the streamable service: a full body or an unbounded
/// event stream behind one boxed type.
pub type BoxResponse = Response<UnsyncBoxBody<Bytes, Infallible>>;

pub(crate) fn sse_frame(message: &ServerSseMessage) -> Bytes {
    let data = serde_json::to_string(&message.message).unwrap_or_else(|_| "{}".to_string());
    let mut out = String::with_capacity(data.len() + 32);
    if let Some(id) = &message.event_id {
        out.push_str("id: ");
        out.push_str(id);
        out.push('\n');
    }
    out.push_str("event: message\ndata: ");
    out.push_str(&data);
    out.push_str("\n\n");
    Bytes::from(out)
}

pub(crate) fn sse_ping() -> Bytes {
    Bytes::from_static(b": ping\n\n")
}

pin_project_lite::pin_project! {
    /// Interleaves `: ping` comment frames into an idle byte stream so
    /// intermediaries do not reap the connection.
    pub(crate) struct KeepAliveStream<S> {
        #[pin]
        inner: S,
        interval: Option<tokio::time::Interval>,
    }
}

impl<S> KeepAliveStream<S> {
    pub(crate) fn new(inner: S, keep_alive: Option<Duration>) -> Self {
        let interval = keep_alive.map(|period| {
            let mut interval = tokio::time::interval(period);
            // the first tick of a fresh interval fires immediately
            interval.reset();
            interval
        });
        Self { inner, interval }
    }
}

impl<S> Stream for KeepAliveStream<S>
where
    S: Stream<Item = Bytes>,
{
    type Item = Bytes;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.project();
        match this.inner.poll_next(cx) {
            Poll::Ready(Some(item)) => {
                if let Some(interval) = this.interval {
                    interval.reset();
                }
                Poll::Ready(Some(item))
            }
            Poll::Ready(None) => Poll::Ready(None),
            Poll::Pending => match this.interval {
                Some(interval) => match interval.poll_tick(cx) {
                    Poll::Ready(_) => Poll::Ready(Some(sse_ping())),
                    Poll::Pending => Poll::Pending,
                },
                None => Poll::Pending,
            },
        }
    }
}

/// Render a stream of server messages as a `text/event-stream` response.
pub(crate) fn sse_stream_response<S>(stream: S, keep_alive: Option<Duration>) -> BoxResponse
where
    S: Stream<Item = ServerSseMessage> + Send + 'static,
{
    let frames = KeepAliveStream::new(stream.map(|message| sse_frame(&message)), keep_alive)
        .map(|bytes| Ok::<_, Infallible>(Frame::data(bytes)));
    let mut response = Response::new(StreamBody::new(frames).boxed_unsync());
    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static(EVENT_STREAM_MIME_TYPE),
    );
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    headers.insert(HEADER_X_ACCEL_BUFFERING, HeaderValue::from_static("no"));
    response
}

/// A JSON-RPC error with `id: null` as a JSON body with the given status.
pub(crate) fn json_rpc_error_response(status: StatusCode, error: ErrorData) -> BoxResponse {
    let body = serde_json::to_vec(&JsonRpcMessage::error(None, error)).unwrap_or_default();
    let mut response = Response::new(Full::new(Bytes::from(body)).boxed_unsync());
    *response.status_mut() = status;
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static(JSON_MIME_TYPE),
    );
    response
}

pub(crate) fn empty_response(status: StatusCode) -> BoxResponse {
    let mut response = Response::new(Empty::<Bytes>::new().boxed_unsync());
    *response.status_mut() = status;
    response
}

pub(crate) fn accepted_response() -> BoxResponse {
    empty_response(StatusCode::ACCEPTED)
}

/// Buffer a request body, enforcing the byte limit even when the peer lied
/// about (or omitted) `Content-Length`.
pub(crate) async fn collect_body<B>(body: B, limit: usize) -> Result<Bytes, (StatusCode, ErrorData)>
where
    B: http_body::Body<Data = Bytes>,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    match http_body_util::Limited::new(body, limit).collect().await {
        Ok(collected) => Ok(collected.to_bytes()),
        Err(error) if error.is::<http_body_util::LengthLimitError>() => Err((
            StatusCode::PAYLOAD_TOO_LARGE,
            ErrorData::bad_request("request body exceeds the 4 MiB limit"),
        )),
        Err(_) => Err((
            StatusCode::BAD_REQUEST,
            ErrorData::bad_request("failed to read request body"),
        )),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn sse_frame_includes_id_and_event() {
        let frame = sse_frame(&ServerSseMessage {
            event_id: Some("3".to_string()),
            message: JsonRpcMessage::response(1.into(), json!({"ok": true})),
        });
        let text = std::str::from_utf8(&frame).unwrap();
        assert!(text.starts_with("id: 3\nevent: message\ndata: "));
        assert!(text.ends_with("\n\n"));
    }

    #[test]
    fn sse_frame_without_id() {
        let frame = sse_frame(&ServerSseMessage {
            event_id: None,
            message: JsonRpcMessage::notification("notifications/message", None),
        });
        let text = std::str::from_utf8(&frame).unwrap();
        assert!(text.starts_with("event: message\n"));
    }

    #[tokio::test]
    async fn collect_body_enforces_limit() {
        let body = Full::new(Bytes::from(vec![0u8; 64]));
        let (status, error) = collect_body(body, 16).await.unwrap_err();
        assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
        assert_eq!(error.code, crate::model::ErrorCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn collect_body_passes_small_payloads() {
        let body = Full::new(Bytes::from_static(b"{}"));
        let bytes = collect_body(body, 16).await.unwrap();
        assert_eq!(&bytes[..], b"{}");
    }

    #[tokio::test]
    async fn keep_alive_pings_idle_streams() {
        let idle = futures::stream::pending::<Bytes>();
        let mut stream = KeepAliveStream::new(idle, Some(Duration::from_millis(5)));
        let ping = tokio::time::timeout(Duration::from_millis(100), stream.next())
            .await
            .expect("expected a ping before the timeout")
            .expect("stream should not end");
        assert_eq!(&ping[..], b": ping\n\n");
    }
}
