//! Streamable HTTP server transport.
//!
//! One endpoint, three methods: POST carries client→server JSON-RPC (single
//! messages or batches) and answers over a per-request SSE stream, GET opens
//! a listener stream for server-initiated traffic (resumable with
//! `Last-Event-ID`), DELETE tears the session down. The service is a plain
//! [`tower_service::Service`] over `http` types, so it mounts in any
//! tower-compatible server (axum, hyper) at any path.

use std::{fmt, time::Duration};

use crate::transport::common::server_side_http::{
    DEFAULT_AUTO_PING_INTERVAL, DEFAULT_MAX_BODY_BYTES, PropertyExtractor,
};

pub mod session;
pub mod tower;

pub use session::{SessionManager, local::LocalSessionManager};
pub use tower::StreamableHttpService;

/// Configuration for the streamable HTTP server.
#[derive(Clone)]
pub struct StreamableHttpServerConfig {
    /// The ping message duration for SSE connections.
    pub sse_keep_alive: Option<Duration>,
    /// If true, the server creates a session per `initialize` and keeps it
    /// alive; if false, every POST is served by a fresh, throwaway server
    /// instance and session headers are rejected.
    pub stateful_mode: bool,
    /// Bodies larger than this are rejected before parsing.
    pub max_body_bytes: usize,
    /// CORS preflight answers; `None` disables OPTIONS handling.
    pub cors: Option<CorsConfig>,
    /// Derives session properties from the request head at initialization.
    pub property_extractor: Option<PropertyExtractor>,
}

impl Default for StreamableHttpServerConfig {
    fn default() -> Self {
        Self {
            sse_keep_alive: Some(DEFAULT_AUTO_PING_INTERVAL),
            stateful_mode: true,
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
            cors: Some(CorsConfig::default()),
            property_extractor: None,
        }
    }
}

impl fmt::Debug for StreamableHttpServerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamableHttpServerConfig")
            .field("sse_keep_alive", &self.sse_keep_alive)
            .field("stateful_mode", &self.stateful_mode)
            .field("max_body_bytes", &self.max_body_bytes)
            .field("cors", &self.cors)
            .field(
                "property_extractor",
                &self.property_extractor.as_ref().map(|_| ".."),
            )
            .finish()
    }
}

/// Headers emitted on CORS preflight and simple responses.
#[derive(Debug, Clone)]
pub struct CorsConfig {
    pub allow_origin: String,
    pub allow_methods: String,
    pub allow_headers: String,
    pub max_age_secs: u64,
}

impl Default for CorsConfig {
    fn default() -> Self {
        Self {
            allow_origin: "*".to_string(),
            allow_methods: "GET, POST, DELETE, OPTIONS".to_string(),
            allow_headers: "content-type, mcp-session-id, last-event-id".to_string(),
            max_age_secs: 86400,
        }
    }
}
