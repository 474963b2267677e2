#![cfg_attr(docsrs, feature(doc_cfg))]
//! A session-oriented MCP gateway.
//!
//! The crate multiplexes bidirectional JSON-RPC 2.0 between remote clients
//! and in-process MCP servers over three wire transports: the legacy SSE
//! transport, the streamable HTTP transport (stateful and stateless), and
//! WebSocket. Applications implement [`McpAgent`] and mount one of the
//! transports; everything MCP-specific beyond the lifecycle stays inside the
//! application's server.

mod error;
pub use error::RelayError;

pub mod handler;
pub mod model;
pub mod transport;

pub use handler::{AgentError, McpAgent, McpServer, Properties, serve_agent};
pub use model::ErrorData;
pub use transport::{SessionId, Transport, TransportError};
