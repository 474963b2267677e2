use std::fmt::Display;

pub use crate::model::ErrorData;

impl Display for ErrorData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code.0, self.message)?;
        if let Some(data) = &self.data {
            write!(f, "({})", data)?;
        }
        Ok(())
    }
}

impl std::error::Error for ErrorData {}

/// Unified error type for failures the gateway itself can produce.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("transport error: {0}")]
    Transport(#[from] crate::transport::TransportError),
    #[error("agent error: {0}")]
    Agent(#[from] crate::handler::AgentError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}
