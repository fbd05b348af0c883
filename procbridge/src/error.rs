//! Error taxonomy for the bridge.

use std::time::Duration;

use crate::bridge::protocol::RequestId;

/// Failure surfaced to a bridge caller.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BridgeError {
    /// No matching response arrived before the request deadline.
    #[error("request {id} timed out after {}ms", .elapsed.as_millis())]
    Timeout { id: RequestId, elapsed: Duration },

    /// The worker exited with the request in flight, or the supervisor is
    /// faulted or stopped.
    #[error("worker unavailable: {reason}")]
    WorkerUnavailable { reason: String },

    /// The worker answered with `{"error": ...}`.
    #[error("worker reported error for request {id}: {message}")]
    Worker { id: RequestId, message: String },

    /// The payload could not be turned into a request line.
    #[error("invalid payload: {0}")]
    InvalidPayload(String),
}

impl BridgeError {
    pub fn unavailable(reason: impl Into<String>) -> Self {
        Self::WorkerUnavailable {
            reason: reason.into(),
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::WorkerUnavailable { .. })
    }
}

/// A framed unit that could not be decoded. Scoped to that unit only.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("malformed message: {reason} (line starts {snippet:?})")]
    Malformed { reason: String, snippet: String },

    #[error("line exceeds {limit} bytes")]
    LineTooLong { limit: usize },
}

const SNIPPET_LEN: usize = 80;

impl ProtocolError {
    pub(crate) fn malformed(line: &[u8], err: &serde_json::Error) -> Self {
        let text = String::from_utf8_lossy(line);
        let snippet = match text.char_indices().nth(SNIPPET_LEN) {
            Some((idx, _)) => format!("{}...", &text[..idx]),
            None => text.into_owned(),
        };
        Self::Malformed {
            reason: err.to_string(),
            snippet,
        }
    }
}

/// Failure to start a worker process.
#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error("failed to spawn process: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("spawn failed: {0}")]
    Other(String),
}

/// Invalid or missing configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    Missing(&'static str),
    #[error("invalid value {value:?} for {key}: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}
