//! Transport-level error types.

use thiserror::Error;

use crate::request::JsonRpcError;

/// Errors that can occur while sending an RPC request.
///
/// A failed request rejects only its own caller; sibling requests in the
/// same queue are unaffected. Retries are the caller's responsibility.
#[derive(Debug, Error)]
pub enum TransportError {
    /// HTTP request failed (connection refused, timeout, etc.).
    #[error("HTTP error: {0}")]
    Http(String),

    /// JSON-RPC protocol-level error returned by the node.
    #[error("RPC error {}: {}", .0.code, .0.message)]
    Rpc(JsonRpcError),

    /// Request timed out after the configured duration.
    #[error("Request timed out after {ms}ms")]
    Timeout { ms: u64 },

    /// The request was dropped from the queue before dispatch.
    #[error("Request cancelled before dispatch")]
    Cancelled,

    /// Response could not be deserialized.
    #[error("Deserialization error: {0}")]
    Deserialization(#[from] serde_json::Error),

    /// An unexpected error.
    #[error("{0}")]
    Other(String),
}

impl TransportError {
    /// Returns `true` if this error is transient and a retry may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Http(_) | Self::Timeout { .. })
    }

    /// Returns `true` if this is a node-side execution error.
    pub fn is_execution_error(&self) -> bool {
        matches!(self, Self::Rpc(_))
    }
}
