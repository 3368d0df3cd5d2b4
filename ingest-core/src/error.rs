// ingest-core/src/error.rs
// Error types for the ingest control plane

use std::result;
use thiserror::Error;

/// Main error type for the ingest control plane.
///
/// Variants map to the propagation policy of the service: configuration
/// errors are fatal at startup, everything else is logged and retried or
/// dropped by the owning component.
#[derive(Error, Debug)]
pub enum IngestError {
    /// Configuration validation errors
    #[error("configuration error: {field} - {message}")]
    Config { field: String, message: String },

    /// Event bus failures (publish, subscribe, fetch)
    #[error("bus error: {operation} failed - {details}")]
    Bus { operation: String, details: String },

    /// Columnar store failures
    #[error("store error: {operation} failed - {details}")]
    Store { operation: String, details: String },

    /// Agent registry failures
    #[error("registry error: {operation} failed - {details}")]
    Registry { operation: String, details: String },

    /// Wire or bus payload decode failures
    #[error("decode error: {0}")]
    Decode(String),

    /// A peer spoke the framed protocol incorrectly
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Stream transport errors
    #[error("transport error: {operation} - {source}")]
    Transport {
        operation: String,
        #[source]
        source: std::io::Error,
    },

    /// Timeout errors
    #[error("operation timed out: {operation} ({timeout_ms}ms)")]
    Timeout { operation: String, timeout_ms: u64 },

    /// Bounded queue at capacity
    #[error("overloaded: {0}")]
    Overload(String),
}

/// Result type alias for convenience
pub type Result<T> = result::Result<T, IngestError>;

impl IngestError {
    pub fn bus(operation: &str, err: impl std::fmt::Display) -> Self {
        IngestError::Bus {
            operation: operation.to_string(),
            details: err.to_string(),
        }
    }

    pub fn store(operation: &str, err: impl std::fmt::Display) -> Self {
        IngestError::Store {
            operation: operation.to_string(),
            details: err.to_string(),
        }
    }

    pub fn registry(operation: &str, err: impl std::fmt::Display) -> Self {
        IngestError::Registry {
            operation: operation.to_string(),
            details: err.to_string(),
        }
    }

    pub fn transport(operation: &str, source: std::io::Error) -> Self {
        IngestError::Transport {
            operation: operation.to_string(),
            source,
        }
    }
}

impl From<prost::DecodeError> for IngestError {
    fn from(err: prost::DecodeError) -> Self {
        IngestError::Decode(err.to_string())
    }
}

impl From<serde_json::Error> for IngestError {
    fn from(err: serde_json::Error) -> Self {
        IngestError::Decode(format!("JSON processing: {err}"))
    }
}

impl From<tokio::time::error::Elapsed> for IngestError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        IngestError::Timeout {
            operation: "async operation".to_string(),
            timeout_ms: 0,
        }
    }
}
