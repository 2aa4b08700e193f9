//! Error types for the tracer.

use thiserror::Error;

/// Errors raised by the tracer and its activity sources.
#[derive(Debug, Error)]
pub enum TraceError {
    /// A call into the activity source returned a non-success status.
    #[error("activity source call `{call}` failed: {status}")]
    Source {
        /// Name of the failing source call.
        call: &'static str,
        /// Status description reported by the source.
        status: String,
    },

    /// The requested tracing backend is not compiled in or not present.
    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),

    /// An activity buffer could not be decoded.
    #[error("malformed activity buffer at offset {offset}: {reason}")]
    Decode {
        /// Byte offset of the offending record.
        offset: usize,
        /// What was wrong with it.
        reason: String,
    },

    /// Invalid tracer configuration.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Activity buffer allocation failed.
    #[error("failed to allocate activity buffer of {size} bytes")]
    Allocation {
        /// Requested size in bytes.
        size: usize,
    },

    /// Report serialization failed.
    #[error("report serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl TraceError {
    /// Shorthand for a failed source call.
    pub fn source_call(call: &'static str, status: impl std::fmt::Display) -> Self {
        TraceError::Source {
            call,
            status: status.to_string(),
        }
    }
}

/// Result type for tracer operations.
pub type Result<T> = std::result::Result<T, TraceError>;
