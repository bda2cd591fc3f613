//! Error types for the trace analyzer

use thiserror::Error;

use crate::domain::{EndpointId, TraceId};
use crate::infra::retry::is_retryable_db_error;

/// Errors that can occur while analyzing traces
#[derive(Error, Debug)]
pub enum AnalyzerError {
    /// Database error
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Queue (Redis) error
    #[error("queue error: {0}")]
    Queue(#[from] redis::RedisError),

    /// Trace not found
    #[error("trace not found: {0}")]
    TraceNotFound(TraceId),

    /// Endpoint not found (trace references an unregistered endpoint)
    #[error("endpoint not found: {0}")]
    EndpointNotFound(EndpointId),

    /// Optimistic conflict detected while committing
    #[error("write conflict: {0}")]
    Conflict(String),

    /// A commit kept failing with transient errors
    #[error("commit failed after {attempts} attempts: {source}")]
    ExhaustedRetries {
        attempts: u32,
        #[source]
        source: Box<AnalyzerError>,
    },

    /// Payload could not be walked (too deep, unreadable)
    #[error("malformed payload: {0}")]
    MalformedPayload(String),

    /// Queue token is not a trace identifier
    #[error("invalid trace id: {0}")]
    InvalidTraceId(String),

    /// Stored row could not be decoded
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration error
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Internal error
    #[error("internal error: {0}")]
    Internal(String),
}

impl AnalyzerError {
    /// Transient errors are worth retrying the whole unit of work for
    pub fn is_retryable(&self) -> bool {
        match self {
            AnalyzerError::Database(err) => is_retryable_db_error(err),
            AnalyzerError::Conflict(_) => true,
            AnalyzerError::Queue(err) => {
                err.is_connection_dropped() || err.is_connection_refusal() || err.is_timeout()
            }
            _ => false,
        }
    }

    /// Missing trace or endpoint; the runner skips these instead of failing
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            AnalyzerError::TraceNotFound(_) | AnalyzerError::EndpointNotFound(_)
        )
    }

    /// Short machine-readable label, used for failure records and metrics
    pub fn reason(&self) -> &'static str {
        match self {
            AnalyzerError::Database(_) => "database",
            AnalyzerError::Queue(_) => "queue",
            AnalyzerError::TraceNotFound(_) => "trace_not_found",
            AnalyzerError::EndpointNotFound(_) => "endpoint_not_found",
            AnalyzerError::Conflict(_) => "conflict",
            AnalyzerError::ExhaustedRetries { .. } => "exhausted_retries",
            AnalyzerError::MalformedPayload(_) => "malformed_payload",
            AnalyzerError::InvalidTraceId(_) => "invalid_trace_id",
            AnalyzerError::Serialization(_) => "serialization",
            AnalyzerError::Configuration(_) => "configuration",
            AnalyzerError::Internal(_) => "internal",
        }
    }
}

/// Result type for analyzer operations
pub type Result<T> = std::result::Result<T, AnalyzerError>;
