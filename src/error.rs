//! Error types for PicoClaw
//!
//! All fallible operations in the library return [`Result`], whose error type
//! is [`PicoError`]. Provider failures carry a structured [`ProviderError`]
//! classification so callers can branch on the failure kind without string
//! matching.

use std::fmt;
use thiserror::Error;

// ============================================================================
// Provider Error Classification
// ============================================================================

/// Structured provider error classification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderError {
    /// 401/403: invalid API key or authentication failure
    Auth(String),
    /// 429: rate limit or quota exceeded
    RateLimit(String),
    /// 5xx: server-side errors
    ServerError(String),
    /// 400: bad request, malformed parameters
    InvalidRequest(String),
    /// 404: model or endpoint not available
    ModelNotFound(String),
    /// Request did not complete within the configured timeout
    Timeout(String),
    /// Connection failures and anything unrecognized
    Unknown(String),
}

impl fmt::Display for ProviderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProviderError::Auth(msg) => write!(f, "Authentication error: {}", msg),
            ProviderError::RateLimit(msg) => write!(f, "Rate limit error: {}", msg),
            ProviderError::ServerError(msg) => write!(f, "Server error: {}", msg),
            ProviderError::InvalidRequest(msg) => write!(f, "Invalid request: {}", msg),
            ProviderError::ModelNotFound(msg) => write!(f, "Model not found: {}", msg),
            ProviderError::Timeout(msg) => write!(f, "Timeout: {}", msg),
            ProviderError::Unknown(msg) => write!(f, "Unknown provider error: {}", msg),
        }
    }
}

impl std::error::Error for ProviderError {}

impl ProviderError {
    /// Classify an HTTP status code and response body.
    pub fn from_status(status: u16, body: &str) -> Self {
        let msg = body.to_string();
        match status {
            401 | 403 => ProviderError::Auth(msg),
            429 => ProviderError::RateLimit(msg),
            400 | 422 => ProviderError::InvalidRequest(msg),
            404 => ProviderError::ModelNotFound(msg),
            408 | 504 => ProviderError::Timeout(msg),
            500..=599 => ProviderError::ServerError(msg),
            _ => ProviderError::Unknown(msg),
        }
    }

    /// Returns `true` if this error is transient and the request could be retried.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ProviderError::RateLimit(_) | ProviderError::ServerError(_) | ProviderError::Timeout(_)
        )
    }
}

// ============================================================================
// Primary Error Type
// ============================================================================

/// The primary error type for PicoClaw operations.
#[derive(Error, Debug)]
pub enum PicoError {
    /// Configuration-related errors (invalid config, missing required fields, etc.)
    #[error("Configuration error: {0}")]
    Config(String),

    /// LLM provider failures (transport, auth, rate limit, timeout)
    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    /// The model requested a tool that is not registered
    #[error("Unknown tool: {0}")]
    UnknownTool(String),

    /// A registered tool failed while executing
    #[error("Tool execution error: {0}")]
    ToolExecution(String),

    /// Context compaction could not produce a summary
    #[error("Compaction failed: {0}")]
    CompactionFailure(String),

    /// Memory consolidation could not be completed
    #[error("Consolidation failed: {0}")]
    ConsolidationFailure(String),

    /// Channel errors (connection failures, send failures, etc.)
    #[error("Channel error: {0}")]
    Channel(String),

    /// Session persistence failures
    #[error("Session I/O error: {0}")]
    SessionIo(String),

    /// Non-blocking publish found the queue full
    #[error("Bus capacity exceeded")]
    BusCapacityExceeded,

    /// Message bus channel closed unexpectedly
    #[error("Bus error: channel closed")]
    BusClosed,

    /// Network bus transport errors (connect, framing)
    #[error("Transport error: {0}")]
    Transport(String),

    /// Resource not found (sessions, tasks, files)
    #[error("Not found: {0}")]
    NotFound(String),

    /// Standard I/O errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl PicoError {
    /// Short machine-readable kind, used as the prefix of error tool results.
    pub fn kind(&self) -> &'static str {
        match self {
            PicoError::UnknownTool(_) => "unknown_tool",
            PicoError::ToolExecution(_) => "tool_execution_error",
            PicoError::Provider(_) => "provider_error",
            PicoError::CompactionFailure(_) => "compaction_failure",
            PicoError::ConsolidationFailure(_) => "consolidation_failure",
            PicoError::BusCapacityExceeded => "bus_capacity_exceeded",
            PicoError::SessionIo(_) => "session_io_error",
            _ => "error",
        }
    }
}

/// A specialized `Result` type for PicoClaw operations.
pub type Result<T> = std::result::Result<T, PicoError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = PicoError::Config("missing API key".to_string());
        assert_eq!(err.to_string(), "Configuration error: missing API key");
    }

    #[test]
    fn test_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let pico_err: PicoError = io_err.into();
        assert!(matches!(pico_err, PicoError::Io(_)));
    }

    #[test]
    fn test_error_kinds() {
        assert_eq!(PicoError::UnknownTool("x".into()).kind(), "unknown_tool");
        assert_eq!(
            PicoError::ToolExecution("boom".into()).kind(),
            "tool_execution_error"
        );
        assert_eq!(PicoError::BusClosed.kind(), "error");
    }

    #[test]
    fn test_provider_error_from_status() {
        assert!(matches!(
            ProviderError::from_status(401, "bad key"),
            ProviderError::Auth(_)
        ));
        assert!(matches!(
            ProviderError::from_status(429, "slow down"),
            ProviderError::RateLimit(_)
        ));
        assert!(matches!(
            ProviderError::from_status(503, ""),
            ProviderError::ServerError(_)
        ));
        assert!(matches!(
            ProviderError::from_status(404, "no model"),
            ProviderError::ModelNotFound(_)
        ));
        assert!(matches!(
            ProviderError::from_status(418, "teapot"),
            ProviderError::Unknown(_)
        ));
    }

    #[test]
    fn test_provider_error_retryable() {
        assert!(ProviderError::RateLimit("q".into()).is_retryable());
        assert!(ProviderError::Timeout("t".into()).is_retryable());
        assert!(!ProviderError::Auth("a".into()).is_retryable());
        assert!(!ProviderError::InvalidRequest("bad".into()).is_retryable());
    }

    #[test]
    fn test_provider_error_into_pico_error() {
        let err: PicoError = ProviderError::Timeout("60s".into()).into();
        assert_eq!(err.to_string(), "Provider error: Timeout: 60s");
        assert_eq!(err.kind(), "provider_error");
    }
}
