//! Error types for the financial assistant orchestrator

use std::time::Duration;
use thiserror::Error;

/// Result type alias for orchestrator operations
pub type Result<T> = std::result::Result<T, OrchestrationError>;

#[derive(Error, Debug)]
pub enum OrchestrationError {

    // =============================
    // Model Gateway Errors
    // =============================

    #[error("Network failure: {0}")]
    NetworkFailure(String),

    #[error("Rate limited by model service")]
    RateLimited { retry_after: Option<Duration> },

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Schema violation: {0}")]
    SchemaViolation(String),

    // =============================
    // Tool Errors
    // =============================

    #[error("Tool {0} not found")]
    ToolNotFound(String),

    #[error("Tool {name} failed: {message}")]
    ToolExecution { name: String, message: String },

    #[error("Invalid tool input: {0}")]
    InvalidToolInput(String),

    #[error("Tool {name} timed out after {timeout_ms} ms")]
    ToolTimeout { name: String, timeout_ms: u64 },

    #[error("Duplicate tool name: {0}")]
    DuplicateToolName(String),

    // =============================
    // Conversation Errors
    // =============================

    #[error("Turn not found: {0}")]
    TurnNotFound(uuid::Uuid),

    #[error("Turn already finalized: {0}")]
    TurnAlreadyFinalized(uuid::Uuid),

    #[error("Pairing violation: {0}")]
    PairingViolation(String),

    #[error("Conversation {0} is corrupted and must be reset")]
    ConversationCorrupted(uuid::Uuid),

    // =============================
    // Loop Control
    // =============================

    #[error("Loop budget exceeded: more than {max_rounds} tool rounds requested")]
    LoopBudgetExceeded { max_rounds: u32 },

    #[error("Session {0} is busy with another request")]
    SessionBusy(uuid::Uuid),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Configuration error: {0}")]
    Config(String),

    // =============================
    // External Library Conversions
    // =============================

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("HTTP client error: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("UUID parse error: {0}")]
    UuidError(#[from] uuid::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

impl OrchestrationError {
    /// Gateway failures worth another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            OrchestrationError::NetworkFailure(_) | OrchestrationError::RateLimited { .. }
        )
    }

    /// Server-provided delay before the next attempt, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            OrchestrationError::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }

    /// Errors that must reach the user verbatim and are never retried.
    pub fn is_fatal(&self) -> bool {
        !self.is_retryable()
    }

    /// Wrap an arbitrary handler failure for the named tool.
    pub fn tool(name: impl Into<String>, message: impl Into<String>) -> Self {
        OrchestrationError::ToolExecution {
            name: name.into(),
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(OrchestrationError::NetworkFailure("reset".into()).is_retryable());
        assert!(OrchestrationError::RateLimited { retry_after: None }.is_retryable());
        assert!(!OrchestrationError::InvalidRequest("bad".into()).is_retryable());
        assert!(OrchestrationError::SchemaViolation("bad".into()).is_fatal());
    }

    #[test]
    fn test_tool_not_found_message() {
        let err = OrchestrationError::ToolNotFound("getWeather".into());
        assert_eq!(err.to_string(), "Tool getWeather not found");
    }

    #[test]
    fn test_retry_after_only_for_rate_limit() {
        let limited = OrchestrationError::RateLimited {
            retry_after: Some(Duration::from_secs(2)),
        };
        assert_eq!(limited.retry_after(), Some(Duration::from_secs(2)));
        assert_eq!(OrchestrationError::Cancelled.retry_after(), None);
    }
}
