//! Error types for fsrelay

use thiserror::Error;

/// Result type alias for fsrelay operations
pub type Result<T> = std::result::Result<T, RelayError>;

/// Main error type for fsrelay
#[derive(Error, Debug)]
pub enum RelayError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Document store error: {0}")]
    #[cfg(feature = "document")]
    Document(#[from] mongodb::error::Error),

    #[error("Stream store error: {0}")]
    #[cfg(feature = "stream")]
    Stream(#[from] redis::RedisError),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Invalid cursor for {engine} engine: {cursor}")]
    InvalidCursor { engine: &'static str, cursor: String },

    #[error("Upstream error: {0}")]
    Upstream(String),

    #[error("Webhook delivery failed for {url}: {reason}")]
    Webhook { url: String, reason: String },

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl RelayError {
    /// Check if error is transient (worth retrying on the next tick or reconnect)
    pub fn is_retryable(&self) -> bool {
        match self {
            RelayError::Upstream(_) | RelayError::Http(_) | RelayError::Io(_) => true,
            RelayError::Webhook { .. } => true,
            #[cfg(feature = "stream")]
            RelayError::Stream(e) => e.is_io_error() || e.is_timeout(),
            _ => false,
        }
    }

    /// Short machine-readable kind, used in pull session error frames
    pub fn kind(&self) -> &'static str {
        match self {
            RelayError::Database(_) | RelayError::Storage(_) => "storage",
            #[cfg(feature = "document")]
            RelayError::Document(_) => "storage",
            #[cfg(feature = "stream")]
            RelayError::Stream(_) => "storage",
            RelayError::InvalidCursor { .. } | RelayError::InvalidInput(_) => "invalid_input",
            RelayError::Upstream(_) | RelayError::Http(_) => "upstream",
            RelayError::Webhook { .. } => "webhook",
            RelayError::Serialization(_) => "serialization",
            RelayError::Io(_) => "io",
            RelayError::Config(_) => "config",
            RelayError::Internal(_) => "internal",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(RelayError::Upstream("timeout".into()).is_retryable());
        assert!(!RelayError::InvalidInput("bad".into()).is_retryable());
        assert!(!RelayError::Config("missing".into()).is_retryable());
    }

    #[test]
    fn test_invalid_cursor_message() {
        let err = RelayError::InvalidCursor {
            engine: "relational",
            cursor: "abc".into(),
        };
        assert_eq!(err.kind(), "invalid_input");
        assert!(err.to_string().contains("relational"));
    }
}
