//! Error types shared by the core.

use thiserror::Error;

/// Failures surfaced by the ingestion and query pipeline.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("malformed vector: {0}")]
    MalformedVector(String),

    #[error("operation timed out: {0}")]
    Timeout(String),

    #[error("language model failure: {0}")]
    LlmFailure(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("storage error: {0}")]
    Storage(String),
}

impl CoreError {
    /// Timeouts get the split-and-retry treatment on the write path; all
    /// other errors abort it.
    pub fn is_timeout(&self) -> bool {
        matches!(self, CoreError::Timeout(_))
    }
}

impl From<sqlx::Error> for CoreError {
    fn from(e: sqlx::Error) -> Self {
        CoreError::Storage(e.to_string())
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(e: serde_json::Error) -> Self {
        CoreError::Storage(format!("serialization: {}", e))
    }
}

pub type Result<T> = std::result::Result<T, CoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_timeout() {
        assert!(CoreError::Timeout("x".into()).is_timeout());
        assert!(!CoreError::Storage("x".into()).is_timeout());
    }

    #[test]
    fn test_display_includes_dims() {
        let e = CoreError::DimensionMismatch {
            expected: 384,
            actual: 256,
        };
        assert!(e.to_string().contains("384"));
        assert!(e.to_string().contains("256"));
    }
}
