//! Common error types for DriftSync.

use thiserror::Error;

/// Top-level error type for DriftSync operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Operation rejected before it reached the queue.
    #[error("Validation error: {0}")]
    Validation(String),

    /// A safety-critical invariant was violated.
    #[error("Safety-critical violation: {0}")]
    SafetyCritical(String),

    /// Transient network failure (including call timeouts).
    #[error("Network error: {0}")]
    Network(String),

    /// Concurrent writes with incomparable vector clocks.
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Invariant failure on merged state; the entity is quarantined.
    #[error("Consistency error: {0}")]
    Consistency(String),

    /// Operation schema no longer matches what the remote expects.
    #[error("Migration error: {0}")]
    Migration(String),

    /// Durable storage failed.
    #[error("Storage error: {0}")]
    Storage(String),

    /// I/O operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization or deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Stored data failed its integrity check.
    #[error("Integrity error: {0}")]
    Integrity(String),

    /// Invalid input provided.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Resource not found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Resource already exists.
    #[error("Already exists: {0}")]
    AlreadyExists(String),
}

impl Error {
    /// Whether the failure is transient and may be retried with backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Network(_))
    }

    /// Whether the failure must reach an operator instead of being retried.
    pub fn requires_operator(&self) -> bool {
        matches!(
            self,
            Error::SafetyCritical(_) | Error::Consistency(_) | Error::Migration(_)
        )
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

/// Result type alias using the common Error.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_network_errors_are_retryable() {
        assert!(Error::Network("timeout".to_string()).is_retryable());
        assert!(!Error::Validation("bad".to_string()).is_retryable());
        assert!(!Error::Consistency("sum mismatch".to_string()).is_retryable());
        assert!(!Error::Io(std::io::Error::other("disk")).is_retryable());
    }

    #[test]
    fn test_operator_errors() {
        assert!(Error::SafetyCritical("flag".to_string()).requires_operator());
        assert!(Error::Migration("v2".to_string()).requires_operator());
        assert!(!Error::Network("down".to_string()).requires_operator());
    }
}
