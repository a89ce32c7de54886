//! Error types for the docsync engine.

use thiserror::Error;

/// All possible errors from the docsync engine.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    // Local I/O
    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),

    // Server interaction
    #[error("network error: {0}")]
    Network(String),

    #[error("server rejected request: {0}")]
    ServerRejected(String),

    // Lifecycle
    #[error("operation cancelled")]
    Cancelled,

    // Document model
    #[error("document error: {0}")]
    Doc(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl Error {
    /// Transient failures that are retried with backoff without limit.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::StorageUnavailable(_) | Error::Network(_))
    }

    /// Shutdown of a loop, not a failure.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Doc(err.to_string())
    }
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = Error::StorageUnavailable("disk full".into());
        assert_eq!(err.to_string(), "storage unavailable: disk full");

        let err = Error::ServerRejected("token expired".into());
        assert_eq!(err.to_string(), "server rejected request: token expired");

        assert_eq!(Error::Cancelled.to_string(), "operation cancelled");
    }

    #[test]
    fn retry_classification() {
        assert!(Error::StorageUnavailable("x".into()).is_retryable());
        assert!(Error::Network("reset".into()).is_retryable());
        assert!(!Error::ServerRejected("conflict".into()).is_retryable());
        assert!(!Error::Doc("corrupt".into()).is_retryable());
        assert!(!Error::Cancelled.is_retryable());
        assert!(Error::Cancelled.is_cancelled());
    }
}
