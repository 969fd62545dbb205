//! Error types for the message queue.

use thiserror::Error;

/// Main error type for queue operations.
#[derive(Debug, Error)]
pub enum QueueError {
    /// Transient connection-level failure. The only class retried by the
    /// publisher and subscriber retry loops.
    #[error("Connection error: {0}")]
    Connection(String),

    /// A transient-retry budget ran out. Fatal; surfaced to the caller.
    #[error("Retries exhausted after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: String },

    /// Protocol/integrity violation: completing a message that no longer
    /// matches its claim preconditions, double completion, or a non-terminal
    /// completion state. A programming error, never retried.
    #[error("Integrity error: {0}")]
    Integrity(String),

    /// Invalid configuration, detected at construction before any I/O.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Non-transient store failure (duplicate key, validation, ...).
    #[error("Store error: {0}")]
    Store(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl QueueError {
    /// Whether the retry loops may try again after this error.
    pub fn is_transient(&self) -> bool {
        matches!(self, QueueError::Connection(_))
    }
}

impl From<serde_json::Error> for QueueError {
    fn from(e: serde_json::Error) -> Self {
        QueueError::Serialization(e.to_string())
    }
}

/// Result type for queue operations.
pub type Result<T> = std::result::Result<T, QueueError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transiency_classification() {
        assert!(QueueError::Connection("reset".into()).is_transient());
        assert!(!QueueError::Store("duplicate key".into()).is_transient());
        assert!(!QueueError::Integrity("double complete".into()).is_transient());
        assert!(!QueueError::RetriesExhausted {
            attempts: 6,
            last: "reset".into()
        }
        .is_transient());
    }
}
