//! Error types for tablenet.

use thiserror::Error;

/// Result type alias for tablenet operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in tablenet operations.
#[derive(Error, Debug)]
pub enum Error {
    // Transport errors
    #[error("Transport failure: {0}")]
    Transport(String),

    #[error("Peer rank {rank} out of range for group of {size}")]
    InvalidRank { rank: usize, size: usize },

    // Message errors
    #[error("Malformed message with tag {tag}: {reason}")]
    MalformedMessage { tag: i32, reason: String },

    #[error("Unknown message tag {0}")]
    UnknownTag(i32),

    #[error("No handler bound for tag {0}")]
    NoHandler(i32),

    // Scheduling errors
    #[error("Capacity exceeded for key '{key}': {queue} sub-queue already holds {capacity} requests")]
    CapacityExceeded {
        key: String,
        queue: &'static str,
        capacity: usize,
    },

    // Lifecycle errors
    #[error("Network engine is not active")]
    Inactive,

    #[error("Network engine stopped")]
    Stopped,

    // Server errors
    #[error("Handler not found: {0}")]
    HandlerNotFound(String),

    #[error("Handler failed: {0}")]
    HandlerFailed(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // Serialization errors
    #[error("Serialization error: {0}")]
    SerializationError(String),

    // Generic errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether this error must halt the engine rather than drop one message.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::CapacityExceeded { .. } | Error::Internal(_))
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::SerializationError(err.to_string())
    }
}

impl From<bincode::Error> for Error {
    fn from(err: bincode::Error) -> Self {
        Error::SerializationError(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        let capacity = Error::CapacityExceeded {
            key: "w1".to_string(),
            queue: "put",
            capacity: 2,
        };
        assert!(capacity.is_fatal());
        assert!(!Error::UnknownTag(99).is_fatal());
        assert!(!Error::MalformedMessage {
            tag: 1,
            reason: "eof".to_string()
        }
        .is_fatal());
    }

    #[test]
    fn test_error_display() {
        let err = Error::CapacityExceeded {
            key: "layer0/weight".to_string(),
            queue: "get",
            capacity: 4,
        };
        let text = err.to_string();
        assert!(text.contains("layer0/weight"));
        assert!(text.contains("get"));
    }
}
