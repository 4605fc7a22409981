//! Error types for association operations

use thiserror::Error;

use crate::types::RefusalReason;

/// Result type alias for association operations
pub type Result<T> = std::result::Result<T, AssocError>;

/// Error types that can occur during association negotiation and service
#[derive(Error, Debug)]
pub enum AssocError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Unresolved {kind} reference: {key}")]
    UnresolvedReference { kind: &'static str, key: String },

    #[error("List {list} exceeds the limit of {limit} entries")]
    TooManyItems { list: String, limit: usize },

    #[error("Parse error at line {line}: {message}")]
    Parse { line: usize, message: String },

    #[error("Invalid AE Title: {0}")]
    InvalidAeTitle(String),

    #[error("Network error: {0}")]
    Network(#[from] std::io::Error),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Association refused: {0}")]
    Refused(RefusalReason),

    #[error("Maximum number of concurrent associations reached")]
    Overloaded,

    #[error("Timeout occurred: {0}")]
    Timeout(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl AssocError {
    /// Create a new configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a new unresolved-reference error
    pub fn unresolved(kind: &'static str, key: impl Into<String>) -> Self {
        Self::UnresolvedReference {
            kind,
            key: key.into(),
        }
    }

    /// Create a new parse error carrying the offending line number
    pub fn parse(line: usize, msg: impl Into<String>) -> Self {
        Self::Parse {
            line,
            message: msg.into(),
        }
    }

    /// Create a new protocol error
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    /// Create a new timeout error
    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::Timeout(msg.into())
    }

    /// Create a new internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Check if this error is recoverable
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            AssocError::Network(_)
                | AssocError::Timeout(_)
                | AssocError::Refused(_)
                | AssocError::Overloaded
        )
    }
}
