//! Error types for the node

use thiserror::Error;

#[derive(Error, Debug)]
pub enum NodeError {
    #[error("Object not found: {0}")]
    NotFound(String),

    #[error("Hash mismatch: expected {expected}, got {actual}")]
    HashMismatch { expected: String, actual: String },

    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    #[error("Invalid signature: {0}")]
    InvalidSignature(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Content unavailable: {0}")]
    ContentUnavailable(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("IPFS error: {0}")]
    Ipfs(String),

    #[error("P2P error: {0}")]
    P2p(String),

    #[error("Chain RPC error: {0}")]
    ChainRpc(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Outcome classification for pipeline stages.
///
/// Every stage of the pending-message pipeline reports failures as either
/// transient (retry with backoff) or permanent (reject, record reason).
#[derive(Error, Debug)]
pub enum ProcessingError {
    #[error("transient: {0}")]
    Transient(NodeError),

    #[error("permanent: {0}")]
    Permanent(NodeError),
}

impl ProcessingError {
    pub fn transient(err: impl Into<NodeError>) -> Self {
        Self::Transient(err.into())
    }

    pub fn permanent(err: impl Into<NodeError>) -> Self {
        Self::Permanent(err.into())
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    pub fn reason(&self) -> String {
        match self {
            Self::Transient(e) | Self::Permanent(e) => e.to_string(),
        }
    }
}

impl From<NodeError> for ProcessingError {
    /// Default classification: storage, network and database failures are
    /// retryable, everything message-shaped is final.
    fn from(err: NodeError) -> Self {
        match err {
            NodeError::InvalidMessage(_)
            | NodeError::InvalidSignature(_)
            | NodeError::PermissionDenied(_)
            | NodeError::HashMismatch { .. }
            | NodeError::Json(_) => Self::Permanent(err),
            _ => Self::Transient(err),
        }
    }
}

pub type Result<T, E = NodeError> = std::result::Result<T, E>;
