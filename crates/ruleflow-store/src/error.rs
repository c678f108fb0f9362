//! Error types for store access

use ruleflow_core::{PathError, ResourcePath};

/// Store access errors
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Nothing exists at the path
    #[error("not found: {0}")]
    NotFound(ResourcePath),

    /// Store answered with a non-success status
    #[error("store returned {status} for {path}: {body}")]
    Http {
        status: u16,
        path: ResourcePath,
        body: String,
    },

    /// Request never got an answer
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// Body could not be encoded or decoded
    #[error("invalid document: {0}")]
    Decode(#[from] serde_json::Error),

    /// Path or identifier is malformed
    #[error(transparent)]
    InvalidPath(#[from] PathError),

    /// Write cannot be applied to what is stored
    #[error("cannot write {path}: {reason}")]
    InvalidWrite { path: ResourcePath, reason: String },

    /// Store reply lacks something it must carry
    #[error("unexpected store response: {0}")]
    Protocol(String),

    /// Subscription is already gone
    #[error("subscription {0} is closed")]
    Closed(u64),

    /// Background task failed
    #[error("background task failed: {0}")]
    Task(String),
}

impl StoreError {
    /// Create write error
    pub fn invalid_write(path: &ResourcePath, reason: impl Into<String>) -> Self {
        Self::InvalidWrite {
            path: path.clone(),
            reason: reason.into(),
        }
    }

    /// Whether the error means "does not exist"
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::NotFound(_) => true,
            Self::Http { status, .. } => *status == 404,
            _ => false,
        }
    }

    /// Check if retrying the same request may succeed
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport(_) => true,
            Self::Http { status, .. } => *status >= 500 || *status == 429,
            _ => false,
        }
    }
}

/// Result type for store operations
pub type StoreResult<T> = Result<T, StoreError>;
