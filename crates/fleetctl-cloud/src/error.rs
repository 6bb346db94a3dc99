//! Error taxonomy for cloud operations.
//!
//! Three classes matter to callers: transient errors (retried with backoff
//! before surfacing), idempotent notices ("already exists" on add, "not
//! found" on remove — success in disguise), and everything else, which
//! aborts the current engine operation.

use thiserror::Error;

/// Result type alias for cloud operations.
pub type CloudResult<T> = Result<T, CloudError>;

#[derive(Debug, Clone, Error)]
pub enum CloudError {
    /// Throttling, timeouts, ephemeral API failures. Safe to retry.
    #[error("transient cloud error: {0}")]
    Transient(String),

    /// The target resource does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The resource being created already exists.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// The configured auth method has no backend in this build.
    #[error("unsupported cloud backend: {0}")]
    Unsupported(String),

    /// Non-retryable API failure.
    #[error("cloud operation failed: {0}")]
    Failed(String),
}

impl CloudError {
    /// Whether a retry with backoff could plausibly succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            CloudError::Transient(_) => true,
            CloudError::Failed(msg) => is_transient_message(msg),
            _ => false,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, CloudError::NotFound(_))
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, CloudError::AlreadyExists(_))
    }
}

/// Message-based transient classification, for errors that arrive as
/// opaque strings from an SDK: throttling plus generic failure/timeout.
pub fn is_transient_message(msg: &str) -> bool {
    let m = msg.to_lowercase();
    m.contains("too many requests")
        || m.contains("429")
        || m.contains("rate limit")
        || m.contains("failed")
        || m.contains("timeout")
        || m.contains("temporar")
}
