//! Error types for the replication engine.

use thiserror::Error;
use tidedb_core::{DocId, StoreError};

/// Result type for replication operations.
pub type ReplResult<T> = Result<T, ReplError>;

/// Errors that can occur during replication.
#[derive(Debug, Error)]
pub enum ReplError {
    /// Network or transport failure. Retried with backoff by the
    /// session; the last successful checkpoint is preserved.
    #[error("transient transport error: {message}")]
    TransientTransport {
        /// Error message from the transport.
        message: String,
    },

    /// A remote call exceeded its caller-supplied deadline. Treated as
    /// a transient failure, never a permanent one.
    #[error("remote call timed out")]
    Timeout,

    /// The target rejected one document's revisions. Recorded and
    /// skipped; never aborts the batch.
    #[error("target rejected revisions for document {id}: {reason}")]
    ApplyRejected {
        /// The rejected document.
        id: DocId,
        /// Why the target rejected it.
        reason: String,
    },

    /// Local store error surfaced through the replication path.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Checkpoint persistence failure.
    #[error("checkpoint error: {message}")]
    Checkpoint {
        /// Description of the failure.
        message: String,
    },

    /// Unrecoverable failure. Stops the engine, visible in status.
    #[error("fatal replication error: {message}")]
    Fatal {
        /// Description of the failure.
        message: String,
    },
}

impl ReplError {
    /// Creates a transient transport error.
    pub fn transient(message: impl Into<String>) -> Self {
        Self::TransientTransport {
            message: message.into(),
        }
    }

    /// Creates an apply-rejected error.
    pub fn apply_rejected(id: &DocId, reason: impl Into<String>) -> Self {
        Self::ApplyRejected {
            id: id.clone(),
            reason: reason.into(),
        }
    }

    /// Creates a checkpoint error.
    pub fn checkpoint(message: impl Into<String>) -> Self {
        Self::Checkpoint {
            message: message.into(),
        }
    }

    /// Creates a fatal error.
    pub fn fatal(message: impl Into<String>) -> Self {
        Self::Fatal {
            message: message.into(),
        }
    }

    /// Returns true if the session should retry after backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ReplError::TransientTransport { .. } | ReplError::Timeout)
    }
}
