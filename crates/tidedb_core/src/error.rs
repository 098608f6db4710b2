//! Error types for the tidedb core store.

use crate::revision::{DocId, RevisionId};
use thiserror::Error;

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors that can occur in document store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Document or revision is absent (or the winner is a tombstone).
    #[error("document not found: {id}")]
    NotFound {
        /// The document that was not found.
        id: DocId,
    },

    /// Stale write attempt: the supplied parent is not a current leaf.
    ///
    /// Recoverable by re-reading the document and retrying with the
    /// current winning revision as parent.
    #[error("conflict on document {id}: parent {parent:?} is not a current leaf")]
    Conflict {
        /// The document the write targeted.
        id: DocId,
        /// The stale parent the caller supplied.
        parent: Option<RevisionId>,
    },

    /// Malformed revision insert: the parent revision is not in the tree.
    ///
    /// This indicates a caller bug and is never retried.
    #[error("unknown parent revision {parent} for document {id}")]
    UnknownParent {
        /// The document the insert targeted.
        id: DocId,
        /// The parent identity that was not found.
        parent: RevisionId,
    },

    /// A replicated revision failed verification against its identity.
    #[error("invalid revision {revision} for document {id}: {reason}")]
    InvalidRevision {
        /// The document the revision belongs to.
        id: DocId,
        /// The claimed revision identity.
        revision: RevisionId,
        /// Why verification failed.
        reason: String,
    },

    /// Unrecoverable store failure. The caller must not proceed silently.
    #[error("fatal store error: {message}")]
    Fatal {
        /// Description of the failure.
        message: String,
    },
}

impl StoreError {
    /// Creates a not-found error.
    pub fn not_found(id: &DocId) -> Self {
        Self::NotFound { id: id.clone() }
    }

    /// Creates a stale-write conflict error.
    pub fn conflict(id: &DocId, parent: Option<&RevisionId>) -> Self {
        Self::Conflict {
            id: id.clone(),
            parent: parent.cloned(),
        }
    }

    /// Creates an unknown-parent error.
    pub fn unknown_parent(id: &DocId, parent: &RevisionId) -> Self {
        Self::UnknownParent {
            id: id.clone(),
            parent: parent.clone(),
        }
    }

    /// Creates an invalid-revision error.
    pub fn invalid_revision(id: &DocId, revision: &RevisionId, reason: impl Into<String>) -> Self {
        Self::InvalidRevision {
            id: id.clone(),
            revision: revision.clone(),
            reason: reason.into(),
        }
    }

    /// Creates a fatal error.
    pub fn fatal(message: impl Into<String>) -> Self {
        Self::Fatal {
            message: message.into(),
        }
    }

    /// Returns true if the caller can recover by re-reading and retrying.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, StoreError::Conflict { .. })
    }
}
