//! Remote store adapter.
//!
//! `RemoteStore` is a capability interface, not an implementation: any
//! backend that can answer these operations — an HTTP API, a file-based
//! store, another in-process store — can be the peer of a replication
//! session. The session is written once against this trait.
//!
//! Every call carries a caller-supplied deadline. A backend that cannot
//! answer in time returns `ReplError::Timeout`, which the session
//! treats as transient. Revision identities travel with the revisions
//! and are never recomputed in transit; the receiving store verifies
//! them on ingest.

use crate::checkpoint::Checkpoint;
use crate::error::{ReplError, ReplResult};
use std::sync::Arc;
use std::time::Duration;
use tidedb_core::{
    ChangeEvent, DocId, DocumentStore, RevisionId, StoreError, StoreId, TransferredRevision,
};

/// One page of a source store's change history.
#[derive(Debug, Clone)]
pub struct ChangesPage {
    /// Changed documents with their current leaf revision identities,
    /// ordered by sequence, at most one entry per document.
    pub changes: Vec<ChangeEvent>,
    /// Cursor to persist once this page is durably applied.
    pub checkpoint: Checkpoint,
    /// True if the source has more changes past this page.
    pub has_more: bool,
}

/// Acknowledgement of an `apply_revisions` call.
#[derive(Debug, Clone, PartialEq)]
pub struct ApplyAck {
    /// Revisions that changed the target's tree.
    pub applied: usize,
    /// True if the ingest created a new conflicting leaf on the target.
    pub created_conflict: bool,
}

/// Capability interface to a store reachable from a replication
/// session.
pub trait RemoteStore: Send + Sync {
    /// Identity of the store behind this adapter.
    fn store_id(&self) -> StoreId;

    /// Leaf revisions of documents changed since `checkpoint`, capped
    /// at `limit` documents.
    fn changes_since(
        &self,
        checkpoint: Option<Checkpoint>,
        limit: usize,
        deadline: Duration,
    ) -> ReplResult<ChangesPage>;

    /// Filters `candidates` down to revision identities this store
    /// lacks for one document. Identity comparison only; no bodies
    /// move.
    fn missing_revisions(
        &self,
        id: &DocId,
        candidates: &[RevisionId],
        deadline: Duration,
    ) -> ReplResult<Vec<RevisionId>>;

    /// Fetches revisions with bodies and ancestry for transfer.
    fn fetch_bodies(
        &self,
        id: &DocId,
        revisions: &[RevisionId],
        deadline: Duration,
    ) -> ReplResult<Vec<TransferredRevision>>;

    /// Applies transferred revisions to one document.
    ///
    /// Creating a conflicting leaf is a normal acknowledged outcome;
    /// `ApplyRejected` means the document's batch was refused (e.g. a
    /// body failed identity verification).
    fn apply_revisions(
        &self,
        id: &DocId,
        revisions: Vec<TransferredRevision>,
        deadline: Duration,
    ) -> ReplResult<ApplyAck>;

    /// The store's current change cursor.
    fn latest_checkpoint(&self, deadline: Duration) -> ReplResult<Checkpoint>;
}

/// Adapter over an in-process [`DocumentStore`].
///
/// Serves two roles: the local side of every replication session, and
/// a complete reference backend for tests. Deadlines are accepted and
/// ignored; in-process calls cannot block on a network.
pub struct InProcessRemote {
    store: Arc<DocumentStore>,
}

impl InProcessRemote {
    /// Wraps a document store.
    pub fn new(store: Arc<DocumentStore>) -> Self {
        Self { store }
    }

    /// The wrapped store.
    pub fn store(&self) -> &Arc<DocumentStore> {
        &self.store
    }
}

impl RemoteStore for InProcessRemote {
    fn store_id(&self) -> StoreId {
        self.store.store_id()
    }

    fn changes_since(
        &self,
        checkpoint: Option<Checkpoint>,
        limit: usize,
        _deadline: Duration,
    ) -> ReplResult<ChangesPage> {
        let since = checkpoint.map(|c| c.sequence()).unwrap_or(0);
        let all = self.store.changes_since(since);
        let has_more = all.len() > limit;
        let changes: Vec<ChangeEvent> = all.into_iter().take(limit).collect();
        let cursor = changes
            .last()
            .map(|e| e.sequence)
            .unwrap_or_else(|| self.store.last_sequence().max(since));
        Ok(ChangesPage {
            changes,
            checkpoint: Checkpoint::new(cursor),
            has_more,
        })
    }

    fn missing_revisions(
        &self,
        id: &DocId,
        candidates: &[RevisionId],
        _deadline: Duration,
    ) -> ReplResult<Vec<RevisionId>> {
        Ok(self.store.missing_revisions(id, candidates))
    }

    fn fetch_bodies(
        &self,
        id: &DocId,
        revisions: &[RevisionId],
        _deadline: Duration,
    ) -> ReplResult<Vec<TransferredRevision>> {
        // Revisions pruned between diff and fetch are simply absent;
        // the next cycle re-diffs against current state.
        Ok(revisions
            .iter()
            .filter_map(|rev| self.store.revision_with_ancestry(id, rev))
            .collect())
    }

    fn apply_revisions(
        &self,
        id: &DocId,
        revisions: Vec<TransferredRevision>,
        _deadline: Duration,
    ) -> ReplResult<ApplyAck> {
        match self.store.apply_revisions(id, revisions) {
            Ok(outcome) => Ok(ApplyAck {
                applied: outcome.applied,
                created_conflict: outcome.created_conflict,
            }),
            Err(e @ StoreError::InvalidRevision { .. }) => {
                Err(ReplError::apply_rejected(id, e.to_string()))
            }
            Err(e @ StoreError::UnknownParent { .. }) => {
                Err(ReplError::apply_rejected(id, e.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn latest_checkpoint(&self, _deadline: Duration) -> ReplResult<Checkpoint> {
        Ok(Checkpoint::new(self.store.last_sequence()))
    }
}
