//! Document store with optimistic concurrency control.
//!
//! The store maps document ids to revision trees, assigns a monotonic
//! sequence number to every mutation and publishes committed changes on
//! a change feed. Durability below the document/revision abstraction is
//! delegated to whatever key-value layer hosts the store; this
//! implementation keeps everything in memory.
//!
//! Writes are optimistic: `put` and `remove` name the parent revision
//! they derive from, and a parent that is no longer a current leaf
//! fails with `Conflict`. The check and the mutation happen under one
//! write lock, so racing writers serialize per document without any
//! caller-side locking — one wins, the other re-reads and retries.

use crate::change_feed::{ChangeEvent, ChangeFeed};
use crate::error::{StoreError, StoreResult};
use crate::resolver::ConflictResolver;
use crate::rev_tree::RevisionTree;
use crate::revision::{DocId, Revision, RevisionId, StoreId, TransferredRevision};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::mpsc::Receiver;
use tracing::debug;

/// A document together with its winning revision.
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    /// The document id.
    pub id: DocId,
    /// The winning revision, body included.
    pub revision: Revision,
}

impl Document {
    /// The winning revision's body, if it is not a tombstone.
    pub fn body(&self) -> Option<&[u8]> {
        self.revision.body.as_deref()
    }
}

/// Result of ingesting replicated revisions for one document.
#[derive(Debug, Clone, PartialEq)]
pub struct ApplyOutcome {
    /// Revisions that actually changed the tree (idempotent re-applies
    /// count zero).
    pub applied: usize,
    /// True if the ingest left the document with more leaves than before,
    /// i.e. a new conflicting branch appeared. Expected, not an error.
    pub created_conflict: bool,
    /// The winning revision after the ingest.
    pub winner: Option<RevisionId>,
}

struct Inner {
    docs: HashMap<DocId, RevisionTree>,
    /// Commit log: (sequence, doc id), append-only, in commit order.
    log: Vec<(u64, DocId)>,
    sequence: u64,
    /// Logical clock stamped onto locally derived revisions.
    clock: u64,
}

/// In-memory document store over per-document revision trees.
pub struct DocumentStore {
    store_id: StoreId,
    resolver: ConflictResolver,
    inner: RwLock<Inner>,
    feed: ChangeFeed,
}

impl DocumentStore {
    /// Creates a store with a fresh id and the default resolver.
    pub fn new() -> Self {
        Self::with_resolver(StoreId::generate(), ConflictResolver::default())
    }

    /// Creates a store with an explicit id and resolver.
    ///
    /// All replicas of the same data set must use an identically
    /// configured resolver or they will not converge.
    pub fn with_resolver(store_id: StoreId, resolver: ConflictResolver) -> Self {
        Self {
            store_id,
            resolver,
            inner: RwLock::new(Inner {
                docs: HashMap::new(),
                log: Vec::new(),
                sequence: 0,
                clock: 0,
            }),
            feed: ChangeFeed::new(),
        }
    }

    /// This store's identity.
    pub fn store_id(&self) -> StoreId {
        self.store_id
    }

    /// Number of documents, deleted ones included.
    pub fn len(&self) -> usize {
        self.inner.read().docs.len()
    }

    /// True if the store holds no documents.
    pub fn is_empty(&self) -> bool {
        self.inner.read().docs.is_empty()
    }

    /// Sequence number of the most recent mutation.
    pub fn last_sequence(&self) -> u64 {
        self.inner.read().sequence
    }

    /// Subscribes to committed changes.
    pub fn subscribe(&self) -> Receiver<ChangeEvent> {
        self.feed.subscribe()
    }

    /// Reads a document's winning revision.
    ///
    /// Fails with `NotFound` if the document is absent or its winner is
    /// a tombstone; use [`get_with_tombstone`](Self::get_with_tombstone)
    /// to observe deletions.
    pub fn get(&self, id: &DocId) -> StoreResult<Document> {
        let doc = self.get_with_tombstone(id)?;
        if doc.revision.is_tombstone() {
            return Err(StoreError::not_found(id));
        }
        Ok(doc)
    }

    /// Reads a document's winning revision, tombstone or not.
    pub fn get_with_tombstone(&self, id: &DocId) -> StoreResult<Document> {
        let inner = self.inner.read();
        let tree = inner.docs.get(id).ok_or_else(|| StoreError::not_found(id))?;
        let winner = tree
            .winning_revision()
            .ok_or_else(|| StoreError::not_found(id))?;
        Ok(Document {
            id: id.clone(),
            revision: winner.clone(),
        })
    }

    /// Writes a new revision derived from `parent`.
    ///
    /// `parent` must be a current leaf; anything else is a stale write
    /// and fails with `Conflict`. `parent == None` creates the document,
    /// or recreates one whose winner is a tombstone by extending the
    /// tombstone branch.
    pub fn put(&self, id: &DocId, parent: Option<&RevisionId>, body: Vec<u8>) -> StoreResult<Revision> {
        let (revision, event) = {
            let mut inner = self.inner.write();
            inner.clock += 1;
            let ts = inner.clock;
            let resolver = self.resolver;
            let store_id = self.store_id;

            // The document entry is registered only once the write is
            // known to succeed; a rejected create must not leave an
            // empty tree behind.
            let revision = match inner.docs.get_mut(id) {
                Some(tree) => {
                    let parent_id = match parent {
                        Some(p) => {
                            if !tree.leaves().iter().any(|l| &l.id == p) {
                                return Err(StoreError::conflict(id, Some(p)));
                            }
                            Some(p.clone())
                        }
                        None => match tree.winning_revision() {
                            None => None,
                            Some(w) if w.is_tombstone() => Some(w.id.clone()),
                            Some(_) => return Err(StoreError::conflict(id, None)),
                        },
                    };
                    tree.insert(parent_id.as_ref(), Some(body), false, store_id, ts)?
                }
                None => {
                    if let Some(p) = parent {
                        return Err(StoreError::conflict(id, Some(p)));
                    }
                    let mut tree = RevisionTree::new(id.clone(), resolver);
                    let revision = tree.insert(None, Some(body), false, store_id, ts)?;
                    inner.docs.insert(id.clone(), tree);
                    revision
                }
            };
            let event = Self::commit(&mut inner, id);
            (revision, event)
        };
        self.feed.emit(event);
        Ok(revision)
    }

    /// Appends a tombstone derived from `parent`.
    ///
    /// Same staleness contract as [`put`](Self::put). History is kept;
    /// the tombstone is just another leaf.
    pub fn remove(&self, id: &DocId, parent: &RevisionId) -> StoreResult<Revision> {
        let (revision, event) = {
            let mut inner = self.inner.write();
            inner.clock += 1;
            let ts = inner.clock;
            let store_id = self.store_id;
            let tree = inner
                .docs
                .get_mut(id)
                .ok_or_else(|| StoreError::not_found(id))?;
            if !tree.leaves().iter().any(|l| &l.id == parent) {
                return Err(StoreError::conflict(id, Some(parent)));
            }
            let revision = tree.insert(Some(parent), None, true, store_id, ts)?;
            let event = Self::commit(&mut inner, id);
            (revision, event)
        };
        self.feed.emit(event);
        Ok(revision)
    }

    /// Ingests replicated revisions for one document.
    ///
    /// Each transferred revision is grafted with its ancestry; unknown
    /// history becomes stubs, known identities are no-ops. A revision
    /// whose hash fails verification rejects the whole document's batch
    /// (the caller records and skips it). The batch is vetted before
    /// the first mutation, so a rejected batch applies nothing, leaves
    /// no stubs behind and emits no change event. Creating a new
    /// conflicting leaf is expected and reported in the outcome.
    pub fn apply_revisions(
        &self,
        id: &DocId,
        revisions: Vec<TransferredRevision>,
    ) -> StoreResult<ApplyOutcome> {
        for transfer in &revisions {
            RevisionTree::check_graft(id, &transfer.ancestry, &transfer.revision)?;
        }
        if revisions.is_empty() {
            let inner = self.inner.read();
            return Ok(ApplyOutcome {
                applied: 0,
                created_conflict: false,
                winner: inner
                    .docs
                    .get(id)
                    .and_then(|tree| tree.winning_revision())
                    .map(|r| r.id.clone()),
            });
        }
        let (outcome, event) = {
            let mut inner = self.inner.write();
            let resolver = self.resolver;
            let tree = inner
                .docs
                .entry(id.clone())
                .or_insert_with(|| RevisionTree::new(id.clone(), resolver));

            let leaves_before = tree.leaves().len();
            let mut applied = 0usize;
            for transfer in revisions {
                if tree.graft(&transfer.ancestry, transfer.revision)? {
                    applied += 1;
                }
            }
            let leaves_after = tree.leaves().len();
            let outcome = ApplyOutcome {
                applied,
                created_conflict: leaves_after > 1 && leaves_after > leaves_before,
                winner: tree.winning_revision().map(|r| r.id.clone()),
            };
            let event = if applied > 0 {
                Some(Self::commit(&mut inner, id))
            } else {
                None
            };
            (outcome, event)
        };
        if let Some(event) = event {
            debug!(doc = %id, applied = outcome.applied, "applied replicated revisions");
            self.feed.emit(event);
        }
        Ok(outcome)
    }

    /// Committed changes with sequence greater than `since`, ordered by
    /// sequence and deduplicated to the latest change per document.
    /// Restartable from any prior cursor.
    pub fn changes_since(&self, since: u64) -> Vec<ChangeEvent> {
        let inner = self.inner.read();
        let mut latest: HashMap<&DocId, u64> = HashMap::new();
        for (seq, id) in inner.log.iter().filter(|(seq, _)| *seq > since) {
            let entry = latest.entry(id).or_insert(*seq);
            if *seq > *entry {
                *entry = *seq;
            }
        }
        let mut changes: Vec<(u64, &DocId)> = latest.into_iter().map(|(id, s)| (s, id)).collect();
        changes.sort_by_key(|(seq, _)| *seq);
        changes
            .into_iter()
            .filter_map(|(seq, id)| {
                let tree = inner.docs.get(id)?;
                let (leaf_revisions, deleted) = Self::leaf_snapshot(tree);
                Some(ChangeEvent {
                    sequence: seq,
                    id: id.clone(),
                    leaf_revisions,
                    deleted,
                })
            })
            .collect()
    }

    /// Current leaf identities of a document, winner first.
    pub fn leaf_revisions(&self, id: &DocId) -> Vec<RevisionId> {
        let inner = self.inner.read();
        inner
            .docs
            .get(id)
            .map(|tree| Self::leaf_snapshot(tree).0)
            .unwrap_or_default()
    }

    /// Losing leaves of a document: the conflicting revisions.
    pub fn conflicts(&self, id: &DocId) -> Vec<Revision> {
        let inner = self.inner.read();
        inner
            .docs
            .get(id)
            .map(|tree| tree.conflicting_leaves().into_iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Filters `candidates` down to identities this store still needs
    /// for `id`. An absent document needs everything.
    pub fn missing_revisions(&self, id: &DocId, candidates: &[RevisionId]) -> Vec<RevisionId> {
        let inner = self.inner.read();
        match inner.docs.get(id) {
            Some(tree) => tree.missing(candidates),
            None => candidates.to_vec(),
        }
    }

    /// Looks up a revision and its root-to-parent ancestry for transfer.
    pub fn revision_with_ancestry(
        &self,
        id: &DocId,
        revision: &RevisionId,
    ) -> Option<TransferredRevision> {
        let inner = self.inner.read();
        let tree = inner.docs.get(id)?;
        let rev = tree.get(revision)?.clone();
        let mut ancestry = tree.path(revision)?;
        ancestry.pop(); // drop the revision itself, keep root..=parent
        Some(TransferredRevision {
            revision: rev,
            ancestry,
        })
    }

    /// Prunes old non-winning history of one document. Returns the
    /// number of revisions removed.
    pub fn prune(&self, id: &DocId, before_generation: u64) -> usize {
        let mut inner = self.inner.write();
        inner
            .docs
            .get_mut(id)
            .map(|tree| tree.prune(before_generation))
            .unwrap_or(0)
    }

    fn commit(inner: &mut Inner, id: &DocId) -> ChangeEvent {
        inner.sequence += 1;
        let sequence = inner.sequence;
        inner.log.push((sequence, id.clone()));
        let (leaf_revisions, deleted) = inner
            .docs
            .get(id)
            .map(Self::leaf_snapshot)
            .unwrap_or((Vec::new(), true));
        ChangeEvent {
            sequence,
            id: id.clone(),
            leaf_revisions,
            deleted,
        }
    }

    fn leaf_snapshot(tree: &RevisionTree) -> (Vec<RevisionId>, bool) {
        let winner = tree.winning_revision();
        let deleted = winner.map(|w| w.is_tombstone()).unwrap_or(true);
        let mut ids: Vec<RevisionId> = Vec::new();
        if let Some(w) = winner {
            ids.push(w.id.clone());
        }
        let mut rest: Vec<RevisionId> = tree
            .conflicting_leaves()
            .into_iter()
            .map(|r| r.id.clone())
            .collect();
        rest.sort_by(|a, b| b.cmp(a));
        ids.extend(rest);
        (ids, deleted)
    }
}

impl Default for DocumentStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn store() -> DocumentStore {
        DocumentStore::new()
    }

    #[test]
    fn put_get_roundtrip() {
        let s = store();
        let id = DocId::from("d1");
        let rev = s.put(&id, None, b"hello".to_vec()).unwrap();

        let doc = s.get(&id).unwrap();
        assert_eq!(doc.revision.id, rev.id);
        assert_eq!(doc.body(), Some(b"hello".as_ref()));
        assert_eq!(s.last_sequence(), 1);
    }

    #[test]
    fn get_missing_is_not_found() {
        let s = store();
        let result = s.get(&DocId::from("nope"));
        assert!(matches!(result, Err(StoreError::NotFound { .. })));
    }

    #[test]
    fn stale_put_conflicts() {
        let s = store();
        let id = DocId::from("d1");
        let r1 = s.put(&id, None, vec![1]).unwrap();
        let _r2 = s.put(&id, Some(&r1.id), vec![2]).unwrap();

        // r1 is no longer a leaf.
        let result = s.put(&id, Some(&r1.id), vec![3]);
        assert!(matches!(result, Err(StoreError::Conflict { .. })));

        // Creating over an existing live document also conflicts.
        let result = s.put(&id, None, vec![4]);
        assert!(matches!(result, Err(StoreError::Conflict { .. })));
    }

    #[test]
    fn remove_appends_tombstone_and_hides_document() {
        let s = store();
        let id = DocId::from("d1");
        let r1 = s.put(&id, None, vec![1]).unwrap();
        let tomb = s.remove(&id, &r1.id).unwrap();
        assert!(tomb.is_tombstone());
        assert_eq!(tomb.id.generation, 2);

        assert!(matches!(s.get(&id), Err(StoreError::NotFound { .. })));
        let doc = s.get_with_tombstone(&id).unwrap();
        assert!(doc.revision.is_tombstone());
    }

    #[test]
    fn recreate_after_delete_extends_tombstone() {
        let s = store();
        let id = DocId::from("d1");
        let r1 = s.put(&id, None, vec![1]).unwrap();
        let tomb = s.remove(&id, &r1.id).unwrap();

        let r3 = s.put(&id, None, vec![2]).unwrap();
        assert_eq!(r3.parent, Some(tomb.id));
        assert_eq!(r3.id.generation, 3);
        assert!(s.get(&id).is_ok());
    }

    #[test]
    fn racing_writes_on_same_parent_one_wins() {
        let s = Arc::new(store());
        let id = DocId::from("d1");
        let r1 = s.put(&id, None, vec![0]).unwrap();

        let mut handles = Vec::new();
        for i in 0..2u8 {
            let s = Arc::clone(&s);
            let id = id.clone();
            let parent = r1.id.clone();
            handles.push(thread::spawn(move || s.put(&id, Some(&parent), vec![i + 1])));
        }
        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        let ok = results.iter().filter(|r| r.is_ok()).count();
        let conflicts = results
            .iter()
            .filter(|r| matches!(r, Err(StoreError::Conflict { .. })))
            .count();
        assert_eq!(ok, 1, "exactly one racing write succeeds");
        assert_eq!(conflicts, 1, "the loser sees Conflict");
        assert_eq!(s.leaf_revisions(&id).len(), 1, "no silent double leaf");
    }

    #[test]
    fn changes_since_dedupes_to_latest_per_doc() {
        let s = store();
        let a = DocId::from("a");
        let b = DocId::from("b");
        let ra = s.put(&a, None, vec![1]).unwrap();
        s.put(&b, None, vec![2]).unwrap();
        s.put(&a, Some(&ra.id), vec![3]).unwrap();

        let changes = s.changes_since(0);
        assert_eq!(changes.len(), 2);
        // b changed at seq 2, a last changed at seq 3.
        assert_eq!(changes[0].id, b);
        assert_eq!(changes[0].sequence, 2);
        assert_eq!(changes[1].id, a);
        assert_eq!(changes[1].sequence, 3);

        // Restartable from a later cursor.
        let tail = s.changes_since(2);
        assert_eq!(tail.len(), 1);
        assert_eq!(tail[0].id, a);
    }

    #[test]
    fn change_feed_emits_after_commit() {
        let s = store();
        let rx = s.subscribe();
        let id = DocId::from("d1");
        s.put(&id, None, vec![1]).unwrap();

        let event = rx.recv().unwrap();
        assert_eq!(event.id, id);
        assert_eq!(event.sequence, 1);
        assert!(!event.deleted);
        assert_eq!(event.leaf_revisions.len(), 1);
    }

    #[test]
    fn apply_revisions_is_idempotent() {
        let source = store();
        let target = store();
        let id = DocId::from("d1");
        let r1 = source.put(&id, None, vec![1]).unwrap();
        let r2 = source.put(&id, Some(&r1.id), vec![2]).unwrap();

        let transfer = source.revision_with_ancestry(&id, &r2.id).unwrap();

        let first = target.apply_revisions(&id, vec![transfer.clone()]).unwrap();
        assert!(first.applied > 0);
        assert!(!first.created_conflict);

        let second = target.apply_revisions(&id, vec![transfer]).unwrap();
        assert_eq!(second.applied, 0, "re-application is a no-op");
        assert_eq!(target.leaf_revisions(&id).len(), 1);
    }

    #[test]
    fn apply_divergent_revision_creates_conflict_leaf() {
        let a = store();
        let b = store();
        let id = DocId::from("d1");

        // Same root everywhere (content addressing), divergent children.
        let root_a = a.put(&id, None, vec![0]).unwrap();
        let transfer_root = a.revision_with_ancestry(&id, &root_a.id).unwrap();
        b.apply_revisions(&id, vec![transfer_root]).unwrap();
        let root_b = b.get(&id).unwrap().revision;
        assert_eq!(root_a.id, root_b.id);

        a.put(&id, Some(&root_a.id), vec![1]).unwrap();
        let rb = b.put(&id, Some(&root_b.id), vec![2]).unwrap();

        let transfer = b.revision_with_ancestry(&id, &rb.id).unwrap();
        let outcome = a.apply_revisions(&id, vec![transfer]).unwrap();
        assert!(outcome.created_conflict);
        assert_eq!(a.leaf_revisions(&id).len(), 2);
        assert_eq!(a.conflicts(&id).len(), 1);
    }

    #[test]
    fn rejected_transfer_keeps_local_writes_usable() {
        let s = store();
        let id = DocId::from("d1");
        let r1 = s.put(&id, None, vec![1]).unwrap();

        // A peer extends the shared root twice; the leaf body is
        // tampered in transit, so its ancestry names a revision this
        // store has never seen.
        let peer = store();
        let p1 = peer.put(&id, None, vec![1]).unwrap();
        assert_eq!(p1.id, r1.id);
        let p2 = peer.put(&id, Some(&p1.id), vec![2]).unwrap();
        let p3 = peer.put(&id, Some(&p2.id), vec![3]).unwrap();
        let mut transfer = peer.revision_with_ancestry(&id, &p3.id).unwrap();
        transfer.revision.body = Some(vec![99]);

        let result = s.apply_revisions(&id, vec![transfer]);
        assert!(matches!(result, Err(StoreError::InvalidRevision { .. })));

        // The rejection must not leave a stub of p2 shadowing r1 as a
        // phantom child; the winner stays a real leaf and accepts the
        // next write.
        assert_eq!(s.leaf_revisions(&id), vec![r1.id.clone()]);
        let winner = s.get(&id).unwrap().revision;
        assert_eq!(winner.id, r1.id);
        s.put(&id, Some(&winner.id), vec![4]).unwrap();
    }

    #[test]
    fn rejected_batch_applies_nothing_and_emits_nothing() {
        let source = store();
        let target = store();
        let id = DocId::from("d1");
        let r1 = source.put(&id, None, vec![1]).unwrap();
        let r2 = source.put(&id, Some(&r1.id), vec![2]).unwrap();

        let valid = source.revision_with_ancestry(&id, &r1.id).unwrap();
        let mut forged = source.revision_with_ancestry(&id, &r2.id).unwrap();
        forged.revision.body = Some(vec![99]);

        let result = target.apply_revisions(&id, vec![valid, forged]);
        assert!(matches!(result, Err(StoreError::InvalidRevision { .. })));

        // All or nothing: no half-applied revisions invisible to the
        // change feed, no document entry at all.
        assert!(matches!(target.get(&id), Err(StoreError::NotFound { .. })));
        assert!(target.changes_since(0).is_empty());
        assert_eq!(target.last_sequence(), 0);
        assert!(target.is_empty());
    }

    #[test]
    fn failed_create_does_not_register_document() {
        let s = store();
        let id = DocId::from("d1");
        let phantom = Revision::derive(None, Some(vec![1]), false, StoreId::generate(), 0);

        let result = s.put(&id, Some(&phantom.id), vec![2]);
        assert!(matches!(result, Err(StoreError::Conflict { .. })));

        assert!(s.is_empty());
        assert_eq!(s.len(), 0);
        assert!(s.leaf_revisions(&id).is_empty());
    }

    #[test]
    fn apply_rejects_forged_revision() {
        let s = store();
        let id = DocId::from("d1");
        let mut forged = Revision::derive(None, Some(vec![1]), false, StoreId::generate(), 0);
        forged.body = Some(vec![99]);
        let result = s.apply_revisions(
            &id,
            vec![TransferredRevision {
                revision: forged,
                ancestry: vec![],
            }],
        );
        assert!(matches!(result, Err(StoreError::InvalidRevision { .. })));
    }

    #[test]
    fn missing_revisions_on_absent_doc_wants_everything() {
        let s = store();
        let id = DocId::from("d1");
        let rev = Revision::derive(None, Some(vec![1]), false, StoreId::generate(), 0);
        let missing = s.missing_revisions(&id, &[rev.id.clone()]);
        assert_eq!(missing, vec![rev.id]);
    }

    #[test]
    fn prune_removes_old_conflict_branches() {
        let s = store();
        let id = DocId::from("d1");
        let r1 = s.put(&id, None, vec![0]).unwrap();
        let mut head = s.put(&id, Some(&r1.id), vec![1]).unwrap().id;
        for i in 2..6u8 {
            head = s.put(&id, Some(&head), vec![i]).unwrap().id;
        }
        // Divergent old branch via replication.
        let other = store();
        let o1 = other.put(&id, None, vec![0]).unwrap();
        let o2 = other.put(&id, Some(&o1.id), vec![9]).unwrap();
        let transfer = other.revision_with_ancestry(&id, &o2.id).unwrap();
        s.apply_revisions(&id, vec![transfer]).unwrap();
        assert_eq!(s.conflicts(&id).len(), 1);

        let removed = s.prune(&id, 4);
        assert!(removed > 0);
        assert!(s.conflicts(&id).is_empty());
        assert!(s.get(&id).is_ok());
    }
}
