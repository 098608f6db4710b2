//! Per-document revision trees.
//!
//! The tree is an arena of immutable revision records keyed by their
//! content-addressed identity. Parent pointers are keys into the same
//! arena, never references, so shared ancestors and multiple leaves
//! cost nothing and deduplication falls out of the keying.

use crate::error::{StoreError, StoreResult};
use crate::resolver::ConflictResolver;
use crate::revision::{DocId, Revision, RevisionId, StoreId};
use std::collections::{BTreeMap, BTreeSet};

/// The revision history of one document.
///
/// Append-only: records are inserted, never mutated, with one exception:
/// a stub record may later be completed by the full revision carrying
/// the same identity.
#[derive(Debug, Clone)]
pub struct RevisionTree {
    id: DocId,
    revisions: BTreeMap<RevisionId, Revision>,
    resolver: ConflictResolver,
    /// Cached winner, recomputed whenever the leaf set changes.
    winner: Option<RevisionId>,
}

impl RevisionTree {
    /// Creates an empty tree for the given document.
    pub fn new(id: DocId, resolver: ConflictResolver) -> Self {
        Self {
            id,
            revisions: BTreeMap::new(),
            resolver,
            winner: None,
        }
    }

    /// The document this tree belongs to.
    pub fn doc_id(&self) -> &DocId {
        &self.id
    }

    /// Number of revisions in the arena, stubs included.
    pub fn len(&self) -> usize {
        self.revisions.len()
    }

    /// True if the tree holds no revisions.
    pub fn is_empty(&self) -> bool {
        self.revisions.is_empty()
    }

    /// Returns the revision with the given identity, if present.
    pub fn get(&self, id: &RevisionId) -> Option<&Revision> {
        self.revisions.get(id)
    }

    /// True if the identity is present, stub or not.
    pub fn contains(&self, id: &RevisionId) -> bool {
        self.revisions.contains_key(id)
    }

    /// Derives and appends a new revision as a child of `parent`.
    ///
    /// Fails with `UnknownParent` if `parent` is set but absent from the
    /// arena. The new revision's identity is computed here; callers never
    /// supply one.
    pub fn insert(
        &mut self,
        parent: Option<&RevisionId>,
        body: Option<Vec<u8>>,
        deleted: bool,
        origin: StoreId,
        logical_ts: u64,
    ) -> StoreResult<Revision> {
        if let Some(p) = parent {
            if !self.revisions.contains_key(p) {
                return Err(StoreError::unknown_parent(&self.id, p));
            }
        }
        let revision = Revision::derive(parent, body, deleted, origin, logical_ts);
        self.revisions.insert(revision.id.clone(), revision.clone());
        self.recompute_winner();
        Ok(revision)
    }

    /// Inserts a revision that already carries its identity (the
    /// replication ingest path).
    ///
    /// Returns `false` when the identity is already present with content,
    /// making re-application a no-op. A present stub is completed in
    /// place. The identity is verified against the revision's content;
    /// a mismatch is rejected with `InvalidRevision`.
    pub fn insert_existing(&mut self, revision: Revision) -> StoreResult<bool> {
        if !revision.verify_identity() {
            return Err(StoreError::invalid_revision(
                &self.id,
                &revision.id,
                "content hash does not match identity",
            ));
        }
        if let Some(p) = &revision.parent {
            if !self.revisions.contains_key(p) {
                return Err(StoreError::unknown_parent(&self.id, p));
            }
        }
        match self.revisions.get(&revision.id) {
            Some(existing) if !existing.is_stub() => return Ok(false),
            Some(_) if revision.is_stub() => return Ok(false),
            _ => {}
        }
        self.revisions.insert(revision.id.clone(), revision);
        self.recompute_winner();
        Ok(true)
    }

    /// Validates a transferred revision against its claimed ancestry
    /// without touching the arena.
    ///
    /// Covers everything [`graft`](Self::graft) could reject, so a
    /// whole batch can be vetted before its first mutation.
    pub fn check_graft(
        id: &DocId,
        ancestry: &[RevisionId],
        revision: &Revision,
    ) -> StoreResult<()> {
        if !revision.verify_identity() {
            return Err(StoreError::invalid_revision(
                id,
                &revision.id,
                "content hash does not match identity",
            ));
        }
        if revision.parent.as_ref() != ancestry.last() {
            return Err(StoreError::invalid_revision(
                id,
                &revision.id,
                "ancestry does not end at the revision's parent",
            ));
        }
        for (depth, ancestor) in ancestry.iter().enumerate() {
            if ancestor.generation != depth as u64 + 1 {
                return Err(StoreError::invalid_revision(
                    id,
                    ancestor,
                    "ancestry generations are not contiguous from 1",
                ));
            }
        }
        Ok(())
    }

    /// Grafts a replicated revision whose ancestry may be unknown here.
    ///
    /// `ancestry` lists identities from the root to the revision's
    /// parent. Unknown ancestors are inserted as stubs so the lineage
    /// stays connected; known ones are left untouched. Returns `true`
    /// if the tree changed.
    ///
    /// The revision is validated before any stub is inserted: a
    /// rejected revision leaves the arena exactly as it was. An orphan
    /// stub would otherwise shadow the real leaves as a phantom child.
    pub fn graft(&mut self, ancestry: &[RevisionId], revision: Revision) -> StoreResult<bool> {
        Self::check_graft(&self.id, ancestry, &revision)?;
        let mut changed = false;
        let mut prev: Option<RevisionId> = None;
        for ancestor in ancestry {
            if !self.revisions.contains_key(ancestor) {
                let stub = Revision {
                    id: ancestor.clone(),
                    parent: prev.clone(),
                    deleted: false,
                    body: None,
                    origin: revision.origin,
                    logical_ts: 0,
                };
                self.revisions.insert(ancestor.clone(), stub);
                changed = true;
            }
            prev = Some(ancestor.clone());
        }
        let inserted = self.insert_existing(revision)?;
        if changed && !inserted {
            // Stubs alone changed the arena; the winner cannot have moved
            // but the cache is cheap to refresh.
            self.recompute_winner();
        }
        Ok(changed || inserted)
    }

    /// All revisions with no children, stubs excluded.
    ///
    /// These are the current heads of every branch of history, the
    /// winner and its conflicting siblings alike.
    pub fn leaves(&self) -> Vec<&Revision> {
        let parents: BTreeSet<&RevisionId> = self
            .revisions
            .values()
            .filter_map(|r| r.parent.as_ref())
            .collect();
        self.revisions
            .values()
            .filter(|r| !parents.contains(&r.id) && !r.is_stub())
            .collect()
    }

    /// The leaf selected by the conflict resolver, if any.
    pub fn winning_revision(&self) -> Option<&Revision> {
        self.winner.as_ref().and_then(|id| self.revisions.get(id))
    }

    /// Leaves other than the winner: the conflicting revisions.
    pub fn conflicting_leaves(&self) -> Vec<&Revision> {
        self.leaves()
            .into_iter()
            .filter(|r| Some(&r.id) != self.winner.as_ref())
            .collect()
    }

    /// Identities from the root to `revision`, inclusive.
    ///
    /// Used to ship lineage between stores without shipping bodies.
    pub fn path(&self, revision: &RevisionId) -> Option<Vec<RevisionId>> {
        let mut ids = Vec::new();
        let mut cursor = self.revisions.get(revision)?;
        loop {
            ids.push(cursor.id.clone());
            match &cursor.parent {
                Some(p) => cursor = self.revisions.get(p)?,
                None => break,
            }
        }
        ids.reverse();
        Some(ids)
    }

    /// Filters `candidates` down to identities this tree still needs.
    ///
    /// A present stub counts as missing: its identity is known but its
    /// body has never arrived.
    pub fn missing(&self, candidates: &[RevisionId]) -> Vec<RevisionId> {
        candidates
            .iter()
            .filter(|id| match self.revisions.get(id) {
                None => true,
                Some(r) => r.is_stub(),
            })
            .cloned()
            .collect()
    }

    /// Removes revisions older than `before_generation` on non-winning
    /// branches, keeping anything that a surviving leaf still reaches.
    ///
    /// The winning branch is never touched. Returns the number of
    /// revisions removed.
    pub fn prune(&mut self, before_generation: u64) -> usize {
        let mut keep: BTreeSet<RevisionId> = BTreeSet::new();
        for leaf in self.leaves() {
            let survives = Some(&leaf.id) == self.winner.as_ref()
                || leaf.id.generation >= before_generation;
            if survives {
                if let Some(path) = self.path(&leaf.id) {
                    keep.extend(path);
                }
            }
        }
        let before = self.revisions.len();
        self.revisions
            .retain(|id, _| id.generation >= before_generation || keep.contains(id));
        // Pruning can only drop whole losing branches, but keep the
        // cache honest regardless.
        self.recompute_winner();
        before - self.revisions.len()
    }

    fn recompute_winner(&mut self) {
        let leaves = self.leaves();
        self.winner = self.resolver.winner(&leaves).map(|r| r.id.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolver::ConflictResolver;

    fn origin() -> StoreId {
        StoreId::from_bytes([1u8; 16])
    }

    fn tree() -> RevisionTree {
        RevisionTree::new(DocId::from("d1"), ConflictResolver::default())
    }

    #[test]
    fn insert_builds_lineage() {
        let mut t = tree();
        let r1 = t.insert(None, Some(vec![1]), false, origin(), 0).unwrap();
        let r2 = t
            .insert(Some(&r1.id), Some(vec![2]), false, origin(), 1)
            .unwrap();

        assert_eq!(r1.id.generation, 1);
        assert_eq!(r2.id.generation, 2);
        assert_eq!(t.leaves().len(), 1);
        assert_eq!(t.winning_revision().unwrap().id, r2.id);
        assert_eq!(t.path(&r2.id).unwrap(), vec![r1.id, r2.id]);
    }

    #[test]
    fn insert_rejects_unknown_parent() {
        let mut t = tree();
        let phantom = Revision::derive(None, Some(vec![9]), false, origin(), 0);
        let result = t.insert(Some(&phantom.id), Some(vec![1]), false, origin(), 0);
        assert!(matches!(result, Err(StoreError::UnknownParent { .. })));
    }

    #[test]
    fn divergent_children_become_conflicting_leaves() {
        let mut t = tree();
        let root = t.insert(None, Some(vec![0]), false, origin(), 0).unwrap();
        let a = t
            .insert(Some(&root.id), Some(vec![1]), false, origin(), 1)
            .unwrap();
        let b = t
            .insert(Some(&root.id), Some(vec![2]), false, origin(), 2)
            .unwrap();

        assert_eq!(t.leaves().len(), 2);
        let winner = t.winning_revision().unwrap();
        let expected = if a.id > b.id { &a } else { &b };
        assert_eq!(winner.id, expected.id);
        assert_eq!(t.conflicting_leaves().len(), 1);
    }

    #[test]
    fn reinserting_existing_revision_is_noop() {
        let mut t = tree();
        let r1 = t.insert(None, Some(vec![1]), false, origin(), 0).unwrap();

        assert!(!t.insert_existing(r1.clone()).unwrap());
        assert_eq!(t.len(), 1);
    }

    #[test]
    fn insert_existing_verifies_hash() {
        let mut t = tree();
        let mut forged = Revision::derive(None, Some(vec![1]), false, origin(), 0);
        forged.body = Some(vec![2]);
        let result = t.insert_existing(forged);
        assert!(matches!(result, Err(StoreError::InvalidRevision { .. })));
    }

    #[test]
    fn graft_fills_unknown_ancestry_with_stubs() {
        // Build history elsewhere, then graft only the leaf here.
        let mut remote = tree();
        let r1 = remote.insert(None, Some(vec![1]), false, origin(), 0).unwrap();
        let r2 = remote
            .insert(Some(&r1.id), Some(vec![2]), false, origin(), 1)
            .unwrap();
        let r3 = remote
            .insert(Some(&r2.id), Some(vec![3]), false, origin(), 2)
            .unwrap();

        let mut local = tree();
        let ancestry = vec![r1.id.clone(), r2.id.clone()];
        assert!(local.graft(&ancestry, r3.clone()).unwrap());

        assert_eq!(local.len(), 3);
        assert!(local.get(&r1.id).unwrap().is_stub());
        assert!(local.get(&r2.id).unwrap().is_stub());
        assert_eq!(local.winning_revision().unwrap().id, r3.id);
        // Stubs count as missing until a body arrives.
        assert_eq!(local.missing(&[r2.id.clone()]), vec![r2.id.clone()]);

        // A later full copy of r2 completes the stub.
        assert!(local.insert_existing(r2.clone()).unwrap());
        assert!(local.missing(&[r2.id.clone()]).is_empty());
    }

    #[test]
    fn rejected_graft_leaves_no_stub_residue() {
        // Lineage built elsewhere, leaf body tampered in transit.
        let mut remote = tree();
        let r1 = remote.insert(None, Some(vec![1]), false, origin(), 0).unwrap();
        let r2 = remote
            .insert(Some(&r1.id), Some(vec![2]), false, origin(), 1)
            .unwrap();
        let mut r3 = remote
            .insert(Some(&r2.id), Some(vec![3]), false, origin(), 2)
            .unwrap();
        r3.body = Some(vec![99]);

        let mut local = tree();
        let base = local.insert(None, Some(vec![1]), false, origin(), 0).unwrap();
        assert_eq!(base.id, r1.id);

        let ancestry = vec![r1.id.clone(), r2.id.clone()];
        let result = local.graft(&ancestry, r3);
        assert!(matches!(result, Err(StoreError::InvalidRevision { .. })));

        // No stub for r2 may remain: it would shadow the real leaf as
        // a phantom child and empty the leaf set.
        assert_eq!(local.len(), 1);
        assert!(!local.contains(&r2.id));
        assert_eq!(local.leaves().len(), 1);
        assert_eq!(local.winning_revision().unwrap().id, base.id);
        // And the document still accepts ordinary writes.
        local
            .insert(Some(&base.id), Some(vec![4]), false, origin(), 3)
            .unwrap();
    }

    #[test]
    fn graft_rejects_disconnected_ancestry() {
        let mut t = tree();
        let r1 = Revision::derive(None, Some(vec![1]), false, origin(), 0);
        let r2 = Revision::derive(Some(&r1.id), Some(vec![2]), false, origin(), 0);
        // Ancestry claims r1 only, but r2's parent is r1 — passing an
        // empty ancestry must fail.
        let result = t.graft(&[], r2);
        assert!(matches!(result, Err(StoreError::InvalidRevision { .. })));
    }

    #[test]
    fn tombstone_can_be_a_losing_branch() {
        let mut t = tree();
        let root = t.insert(None, Some(vec![0]), false, origin(), 0).unwrap();
        let dead = t.insert(Some(&root.id), None, true, origin(), 1).unwrap();
        let live = t
            .insert(Some(&dead.id), Some(vec![1]), false, origin(), 2)
            .unwrap();

        assert_eq!(t.winning_revision().unwrap().id, live.id);
        assert!(t.get(&dead.id).unwrap().is_tombstone());
    }

    #[test]
    fn prune_drops_old_losing_branches_only() {
        let mut t = tree();
        let root = t.insert(None, Some(vec![0]), false, origin(), 0).unwrap();
        let losing = t
            .insert(Some(&root.id), Some(vec![1]), false, origin(), 1)
            .unwrap();
        let mut parent = root.id.clone();
        for i in 0..4u8 {
            parent = t
                .insert(Some(&parent), Some(vec![10 + i]), false, origin(), 2)
                .unwrap()
                .id;
        }
        let winner_before = t.winning_revision().unwrap().id.clone();
        assert_eq!(winner_before.generation, 5);

        let removed = t.prune(3);
        assert_eq!(removed, 1, "only the old losing leaf goes");
        assert!(!t.contains(&losing.id));
        // Winner and its full ancestry survive.
        assert_eq!(t.winning_revision().unwrap().id, winner_before);
        assert!(t.contains(&root.id));
    }

    #[test]
    fn prune_keeps_shared_ancestors_of_surviving_leaves() {
        let mut t = tree();
        let root = t.insert(None, Some(vec![0]), false, origin(), 0).unwrap();
        let a = t
            .insert(Some(&root.id), Some(vec![1]), false, origin(), 1)
            .unwrap();
        let b = t
            .insert(Some(&root.id), Some(vec![2]), false, origin(), 2)
            .unwrap();

        // Both leaves are at generation 2 and survive the bound; the
        // shared root at generation 1 must survive with them.
        t.prune(2);
        assert!(t.contains(&root.id));
        assert!(t.contains(&a.id));
        assert!(t.contains(&b.id));
    }
}
