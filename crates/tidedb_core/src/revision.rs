//! Document and revision identities.
//!
//! A revision's identity is the pair `(generation, hash)` where the hash
//! is derived from the parent identity, the deleted flag and the body
//! bytes. Two stores that derive the same edit from the same ancestor
//! produce the same identity, which is what makes re-applying a
//! replicated revision a no-op.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use uuid::Uuid;

/// Domain separation tag for revision hashing.
const HASH_TAG: &[u8] = b"tidedb-rev-v1";

/// Identifier of a document, unique within a store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DocId(String);

impl DocId {
    /// Creates a document id from a string.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for DocId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for DocId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl fmt::Display for DocId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifier of a store participating in replication.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StoreId(Uuid);

impl StoreId {
    /// Generates a fresh random store id.
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    /// Creates a store id from raw bytes.
    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(Uuid::from_bytes(bytes))
    }

    /// Returns the underlying uuid.
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Display for StoreId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.simple())
    }
}

/// SHA-256 content hash of a revision.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RevHash(pub [u8; 32]);

impl RevHash {
    /// Returns the hash as a hex string.
    pub fn to_hex(&self) -> String {
        let mut s = String::with_capacity(64);
        for b in &self.0 {
            use fmt::Write;
            let _ = write!(s, "{b:02x}");
        }
        s
    }
}

impl fmt::Debug for RevHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RevHash({})", self.to_hex())
    }
}

impl fmt::Display for RevHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// Identity of one revision: generation number plus content hash.
///
/// Ordering is (generation, hash bytes), which is exactly the order the
/// conflict resolver uses: greatest generation wins, lexicographically
/// greatest hash breaks ties.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RevisionId {
    /// Distance from the root, starting at 1.
    pub generation: u64,
    /// Content-derived hash.
    pub hash: RevHash,
}

impl RevisionId {
    /// Creates a revision id.
    pub fn new(generation: u64, hash: RevHash) -> Self {
        Self { generation, hash }
    }
}

impl fmt::Display for RevisionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.generation, self.hash)
    }
}

/// One immutable version of a document.
///
/// A record with `deleted == true` and no body is a **tombstone**.
/// A record with `deleted == false` and no body is a **stub**: a lineage
/// placeholder created while grafting replicated history whose ancestors
/// this store never saw. Stubs are never eligible winners.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Revision {
    /// Content-addressed identity.
    pub id: RevisionId,
    /// Identity of the revision this one was derived from.
    pub parent: Option<RevisionId>,
    /// True if this revision marks a deletion.
    pub deleted: bool,
    /// Opaque document payload. None for tombstones and stubs.
    pub body: Option<Vec<u8>>,
    /// The store that produced this revision.
    pub origin: StoreId,
    /// Logical timestamp at the origin. Derivation metadata only,
    /// never used for ordering.
    pub logical_ts: u64,
}

impl Revision {
    /// Builds a new revision, computing its content-addressed identity.
    pub fn derive(
        parent: Option<&RevisionId>,
        body: Option<Vec<u8>>,
        deleted: bool,
        origin: StoreId,
        logical_ts: u64,
    ) -> Self {
        let generation = parent.map(|p| p.generation + 1).unwrap_or(1);
        let hash = content_hash(parent, deleted, body.as_deref());
        Self {
            id: RevisionId::new(generation, hash),
            parent: parent.cloned(),
            deleted,
            body,
            origin,
            logical_ts,
        }
    }

    /// True if this revision is a tombstone.
    pub fn is_tombstone(&self) -> bool {
        self.deleted
    }

    /// True if this revision is a body-less lineage placeholder.
    pub fn is_stub(&self) -> bool {
        !self.deleted && self.body.is_none()
    }

    /// Recomputes the content hash and checks it against the identity.
    ///
    /// Stubs cannot be verified (the body is absent by construction),
    /// so they always pass.
    pub fn verify_identity(&self) -> bool {
        if self.is_stub() {
            return true;
        }
        if let Some(parent) = &self.parent {
            if parent.generation + 1 != self.id.generation {
                return false;
            }
        } else if self.id.generation != 1 {
            return false;
        }
        content_hash(self.parent.as_ref(), self.deleted, self.body.as_deref()) == self.id.hash
    }
}

/// A revision travelling between stores, with enough lineage for the
/// receiver to graft it onto a tree that never saw the intermediate
/// history. `ancestry` lists identities from the root to the parent.
///
/// The hash travels with the revision and is never recomputed by the
/// transport; the receiving store verifies it on ingest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferredRevision {
    /// The revision, including its body.
    pub revision: Revision,
    /// Root-to-parent revision identities.
    pub ancestry: Vec<RevisionId>,
}

/// Computes the content hash of a revision.
///
/// Deterministic and origin-independent: the hash covers the parent
/// identity, the deleted flag and the body bytes, nothing else.
pub(crate) fn content_hash(
    parent: Option<&RevisionId>,
    deleted: bool,
    body: Option<&[u8]>,
) -> RevHash {
    let mut hasher = Sha256::new();
    hasher.update(HASH_TAG);
    match parent {
        Some(p) => {
            hasher.update([1u8]);
            hasher.update(p.generation.to_le_bytes());
            hasher.update(p.hash.0);
        }
        None => hasher.update([0u8]),
    }
    hasher.update([u8::from(deleted)]);
    match body {
        Some(bytes) => {
            hasher.update((bytes.len() as u64).to_le_bytes());
            hasher.update(bytes);
        }
        None => hasher.update(u64::MAX.to_le_bytes()),
    }
    RevHash(hasher.finalize().into())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn origin() -> StoreId {
        StoreId::from_bytes([7u8; 16])
    }

    #[test]
    fn hash_is_origin_independent() {
        let a = Revision::derive(None, Some(vec![1, 2, 3]), false, origin(), 10);
        let b = Revision::derive(
            None,
            Some(vec![1, 2, 3]),
            false,
            StoreId::from_bytes([9u8; 16]),
            999,
        );
        assert_eq!(a.id, b.id);
    }

    #[test]
    fn hash_covers_parent_body_and_deleted() {
        let root = Revision::derive(None, Some(vec![1]), false, origin(), 0);
        let child = Revision::derive(Some(&root.id), Some(vec![1]), false, origin(), 0);
        assert_ne!(root.id, child.id);
        assert_eq!(child.id.generation, 2);

        let other_body = Revision::derive(Some(&root.id), Some(vec![2]), false, origin(), 0);
        assert_ne!(child.id.hash, other_body.id.hash);

        let tombstone = Revision::derive(Some(&root.id), None, true, origin(), 0);
        assert!(tombstone.is_tombstone());
        assert_ne!(tombstone.id.hash, child.id.hash);
    }

    #[test]
    fn verify_identity_catches_tampering() {
        let mut rev = Revision::derive(None, Some(vec![1, 2]), false, origin(), 0);
        assert!(rev.verify_identity());

        rev.body = Some(vec![3, 4]);
        assert!(!rev.verify_identity());
    }

    #[test]
    fn verify_identity_checks_generation_linkage() {
        let root = Revision::derive(None, Some(vec![1]), false, origin(), 0);
        let mut child = Revision::derive(Some(&root.id), Some(vec![2]), false, origin(), 0);
        assert!(child.verify_identity());

        child.id.generation = 5;
        assert!(!child.verify_identity());
    }

    #[test]
    fn revision_id_ordering_matches_resolution_order() {
        let low = RevisionId::new(1, RevHash([0xff; 32]));
        let high = RevisionId::new(2, RevHash([0x00; 32]));
        assert!(high > low, "generation dominates hash");

        let a = RevisionId::new(2, RevHash([0x01; 32]));
        let b = RevisionId::new(2, RevHash([0x02; 32]));
        assert!(b > a, "hash breaks ties at equal generation");
    }

    #[test]
    fn display_format() {
        let id = RevisionId::new(3, RevHash([0xab; 32]));
        let shown = id.to_string();
        assert!(shown.starts_with("3-abab"));
    }
}
