//! # tidedb core
//!
//! Revision-tree document store for tidedb.
//!
//! This crate provides:
//! - Content-addressed revision identity (generation + SHA-256 hash)
//! - Per-document revision trees with deterministic conflict resolution
//! - A document store with optimistic concurrency control
//! - A change feed emitting committed mutations in sequence order
//!
//! ## Architecture
//!
//! Each document is a tree of immutable revisions rooted at creation.
//! Concurrent edits from different stores produce divergent leaves;
//! the conflict resolver picks one **winning revision** deterministically
//! so that replicas converge without coordination. Losing leaves stay
//! stored and retrievable until explicitly pruned.
//!
//! ## Key Invariants
//!
//! - Revision identity is derived from parent + content, never assigned
//! - Re-inserting a known revision is a no-op (idempotent replication)
//! - Deletion appends a tombstone; history is never silently lost
//! - Exactly one leaf per document is the winner; ties cannot occur
//!   because identities are unique

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod change_feed;
mod error;
mod resolver;
mod rev_tree;
mod revision;
mod store;

pub use change_feed::{ChangeEvent, ChangeFeed};
pub use error::{StoreError, StoreResult};
pub use resolver::{ConflictResolver, TombstonePreference};
pub use rev_tree::RevisionTree;
pub use revision::{DocId, RevHash, Revision, RevisionId, StoreId, TransferredRevision};
pub use store::{ApplyOutcome, Document, DocumentStore};
