//! Deterministic conflict resolution.
//!
//! The resolver is a pure function over the leaves of one document's
//! revision tree. Every replica must run the same comparator so that two
//! stores that have exchanged all revisions agree on the winner without
//! further communication.

use crate::revision::Revision;
use std::cmp::Ordering;

/// Deployment policy for tombstones that compete with live revisions.
///
/// The base order (generation, then hash) treats a tombstone like any
/// other leaf. Some deployments want deletes to stick, or conversely
/// want any surviving edit to beat a delete; this knob applies that
/// preference before the base order. All replicas in a deployment must
/// configure the same preference, otherwise they will not converge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TombstonePreference {
    /// Tombstones compete on equal footing (default).
    #[default]
    None,
    /// A live revision always beats a tombstone.
    PreferLive,
    /// A tombstone always beats a live revision.
    PreferTombstone,
}

/// Selects the winning revision among the leaves of one document.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConflictResolver {
    tombstone_preference: TombstonePreference,
}

impl ConflictResolver {
    /// Creates a resolver with the given tombstone preference.
    pub fn new(tombstone_preference: TombstonePreference) -> Self {
        Self {
            tombstone_preference,
        }
    }

    /// Returns the configured tombstone preference.
    pub fn tombstone_preference(&self) -> TombstonePreference {
        self.tombstone_preference
    }

    /// Compares two leaves; the greater one wins.
    ///
    /// Total order: tombstone preference (if configured), then
    /// generation, then lexicographic hash. Identities are unique, so
    /// `Equal` only occurs for the same revision.
    pub fn compare(&self, a: &Revision, b: &Revision) -> Ordering {
        match self.tombstone_preference {
            TombstonePreference::None => {}
            TombstonePreference::PreferLive => match (a.deleted, b.deleted) {
                (false, true) => return Ordering::Greater,
                (true, false) => return Ordering::Less,
                _ => {}
            },
            TombstonePreference::PreferTombstone => match (a.deleted, b.deleted) {
                (true, false) => return Ordering::Greater,
                (false, true) => return Ordering::Less,
                _ => {}
            },
        }
        a.id.cmp(&b.id)
    }

    /// Picks the winner among a set of leaves.
    ///
    /// Stubs are excluded: a lineage placeholder has no content to show.
    pub fn winner<'a>(&self, leaves: &[&'a Revision]) -> Option<&'a Revision> {
        leaves
            .iter()
            .copied()
            .filter(|r| !r.is_stub())
            .max_by(|a, b| self.compare(a, b))
    }
}
