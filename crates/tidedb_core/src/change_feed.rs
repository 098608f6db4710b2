//! Change feed for observing committed mutations.
//!
//! Every mutation of the document store gets a monotonically increasing
//! sequence number and is published here after it commits. The feed
//! backs two consumers:
//! - replication, which restarts from an arbitrary sequence cursor
//! - live subscribers (watchers, reactive UI) via mpsc receivers

use crate::revision::{DocId, RevisionId};
use parking_lot::RwLock;
use std::sync::mpsc::{self, Receiver, Sender};

/// A single committed change to one document.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent {
    /// Sequence number of the mutation.
    pub sequence: u64,
    /// The document that changed.
    pub id: DocId,
    /// Current leaf revision identities after the change, winner first.
    pub leaf_revisions: Vec<RevisionId>,
    /// True if the winning revision is now a tombstone.
    pub deleted: bool,
}

/// Distributes committed changes to subscribers and keeps a bounded
/// history for cursor-based polling.
///
/// - Emits only committed mutations, in commit order
/// - Supports multiple subscribers; disconnected ones are dropped
/// - Thread-safe
pub struct ChangeFeed {
    subscribers: RwLock<Vec<Sender<ChangeEvent>>>,
    history: RwLock<Vec<ChangeEvent>>,
    max_history: usize,
}

impl ChangeFeed {
    /// Creates a feed with the default history bound.
    pub fn new() -> Self {
        Self::with_max_history(10_000)
    }

    /// Creates a feed with a specific history bound.
    pub fn with_max_history(max_history: usize) -> Self {
        Self {
            subscribers: RwLock::new(Vec::new()),
            history: RwLock::new(Vec::new()),
            max_history,
        }
    }

    /// Subscribes to all future change events.
    pub fn subscribe(&self) -> Receiver<ChangeEvent> {
        let (tx, rx) = mpsc::channel();
        self.subscribers.write().push(tx);
        rx
    }

    /// Publishes a committed change to history and all subscribers.
    pub fn emit(&self, event: ChangeEvent) {
        {
            let mut history = self.history.write();
            history.push(event.clone());
            if history.len() > self.max_history {
                let overflow = history.len() - self.max_history;
                history.drain(0..overflow);
            }
        }
        let mut subscribers = self.subscribers.write();
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }

    /// Returns buffered events with `sequence > cursor`, up to `limit`.
    pub fn poll(&self, cursor: u64, limit: usize) -> Vec<ChangeEvent> {
        let history = self.history.read();
        history
            .iter()
            .filter(|e| e.sequence > cursor)
            .take(limit)
            .cloned()
            .collect()
    }

    /// Latest sequence number in history, 0 when empty.
    pub fn latest_sequence(&self) -> u64 {
        self.history.read().last().map(|e| e.sequence).unwrap_or(0)
    }

    /// Number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }
}

impl Default for ChangeFeed {
    fn default() -> Self {
        Self::new()
    }
}
