//! Replication session: one direction, source to target.
//!
//! A session is an explicit state machine
//! `Idle → Diffing → Transferring → Applying → Checkpointed → Idle`,
//! with `Failed` reachable from any non-terminal state. Each cycle of
//! the loop moves one batch:
//!
//! 1. **Diffing** — read the persisted checkpoint, ask the source for
//!    leaf revisions since then, ask the target which identities it
//!    lacks (no bodies move).
//! 2. **Transferring** — fetch bodies only for the missing identities.
//! 3. **Applying** — submit per document; a rejected document is
//!    recorded and skipped, never aborts the batch.
//! 4. **Checkpointed** — persist the page cursor, strictly after the
//!    apply. A crash before this point re-diffs and re-applies, which
//!    content addressing makes a no-op.
//!
//! Transient transport failures revert to Diffing after backoff with
//! the last successful checkpoint intact. Cancellation is observed at
//! batch boundaries only; a partial batch never checkpoints.

use crate::checkpoint::{Checkpoint, CheckpointKey, CheckpointStore, Direction};
use crate::config::ReplConfig;
use crate::error::{ReplError, ReplResult};
use crate::remote::RemoteStore;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tidedb_core::{DocId, RevisionId, TransferredRevision};
use tracing::{debug, warn};

/// State of a replication session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Not running.
    Idle,
    /// Computing the revision diff against the target.
    Diffing,
    /// Fetching missing revision bodies from the source.
    Transferring,
    /// Submitting revisions to the target.
    Applying,
    /// A batch was durably applied and its checkpoint persisted.
    Checkpointed,
    /// The session gave up; the error is kept in `last_error`.
    Failed,
}

impl SessionState {
    /// True if the session is inside a batch.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            SessionState::Diffing | SessionState::Transferring | SessionState::Applying
        )
    }
}

/// Outcome of one session run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionSummary {
    /// Documents that received revisions on the target.
    pub docs_transferred: u64,
    /// Revisions that changed the target's trees.
    pub revisions_transferred: u64,
    /// Conflicting leaves newly created on the target.
    pub conflicts_created: u64,
    /// Documents the target rejected, with reasons. Skipped, not fatal.
    pub rejected: Vec<(DocId, String)>,
    /// Batches fully applied and checkpointed.
    pub batches: u64,
}

impl SessionSummary {
    fn merge(&mut self, other: &SessionSummary) {
        self.docs_transferred += other.docs_transferred;
        self.revisions_transferred += other.revisions_transferred;
        self.conflicts_created += other.conflicts_created;
        self.rejected.extend(other.rejected.iter().cloned());
        self.batches += other.batches;
    }
}

/// One directional replication session between two stores.
pub struct ReplicationSession {
    direction: Direction,
    source: Arc<dyn RemoteStore>,
    target: Arc<dyn RemoteStore>,
    checkpoints: Arc<dyn CheckpointStore>,
    config: ReplConfig,
    state: RwLock<SessionState>,
    last_error: RwLock<Option<String>>,
}

impl ReplicationSession {
    /// Creates a session replicating from `source` to `target`.
    pub fn new(
        direction: Direction,
        source: Arc<dyn RemoteStore>,
        target: Arc<dyn RemoteStore>,
        checkpoints: Arc<dyn CheckpointStore>,
        config: ReplConfig,
    ) -> Self {
        Self {
            direction,
            source,
            target,
            checkpoints,
            config,
            state: RwLock::new(SessionState::Idle),
            last_error: RwLock::new(None),
        }
    }

    /// The session's direction.
    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Current state.
    pub fn state(&self) -> SessionState {
        *self.state.read()
    }

    /// Last error message, if the session has failed.
    pub fn last_error(&self) -> Option<String> {
        self.last_error.read().clone()
    }

    /// The persisted checkpoint for this session, if any.
    pub fn checkpoint(&self) -> ReplResult<Option<Checkpoint>> {
        self.checkpoints.load(&self.key())
    }

    /// The checkpoint key: local/remote pair plus direction.
    pub fn key(&self) -> CheckpointKey {
        match self.direction {
            // Pull: the local store is the target.
            Direction::Pull => {
                CheckpointKey::new(self.target.store_id(), self.source.store_id(), self.direction)
            }
            // Push: the local store is the source.
            Direction::Push => {
                CheckpointKey::new(self.source.store_id(), self.target.store_id(), self.direction)
            }
        }
    }

    /// Runs the session to completion or until `cancel` is set.
    ///
    /// Cancellation is cooperative: the in-flight batch finishes and
    /// checkpoints before the session returns. Transient errors retry
    /// with backoff; exhausting the retry budget fails the session and
    /// preserves the last successful checkpoint.
    pub fn run(&self, cancel: &AtomicBool) -> ReplResult<SessionSummary> {
        let mut summary = SessionSummary::default();
        let mut backoff = self.config.retry.backoff();

        loop {
            if cancel.load(Ordering::SeqCst) {
                debug!(direction = %self.direction, "session cancelled at batch boundary");
                self.set_state(SessionState::Idle);
                return Ok(summary);
            }

            match self.run_batch() {
                Ok((batch, has_more)) => {
                    backoff = self.config.retry.backoff();
                    summary.merge(&batch);
                    self.set_state(SessionState::Checkpointed);
                    if !has_more {
                        self.set_state(SessionState::Idle);
                        *self.last_error.write() = None;
                        return Ok(summary);
                    }
                }
                Err(e) if e.is_retryable() => match backoff.next_delay() {
                    Some(delay) => {
                        warn!(
                            direction = %self.direction,
                            delay_ms = delay.as_millis() as u64,
                            retries_left = backoff.retries_left(),
                            error = %e,
                            "transient failure, retrying after backoff"
                        );
                        std::thread::sleep(delay);
                        // Back to Diffing with the last checkpoint intact.
                    }
                    None => return Err(self.fail(e)),
                },
                Err(e) => return Err(self.fail(e)),
            }
        }
    }

    /// Moves one batch through diff, transfer, apply and checkpoint.
    fn run_batch(&self) -> ReplResult<(SessionSummary, bool)> {
        let timeout = self.config.call_timeout;
        let mut batch = SessionSummary::default();

        // Diffing: identity comparison only, no bodies.
        self.set_state(SessionState::Diffing);
        let key = self.key();
        let since = self.checkpoints.load(&key)?;
        let page = self
            .source
            .changes_since(since, self.config.batch_size, timeout)?;

        let mut work: Vec<(DocId, Vec<RevisionId>)> = Vec::new();
        for change in &page.changes {
            let missing =
                self.target
                    .missing_revisions(&change.id, &change.leaf_revisions, timeout)?;
            if !missing.is_empty() {
                work.push((change.id.clone(), missing));
            }
        }

        // Transferring: bodies for missing identities only. Bounded by
        // the page size, which is the session's backpressure point.
        self.set_state(SessionState::Transferring);
        let mut transfers: Vec<(DocId, Vec<TransferredRevision>)> = Vec::new();
        for (id, missing) in work {
            let bodies = self.source.fetch_bodies(&id, &missing, timeout)?;
            if !bodies.is_empty() {
                transfers.push((id, bodies));
            }
        }

        // Applying: per document; rejection skips the document only.
        self.set_state(SessionState::Applying);
        for (id, revisions) in transfers {
            match self.target.apply_revisions(&id, revisions, timeout) {
                Ok(ack) => {
                    if ack.applied > 0 {
                        batch.docs_transferred += 1;
                        batch.revisions_transferred += ack.applied as u64;
                    }
                    if ack.created_conflict {
                        batch.conflicts_created += 1;
                    }
                }
                Err(ReplError::ApplyRejected { id, reason }) => {
                    warn!(doc = %id, %reason, "target rejected document, skipping");
                    batch.rejected.push((id, reason));
                }
                Err(e) => return Err(e),
            }
        }

        // Checkpointed: strictly after a fully durable apply.
        self.checkpoints.save(&key, page.checkpoint)?;
        batch.batches = 1;
        debug!(
            direction = %self.direction,
            checkpoint = %page.checkpoint,
            docs = batch.docs_transferred,
            "batch checkpointed"
        );
        Ok((batch, page.has_more))
    }

    fn set_state(&self, state: SessionState) {
        *self.state.write() = state;
    }

    fn fail(&self, error: ReplError) -> ReplError {
        self.set_state(SessionState::Failed);
        *self.last_error.write() = Some(error.to_string());
        error
    }
}
