//! Replication engine: bidirectional sync between a local store and a
//! remote peer.
//!
//! The engine composes one pull session (remote to local) and one push
//! session (local to remote) with independent checkpoints. One-shot
//! mode runs pull then push to completion and returns a summary.
//! Continuous mode keeps a watcher per side feeding bounded trigger
//! channels, and one worker thread per direction draining them — at
//! most one active session per direction, enforced by the single
//! worker plus a per-direction gate shared with `sync_once`.

use crate::checkpoint::{Checkpoint, CheckpointStore, Direction};
use crate::config::ReplConfig;
use crate::error::ReplResult;
use crate::remote::{InProcessRemote, RemoteStore};
use crate::session::{ReplicationSession, SessionState, SessionSummary};
use crate::watcher::ChangeFeedWatcher;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tidedb_core::DocumentStore;
use tracing::{info, warn};

/// Result of a one-shot bidirectional sync.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncSummary {
    /// Outcome of the pull direction.
    pub pull: SessionSummary,
    /// Outcome of the push direction.
    pub push: SessionSummary,
    /// Wall-clock duration of the cycle.
    pub duration: Duration,
}

impl SyncSummary {
    /// Total documents moved in either direction.
    pub fn docs_transferred(&self) -> u64 {
        self.pull.docs_transferred + self.push.docs_transferred
    }

    /// Total conflicting leaves newly created on either side.
    pub fn conflicts_created(&self) -> u64 {
        self.pull.conflicts_created + self.push.conflicts_created
    }
}

/// Snapshot of the engine's state, for operators.
#[derive(Debug, Clone)]
pub struct EngineStatus {
    /// Pull session state.
    pub pull_state: SessionState,
    /// Push session state.
    pub push_state: SessionState,
    /// Persisted pull checkpoint.
    pub pull_checkpoint: Option<Checkpoint>,
    /// Persisted push checkpoint.
    pub push_checkpoint: Option<Checkpoint>,
    /// Last pull error, if the pull session failed.
    pub pull_error: Option<String>,
    /// Last push error, if the push session failed.
    pub push_error: Option<String>,
    /// True while continuous replication is running.
    pub running: bool,
}

/// Bidirectional replication engine for one local/remote store pair.
pub struct ReplicationEngine {
    remote: Arc<dyn RemoteStore>,
    local_store: Arc<DocumentStore>,
    pull: Arc<ReplicationSession>,
    push: Arc<ReplicationSession>,
    config: ReplConfig,
    /// Cooperative stop flag, observed at batch boundaries.
    stop: Arc<AtomicBool>,
    running: AtomicBool,
    /// Per-direction gates: sync_once and the continuous workers share
    /// them, so two sessions of one direction can never overlap.
    pull_gate: Arc<Mutex<()>>,
    push_gate: Arc<Mutex<()>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    watchers: Mutex<Vec<ChangeFeedWatcher>>,
}

impl ReplicationEngine {
    /// Creates an engine between `local` and `remote`, persisting
    /// checkpoints in `checkpoints`.
    pub fn new(
        local: Arc<DocumentStore>,
        remote: Arc<dyn RemoteStore>,
        checkpoints: Arc<dyn CheckpointStore>,
        config: ReplConfig,
    ) -> Self {
        let local_adapter: Arc<dyn RemoteStore> =
            Arc::new(InProcessRemote::new(Arc::clone(&local)));

        let pull = Arc::new(ReplicationSession::new(
            Direction::Pull,
            Arc::clone(&remote),
            Arc::clone(&local_adapter),
            Arc::clone(&checkpoints),
            config.clone(),
        ));
        let push = Arc::new(ReplicationSession::new(
            Direction::Push,
            local_adapter,
            Arc::clone(&remote),
            checkpoints,
            config.clone(),
        ));

        Self {
            remote,
            local_store: local,
            pull,
            push,
            config,
            stop: Arc::new(AtomicBool::new(false)),
            running: AtomicBool::new(false),
            pull_gate: Arc::new(Mutex::new(())),
            push_gate: Arc::new(Mutex::new(())),
            workers: Mutex::new(Vec::new()),
            watchers: Mutex::new(Vec::new()),
        }
    }

    /// Runs one full sync cycle: pull to completion, then push.
    ///
    /// Session-level rejections are reported in the summary, not raised;
    /// only transport exhaustion or fatal errors surface here.
    pub fn sync_once(&self) -> ReplResult<SyncSummary> {
        let start = Instant::now();
        // One-shot runs are not cancelled by stop(); they get their own
        // never-set flag and finish on their own.
        let no_cancel = AtomicBool::new(false);

        let pull = {
            let _gate = self.pull_gate.lock();
            self.pull.run(&no_cancel)?
        };
        let push = {
            let _gate = self.push_gate.lock();
            self.push.run(&no_cancel)?
        };

        let summary = SyncSummary {
            pull,
            push,
            duration: start.elapsed(),
        };
        info!(
            docs = summary.docs_transferred(),
            conflicts = summary.conflicts_created(),
            "sync cycle complete"
        );
        Ok(summary)
    }

    /// Starts continuous replication until [`stop`](Self::stop).
    ///
    /// Both directions are triggered once at startup for catch-up, then
    /// driven by their change watchers. Returns immediately; the work
    /// happens on background threads.
    pub fn start_continuous(&self) -> ReplResult<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(()); // already running
        }
        self.stop.store(false, Ordering::SeqCst);

        // Bounded trigger channels: capacity one is enough, a full
        // channel already means a run is pending.
        let (pull_tx, pull_rx) = mpsc::sync_channel::<()>(1);
        let (push_tx, push_rx) = mpsc::sync_channel::<()>(1);

        // Catch-up triggers for whatever happened while we were away.
        let _ = pull_tx.try_send(());
        let _ = push_tx.try_send(());

        let mut watchers = self.watchers.lock();
        watchers.push(ChangeFeedWatcher::spawn_local(
            self.local_store.subscribe(),
            push_tx,
            Arc::clone(&self.stop),
        ));
        let remote_seen = self
            .pull
            .checkpoint()?
            .unwrap_or_else(|| Checkpoint::new(0));
        watchers.push(ChangeFeedWatcher::spawn_remote(
            Arc::clone(&self.remote),
            remote_seen,
            self.config.poll_interval,
            self.config.call_timeout,
            pull_tx,
            Arc::clone(&self.stop),
        ));
        drop(watchers);

        let mut workers = self.workers.lock();
        workers.push(Self::spawn_worker(
            Arc::clone(&self.pull),
            Arc::clone(&self.pull_gate),
            pull_rx,
            Arc::clone(&self.stop),
        ));
        workers.push(Self::spawn_worker(
            Arc::clone(&self.push),
            Arc::clone(&self.push_gate),
            push_rx,
            Arc::clone(&self.stop),
        ));

        info!("continuous replication started");
        Ok(())
    }

    /// Stops continuous replication cooperatively.
    ///
    /// In-flight batches finish and checkpoint before the worker exits;
    /// a partial batch is never checkpointed. Blocks until all threads
    /// have stopped.
    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.stop.store(true, Ordering::SeqCst);

        for worker in self.workers.lock().drain(..) {
            let _ = worker.join();
        }
        for watcher in self.watchers.lock().drain(..) {
            watcher.join();
        }
        info!("continuous replication stopped");
    }

    /// Reports session states, checkpoints and errors.
    pub fn status(&self) -> EngineStatus {
        EngineStatus {
            pull_state: self.pull.state(),
            push_state: self.push.state(),
            pull_checkpoint: self.pull.checkpoint().ok().flatten(),
            push_checkpoint: self.push.checkpoint().ok().flatten(),
            pull_error: self.pull.last_error(),
            push_error: self.push.last_error(),
            running: self.running.load(Ordering::SeqCst),
        }
    }

    fn spawn_worker(
        session: Arc<ReplicationSession>,
        gate: Arc<Mutex<()>>,
        triggers: Receiver<()>,
        stop: Arc<AtomicBool>,
    ) -> JoinHandle<()> {
        std::thread::spawn(move || {
            while !stop.load(Ordering::SeqCst) {
                match triggers.recv_timeout(Duration::from_millis(100)) {
                    Ok(()) => {
                        // Coalesce triggers that piled up meanwhile.
                        while triggers.try_recv().is_ok() {}
                        let _guard = gate.lock();
                        if let Err(e) = session.run(&stop) {
                            warn!(
                                direction = %session.direction(),
                                error = %e,
                                "session failed, awaiting next trigger"
                            );
                        }
                    }
                    Err(RecvTimeoutError::Timeout) => continue,
                    Err(RecvTimeoutError::Disconnected) => break,
                }
            }
        })
    }
}

impl Drop for ReplicationEngine {
    fn drop(&mut self) {
        self.stop();
    }
}
