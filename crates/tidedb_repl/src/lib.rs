//! Replication for tidedb document stores.
//!
//! Moves revision histories between a local [`DocumentStore`] and any
//! peer behind the [`RemoteStore`] trait, so that both sides converge
//! on identical revision trees without either side losing a write.
//!
//! ## Architecture
//!
//! - [`RemoteStore`]: the minimal capability contract a peer must
//!   offer. [`InProcessRemote`] adapts a local store for tests and
//!   same-process sync.
//! - [`ReplicationSession`]: one direction of transfer, batched and
//!   checkpointed. Diffs the peer's change feed against what the
//!   target already holds, fetches only the missing bodies, applies
//!   them, then advances the checkpoint.
//! - [`ReplicationEngine`]: composes a pull and a push session into
//!   one-shot [`sync_once`](ReplicationEngine::sync_once) cycles or
//!   watcher-driven continuous replication.
//! - [`CheckpointStore`]: durable per-direction cursors, so an
//!   interrupted transfer resumes instead of restarting.
//!
//! ## Key invariants
//!
//! - Checkpoints advance only after a batch is durably applied;
//!   re-delivery is safe because revision application is idempotent.
//! - A rejected revision skips its document and is reported in the
//!   session summary; it never aborts the batch.
//! - At most one session per direction runs at a time.
//!
//! [`DocumentStore`]: tidedb_core::DocumentStore

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod checkpoint;
mod config;
mod engine;
mod error;
mod remote;
mod session;
mod watcher;

pub use checkpoint::{
    Checkpoint, CheckpointKey, CheckpointStore, Direction, FileCheckpointStore,
    MemoryCheckpointStore,
};
pub use config::{Backoff, ReplConfig, RetryConfig};
pub use engine::{EngineStatus, ReplicationEngine, SyncSummary};
pub use error::{ReplError, ReplResult};
pub use remote::{ApplyAck, ChangesPage, InProcessRemote, RemoteStore};
pub use session::{ReplicationSession, SessionState, SessionSummary};
pub use watcher::ChangeFeedWatcher;
