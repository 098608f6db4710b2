//! Checkpoint persistence.
//!
//! A checkpoint is an opaque cursor recording how far one replication
//! direction has durably progressed. It is the sole resumption state:
//! losing one forces a full re-diff, which is always correct, only
//! slower. Checkpoints are keyed by (local store, remote store,
//! direction) and must advance monotonically per key.

use crate::error::{ReplError, ReplResult};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::PathBuf;
use tidedb_core::StoreId;
use tracing::warn;

/// Opaque resumption cursor for one replication direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Checkpoint(u64);

impl Checkpoint {
    /// Wraps a source sequence number as a checkpoint.
    pub fn new(sequence: u64) -> Self {
        Self(sequence)
    }

    /// The underlying sequence value.
    pub fn sequence(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for Checkpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Direction of one replication session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    /// Remote to local.
    Pull,
    /// Local to remote.
    Push,
}

impl Direction {
    /// Stable lowercase name, used in checkpoint file names and logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Pull => "pull",
            Direction::Push => "push",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identifies one checkpoint: a store pair plus a direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CheckpointKey {
    /// The local store.
    pub local: StoreId,
    /// The remote store.
    pub remote: StoreId,
    /// The replication direction.
    pub direction: Direction,
}

impl CheckpointKey {
    /// Creates a checkpoint key.
    pub fn new(local: StoreId, remote: StoreId, direction: Direction) -> Self {
        Self {
            local,
            remote,
            direction,
        }
    }

    fn file_name(&self) -> String {
        format!("{}-{}-{}.checkpoint", self.local, self.remote, self.direction)
    }
}

/// Durable storage for checkpoints.
///
/// Implementations enforce monotonicity: a save that would move a
/// cursor backwards is ignored. Absent or unreadable state loads as
/// `None` ("start from empty history") rather than failing.
pub trait CheckpointStore: Send + Sync {
    /// Loads the checkpoint for a key, `None` if absent or unreadable.
    fn load(&self, key: &CheckpointKey) -> ReplResult<Option<Checkpoint>>;

    /// Persists a checkpoint, strictly after the batch it covers was
    /// durably applied.
    fn save(&self, key: &CheckpointKey, checkpoint: Checkpoint) -> ReplResult<()>;
}

/// In-memory checkpoint store, for tests and ephemeral replication.
#[derive(Default)]
pub struct MemoryCheckpointStore {
    map: Mutex<HashMap<CheckpointKey, Checkpoint>>,
}

impl MemoryCheckpointStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

impl CheckpointStore for MemoryCheckpointStore {
    fn load(&self, key: &CheckpointKey) -> ReplResult<Option<Checkpoint>> {
        Ok(self.map.lock().get(key).copied())
    }

    fn save(&self, key: &CheckpointKey, checkpoint: Checkpoint) -> ReplResult<()> {
        let mut map = self.map.lock();
        match map.get(key) {
            Some(existing) if *existing > checkpoint => {}
            _ => {
                map.insert(*key, checkpoint);
            }
        }
        Ok(())
    }
}

/// File-backed checkpoint store: one CBOR blob per key.
///
/// Survives process restart. A corrupt or missing file degrades to
/// "no checkpoint" with a warning; only an unwritable directory is
/// fatal, because silently not persisting would break resumability.
pub struct FileCheckpointStore {
    dir: PathBuf,
}

impl FileCheckpointStore {
    /// Creates a store rooted at `dir`, creating the directory if
    /// needed.
    pub fn new(dir: impl Into<PathBuf>) -> ReplResult<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)
            .map_err(|e| ReplError::fatal(format!("cannot create checkpoint dir: {e}")))?;
        Ok(Self { dir })
    }

    fn path_for(&self, key: &CheckpointKey) -> PathBuf {
        self.dir.join(key.file_name())
    }
}

impl CheckpointStore for FileCheckpointStore {
    fn load(&self, key: &CheckpointKey) -> ReplResult<Option<Checkpoint>> {
        let path = self.path_for(key);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "unreadable checkpoint, starting from empty history");
                return Ok(None);
            }
        };
        match ciborium::from_reader::<Checkpoint, _>(bytes.as_slice()) {
            Ok(checkpoint) => Ok(Some(checkpoint)),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "corrupt checkpoint, starting from empty history");
                Ok(None)
            }
        }
    }

    fn save(&self, key: &CheckpointKey, checkpoint: Checkpoint) -> ReplResult<()> {
        if let Some(existing) = self.load(key)? {
            if existing > checkpoint {
                return Ok(());
            }
        }
        let mut bytes = Vec::new();
        ciborium::into_writer(&checkpoint, &mut bytes)
            .map_err(|e| ReplError::checkpoint(format!("encode failed: {e}")))?;

        // Write whole-then-rename so a crash never leaves a torn file.
        let path = self.path_for(key);
        let tmp = path.with_extension("checkpoint.tmp");
        fs::write(&tmp, &bytes)
            .map_err(|e| ReplError::fatal(format!("cannot write checkpoint: {e}")))?;
        fs::rename(&tmp, &path)
            .map_err(|e| ReplError::fatal(format!("cannot commit checkpoint: {e}")))?;
        Ok(())
    }
}
