//! Change feed watchers.
//!
//! A watcher is a long-lived thread that turns a store's change stream
//! into coalesced replication triggers. It emits one notification per
//! contiguous batch of new sequences, never one per document, so a
//! burst of writes cannot flood the engine. The trigger channel is
//! bounded; a full channel already means a trigger is pending, so the
//! send is simply dropped.

use crate::checkpoint::Checkpoint;
use crate::remote::RemoteStore;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, RecvTimeoutError, SyncSender};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tidedb_core::ChangeEvent;
use tracing::debug;

/// How often a watcher re-checks its stop flag while idle.
const IDLE_TICK: Duration = Duration::from_millis(100);

/// A spawned change feed watcher.
pub struct ChangeFeedWatcher {
    handle: Option<JoinHandle<()>>,
}

impl ChangeFeedWatcher {
    /// Watches a local store's subscription channel.
    ///
    /// Blocks on the channel, drains whatever queued up, then emits a
    /// single trigger for the batch.
    pub fn spawn_local(
        events: Receiver<ChangeEvent>,
        trigger: SyncSender<()>,
        stop: Arc<AtomicBool>,
    ) -> Self {
        let handle = std::thread::spawn(move || {
            while !stop.load(Ordering::SeqCst) {
                match events.recv_timeout(IDLE_TICK) {
                    Ok(_) => {
                        // Coalesce the contiguous batch.
                        while events.try_recv().is_ok() {}
                        let _ = trigger.try_send(());
                    }
                    Err(RecvTimeoutError::Timeout) => continue,
                    Err(RecvTimeoutError::Disconnected) => break,
                }
            }
            debug!("local change watcher stopped");
        });
        Self {
            handle: Some(handle),
        }
    }

    /// Polls a remote store's change cursor.
    ///
    /// Emits a trigger whenever the cursor advances past the last seen
    /// value; resumes from `last_seen` across restarts. Poll errors are
    /// transient by definition here — the next tick tries again.
    pub fn spawn_remote(
        remote: Arc<dyn RemoteStore>,
        mut last_seen: Checkpoint,
        poll_interval: Duration,
        call_timeout: Duration,
        trigger: SyncSender<()>,
        stop: Arc<AtomicBool>,
    ) -> Self {
        let handle = std::thread::spawn(move || {
            while !stop.load(Ordering::SeqCst) {
                match remote.latest_checkpoint(call_timeout) {
                    Ok(cursor) if cursor > last_seen => {
                        last_seen = cursor;
                        let _ = trigger.try_send(());
                    }
                    Ok(_) => {}
                    Err(e) => {
                        debug!(error = %e, "remote poll failed, will retry");
                    }
                }
                // Sleep in short ticks so stop is observed promptly.
                let mut slept = Duration::ZERO;
                while slept < poll_interval && !stop.load(Ordering::SeqCst) {
                    let tick = IDLE_TICK.min(poll_interval - slept);
                    std::thread::sleep(tick);
                    slept += tick;
                }
            }
            debug!("remote change watcher stopped");
        });
        Self {
            handle: Some(handle),
        }
    }

    /// Waits for the watcher thread to exit. The stop flag must already
    /// be set, otherwise this blocks until the feed disconnects.
    pub fn join(mut self) {
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}
