use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use hexlink_frame::CommandStatus;
use tokio::sync::oneshot;
use tracing::debug;

use crate::error::{PeerError, Result};

type Reply = oneshot::Sender<Result<CommandStatus>>;
type PendingMap = Mutex<HashMap<u32, Reply>>;

fn lock_map(map: &PendingMap) -> MutexGuard<'_, HashMap<u32, Reply>> {
    map.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A pending acknowledgement for one command.
///
/// Dropping the handle, or a `wait` future holding it, stops tracking the
/// sequence.
#[derive(Debug)]
pub struct AckHandle {
    sequence: u32,
    rx: oneshot::Receiver<Result<CommandStatus>>,
    pending: Weak<PendingMap>,
}

impl AckHandle {
    /// Sequence number of the command this handle waits for.
    pub fn sequence(&self) -> u32 {
        self.sequence
    }
}

impl Drop for AckHandle {
    fn drop(&mut self) {
        let Some(pending) = self.pending.upgrade() else {
            return;
        };
        self.rx.close();
        // A later registration under the same sequence owns an open sender.
        if let Entry::Occupied(entry) = lock_map(&pending).entry(self.sequence) {
            if entry.get().is_closed() {
                entry.remove();
            }
        };
    }
}

/// Matches command statuses to pending commands by sequence number.
///
/// Entries are removed when resolved, timed out or failed, so a status that
/// arrives late (or belongs to an earlier connection) finds nothing and is
/// dropped.
#[derive(Debug, Default)]
pub struct AckTracker {
    pending: Arc<PendingMap>,
}

impl AckTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<u32, Reply>> {
        lock_map(&self.pending)
    }

    /// Start tracking `sequence`.
    pub fn register(&self, sequence: u32) -> AckHandle {
        let (tx, rx) = oneshot::channel();
        if self.lock().insert(sequence, tx).is_some() {
            debug!(sequence, "replaced pending acknowledgement");
        }
        AckHandle {
            sequence,
            rx,
            pending: Arc::downgrade(&self.pending),
        }
    }

    /// Complete the handle waiting for `status.counter`.
    ///
    /// Returns `false` (and does nothing) for unknown sequences.
    pub fn resolve(&self, status: CommandStatus) -> bool {
        let Some(tx) = self.lock().remove(&status.counter) else {
            debug!(
                sequence = status.counter,
                status = status.status,
                "discarding status for unknown sequence"
            );
            return false;
        };
        // The waiter may have given up already.
        let _ = tx.send(Ok(status));
        true
    }

    /// Stop tracking `sequence` without completing it.
    pub fn cancel(&self, sequence: u32) -> bool {
        self.lock().remove(&sequence).is_some()
    }

    /// Fail every pending handle with [`PeerError::ConnectionLost`].
    ///
    /// Returns the number of handles failed.
    pub fn fail_all(&self) -> usize {
        let drained: Vec<Reply> = self.lock().drain().map(|(_, tx)| tx).collect();
        let count = drained.len();
        for tx in drained {
            let _ = tx.send(Err(PeerError::ConnectionLost));
        }
        count
    }

    /// Number of commands still waiting for a status.
    pub fn pending(&self) -> usize {
        self.lock().len()
    }

    /// Wait for the status of `handle`'s command.
    ///
    /// On timeout the entry is removed, so a status arriving later is
    /// discarded by [`resolve`](Self::resolve).
    pub async fn wait(&self, mut handle: AckHandle, timeout: Duration) -> Result<CommandStatus> {
        let sequence = handle.sequence;
        match tokio::time::timeout(timeout, &mut handle.rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(PeerError::ConnectionLost),
            Err(_) => {
                self.cancel(sequence);
                Err(PeerError::CommandTimeout { sequence, timeout })
            }
        }
    }
}
