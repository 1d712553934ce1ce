//! Pending acknowledgments for group commands.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::oneshot;

use super::BackplaneError;

/// A registered ack to wait on.
#[derive(Debug)]
pub struct PendingAck {
    id: u64,
    rx: oneshot::Receiver<()>,
}

impl PendingAck {
    /// Id to put in the outgoing command.
    pub fn id(&self) -> u64 {
        self.id
    }
}

/// Hands out ack ids and completes waiters when acks arrive.
///
/// Safe to share between many concurrent group operations.
#[derive(Debug, Default)]
pub struct AckHandler {
    next_id: AtomicU64,
    pending: DashMap<u64, oneshot::Sender<()>>,
}

impl AckHandler {
    /// Empty handler. Ids start at 1.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new ack. Ids increase monotonically.
    pub fn register(&self) -> PendingAck {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let (tx, rx) = oneshot::channel();
        self.pending.insert(id, tx);
        PendingAck { id, rx }
    }

    /// Complete the waiter for `id`. Returns `false` if nobody waits.
    pub fn trigger(&self, id: u64) -> bool {
        match self.pending.remove(&id) {
            Some((_, tx)) => tx.send(()).is_ok(),
            None => false,
        }
    }

    /// Forget `id` without completing it.
    pub fn cancel(&self, id: u64) {
        self.pending.remove(&id);
    }

    /// Wait for `ack`, failing after `timeout`.
    pub async fn wait(&self, ack: PendingAck, timeout: Duration) -> Result<(), BackplaneError> {
        let PendingAck { id, rx } = ack;
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(BackplaneError::Closed),
            Err(_) => {
                self.pending.remove(&id);
                Err(BackplaneError::AckTimeout { id })
            }
        }
    }

    /// Number of unacknowledged commands.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }
}
