//! Commit notifications for STICKY_EVENTS dispatch
//!
//! The producer's transaction layer calls
//! [`CommitNotifier::notify_committed`] right after a commit that inserted
//! entries; the local poller wakes up instead of waiting for its timer.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::Notify;
use tracing::trace;

#[derive(Default)]
struct Inner {
    node_id: String,
    pending: DashMap<String, u64>,
    wake: Notify,
}

/// Cloneable handle used to signal committed entries to the local poller
#[derive(Clone)]
pub struct CommitNotifier {
    inner: Arc<Inner>,
}

impl CommitNotifier {
    /// Create a notifier for the given node
    pub fn new(node_id: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(Inner {
                node_id: node_id.into(),
                ..Default::default()
            }),
        }
    }

    /// Signal that entries for `queue_name` were committed on `node_id`
    ///
    /// Signals for other nodes are ignored; returns whether the poller was woken.
    pub fn notify_committed(&self, queue_name: &str, node_id: &str) -> bool {
        if node_id != self.inner.node_id {
            trace!(queue = %queue_name, %node_id, "Ignoring commit signal for another node");
            return false;
        }

        *self.inner.pending.entry(queue_name.to_string()).or_insert(0) += 1;
        self.inner.wake.notify_one();
        true
    }

    /// Wait for the next commit signal
    pub async fn notified(&self) {
        self.inner.wake.notified().await;
    }

    /// Queues signalled since the last call, sorted by name
    pub fn take_pending(&self) -> Vec<String> {
        let mut queues: Vec<String> = self
            .inner
            .pending
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        for queue in &queues {
            self.inner.pending.remove(queue);
        }
        queues.sort();
        queues
    }

    /// Number of signals not yet consumed for `queue_name`
    pub fn pending_signals(&self, queue_name: &str) -> u64 {
        self.inner
            .pending
            .get(queue_name)
            .map(|count| *count)
            .unwrap_or(0)
    }
}
