//! Entry dispatch
//!
//! Dispatcher workers take claimed entries from the buffer, run the queue's
//! handler and record the outcome in the store.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, instrument, warn};

use super::buffer::EntryBuffer;
use super::in_flight::InFlightTracker;
use crate::config::QueueConfig;
use crate::context::QueueContext;
use crate::error::HandlerError;
use crate::persistence::{EntryId, EntryStore, QueueEntry, StoreError};
use crate::reliability::{RetryDecision, RetryPolicy};

/// Attempts made to archive an entry that already reached a terminal state
const ARCHIVE_ATTEMPTS: u32 = 3;

/// Result of dispatching one entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Handler succeeded, entry archived as `PROCESSED`
    Processed,
    /// Handler failed, entry rescheduled
    Retried {
        error_count: u32,
        available_time: DateTime<Utc>,
    },
    /// Entry archived as `FAILED`
    Failed { error_count: u32 },
    /// Nothing recorded; the entry stays claimed until the reaper returns it
    Abandoned,
    /// Our claim was revoked before the outcome could be written
    LeaseLost,
    /// The outcome could not be written
    StoreFailed,
}

/// Counters of dispatch outcomes on this node
#[derive(Debug, Default)]
pub struct DispatchStats {
    processed: AtomicU64,
    retried: AtomicU64,
    failed: AtomicU64,
    abandoned: AtomicU64,
    lease_lost: AtomicU64,
    store_failed: AtomicU64,
}

/// Point-in-time copy of [`DispatchStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct DispatchStatsSnapshot {
    pub processed: u64,
    pub retried: u64,
    pub failed: u64,
    pub abandoned: u64,
    pub lease_lost: u64,
    pub store_failed: u64,
}

impl DispatchStats {
    fn record(&self, outcome: &DispatchOutcome) {
        let counter = match outcome {
            DispatchOutcome::Processed => &self.processed,
            DispatchOutcome::Retried { .. } => &self.retried,
            DispatchOutcome::Failed { .. } => &self.failed,
            DispatchOutcome::Abandoned => &self.abandoned,
            DispatchOutcome::LeaseLost => &self.lease_lost,
            DispatchOutcome::StoreFailed => &self.store_failed,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> DispatchStatsSnapshot {
        DispatchStatsSnapshot {
            processed: self.processed.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            abandoned: self.abandoned.load(Ordering::Relaxed),
            lease_lost: self.lease_lost.load(Ordering::Relaxed),
            store_failed: self.store_failed.load(Ordering::Relaxed),
        }
    }
}

/// Terminal or retry transition to record
enum Completion {
    Processed,
    Retry {
        error_count: u32,
        available_time: DateTime<Utc>,
    },
    Failed,
}

/// Runs handlers and records their outcome
#[derive(Clone)]
pub struct Dispatcher {
    context: Arc<QueueContext>,
    store: Arc<dyn EntryStore>,
    config: Arc<QueueConfig>,
    complete_permits: Arc<Semaphore>,
    stats: Arc<DispatchStats>,
}

impl Dispatcher {
    pub fn new(
        context: Arc<QueueContext>,
        store: Arc<dyn EntryStore>,
        config: Arc<QueueConfig>,
    ) -> Self {
        let permits = config.lifecycle_complete_threads.max(1);
        Self {
            context,
            store,
            config,
            complete_permits: Arc::new(Semaphore::new(permits)),
            stats: Arc::new(DispatchStats::default()),
        }
    }

    pub fn stats(&self) -> &Arc<DispatchStats> {
        &self.stats
    }

    /// Run the handler for a claimed entry and record the outcome
    #[instrument(skip(self, entry), fields(entry_id = entry.id, queue = %entry.queue_name))]
    pub async fn dispatch(&self, entry: QueueEntry) -> DispatchOutcome {
        let outcome = self.run(&entry).await;
        self.stats.record(&outcome);
        outcome
    }

    async fn run(&self, entry: &QueueEntry) -> DispatchOutcome {
        let Some(handler) = self.context.handler(&entry.queue_name) else {
            warn!("No handler registered, leaving entry to the reaper");
            return DispatchOutcome::Abandoned;
        };

        let limit = self.config.claim_timeout;
        let invocation = AssertUnwindSafe(handler.handle(entry)).catch_unwind();
        let result = match tokio::time::timeout(limit, invocation).await {
            Err(_) => Err(HandlerError::TimedOut(limit)),
            Ok(Err(panic)) => Err(HandlerError::Panicked(panic_message(panic.as_ref()))),
            Ok(Ok(result)) => result,
        };

        let completion = match result {
            Ok(()) => {
                debug!("Handler succeeded");
                Completion::Processed
            }
            Err(HandlerError::TimedOut(limit)) => {
                // Same as a crash: the claim will go stale and be reaped
                warn!(?limit, "Handler timed out, leaving entry to the reaper");
                return DispatchOutcome::Abandoned;
            }
            Err(err) if err.is_permanent() => {
                warn!(error = %err, "Handler failed permanently");
                Completion::Failed
            }
            Err(err) => match self
                .config
                .retry
                .decide(entry.error_count, self.config.max_failure_retries)
            {
                RetryDecision::Retry { error_count, delay } => {
                    let available_time =
                        RetryPolicy::next_available_time(Utc::now(), entry.available_time, delay);
                    warn!(
                        error = %err,
                        error_count,
                        retry_in_ms = delay.as_millis() as u64,
                        "Handler failed, scheduling retry"
                    );
                    Completion::Retry {
                        error_count,
                        available_time,
                    }
                }
                RetryDecision::Exhausted => {
                    warn!(
                        error = %err,
                        error_count = entry.error_count,
                        "Handler failed, retries exhausted"
                    );
                    Completion::Failed
                }
            },
        };

        self.complete(entry, completion).await
    }

    /// Write the outcome, bounded by `lifecycle_complete_threads`
    async fn complete(&self, entry: &QueueEntry, completion: Completion) -> DispatchOutcome {
        let _permit = self.complete_permits.acquire().await.ok();
        let owner_id = self.context.node_id();

        let written = match completion {
            Completion::Processed => self
                .store
                .mark_processed(entry.id, owner_id)
                .await
                .map(|_| DispatchOutcome::Processed),
            Completion::Retry {
                error_count,
                available_time,
            } => self
                .store
                .mark_retry(entry.id, owner_id, available_time, error_count)
                .await
                .map(|_| DispatchOutcome::Retried {
                    error_count,
                    available_time,
                }),
            Completion::Failed => self
                .store
                .mark_failed(entry.id, owner_id)
                .await
                .map(|_| DispatchOutcome::Failed {
                    error_count: entry.error_count,
                }),
        };

        let outcome = match written {
            Ok(outcome) => outcome,
            Err(StoreError::LeaseLost { .. }) => {
                warn!("Claim was revoked, dropping outcome");
                return DispatchOutcome::LeaseLost;
            }
            Err(e) => {
                error!(error = %e, "Failed to record outcome");
                return DispatchOutcome::StoreFailed;
            }
        };

        if matches!(
            outcome,
            DispatchOutcome::Processed | DispatchOutcome::Failed { .. }
        ) {
            self.archive(entry.id).await;
        }
        outcome
    }

    /// Move a terminal entry to history, retrying transient failures
    ///
    /// Rows still left behind are archived by the reaper's terminal sweep.
    async fn archive(&self, id: EntryId) {
        for attempt in 1..=ARCHIVE_ATTEMPTS {
            match self.store.move_to_history(id).await {
                Ok(_) => return,
                Err(StoreError::EntryNotFound(_)) => {
                    debug!("Entry already archived by the reaper");
                    return;
                }
                Err(e) if e.is_transient() && attempt < ARCHIVE_ATTEMPTS => {
                    debug!(attempt, error = %e, "Archive failed, retrying");
                    tokio::time::sleep(Duration::from_millis(50 * u64::from(attempt))).await;
                }
                Err(e) => {
                    warn!(error = %e, "Failed to move entry to history, leaving it to the reaper");
                    return;
                }
            }
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Fixed set of dispatcher workers draining the buffer
pub struct DispatcherPool {
    dispatcher: Dispatcher,
    buffer: Arc<EntryBuffer>,
    in_flight: Arc<InFlightTracker>,
    tracker: TaskTracker,
    cancel: CancellationToken,
}

impl DispatcherPool {
    pub fn new(
        dispatcher: Dispatcher,
        buffer: Arc<EntryBuffer>,
        in_flight: Arc<InFlightTracker>,
    ) -> Self {
        Self {
            dispatcher,
            buffer,
            in_flight,
            tracker: TaskTracker::new(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// Number of live workers
    pub fn active_workers(&self) -> usize {
        self.tracker.len()
    }

    /// Spawn `count` workers
    pub fn spawn_workers(&self, count: usize) {
        for worker in 0..count.max(1) {
            let dispatcher = self.dispatcher.clone();
            let buffer = Arc::clone(&self.buffer);
            let in_flight = Arc::clone(&self.in_flight);
            let cancel = self.cancel.clone();
            self.tracker.spawn(async move {
                worker_loop(worker, dispatcher, buffer, in_flight, cancel).await;
            });
        }
    }

    /// Close the buffer and let workers drain it
    ///
    /// Returns `true` if every worker finished within `grace`. Otherwise the
    /// workers are cancelled, the remaining buffered entries are dropped and
    /// left `IN_PROCESSING` for the reaper, and `false` is returned.
    pub async fn shutdown(&self, grace: Duration) -> bool {
        self.buffer.close();
        self.tracker.close();

        if tokio::time::timeout(grace, self.tracker.wait()).await.is_ok() {
            info!("Dispatcher workers drained");
            return true;
        }

        warn!(
            buffered = self.buffer.len(),
            in_flight = self.in_flight.current(),
            "Shutdown timeout reached, cancelling dispatch"
        );
        self.cancel.cancel();
        let dropped = self.buffer.abandon();
        self.in_flight.release(dropped);

        if tokio::time::timeout(grace, self.tracker.wait()).await.is_err() {
            error!(
                workers = self.tracker.len(),
                "Dispatcher workers did not stop after cancellation"
            );
        }
        false
    }
}

async fn worker_loop(
    worker: usize,
    dispatcher: Dispatcher,
    buffer: Arc<EntryBuffer>,
    in_flight: Arc<InFlightTracker>,
    cancel: CancellationToken,
) {
    debug!(worker, "Dispatcher worker started");

    loop {
        let entry = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            entry = buffer.take() => match entry {
                Some(entry) => entry,
                None => break,
            },
        };

        let entry_id = entry.id;
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                warn!(worker, entry_id, "Dispatch cancelled, leaving entry to the reaper");
                in_flight.release(1);
                break;
            }
            _ = dispatcher.dispatch(entry) => {}
        }
        in_flight.release(1);
    }

    debug!(worker, "Dispatcher worker stopped");
}
