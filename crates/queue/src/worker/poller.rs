//! Entry polling
//!
//! The poller claims ready entries according to the dispatch mode and feeds
//! them into the bounded buffer, never holding more than
//! `max_in_flight_entries` claims at once.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::Utc;
use futures::future::join_all;
use tokio::sync::watch;
use tracing::{debug, info, instrument, trace, warn};

use super::buffer::EntryBuffer;
use super::in_flight::InFlightTracker;
use super::notifier::CommitNotifier;
use crate::config::QueueConfig;
use crate::context::QueueContext;
use crate::persistence::{ClaimScope, EntryStore, StoreError};

/// Claims entries and hands them to the dispatcher buffer
pub struct Poller {
    context: Arc<QueueContext>,
    store: Arc<dyn EntryStore>,
    config: Arc<QueueConfig>,
    buffer: Arc<EntryBuffer>,
    in_flight: Arc<InFlightTracker>,
    notifier: CommitNotifier,
    scope: ClaimScope,
    cursor: usize,
    shutdown_rx: watch::Receiver<bool>,
}

impl Poller {
    /// Create a poller; the claim scope follows the dispatch mode
    pub fn new(
        context: Arc<QueueContext>,
        store: Arc<dyn EntryStore>,
        config: Arc<QueueConfig>,
        buffer: Arc<EntryBuffer>,
        in_flight: Arc<InFlightTracker>,
        notifier: CommitNotifier,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        let scope = if config.dispatch_mode.is_sticky() {
            ClaimScope::CreatedBy(context.node_id().to_string())
        } else {
            ClaimScope::Any
        };

        Self {
            context,
            store,
            config,
            buffer,
            in_flight,
            notifier,
            scope,
            cursor: 0,
            shutdown_rx,
        }
    }

    /// Start the queue rotation at `offset`, so sibling pollers begin on
    /// different queues
    pub fn with_offset(mut self, offset: usize) -> Self {
        self.cursor = offset;
        self
    }

    /// Claim filter in use
    pub fn scope(&self) -> &ClaimScope {
        &self.scope
    }

    /// Check if shutdown has been requested
    pub fn is_shutdown(&self) -> bool {
        *self.shutdown_rx.borrow()
    }

    /// Run poll cycles until shutdown
    pub async fn run(mut self) {
        info!(
            node = %self.context.node_id(),
            mode = %self.config.dispatch_mode,
            "Poller started"
        );

        loop {
            if self.is_shutdown() {
                break;
            }

            match self.poll_once().await {
                // Below the low bound: keep claiming while work is found
                Ok(claimed)
                    if claimed > 0 && self.in_flight.below_min() && !self.in_flight.is_full() =>
                {
                    continue;
                }
                Ok(_) => {}
                Err(e) => warn!(error = %e, "Poll cycle failed, retrying next cycle"),
            }

            if self.wait().await {
                break;
            }
        }

        info!(node = %self.context.node_id(), "Poller stopped");
    }

    /// Run one poll cycle and return the number of entries claimed
    ///
    /// Claims at most `max_entries_claimed`, and never more than the free
    /// in-flight slots or buffer space. A full node claims nothing.
    #[instrument(skip(self), fields(node = %self.context.node_id()))]
    pub async fn poll_once(&mut self) -> Result<usize, StoreError> {
        if self.config.processing_off {
            trace!("Processing is off, skipping claim");
            return Ok(0);
        }

        let queues = self.claim_order();
        if queues.is_empty() {
            return Ok(0);
        }

        if self.in_flight.is_full() {
            trace!(in_flight = self.in_flight.current(), "In-flight limit reached");
            return Ok(0);
        }

        let cycle_budget = AtomicUsize::new(self.config.max_entries_claimed);
        let results = join_all(
            queues
                .into_iter()
                .map(|queue| self.claim_queue(queue, &cycle_budget)),
        )
        .await;

        let mut claimed = 0;
        let mut first_error = None;
        for result in results {
            match result {
                Ok(count) => claimed += count,
                Err(e) => {
                    first_error.get_or_insert(e);
                }
            }
        }

        if claimed > 0 {
            debug!(
                claimed,
                in_flight = self.in_flight.current(),
                buffered = self.buffer.len(),
                "Claimed entries"
            );
        }

        match first_error {
            Some(e) if claimed == 0 => Err(e),
            Some(e) => {
                warn!(error = %e, claimed, "Some queues could not be polled");
                Ok(claimed)
            }
            None => Ok(claimed),
        }
    }

    /// Queues to poll this cycle: commit-signalled queues first, then the
    /// rest in rotating order
    fn claim_order(&mut self) -> Vec<String> {
        let mut registered = self.context.queue_names();
        if registered.is_empty() {
            return registered;
        }

        let start = self.cursor % registered.len();
        registered.rotate_left(start);
        self.cursor = self.cursor.wrapping_add(1);

        if !self.config.dispatch_mode.wakes_on_commit() {
            return registered;
        }

        let signalled: Vec<String> = self
            .notifier
            .take_pending()
            .into_iter()
            .filter(|q| registered.contains(q))
            .collect();
        let mut ordered = signalled.clone();
        ordered.extend(registered.into_iter().filter(|q| !signalled.contains(q)));
        ordered
    }

    /// Claim one queue's share of the cycle budget
    async fn claim_queue(
        &self,
        queue_name: String,
        cycle_budget: &AtomicUsize,
    ) -> Result<usize, StoreError> {
        let wanted = take_budget(cycle_budget, self.buffer.remaining());
        let granted = self.in_flight.reserve(wanted);
        if granted < wanted {
            cycle_budget.fetch_add(wanted - granted, Ordering::AcqRel);
        }
        if granted == 0 {
            return Ok(0);
        }

        let entries = match self
            .store
            .claim_batch(
                &queue_name,
                self.context.node_id(),
                &self.scope,
                granted,
                Utc::now(),
            )
            .await
        {
            Ok(entries) => entries,
            Err(e) => {
                self.in_flight.release(granted);
                return Err(e);
            }
        };

        self.in_flight.release(granted - entries.len());
        let claimed = entries.len();

        for entry in entries {
            let entry_id = entry.id;
            if self.buffer.push(entry).await.is_err() {
                // Still IN_PROCESSING in the store; the reaper will return it
                self.in_flight.release(1);
                debug!(entry_id, "Buffer closed, leaving entry to the reaper");
            }
        }

        Ok(claimed)
    }

    /// Wait for the polling interval, a commit signal, or shutdown
    ///
    /// Returns `true` if shutdown was signaled.
    async fn wait(&mut self) -> bool {
        let mut shutdown_rx = self.shutdown_rx.clone();
        let interval = self.config.polling_interval;

        if self.config.dispatch_mode.wakes_on_commit() {
            tokio::select! {
                _ = tokio::time::sleep(interval) => false,
                _ = self.notifier.notified() => {
                    trace!("Woken by commit signal");
                    false
                }
                _ = shutdown_rx.changed() => {
                    debug!("Shutdown signal received during wait");
                    true
                }
            }
        } else {
            tokio::select! {
                _ = tokio::time::sleep(interval) => false,
                _ = shutdown_rx.changed() => {
                    debug!("Shutdown signal received during wait");
                    true
                }
            }
        }
    }
}

/// Take up to `cap` from the shared cycle budget
fn take_budget(budget: &AtomicUsize, cap: usize) -> usize {
    let previous = budget
        .fetch_update(Ordering::AcqRel, Ordering::Acquire, |available| {
            Some(available - available.min(cap))
        })
        .unwrap_or(0);
    previous.min(cap)
}
