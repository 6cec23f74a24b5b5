//! Stale claim recovery
//!
//! Entries claimed longer than `reap_threshold` ago belong to a dispatcher
//! that died or hung. The reaper returns them to `AVAILABLE` so any node can
//! pick them up again. It also archives terminal rows whose move to history
//! never happened (store outage or crash between the two writes).

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, trace, warn};

use crate::config::QueueConfig;
use crate::persistence::{EntryStore, StoreError};

/// Result of one reaper pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReapReport {
    /// Stale claims returned to `AVAILABLE`
    pub reclaimed: usize,
    /// Terminal rows moved to history
    pub archived: usize,
}

/// Periodically reclaims stale entries
pub struct Reaper {
    store: Arc<dyn EntryStore>,
    threshold: Duration,
    schedule: Duration,
    max_redispatch: usize,
    shutdown_rx: watch::Receiver<bool>,
}

impl Reaper {
    pub fn new(
        store: Arc<dyn EntryStore>,
        config: &QueueConfig,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            store,
            threshold: config.reap_threshold,
            schedule: config.reap_schedule,
            max_redispatch: config.max_redispatch_count,
            shutdown_rx,
        }
    }

    /// Reclaim entries claimed before `now - reap_threshold`
    pub async fn reap_once(&self) -> Result<ReapReport, StoreError> {
        self.reap_at(Utc::now()).await
    }

    /// Reclaim relative to an explicit clock reading
    ///
    /// Both steps are capped at `max_redispatch_count` rows per pass.
    pub async fn reap_at(&self, now: DateTime<Utc>) -> Result<ReapReport, StoreError> {
        let cutoff = chrono::Duration::from_std(self.threshold)
            .ok()
            .and_then(|threshold| now.checked_sub_signed(threshold))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);

        let reclaimed = self
            .store
            .reclaim_stale(cutoff, self.max_redispatch)
            .await?;
        if reclaimed > 0 {
            info!(count = reclaimed, %cutoff, "Reclaimed stale entries");
        } else {
            trace!(%cutoff, "No stale entries");
        }

        let archived = self.store.archive_terminal(self.max_redispatch).await?;
        if archived > 0 {
            warn!(count = archived, "Archived terminal entries left in the primary table");
        }

        Ok(ReapReport {
            reclaimed,
            archived,
        })
    }

    /// Run on `reap_schedule` until shutdown; the first pass runs immediately
    pub async fn run(self) {
        let mut shutdown_rx = self.shutdown_rx.clone();
        let mut ticker = tokio::time::interval(self.schedule);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.reap_once().await {
                        error!(error = %e, "Stale entry reclamation failed");
                    }
                }
                _ = shutdown_rx.changed() => {
                    debug!("Reaper: shutdown requested");
                    break;
                }
            }
        }

        debug!("Reaper exited");
    }
}
