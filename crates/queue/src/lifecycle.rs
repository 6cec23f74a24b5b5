//! Queue service lifecycle
//!
//! [`QueueService`] owns the entry store, the handler registry and the
//! background workers. It moves through
//! `STOPPED → STARTING → RUNNING → STOPPING → STOPPED`:
//!
//! - start: store health check, dispatcher workers, pollers, reaper
//! - stop: reaper, pollers, then the dispatchers drain the buffer for up to
//!   `shutdown_timeout` before being cancelled
//!
//! Whatever is cancelled stays `IN_PROCESSING` in the store and is returned
//! by a reaper later.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::config::{ConfigError, DispatchMode, QueueConfig};
use crate::context::{EntryHandler, QueueContext};
use crate::error::{HandlerError, LifecycleError, QueueError};
use crate::persistence::{EntryId, EntryStore, InMemoryEntryStore, NewEntry, QueueEntry};
use crate::worker::{
    CommitNotifier, DispatchStatsSnapshot, Dispatcher, DispatcherPool, EntryBuffer,
    InFlightTracker, Poller, Reaper,
};

/// Lifecycle state of a [`QueueService`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

impl LifecycleState {
    pub fn as_str(self) -> &'static str {
        match self {
            LifecycleState::Stopped => "stopped",
            LifecycleState::Starting => "starting",
            LifecycleState::Running => "running",
            LifecycleState::Stopping => "stopping",
        }
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot returned by [`QueueService::status`]
#[derive(Debug, Clone, Serialize)]
pub struct QueueStatus {
    pub node_id: String,
    pub state: LifecycleState,
    pub dispatch_mode: DispatchMode,
    pub queues: Vec<String>,
    /// Claimed entries waiting for a dispatcher
    pub buffered: usize,
    /// Claimed entries not yet finished (buffered or dispatching)
    pub in_flight: usize,
    pub peak_in_flight: usize,
    pub dispatch: DispatchStatsSnapshot,
}

/// Handles of a running service
struct Workers {
    shutdown_tx: watch::Sender<bool>,
    buffer: Arc<EntryBuffer>,
    dispatchers: DispatcherPool,
    pollers: Vec<JoinHandle<()>>,
    reaper: JoinHandle<()>,
}

/// Builder for [`QueueService`]
pub struct QueueServiceBuilder {
    config: QueueConfig,
    store: Option<Arc<dyn EntryStore>>,
    node_id: Option<String>,
}

impl QueueServiceBuilder {
    /// Use this entry store instead of deriving one from the config
    pub fn with_store(mut self, store: Arc<dyn EntryStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Set the node identity; a `node-<uuid>` id is generated otherwise
    pub fn with_node_id(mut self, node_id: impl Into<String>) -> Self {
        self.node_id = Some(node_id.into());
        self
    }

    /// Validate the configuration and build a stopped service
    ///
    /// An explicit store takes precedence; without one, `in_memory` selects
    /// an [`InMemoryEntryStore`] and anything else is a configuration error.
    pub fn build(self) -> Result<QueueService, QueueError> {
        self.config.validate()?;

        let store: Arc<dyn EntryStore> = match (self.store, self.config.in_memory) {
            (Some(store), _) => store,
            (None, true) => Arc::new(InMemoryEntryStore::new()),
            (None, false) => return Err(ConfigError::MissingStore.into()),
        };

        let context = Arc::new(match self.node_id {
            Some(node_id) => QueueContext::new(node_id),
            None => QueueContext::with_generated_node_id(),
        });
        let config = Arc::new(self.config);

        Ok(QueueService {
            notifier: CommitNotifier::new(context.node_id()),
            in_flight: Arc::new(InFlightTracker::new(
                config.min_in_flight_entries,
                config.max_in_flight_entries,
            )),
            dispatcher: Dispatcher::new(
                Arc::clone(&context),
                Arc::clone(&store),
                Arc::clone(&config),
            ),
            buffer: RwLock::new(None),
            state: Mutex::new(LifecycleState::Stopped),
            workers: tokio::sync::Mutex::new(None),
            config,
            context,
            store,
        })
    }
}

/// A persistent queue bound to one node
///
/// # Example
///
/// ```
/// use everruns_queue::{QueueConfig, QueueService};
/// use serde_json::json;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> Result<(), everruns_queue::QueueError> {
/// let service = QueueService::builder(QueueConfig::default().with_in_memory(true))
///     .with_node_id("node-a")
///     .build()?;
///
/// service.register_fn("invoices", |entry| async move {
///     println!("invoice {}", entry.payload["invoice_id"]);
///     Ok(())
/// })?;
///
/// service.start().await?;
/// service.post("invoices", &json!({"invoice_id": 42}), 7, 0, None).await?;
/// service.stop().await?;
/// # Ok(())
/// # }
/// ```
pub struct QueueService {
    config: Arc<QueueConfig>,
    context: Arc<QueueContext>,
    store: Arc<dyn EntryStore>,
    notifier: CommitNotifier,
    in_flight: Arc<InFlightTracker>,
    dispatcher: Dispatcher,
    buffer: RwLock<Option<Arc<EntryBuffer>>>,
    state: Mutex<LifecycleState>,
    // Serializes start/stop
    workers: tokio::sync::Mutex<Option<Workers>>,
}

impl QueueService {
    pub fn builder(config: QueueConfig) -> QueueServiceBuilder {
        QueueServiceBuilder {
            config,
            store: None,
            node_id: None,
        }
    }

    pub fn state(&self) -> LifecycleState {
        *self.state.lock()
    }

    pub fn node_id(&self) -> &str {
        self.context.node_id()
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn EntryStore> {
        &self.store
    }

    pub fn context(&self) -> &Arc<QueueContext> {
        &self.context
    }

    /// Handle for the producer's transaction layer to signal commits
    pub fn notifier(&self) -> CommitNotifier {
        self.notifier.clone()
    }

    /// Register the handler for `queue_name`; only allowed while stopped
    pub fn register_handler(
        &self,
        queue_name: impl Into<String>,
        handler: Arc<dyn EntryHandler>,
    ) -> Result<(), QueueError> {
        self.context.register(queue_name, handler)
    }

    /// Register an async closure as the handler for `queue_name`
    pub fn register_fn<F, Fut>(&self, queue_name: impl Into<String>, f: F) -> Result<(), QueueError>
    where
        F: Fn(QueueEntry) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        self.context.register_fn(queue_name, f)
    }

    /// Move from `from` to `to`, or return the current state
    fn transition(&self, from: LifecycleState, to: LifecycleState) -> Result<(), LifecycleState> {
        let mut state = self.state.lock();
        if *state != from {
            return Err(*state);
        }
        *state = to;
        Ok(())
    }

    fn set_state(&self, to: LifecycleState) {
        *self.state.lock() = to;
    }

    /// Start polling and dispatching
    ///
    /// Fails with [`LifecycleError::AlreadyStarted`] unless stopped, and
    /// returns to `STOPPED` if the store is not reachable.
    #[instrument(skip(self), fields(node = %self.context.node_id()))]
    pub async fn start(&self) -> Result<(), QueueError> {
        let mut workers = self.workers.lock().await;
        self.transition(LifecycleState::Stopped, LifecycleState::Starting)
            .map_err(LifecycleError::AlreadyStarted)?;

        if let Err(e) = self.store.health_check().await {
            warn!(error = %e, "Entry store not ready, staying stopped");
            self.set_state(LifecycleState::Stopped);
            return Err(e.into());
        }

        self.context.init();
        let config = &self.config;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let buffer = Arc::new(EntryBuffer::new(config.event_queue_capacity));
        *self.buffer.write() = Some(Arc::clone(&buffer));

        let dispatchers = DispatcherPool::new(
            self.dispatcher.clone(),
            Arc::clone(&buffer),
            Arc::clone(&self.in_flight),
        );
        dispatchers.spawn_workers(config.max_dispatch_threads);

        let pollers = (0..config.lifecycle_dispatch_threads)
            .map(|index| {
                let poller = Poller::new(
                    Arc::clone(&self.context),
                    Arc::clone(&self.store),
                    Arc::clone(config),
                    Arc::clone(&buffer),
                    Arc::clone(&self.in_flight),
                    self.notifier.clone(),
                    shutdown_rx.clone(),
                )
                .with_offset(index);
                tokio::spawn(poller.run())
            })
            .collect();

        let reaper = tokio::spawn(Reaper::new(Arc::clone(&self.store), config, shutdown_rx).run());

        *workers = Some(Workers {
            shutdown_tx,
            buffer,
            dispatchers,
            pollers,
            reaper,
        });
        self.set_state(LifecycleState::Running);

        info!(
            mode = %config.dispatch_mode,
            queues = ?self.context.queue_names(),
            dispatchers = config.max_dispatch_threads,
            pollers = config.lifecycle_dispatch_threads,
            "Queue service started"
        );
        Ok(())
    }

    /// Stop and drain
    ///
    /// Returns `Ok(true)` if every buffered entry was dispatched within
    /// `shutdown_timeout`, `Ok(false)` if dispatch had to be cancelled.
    /// Fails with [`LifecycleError::NotRunning`] unless running.
    #[instrument(skip(self), fields(node = %self.context.node_id()))]
    pub async fn stop(&self) -> Result<bool, QueueError> {
        let mut workers = self.workers.lock().await;
        self.transition(LifecycleState::Running, LifecycleState::Stopping)
            .map_err(LifecycleError::NotRunning)?;

        let drained = match workers.take() {
            Some(running) => self.shutdown_workers(running).await,
            None => true,
        };

        self.context.teardown();
        self.set_state(LifecycleState::Stopped);
        info!(drained, "Queue service stopped");
        Ok(drained)
    }

    async fn shutdown_workers(&self, workers: Workers) -> bool {
        let Workers {
            shutdown_tx,
            buffer,
            dispatchers,
            pollers,
            reaper,
        } = workers;

        let _ = shutdown_tx.send(true);

        if let Err(e) = reaper.await {
            warn!(error = %e, "Reaper task ended abnormally");
        }
        debug!("Reaper stopped");

        // Unblocks a poller waiting for buffer space
        buffer.close();
        for result in join_all(pollers).await {
            if let Err(e) = result {
                warn!(error = %e, "Poller task ended abnormally");
            }
        }
        debug!("Pollers stopped");

        dispatchers.shutdown(self.config.shutdown_timeout).await
    }

    /// Enqueue an entry available immediately
    pub async fn post<T: Serialize + ?Sized>(
        &self,
        queue_name: &str,
        payload: &T,
        search_key1: i64,
        search_key2: i64,
        user_token: Option<Uuid>,
    ) -> Result<EntryId, QueueError> {
        let entry = self.new_entry(queue_name, payload, search_key1, search_key2, user_token)?;
        self.post_entry(entry).await
    }

    /// Enqueue an entry that becomes available at `available_at`
    pub async fn post_at<T: Serialize + ?Sized>(
        &self,
        queue_name: &str,
        payload: &T,
        search_key1: i64,
        search_key2: i64,
        user_token: Option<Uuid>,
        available_at: DateTime<Utc>,
    ) -> Result<EntryId, QueueError> {
        let entry = self
            .new_entry(queue_name, payload, search_key1, search_key2, user_token)?
            .available_at(available_at);
        self.post_entry(entry).await
    }

    /// Enqueue a prepared entry
    ///
    /// Fails with [`QueueError::StoreUnavailable`] if the store cannot take
    /// the write. In `STICKY_EVENTS` mode the local poller is woken once the
    /// insert has committed.
    #[instrument(skip(self, entry), fields(queue = %entry.queue_name))]
    pub async fn post_entry(&self, entry: NewEntry) -> Result<EntryId, QueueError> {
        let queue_name = entry.queue_name.clone();
        let creating_owner = entry.creating_owner.clone();

        let id = self.store.insert(entry).await?;
        debug!(entry_id = id, "Posted entry");

        if self.config.dispatch_mode.wakes_on_commit() {
            self.notifier.notify_committed(&queue_name, &creating_owner);
        }
        Ok(id)
    }

    fn new_entry<T: Serialize + ?Sized>(
        &self,
        queue_name: &str,
        payload: &T,
        search_key1: i64,
        search_key2: i64,
        user_token: Option<Uuid>,
    ) -> Result<NewEntry, QueueError> {
        let payload = serde_json::to_value(payload)?;
        let mut entry = NewEntry::new(queue_name, payload, self.context.node_id())
            .with_search_keys(search_key1, search_key2);
        if let Some(token) = user_token {
            entry = entry.with_user_token(token);
        }
        Ok(entry)
    }

    /// Point-in-time view of this node
    pub fn status(&self) -> QueueStatus {
        let buffered = self
            .buffer
            .read()
            .as_ref()
            .map(|buffer| buffer.len())
            .unwrap_or(0);

        QueueStatus {
            node_id: self.context.node_id().to_string(),
            state: self.state(),
            dispatch_mode: self.config.dispatch_mode,
            queues: self.context.queue_names(),
            buffered,
            in_flight: self.in_flight.current(),
            peak_in_flight: self.in_flight.peak(),
            dispatch: self.dispatcher.stats().snapshot(),
        }
    }
}

impl Drop for QueueService {
    fn drop(&mut self) {
        // Dropping the sender stops pollers and the reaper; closing the
        // buffer lets dispatcher workers exit once it is drained.
        if let Some(workers) = self.workers.get_mut().take() {
            warn!(node = %self.context.node_id(), "Queue service dropped while running");
            workers.buffer.close();
        }
    }
}
