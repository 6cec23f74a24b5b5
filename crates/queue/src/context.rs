//! Node identity and handler registry
//!
//! A [`QueueContext`] is created per service and handed to the poller and
//! dispatchers; nothing here is process-global.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use uuid::Uuid;

use crate::error::{HandlerError, LifecycleError, QueueError};
use crate::persistence::QueueEntry;

/// Consumer callback for one queue
///
/// Called at least once per entry; implementations must be idempotent.
#[async_trait]
pub trait EntryHandler: Send + Sync + 'static {
    async fn handle(&self, entry: &QueueEntry) -> Result<(), HandlerError>;
}

type HandlerFuture = Pin<Box<dyn Future<Output = Result<(), HandlerError>> + Send>>;

type BoxedHandlerFn = dyn Fn(QueueEntry) -> HandlerFuture + Send + Sync;

/// Adapter turning an async closure into an [`EntryHandler`]
struct FnHandler {
    f: Box<BoxedHandlerFn>,
}

#[async_trait]
impl EntryHandler for FnHandler {
    async fn handle(&self, entry: &QueueEntry) -> Result<(), HandlerError> {
        (self.f)(entry.clone()).await
    }
}

/// Per-service context: node identity plus one handler per queue
///
/// The registry is sealed while the service runs.
pub struct QueueContext {
    node_id: String,
    handlers: RwLock<HashMap<String, Arc<dyn EntryHandler>>>,
    sealed: AtomicBool,
}

impl QueueContext {
    /// Create a context for the given node
    pub fn new(node_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            handlers: RwLock::new(HashMap::new()),
            sealed: AtomicBool::new(false),
        }
    }

    /// Create a context with a generated node id
    pub fn with_generated_node_id() -> Self {
        Self::new(format!("node-{}", Uuid::now_v7()))
    }

    /// This node's identity (used as claim owner and creating owner)
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Register the handler for `queue_name`
    pub fn register(
        &self,
        queue_name: impl Into<String>,
        handler: Arc<dyn EntryHandler>,
    ) -> Result<(), QueueError> {
        if self.sealed.load(Ordering::SeqCst) {
            return Err(LifecycleError::RegistrySealed.into());
        }

        let queue_name = queue_name.into();
        let mut handlers = self.handlers.write();
        if handlers.contains_key(&queue_name) {
            return Err(QueueError::DuplicateHandler(queue_name));
        }
        handlers.insert(queue_name, handler);
        Ok(())
    }

    /// Register an async closure as the handler for `queue_name`
    pub fn register_fn<F, Fut>(&self, queue_name: impl Into<String>, f: F) -> Result<(), QueueError>
    where
        F: Fn(QueueEntry) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        let handler = FnHandler {
            f: Box::new(move |entry| -> HandlerFuture { Box::pin(f(entry)) }),
        };
        self.register(queue_name, Arc::new(handler))
    }

    /// Handler for `queue_name`, if any
    pub fn handler(&self, queue_name: &str) -> Option<Arc<dyn EntryHandler>> {
        self.handlers.read().get(queue_name).cloned()
    }

    /// Registered queue names, sorted
    pub fn queue_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Freeze the registry (service start)
    pub(crate) fn init(&self) {
        self.sealed.store(true, Ordering::SeqCst);
    }

    /// Reopen the registry (service stop)
    pub(crate) fn teardown(&self) {
        self.sealed.store(false, Ordering::SeqCst);
    }
}
