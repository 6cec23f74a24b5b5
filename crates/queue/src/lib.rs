//! # Persistent Queue Engine
//!
//! A database-backed queue and notification bus: producers post entries, a
//! poller claims them atomically, dispatchers run the registered handler and
//! the outcome (processed, retried with backoff, failed) is written back to
//! the store. Terminal entries move to a history table.
//!
//! ## Features
//!
//! - **At-least-once delivery**: claims are atomic, stale claims are reaped
//! - **Retries with backoff**: exponential or fixed, capped, with jitter
//! - **Sticky dispatch**: optionally keep entries on the node that created them
//! - **Backpressure**: in-flight bounds and a bounded dispatch buffer
//! - **PostgreSQL or in-memory storage** behind one [`EntryStore`] trait
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       QueueService                           │
//! │  (lifecycle, post/post_at, handler registry, status)        │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │          Poller ─▶ EntryBuffer ─▶ DispatcherPool             │
//! │                        Reaper                                │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       EntryStore                             │
//! │  (PostgreSQL: queue_entries, queue_entries_history)         │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```
//! use everruns_queue::{DispatchMode, QueueConfig, RetryPolicy};
//! use std::time::Duration;
//!
//! let config = QueueConfig::default()
//!     .with_dispatch_mode(DispatchMode::Polling)
//!     .with_max_failure_retries(5)
//!     .with_retry_policy(RetryPolicy::exponential())
//!     .with_polling_interval(Duration::from_millis(500))
//!     .with_in_memory(true);
//!
//! assert!(config.validate().is_ok());
//! ```

pub mod config;
pub mod context;
pub mod error;
pub mod lifecycle;
pub mod persistence;
pub mod reliability;
pub mod worker;

/// Prelude for common imports
pub mod prelude {
    pub use crate::config::{DispatchMode, QueueConfig};
    pub use crate::context::{EntryHandler, QueueContext};
    pub use crate::error::{HandlerError, LifecycleError, QueueError};
    pub use crate::lifecycle::{LifecycleState, QueueService, QueueStatus};
    pub use crate::persistence::{
        EntryId, EntryState, EntryStore, HistoryEntry, InMemoryEntryStore, NewEntry,
        PostgresEntryStore, QueueEntry, StoreError,
    };
    pub use crate::reliability::RetryPolicy;
}

// Re-export key types at crate root
pub use config::{ConfigError, DispatchMode, QueueConfig};
pub use context::{EntryHandler, QueueContext};
pub use error::{HandlerError, LifecycleError, QueueError};
pub use lifecycle::{LifecycleState, QueueService, QueueServiceBuilder, QueueStatus};
pub use persistence::{
    EntryId, EntryState, EntryStore, HistoryEntry, InMemoryEntryStore, NewEntry,
    PostgresEntryStore, QueueEntry, StoreError,
};
pub use reliability::{RetryDecision, RetryPolicy};
pub use worker::CommitNotifier;
