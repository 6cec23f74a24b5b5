//! Error types shared across the queue engine
//!
//! Each layer owns its error enum: [`StoreError`] for persistence,
//! [`ConfigError`] for configuration, [`HandlerError`] for consumer callbacks
//! and [`LifecycleError`] for start/stop ordering. [`QueueError`] is what the
//! public service API returns.

use std::time::Duration;

use crate::config::ConfigError;
use crate::lifecycle::LifecycleState;
use crate::persistence::StoreError;

/// Errors returned by [`QueueService`](crate::QueueService)
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    /// The entry store could not accept the request
    #[error("entry store unavailable: {0}")]
    StoreUnavailable(#[source] StoreError),

    /// Non-transient store failure (bad state, lost lease, corrupt row)
    #[error("store error: {0}")]
    Store(#[source] StoreError),

    /// Invalid configuration, fatal at startup
    #[error("configuration error: {0}")]
    Configuration(#[from] ConfigError),

    /// Start/stop called out of order
    #[error("lifecycle error: {0}")]
    Lifecycle(#[from] LifecycleError),

    /// A handler is already registered for this queue
    #[error("a handler is already registered for queue: {0}")]
    DuplicateHandler(String),

    /// Payload could not be serialized
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<StoreError> for QueueError {
    fn from(err: StoreError) -> Self {
        if err.is_transient() {
            QueueError::StoreUnavailable(err)
        } else {
            QueueError::Store(err)
        }
    }
}

/// Start/stop ordering errors
///
/// These are reported to the caller and never tear the service down.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LifecycleError {
    /// `start` called while the service is not stopped
    #[error("queue service cannot start while {0}")]
    AlreadyStarted(LifecycleState),

    /// `stop` called while the service is not running
    #[error("queue service cannot stop while {0}")]
    NotRunning(LifecycleState),

    /// Handlers can only be registered while the service is stopped
    #[error("handler registry is sealed while the service is running")]
    RegistrySealed,
}

/// Failure reported by an entry handler
///
/// `Failed` drives the retry/backoff state machine. `Permanent` marks the
/// entry `FAILED` on the spot, without consuming further retries.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    /// Retryable handler failure
    #[error("handler failed: {0}")]
    Failed(String),

    /// Failure that retrying cannot fix
    #[error("permanent failure: {0}")]
    Permanent(String),

    /// Payload did not match the type the handler expects
    #[error("payload deserialization failed: {0}")]
    Deserialization(#[from] serde_json::Error),

    /// Handler did not finish within the claim timeout
    #[error("handler timed out after {0:?}")]
    TimedOut(Duration),

    /// Handler panicked
    #[error("handler panicked: {0}")]
    Panicked(String),
}

impl HandlerError {
    /// Create a retryable failure
    pub fn failed(message: impl Into<String>) -> Self {
        HandlerError::Failed(message.into())
    }

    /// Create a non-retryable failure
    pub fn permanent(message: impl Into<String>) -> Self {
        HandlerError::Permanent(message.into())
    }

    /// Whether the retry machine should be skipped
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            HandlerError::Permanent(_) | HandlerError::Deserialization(_)
        )
    }
}

impl From<String> for HandlerError {
    fn from(message: String) -> Self {
        HandlerError::Failed(message)
    }
}

impl From<&str> for HandlerError {
    fn from(message: &str) -> Self {
        HandlerError::Failed(message.to_string())
    }
}
