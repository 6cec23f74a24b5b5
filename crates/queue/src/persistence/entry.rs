//! Queue entry data model

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::store::StoreError;

/// Entry identifier; monotonically assigned, also the ordering tiebreaker
pub type EntryId = i64;

/// Processing state of a queue entry
///
/// `AVAILABLE → IN_PROCESSING → {AVAILABLE (retry/reap), PROCESSED, FAILED}`.
/// `PROCESSED` and `FAILED` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EntryState {
    /// Claimable once `available_time` has passed
    Available,
    /// Claimed by `owner_id` at `claimed_time`
    InProcessing,
    /// Handler succeeded
    Processed,
    /// Retries exhausted or permanent failure
    Failed,
}

impl EntryState {
    pub fn as_str(self) -> &'static str {
        match self {
            EntryState::Available => "AVAILABLE",
            EntryState::InProcessing => "IN_PROCESSING",
            EntryState::Processed => "PROCESSED",
            EntryState::Failed => "FAILED",
        }
    }

    /// Whether the entry has reached a final outcome
    pub fn is_terminal(self) -> bool {
        matches!(self, EntryState::Processed | EntryState::Failed)
    }
}

impl fmt::Display for EntryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntryState {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "AVAILABLE" => Ok(EntryState::Available),
            "IN_PROCESSING" => Ok(EntryState::InProcessing),
            "PROCESSED" => Ok(EntryState::Processed),
            "FAILED" => Ok(EntryState::Failed),
            other => Err(StoreError::Serialization(format!(
                "unknown entry state: {other}"
            ))),
        }
    }
}

/// A persisted queue entry
///
/// `owner_id` and `claimed_time` are set exactly when the state is
/// `IN_PROCESSING`. Holding a `QueueEntry` is a lease, not ownership: the
/// store stays the source of truth and the reaper may revoke the claim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueEntry {
    pub id: EntryId,
    pub queue_name: String,
    pub search_key1: i64,
    pub search_key2: i64,
    pub user_token: Option<Uuid>,
    pub payload: serde_json::Value,
    pub available_time: DateTime<Utc>,
    pub state: EntryState,
    pub owner_id: Option<String>,
    pub claimed_time: Option<DateTime<Utc>>,
    pub error_count: u32,
    pub creating_owner: String,
    pub created_time: DateTime<Utc>,
}

impl QueueEntry {
    /// Deserialize the payload into the handler's event type
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.payload.clone())
    }

    /// Whether `owner` currently holds the claim
    pub fn is_claimed_by(&self, owner: &str) -> bool {
        self.state == EntryState::InProcessing && self.owner_id.as_deref() == Some(owner)
    }
}

/// An entry about to be inserted
///
/// # Example
///
/// ```
/// use everruns_queue::persistence::NewEntry;
/// use serde_json::json;
///
/// let entry = NewEntry::new("invoices", json!({"invoice_id": 42}), "node-a")
///     .with_search_keys(7, 11);
/// assert_eq!(entry.search_key1, 7);
/// assert!(entry.available_time.is_none());
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewEntry {
    pub queue_name: String,
    pub search_key1: i64,
    pub search_key2: i64,
    pub user_token: Option<Uuid>,
    pub payload: serde_json::Value,
    /// `None` means available immediately
    pub available_time: Option<DateTime<Utc>>,
    pub creating_owner: String,
}

impl NewEntry {
    pub fn new(
        queue_name: impl Into<String>,
        payload: serde_json::Value,
        creating_owner: impl Into<String>,
    ) -> Self {
        Self {
            queue_name: queue_name.into(),
            search_key1: 0,
            search_key2: 0,
            user_token: None,
            payload,
            available_time: None,
            creating_owner: creating_owner.into(),
        }
    }

    /// Set both search keys
    pub fn with_search_keys(mut self, search_key1: i64, search_key2: i64) -> Self {
        self.search_key1 = search_key1;
        self.search_key2 = search_key2;
        self
    }

    /// Set the correlation token
    pub fn with_user_token(mut self, token: Uuid) -> Self {
        self.user_token = Some(token);
        self
    }

    /// Delay availability until `time`
    pub fn available_at(mut self, time: DateTime<Utc>) -> Self {
        self.available_time = Some(time);
        self
    }
}

/// A terminal entry in the append-only history table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    /// Entry as it was when archived; `state` is `PROCESSED` or `FAILED`
    #[serde(flatten)]
    pub entry: QueueEntry,
    /// When the entry was archived
    pub processed_time: DateTime<Utc>,
}

impl HistoryEntry {
    pub fn state(&self) -> EntryState {
        self.entry.state
    }
}
