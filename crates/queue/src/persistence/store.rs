//! EntryStore trait definition

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::entry::{EntryId, EntryState, HistoryEntry, NewEntry, QueueEntry};

/// Error type for store operations
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// Database error
    #[error("database error: {0}")]
    Database(String),

    /// Store cannot be reached (pool exhausted, connection refused, ...)
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Entry not found in the primary table
    #[error("entry not found: {0}")]
    EntryNotFound(EntryId),

    /// The caller's claim was revoked (reaped or re-claimed elsewhere)
    #[error("entry {id} is no longer claimed by {owner}")]
    LeaseLost { id: EntryId, owner: String },

    /// Transition not allowed from the entry's current state
    #[error("entry {id} is {actual}, expected {expected}")]
    InvalidState {
        id: EntryId,
        actual: EntryState,
        expected: &'static str,
    },
}

impl StoreError {
    /// Whether retrying the same call later may succeed
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Database(_) | StoreError::Unavailable(_))
    }
}

/// Which entries a claim may pick up
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimScope {
    /// Any available entry (POLLING)
    Any,
    /// Only entries created by this node (STICKY_*)
    CreatedBy(String),
}

impl ClaimScope {
    pub fn admits(&self, entry: &QueueEntry) -> bool {
        match self {
            ClaimScope::Any => true,
            ClaimScope::CreatedBy(owner) => entry.creating_owner == *owner,
        }
    }

    pub(crate) fn creating_owner(&self) -> Option<&str> {
        match self {
            ClaimScope::Any => None,
            ClaimScope::CreatedBy(owner) => Some(owner),
        }
    }
}

/// Explain why an outcome update matched no row
///
/// `current` is the entry's state if it still exists.
pub(crate) fn outcome_error(id: EntryId, owner_id: &str, current: Option<EntryState>) -> StoreError {
    match current {
        None => StoreError::EntryNotFound(id),
        Some(state) if state.is_terminal() => StoreError::InvalidState {
            id,
            actual: state,
            expected: "IN_PROCESSING",
        },
        Some(_) => StoreError::LeaseLost {
            id,
            owner: owner_id.to_string(),
        },
    }
}

/// Durable storage for queue entries and their history
///
/// Every method is atomic with respect to concurrent callers: in particular
/// no two `claim_batch` calls ever return the same entry.
///
/// Completion methods take the caller's `owner_id` and fail with
/// [`StoreError::LeaseLost`] if the claim has been revoked in the meantime.
#[async_trait]
pub trait EntryStore: Send + Sync + 'static {
    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Verify the store can serve requests
    async fn health_check(&self) -> Result<(), StoreError>;

    // =========================================================================
    // Producer
    // =========================================================================

    /// Insert a new `AVAILABLE` entry and return its id
    async fn insert(&self, entry: NewEntry) -> Result<EntryId, StoreError>;

    // =========================================================================
    // Claiming
    // =========================================================================

    /// Atomically claim up to `limit` available entries of `queue_name`
    ///
    /// Only entries with `available_time <= now` that `scope` admits are
    /// considered. Claimed entries are `IN_PROCESSING` with `owner_id` and
    /// `claimed_time = now`, returned ordered by `(available_time, id)`.
    async fn claim_batch(
        &self,
        queue_name: &str,
        owner_id: &str,
        scope: &ClaimScope,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<QueueEntry>, StoreError>;

    // =========================================================================
    // Outcomes
    // =========================================================================

    /// `IN_PROCESSING → PROCESSED`
    async fn mark_processed(&self, id: EntryId, owner_id: &str) -> Result<(), StoreError>;

    /// `IN_PROCESSING → AVAILABLE` with a new availability time and error count
    ///
    /// Neither value may move backwards; the store keeps the larger one.
    async fn mark_retry(
        &self,
        id: EntryId,
        owner_id: &str,
        available_time: DateTime<Utc>,
        error_count: u32,
    ) -> Result<(), StoreError>;

    /// `IN_PROCESSING → FAILED`
    async fn mark_failed(&self, id: EntryId, owner_id: &str) -> Result<(), StoreError>;

    /// Move a terminal entry to the history table and delete the original row
    async fn move_to_history(&self, id: EntryId) -> Result<HistoryEntry, StoreError>;

    // =========================================================================
    // Recovery
    // =========================================================================

    /// Return up to `limit` entries claimed before `older_than` to `AVAILABLE`
    ///
    /// Owner and claim time are cleared, `error_count` is preserved.
    async fn reclaim_stale(
        &self,
        older_than: DateTime<Utc>,
        limit: usize,
    ) -> Result<usize, StoreError>;

    /// Move up to `limit` terminal entries still in the primary table to history
    ///
    /// Picks up rows whose archival failed after the terminal mark was
    /// written, oldest id first.
    async fn archive_terminal(&self, limit: usize) -> Result<usize, StoreError>;

    // =========================================================================
    // Inspection
    // =========================================================================

    /// Fetch an entry from the primary table
    async fn get_entry(&self, id: EntryId) -> Result<Option<QueueEntry>, StoreError>;

    /// Number of entries claimable at `now`, ignoring claim scope
    async fn count_ready(&self, queue_name: &str, now: DateTime<Utc>)
        -> Result<usize, StoreError>;

    /// Non-terminal entries matching the search keys, ordered by id
    async fn find_by_search_keys(
        &self,
        queue_name: &str,
        search_key1: i64,
        search_key2: Option<i64>,
    ) -> Result<Vec<QueueEntry>, StoreError>;

    /// Entries currently claimed in `queue_name`, ordered by id
    async fn in_processing(&self, queue_name: &str) -> Result<Vec<QueueEntry>, StoreError>;

    /// Fetch an archived entry
    async fn history_entry(&self, id: EntryId) -> Result<Option<HistoryEntry>, StoreError>;

    /// Archived entries matching the search keys, ordered by id
    async fn history_for_search_keys(
        &self,
        queue_name: &str,
        search_key1: i64,
        search_key2: Option<i64>,
    ) -> Result<Vec<HistoryEntry>, StoreError>;
}
