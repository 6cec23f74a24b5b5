//! In-memory implementation of EntryStore
//!
//! Used when `in_memory` is set and by tests and benchmarks.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use super::entry::{EntryId, EntryState, HistoryEntry, NewEntry, QueueEntry};
use super::store::{outcome_error, ClaimScope, EntryStore, StoreError};

/// In-memory implementation of EntryStore
///
/// Claims take the write lock, so a batch is atomic exactly like the
/// `SKIP LOCKED` claim of the PostgreSQL store.
///
/// # Example
///
/// ```
/// use everruns_queue::InMemoryEntryStore;
///
/// let store = InMemoryEntryStore::new();
/// assert_eq!(store.entry_count(), 0);
/// ```
pub struct InMemoryEntryStore {
    entries: RwLock<BTreeMap<EntryId, QueueEntry>>,
    history: RwLock<BTreeMap<EntryId, HistoryEntry>>,
    next_id: AtomicI64,
    unavailable: AtomicBool,
}

impl InMemoryEntryStore {
    /// Create a new empty store
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(BTreeMap::new()),
            history: RwLock::new(BTreeMap::new()),
            next_id: AtomicI64::new(1),
            unavailable: AtomicBool::new(false),
        }
    }

    /// Number of rows in the primary table
    pub fn entry_count(&self) -> usize {
        self.entries.read().len()
    }

    /// Number of rows in the history table
    pub fn history_count(&self) -> usize {
        self.history.read().len()
    }

    /// Simulate an outage: every call fails with [`StoreError::Unavailable`]
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn ensure_available(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("in-memory store offline".into()));
        }
        Ok(())
    }

    /// Apply `transition` to an entry claimed by `owner_id`
    fn with_claimed<F>(&self, id: EntryId, owner_id: &str, transition: F) -> Result<(), StoreError>
    where
        F: FnOnce(&mut QueueEntry),
    {
        self.ensure_available()?;
        let mut entries = self.entries.write();
        match entries.get_mut(&id) {
            Some(entry) if entry.is_claimed_by(owner_id) => {
                transition(entry);
                Ok(())
            }
            Some(entry) => Err(outcome_error(id, owner_id, Some(entry.state))),
            None => Err(outcome_error(id, owner_id, None)),
        }
    }

    fn finish(entry: &mut QueueEntry, state: EntryState) {
        entry.state = state;
        entry.owner_id = None;
        entry.claimed_time = None;
    }
}

impl Default for InMemoryEntryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn matches_keys(entry: &QueueEntry, queue_name: &str, key1: i64, key2: Option<i64>) -> bool {
    entry.queue_name == queue_name
        && entry.search_key1 == key1
        && key2.map_or(true, |key2| entry.search_key2 == key2)
}

#[async_trait]
impl EntryStore for InMemoryEntryStore {
    async fn health_check(&self) -> Result<(), StoreError> {
        self.ensure_available()
    }

    async fn insert(&self, entry: NewEntry) -> Result<EntryId, StoreError> {
        self.ensure_available()?;

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let now = Utc::now();
        let row = QueueEntry {
            id,
            queue_name: entry.queue_name,
            search_key1: entry.search_key1,
            search_key2: entry.search_key2,
            user_token: entry.user_token,
            payload: entry.payload,
            available_time: entry.available_time.unwrap_or(now),
            state: EntryState::Available,
            owner_id: None,
            claimed_time: None,
            error_count: 0,
            creating_owner: entry.creating_owner,
            created_time: now,
        };
        self.entries.write().insert(id, row);
        Ok(id)
    }

    async fn claim_batch(
        &self,
        queue_name: &str,
        owner_id: &str,
        scope: &ClaimScope,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<QueueEntry>, StoreError> {
        self.ensure_available()?;
        if limit == 0 {
            return Ok(vec![]);
        }

        let mut entries = self.entries.write();

        let mut candidates: Vec<(DateTime<Utc>, EntryId)> = entries
            .values()
            .filter(|e| {
                e.queue_name == queue_name
                    && e.state == EntryState::Available
                    && e.available_time <= now
                    && scope.admits(e)
            })
            .map(|e| (e.available_time, e.id))
            .collect();
        candidates.sort_unstable();
        candidates.truncate(limit);

        let mut claimed = Vec::with_capacity(candidates.len());
        for (_, id) in candidates {
            if let Some(entry) = entries.get_mut(&id) {
                entry.state = EntryState::InProcessing;
                entry.owner_id = Some(owner_id.to_string());
                entry.claimed_time = Some(now);
                claimed.push(entry.clone());
            }
        }

        Ok(claimed)
    }

    async fn mark_processed(&self, id: EntryId, owner_id: &str) -> Result<(), StoreError> {
        self.with_claimed(id, owner_id, |entry| {
            Self::finish(entry, EntryState::Processed)
        })
    }

    async fn mark_retry(
        &self,
        id: EntryId,
        owner_id: &str,
        available_time: DateTime<Utc>,
        error_count: u32,
    ) -> Result<(), StoreError> {
        self.with_claimed(id, owner_id, |entry| {
            Self::finish(entry, EntryState::Available);
            entry.available_time = entry.available_time.max(available_time);
            entry.error_count = entry.error_count.max(error_count);
        })
    }

    async fn mark_failed(&self, id: EntryId, owner_id: &str) -> Result<(), StoreError> {
        self.with_claimed(id, owner_id, |entry| {
            Self::finish(entry, EntryState::Failed)
        })
    }

    async fn move_to_history(&self, id: EntryId) -> Result<HistoryEntry, StoreError> {
        self.ensure_available()?;

        // Lock order: entries, then history
        let mut entries = self.entries.write();
        let state = entries
            .get(&id)
            .map(|e| e.state)
            .ok_or(StoreError::EntryNotFound(id))?;
        if !state.is_terminal() {
            return Err(StoreError::InvalidState {
                id,
                actual: state,
                expected: "PROCESSED or FAILED",
            });
        }

        let entry = entries.remove(&id).ok_or(StoreError::EntryNotFound(id))?;
        let archived = HistoryEntry {
            entry,
            processed_time: Utc::now(),
        };
        self.history.write().insert(id, archived.clone());
        Ok(archived)
    }

    async fn reclaim_stale(
        &self,
        older_than: DateTime<Utc>,
        limit: usize,
    ) -> Result<usize, StoreError> {
        self.ensure_available()?;

        let mut entries = self.entries.write();

        let mut stale: Vec<(DateTime<Utc>, EntryId)> = entries
            .values()
            .filter(|e| e.state == EntryState::InProcessing)
            .filter_map(|e| e.claimed_time.map(|t| (t, e.id)))
            .filter(|(claimed, _)| *claimed < older_than)
            .collect();
        stale.sort_unstable();
        stale.truncate(limit);

        for (_, id) in &stale {
            if let Some(entry) = entries.get_mut(id) {
                Self::finish(entry, EntryState::Available);
            }
        }

        Ok(stale.len())
    }

    async fn archive_terminal(&self, limit: usize) -> Result<usize, StoreError> {
        self.ensure_available()?;

        // Lock order: entries, then history
        let mut entries = self.entries.write();
        let terminal: Vec<EntryId> = entries
            .values()
            .filter(|e| e.state.is_terminal())
            .map(|e| e.id)
            .take(limit)
            .collect();

        let processed_time = Utc::now();
        let mut history = self.history.write();
        for id in &terminal {
            if let Some(entry) = entries.remove(id) {
                history.insert(
                    *id,
                    HistoryEntry {
                        entry,
                        processed_time,
                    },
                );
            }
        }

        Ok(terminal.len())
    }

    async fn get_entry(&self, id: EntryId) -> Result<Option<QueueEntry>, StoreError> {
        self.ensure_available()?;
        Ok(self.entries.read().get(&id).cloned())
    }

    async fn count_ready(
        &self,
        queue_name: &str,
        now: DateTime<Utc>,
    ) -> Result<usize, StoreError> {
        self.ensure_available()?;
        Ok(self
            .entries
            .read()
            .values()
            .filter(|e| {
                e.queue_name == queue_name
                    && e.state == EntryState::Available
                    && e.available_time <= now
            })
            .count())
    }

    async fn find_by_search_keys(
        &self,
        queue_name: &str,
        search_key1: i64,
        search_key2: Option<i64>,
    ) -> Result<Vec<QueueEntry>, StoreError> {
        self.ensure_available()?;
        Ok(self
            .entries
            .read()
            .values()
            .filter(|e| !e.state.is_terminal())
            .filter(|e| matches_keys(e, queue_name, search_key1, search_key2))
            .cloned()
            .collect())
    }

    async fn in_processing(&self, queue_name: &str) -> Result<Vec<QueueEntry>, StoreError> {
        self.ensure_available()?;
        Ok(self
            .entries
            .read()
            .values()
            .filter(|e| e.queue_name == queue_name && e.state == EntryState::InProcessing)
            .cloned()
            .collect())
    }

    async fn history_entry(&self, id: EntryId) -> Result<Option<HistoryEntry>, StoreError> {
        self.ensure_available()?;
        Ok(self.history.read().get(&id).cloned())
    }

    async fn history_for_search_keys(
        &self,
        queue_name: &str,
        search_key1: i64,
        search_key2: Option<i64>,
    ) -> Result<Vec<HistoryEntry>, StoreError> {
        self.ensure_available()?;
        Ok(self
            .history
            .read()
            .values()
            .filter(|h| matches_keys(&h.entry, queue_name, search_key1, search_key2))
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::Duration as ChronoDuration;
    use serde_json::json;

    use super::*;

    fn new_entry(queue: &str, owner: &str) -> NewEntry {
        NewEntry::new(queue, json!({"n": 1}), owner)
    }

    #[tokio::test]
    async fn test_insert_and_get() {
        let store = InMemoryEntryStore::new();
        let token = uuid::Uuid::now_v7();

        let id = store
            .insert(
                new_entry("invoices", "node-a")
                    .with_search_keys(3, 4)
                    .with_user_token(token),
            )
            .await
            .unwrap();

        let entry = store.get_entry(id).await.unwrap().unwrap();
        assert_eq!(entry.state, EntryState::Available);
        assert_eq!(entry.owner_id, None);
        assert_eq!(entry.claimed_time, None);
        assert_eq!(entry.error_count, 0);
        assert_eq!(entry.user_token, Some(token));
        assert_eq!(entry.creating_owner, "node-a");
        assert_eq!((entry.search_key1, entry.search_key2), (3, 4));
    }

    #[tokio::test]
    async fn test_ids_are_monotonic() {
        let store = InMemoryEntryStore::new();
        let a = store.insert(new_entry("q", "n")).await.unwrap();
        let b = store.insert(new_entry("q", "n")).await.unwrap();
        assert!(b > a);
    }

    #[tokio::test]
    async fn test_claim_orders_by_available_time_then_id() {
        let store = InMemoryEntryStore::new();
        let now = Utc::now();

        let late = store
            .insert(new_entry("q", "n").available_at(now - ChronoDuration::seconds(1)))
            .await
            .unwrap();
        let early_a = store
            .insert(new_entry("q", "n").available_at(now - ChronoDuration::seconds(10)))
            .await
            .unwrap();
        let early_b = store
            .insert(new_entry("q", "n").available_at(now - ChronoDuration::seconds(10)))
            .await
            .unwrap();

        let claimed = store
            .claim_batch("q", "worker", &ClaimScope::Any, 10, now)
            .await
            .unwrap();

        let ids: Vec<_> = claimed.iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![early_a, early_b, late]);
        for entry in &claimed {
            assert_eq!(entry.state, EntryState::InProcessing);
            assert_eq!(entry.owner_id.as_deref(), Some("worker"));
            assert_eq!(entry.claimed_time, Some(now));
        }
    }

    #[tokio::test]
    async fn test_claim_skips_future_and_other_queues() {
        let store = InMemoryEntryStore::new();
        let now = Utc::now();

        store
            .insert(new_entry("q", "n").available_at(now + ChronoDuration::minutes(5)))
            .await
            .unwrap();
        store.insert(new_entry("other", "n")).await.unwrap();

        let claimed = store
            .claim_batch("q", "worker", &ClaimScope::Any, 10, now)
            .await
            .unwrap();
        assert!(claimed.is_empty());
        assert_eq!(store.count_ready("q", now).await.unwrap(), 0);
        assert_eq!(store.count_ready("other", now).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_claim_respects_limit_and_scope() {
        let store = InMemoryEntryStore::new();
        for _ in 0..3 {
            store.insert(new_entry("q", "node-a")).await.unwrap();
        }
        store.insert(new_entry("q", "node-b")).await.unwrap();

        let scope = ClaimScope::CreatedBy("node-b".into());
        let claimed = store
            .claim_batch("q", "node-b", &scope, 10, Utc::now())
            .await
            .unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].creating_owner, "node-b");

        let claimed = store
            .claim_batch("q", "node-x", &ClaimScope::Any, 2, Utc::now())
            .await
            .unwrap();
        assert_eq!(claimed.len(), 2);

        let claimed = store
            .claim_batch("q", "node-x", &ClaimScope::Any, 0, Utc::now())
            .await
            .unwrap();
        assert!(claimed.is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_claims_never_overlap() {
        let store = Arc::new(InMemoryEntryStore::new());
        for _ in 0..50 {
            store.insert(new_entry("q", "n")).await.unwrap();
        }

        let mut handles = Vec::new();
        for worker in 0..8 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                let owner = format!("worker-{worker}");
                let mut ids = Vec::new();
                loop {
                    let batch = store
                        .claim_batch("q", &owner, &ClaimScope::Any, 3, Utc::now())
                        .await
                        .unwrap();
                    if batch.is_empty() {
                        break;
                    }
                    ids.extend(batch.into_iter().map(|e| e.id));
                }
                ids
            }));
        }

        let mut all_ids = Vec::new();
        for handle in handles {
            all_ids.extend(handle.await.unwrap());
        }
        all_ids.sort();
        let total = all_ids.len();
        all_ids.dedup();
        assert_eq!(total, 50);
        assert_eq!(all_ids.len(), 50);
    }

    #[tokio::test]
    async fn test_mark_processed_and_move_to_history() {
        let store = InMemoryEntryStore::new();
        let id = store.insert(new_entry("q", "n")).await.unwrap();
        store
            .claim_batch("q", "w", &ClaimScope::Any, 1, Utc::now())
            .await
            .unwrap();

        store.mark_processed(id, "w").await.unwrap();
        let entry = store.get_entry(id).await.unwrap().unwrap();
        assert_eq!(entry.state, EntryState::Processed);
        assert_eq!(entry.owner_id, None);
        assert_eq!(entry.claimed_time, None);

        let archived = store.move_to_history(id).await.unwrap();
        assert_eq!(archived.state(), EntryState::Processed);
        assert!(store.get_entry(id).await.unwrap().is_none());
        assert_eq!(store.history_entry(id).await.unwrap(), Some(archived));

        // Archival happens once
        assert_eq!(
            store.move_to_history(id).await,
            Err(StoreError::EntryNotFound(id))
        );
    }

    #[tokio::test]
    async fn test_move_to_history_requires_terminal_state() {
        let store = InMemoryEntryStore::new();
        let id = store.insert(new_entry("q", "n")).await.unwrap();

        assert!(matches!(
            store.move_to_history(id).await,
            Err(StoreError::InvalidState {
                actual: EntryState::Available,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_archive_terminal_sweeps_leftover_rows() {
        let store = InMemoryEntryStore::new();
        let now = Utc::now();
        let mut ids = Vec::new();
        for _ in 0..3 {
            ids.push(
                store
                    .insert(new_entry("q", "n").available_at(now))
                    .await
                    .unwrap(),
            );
        }
        let pending = store.insert(new_entry("q", "n")).await.unwrap();

        store
            .claim_batch("q", "w", &ClaimScope::Any, 3, now)
            .await
            .unwrap();
        store.mark_processed(ids[0], "w").await.unwrap();
        store.mark_failed(ids[1], "w").await.unwrap();
        store.mark_processed(ids[2], "w").await.unwrap();

        assert_eq!(store.archive_terminal(2).await.unwrap(), 2);
        assert_eq!(store.archive_terminal(10).await.unwrap(), 1);
        assert_eq!(store.archive_terminal(10).await.unwrap(), 0);

        assert_eq!(store.history_count(), 3);
        let failed = store.history_entry(ids[1]).await.unwrap().unwrap();
        assert_eq!(failed.entry.state, EntryState::Failed);
        assert!(store.get_entry(pending).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_mark_retry_is_monotonic() {
        let store = InMemoryEntryStore::new();
        let now = Utc::now();
        let id = store
            .insert(new_entry("q", "n").available_at(now))
            .await
            .unwrap();
        store
            .claim_batch("q", "w", &ClaimScope::Any, 1, now)
            .await
            .unwrap();

        // An earlier time and a lower count are ignored
        store
            .mark_retry(id, "w", now - ChronoDuration::minutes(1), 0)
            .await
            .unwrap();
        let entry = store.get_entry(id).await.unwrap().unwrap();
        assert_eq!(entry.available_time, now);
        assert_eq!(entry.state, EntryState::Available);

        store
            .claim_batch("q", "w", &ClaimScope::Any, 1, now)
            .await
            .unwrap();
        let later = now + ChronoDuration::seconds(30);
        store.mark_retry(id, "w", later, 1).await.unwrap();
        let entry = store.get_entry(id).await.unwrap().unwrap();
        assert_eq!(entry.available_time, later);
        assert_eq!(entry.error_count, 1);
        assert_eq!(entry.owner_id, None);
    }

    #[tokio::test]
    async fn test_outcome_requires_lease() {
        let store = InMemoryEntryStore::new();
        let id = store.insert(new_entry("q", "n")).await.unwrap();

        // Not claimed at all
        assert!(matches!(
            store.mark_processed(id, "w").await,
            Err(StoreError::LeaseLost { .. })
        ));

        store
            .claim_batch("q", "w1", &ClaimScope::Any, 1, Utc::now())
            .await
            .unwrap();
        assert_eq!(
            store.mark_failed(id, "w2").await,
            Err(StoreError::LeaseLost {
                id,
                owner: "w2".into()
            })
        );

        store.mark_failed(id, "w1").await.unwrap();
        assert!(matches!(
            store.mark_processed(id, "w1").await,
            Err(StoreError::InvalidState {
                actual: EntryState::Failed,
                ..
            })
        ));

        assert_eq!(
            store.mark_processed(999, "w1").await,
            Err(StoreError::EntryNotFound(999))
        );
    }

    #[tokio::test]
    async fn test_reclaim_stale_preserves_error_count() {
        let store = InMemoryEntryStore::new();
        let id = store.insert(new_entry("q", "n")).await.unwrap();
        let now = Utc::now();
        store
            .claim_batch("q", "w", &ClaimScope::Any, 1, now)
            .await
            .unwrap();
        store.mark_retry(id, "w", now, 2).await.unwrap();

        // Claimed by a node that then crashed an hour ago
        store
            .claim_batch("q", "crashed", &ClaimScope::Any, 1, now)
            .await
            .unwrap();
        store.entries.write().get_mut(&id).unwrap().claimed_time =
            Some(now - ChronoDuration::hours(1));

        let reclaimed = store
            .reclaim_stale(now - ChronoDuration::minutes(10), 10)
            .await
            .unwrap();
        assert_eq!(reclaimed, 1);

        let entry = store.get_entry(id).await.unwrap().unwrap();
        assert_eq!(entry.state, EntryState::Available);
        assert_eq!(entry.owner_id, None);
        assert_eq!(entry.claimed_time, None);
        assert_eq!(entry.error_count, 2);

        // Reclaiming again is a no-op
        let reclaimed = store
            .reclaim_stale(now - ChronoDuration::minutes(10), 10)
            .await
            .unwrap();
        assert_eq!(reclaimed, 0);
    }

    #[tokio::test]
    async fn test_reclaim_stale_respects_threshold_and_limit() {
        let store = InMemoryEntryStore::new();
        let now = Utc::now();
        for _ in 0..5 {
            store
                .insert(new_entry("q", "n").available_at(now - ChronoDuration::hours(2)))
                .await
                .unwrap();
        }

        let old = now - ChronoDuration::hours(1);
        store
            .claim_batch("q", "old", &ClaimScope::Any, 3, old)
            .await
            .unwrap();
        store
            .claim_batch("q", "fresh", &ClaimScope::Any, 2, now)
            .await
            .unwrap();

        let cutoff = now - ChronoDuration::minutes(10);
        assert_eq!(store.reclaim_stale(cutoff, 2).await.unwrap(), 2);
        assert_eq!(store.reclaim_stale(cutoff, 2).await.unwrap(), 1);
        assert_eq!(store.reclaim_stale(cutoff, 2).await.unwrap(), 0);
        assert_eq!(store.in_processing("q").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_search_key_lookups() {
        let store = InMemoryEntryStore::new();
        let a = store
            .insert(new_entry("q", "n").with_search_keys(1, 100))
            .await
            .unwrap();
        let b = store
            .insert(new_entry("q", "n").with_search_keys(1, 200))
            .await
            .unwrap();
        store
            .insert(new_entry("q", "n").with_search_keys(2, 100))
            .await
            .unwrap();

        let found = store.find_by_search_keys("q", 1, None).await.unwrap();
        assert_eq!(found.iter().map(|e| e.id).collect::<Vec<_>>(), vec![a, b]);

        let found = store.find_by_search_keys("q", 1, Some(200)).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, b);

        store
            .claim_batch("q", "w", &ClaimScope::Any, 1, Utc::now())
            .await
            .unwrap();
        store.mark_processed(a, "w").await.unwrap();
        store.move_to_history(a).await.unwrap();

        let history = store.history_for_search_keys("q", 1, None).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].entry.id, a);
        assert_eq!(store.find_by_search_keys("q", 1, None).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_unavailable_store_fails_every_call() {
        let store = InMemoryEntryStore::new();
        store.set_unavailable(true);

        assert!(store.health_check().await.unwrap_err().is_transient());
        assert!(matches!(
            store.insert(new_entry("q", "n")).await,
            Err(StoreError::Unavailable(_))
        ));

        store.set_unavailable(false);
        assert!(store.health_check().await.is_ok());
    }
}
