//! Bounded buffer between the poller and the dispatcher workers

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::persistence::QueueEntry;

/// Bounded FIFO of claimed entries
///
/// `push` waits while the buffer is full and `take` waits while it is empty.
/// After [`close`](Self::close), pushes are refused and `take` keeps handing
/// out what is left, then returns `None`.
pub struct EntryBuffer {
    queue: Mutex<VecDeque<QueueEntry>>,
    capacity: usize,
    closed: AtomicBool,
    items: Notify,
    space: Notify,
}

impl EntryBuffer {
    /// Create a buffer holding at most `capacity` entries
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            queue: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
            capacity,
            closed: AtomicBool::new(false),
            items: Notify::new(),
            space: Notify::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }

    /// Free slots right now
    pub fn remaining(&self) -> usize {
        self.capacity.saturating_sub(self.len())
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Append an entry, waiting for space
    ///
    /// Returns the entry back if the buffer is closed.
    pub async fn push(&self, entry: QueueEntry) -> Result<(), QueueEntry> {
        loop {
            let space = self.space.notified();
            tokio::pin!(space);
            space.as_mut().enable();

            if self.is_closed() {
                return Err(entry);
            }

            {
                let mut queue = self.queue.lock();
                if queue.len() < self.capacity {
                    queue.push_back(entry);
                    drop(queue);
                    self.items.notify_one();
                    return Ok(());
                }
            }

            space.await;
        }
    }

    /// Remove the oldest entry, waiting while empty
    ///
    /// Returns `None` once the buffer is closed and drained.
    pub async fn take(&self) -> Option<QueueEntry> {
        loop {
            let items = self.items.notified();
            tokio::pin!(items);
            items.as_mut().enable();

            let next = self.queue.lock().pop_front();
            if let Some(entry) = next {
                self.space.notify_one();
                // Wake another consumer if more work is queued
                if !self.is_empty() {
                    self.items.notify_one();
                }
                return Some(entry);
            }

            if self.is_closed() {
                return None;
            }

            items.await;
        }
    }

    /// Refuse further pushes and wake every waiter
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.items.notify_waiters();
        self.space.notify_waiters();
    }

    /// Drop everything still buffered and return how many entries were dropped
    ///
    /// The entries stay `IN_PROCESSING` in the store until the reaper
    /// reclaims them.
    pub fn abandon(&self) -> usize {
        let dropped = {
            let mut queue = self.queue.lock();
            let dropped = queue.len();
            queue.clear();
            dropped
        };
        self.space.notify_waiters();
        dropped
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use chrono::Utc;
    use serde_json::json;

    use super::*;
    use crate::persistence::EntryState;

    fn entry(id: i64) -> QueueEntry {
        let now = Utc::now();
        QueueEntry {
            id,
            queue_name: "q".into(),
            search_key1: 0,
            search_key2: 0,
            user_token: None,
            payload: json!({}),
            available_time: now,
            state: EntryState::InProcessing,
            owner_id: Some("node".into()),
            claimed_time: Some(now),
            error_count: 0,
            creating_owner: "node".into(),
            created_time: now,
        }
    }

    #[tokio::test]
    async fn test_fifo_order() {
        let buffer = EntryBuffer::new(10);
        for id in 1..=3 {
            buffer.push(entry(id)).await.unwrap();
        }
        assert_eq!(buffer.len(), 3);
        assert_eq!(buffer.remaining(), 7);

        for id in 1..=3 {
            assert_eq!(buffer.take().await.unwrap().id, id);
        }
        assert!(buffer.is_empty());
    }

    #[tokio::test]
    async fn test_take_waits_for_push() {
        let buffer = Arc::new(EntryBuffer::new(1));

        let consumer = {
            let buffer = Arc::clone(&buffer);
            tokio::spawn(async move { buffer.take().await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!consumer.is_finished());

        buffer.push(entry(42)).await.unwrap();
        let taken = tokio::time::timeout(Duration::from_secs(1), consumer)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(taken.unwrap().id, 42);
    }

    #[tokio::test]
    async fn test_push_blocks_when_full() {
        let buffer = Arc::new(EntryBuffer::new(1));
        buffer.push(entry(1)).await.unwrap();

        let producer = {
            let buffer = Arc::clone(&buffer);
            tokio::spawn(async move { buffer.push(entry(2)).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!producer.is_finished());
        assert_eq!(buffer.len(), 1);

        assert_eq!(buffer.take().await.unwrap().id, 1);
        tokio::time::timeout(Duration::from_secs(1), producer)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(buffer.take().await.unwrap().id, 2);
    }

    #[tokio::test]
    async fn test_close_drains_then_ends() {
        let buffer = Arc::new(EntryBuffer::new(4));
        buffer.push(entry(1)).await.unwrap();

        buffer.close();
        assert!(buffer.push(entry(2)).await.is_err());

        assert_eq!(buffer.take().await.unwrap().id, 1);
        assert!(buffer.take().await.is_none());
    }

    #[tokio::test]
    async fn test_close_wakes_waiting_consumers() {
        let buffer = Arc::new(EntryBuffer::new(4));

        let consumers: Vec<_> = (0..3)
            .map(|_| {
                let buffer = Arc::clone(&buffer);
                tokio::spawn(async move { buffer.take().await })
            })
            .collect();

        tokio::time::sleep(Duration::from_millis(20)).await;
        buffer.close();

        for consumer in consumers {
            let taken = tokio::time::timeout(Duration::from_secs(1), consumer)
                .await
                .unwrap()
                .unwrap();
            assert!(taken.is_none());
        }
    }

    #[tokio::test]
    async fn test_close_wakes_blocked_producer() {
        let buffer = Arc::new(EntryBuffer::new(1));
        buffer.push(entry(1)).await.unwrap();

        let producer = {
            let buffer = Arc::clone(&buffer);
            tokio::spawn(async move { buffer.push(entry(2)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        buffer.close();

        let result = tokio::time::timeout(Duration::from_secs(1), producer)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(result.unwrap_err().id, 2);
    }

    #[tokio::test]
    async fn test_abandon_drops_buffered_entries() {
        let buffer = EntryBuffer::new(4);
        buffer.push(entry(1)).await.unwrap();
        buffer.push(entry(2)).await.unwrap();

        assert_eq!(buffer.abandon(), 2);
        assert!(buffer.is_empty());
        assert_eq!(buffer.abandon(), 0);
    }
}
