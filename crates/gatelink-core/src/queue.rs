//! Durable offline queue for outbound actions
//!
//! Actions that cannot be confirmed immediately are parked here. The queue
//! lives in the persistent store, so items survive reconnects and process
//! restarts. Removal policy: an item leaves the queue only when the
//! gateway acknowledges its idempotency key. A send that gets no response
//! stays queued and is re-sent on the next flush, where the key lets the
//! remote side deduplicate. Delivery is at-least-once.

use serde::{Deserialize, Serialize};

use crate::errors::Result;
use crate::storage::{load_json, save_json, StateStore, KEY_OFFLINE_QUEUE};
use crate::types::{IdempotencyKey, Timestamp};

// ----------------------------------------------------------------------------
// Queue Item
// ----------------------------------------------------------------------------

/// One not-yet-acknowledged outbound action
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueItem {
    /// Logical task this action refers to, when it targets one
    pub task_id: Option<u32>,
    /// Message text to deliver
    pub text: String,
    /// Deduplication token; fixed at enqueue time and reused on every
    /// re-send of this item
    pub idempotency_key: IdempotencyKey,
    /// When the item entered the queue
    pub queued_at: Timestamp,
}

impl QueueItem {
    /// Create an item with a fresh idempotency key
    pub fn new(text: impl Into<String>, task_id: Option<u32>, now: Timestamp) -> Self {
        Self {
            task_id,
            text: text.into(),
            idempotency_key: IdempotencyKey::fresh(),
            queued_at: now,
        }
    }
}

// ----------------------------------------------------------------------------
// Offline Queue
// ----------------------------------------------------------------------------

/// FIFO of unacknowledged outbound actions, mirrored to durable storage
///
/// Every mutation persists before returning, so the in-memory view never
/// gets ahead of what a restart would recover.
#[derive(Debug, Default)]
pub struct OfflineQueue {
    items: Vec<QueueItem>,
}

impl OfflineQueue {
    /// Load the persisted queue; absent record means empty
    pub fn load(store: &dyn StateStore) -> Result<Self> {
        let items = load_json(store, KEY_OFFLINE_QUEUE)?.unwrap_or_default();
        Ok(Self { items })
    }

    /// Append an item and persist
    pub fn enqueue(&mut self, store: &mut dyn StateStore, item: QueueItem) -> Result<()> {
        self.items.push(item);
        self.persist(store)
    }

    /// Remove the item with this idempotency key and persist
    ///
    /// Returns whether an item was actually removed; acknowledging an
    /// unknown key (e.g. a duplicate ack) is not an error.
    pub fn acknowledge(&mut self, store: &mut dyn StateStore, key: &IdempotencyKey) -> Result<bool> {
        let before = self.items.len();
        self.items.retain(|item| &item.idempotency_key != key);
        if self.items.len() == before {
            return Ok(false);
        }
        self.persist(store)?;
        Ok(true)
    }

    /// Drop everything, in memory and in the store
    pub fn clear(&mut self, store: &mut dyn StateStore) -> Result<()> {
        self.items.clear();
        self.persist(store)
    }

    /// Queued items in FIFO order
    pub fn items(&self) -> &[QueueItem] {
        &self.items
    }

    /// Owned copy for a flush pass, so sends can run while later acks
    /// mutate the queue
    pub fn snapshot(&self) -> Vec<QueueItem> {
        self.items.clone()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    fn persist(&self, store: &mut dyn StateStore) -> Result<()> {
        save_json(store, KEY_OFFLINE_QUEUE, &self.items)
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;

    fn item(text: &str, key: &str) -> QueueItem {
        QueueItem {
            task_id: None,
            text: text.to_string(),
            idempotency_key: IdempotencyKey::from(key),
            queued_at: Timestamp::new(1000),
        }
    }

    #[test]
    fn test_enqueue_persists_immediately() {
        let mut store = MemoryStore::new();
        let mut queue = OfflineQueue::load(&store).unwrap();
        assert!(queue.is_empty());

        queue.enqueue(&mut store, item("hello", "k1")).unwrap();

        // A fresh load over the same store sees the item
        let reloaded = OfflineQueue::load(&store).unwrap();
        assert_eq!(reloaded.len(), 1);
        assert_eq!(reloaded.items()[0].text, "hello");
    }

    #[test]
    fn test_queue_survives_restart() {
        let dir = tempfile::tempdir().unwrap();

        {
            let mut store = crate::storage::FileStore::open(dir.path()).unwrap();
            let mut queue = OfflineQueue::load(&store).unwrap();
            queue.enqueue(&mut store, item("offline message", "k1")).unwrap();
        }

        // Simulated process restart: new store handle, new queue
        let store = crate::storage::FileStore::open(dir.path()).unwrap();
        let queue = OfflineQueue::load(&store).unwrap();
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.items()[0].idempotency_key.as_str(), "k1");
    }

    #[test]
    fn test_acknowledge_removes_only_matching_key() {
        let mut store = MemoryStore::new();
        let mut queue = OfflineQueue::load(&store).unwrap();
        queue.enqueue(&mut store, item("a", "k1")).unwrap();
        queue.enqueue(&mut store, item("b", "k2")).unwrap();

        assert!(queue.acknowledge(&mut store, &IdempotencyKey::from("k1")).unwrap());
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.items()[0].text, "b");

        // Duplicate ack is a no-op, not an error
        assert!(!queue.acknowledge(&mut store, &IdempotencyKey::from("k1")).unwrap());

        // Removal persisted
        let reloaded = OfflineQueue::load(&store).unwrap();
        assert_eq!(reloaded.len(), 1);
    }

    #[test]
    fn test_fifo_order_preserved() {
        let mut store = MemoryStore::new();
        let mut queue = OfflineQueue::load(&store).unwrap();
        for (text, key) in [("one", "k1"), ("two", "k2"), ("three", "k3")] {
            queue.enqueue(&mut store, item(text, key)).unwrap();
        }

        let texts: Vec<_> = queue.snapshot().into_iter().map(|i| i.text).collect();
        assert_eq!(texts, vec!["one", "two", "three"]);
    }

    #[test]
    fn test_clear_empties_store() {
        let mut store = MemoryStore::new();
        let mut queue = OfflineQueue::load(&store).unwrap();
        queue.enqueue(&mut store, item("a", "k1")).unwrap();
        queue.clear(&mut store).unwrap();

        assert!(OfflineQueue::load(&store).unwrap().is_empty());
    }

    #[test]
    fn test_new_items_get_fresh_keys() {
        let a = QueueItem::new("x", None, Timestamp::new(0));
        let b = QueueItem::new("x", None, Timestamp::new(0));
        assert_ne!(a.idempotency_key, b.idempotency_key);
    }
}
