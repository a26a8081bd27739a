//! In-memory store implementation

use crate::error::Result;
use crate::store::Store;
use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::VecDeque;
use std::time::{Duration, Instant};
use tokio::sync::Notify;

/// A queued value with its optional expiry
#[derive(Debug, Clone)]
struct Entry<V> {
    value: V,
    expires_at: Option<Instant>,
}

impl<V> Entry<V> {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|at| at > now)
    }
}

/// In-process store holding live values
///
/// Used for the coordinator's input queue, where contexts carry transient
/// objects that never cross a durability boundary, and in tests.
pub struct MemoryStore<V> {
    entries: DashMap<String, VecDeque<Entry<V>>>,
    changes: Notify,
}

impl<V> MemoryStore<V> {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
            changes: Notify::new(),
        }
    }

    /// Number of live values under `key`
    pub fn len(&self, key: &str) -> usize {
        let now = Instant::now();
        self.entries
            .get(key)
            .map(|queue| queue.iter().filter(|e| e.is_live(now)).count())
            .unwrap_or(0)
    }

    /// Whether `key` holds no live value
    pub fn is_empty(&self, key: &str) -> bool {
        self.len(key) == 0
    }
}

impl<V> Default for MemoryStore<V> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<V> Store<V> for MemoryStore<V>
where
    V: Clone + Send + Sync + 'static,
{
    fn push_with_ttl(&self, key: &str, value: V, ttl: Option<Duration>) -> Result<()> {
        let entry = Entry {
            value,
            expires_at: ttl.map(|ttl| Instant::now() + ttl),
        };
        self.entries
            .entry(key.to_string())
            .or_default()
            .push_back(entry);
        self.changes.notify_waiters();
        Ok(())
    }

    fn put(&self, key: &str, value: V) -> Result<()> {
        let mut queue = VecDeque::with_capacity(1);
        queue.push_back(Entry {
            value,
            expires_at: None,
        });
        self.entries.insert(key.to_string(), queue);
        self.changes.notify_waiters();
        Ok(())
    }

    fn take_if_present(&self, key: &str) -> Result<Option<V>> {
        let now = Instant::now();
        let Some(mut queue) = self.entries.get_mut(key) else {
            return Ok(None);
        };

        while let Some(entry) = queue.pop_front() {
            if entry.is_live(now) {
                return Ok(Some(entry.value));
            }
        }
        drop(queue);

        // Empty queues are dropped so the map does not grow with purged ids
        self.entries.remove_if(key, |_, queue| queue.is_empty());
        Ok(None)
    }

    fn read_if_present(&self, key: &str) -> Result<Option<V>> {
        let now = Instant::now();
        Ok(self.entries.get(key).and_then(|queue| {
            queue
                .iter()
                .find(|e| e.is_live(now))
                .map(|e| e.value.clone())
        }))
    }

    fn read_all(&self, key: &str) -> Result<Vec<V>> {
        let now = Instant::now();
        Ok(self
            .entries
            .get(key)
            .map(|queue| {
                queue
                    .iter()
                    .filter(|e| e.is_live(now))
                    .map(|e| e.value.clone())
                    .collect()
            })
            .unwrap_or_default())
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.entries.remove(key);
        self.changes.notify_waiters();
        Ok(())
    }

    fn changes(&self) -> &Notify {
        &self.changes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_queue_order() {
        let store = MemoryStore::new();
        store.push("q", 1).unwrap();
        store.push("q", 2).unwrap();
        store.push("q", 3).unwrap();

        assert_eq!(store.read_if_present("q").unwrap(), Some(1));
        assert_eq!(store.read_all("q").unwrap(), vec![1, 2, 3]);
        assert_eq!(store.take_if_present("q").unwrap(), Some(1));
        assert_eq!(store.take_if_present("q").unwrap(), Some(2));
        assert_eq!(store.take_if_present("q").unwrap(), Some(3));
        assert_eq!(store.take_if_present("q").unwrap(), None);
    }

    #[test]
    fn test_put_replaces_queue() {
        let store = MemoryStore::new();
        store.push("k", "a").unwrap();
        store.push("k", "b").unwrap();
        store.put("k", "c").unwrap();

        assert_eq!(store.read_all("k").unwrap(), vec!["c"]);
    }

    #[test]
    fn test_remove() {
        let store = MemoryStore::new();
        store.push("k", 1).unwrap();
        store.remove("k").unwrap();

        assert!(store.is_empty("k"));
        assert_eq!(store.read_if_present("k").unwrap(), None);
    }

    #[test]
    fn test_expired_values_are_invisible() {
        let store = MemoryStore::new();
        store
            .push_with_ttl("k", "short", Some(Duration::from_millis(10)))
            .unwrap();
        store.push("k", "long").unwrap();

        std::thread::sleep(Duration::from_millis(30));

        assert_eq!(store.len("k"), 1);
        assert_eq!(store.read_if_present("k").unwrap(), Some("long"));
        assert_eq!(store.take_if_present("k").unwrap(), Some("long"));
    }

    #[tokio::test]
    async fn test_take_times_out() {
        let store: MemoryStore<u64> = MemoryStore::new();
        let started = std::time::Instant::now();

        let value = store
            .take("missing", Some(Duration::from_millis(50)))
            .await
            .unwrap();

        assert_eq!(value, None);
        assert!(started.elapsed() >= Duration::from_millis(50));
    }

    #[tokio::test]
    async fn test_take_wakes_on_push() {
        let store = Arc::new(MemoryStore::new());

        let waiter = tokio::spawn({
            let store = store.clone();
            async move { store.take("q", Some(Duration::from_secs(5))).await }
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        store.push("q", 42u64).unwrap();

        let value = waiter.await.unwrap().unwrap();
        assert_eq!(value, Some(42));
        assert!(store.is_empty("q"));
    }

    #[tokio::test]
    async fn test_read_does_not_consume() {
        let store = Arc::new(MemoryStore::new());

        let reader = tokio::spawn({
            let store = store.clone();
            async move { store.read("q", None).await }
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        store.push("q", "value".to_string()).unwrap();

        let value = reader.await.unwrap().unwrap();
        assert_eq!(value.as_deref(), Some("value"));
        assert_eq!(store.len("q"), 1);
    }
}
