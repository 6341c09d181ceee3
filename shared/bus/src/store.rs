//! TTL'd key-value session store.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use tokio::time::Instant;

use crate::StoreError;

/// Narrow surface the hub needs from its session store. TTLs are advisory:
/// an implementation may evict earlier under pressure.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn set(&self, key: &str, value: Bytes, ttl: Duration) -> Result<(), StoreError>;
    async fn get(&self, key: &str) -> Result<Option<Bytes>, StoreError>;
    async fn exists(&self, key: &str) -> Result<bool, StoreError>;
    /// Returns the number of keys removed (0 or 1).
    async fn delete(&self, key: &str) -> Result<u64, StoreError>;
    /// Refresh the TTL of an existing key. Returns false if absent.
    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StoreError>;
    /// All live keys starting with `prefix`.
    async fn scan(&self, prefix: &str) -> Result<Vec<String>, StoreError>;
}

struct Entry {
    value: Bytes,
    deadline: Instant,
}

/// In-process store: a concurrent map with lazy expiry.
#[derive(Default)]
pub struct MemorySessionStore {
    entries: DashMap<String, Entry>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn live(&self, key: &str) -> Option<Bytes> {
        let now = Instant::now();
        // The shard read guard must drop before the expired-key removal.
        let expired = match self.entries.get(key) {
            Some(e) if e.deadline > now => return Some(e.value.clone()),
            Some(_) => true,
            None => false,
        };
        if expired {
            self.entries.remove(key);
        }
        None
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn set(&self, key: &str, value: Bytes, ttl: Duration) -> Result<(), StoreError> {
        self.entries
            .insert(key.to_string(), Entry { value, deadline: Instant::now() + ttl });
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Bytes>, StoreError> {
        Ok(self.live(key))
    }

    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        Ok(self.live(key).is_some())
    }

    async fn delete(&self, key: &str) -> Result<u64, StoreError> {
        Ok(self.entries.remove(key).map(|_| 1).unwrap_or(0))
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StoreError> {
        let now = Instant::now();
        match self.entries.get_mut(key) {
            Some(mut e) if e.deadline > now => {
                e.deadline = now + ttl;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn scan(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let now = Instant::now();
        self.entries.retain(|_, e| e.deadline > now);
        Ok(self
            .entries
            .iter()
            .filter(|e| e.key().starts_with(prefix))
            .map(|e| e.key().clone())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn set_get_round_trip() {
        let store = MemorySessionStore::new();
        store.set("a", Bytes::from_static(b"1"), Duration::from_secs(10)).await.unwrap();
        assert_eq!(store.get("a").await.unwrap(), Some(Bytes::from_static(b"1")));
        assert!(store.exists("a").await.unwrap());
        assert_eq!(store.get("b").await.unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn ttl_evicts() {
        let store = MemorySessionStore::new();
        store.set("a", Bytes::from_static(b"1"), Duration::from_secs(300)).await.unwrap();

        tokio::time::advance(Duration::from_secs(299)).await;
        assert!(store.exists("a").await.unwrap());

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(!store.exists("a").await.unwrap());
        assert_eq!(store.get("a").await.unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn expire_refreshes_deadline() {
        let store = MemorySessionStore::new();
        store.set("a", Bytes::from_static(b"1"), Duration::from_secs(10)).await.unwrap();

        tokio::time::advance(Duration::from_secs(8)).await;
        assert!(store.expire("a", Duration::from_secs(10)).await.unwrap());

        tokio::time::advance(Duration::from_secs(8)).await;
        assert!(store.exists("a").await.unwrap());

        assert!(!store.expire("missing", Duration::from_secs(10)).await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn delete_reports_removed_count() {
        let store = MemorySessionStore::new();
        store.set("a", Bytes::from_static(b"1"), Duration::from_secs(10)).await.unwrap();
        assert_eq!(store.delete("a").await.unwrap(), 1);
        assert_eq!(store.delete("a").await.unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn scan_filters_by_prefix_and_liveness() {
        let store = MemorySessionStore::new();
        store.set("hbrp:repeater:1", Bytes::from_static(b"x"), Duration::from_secs(10)).await.unwrap();
        store.set("hbrp:repeater:2", Bytes::from_static(b"y"), Duration::from_secs(1)).await.unwrap();
        store.set("parrot:stream:9", Bytes::from_static(b"z"), Duration::from_secs(10)).await.unwrap();

        tokio::time::advance(Duration::from_secs(2)).await;
        let mut keys = store.scan("hbrp:repeater:").await.unwrap();
        keys.sort();
        assert_eq!(keys, vec!["hbrp:repeater:1".to_string()]);
    }
}
