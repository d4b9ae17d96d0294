//! In-process store with combined TTL + LRU eviction.

use async_trait::async_trait;
use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use super::Store;
use crate::Result;

struct Entry {
    data: Vec<u8>,
    deadline: Instant,
}

impl Entry {
    fn new(data: Vec<u8>, ttl: Duration) -> Self {
        Self {
            data,
            deadline: Instant::now() + ttl,
        }
    }

    fn is_expired(&self) -> bool {
        Instant::now() >= self.deadline
    }
}

/// Bounded in-memory backend.
///
/// Expiry is lazy: entries are only checked on read, never swept. Capacity
/// pressure evicts the least-recently-used entry. A single mutex guards the
/// map and the access order together; nothing does I/O while holding it.
pub struct MemoryStore {
    entries: Mutex<LruCache<String, Entry>>,
}

impl MemoryStore {
    pub fn new(capacity: NonZeroUsize) -> Self {
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Current number of entries, expired ones included (they leave on read).
    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let mut entries = self.entries.lock().unwrap();
        let expired = match entries.peek(key) {
            Some(entry) => entry.is_expired(),
            None => return Ok(None),
        };
        if expired {
            entries.pop(key);
            return Ok(None);
        }
        // Promotes the entry to most-recently-used.
        Ok(entries.get(key).map(|e| e.data.clone()))
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> Result<()> {
        let mut entries = self.entries.lock().unwrap();
        if ttl.is_zero() {
            // Already expired on arrival; a full replace with nothing.
            entries.pop(key);
            return Ok(());
        }
        entries.put(key.to_string(), Entry::new(value.to_vec(), ttl));
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        Ok(self.entries.lock().unwrap().pop(key).is_some())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let mut entries = self.entries.lock().unwrap();
        match entries.peek(key) {
            Some(entry) if entry.is_expired() => {
                entries.pop(key);
                Ok(false)
            }
            Some(_) => Ok(true),
            None => Ok(false),
        }
    }

    async fn incr(&self, key: &str, ttl: Duration) -> Result<Option<u64>> {
        let mut entries = self.entries.lock().unwrap();
        let current = match entries.peek(key) {
            Some(entry) if !entry.is_expired() => {
                std::str::from_utf8(&entry.data)
                    .ok()
                    .and_then(|s| s.parse::<u64>().ok())
            }
            _ => None,
        };
        match current {
            Some(count) => {
                let next = count.saturating_add(1);
                // Keep the original deadline: increments never extend a window.
                if let Some(entry) = entries.get_mut(key) {
                    entry.data = next.to_string().into_bytes();
                }
                Ok(Some(next))
            }
            None => {
                if ttl.is_zero() {
                    entries.pop(key);
                    return Ok(Some(1));
                }
                entries.put(key.to_string(), Entry::new(b"1".to_vec(), ttl));
                Ok(Some(1))
            }
        }
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store(capacity: usize) -> MemoryStore {
        MemoryStore::new(NonZeroUsize::new(capacity).unwrap())
    }

    #[tokio::test]
    async fn test_set_get_roundtrip() {
        let s = store(8);
        s.set("a", b"payload", Duration::from_secs(60)).await.unwrap();
        assert_eq!(s.get("a").await.unwrap(), Some(b"payload".to_vec()));
        assert!(s.exists("a").await.unwrap());
    }

    #[tokio::test]
    async fn test_write_fully_replaces() {
        let s = store(8);
        s.set("a", b"old", Duration::from_secs(60)).await.unwrap();
        s.set("a", b"new", Duration::from_secs(60)).await.unwrap();
        assert_eq!(s.get("a").await.unwrap(), Some(b"new".to_vec()));
    }

    #[tokio::test]
    async fn test_ttl_expiry_on_read() {
        let s = store(8);
        s.set("a", b"v", Duration::from_millis(20)).await.unwrap();
        assert!(s.get("a").await.unwrap().is_some());
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(s.get("a").await.unwrap().is_none());
        assert!(!s.exists("a").await.unwrap());
    }

    #[tokio::test]
    async fn test_zero_ttl_is_immediately_expired() {
        let s = store(8);
        s.set("a", b"live", Duration::from_secs(60)).await.unwrap();
        s.set("a", b"dead", Duration::ZERO).await.unwrap();
        assert!(s.get("a").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_lru_evicts_least_recently_used() {
        let s = store(3);
        let ttl = Duration::from_secs(60);
        s.set("a", b"1", ttl).await.unwrap();
        s.set("b", b"2", ttl).await.unwrap();
        s.set("c", b"3", ttl).await.unwrap();
        // Touch "a" so "b" becomes the eviction victim.
        s.get("a").await.unwrap();
        s.set("d", b"4", ttl).await.unwrap();

        assert!(s.get("a").await.unwrap().is_some());
        assert!(s.get("b").await.unwrap().is_none());
        assert!(s.get("c").await.unwrap().is_some());
        assert!(s.get("d").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_incr_is_exact_and_keeps_window() {
        let s = store(8);
        let ttl = Duration::from_millis(50);
        assert_eq!(s.incr("c", ttl).await.unwrap(), Some(1));
        assert_eq!(s.incr("c", ttl).await.unwrap(), Some(2));
        assert_eq!(s.incr("c", ttl).await.unwrap(), Some(3));
        // After the original window passes the counter restarts,
        // even though later increments supplied a fresh TTL.
        tokio::time::sleep(Duration::from_millis(70)).await;
        assert_eq!(s.incr("c", ttl).await.unwrap(), Some(1));
    }

    #[tokio::test]
    async fn test_concurrent_incr_under_mutex() {
        use std::sync::Arc;
        let s = Arc::new(store(8));
        let mut handles = Vec::new();
        for _ in 0..10 {
            let s = Arc::clone(&s);
            handles.push(tokio::spawn(async move {
                for _ in 0..20 {
                    s.incr("hot", Duration::from_secs(60)).await.unwrap();
                }
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(
            s.incr("hot", Duration::from_secs(60)).await.unwrap(),
            Some(201)
        );
    }
}
