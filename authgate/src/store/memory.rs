use super::KeyValueStore;
use crate::error::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;

#[derive(Debug, Clone)]
struct Entry {
    value: Vec<u8>,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| now >= at)
    }
}

type Entries = Mutex<HashMap<String, Entry>>;

/// Process-local store. Contents are lost on restart.
pub struct MemoryStore {
    entries: Arc<Entries>,
    sweeper: Option<JoinHandle<()>>,
}

impl MemoryStore {
    /// A store without a background sweep. Expired entries stay invisible
    /// and are dropped when overwritten or swept manually.
    pub fn new() -> Self {
        Self {
            entries: Arc::new(Mutex::new(HashMap::new())),
            sweeper: None,
        }
    }

    /// A store that purges expired entries every `interval`. Must be called
    /// from within a tokio runtime. The sweep stops when the store is dropped.
    pub fn with_cleanup(interval: Duration) -> Self {
        let entries = Arc::new(Mutex::new(HashMap::new()));
        let weak = Arc::downgrade(&entries);
        let sweeper = tokio::spawn(sweep_loop(weak, interval));
        Self {
            entries,
            sweeper: Some(sweeper),
        }
    }

    /// Remove expired entries now. Returns how many were removed.
    pub fn sweep(&self) -> usize {
        purge(&self.entries)
    }

    /// Number of entries held, including expired ones not yet swept.
    pub fn len(&self) -> usize {
        lock(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for MemoryStore {
    fn drop(&mut self) {
        if let Some(sweeper) = self.sweeper.take() {
            sweeper.abort();
        }
    }
}

// A panic while holding the lock cannot leave an entry half-written.
fn lock(entries: &Entries) -> MutexGuard<'_, HashMap<String, Entry>> {
    entries.lock().unwrap_or_else(|e| e.into_inner())
}

fn purge(entries: &Entries) -> usize {
    let now = Instant::now();
    let mut map = lock(entries);
    let before = map.len();
    map.retain(|_, entry| !entry.is_expired(now));
    before - map.len()
}

async fn sweep_loop(entries: Weak<Entries>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        let Some(entries) = entries.upgrade() else {
            break;
        };
        let removed = purge(&entries);
        if removed > 0 {
            tracing::debug!(removed, "swept expired memory entries");
        }
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let now = Instant::now();
        let map = lock(&self.entries);
        Ok(map
            .get(key)
            .filter(|entry| !entry.is_expired(now))
            .map(|entry| entry.value.clone()))
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> Result<()> {
        let expires_at = (!ttl.is_zero()).then(|| Instant::now() + ttl);
        lock(&self.entries).insert(
            key.to_string(),
            Entry {
                value: value.to_vec(),
                expires_at,
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        lock(&self.entries).remove(key);
        Ok(())
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&[u8]>,
        value: &[u8],
        ttl: Duration,
    ) -> Result<bool> {
        let now = Instant::now();
        let mut map = lock(&self.entries);
        let current = map
            .get(key)
            .filter(|entry| !entry.is_expired(now))
            .map(|entry| entry.value.as_slice());
        if current != expected {
            return Ok(false);
        }
        map.insert(
            key.to_string(),
            Entry {
                value: value.to_vec(),
                expires_at: (!ttl.is_zero()).then(|| now + ttl),
            },
        );
        Ok(true)
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let now = Instant::now();
        let map = lock(&self.entries);
        Ok(map
            .iter()
            .filter(|(key, entry)| key.starts_with(prefix) && !entry.is_expired(now))
            .map(|(key, _)| key.clone())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn set_get_delete() {
        let store = MemoryStore::new();
        store.set("a", b"1", Duration::ZERO).await.unwrap();
        assert_eq!(store.get("a").await.unwrap(), Some(b"1".to_vec()));
        assert!(store.exists("a").await.unwrap());

        store.delete("a").await.unwrap();
        assert_eq!(store.get("a").await.unwrap(), None);
        // idempotent
        store.delete("a").await.unwrap();
    }

    #[tokio::test]
    async fn overwrite_replaces_value() {
        let store = MemoryStore::new();
        store.set("a", b"1", Duration::ZERO).await.unwrap();
        store.set("a", b"2", Duration::ZERO).await.unwrap();
        assert_eq!(store.get("a").await.unwrap(), Some(b"2".to_vec()));
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn swap_only_from_expected_value() {
        let store = MemoryStore::new();
        assert!(store.compare_and_swap("a", None, b"1", Duration::ZERO).await.unwrap());
        assert!(!store.compare_and_swap("a", None, b"2", Duration::ZERO).await.unwrap());
        assert!(!store.compare_and_swap("a", Some(b"2"), b"3", Duration::ZERO).await.unwrap());
        assert!(store.compare_and_swap("a", Some(b"1"), b"3", Duration::ZERO).await.unwrap());
        assert_eq!(store.get("a").await.unwrap(), Some(b"3".to_vec()));
        assert!(!store.compare_and_swap("missing", Some(b"1"), b"x", Duration::ZERO).await.unwrap());
    }

    #[tokio::test]
    async fn expired_entry_counts_as_absent_for_swap() {
        let store = MemoryStore::new();
        store.set("a", b"old", Duration::from_millis(10)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(!store.compare_and_swap("a", Some(b"old"), b"x", Duration::ZERO).await.unwrap());
        assert!(store.compare_and_swap("a", None, b"new", Duration::ZERO).await.unwrap());
        assert_eq!(store.get("a").await.unwrap(), Some(b"new".to_vec()));
    }

    #[tokio::test]
    async fn expired_keys_are_invisible_before_sweep() {
        let store = MemoryStore::new();
        store.set("short", b"x", Duration::from_millis(20)).await.unwrap();
        store.set("long", b"y", Duration::ZERO).await.unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;

        assert_eq!(store.get("short").await.unwrap(), None);
        assert!(!store.exists("short").await.unwrap());
        assert_eq!(store.list("").await.unwrap(), vec!["long".to_string()]);
        assert_eq!(store.count("").await.unwrap(), 1);
        // still held until swept
        assert_eq!(store.len(), 2);
        assert_eq!(store.sweep(), 1);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn background_sweep_purges() {
        let store = MemoryStore::with_cleanup(Duration::from_millis(20));
        store.set("k", b"v", Duration::from_millis(10)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn list_filters_by_prefix() {
        let store = MemoryStore::new();
        store.set("rl:a@b.com", b"[]", Duration::ZERO).await.unwrap();
        store.set("rl:c@d.com", b"[]", Duration::ZERO).await.unwrap();
        store.set("sess:1", b"{}", Duration::ZERO).await.unwrap();

        let mut keys = store.list("rl:").await.unwrap();
        keys.sort();
        assert_eq!(keys, vec!["rl:a@b.com", "rl:c@d.com"]);
    }
}
