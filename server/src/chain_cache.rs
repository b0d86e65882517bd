use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use lru::LruCache;
use serde::Serialize;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::debug;

use crate::chain::Chain;

struct CacheEntry {
    chain: Arc<Chain>,
    inserted_at: Instant,
}

#[derive(Serialize, Default, Clone, Debug, PartialEq)]
pub struct CacheMetrics {
    pub entries: usize,
    pub capacity: usize,
    pub hits: u64,
    pub misses: u64,
    pub rebuilds: u64,
    pub evictions: u64,
    pub expirations: u64,
}

/// Agent id to prepared chain, bounded by LRU capacity and an optional TTL.
///
/// Alongside the map sits a registry of per-agent async locks. Preparation and
/// rebuild hold the agent's lock for their whole run, so one agent is never
/// built twice at once while different agents build in parallel.
pub struct ChainCache {
    entries: AsyncMutex<LruCache<String, CacheEntry>>,
    locks: StdMutex<HashMap<String, Arc<AsyncMutex<()>>>>,
    capacity: usize,
    ttl: Option<Duration>,
    hits: AtomicU64,
    misses: AtomicU64,
    rebuilds: AtomicU64,
    evictions: AtomicU64,
    expirations: AtomicU64,
}

impl ChainCache {
    pub fn new(capacity: NonZeroUsize, ttl: Option<Duration>) -> Self {
        Self {
            entries: AsyncMutex::new(LruCache::new(capacity)),
            locks: StdMutex::new(HashMap::new()),
            capacity: capacity.get(),
            ttl,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            rebuilds: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            expirations: AtomicU64::new(0),
        }
    }

    fn expired(&self, entry: &CacheEntry, now: Instant) -> bool {
        matches!(self.ttl, Some(ttl) if now.duration_since(entry.inserted_at) >= ttl)
    }

    /// Inserts or overwrites; may evict the least recently used entry.
    pub async fn put(&self, agent_id: &str, chain: Arc<Chain>) {
        let mut entries = self.entries.lock().await;
        let evicted = entries.push(agent_id.to_string(), CacheEntry { chain, inserted_at: Instant::now() });
        if let Some((key, _)) = evicted {
            if key != agent_id {
                self.evictions.fetch_add(1, Ordering::Relaxed);
                debug!(evicted = %key, "chain cache at capacity");
            }
        }
    }

    /// Cached chain for the agent; expired entries count as absent.
    pub async fn get(&self, agent_id: &str) -> Option<Arc<Chain>> {
        let mut entries = self.entries.lock().await;
        let now = Instant::now();
        let expired = match entries.get(agent_id) {
            Some(entry) if !self.expired(entry, now) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                return Some(entry.chain.clone());
            }
            Some(_) => true,
            None => false,
        };
        if expired {
            entries.pop(agent_id);
            self.expirations.fetch_add(1, Ordering::Relaxed);
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    pub async fn remove(&self, agent_id: &str) -> bool {
        self.entries.lock().await.pop(agent_id).is_some()
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    /// Exclusive build guard for one agent.
    pub async fn lock_agent(&self, agent_id: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(|p| p.into_inner());
            locks.entry(agent_id.to_string()).or_default().clone()
        };
        lock.lock_owned().await
    }

    pub fn record_rebuild(&self) {
        self.rebuilds.fetch_add(1, Ordering::Relaxed);
    }

    /// Drops expired entries and agent locks nobody holds or waits on.
    /// Returns the number of entries removed.
    pub async fn prune(&self) -> usize {
        let removed = {
            let mut entries = self.entries.lock().await;
            let now = Instant::now();
            let stale: Vec<String> = entries
                .iter()
                .filter(|(_, e)| self.expired(e, now))
                .map(|(k, _)| k.clone())
                .collect();
            for key in &stale {
                entries.pop(key);
            }
            stale.len()
        };
        self.expirations.fetch_add(removed as u64, Ordering::Relaxed);
        let mut locks = self.locks.lock().unwrap_or_else(|p| p.into_inner());
        locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        removed
    }

    pub fn lock_count(&self) -> usize {
        self.locks.lock().map(|l| l.len()).unwrap_or(0)
    }

    pub async fn metrics(&self) -> CacheMetrics {
        CacheMetrics {
            entries: self.len().await,
            capacity: self.capacity,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            rebuilds: self.rebuilds.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            expirations: self.expirations.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::ChainSettings;
    use crate::memory::ConversationMemory;
    use crate::retry::RetryPolicy;
    use crate::test_support::EchoModel;

    fn chain(agent_id: &str) -> Arc<Chain> {
        Arc::new(Chain::new(
            agent_id,
            "",
            "fp".into(),
            None,
            ConversationMemory::new(0),
            Arc::new(EchoModel::default()),
            RetryPolicy::default(),
            ChainSettings::default(),
        ))
    }

    fn cache(capacity: usize, ttl: Option<Duration>) -> ChainCache {
        ChainCache::new(NonZeroUsize::new(capacity).unwrap(), ttl)
    }

    #[tokio::test]
    async fn put_then_get_returns_the_same_handle() {
        let c = cache(4, None);
        let a = chain("a");
        c.put("a", a.clone()).await;
        assert!(Arc::ptr_eq(&a, &c.get("a").await.unwrap()));
        assert!(c.get("unknown").await.is_none());

        let replacement = chain("a");
        c.put("a", replacement.clone()).await;
        assert!(Arc::ptr_eq(&replacement, &c.get("a").await.unwrap()));
        let m = c.metrics().await;
        assert_eq!((m.hits, m.misses, m.evictions, m.entries), (2, 1, 0, 1));
    }

    #[tokio::test]
    async fn least_recently_used_entry_is_evicted_at_capacity() {
        let c = cache(2, None);
        c.put("a", chain("a")).await;
        c.put("b", chain("b")).await;
        assert!(c.get("a").await.is_some());
        c.put("c", chain("c")).await;
        assert!(c.get("b").await.is_none());
        assert!(c.get("a").await.is_some());
        assert!(c.get("c").await.is_some());
        assert_eq!(c.metrics().await.evictions, 1);
    }

    #[tokio::test]
    async fn expired_entries_are_absent_and_pruned() {
        let c = cache(4, Some(Duration::from_millis(30)));
        c.put("a", chain("a")).await;
        c.put("b", chain("b")).await;
        assert!(c.get("a").await.is_some());
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(c.get("a").await.is_none());
        assert_eq!(c.prune().await, 1, "only b was still stored");
        assert_eq!(c.len().await, 0);
    }

    #[tokio::test]
    async fn remove_invalidates() {
        let c = cache(4, None);
        c.put("a", chain("a")).await;
        assert!(c.remove("a").await);
        assert!(!c.remove("a").await);
        assert!(c.get("a").await.is_none());
    }

    #[tokio::test]
    async fn agent_locks_are_exclusive_per_agent_and_pruned_when_idle() {
        let c = Arc::new(cache(4, None));
        let guard = c.lock_agent("a").await;
        let other = tokio::time::timeout(Duration::from_millis(50), c.lock_agent("b")).await;
        assert!(other.is_ok(), "different agents do not contend");
        drop(other);

        let c2 = c.clone();
        let waiter = tokio::spawn(async move {
            let _g = c2.lock_agent("a").await;
        });
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(!waiter.is_finished(), "same agent waits for the holder");
        drop(guard);
        waiter.await.unwrap();

        assert_eq!(c.lock_count(), 2);
        c.prune().await;
        assert_eq!(c.lock_count(), 0);
    }
}
