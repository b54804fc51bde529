//! In-memory counter store.

use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, trace};

use super::{Counter, CounterStore, StoreResult};

const BACKEND: &str = "memory";

#[derive(Debug, Clone, Copy)]
struct Entry {
    points: u64,
    expires_at: Instant,
}

impl Entry {
    fn fresh(now: Instant, ttl: Duration) -> Self {
        Self {
            points: 0,
            expires_at: now + ttl,
        }
    }

    fn is_live(&self, now: Instant) -> bool {
        self.expires_at > now
    }

    fn snapshot(&self, now: Instant) -> Counter {
        Counter {
            points: self.points,
            ttl: self.expires_at.saturating_duration_since(now),
        }
    }
}

/// A counter store local to this process.
///
/// Updates to one key are serialized by the map's shard lock, so concurrent
/// consumes never lose increments. Counters are not shared with other
/// processes; use [`super::RedisCounterStore`] for multi-instance deployments.
#[derive(Debug, Default)]
pub struct MemoryCounterStore {
    counters: DashMap<String, Entry>,
}

impl MemoryCounterStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop every expired counter.
    pub fn purge_expired(&self) {
        let now = Instant::now();
        self.counters.retain(|_, entry| entry.is_live(now));
    }

    /// Purge expired counters every `every` until the store is dropped.
    pub fn spawn_purge(self: &Arc<Self>, every: Duration) -> JoinHandle<()> {
        let store: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(store) = store.upgrade() else {
                    break;
                };
                let before = store.len();
                store.purge_expired();
                trace!(purged = before.saturating_sub(store.len()), "Purged expired counters");
            }
            debug!("Memory counter store dropped, purge task stopped");
        })
    }

    /// Number of counters held, including expired ones not yet purged.
    pub fn len(&self) -> usize {
        self.counters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counters.is_empty()
    }
}

#[async_trait]
impl CounterStore for MemoryCounterStore {
    async fn consume(&self, key: &str, points: u64, ttl: Duration) -> StoreResult<Counter> {
        let now = Instant::now();
        let mut entry = self
            .counters
            .entry(key.to_string())
            .or_insert_with(|| Entry::fresh(now, ttl));

        if !entry.is_live(now) {
            *entry = Entry::fresh(now, ttl);
        }
        entry.points = entry.points.saturating_add(points);

        let counter = entry.snapshot(now);
        trace!(key = %key, points = counter.points, ttl_ms = counter.ttl.as_millis() as u64, "Consumed");
        Ok(counter)
    }

    async fn get(&self, key: &str) -> StoreResult<Option<Counter>> {
        let now = Instant::now();
        match self.counters.get(key) {
            Some(entry) if entry.is_live(now) => return Ok(Some(entry.snapshot(now))),
            Some(_) => {}
            None => return Ok(None),
        }

        self.counters.remove_if(key, |_, entry| !entry.is_live(now));
        Ok(None)
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        self.counters.remove(key);
        Ok(())
    }

    async fn block(&self, key: &str, ttl: Duration) -> StoreResult<Option<Counter>> {
        let now = Instant::now();
        let Some(mut entry) = self.counters.get_mut(key) else {
            return Ok(None);
        };
        if !entry.is_live(now) {
            return Ok(None);
        }
        entry.expires_at = now + ttl;
        Ok(Some(entry.snapshot(now)))
    }

    fn backend_name(&self) -> &'static str {
        BACKEND
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WINDOW: Duration = Duration::from_secs(60);

    #[tokio::test]
    async fn test_consume_creates_counter() {
        let store = MemoryCounterStore::new();

        let counter = store.consume("k", 1, WINDOW).await.unwrap();
        assert_eq!(counter.points, 1);
        assert!(counter.ttl <= WINDOW);
        assert!(counter.ttl > Duration::ZERO);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_consume_accumulates_and_keeps_expiry() {
        let store = MemoryCounterStore::new();

        store.consume("k", 2, WINDOW).await.unwrap();
        let counter = store.consume("k", 3, Duration::from_secs(3600)).await.unwrap();

        assert_eq!(counter.points, 5);
        assert!(counter.ttl <= WINDOW);
    }

    #[tokio::test]
    async fn test_get_missing_key() {
        let store = MemoryCounterStore::new();
        assert_eq!(store.get("missing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let store = MemoryCounterStore::new();
        store.consume("k", 1, WINDOW).await.unwrap();

        store.delete("k").await.unwrap();
        store.delete("k").await.unwrap();

        assert_eq!(store.get("k").await.unwrap(), None);
        assert!(store.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_counter_expires() {
        let store = MemoryCounterStore::new();
        store.consume("k", 4, WINDOW).await.unwrap();

        tokio::time::advance(WINDOW + Duration::from_millis(1)).await;

        assert_eq!(store.get("k").await.unwrap(), None);
        let counter = store.consume("k", 1, WINDOW).await.unwrap();
        assert_eq!(counter.points, 1);
        assert_eq!(counter.ttl, WINDOW);
    }

    #[tokio::test(start_paused = true)]
    async fn test_block_replaces_expiry() {
        let store = MemoryCounterStore::new();
        store.consume("k", 3, WINDOW).await.unwrap();

        let blocked = store
            .block("k", Duration::from_secs(3600))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(blocked.points, 3);
        assert_eq!(blocked.ttl, Duration::from_secs(3600));

        tokio::time::advance(WINDOW * 2).await;
        assert_eq!(store.get("k").await.unwrap().unwrap().points, 3);
    }

    #[tokio::test]
    async fn test_block_missing_key() {
        let store = MemoryCounterStore::new();
        assert_eq!(store.block("k", WINDOW).await.unwrap(), None);
        assert!(store.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_purge_expired() {
        let store = MemoryCounterStore::new();
        store.consume("short", 1, Duration::from_secs(1)).await.unwrap();
        store.consume("long", 1, WINDOW).await.unwrap();

        tokio::time::advance(Duration::from_secs(2)).await;
        store.purge_expired();

        assert_eq!(store.len(), 1);
        assert!(store.get("long").await.unwrap().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_spawned_purge_drops_expired_counters() {
        let store = Arc::new(MemoryCounterStore::new());
        let purge = store.spawn_purge(Duration::from_secs(5));
        store.consume("short", 1, Duration::from_secs(1)).await.unwrap();
        store.consume("long", 1, WINDOW).await.unwrap();

        tokio::time::sleep(Duration::from_secs(6)).await;

        assert_eq!(store.len(), 1);
        assert!(!purge.is_finished());
    }

    #[tokio::test(start_paused = true)]
    async fn test_purge_task_stops_with_store() {
        let store = Arc::new(MemoryCounterStore::new());
        let purge = store.spawn_purge(Duration::from_secs(5));

        drop(store);
        tokio::time::timeout(Duration::from_secs(30), purge)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_consumes_lose_no_updates() {
        let store = Arc::new(MemoryCounterStore::new());
        let callers = 50;
        let per_caller = 20;

        let handles: Vec<_> = (0..callers)
            .map(|_| {
                let store = store.clone();
                tokio::spawn(async move {
                    for _ in 0..per_caller {
                        store.consume("shared", 1, WINDOW).await.unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap();
        }

        let counter = store.get("shared").await.unwrap().unwrap();
        assert_eq!(counter.points, (callers * per_caller) as u64);
    }
}
