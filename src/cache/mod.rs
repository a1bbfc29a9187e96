//! Article cache: URL -> `{html, crawledAt, httpStatus, etag?, lastModified?}` with a
//! two-tier lookup (in-memory LRU, then durable store), plus a known-404 marker so known-gone
//! URLs are not refetched within TTL.
//!
//! Concurrent fetchers for the same URL are de-duplicated via an in-process "builds in
//! flight" registry, per the two-map (`entries`/`in_flight`) design note in.

use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use lru::LruCache;
use parking_lot::Mutex;
use tokio::sync::broadcast;

use crate::queue::CacheFreshnessGate;
use crate::url::ImUrl;

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub url: String,
    pub html: Option<String>,
    pub fetched_at: u64,
    pub etag: Option<String>,
    pub last_modified: Option<String>,
    pub http_status: u16,
}

/// Pure function: `shouldUseCache({preferCache, maxAgeMs, crawledAt, now})`.
#[must_use]
pub fn should_use_cache(prefer_cache: bool, max_age_ms: i64, crawled_at: u64, now: u64) -> bool {
    if max_age_ms >= 0 {
        now.saturating_sub(crawled_at) <= max_age_ms as u64
    } else {
        prefer_cache
    }
}

/// Durable store operations the cache needs; implemented by `crate::store`.
#[async_trait::async_trait]
pub trait DurableStore: Send + Sync {
    async fn get_cache_entry(&self, url: &str) -> anyhow::Result<Option<CacheEntry>>;
    async fn put_cache_entry(&self, entry: &CacheEntry) -> anyhow::Result<()>;
    async fn get_known_404(&self, url: &str) -> anyhow::Result<Option<u64>>;
    async fn put_known_404(&self, url: &str, fetched_at: u64) -> anyhow::Result<()>;
}

enum InFlight {
    Pending(broadcast::Sender<Option<CacheEntry>>),
}

pub struct ArticleCache {
    memo: Mutex<LruCache<String, CacheEntry>>,
    in_flight: DashMap<String, InFlight>,
    store: Arc<dyn DurableStore>,
    known_404_ttl_ms: u64,
}

impl ArticleCache {
    #[must_use]
    pub fn new(store: Arc<dyn DurableStore>, memo_capacity: usize, known_404_ttl_ms: u64) -> Self {
        Self {
            memo: Mutex::new(LruCache::new(
                NonZeroUsize::new(memo_capacity.max(1)).expect("capacity > 0"),
            )),
            in_flight: DashMap::new(),
            store,
            known_404_ttl_ms,
        }
    }

    /// Look up a URL: in-memory LRU first, then the durable store (populating the
    /// memoisation on a durable hit). Concurrent lookups for the same URL wait on the first
    /// attempt's result instead of each hitting the store independently.
    pub async fn get(&self, url: &ImUrl) -> anyhow::Result<Option<CacheEntry>> {
        let key = url.as_str().to_string();

        if let Some(hit) = self.memo.lock().get(&key).cloned() {
            return Ok(Some(hit));
        }

        loop {
            let (becomes_leader, mut rx) = {
                match self.in_flight.entry(key.clone()) {
                    dashmap::mapref::entry::Entry::Occupied(occ) => {
                        let InFlight::Pending(tx) = occ.get();
                        (false, tx.subscribe())
                    }
                    dashmap::mapref::entry::Entry::Vacant(vac) => {
                        let (tx, rx) = broadcast::channel(1);
                        vac.insert(InFlight::Pending(tx));
                        (true, rx)
                    }
                }
            };

            if !becomes_leader {
                return Ok(rx.recv().await.unwrap_or(None));
            }

            let result = self.store.get_cache_entry(&key).await;
            if let Some(InFlight::Pending(tx)) = self.in_flight.remove(&key).map(|(_, v)| v) {
                let to_send = result.as_ref().ok().cloned().flatten();
                let _ = tx.send(to_send.clone());
                if let Some(entry) = &to_send {
                    self.memo.lock().put(key.clone(), entry.clone());
                }
            }
            return result;
        }
    }

    /// Write a fresh entry: updates both the in-memory and durable tiers.
    pub async fn put(&self, entry: CacheEntry) -> anyhow::Result<()> {
        self.store.put_cache_entry(&entry).await?;
        self.memo.lock().put(entry.url.clone(), entry);
        Ok(())
    }

    /// Known-404 marker: returns true if `url` was recorded as gone within the TTL window.
    pub async fn is_known_404(&self, url: &ImUrl) -> anyhow::Result<bool> {
        match self.store.get_known_404(url.as_str()).await? {
            Some(fetched_at) => Ok(now_ms().saturating_sub(fetched_at) <= self.known_404_ttl_ms),
            None => Ok(false),
        }
    }

    pub async fn mark_known_404(&self, url: &ImUrl) -> anyhow::Result<()> {
        self.store.put_known_404(url.as_str(), now_ms()).await
    }
}

/// Adapter implementing the queue's `CacheFreshnessGate` using a synchronous snapshot of
/// the in-memory tier only (the forced-cache scheduling check must not block on I/O).
pub struct MemoFreshnessGate<'a> {
    pub cache: &'a ArticleCache,
    pub max_age_ms: i64,
}

impl CacheFreshnessGate for MemoFreshnessGate<'_> {
    fn has_fresh_entry(&self, url: &ImUrl) -> bool {
        let Some(entry) = self.cache.memo.lock().peek(url.as_str()).cloned() else {
            return false;
        };
        should_use_cache(true, self.max_age_ms, entry.fetched_at, now_ms())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FakeStore {
        entry: Option<CacheEntry>,
        calls: AtomicUsize,
        known_404: DashMap<String, u64>,
    }

    #[async_trait::async_trait]
    impl DurableStore for FakeStore {
        async fn get_cache_entry(&self, _url: &str) -> anyhow::Result<Option<CacheEntry>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.entry.clone())
        }
        async fn put_cache_entry(&self, _entry: &CacheEntry) -> anyhow::Result<()> {
            Ok(())
        }
        async fn get_known_404(&self, url: &str) -> anyhow::Result<Option<u64>> {
            Ok(self.known_404.get(url).map(|v| *v))
        }
        async fn put_known_404(&self, url: &str, fetched_at: u64) -> anyhow::Result<()> {
            self.known_404.insert(url.to_string(), fetched_at);
            Ok(())
        }
    }

    #[test]
    fn cache_decision_purity_p7() {
        // maxAgeMs >= 0: purely a function of now - crawledAt.
        assert!(should_use_cache(false, 1_000, 500, 1_000));
        assert!(!should_use_cache(false, 1_000, 0, 2_000));
        // maxAgeMs == 0: never use cache regardless of crawledAt.
        assert!(!should_use_cache(true, 0, 500, 500));
        // maxAgeMs == -1 (policy off): falls back to preferCache.
        assert!(should_use_cache(true, -1, 0, 1_000_000));
        assert!(!should_use_cache(false, -1, 0, 0));
    }

    #[tokio::test]
    async fn concurrent_lookups_for_same_url_hit_store_once() {
        let store = Arc::new(FakeStore {
            entry: Some(CacheEntry {
                url: "https://example.com/a".to_string(),
                html: Some("<html></html>".to_string()),
                fetched_at: now_ms(),
                etag: None,
                last_modified: None,
                http_status: 200,
            }),
            calls: AtomicUsize::new(0),
            known_404: DashMap::new(),
        });
        let cache = Arc::new(ArticleCache::new(store.clone(), 100, 86_400_000));
        let url = ImUrl::parse("https://example.com/a").unwrap();

        let c1 = cache.clone();
        let u1 = url.clone();
        let c2 = cache.clone();
        let u2 = url.clone();
        let (a, b) = tokio::join!(
            tokio::spawn(async move { c1.get(&u1).await.unwrap() }),
            tokio::spawn(async move { c2.get(&u2).await.unwrap() }),
        );
        assert!(a.unwrap().is_some());
        assert!(b.unwrap().is_some());
        assert_eq!(store.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn known_404_respects_ttl() {
        let store = Arc::new(FakeStore {
            entry: None,
            calls: AtomicUsize::new(0),
            known_404: DashMap::new(),
        });
        let cache = ArticleCache::new(store, 10, 1_000);
        let url = ImUrl::parse("https://example.com/gone").unwrap();
        assert!(!cache.is_known_404(&url).await.unwrap());
        cache.mark_known_404(&url).await.unwrap();
        assert!(cache.is_known_404(&url).await.unwrap());
    }
}
