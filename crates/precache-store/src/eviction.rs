//! Eviction decorator for bucket storage.
//!
//! Wraps any [`CacheStorage`] and bounds each bucket by entry count, total
//! body bytes and entry age. Recency is tracked with an LRU list updated on
//! every hit and put. Pinned URLs (typically the precache manifest) are never
//! evicted or expired.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use hashbrown::HashMap;
use lru::LruCache;
use precache_net::{Request, Response};
use tokio::sync::{Mutex, RwLock};
use tracing::debug;

use crate::entry::now_millis;
use crate::{Cache, CacheError, CacheKey, CacheStorage, EntryInfo};

/// Limits applied to every bucket.
#[derive(Debug, Clone)]
pub struct EvictionPolicy {
    /// Maximum number of entries per bucket.
    pub max_entries: Option<usize>,
    /// Maximum total body bytes per bucket.
    pub max_bytes: Option<u64>,
    /// Maximum entry age.
    pub ttl: Option<Duration>,
    /// URLs exempt from eviction and expiry.
    pub pinned: HashSet<String>,
}

impl Default for EvictionPolicy {
    fn default() -> Self {
        Self {
            max_entries: Some(500),
            max_bytes: Some(100 * 1024 * 1024), // 100MB
            ttl: None,
            pinned: HashSet::new(),
        }
    }
}

impl EvictionPolicy {
    /// No limits at all.
    pub fn unbounded() -> Self {
        Self {
            max_entries: None,
            max_bytes: None,
            ttl: None,
            pinned: HashSet::new(),
        }
    }

    pub fn with_max_entries(mut self, max_entries: usize) -> Self {
        self.max_entries = Some(max_entries);
        self
    }

    pub fn with_max_bytes(mut self, max_bytes: u64) -> Self {
        self.max_bytes = Some(max_bytes);
        self
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    /// Exempt URLs from eviction and expiry.
    pub fn pin<I, U>(mut self, urls: I) -> Self
    where
        I: IntoIterator<Item = U>,
        U: AsRef<str>,
    {
        self.pinned
            .extend(urls.into_iter().map(|u| u.as_ref().to_string()));
        self
    }

    fn is_pinned(&self, key: &CacheKey) -> bool {
        self.pinned.contains(&key.url)
    }

    fn is_expired(&self, info: &EntryInfo, now: u64) -> bool {
        match self.ttl {
            Some(ttl) if !self.is_pinned(&info.key) => {
                now.saturating_sub(info.stored_at) >= ttl.as_millis() as u64
            }
            _ => false,
        }
    }
}

struct Tracker {
    order: LruCache<CacheKey, EntryInfo>,
    total_bytes: u64,
}

impl Tracker {
    fn record(&mut self, info: EntryInfo) {
        self.total_bytes += info.size;
        if let Some(previous) = self.order.put(info.key.clone(), info) {
            self.total_bytes = self.total_bytes.saturating_sub(previous.size);
        }
    }

    fn forget(&mut self, key: &CacheKey) {
        if let Some(info) = self.order.pop(key) {
            self.total_bytes = self.total_bytes.saturating_sub(info.size);
        }
    }

    fn over_budget(&self, policy: &EvictionPolicy) -> bool {
        policy.max_entries.is_some_and(|max| self.order.len() > max)
            || policy.max_bytes.is_some_and(|max| self.total_bytes > max)
    }

    /// Pop least-recently-used unpinned entries until within budget.
    fn select_victims(&mut self, policy: &EvictionPolicy) -> Vec<CacheKey> {
        let mut victims = Vec::new();
        while self.over_budget(policy) {
            let candidate = self
                .order
                .iter()
                .rev()
                .map(|(key, _)| key)
                .find(|key| !policy.is_pinned(key))
                .cloned();
            let Some(key) = candidate else {
                break;
            };
            self.forget(&key);
            victims.push(key);
        }
        victims
    }
}

/// A bucket bounded by an [`EvictionPolicy`].
pub struct EvictingCache {
    inner: Arc<dyn Cache>,
    policy: Arc<EvictionPolicy>,
    tracker: Mutex<Tracker>,
}

impl EvictingCache {
    async fn wrap(inner: Arc<dyn Cache>, policy: Arc<EvictionPolicy>) -> Result<Self, CacheError> {
        let mut existing = inner.entries().await?;
        existing.sort_by_key(|info| info.stored_at);

        let mut tracker = Tracker {
            order: LruCache::unbounded(),
            total_bytes: 0,
        };
        for info in existing {
            tracker.record(info);
        }
        let victims = tracker.select_victims(&policy);

        let cache = Self {
            inner,
            policy,
            tracker: Mutex::new(tracker),
        };
        cache.evict(victims).await?;
        Ok(cache)
    }

    async fn evict(&self, victims: Vec<CacheKey>) -> Result<(), CacheError> {
        for key in victims {
            self.inner.remove(&key).await?;
            debug!(bucket = self.inner.name(), key = %key, "Evicted entry");
        }
        Ok(())
    }
}

#[async_trait]
impl Cache for EvictingCache {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn match_request(&self, request: &Request) -> Result<Option<Response>, CacheError> {
        let Some(response) = self.inner.match_request(request).await? else {
            return Ok(None);
        };

        let key = CacheKey::from_request(request);
        let expired = {
            let mut tracker = self.tracker.lock().await;
            let now = now_millis();
            match tracker.order.get(&key) {
                Some(info) if self.policy.is_expired(info, now) => {
                    tracker.forget(&key);
                    true
                }
                _ => false,
            }
        };

        if expired {
            self.inner.remove(&key).await?;
            debug!(bucket = self.inner.name(), key = %key, "Expired entry");
            return Ok(None);
        }
        Ok(Some(response))
    }

    async fn put(&self, request: &Request, response: Response) -> Result<(), CacheError> {
        let key = CacheKey::from_request(request);
        let size = response.body().len() as u64;

        if let Some(max) = self.policy.max_bytes {
            if size > max && !self.policy.is_pinned(&key) {
                return Err(CacheError::TooLarge {
                    key: key.to_string(),
                    size,
                    max,
                });
            }
        }

        self.inner.put(request, response).await?;

        let victims = {
            let mut tracker = self.tracker.lock().await;
            tracker.record(EntryInfo {
                key,
                size,
                stored_at: now_millis(),
            });
            tracker.select_victims(&self.policy)
        };
        self.evict(victims).await
    }

    async fn remove(&self, key: &CacheKey) -> Result<bool, CacheError> {
        let removed = self.inner.remove(key).await?;
        self.tracker.lock().await.forget(key);
        Ok(removed)
    }

    async fn entries(&self) -> Result<Vec<EntryInfo>, CacheError> {
        self.inner.entries().await
    }
}

/// A [`CacheStorage`] whose buckets are bounded by an [`EvictionPolicy`].
pub struct EvictingStorage<S> {
    inner: S,
    policy: Arc<EvictionPolicy>,
    buckets: RwLock<HashMap<String, Arc<EvictingCache>>>,
}

impl<S: CacheStorage> EvictingStorage<S> {
    /// Wrap `inner` with `policy`.
    pub fn new(inner: S, policy: EvictionPolicy) -> Self {
        Self {
            inner,
            policy: Arc::new(policy),
            buckets: RwLock::new(HashMap::new()),
        }
    }

    /// The active policy.
    pub fn policy(&self) -> &EvictionPolicy {
        &self.policy
    }
}

#[async_trait]
impl<S: CacheStorage> CacheStorage for EvictingStorage<S> {
    async fn open(&self, name: &str) -> Result<Arc<dyn Cache>, CacheError> {
        if let Some(cache) = self.buckets.read().await.get(name) {
            return Ok(cache.clone());
        }

        let mut buckets = self.buckets.write().await;
        if let Some(cache) = buckets.get(name) {
            return Ok(cache.clone());
        }

        let inner = self.inner.open(name).await?;
        let cache = Arc::new(EvictingCache::wrap(inner, self.policy.clone()).await?);
        buckets.insert(name.to_string(), cache.clone());
        Ok(cache)
    }

    async fn has(&self, name: &str) -> Result<bool, CacheError> {
        self.inner.has(name).await
    }

    async fn keys(&self) -> Result<Vec<String>, CacheError> {
        self.inner.keys().await
    }

    async fn delete(&self, name: &str) -> Result<bool, CacheError> {
        self.buckets.write().await.remove(name);
        self.inner.delete(name).await
    }
}
