//! In-memory bucket storage.

use std::sync::Arc;

use async_trait::async_trait;
use hashbrown::HashMap;
use precache_net::{Request, Response};
use tokio::sync::RwLock;
use tracing::trace;

use crate::{Cache, CacheError, CacheKey, CacheStorage, CachedResponse, EntryInfo};

/// An in-memory bucket.
#[derive(Debug, Default)]
pub struct MemoryCache {
    name: String,
    entries: RwLock<HashMap<CacheKey, CachedResponse>>,
}

impl MemoryCache {
    /// Create a new bucket.
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Number of stored entries.
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    /// Whether the bucket is empty.
    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

#[async_trait]
impl Cache for MemoryCache {
    fn name(&self) -> &str {
        &self.name
    }

    async fn match_request(&self, request: &Request) -> Result<Option<Response>, CacheError> {
        let key = CacheKey::from_request(request);
        if !key.is_storable() {
            return Ok(None);
        }

        let entries = self.entries.read().await;
        match entries.get(&key) {
            Some(cached) if cached.matches(request) => cached.to_response().map(Some),
            _ => Ok(None),
        }
    }

    async fn put(&self, request: &Request, response: Response) -> Result<(), CacheError> {
        let key = CacheKey::from_request(request);
        if !key.is_storable() {
            return Err(CacheError::MethodNotAllowed(key.method));
        }

        let cached = CachedResponse::capture(request, &response)?;
        trace!(bucket = %self.name, key = %key, size = cached.size(), "Stored entry");
        self.entries.write().await.insert(key, cached);
        Ok(())
    }

    async fn remove(&self, key: &CacheKey) -> Result<bool, CacheError> {
        Ok(self.entries.write().await.remove(key).is_some())
    }

    async fn entries(&self) -> Result<Vec<EntryInfo>, CacheError> {
        Ok(self
            .entries
            .read()
            .await
            .iter()
            .map(|(key, cached)| cached.info(key))
            .collect())
    }
}

/// In-memory bucket storage.
#[derive(Debug, Default, Clone)]
pub struct MemoryCacheStorage {
    caches: Arc<RwLock<HashMap<String, Arc<MemoryCache>>>>,
}

impl MemoryCacheStorage {
    /// Create new storage.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CacheStorage for MemoryCacheStorage {
    async fn open(&self, name: &str) -> Result<Arc<dyn Cache>, CacheError> {
        if let Some(cache) = self.caches.read().await.get(name) {
            return Ok(cache.clone());
        }

        let mut caches = self.caches.write().await;
        let cache = caches
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(MemoryCache::new(name)))
            .clone();
        Ok(cache)
    }

    async fn has(&self, name: &str) -> Result<bool, CacheError> {
        Ok(self.caches.read().await.contains_key(name))
    }

    async fn keys(&self) -> Result<Vec<String>, CacheError> {
        let mut names: Vec<String> = self.caches.read().await.keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    async fn delete(&self, name: &str) -> Result<bool, CacheError> {
        Ok(self.caches.write().await.remove(name).is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use url::Url;

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    #[tokio::test]
    async fn test_cache_put_and_match() {
        let cache = MemoryCache::new("v1");
        let request = Request::get(url("https://app.example/style.css"));
        cache
            .put(&request, Response::new(request.url.clone(), 200, "body{}"))
            .await
            .unwrap();

        assert!(cache.match_request(&request).await.unwrap().is_some());
        let other = Request::get(url("https://app.example/other.css"));
        assert!(cache.match_request(&other).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_cache_rejects_non_get() {
        let cache = MemoryCache::new("v1");
        let request = Request::post(url("https://app.example/api"), Bytes::from_static(b"{}"));
        let result = cache
            .put(&request, Response::new(request.url.clone(), 200, "ok"))
            .await;

        assert!(matches!(result, Err(CacheError::MethodNotAllowed(_))));
        assert!(cache.is_empty().await);
    }

    #[tokio::test]
    async fn test_cache_delete() {
        let cache = MemoryCache::new("v1");
        let request = Request::get(url("https://app.example/style.css"));
        cache
            .put(&request, Response::new(request.url.clone(), 200, ""))
            .await
            .unwrap();

        assert!(cache.delete(&request).await.unwrap());
        assert!(cache.match_request(&request).await.unwrap().is_none());
        assert!(!cache.delete(&request).await.unwrap());
    }

    #[tokio::test]
    async fn test_cache_keys() {
        let cache = MemoryCache::new("test");
        for path in ["a.js", "b.js"] {
            let request = Request::get(url(&format!("https://app.example/{path}")));
            cache
                .put(&request, Response::new(request.url.clone(), 200, ""))
                .await
                .unwrap();
        }

        assert_eq!(cache.keys().await.unwrap().len(), 2);
        assert_eq!(cache.len().await, 2);
    }

    #[tokio::test]
    async fn test_cache_storage() {
        let storage = MemoryCacheStorage::new();

        assert!(!storage.has("v1").await.unwrap());

        storage.open("v1").await.unwrap();
        storage.open("v2").await.unwrap();
        assert!(storage.has("v1").await.unwrap());
        assert_eq!(storage.keys().await.unwrap(), vec!["v1", "v2"]);

        assert!(storage.delete("v1").await.unwrap());
        assert!(!storage.has("v1").await.unwrap());
        assert!(!storage.delete("v1").await.unwrap());
    }

    #[tokio::test]
    async fn test_open_returns_same_bucket() {
        let storage = MemoryCacheStorage::new();
        let request = Request::get(url("https://app.example/"));

        let first = storage.open("v1").await.unwrap();
        first
            .put(&request, Response::new(request.url.clone(), 200, "shell"))
            .await
            .unwrap();

        let second = storage.open("v1").await.unwrap();
        assert!(second.match_request(&request).await.unwrap().is_some());
    }
}
