//! # Precache Store
//!
//! Named response buckets for the offline cache agent.
//!
//! ## Features
//!
//! - **CacheStorage**: `open()`, `has()`, `keys()`, `delete()`
//! - **Cache**: `match_request()`, `put()`, `add_all()`, `delete()`, `keys()`
//! - **Backends**: in-memory and on-disk (JSON per bucket)
//! - **Eviction**: LRU/byte-budget/TTL decorator over any backend
//!
//! ## Architecture
//!
//! ```text
//! CacheStorage (one per origin)
//!     └── Cache (bucket, named by version)
//!             └── CacheKey (GET + URL) → CachedResponse
//! ```

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;
use precache_net::{Network, Request, Response, ResponseType};
use thiserror::Error;
use tracing::{debug, trace, warn};
use url::Url;

pub mod disk;
pub mod entry;
pub mod eviction;
pub mod memory;

pub use disk::DiskCacheStorage;
pub use entry::{CacheKey, CachedResponse, EntryInfo};
pub use eviction::{EvictingStorage, EvictionPolicy};
pub use memory::MemoryCacheStorage;

// ==================== Errors ====================

/// Errors that can occur in bucket operations.
#[derive(Error, Debug)]
pub enum CacheError {
    #[error("Only GET requests can be stored, got {0}")]
    MethodNotAllowed(String),

    #[error("Response for {0} has Vary: * and cannot be stored")]
    VaryWildcard(String),

    #[error("Batch add failed for {} url(s): {}", .0.len(), describe_failures(.0))]
    AddAll(Vec<AddAllFailure>),

    #[error("Entry {key} is {size} bytes, over the {max} byte budget")]
    TooLarge { key: String, size: u64, max: u64 },

    #[error("Corrupt bucket data: {0}")]
    Corrupt(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// One URL that prevented a batch add.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddAllFailure {
    pub url: Url,
    pub reason: String,
}

fn describe_failures(failures: &[AddAllFailure]) -> String {
    failures
        .iter()
        .map(|f| format!("{} ({})", f.url, f.reason))
        .collect::<Vec<_>>()
        .join(", ")
}

// ==================== Traits ====================

/// A named bucket of stored responses.
#[async_trait]
pub trait Cache: Send + Sync {
    /// Bucket name.
    fn name(&self) -> &str;

    /// Look up a stored response. Only GET requests ever match.
    async fn match_request(&self, request: &Request) -> Result<Option<Response>, CacheError>;

    /// Store `response` under the request's key, replacing any previous entry.
    async fn put(&self, request: &Request, response: Response) -> Result<(), CacheError>;

    /// Remove the entry for `key`.
    async fn remove(&self, key: &CacheKey) -> Result<bool, CacheError>;

    /// Describe every stored entry.
    async fn entries(&self) -> Result<Vec<EntryInfo>, CacheError>;

    /// Remove the entry matching a request.
    async fn delete(&self, request: &Request) -> Result<bool, CacheError> {
        self.remove(&CacheKey::from_request(request)).await
    }

    /// All stored keys.
    async fn keys(&self) -> Result<Vec<CacheKey>, CacheError> {
        Ok(self.entries().await?.into_iter().map(|e| e.key).collect())
    }

    /// Fetch every URL and store all responses, or store none.
    ///
    /// Every URL is fetched; the batch is rejected if any fetch fails or
    /// returns a non-2xx, opaque, error or unstorable response. A write that
    /// fails part way rolls back the entries already written. Returns the
    /// number of entries stored.
    async fn add_all(&self, network: &dyn Network, urls: &[Url]) -> Result<usize, CacheError> {
        let requests: Vec<Request> = urls.iter().cloned().map(Request::get).collect();
        let results = join_all(requests.iter().map(|request| network.fetch(request))).await;

        let mut fetched = Vec::with_capacity(requests.len());
        let mut failures = Vec::new();

        for (request, result) in requests.iter().zip(results) {
            match result {
                Ok(response) if !is_addable(&response) => failures.push(AddAllFailure {
                    url: request.url.clone(),
                    reason: format!(
                        "status {} ({:?} response)",
                        response.status, response.response_type
                    ),
                }),
                Ok(response) => match CachedResponse::capture(request, &response) {
                    Ok(_) => fetched.push((request, response)),
                    Err(e) => failures.push(AddAllFailure {
                        url: request.url.clone(),
                        reason: e.to_string(),
                    }),
                },
                Err(e) => failures.push(AddAllFailure {
                    url: request.url.clone(),
                    reason: e.to_string(),
                }),
            }
        }

        if !failures.is_empty() {
            debug!(bucket = self.name(), failed = failures.len(), "Batch add rejected");
            return Err(CacheError::AddAll(failures));
        }

        let count = fetched.len();
        let mut written: Vec<(&Request, Option<Response>)> = Vec::with_capacity(count);
        for (request, response) in fetched {
            trace!(bucket = self.name(), url = %request.url, "Storing batch entry");
            let previous = self.match_request(request).await?;
            if let Err(e) = self.put(request, response).await {
                debug!(bucket = self.name(), url = %request.url, error = %e, "Rolling back batch");
                for (request, previous) in written.into_iter().rev() {
                    let restored = match previous {
                        Some(previous) => self.put(request, previous).await,
                        None => self.delete(request).await.map(|_| ()),
                    };
                    if let Err(e) = restored {
                        warn!(
                            bucket = self.name(),
                            url = %request.url,
                            error = %e,
                            "Rollback failed"
                        );
                    }
                }
                return Err(e);
            }
            written.push((request, previous));
        }
        Ok(count)
    }
}

fn is_addable(response: &Response) -> bool {
    response.ok()
        && !matches!(
            response.response_type,
            ResponseType::Opaque | ResponseType::Error
        )
}

/// The set of named buckets for one origin.
#[async_trait]
pub trait CacheStorage: Send + Sync {
    /// Open a bucket, creating it if absent.
    async fn open(&self, name: &str) -> Result<Arc<dyn Cache>, CacheError>;

    /// Check if a bucket exists.
    async fn has(&self, name: &str) -> Result<bool, CacheError>;

    /// All bucket names.
    async fn keys(&self) -> Result<Vec<String>, CacheError>;

    /// Delete a bucket. Returns whether it existed.
    async fn delete(&self, name: &str) -> Result<bool, CacheError>;
}

#[async_trait]
impl<S: CacheStorage + ?Sized> CacheStorage for Arc<S> {
    async fn open(&self, name: &str) -> Result<Arc<dyn Cache>, CacheError> {
        (**self).open(name).await
    }

    async fn has(&self, name: &str) -> Result<bool, CacheError> {
        (**self).has(name).await
    }

    async fn keys(&self) -> Result<Vec<String>, CacheError> {
        (**self).keys().await
    }

    async fn delete(&self, name: &str) -> Result<bool, CacheError> {
        (**self).delete(name).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use precache_net::testing::ScriptedNetwork;
    use http::header::VARY;
    use http::HeaderValue;

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    #[tokio::test]
    async fn test_add_all_stores_everything() {
        let network = ScriptedNetwork::new();
        network
            .respond_ok("https://app.example/", "shell")
            .respond_ok("https://app.example/app.js", "js");

        let storage = MemoryCacheStorage::new();
        let cache = storage.open("v1").await.unwrap();
        let stored = cache
            .add_all(
                &network,
                &[url("https://app.example/"), url("https://app.example/app.js")],
            )
            .await
            .unwrap();

        assert_eq!(stored, 2);
        assert_eq!(cache.keys().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_add_all_is_all_or_nothing() {
        let network = ScriptedNetwork::new();
        network
            .respond_ok("https://app.example/", "shell")
            .fail("https://app.example/font.woff2", "connection reset");

        let storage = MemoryCacheStorage::new();
        let cache = storage.open("v1").await.unwrap();
        let result = cache
            .add_all(
                &network,
                &[
                    url("https://app.example/"),
                    url("https://app.example/font.woff2"),
                    url("https://app.example/missing.png"),
                ],
            )
            .await;

        match result {
            Err(CacheError::AddAll(failures)) => {
                let urls: Vec<&str> = failures.iter().map(|f| f.url.as_str()).collect();
                assert_eq!(
                    urls,
                    vec![
                        "https://app.example/font.woff2",
                        "https://app.example/missing.png"
                    ]
                );
            }
            other => panic!("expected AddAll error, got {other:?}"),
        }
        assert!(cache.keys().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_add_all_rejects_opaque() {
        let network = ScriptedNetwork::new();
        network.respond(
            "https://cdn.example.net/lib.js",
            Response::opaque(url("https://cdn.example.net/lib.js")),
        );

        let storage = MemoryCacheStorage::new();
        let cache = storage.open("v1").await.unwrap();
        let result = cache
            .add_all(&network, &[url("https://cdn.example.net/lib.js")])
            .await;

        assert!(matches!(result, Err(CacheError::AddAll(_))));
    }

    #[tokio::test]
    async fn test_add_all_rejects_vary_wildcard_before_writing() {
        let network = ScriptedNetwork::new();
        network
            .respond_ok("https://app.example/", "shell")
            .respond(
                "https://app.example/api.json",
                Response::new(url("https://app.example/api.json"), 200, "{}")
                    .with_header(VARY, HeaderValue::from_static("*")),
            );

        let storage = MemoryCacheStorage::new();
        let cache = storage.open("v1").await.unwrap();
        let result = cache
            .add_all(
                &network,
                &[url("https://app.example/"), url("https://app.example/api.json")],
            )
            .await;

        match result {
            Err(CacheError::AddAll(failures)) => {
                assert_eq!(failures.len(), 1);
                assert_eq!(failures[0].url.as_str(), "https://app.example/api.json");
            }
            other => panic!("expected AddAll error, got {other:?}"),
        }
        assert!(cache.keys().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_add_all_rolls_back_on_write_failure() {
        let network = ScriptedNetwork::new();
        network
            .respond_ok("https://app.example/a.js", "aa")
            .respond_ok("https://app.example/b.js", "this body is over budget");

        let storage = EvictingStorage::new(
            MemoryCacheStorage::new(),
            EvictionPolicy::unbounded().with_max_bytes(8),
        );
        let cache = storage.open("v1").await.unwrap();
        let old = Request::get(url("https://app.example/a.js"));
        cache
            .put(&old, Response::new(old.url.clone(), 200, "old"))
            .await
            .unwrap();

        let result = cache
            .add_all(
                &network,
                &[url("https://app.example/a.js"), url("https://app.example/b.js")],
            )
            .await;

        assert!(matches!(result, Err(CacheError::TooLarge { .. })));
        assert_eq!(cache.keys().await.unwrap().len(), 1);
        let restored = cache.match_request(&old).await.unwrap().unwrap();
        assert_eq!(&restored.body()[..], b"old");
    }
}
