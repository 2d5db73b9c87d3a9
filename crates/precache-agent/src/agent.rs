//! The cache-first policy engine.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::future::join_all;
use precache_common::{BestEffort, Result};
use precache_net::{Network, Request, Response, ResponseType};
use precache_store::{CacheError, CacheStorage};
use tracing::{debug, info, trace, warn};
use url::Url;

use crate::config::AgentConfig;
use crate::FetchError;

/// Where a served response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseSource {
    /// Stored response from the current bucket.
    Cache,
    /// Live network response.
    Network,
    /// Cached shell document served to an offline navigation.
    OfflineFallback,
}

/// A response produced by the fetch handler.
#[derive(Debug, Clone)]
pub struct Served {
    pub response: Response,
    pub source: ResponseSource,
}

impl Served {
    fn new(response: Response, source: ResponseSource) -> Self {
        Self { response, source }
    }
}

/// Whether a network response may be written to the bucket.
///
/// Only status 200 same-origin or CORS-readable responses qualify; redirects,
/// errors and opaque responses are passed through untouched.
pub fn is_storable(response: &Response) -> bool {
    response.status == 200
        && matches!(
            response.response_type,
            ResponseType::Basic | ResponseType::Cors
        )
}

/// Offline cache agent.
///
/// Owns one versioned bucket inside the injected storage and reacts to the
/// install, activate and fetch signals.
pub struct OfflineCacheAgent {
    version: String,
    precache: Vec<Url>,
    shell: Url,
    storage: Arc<dyn CacheStorage>,
    network: Arc<dyn Network>,
    retired: AtomicBool,
}

impl OfflineCacheAgent {
    /// Build an agent from a validated configuration.
    pub fn new(
        config: &AgentConfig,
        storage: Arc<dyn CacheStorage>,
        network: Arc<dyn Network>,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            version: config.version.clone(),
            precache: config.precache_urls()?,
            shell: config.shell_url()?,
            storage,
            network,
            retired: AtomicBool::new(false),
        })
    }

    /// Current bucket name.
    pub fn version(&self) -> &str {
        &self.version
    }

    /// Resolved precache list.
    pub fn precache_urls(&self) -> &[Url] {
        &self.precache
    }

    /// Resolved shell document URL.
    pub fn shell_url(&self) -> &Url {
        &self.shell
    }

    /// Stop touching the bucket.
    ///
    /// Called when a newer version takes over. Fetches still in flight keep
    /// answering from the network but never reopen this version's bucket.
    pub fn retire(&self) {
        self.retired.store(true, Ordering::SeqCst);
    }

    /// Whether a newer version has taken over.
    pub fn is_retired(&self) -> bool {
        self.retired.load(Ordering::SeqCst)
    }

    /// Populate the current bucket from the manifest.
    ///
    /// A failed batch is logged once per failing URL and tolerated: install
    /// always completes.
    pub async fn install(&self) -> BestEffort<usize, CacheError> {
        info!(version = %self.version, entries = self.precache.len(), "Installing");

        let result = match self.storage.open(&self.version).await {
            Ok(cache) => cache.add_all(self.network.as_ref(), &self.precache).await,
            Err(e) => Err(e),
        };

        match result {
            Ok(stored) => {
                info!(version = %self.version, stored, "Precache complete");
                BestEffort::Applied(stored)
            }
            Err(CacheError::AddAll(failures)) => {
                for failure in &failures {
                    warn!(url = %failure.url, reason = %failure.reason, "Precache failed for manifest entry");
                }
                warn!(
                    version = %self.version,
                    failed = failures.len(),
                    "Precache batch rejected; installing without offline assets"
                );
                BestEffort::Degraded(CacheError::AddAll(failures))
            }
            Err(e) => BestEffort::tolerate(Err(e), "precache"),
        }
    }

    /// Delete every bucket except the current one.
    ///
    /// Deletions run concurrently; each failure is logged and skipped.
    /// Returns the names that were deleted.
    pub async fn activate(&self) -> BestEffort<Vec<String>, CacheError> {
        let names = match self.storage.keys().await {
            Ok(names) => names,
            Err(e) => return BestEffort::tolerate(Err(e), "list buckets"),
        };

        let stale: Vec<String> = names
            .into_iter()
            .filter(|name| name != &self.version)
            .collect();

        let results = join_all(stale.iter().map(|name| self.storage.delete(name))).await;

        let mut deleted = Vec::with_capacity(stale.len());
        for (name, result) in stale.into_iter().zip(results) {
            match result {
                Ok(true) => {
                    debug!(bucket = %name, "Deleted stale bucket");
                    deleted.push(name);
                }
                Ok(false) => trace!(bucket = %name, "Stale bucket already gone"),
                Err(e) => warn!(bucket = %name, error = %e, "Failed to delete stale bucket"),
            }
        }

        info!(version = %self.version, deleted = deleted.len(), "Activated");
        BestEffort::Applied(deleted)
    }

    /// Cache-first fetch with network fallback.
    ///
    /// 1. Stored response in the current bucket: returned, network untouched.
    /// 2. Network response: returned; stored first when it is a 200
    ///    basic/cors response to a GET.
    /// 3. Network failure: navigations get the cached shell document, every
    ///    other request fails.
    pub async fn handle_fetch(&self, request: &Request) -> std::result::Result<Served, FetchError> {
        if let Some(response) = self.lookup(request).await {
            debug!(url = %request.url, "Cache hit");
            return Ok(Served::new(response, ResponseSource::Cache));
        }
        debug!(url = %request.url, "Cache miss");

        match self.network.fetch(request).await {
            Ok(response) => {
                if is_storable(&response) {
                    let outcome = BestEffort::from(self.store(request, response.clone()).await);
                    if let Some(e) = outcome.error() {
                        debug!(url = %request.url, error = %e, "Ignoring cache write failure");
                    }
                } else {
                    trace!(
                        url = %request.url,
                        status = response.status,
                        response_type = ?response.response_type,
                        "Passing through unstorable response"
                    );
                }
                Ok(Served::new(response, ResponseSource::Network))
            }
            Err(e) if request.is_navigation() => match self.offline_shell().await {
                Some(shell) => {
                    info!(url = %request.url, error = %e, "Offline navigation; serving shell");
                    Ok(Served::new(shell, ResponseSource::OfflineFallback))
                }
                None => Err(FetchError::Network(e)),
            },
            Err(e) => {
                debug!(url = %request.url, error = %e, "Network failure without fallback");
                Err(FetchError::Network(e))
            }
        }
    }

    /// Bucket lookup; a storage failure reads as a miss.
    async fn lookup(&self, request: &Request) -> Option<Response> {
        if self.is_retired() {
            return None;
        }
        let result = match self.storage.open(&self.version).await {
            Ok(cache) => cache.match_request(request).await,
            Err(e) => Err(e),
        };
        BestEffort::tolerate(result, "cache lookup").applied().flatten()
    }

    async fn store(
        &self,
        request: &Request,
        response: Response,
    ) -> std::result::Result<(), CacheError> {
        if !request.is_get() {
            trace!(url = %request.url, method = %request.method, "Not storing non-GET response");
            return Ok(());
        }
        if self.is_retired() {
            trace!(url = %request.url, version = %self.version, "Agent retired; not storing");
            return Ok(());
        }
        let cache = self.storage.open(&self.version).await?;
        cache.put(request, response).await?;

        // Retired while the write was pending: the open above may have
        // recreated a bucket that activation already deleted.
        if self.is_retired() {
            debug!(version = %self.version, "Agent retired during store; dropping bucket");
            self.storage.delete(&self.version).await?;
            return Ok(());
        }
        debug!(url = %request.url, "Stored network response");
        Ok(())
    }

    async fn offline_shell(&self) -> Option<Response> {
        self.lookup(&Request::get(self.shell.clone())).await
    }
}
