//! On-disk bucket storage.
//!
//! Each bucket is one file named by the SHA-256 of the bucket name, so
//! arbitrary version strings map to safe filenames. The file holds two JSON
//! lines: a header carrying the bucket name, then the entries. Listing reads
//! only the header. Entries are held in memory while a bucket is open and the
//! file is rewritten after each change.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use hashbrown::HashMap;
use precache_net::{Request, Response};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, trace, warn};

use crate::{Cache, CacheError, CacheKey, CacheStorage, CachedResponse, EntryInfo};

const BUCKET_EXTENSION: &str = "json";

#[derive(Debug, Serialize, Deserialize)]
struct StoredEntry {
    key: CacheKey,
    response: CachedResponse,
}

/// First line of a bucket file.
#[derive(Debug, Serialize, Deserialize)]
struct BucketHeader {
    name: String,
}

/// Read the header line of a bucket file. A file that vanished reads as `None`.
async fn read_header(path: &Path) -> Result<Option<BucketHeader>, CacheError> {
    let file = match fs::File::open(path).await {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    let mut line = String::new();
    BufReader::new(file).read_line(&mut line).await?;
    Ok(Some(serde_json::from_str(&line)?))
}

fn split_header(raw: &[u8]) -> (&[u8], &[u8]) {
    match raw.iter().position(|&b| b == b'\n') {
        Some(end) => (&raw[..end], &raw[end + 1..]),
        None => (raw, &raw[raw.len()..]),
    }
}

fn bucket_filename(name: &str) -> String {
    let digest = Sha256::digest(name.as_bytes());
    format!("{}.{BUCKET_EXTENSION}", hex::encode(digest))
}

/// A bucket persisted as a JSON file.
#[derive(Debug)]
pub struct DiskCache {
    name: String,
    path: PathBuf,
    entries: RwLock<HashMap<CacheKey, CachedResponse>>,
    write_lock: Mutex<()>,
    deleted: AtomicBool,
}

impl DiskCache {
    async fn load(name: &str, path: PathBuf) -> Result<Self, CacheError> {
        let mut entries = HashMap::new();

        match fs::read(&path).await {
            Ok(raw) => {
                let (header, body) = split_header(&raw);
                let header: BucketHeader = serde_json::from_slice(header)?;
                if header.name != name {
                    return Err(CacheError::Corrupt(format!(
                        "{} holds bucket {:?}, expected {:?}",
                        path.display(),
                        header.name,
                        name
                    )));
                }
                let stored: Vec<StoredEntry> = if body.is_empty() {
                    Vec::new()
                } else {
                    serde_json::from_slice(body)?
                };
                for stored in stored {
                    entries.insert(stored.key, stored.response);
                }
                debug!(bucket = name, entries = entries.len(), "Loaded bucket from disk");
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        let cache = Self {
            name: name.to_string(),
            path,
            entries: RwLock::new(entries),
            write_lock: Mutex::new(()),
            deleted: AtomicBool::new(false),
        };
        cache.persist().await?;
        Ok(cache)
    }

    /// Rewrite the bucket file from the in-memory entries.
    async fn persist(&self) -> Result<(), CacheError> {
        let _guard = self.write_lock.lock().await;

        // A deleted bucket must not be resurrected by a late write.
        if self.deleted.load(Ordering::Acquire) {
            trace!(bucket = %self.name, "Skipping write to deleted bucket");
            return Ok(());
        }

        let stored: Vec<StoredEntry> = self
            .entries
            .read()
            .await
            .iter()
            .map(|(key, response)| StoredEntry {
                key: key.clone(),
                response: response.clone(),
            })
            .collect();

        let mut json = serde_json::to_vec(&BucketHeader {
            name: self.name.clone(),
        })?;
        json.push(b'\n');
        serde_json::to_writer(&mut json, &stored)?;

        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, &json).await?;
        fs::rename(&tmp, &self.path).await?;

        trace!(bucket = %self.name, bytes = json.len(), "Persisted bucket");
        Ok(())
    }

    fn mark_deleted(&self) {
        self.deleted.store(true, Ordering::Release);
    }
}

#[async_trait]
impl Cache for DiskCache {
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
        self.entries.write().await.insert(key, cached);
        self.persist().await
    }

    async fn remove(&self, key: &CacheKey) -> Result<bool, CacheError> {
        let removed = self.entries.write().await.remove(key).is_some();
        if removed {
            self.persist().await?;
        }
        Ok(removed)
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

/// Bucket storage persisted under a directory.
#[derive(Debug, Clone)]
pub struct DiskCacheStorage {
    root: PathBuf,
    open: Arc<RwLock<HashMap<String, Arc<DiskCache>>>>,
}

impl DiskCacheStorage {
    /// Use `root` as the storage directory, creating it if needed.
    pub async fn new(root: impl Into<PathBuf>) -> Result<Self, CacheError> {
        let root = root.into();
        fs::create_dir_all(&root).await?;
        debug!(root = %root.display(), "Disk cache storage ready");
        Ok(Self {
            root,
            open: Arc::new(RwLock::new(HashMap::new())),
        })
    }

    /// Storage directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn bucket_path(&self, name: &str) -> PathBuf {
        self.root.join(bucket_filename(name))
    }
}

#[async_trait]
impl CacheStorage for DiskCacheStorage {
    async fn open(&self, name: &str) -> Result<Arc<dyn Cache>, CacheError> {
        if let Some(cache) = self.open.read().await.get(name) {
            return Ok(cache.clone());
        }

        let mut open = self.open.write().await;
        if let Some(cache) = open.get(name) {
            return Ok(cache.clone());
        }

        let cache = Arc::new(DiskCache::load(name, self.bucket_path(name)).await?);
        open.insert(name.to_string(), cache.clone());
        Ok(cache)
    }

    async fn has(&self, name: &str) -> Result<bool, CacheError> {
        Ok(fs::try_exists(self.bucket_path(name)).await?)
    }

    async fn keys(&self) -> Result<Vec<String>, CacheError> {
        let mut names = Vec::new();
        let mut dir = fs::read_dir(&self.root).await?;

        while let Some(entry) = dir.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(BUCKET_EXTENSION) {
                continue;
            }
            match read_header(&path).await {
                Ok(Some(header)) => names.push(header.name),
                Ok(None) => trace!(path = %path.display(), "Bucket file removed while listing"),
                Err(CacheError::Serialization(e)) => {
                    warn!(path = %path.display(), error = %e, "Skipping unreadable bucket file")
                }
                Err(e) => return Err(e),
            }
        }

        names.sort();
        Ok(names)
    }

    async fn delete(&self, name: &str) -> Result<bool, CacheError> {
        let handle = self.open.write().await.remove(name);
        if let Some(cache) = handle {
            let _guard = cache.write_lock.lock().await;
            cache.mark_deleted();
        }

        match fs::remove_file(self.bucket_path(name)).await {
            Ok(()) => {
                debug!(bucket = name, "Deleted bucket file");
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}
