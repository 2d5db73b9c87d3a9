//! Subcommand implementations.

use std::error::Error;
use std::fmt::Write;
use std::path::Path;
use std::sync::Arc;

use http::Method;
use precache_agent::{AgentConfig, OfflineCacheAgent, Served};
use precache_common::BestEffort;
use precache_net::{HttpNetwork, NetworkConfig, Request};
use precache_store::{Cache, CacheStorage, DiskCacheStorage, EvictingStorage, EvictionPolicy};
use serde::Serialize;
use tracing::debug;
use url::Url;

type CliResult<T> = Result<T, Box<dyn Error>>;

/// Per-bucket limits given on the command line.
#[derive(Debug, Clone, Copy, Default)]
pub struct Limits {
    pub max_entries: Option<usize>,
    pub max_bytes: Option<u64>,
}

impl Limits {
    fn policy(self, pinned: &[Url]) -> EvictionPolicy {
        let mut policy = EvictionPolicy::default().pin(pinned.iter().map(Url::as_str));
        if let Some(max_entries) = self.max_entries {
            policy = policy.with_max_entries(max_entries);
        }
        if let Some(max_bytes) = self.max_bytes {
            policy = policy.with_max_bytes(max_bytes);
        }
        policy
    }
}

/// Loaded configuration, storage and agent.
pub struct Context {
    pub config: AgentConfig,
    /// Raw bucket store, for inspection without eviction.
    pub disk: DiskCacheStorage,
    pub agent: OfflineCacheAgent,
}

impl Context {
    pub async fn open(config_path: &Path, store: &Path, limits: Limits) -> CliResult<Self> {
        let config = AgentConfig::load(config_path)?;
        let precache = config.precache_urls()?;

        let disk = DiskCacheStorage::new(store).await?;
        let storage = Arc::new(EvictingStorage::new(disk.clone(), limits.policy(&precache)));
        let network = Arc::new(HttpNetwork::new(
            NetworkConfig::default().with_origin(config.origin.clone()),
        )?);

        let agent = OfflineCacheAgent::new(&config, storage, network)?;
        debug!(version = %config.version, store = %store.display(), "Context ready");

        Ok(Self {
            config,
            disk,
            agent,
        })
    }
}

pub async fn install(ctx: &Context) -> CliResult<()> {
    match ctx.agent.install().await {
        BestEffort::Applied(stored) => {
            println!("Installed {}: {} entries precached", ctx.config.version, stored);
        }
        BestEffort::Degraded(err) => {
            println!("Installed {} without offline assets", ctx.config.version);
            println!("  {err}");
        }
    }
    Ok(())
}

pub async fn activate(ctx: &Context) -> CliResult<()> {
    let deleted = ctx.agent.activate().await.applied().unwrap_or_default();
    println!("Activated {}", ctx.config.version);
    for name in &deleted {
        println!("  deleted {name}");
    }
    Ok(())
}

pub async fn fetch(ctx: &Context, raw: &str, navigate: bool, method: &str) -> CliResult<()> {
    let request = build_request(&ctx.config.origin, raw, navigate, method)?;
    let served = ctx.agent.handle_fetch(&request).await?;
    println!("{}", summarize(&served));
    Ok(())
}

fn summarize(served: &Served) -> String {
    let response = &served.response;
    let mut out = String::new();
    let _ = writeln!(out, "Source:  {:?}", served.source);
    let _ = writeln!(out, "Status:  {}", response.status);
    let _ = writeln!(out, "Type:    {:?}", response.response_type);
    if let Some(mime) = response.content_type() {
        let _ = writeln!(out, "Content: {mime}");
    }
    let _ = write!(out, "Length:  {} bytes", response.body().len());
    out
}

fn build_request(origin: &Url, raw: &str, navigate: bool, method: &str) -> CliResult<Request> {
    let url = origin.join(raw)?;
    let method = Method::from_bytes(method.to_ascii_uppercase().as_bytes())?;

    let request = if navigate {
        Request::navigate(url)
    } else {
        Request::get(url)
    };
    Ok(request.method(method))
}

#[derive(Serialize)]
struct BucketListing {
    name: String,
    current: bool,
}

pub async fn list(ctx: &Context, bucket: Option<&str>, json: bool) -> CliResult<()> {
    match bucket {
        None => {
            let buckets: Vec<BucketListing> = ctx
                .disk
                .keys()
                .await?
                .into_iter()
                .map(|name| BucketListing {
                    current: name == ctx.config.version,
                    name,
                })
                .collect();

            if json {
                println!("{}", serde_json::to_string_pretty(&buckets)?);
            } else {
                for bucket in &buckets {
                    let marker = if bucket.current { "*" } else { " " };
                    println!("{marker} {}", bucket.name);
                }
            }
        }
        Some(name) => {
            if !ctx.disk.has(name).await? {
                return Err(format!("no bucket named {name}").into());
            }
            let cache = ctx.disk.open(name).await?;
            let mut entries = cache.entries().await?;
            entries.sort_by(|a, b| a.key.url.cmp(&b.key.url));

            if json {
                println!("{}", serde_json::to_string_pretty(&entries)?);
            } else {
                for entry in &entries {
                    println!("{:>10}  {}", entry.size, entry.key);
                }
                println!("{} entries", entries.len());
            }
        }
    }
    Ok(())
}
