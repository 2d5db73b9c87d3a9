//! # Precache Agent
//!
//! Cache-first offline agent for a single-page application.
//!
//! ## Features
//!
//! - **Install**: precache a fixed manifest into a versioned bucket
//! - **Activate**: delete every bucket but the current version
//! - **Fetch**: serve from cache, fall back to network, serve the shell
//!   document to offline navigations
//! - **Lifecycle**: state machine and event routing around the agent
//!
//! ## Architecture
//!
//! ```text
//! AgentHost
//!     │
//!     └── OfflineCacheAgent
//!             ├── AgentConfig (version, manifest, shell)
//!             ├── CacheStorage ── Cache
//!             └── Network
//! ```

use precache_net::NetError;
use thiserror::Error;

pub mod agent;
pub mod config;
pub mod lifecycle;

pub use agent::{is_storable, OfflineCacheAgent, ResponseSource, Served};
pub use config::{AgentConfig, AssetManifest, ManifestEntry};
pub use lifecycle::{AgentEvent, AgentHost, ExtendableEvent, LifecycleReport, WorkerState};

/// Errors surfaced by fetch interception.
#[derive(Error, Debug)]
pub enum FetchError {
    /// Cache miss and the network failed, with no fallback available.
    #[error("Network error: {0}")]
    Network(#[from] NetError),
}
