//! Agent configuration: version identifier and asset manifest.

use std::collections::HashSet;
use std::path::Path;

use precache_common::{PrecacheError, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;
use url::Url;

/// One primary manifest entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    /// Absolute or root-relative URL.
    pub url: String,

    /// Marks the binary payload (e.g. a compiled WASM engine).
    #[serde(default)]
    pub binary: bool,
}

impl ManifestEntry {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            binary: false,
        }
    }

    pub fn binary(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            binary: true,
        }
    }
}

/// The fixed list of URLs made available offline.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetManifest {
    /// Application shell, icons, libraries and the binary payload.
    pub assets: Vec<ManifestEntry>,

    /// Web font URLs, precached after the primary list.
    #[serde(default)]
    pub fonts: Vec<String>,
}

impl AssetManifest {
    /// Primary entries followed by fonts.
    pub fn urls(&self) -> impl Iterator<Item = &str> {
        self.assets
            .iter()
            .map(|entry| entry.url.as_str())
            .chain(self.fonts.iter().map(String::as_str))
    }

    /// The entry flagged as the binary payload.
    pub fn binary_entry(&self) -> Option<&ManifestEntry> {
        self.assets.iter().find(|entry| entry.binary)
    }

    pub fn len(&self) -> usize {
        self.assets.len() + self.fonts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Resolve every entry against `origin`, in order.
    pub fn resolve(&self, origin: &Url) -> Result<Vec<Url>> {
        let mut seen = HashSet::new();
        let mut resolved = Vec::with_capacity(self.len());

        for raw in self.urls() {
            let url = resolve_url(origin, raw)?;
            if !seen.insert(url.clone()) {
                return Err(PrecacheError::config(format!(
                    "manifest lists {url} more than once"
                )));
            }
            resolved.push(url);
        }
        Ok(resolved)
    }
}

fn resolve_url(origin: &Url, raw: &str) -> Result<Url> {
    origin
        .join(raw)
        .map_err(|e| PrecacheError::config_with_source(format!("bad manifest url {raw:?}"), e))
}

/// Full agent configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Bucket name for this deployment. Must change on every deployment.
    pub version: String,

    /// Origin that root-relative URLs resolve against.
    pub origin: Url,

    /// Shell document served to offline navigations.
    #[serde(default = "default_shell")]
    pub shell: String,

    #[serde(flatten)]
    pub manifest: AssetManifest,
}

fn default_shell() -> String {
    "/index.html".to_string()
}

impl AgentConfig {
    /// Load and validate a JSON configuration file.
    pub fn load(path: &Path) -> Result<Self> {
        let config: AgentConfig = precache_common::load_json(path)?;
        config.validate()?;
        debug!(version = %config.version, entries = config.manifest.len(), "Agent config loaded");
        Ok(config)
    }

    /// Check the invariants the agent relies on.
    pub fn validate(&self) -> Result<()> {
        if self.version.trim().is_empty() {
            return Err(PrecacheError::config("version must not be empty"));
        }
        if self.manifest.is_empty() {
            return Err(PrecacheError::config("manifest must list at least one url"));
        }

        let binaries = self.manifest.assets.iter().filter(|e| e.binary).count();
        if binaries != 1 {
            return Err(PrecacheError::config(format!(
                "manifest must flag exactly one binary entry, found {binaries}"
            )));
        }

        let resolved = self.manifest.resolve(&self.origin)?;
        let shell = self.shell_url()?;
        if !resolved.contains(&shell) {
            return Err(PrecacheError::config(format!(
                "shell document {shell} is not in the manifest"
            )));
        }
        Ok(())
    }

    /// Resolved shell document URL.
    pub fn shell_url(&self) -> Result<Url> {
        resolve_url(&self.origin, &self.shell)
    }

    /// Resolved precache list: primary entries then fonts.
    pub fn precache_urls(&self) -> Result<Vec<Url>> {
        self.manifest.resolve(&self.origin)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn sample() -> AgentConfig {
        AgentConfig {
            version: "app-cache-v2".to_string(),
            origin: Url::parse("https://app.example").unwrap(),
            shell: "/index.html".to_string(),
            manifest: AssetManifest {
                assets: vec![
                    ManifestEntry::new("/index.html"),
                    ManifestEntry::new("/icon-192.png"),
                    ManifestEntry::binary("/engine.wasm"),
                ],
                fonts: vec!["https://fonts.example.net/inter.woff2".to_string()],
            },
        }
    }

    #[test]
    fn test_urls_order() {
        let config = sample();
        let urls = config.precache_urls().unwrap();
        let urls: Vec<&str> = urls.iter().map(Url::as_str).collect();
        assert_eq!(
            urls,
            vec![
                "https://app.example/index.html",
                "https://app.example/icon-192.png",
                "https://app.example/engine.wasm",
                "https://fonts.example.net/inter.woff2",
            ]
        );
    }

    #[test]
    fn test_binary_entry() {
        let config = sample();
        assert_eq!(config.manifest.binary_entry().unwrap().url, "/engine.wasm");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_requires_one_binary() {
        let mut config = sample();
        config.manifest.assets.push(ManifestEntry::binary("/other.wasm"));
        assert!(config.validate().is_err());

        config.manifest.assets.retain(|e| !e.binary);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_duplicates() {
        let mut config = sample();
        config
            .manifest
            .fonts
            .push("https://app.example/index.html".to_string());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_requires_shell_in_manifest() {
        let mut config = sample();
        config.shell = "/offline.html".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_empty_version() {
        let mut config = sample();
        config.version = "  ".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_from_json() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{
                "version": "app-cache-v1",
                "origin": "https://app.example",
                "assets": [
                    {{ "url": "/index.html" }},
                    {{ "url": "/engine.wasm", "binary": true }}
                ],
                "fonts": ["/fonts/inter.woff2"]
            }}"#
        )
        .unwrap();

        let config = AgentConfig::load(file.path()).unwrap();
        assert_eq!(config.version, "app-cache-v1");
        assert_eq!(config.shell, "/index.html");
        assert_eq!(config.manifest.len(), 3);
    }
}
