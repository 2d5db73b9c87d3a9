//! JSON configuration loading.

use serde::de::DeserializeOwned;
use std::path::Path;
use tracing::debug;

use crate::{PrecacheError, Result};

/// Read and deserialize a JSON configuration file.
pub fn load_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let raw = std::fs::read_to_string(path).map_err(|e| {
        PrecacheError::config_with_source(format!("cannot read {}", path.display()), e)
    })?;

    let value = serde_json::from_str(&raw).map_err(|e| {
        PrecacheError::config_with_source(format!("invalid JSON in {}", path.display()), e)
    })?;

    debug!(path = %path.display(), bytes = raw.len(), "Loaded configuration");
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use std::io::Write;

    #[derive(Debug, Deserialize)]
    struct Sample {
        version: String,
    }

    #[test]
    fn test_load_json() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"version": "v2"}}"#).unwrap();

        let sample: Sample = load_json(file.path()).unwrap();
        assert_eq!(sample.version, "v2");
    }

    #[test]
    fn test_load_json_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let result: Result<Sample> = load_json(&dir.path().join("absent.json"));
        assert!(matches!(result, Err(PrecacheError::Config { .. })));
    }

    #[test]
    fn test_load_json_invalid() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "not json").unwrap();

        let result: Result<Sample> = load_json(file.path());
        assert!(matches!(result, Err(PrecacheError::Config { .. })));
    }
}
