//! Server configuration, read from an optional JSON file.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const DEFAULT_LISTEN: &str = "127.0.0.1:4155";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to accept connections on.
    pub listen: String,
    /// Directory whose control directories are served.
    pub root: PathBuf,
    /// Verbs answered with `UnknownMethod`, to behave like an older server.
    pub disabled_verbs: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: DEFAULT_LISTEN.to_string(),
            root: PathBuf::from("."),
            disabled_verbs: Vec::new(),
        }
    }
}

impl ServerConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read server config {}", path.display()))?;
        serde_json::from_str(&text).with_context(|| format!("invalid server config {}", path.display()))
    }

    /// Load `path` if given, defaults otherwise.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load(path),
            None => Ok(Self::default()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_fields_use_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("server.json");
        std::fs::write(&path, r#"{"root": "/srv/dbzr", "disabled_verbs": ["Repository.get_stream_1.19"]}"#).unwrap();
        let config = ServerConfig::load(&path).unwrap();
        assert_eq!(config.listen, DEFAULT_LISTEN);
        assert_eq!(config.root, PathBuf::from("/srv/dbzr"));
        assert_eq!(config.disabled_verbs, vec!["Repository.get_stream_1.19".to_string()]);
    }

    #[test]
    fn test_bad_config() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("server.json");
        std::fs::write(&path, "not json").unwrap();
        assert!(ServerConfig::load(&path).is_err());
        assert!(ServerConfig::load(&dir.path().join("absent.json")).is_err());
        assert_eq!(ServerConfig::load_or_default(None).unwrap(), ServerConfig::default());
    }
}
