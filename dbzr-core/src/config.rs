//! Repository and branch configuration.
//!
//! Both are small JSON documents stored next to the data they configure
//! (`repository.json` in the repository directory, `branch.json` in the
//! branch directory). A missing file means defaults.

use crate::errors::Result;
use crate::transport::Transport;
use serde::{Deserialize, Serialize};

pub const REPOSITORY_CONFIG_FILE: &str = "repository.json";
pub const BRANCH_CONFIG_FILE: &str = "branch.json";

/// Tunables for a pack repository, stored at `repository/repository.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepositoryConfig {
    /// Bytes buffered by a pack writer before touching the transport.
    #[serde(default = "default_pack_cache_limit")]
    pub pack_cache_limit: usize,
    /// Whether committing a write group may trigger autopack.
    #[serde(default = "default_true")]
    pub autopack: bool,
    /// Longest delta chain written before a fulltext is forced.
    #[serde(default = "default_max_delta_chain")]
    pub max_delta_chain: usize,
    /// Revisions examined per round when searching for missing revisions.
    #[serde(default = "default_fetch_batch_size")]
    pub fetch_batch_size: usize,
}

fn default_pack_cache_limit() -> usize {
    1024 * 1024
}

fn default_true() -> bool {
    true
}

fn default_max_delta_chain() -> usize {
    100
}

fn default_fetch_batch_size() -> usize {
    50
}

impl Default for RepositoryConfig {
    fn default() -> Self {
        Self {
            pack_cache_limit: default_pack_cache_limit(),
            autopack: true,
            max_delta_chain: default_max_delta_chain(),
            fetch_batch_size: default_fetch_batch_size(),
        }
    }
}

impl RepositoryConfig {
    /// Load from a repository transport, falling back to defaults.
    pub fn load(transport: &dyn Transport) -> Result<Self> {
        load_json(transport, REPOSITORY_CONFIG_FILE)
    }

    pub fn save(&self, transport: &dyn Transport) -> Result<()> {
        save_json(transport, REPOSITORY_CONFIG_FILE, self)
    }
}

/// Per-branch settings, stored at `branch/branch.json`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BranchConfig {
    /// URL of the branch whose repository this branch is stacked on.
    #[serde(default)]
    pub stacked_on_location: Option<String>,
    /// Whether the branch refuses a tip that is not a descendant.
    #[serde(default)]
    pub append_revisions_only: bool,
}

impl BranchConfig {
    pub fn load(transport: &dyn Transport) -> Result<Self> {
        load_json(transport, BRANCH_CONFIG_FILE)
    }

    pub fn save(&self, transport: &dyn Transport) -> Result<()> {
        save_json(transport, BRANCH_CONFIG_FILE, self)
    }
}

fn load_json<T>(transport: &dyn Transport, name: &str) -> Result<T>
where
    T: Default + for<'de> Deserialize<'de>,
{
    match transport.get_bytes(name) {
        Ok(data) => Ok(serde_json::from_slice(&data)?),
        Err(e) if e.is_no_such_file() => Ok(T::default()),
        Err(e) => Err(e),
    }
}

fn save_json<T: Serialize>(transport: &dyn Transport, name: &str, value: &T) -> Result<()> {
    let data = serde_json::to_vec_pretty(value)?;
    transport.put_bytes(name, &data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MemoryTransport;

    #[test]
    fn test_missing_config_is_default() {
        let t = MemoryTransport::new();
        let config = RepositoryConfig::load(&t).unwrap();
        assert_eq!(config, RepositoryConfig::default());
        assert_eq!(config.fetch_batch_size, 50);
    }

    #[test]
    fn test_partial_config_uses_field_defaults() {
        let t = MemoryTransport::new();
        t.put_bytes(REPOSITORY_CONFIG_FILE, br#"{"autopack": false}"#).unwrap();
        let config = RepositoryConfig::load(&t).unwrap();
        assert!(!config.autopack);
        assert_eq!(config.pack_cache_limit, 1024 * 1024);
    }

    #[test]
    fn test_branch_config_roundtrip() {
        let t = MemoryTransport::new();
        let config = BranchConfig {
            stacked_on_location: Some("../trunk".to_string()),
            append_revisions_only: false,
        };
        config.save(&t).unwrap();
        assert_eq!(BranchConfig::load(&t).unwrap(), config);
    }
}
