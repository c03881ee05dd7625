//! The repository contract shared by local pack repositories and remote
//! proxies.
//!
//! A repository stores four keyspaces (revisions, inventories, texts and
//! signatures). Reads need a lock; writes need a write lock and an open write
//! group. Fallback repositories are consulted, in order, for anything the
//! repository itself does not have.

use crate::check::{CheckReport, ReconcileResult};
use crate::errors::{BzrError, Result};
use crate::graph::{ParentsProvider, SearchResult, find_ancestry};
use crate::key::{Key, ParentMap, RevisionId};
use crate::model::{Inventory, Revision, Serializer, get_serializer};
use crate::record::{Stream, SubstreamKind};
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

pub const DEFAULT_SERIALIZER: &str = "bincode-v1";
const NETWORK_NAME_PREFIX: &str = "dbzr-pack-1/";

/// Keys a sink could not complete, by substream kind.
pub type MissingKeys = BTreeSet<(SubstreamKind, Key)>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    Read,
    Write,
}

/// What a repository stores and how, identified on the wire by its network
/// name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepositoryFormat {
    pub network_name: String,
    pub serializer: String,
    pub rich_root_data: bool,
    pub supports_tree_reference: bool,
    pub supports_external_lookups: bool,
}

impl RepositoryFormat {
    pub fn new(serializer: &str) -> Result<Self> {
        get_serializer(serializer)?;
        Ok(Self {
            network_name: format!("{}{}", NETWORK_NAME_PREFIX, serializer),
            serializer: serializer.to_string(),
            rich_root_data: true,
            supports_tree_reference: false,
            supports_external_lookups: true,
        })
    }

    pub fn from_network_name(name: &str) -> Result<Self> {
        let serializer = name
            .trim()
            .strip_prefix(NETWORK_NAME_PREFIX)
            .ok_or_else(|| BzrError::UnknownFormat(name.to_string()))?;
        Self::new(serializer)
    }

    pub fn serializer(&self) -> Result<Arc<dyn Serializer>> {
        get_serializer(&self.serializer)
    }

    /// Whether records from `other` can be used without conversion, which
    /// stacking requires.
    pub fn same_model(&self, other: &RepositoryFormat) -> bool {
        self.serializer == other.serializer && self.rich_root_data == other.rich_root_data
    }
}

impl Default for RepositoryFormat {
    fn default() -> Self {
        Self {
            network_name: format!("{}{}", NETWORK_NAME_PREFIX, DEFAULT_SERIALIZER),
            serializer: DEFAULT_SERIALIZER.to_string(),
            rich_root_data: true,
            supports_tree_reference: false,
            supports_external_lookups: true,
        }
    }
}

/// Outcome of a revno lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RevnoLookup {
    Found(RevisionId),
    /// The walk left the repository's history at `(revno, revision_id)`;
    /// a fallback has to continue from there.
    History(u64, RevisionId),
}

pub trait Repository: fmt::Debug {
    fn base(&self) -> String;

    fn format(&self) -> RepositoryFormat;

    // ==================== Locking ====================

    fn lock_read(&mut self) -> Result<()>;

    /// Take (or, with `token`, re-enter) the write lock. Returns the token.
    fn lock_write(&mut self, token: Option<&str>) -> Result<Option<String>>;

    fn unlock(&mut self) -> Result<()>;

    fn lock_mode(&self) -> Option<LockMode>;

    fn lock_token(&self) -> Option<String>;

    fn leave_lock_in_place(&mut self) -> Result<()>;

    fn dont_leave_lock_in_place(&mut self) -> Result<()>;

    fn is_locked(&self) -> bool {
        self.lock_mode().is_some()
    }

    fn is_write_locked(&self) -> bool {
        self.lock_mode() == Some(LockMode::Write)
    }

    // ==================== Write groups ====================

    fn start_write_group(&mut self) -> Result<()>;

    /// Returns the names of the packs added (a hint for `pack`).
    fn commit_write_group(&mut self) -> Result<Vec<String>>;

    /// With `suppress_errors` a failure is logged instead of returned.
    fn abort_write_group(&mut self, suppress_errors: bool) -> Result<()>;

    fn suspend_write_group(&mut self) -> Result<Vec<String>>;

    fn resume_write_group(&mut self, tokens: &[String]) -> Result<()>;

    fn is_in_write_group(&self) -> bool;

    // ==================== Stacking ====================

    fn add_fallback_repository(&mut self, repository: Box<dyn Repository>) -> Result<()>;

    fn has_fallbacks(&self) -> bool;

    /// Detach and return every fallback.
    fn take_fallback_repositories(&mut self) -> Vec<Box<dyn Repository>>;

    /// A fresh, unlocked instance over the same storage, without fallbacks.
    fn reopen(&self) -> Result<Box<dyn Repository>>;

    // ==================== Reading ====================

    /// Parents of each present revision. Revisions without parents map to
    /// `[null:]`, and `null:` itself maps to `[]`. Absent ids are omitted.
    fn get_parent_map(&mut self, revision_ids: &BTreeSet<RevisionId>) -> Result<ParentMap>;

    fn all_revision_ids(&mut self) -> Result<BTreeSet<RevisionId>>;

    fn has_revisions(&mut self, revision_ids: &BTreeSet<RevisionId>) -> Result<BTreeSet<RevisionId>> {
        Ok(self.get_parent_map(revision_ids)?.into_keys().collect())
    }

    fn has_revision(&mut self, revision_id: &[u8]) -> Result<bool> {
        let query: BTreeSet<RevisionId> = [revision_id.to_vec()].into_iter().collect();
        Ok(!self.has_revisions(&query)?.is_empty())
    }

    fn get_revision(&mut self, revision_id: &[u8]) -> Result<Revision>;

    fn get_inventory(&mut self, revision_id: &[u8]) -> Result<Inventory>;

    /// Fulltext of a `(file_id, revision_id)` text.
    fn get_file_text(&mut self, key: &Key) -> Result<Vec<u8>>;

    fn get_signature_text(&mut self, revision_id: &[u8]) -> Result<Vec<u8>>;

    fn has_signature_for_revision_id(&mut self, revision_id: &[u8]) -> Result<bool> {
        match self.get_signature_text(revision_id) {
            Ok(_) => Ok(true),
            Err(BzrError::NoSuchRevision { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Walk back from `known` (a `(revno, revision_id)` pair) to `revno`.
    fn get_rev_id_for_revno(&mut self, revno: u64, known: (u64, &[u8])) -> Result<RevnoLookup>;

    // ==================== Writing ====================

    /// Store a text. Returns its hash.
    fn add_text(&mut self, key: &Key, parents: &[Key], text: &[u8]) -> Result<String>;

    /// Store an inventory for `inventory.revision_id`. Returns its hash.
    fn add_inventory(&mut self, inventory: &Inventory, parents: &[RevisionId]) -> Result<String>;

    fn add_revision(&mut self, revision: &Revision) -> Result<()>;

    fn add_signature_text(&mut self, revision_id: &[u8], signature: &[u8]) -> Result<()>;

    // ==================== Streams ====================

    /// Substreams holding everything `search` selects, shaped for a target
    /// of `to_format`.
    fn get_stream(&mut self, search: &SearchResult, to_format: &RepositoryFormat) -> Result<Stream>;

    /// Fulltext records for keys a sink reported missing.
    fn get_stream_for_missing_keys(&mut self, missing: &MissingKeys, to_format: &RepositoryFormat) -> Result<Stream>;

    /// Insert a stream inside a write group (resumed from `resume_tokens` if
    /// given). Returns `(tokens, missing)` with the group suspended when
    /// keys are missing, or `([], {})` after committing.
    fn insert_stream(
        &mut self,
        stream: Stream,
        src_format: &RepositoryFormat,
        resume_tokens: &[String],
    ) -> Result<(Vec<String>, MissingKeys)>;

    // ==================== Maintenance ====================

    fn pack(&mut self, hint: Option<&[String]>, clean_obsolete: bool) -> Result<()>;

    fn check(&mut self) -> Result<CheckReport>;

    fn reconcile(&mut self) -> Result<ReconcileResult>;
}

/// Graph access to a repository.
pub struct RepositoryGraph<'a>(pub &'a mut dyn Repository);

impl ParentsProvider for RepositoryGraph<'_> {
    fn get_parent_map(&mut self, revision_ids: &BTreeSet<RevisionId>) -> Result<ParentMap> {
        self.0.get_parent_map(revision_ids)
    }
}

/// The revisions `search` selects in `repository`.
pub fn search_keys(repository: &mut dyn Repository, search: &SearchResult) -> Result<BTreeSet<RevisionId>> {
    match search {
        SearchResult::Everything => repository.all_revision_ids(),
        SearchResult::PendingAncestry { heads } => {
            let mut graph = RepositoryGraph(repository);
            Ok(find_ancestry(&mut graph, heads)?.into_keys().collect())
        }
        SearchResult::Search { keys, .. } => Ok(keys.clone()),
    }
}

/// Check that `fallback` may back a repository of `format`.
pub fn check_fallback_compatible(base: &str, format: &RepositoryFormat, fallback: &dyn Repository) -> Result<()> {
    if !format.supports_external_lookups {
        return Err(BzrError::UnstackableRepositoryFormat {
            format: format.network_name.clone(),
            url: base.to_string(),
        });
    }
    let other = fallback.format();
    if !format.same_model(&other) {
        return Err(BzrError::IncompatibleRepositories {
            source_repo: fallback.base(),
            target_repo: base.to_string(),
            details: format!(": different serializers ({} vs {})", other.serializer, format.serializer),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_network_name() {
        let format = RepositoryFormat::new("json-v1").unwrap();
        assert_eq!(format.network_name, "dbzr-pack-1/json-v1");
        assert_eq!(RepositoryFormat::from_network_name(&format.network_name).unwrap(), format);
        assert!(matches!(
            RepositoryFormat::from_network_name("dbzr-pack-1/xml5"),
            Err(BzrError::UnknownFormat(_))
        ));
        assert!(RepositoryFormat::from_network_name("svn").is_err());
    }

    #[test]
    fn test_same_model() {
        let a = RepositoryFormat::default();
        let b = RepositoryFormat::new("json-v1").unwrap();
        assert!(a.same_model(&a.clone()));
        assert!(!a.same_model(&b));
    }
}
