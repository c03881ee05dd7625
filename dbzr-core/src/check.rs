//! Integrity checking and parent reconciliation for pack repositories.

use crate::errors::{BzrError, Result};
use crate::graph_index::GraphIndexRead;
use crate::key::{Key, RevisionId, display_id, is_null};
use crate::model::sha_string;
use crate::pack::IndexKind;
use crate::pack_repository::PackRepository;
use crate::packer::{Packer, PackerMode};
use crate::repository::Repository;
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use tracing::{info, warn};

/// Everything `check` found, itemized rather than stopping at the first
/// problem.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CheckReport {
    pub revisions_checked: usize,
    pub texts_checked: usize,
    /// `(revision, ghost parent)`
    pub ghost_parents: Vec<(RevisionId, RevisionId)>,
    pub inventory_sha_mismatches: Vec<RevisionId>,
    pub text_sha_mismatches: Vec<Key>,
    pub missing_texts: Vec<Key>,
    /// `(text key, stored parents, parents implied by the revision graph)`
    pub inconsistent_parents: Vec<(Key, Vec<Key>, Vec<Key>)>,
    /// Deltas whose basis is not stored in the repository.
    pub dangling_compression_parents: Vec<(IndexKind, Key)>,
}

impl CheckReport {
    /// Ghosts are tolerated; everything else is damage.
    pub fn is_clean(&self) -> bool {
        self.inventory_sha_mismatches.is_empty()
            && self.text_sha_mismatches.is_empty()
            && self.missing_texts.is_empty()
            && self.inconsistent_parents.is_empty()
            && self.dangling_compression_parents.is_empty()
    }
}

impl fmt::Display for CheckReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "checked {} revisions, {} texts", self.revisions_checked, self.texts_checked)?;
        for (revision, ghost) in &self.ghost_parents {
            writeln!(f, "  ghost parent {} of {}", display_id(ghost), display_id(revision))?;
        }
        for revision in &self.inventory_sha_mismatches {
            writeln!(f, "  inventory hash mismatch for {}", display_id(revision))?;
        }
        for key in &self.text_sha_mismatches {
            writeln!(f, "  text hash mismatch for {}", key)?;
        }
        for key in &self.missing_texts {
            writeln!(f, "  missing text {}", key)?;
        }
        for (key, stored, ideal) in &self.inconsistent_parents {
            writeln!(f, "  {} has parents {:?}, expected {:?}", key, stored, ideal)?;
        }
        for (kind, key) in &self.dangling_compression_parents {
            writeln!(f, "  {:?} record {} has a missing compression parent", kind, key)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileResult {
    pub fixed_texts: usize,
    pub packs_rewritten: usize,
}

fn dangling_compression_parents(repo: &mut PackRepository) -> Result<Vec<(IndexKind, Key)>> {
    let mut dangling = Vec::new();
    for kind in [IndexKind::Inventory, IndexKind::Text] {
        let entries = repo.collection_mut().combined(kind).iter_all_entries()?;
        let present: BTreeSet<&Key> = entries.iter().map(|e| &e.key).collect();
        for entry in &entries {
            if let Some(basis) = entry.refs.get(1).and_then(|r| r.first()) {
                if !present.contains(basis) {
                    dangling.push((kind, entry.key.clone()));
                }
            }
        }
    }
    Ok(dangling)
}

fn inconsistent_parents(repo: &mut PackRepository, text_keys: &[Key]) -> Result<Vec<(Key, Vec<Key>, Vec<Key>)>> {
    let serializer = Arc::clone(repo.serializer());
    let collection = repo.collection_mut();
    let packs = collection.all_packs()?;
    let ideal = Packer::new(collection, packs, PackerMode::Reconcile, None, serializer).inconsistent_text_parents(text_keys)?;
    let keys: BTreeSet<Key> = ideal.keys().cloned().collect();
    let stored = collection.get_entries(IndexKind::Text, &keys)?;
    Ok(stored
        .into_iter()
        .filter_map(|entry| {
            let wanted = ideal.get(&entry.key)?.clone();
            let parents = entry.refs.into_iter().next().unwrap_or_default();
            Some((entry.key, parents, wanted))
        })
        .collect())
}

/// Walk every revision stored locally and verify what it references.
pub(crate) fn check_pack_repository(repo: &mut PackRepository) -> Result<CheckReport> {
    repo.ensure_loaded()?;
    let mut report = CheckReport::default();
    let revision_ids = repo.local_revision_ids()?;
    let parent_map = repo.local_parent_map(&revision_ids)?;
    let referenced: BTreeSet<RevisionId> = parent_map
        .values()
        .flatten()
        .filter(|p| !is_null(p) && !revision_ids.contains(*p))
        .cloned()
        .collect();
    let known = repo.get_parent_map(&referenced)?;

    let mut text_keys = Vec::new();
    for revision_id in &revision_ids {
        report.revisions_checked += 1;
        for parent in parent_map.get(revision_id).into_iter().flatten() {
            if !is_null(parent) && !revision_ids.contains(parent) && !known.contains_key(parent) {
                report.ghost_parents.push((revision_id.clone(), parent.clone()));
            }
        }
        let revision = match repo.get_revision(revision_id) {
            Ok(revision) => revision,
            Err(e) => {
                warn!("cannot read revision {}: {}", display_id(revision_id), e);
                report.inventory_sha_mismatches.push(revision_id.clone());
                continue;
            }
        };
        let inventory = match repo.get_inventory(revision_id) {
            Ok(inventory) => inventory,
            Err(e) => {
                warn!("cannot read inventory {}: {}", display_id(revision_id), e);
                report.inventory_sha_mismatches.push(revision_id.clone());
                continue;
            }
        };
        if !revision.inventory_sha.is_empty() && inventory.sha()? != revision.inventory_sha {
            report.inventory_sha_mismatches.push(revision_id.clone());
        }
        for entry in inventory.entries.values() {
            if !entry.has_text() || entry.revision != *revision_id {
                continue;
            }
            let key = Key::text(&entry.file_id, revision_id);
            report.texts_checked += 1;
            let text = match repo.local_fulltext(IndexKind::Text, &key) {
                Ok(Some(text)) => Some(text),
                Ok(None) if repo.has_fallbacks() => match repo.get_file_text(&key) {
                    Ok(text) => Some(text),
                    Err(BzrError::RevisionNotPresent { .. }) => None,
                    Err(e) => return Err(e),
                },
                Ok(None) => None,
                // Broken chains are reported as dangling compression parents.
                Err(BzrError::BzrCheckError(_)) => continue,
                Err(BzrError::InvalidRecord(_)) => {
                    report.text_sha_mismatches.push(key);
                    continue;
                }
                Err(e) => return Err(e),
            };
            match text {
                Some(text) => {
                    if entry.text_sha.as_ref().is_some_and(|sha| *sha != sha_string(&text)) {
                        report.text_sha_mismatches.push(key.clone());
                    }
                    text_keys.push(key);
                }
                None => report.missing_texts.push(key),
            }
        }
    }
    report.dangling_compression_parents = dangling_compression_parents(repo)?;
    report.inconsistent_parents = inconsistent_parents(repo, &text_keys)?;
    info!(
        "checked {} revisions and {} texts in {}",
        report.revisions_checked,
        report.texts_checked,
        repo.base()
    );
    Ok(report)
}

/// Rewrite every pack with the text parents the revision graph implies.
/// Does nothing when all parents are already consistent.
pub(crate) fn reconcile_pack_repository(repo: &mut PackRepository) -> Result<ReconcileResult> {
    repo.ensure_loaded()?;
    if repo.is_in_write_group() {
        return Err(BzrError::BzrCheckError(format!(
            "cannot reconcile {} inside a write group",
            repo.base()
        )));
    }
    let text_keys: Vec<Key> = repo
        .collection_mut()
        .combined(IndexKind::Text)
        .iter_all_entries()?
        .into_iter()
        .map(|e| e.key)
        .collect();
    let inconsistent = inconsistent_parents(repo, &text_keys)?;
    if inconsistent.is_empty() {
        info!("{} needs no reconciling", repo.base());
        return Ok(ReconcileResult::default());
    }
    let serializer = Arc::clone(repo.serializer());
    let collection = repo.collection_mut();
    let packs = collection.all_packs()?;
    let total = collection.total_revisions()?;
    let packs_rewritten = packs.len();
    collection.execute_pack_operations(vec![(total, packs)], PackerMode::Reconcile, &serializer)?;
    info!("reconciled {} texts by rewriting {} packs", inconsistent.len(), packs_rewritten);
    Ok(ReconcileResult {
        fixed_texts: inconsistent.len(),
        packs_rewritten,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Inventory, InventoryEntry, Revision};
    use crate::repository::RepositoryFormat;
    use crate::transport::{MemoryTransport, Transport};

    fn commit(repo: &mut PackRepository, id: &str, parents: &[&str], text_parents: &[&str], content: &str) {
        let rev = id.as_bytes();
        repo.start_write_group().unwrap();
        let mut inv = Inventory::new(rev);
        inv.root_id = Some(b"root".to_vec());
        inv.add(InventoryEntry::directory(b"root", None, "", b"r1"));
        inv.add(InventoryEntry::file(b"f", b"root", "f", rev, content.as_bytes()));
        let parent_keys: Vec<Key> = text_parents.iter().map(|p| Key::text(b"f", p.as_bytes())).collect();
        repo.add_text(&Key::text(b"f", rev), &parent_keys, content.as_bytes()).unwrap();
        let parent_ids: Vec<RevisionId> = parents.iter().map(|p| p.as_bytes().to_vec()).collect();
        repo.add_inventory(&inv, &parent_ids).unwrap();
        let mut revision = Revision::new(rev, parent_ids, "tester", "msg");
        revision.inventory_sha = inv.sha().unwrap();
        repo.add_revision(&revision).unwrap();
        repo.commit_write_group().unwrap();
    }

    fn new_repository() -> PackRepository {
        let t: Arc<dyn Transport> = Arc::new(MemoryTransport::new());
        PackRepository::create(t, &RepositoryFormat::default()).unwrap()
    }

    #[test]
    fn test_clean_repository() {
        let mut repo = new_repository();
        repo.lock_write(None).unwrap();
        commit(&mut repo, "r1", &[], &[], "one\n");
        commit(&mut repo, "r2", &["r1"], &["r1"], "two\n");
        repo.unlock().unwrap();

        let report = repo.check().unwrap();
        assert!(report.is_clean(), "{}", report);
        assert_eq!(report.revisions_checked, 2);
        assert_eq!(report.texts_checked, 2);
        assert_eq!(repo.reconcile().unwrap(), ReconcileResult::default());
    }

    #[test]
    fn test_ghost_parent_reported_but_clean() {
        let mut repo = new_repository();
        repo.lock_write(None).unwrap();
        commit(&mut repo, "r1", &["ghost"], &[], "one\n");
        repo.unlock().unwrap();

        let report = repo.check().unwrap();
        assert_eq!(report.ghost_parents, vec![(b"r1".to_vec(), b"ghost".to_vec())]);
        assert!(report.is_clean());
    }

    #[test]
    fn test_reconcile_fixes_text_parents() {
        let mut repo = new_repository();
        repo.lock_write(None).unwrap();
        commit(&mut repo, "r1", &[], &[], "one\n");
        // The text claims no parents although r1 changed the same file.
        commit(&mut repo, "r2", &["r1"], &[], "two\n");
        repo.unlock().unwrap();

        let report = repo.check().unwrap();
        assert_eq!(report.inconsistent_parents.len(), 1);
        let (key, stored, ideal) = &report.inconsistent_parents[0];
        assert_eq!(*key, Key::text(b"f", b"r2"));
        assert!(stored.is_empty());
        assert_eq!(*ideal, vec![Key::text(b"f", b"r1")]);

        let result = repo.reconcile().unwrap();
        assert_eq!(result.fixed_texts, 1);
        assert_eq!(result.packs_rewritten, 2);
        assert!(repo.check().unwrap().is_clean());

        repo.lock_read().unwrap();
        assert_eq!(repo.pack_names().unwrap().len(), 1);
        assert_eq!(repo.get_file_text(&Key::text(b"f", b"r2")).unwrap(), b"two\n");
        repo.unlock().unwrap();
    }
}
