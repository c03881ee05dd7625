//! Copy records from a set of packs into one new pack.
//!
//! Three flavours share the copy loop:
//!
//! - `Normal` copies raw records untouched, expanding a delta only when its
//!   basis would not survive the operation.
//! - `Optimising` writes revisions newest first and every record as a
//!   fulltext.
//! - `Reconcile` additionally rewrites texts whose stored parents disagree
//!   with the parents implied by the revision graph.

use crate::container;
use crate::errors::{BzrError, Result};
use crate::graph::{DictParentsProvider, find_ancestry, topo_sort};
use crate::graph_index::{GraphIndexRead, IndexEntry};
use crate::key::{Key, ParentMap, RevisionId};
use crate::model::{Inventory, Serializer, sha_string};
use crate::pack::{ExistingPack, IndexKind, NewPack, parse_index_value};
use crate::pack_collection::{PackCollection, finished_identity};
use crate::record::encode_stored;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PackerMode {
    Normal,
    Optimising,
    Reconcile,
}

/// Entry of a source pack, by position in the packer's pack list.
type SourceEntry = (usize, IndexEntry);

pub struct Packer<'a> {
    collection: &'a mut PackCollection,
    packs: Vec<Arc<ExistingPack>>,
    mode: PackerMode,
    revision_ids: Option<BTreeSet<RevisionId>>,
    serializer: Arc<dyn Serializer>,
    source_names: BTreeSet<String>,
    inventories: HashMap<RevisionId, Inventory>,
    fixed_texts: usize,
}

impl<'a> Packer<'a> {
    /// `revision_ids` limits the copy to those revisions and the inventories,
    /// texts and signatures they introduced.
    pub fn new(
        collection: &'a mut PackCollection,
        packs: Vec<Arc<ExistingPack>>,
        mode: PackerMode,
        revision_ids: Option<BTreeSet<RevisionId>>,
        serializer: Arc<dyn Serializer>,
    ) -> Self {
        let source_names = packs.iter().map(|p| p.name().to_string()).collect();
        Self {
            collection,
            packs,
            mode,
            revision_ids,
            serializer,
            source_names,
            inventories: HashMap::new(),
            fixed_texts: 0,
        }
    }

    /// Number of texts whose parents a reconcile pass rewrote.
    pub fn fixed_texts(&self) -> usize {
        self.fixed_texts
    }

    /// Build and register the new pack. Returns its name, or `None` when
    /// nothing was copied.
    pub fn pack(&mut self) -> Result<Option<String>> {
        if self.collection.is_in_write_group() {
            return Err(BzrError::BzrCheckError(
                "pack() called while another pack is being written".into(),
            ));
        }
        if self.revision_ids.as_ref().is_some_and(BTreeSet::is_empty) {
            return Ok(None);
        }
        let mut new_pack = NewPack::new(self.collection.transport(), self.collection.config().pack_cache_limit)?;
        match self.copy_all(&mut new_pack) {
            Ok(()) => {}
            Err(e) => {
                new_pack.abort()?;
                return Err(e);
            }
        }
        if !new_pack.data_inserted() {
            new_pack.abort()?;
            return Ok(None);
        }
        new_pack.finish(false)?;
        let (name, sizes) = finished_identity(&new_pack)?;
        info!("packed {} packs into {} ({:?} mode)", self.packs.len(), name, self.mode);
        self.collection.allocate(&name, sizes)?;
        Ok(Some(name))
    }

    fn copy_all(&mut self, new_pack: &mut NewPack) -> Result<()> {
        let revision_keys: Option<BTreeSet<Key>> = self
            .revision_ids
            .as_ref()
            .map(|ids| ids.iter().map(|id| Key::revision(id)).collect());

        let mut revisions = self.source_entries(IndexKind::Revision, revision_keys.as_ref())?;
        if self.mode == PackerMode::Optimising {
            revisions = newest_first(revisions)?;
        }
        self.copy_records(IndexKind::Revision, revisions, new_pack, &BTreeMap::new())?;

        let inventories = self.source_entries(IndexKind::Inventory, revision_keys.as_ref())?;
        let text_filter = match self.revision_ids.clone() {
            Some(ids) => Some(self.text_filter(&ids)?),
            None => None,
        };
        self.copy_records(IndexKind::Inventory, self.ordered(inventories), new_pack, &BTreeMap::new())?;

        let texts = self.source_entries(IndexKind::Text, text_filter.as_ref())?;
        let ideal_parents = if self.mode == PackerMode::Reconcile {
            let wanted: Vec<Key> = texts.iter().map(|(_, e)| e.key.clone()).collect();
            self.inconsistent_text_parents(&wanted)?
        } else {
            BTreeMap::new()
        };
        self.fixed_texts = ideal_parents.len();
        self.copy_records(IndexKind::Text, self.ordered(texts), new_pack, &ideal_parents)?;

        let signatures = self.source_entries(IndexKind::Signature, revision_keys.as_ref())?;
        self.copy_records(IndexKind::Signature, self.ordered(signatures), new_pack, &BTreeMap::new())
    }

    fn ordered(&self, mut entries: Vec<SourceEntry>) -> Vec<SourceEntry> {
        if self.mode == PackerMode::Optimising {
            entries.sort_by(|a, b| a.1.key.cmp(&b.1.key));
        }
        entries
    }

    /// Entries of `kind` across the source packs, first pack wins.
    fn source_entries(&self, kind: IndexKind, keys: Option<&BTreeSet<Key>>) -> Result<Vec<SourceEntry>> {
        let mut seen = BTreeSet::new();
        let mut result = Vec::new();
        for (position, pack) in self.packs.iter().enumerate() {
            let index = pack.index(kind);
            let entries = match keys {
                Some(keys) => index.iter_entries(keys)?,
                None => index.iter_all_entries()?,
            };
            for entry in entries {
                if seen.insert(entry.key.clone()) {
                    result.push((position, entry));
                }
            }
        }
        Ok(result)
    }

    /// Raw records for `entries`, read per pack in offset order.
    fn read_entries(&self, entries: &[SourceEntry]) -> Result<Vec<Vec<u8>>> {
        let mut groups: BTreeMap<usize, Vec<(usize, u64, u64)>> = BTreeMap::new();
        for (i, (position, entry)) in entries.iter().enumerate() {
            let (offset, length) = parse_index_value(&entry.value)?;
            groups.entry(*position).or_default().push((i, offset, length));
        }
        let mut out = vec![Vec::new(); entries.len()];
        for (position, mut group) in groups {
            group.sort_by_key(|&(_, offset, _)| offset);
            let offsets: Vec<(u64, u64)> = group.iter().map(|&(_, o, l)| (o, l)).collect();
            let data = self.packs[position].readv(&offsets)?;
            for ((i, _, _), bytes) in group.into_iter().zip(data) {
                out[i] = bytes;
            }
        }
        Ok(out)
    }

    fn copy_records(
        &mut self,
        kind: IndexKind,
        entries: Vec<SourceEntry>,
        new_pack: &mut NewPack,
        new_parents: &BTreeMap<Key, Vec<Key>>,
    ) -> Result<()> {
        let output_keys: BTreeSet<Key> = entries.iter().map(|(_, e)| e.key.clone()).collect();
        let raw_records = self.read_entries(&entries)?;
        let mut expanded = 0;
        for ((_, entry), raw) in entries.into_iter().zip(raw_records) {
            let (stored_key, _) = container::decode_record(&raw)?;
            if stored_key != entry.key {
                return Err(BzrError::InvalidRecord(format!(
                    "index points {} at a record for {}",
                    entry.key, stored_key
                )));
            }
            let basis = entry.refs.get(1).and_then(|r| r.first());
            let mut rewrite = new_parents.contains_key(&entry.key);
            if let Some(basis) = basis {
                rewrite |= self.mode == PackerMode::Optimising
                    || (!output_keys.contains(basis)
                        && !self.collection.has_key_outside(kind, basis, &self.source_names)?);
            }
            if !rewrite {
                new_pack.add_raw_record(kind, entry.key, entry.refs, &raw)?;
                continue;
            }
            let (_, text) = self
                .collection
                .get_fulltext(kind, &entry.key)?
                .ok_or_else(|| BzrError::RevisionNotPresent {
                    revision: entry.key.to_string(),
                    file: format!("{:?}", kind),
                })?;
            let body = encode_stored(false, &sha_string(&text), &text)?;
            let mut refs = entry.refs;
            if let Some(parents) = new_parents.get(&entry.key) {
                refs[0] = parents.clone();
            }
            if refs.len() > 1 {
                refs[1] = Vec::new();
            }
            new_pack.add_record(kind, entry.key, refs, &body)?;
            expanded += 1;
        }
        if expanded > 0 {
            debug!("stored {} {:?} records as fulltexts", expanded, kind);
        }
        Ok(())
    }

    fn inventory(&mut self, revision_id: &[u8]) -> Result<Option<&Inventory>> {
        if !self.inventories.contains_key(revision_id) {
            let Some((_, bytes)) = self
                .collection
                .get_fulltext(IndexKind::Inventory, &Key::revision(revision_id))?
            else {
                return Ok(None);
            };
            let inventory = self.serializer.read_inventory(&bytes)?;
            self.inventories.insert(revision_id.to_vec(), inventory);
        }
        Ok(self.inventories.get(revision_id))
    }

    /// Text keys introduced by `revision_ids`, according to their inventories.
    fn text_filter(&mut self, revision_ids: &BTreeSet<RevisionId>) -> Result<BTreeSet<Key>> {
        let mut keys = BTreeSet::new();
        for revision_id in revision_ids {
            let Some(inventory) = self.inventory(revision_id)? else {
                continue;
            };
            for entry in inventory.entries.values() {
                if entry.has_text() && revision_ids.contains(&entry.revision) {
                    keys.insert(Key::text(&entry.file_id, &entry.revision));
                }
            }
        }
        Ok(keys)
    }

    /// Texts among `text_keys` whose stored parents differ from the ones the
    /// revision graph implies, mapped to the implied parents.
    pub fn inconsistent_text_parents(&mut self, text_keys: &[Key]) -> Result<BTreeMap<Key, Vec<Key>>> {
        let revision_parents: ParentMap = self
            .collection
            .combined(IndexKind::Revision)
            .iter_all_entries()?
            .into_iter()
            .map(|e| {
                let parents = e.refs.first().into_iter().flatten().map(|p| p.first().to_vec()).collect();
                (e.key.first().to_vec(), parents)
            })
            .collect();
        let stored: BTreeMap<Key, Vec<Key>> = self
            .collection
            .get_entries(IndexKind::Text, &text_keys.iter().cloned().collect())?
            .into_iter()
            .map(|e| (e.key, e.refs.into_iter().next().unwrap_or_default()))
            .collect();
        let mut provider = DictParentsProvider(revision_parents.clone());
        let mut ancestries: HashMap<RevisionId, BTreeSet<RevisionId>> = HashMap::new();
        let mut result = BTreeMap::new();
        for key in text_keys {
            let (file_id, revision_id) = (key.first().to_vec(), key.last().to_vec());
            let Some(parents) = revision_parents.get(&revision_id) else {
                continue;
            };
            let mut candidates: Vec<RevisionId> = Vec::new();
            for parent in parents {
                let Some(inventory) = self.inventory(parent)? else {
                    continue;
                };
                if let Some(entry) = inventory.get(&file_id) {
                    if !candidates.contains(&entry.revision) {
                        candidates.push(entry.revision.clone());
                    }
                }
            }
            for candidate in &candidates {
                if !ancestries.contains_key(candidate) {
                    let heads = [candidate.clone()].into_iter().collect();
                    let ancestry: BTreeSet<RevisionId> = find_ancestry(&mut provider, &heads)?.into_keys().collect();
                    ancestries.insert(candidate.clone(), ancestry);
                }
            }
            let ideal: Vec<Key> = candidates
                .iter()
                .filter(|c| {
                    !candidates
                        .iter()
                        .any(|other| other != *c && ancestries.get(other).is_some_and(|a| a.contains(*c)))
                })
                .map(|c| Key::text(&file_id, c))
                .collect();
            if stored.get(key).is_some_and(|s| *s != ideal) {
                result.insert(key.clone(), ideal);
            }
        }
        Ok(result)
    }
}

/// Revisions reordered so that children come before their parents.
fn newest_first(entries: Vec<SourceEntry>) -> Result<Vec<SourceEntry>> {
    let parent_map: ParentMap = entries
        .iter()
        .map(|(_, e)| {
            let parents = e.refs.first().into_iter().flatten().map(|p| p.first().to_vec()).collect();
            (e.key.first().to_vec(), parents)
        })
        .collect();
    let mut by_id: BTreeMap<RevisionId, SourceEntry> = entries
        .into_iter()
        .map(|entry| (entry.1.key.first().to_vec(), entry))
        .collect();
    let mut order = topo_sort(&parent_map)?;
    order.reverse();
    Ok(order.into_iter().filter_map(|id| by_id.remove(&id)).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(id: &str, parents: &[&str]) -> SourceEntry {
        let refs = vec![parents.iter().map(|p| Key::revision(p.as_bytes())).collect()];
        (
            0,
            IndexEntry {
                index: 0,
                key: Key::revision(id.as_bytes()),
                value: b"0 0".to_vec(),
                refs,
            },
        )
    }

    #[test]
    fn test_newest_first_puts_children_before_parents() {
        let entries = vec![entry("a", &[]), entry("b", &["a"]), entry("c", &["b"]), entry("d", &["a"])];
        let order: Vec<String> = newest_first(entries)
            .unwrap()
            .into_iter()
            .map(|(_, e)| e.key.to_string())
            .collect();
        let pos = |id: &str| order.iter().position(|x| x == id).unwrap();
        assert!(pos("c") < pos("b"));
        assert!(pos("b") < pos("a"));
        assert!(pos("d") < pos("a"));
        assert_eq!(order.len(), 4);
    }
}
