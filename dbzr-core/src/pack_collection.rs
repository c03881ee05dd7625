//! The set of live packs in a repository.
//!
//! `pack-names` is the single source of truth: a graph index mapping each
//! pack name to the sizes of its four indices. The collection caches it,
//! keeps aggregate indices over every pack (plus the write group's new pack),
//! and owns write groups, autopack and full packing.

use crate::config::RepositoryConfig;
use crate::delta;
use crate::errors::{BzrError, Result};
use crate::graph_index::{
    CombinedGraphIndex, GraphIndex, GraphIndexBuilder, GraphIndexRead, IndexEntry, IndexId,
};
use crate::key::Key;
use crate::model::{Serializer, sha_string};
use crate::pack::{
    ExistingPack, IndexKind, IndexSizes, NewPack, PACK_SUFFIX, ResumedPack, parse_index_value,
};
use crate::packer::{Packer, PackerMode};
use crate::record::decode_stored;
use crate::transport::Transport;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use tracing::{debug, info, warn};

pub const PACK_NAMES: &str = "pack-names";
const OBSOLETE_PACKS: &str = "obsolete_packs";

/// Most packs a repository of `total_revisions` revisions should have: the
/// sum of the decimal digits (1 for an empty repository).
pub fn max_pack_count(total_revisions: usize) -> usize {
    if total_revisions == 0 {
        return 1;
    }
    total_revisions
        .to_string()
        .bytes()
        .map(|d| (d - b'0') as usize)
        .sum()
}

/// Ideal pack sizes, largest first: one pack of `10^i` revisions per unit of
/// the `i`th decimal digit.
pub fn pack_distribution(total_revisions: usize) -> Vec<usize> {
    if total_revisions == 0 {
        return vec![0];
    }
    let digits = total_revisions.to_string();
    let mut result = Vec::new();
    for (exponent, digit) in digits.bytes().rev().enumerate() {
        let size = 10usize.pow(exponent as u32);
        for _ in 0..(digit - b'0') {
            result.push(size);
        }
    }
    result.reverse();
    result
}

/// Decide which packs to combine so the collection fits `distribution`.
///
/// Returns at most one `(revision_count, packs)` operation.
pub fn plan_autopack_combinations<T: Ord + Clone>(
    mut existing: Vec<(usize, T)>,
    mut distribution: Vec<usize>,
) -> Result<Vec<(usize, Vec<T>)>> {
    if existing.len() <= distribution.len() {
        return Ok(Vec::new());
    }
    existing.sort_by(|a, b| b.cmp(a));
    let mut operations: Vec<(usize, Vec<T>)> = vec![(0, Vec::new())];
    for (count, pack) in existing {
        let Some(&head) = distribution.first() else {
            // Overlapping packs can hold more revisions than the
            // distribution accounts for; fold the rest into the last op.
            if let Some(last) = operations.last_mut() {
                last.0 += count;
                last.1.push(pack);
            }
            continue;
        };
        if count >= head {
            let mut remaining = count as i64;
            while remaining > 0 {
                let Some(&head) = distribution.first() else {
                    break;
                };
                remaining -= head as i64;
                if remaining >= 0 {
                    distribution.remove(0);
                } else {
                    distribution[0] = (-remaining) as usize;
                }
            }
        } else {
            let Some(current) = operations.last_mut() else {
                continue;
            };
            current.0 += count;
            current.1.push(pack);
            if current.0 >= head {
                distribution.remove(0);
                operations.push((0, Vec::new()));
            }
        }
    }
    let mut total = 0;
    let mut packs = Vec::new();
    for (count, op_packs) in operations {
        total += count;
        packs.extend(op_packs);
    }
    if packs.len() == 1 {
        return Err(BzrError::BzrCheckError(
            "autopack planned to move a single pack".into(),
        ));
    }
    if packs.is_empty() {
        return Ok(Vec::new());
    }
    Ok(vec![(total, packs)])
}

fn format_sizes(sizes: &IndexSizes) -> Vec<u8> {
    sizes
        .iter()
        .map(u64::to_string)
        .collect::<Vec<_>>()
        .join(" ")
        .into_bytes()
}

fn parse_sizes(value: &[u8]) -> Result<IndexSizes> {
    let bad = || BzrError::BadIndexValue(String::from_utf8_lossy(value).into_owned());
    let text = std::str::from_utf8(value).map_err(|_| bad())?;
    let parts: Vec<u64> = text
        .split(' ')
        .map(|p| p.parse().map_err(|_| bad()))
        .collect::<Result<_>>()?;
    parts.try_into().map_err(|_| bad())
}

/// Where the data for an index lives.
#[derive(Debug, Clone)]
pub enum PackLocation {
    Existing(Arc<ExistingPack>),
    /// The collection's open write-group pack.
    New,
}

/// A combined index over one index kind of every pack, remembering which pack
/// each member index belongs to.
#[derive(Debug, Default)]
pub struct AggregateIndex {
    combined: Arc<CombinedGraphIndex>,
    locations: HashMap<IndexId, PackLocation>,
}

impl AggregateIndex {
    pub fn combined(&self) -> &Arc<CombinedGraphIndex> {
        &self.combined
    }

    /// Add a pack's index; newer indices take precedence.
    pub fn add_index(&mut self, index: Arc<dyn GraphIndexRead>, location: PackLocation) {
        self.locations.insert(index.id(), location);
        self.combined.insert_index(0, index);
    }

    pub fn add_writable_index(&mut self, index: Arc<GraphIndexBuilder>) {
        self.add_index(index, PackLocation::New);
    }

    pub fn remove_index(&mut self, id: IndexId) -> bool {
        self.locations.remove(&id);
        self.combined.remove_index(id)
    }

    pub fn location(&self, id: IndexId) -> Option<PackLocation> {
        self.locations.get(&id).cloned()
    }

    pub fn clear(&mut self) {
        self.combined.clear();
        self.locations.clear();
    }
}

/// Live pack set of one repository instance.
#[derive(Debug)]
pub struct PackCollection {
    transport: Arc<dyn Transport>,
    config: RepositoryConfig,
    names: Option<BTreeMap<String, IndexSizes>>,
    packs_at_load: BTreeSet<(String, Vec<u8>)>,
    packs_by_name: BTreeMap<String, Arc<ExistingPack>>,
    indices: [AggregateIndex; 4],
    new_pack: Option<NewPack>,
    resumed_packs: Vec<ResumedPack>,
}

impl PackCollection {
    /// Lay out an empty pack store under `transport`.
    pub fn create(transport: &Arc<dyn Transport>) -> Result<()> {
        for dir in ["packs", "indices", "upload", OBSOLETE_PACKS] {
            transport.ensure_dir(dir)?;
        }
        let empty = GraphIndexBuilder::new(0, 1).finish()?;
        transport.put_bytes(PACK_NAMES, &empty)
    }

    pub fn new(transport: Arc<dyn Transport>, config: RepositoryConfig) -> Self {
        Self {
            transport,
            config,
            names: None,
            packs_at_load: BTreeSet::new(),
            packs_by_name: BTreeMap::new(),
            indices: Default::default(),
            new_pack: None,
            resumed_packs: Vec::new(),
        }
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub fn config(&self) -> &RepositoryConfig {
        &self.config
    }

    pub fn aggregate(&self, kind: IndexKind) -> &AggregateIndex {
        &self.indices[kind.slot()]
    }

    pub fn combined(&self, kind: IndexKind) -> Arc<CombinedGraphIndex> {
        Arc::clone(self.indices[kind.slot()].combined())
    }

    /// Read `pack-names` if it has not been read yet. Returns whether this
    /// call did the read.
    pub fn ensure_loaded(&mut self, locked: bool) -> Result<bool> {
        if !locked {
            return Err(BzrError::ObjectNotLocked(self.transport.base()));
        }
        let first_read = self.names.is_none();
        if first_read {
            let mut names = BTreeMap::new();
            let mut at_load = BTreeSet::new();
            for (name, value) in self.iter_disk_pack_index()? {
                names.insert(name.clone(), parse_sizes(&value)?);
                at_load.insert((name, value));
            }
            self.names = Some(names);
            self.packs_at_load = at_load;
        }
        self.all_packs()?;
        Ok(first_read)
    }

    fn loaded_names(&self) -> Result<&BTreeMap<String, IndexSizes>> {
        self.names
            .as_ref()
            .ok_or_else(|| BzrError::ObjectNotLocked(self.transport.base()))
    }

    fn loaded_names_mut(&mut self) -> Result<&mut BTreeMap<String, IndexSizes>> {
        let base = self.transport.base();
        self.names.as_mut().ok_or(BzrError::ObjectNotLocked(base))
    }

    /// Sorted names of the live packs.
    pub fn names(&self) -> Vec<String> {
        self.names
            .as_ref()
            .map(|n| n.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn is_loaded(&self) -> bool {
        self.names.is_some()
    }

    fn iter_disk_pack_index(&self) -> Result<Vec<(String, Vec<u8>)>> {
        let index = GraphIndex::new(Arc::clone(&self.transport), PACK_NAMES, None);
        index
            .iter_all_entries()?
            .into_iter()
            .map(|entry| Ok((String::from_utf8_lossy(entry.key.first()).into_owned(), entry.value)))
            .collect()
    }

    pub fn all_packs(&mut self) -> Result<Vec<Arc<ExistingPack>>> {
        self.names()
            .iter()
            .map(|name| self.get_pack_by_name(name))
            .collect()
    }

    pub fn get_pack_by_name(&mut self, name: &str) -> Result<Arc<ExistingPack>> {
        if let Some(pack) = self.packs_by_name.get(name) {
            return Ok(Arc::clone(pack));
        }
        let sizes = *self
            .loaded_names()?
            .get(name)
            .ok_or_else(|| BzrError::NoSuchFile(format!("{}packs/{}{}", self.transport.base(), name, PACK_SUFFIX)))?;
        let pack = Arc::new(ExistingPack::open(&self.transport, name, sizes)?);
        self.add_pack_to_memory(Arc::clone(&pack));
        Ok(pack)
    }

    fn add_pack_to_memory(&mut self, pack: Arc<ExistingPack>) {
        for kind in IndexKind::ALL {
            self.indices[kind.slot()].add_index(pack.index(kind), PackLocation::Existing(Arc::clone(&pack)));
        }
        self.packs_by_name.insert(pack.name().to_string(), pack);
    }

    fn remove_pack_indices(&mut self, pack: &ExistingPack) {
        for kind in IndexKind::ALL {
            self.indices[kind.slot()].remove_index(pack.index(kind).id());
        }
    }

    fn remove_pack_from_memory(&mut self, name: &str) {
        if let Some(names) = self.names.as_mut() {
            names.remove(name);
        }
        if let Some(pack) = self.packs_by_name.remove(name) {
            self.remove_pack_indices(&pack);
        }
    }

    /// Register a finished pack by name.
    pub fn allocate(&mut self, name: &str, sizes: IndexSizes) -> Result<()> {
        let names = self.loaded_names_mut()?;
        if names.contains_key(name) {
            return Err(BzrError::PackNameCollision(name.to_string()));
        }
        names.insert(name.to_string(), sizes);
        self.get_pack_by_name(name)?;
        Ok(())
    }

    // ==================== pack-names persistence ====================

    fn current_nodes(&self) -> Result<BTreeSet<(String, Vec<u8>)>> {
        Ok(self
            .loaded_names()?
            .iter()
            .map(|(name, sizes)| (name.clone(), format_sizes(sizes)))
            .collect())
    }

    /// Three-way diff of disk, load-time and in-memory names.
    ///
    /// Returns `(disk_nodes, deleted, new, original_disk_nodes)` where
    /// `disk_nodes` is the merged set to write.
    #[allow(clippy::type_complexity)]
    fn diff_pack_names(
        &self,
    ) -> Result<(
        BTreeSet<(String, Vec<u8>)>,
        BTreeSet<(String, Vec<u8>)>,
        BTreeSet<(String, Vec<u8>)>,
        BTreeSet<(String, Vec<u8>)>,
    )> {
        let orig_disk: BTreeSet<(String, Vec<u8>)> = self.iter_disk_pack_index()?.into_iter().collect();
        let current = self.current_nodes()?;
        let deleted: BTreeSet<_> = self.packs_at_load.difference(&current).cloned().collect();
        let new: BTreeSet<_> = current.difference(&self.packs_at_load).cloned().collect();
        let mut disk: BTreeSet<_> = orig_disk.difference(&deleted).cloned().collect();
        disk.extend(new.iter().cloned());
        Ok((disk, deleted, new, orig_disk))
    }

    /// Make memory match `disk_nodes`. Returns `(removed, added, modified)`.
    fn synchronize_from_disk_nodes(
        &mut self,
        disk_nodes: &BTreeSet<(String, Vec<u8>)>,
    ) -> Result<(Vec<String>, Vec<String>, Vec<String>)> {
        let wanted: BTreeMap<&String, &Vec<u8>> = disk_nodes.iter().map(|(n, v)| (n, v)).collect();
        let mut removed = Vec::new();
        let mut added = Vec::new();
        let mut modified = Vec::new();
        for name in self.names() {
            if !wanted.contains_key(&name) {
                self.remove_pack_from_memory(&name);
                removed.push(name);
            }
        }
        for (name, value) in disk_nodes {
            let sizes = parse_sizes(value)?;
            match self.loaded_names()?.get(name).copied() {
                Some(existing) if existing == sizes => {}
                Some(_) => {
                    self.remove_pack_from_memory(name);
                    self.loaded_names_mut()?.insert(name.clone(), sizes);
                    self.get_pack_by_name(name)?;
                    modified.push(name.clone());
                }
                None => {
                    self.loaded_names_mut()?.insert(name.clone(), sizes);
                    self.get_pack_by_name(name)?;
                    added.push(name.clone());
                }
            }
        }
        Ok((removed, added, modified))
    }

    /// Write `pack-names`, merging with concurrent changes on disk.
    ///
    /// With `clear_obsolete` the quarantine is emptied first, except for the
    /// packs being obsoleted now, which then move into it. Returns the names
    /// this writer added.
    pub fn save_pack_names(&mut self, clear_obsolete: bool, obsolete: &[Arc<ExistingPack>]) -> Result<Vec<String>> {
        let (disk_nodes, _deleted, new_nodes, _orig) = self.diff_pack_names()?;
        let builder = GraphIndexBuilder::new(0, 1);
        for (name, value) in &disk_nodes {
            builder.add_node(Key::revision(name.as_bytes()), value.clone(), Vec::new())?;
        }
        self.transport.put_bytes(PACK_NAMES, &builder.finish()?)?;
        self.packs_at_load = disk_nodes.clone();
        let mut already_obsolete = Vec::new();
        if clear_obsolete {
            let preserve: BTreeSet<String> = obsolete.iter().map(|p| p.name().to_string()).collect();
            already_obsolete = self.clear_obsolete_packs(&preserve)?;
        }
        self.synchronize_from_disk_nodes(&disk_nodes)?;
        let to_obsolete: Vec<&Arc<ExistingPack>> = obsolete
            .iter()
            .filter(|p| !already_obsolete.iter().any(|n| n == p.name()))
            .collect();
        self.obsolete_packs(&to_obsolete);
        Ok(new_nodes.into_iter().map(|(name, _)| name).collect())
    }

    /// Re-read `pack-names`. Returns whether the in-memory view changed.
    pub fn reload_pack_names(&mut self, locked: bool) -> Result<bool> {
        if self.ensure_loaded(locked)? {
            return Ok(true);
        }
        let (disk_nodes, _deleted, _new, orig_disk) = self.diff_pack_names()?;
        self.packs_at_load = orig_disk;
        let (removed, added, modified) = self.synchronize_from_disk_nodes(&disk_nodes)?;
        Ok(!(removed.is_empty() && added.is_empty() && modified.is_empty()))
    }

    /// Move packs and their indices into `obsolete_packs/`. Failures are
    /// logged and skipped.
    fn obsolete_packs(&self, packs: &[&Arc<ExistingPack>]) {
        for pack in packs {
            let file = pack.file_name();
            let target = format!("../{}/{}", OBSOLETE_PACKS, file);
            let mut moved = pack.data_transport().rename(&file, &target);
            if matches!(&moved, Err(e) if e.is_no_such_file()) {
                let _ = self.transport.ensure_dir(OBSOLETE_PACKS);
                moved = pack.data_transport().rename(&file, &target);
            }
            if let Err(e) = moved {
                warn!("couldn't rename obsolete pack {}, skipping it: {}", pack.name(), e);
            }
            for kind in IndexKind::ALL {
                let index_file = format!("{}{}", pack.name(), kind.suffix());
                if let Err(e) = pack
                    .index_transport()
                    .rename(&index_file, &format!("../{}/{}", OBSOLETE_PACKS, index_file))
                {
                    warn!("couldn't rename obsolete index {}, skipping it: {}", index_file, e);
                }
            }
        }
    }

    /// Empty the quarantine, keeping files of packs named in `preserve`.
    /// Returns the pack names that were found there.
    pub fn clear_obsolete_packs(&self, preserve: &BTreeSet<String>) -> Result<Vec<String>> {
        let obsolete = self.transport.clone_to(OBSOLETE_PACKS)?;
        let files = match obsolete.list_dir(".") {
            Ok(files) => files,
            Err(e) if e.is_no_such_file() => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        let mut found = Vec::new();
        for file in files {
            let (name, ext) = match file.rfind('.') {
                Some(i) => (&file[..i], &file[i..]),
                None => (file.as_str(), ""),
            };
            if ext == PACK_SUFFIX {
                found.push(name.to_string());
            }
            if preserve.contains(name) {
                continue;
            }
            if let Err(e) = obsolete.delete(&file) {
                warn!("couldn't delete obsolete pack {}, skipping it: {}", file, e);
            }
        }
        Ok(found)
    }

    /// Files currently in the quarantine.
    pub fn obsolete_pack_files(&self) -> Result<Vec<String>> {
        match self.transport.list_dir(OBSOLETE_PACKS) {
            Ok(files) => Ok(files),
            Err(e) if e.is_no_such_file() => Ok(Vec::new()),
            Err(e) => Err(e),
        }
    }

    // ==================== Packing ====================

    pub fn total_revisions(&self) -> Result<usize> {
        self.indices[IndexKind::Revision.slot()].combined().key_count()
    }

    /// Combine packs so their count stays within [`max_pack_count`].
    /// Returns `None` when there was nothing to do.
    pub fn autopack(&mut self, serializer: &Arc<dyn Serializer>) -> Result<Option<Vec<String>>> {
        let total_revisions = self.total_revisions()?;
        let total_packs = self.loaded_names()?.len();
        if max_pack_count(total_revisions) >= total_packs {
            return Ok(None);
        }
        let distribution = pack_distribution(total_revisions);
        let mut existing = Vec::new();
        for pack in self.all_packs()? {
            let count = pack.revision_count()?;
            if count == 0 {
                continue;
            }
            existing.push((count, pack.name().to_string()));
        }
        let plan = plan_autopack_combinations(existing, distribution)?;
        let operations = self.resolve_operations(plan)?;
        info!(
            "auto-packing {} which has {} packs holding {} revisions: combining {} packs",
            self.transport.base(),
            total_packs,
            total_revisions,
            operations.iter().map(|(_, p)| p.len()).sum::<usize>()
        );
        self.execute_pack_operations(operations, PackerMode::Normal, serializer)
    }

    fn resolve_operations(&mut self, plan: Vec<(usize, Vec<String>)>) -> Result<Vec<(usize, Vec<Arc<ExistingPack>>)>> {
        plan.into_iter()
            .map(|(count, names)| {
                let packs = names
                    .iter()
                    .map(|n| self.get_pack_by_name(n))
                    .collect::<Result<Vec<_>>>()?;
                Ok((count, packs))
            })
            .collect()
    }

    /// Run each operation through a packer, then switch `pack-names` and
    /// quarantine the inputs. Returns `None` if a packer produced nothing.
    pub fn execute_pack_operations(
        &mut self,
        operations: Vec<(usize, Vec<Arc<ExistingPack>>)>,
        mode: PackerMode,
        serializer: &Arc<dyn Serializer>,
    ) -> Result<Option<Vec<String>>> {
        for (revision_count, packs) in &operations {
            if packs.is_empty() {
                continue;
            }
            debug!("packing {} packs holding {} revisions", packs.len(), revision_count);
            let mut packer = Packer::new(self, packs.clone(), mode, None, Arc::clone(serializer));
            if packer.pack()?.is_none() {
                return Ok(None);
            }
            for pack in packs {
                self.remove_pack_from_memory(pack.name());
            }
        }
        let obsolete: Vec<Arc<ExistingPack>> = operations.into_iter().flat_map(|(_, packs)| packs).collect();
        Ok(Some(self.save_pack_names(true, &obsolete)?))
    }

    /// Combine all packs (or those named in `hint`) into one, writing every
    /// record as a fulltext.
    pub fn pack(
        &mut self,
        hint: Option<&[String]>,
        clean_obsolete: bool,
        locked: bool,
        serializer: &Arc<dyn Serializer>,
    ) -> Result<()> {
        self.ensure_loaded(locked)?;
        let total_packs = self.loaded_names()?.len();
        if total_packs < 2 {
            return Ok(());
        }
        let mut count = 0;
        let mut packs = Vec::new();
        for pack in self.all_packs()? {
            if hint.is_none_or(|h| h.iter().any(|n| n == pack.name())) {
                count += pack.revision_count()?;
                packs.push(pack);
            }
        }
        info!(
            "packing {} which has {} packs holding {} revisions",
            self.transport.base(),
            total_packs,
            self.total_revisions()?
        );
        if packs.len() >= 2 {
            self.execute_pack_operations(vec![(count, packs)], PackerMode::Optimising, serializer)?;
        }
        if clean_obsolete {
            self.clear_obsolete_packs(&BTreeSet::new())?;
        }
        Ok(())
    }

    // ==================== Record access ====================

    /// Raw container records for `entries` of one index kind, in order.
    /// Reads are grouped per pack in ascending offset order.
    pub fn read_raw_records(&mut self, kind: IndexKind, entries: &[IndexEntry]) -> Result<Vec<Vec<u8>>> {
        let mut groups: BTreeMap<IndexId, Vec<(usize, u64, u64)>> = BTreeMap::new();
        for (i, entry) in entries.iter().enumerate() {
            let (offset, length) = parse_index_value(&entry.value)?;
            groups.entry(entry.index).or_default().push((i, offset, length));
        }
        let mut out = vec![Vec::new(); entries.len()];
        for (index_id, mut group) in groups {
            group.sort_by_key(|&(_, offset, _)| offset);
            let offsets: Vec<(u64, u64)> = group.iter().map(|&(_, o, l)| (o, l)).collect();
            let location = self.indices[kind.slot()]
                .location(index_id)
                .ok_or_else(|| BzrError::BzrCheckError(format!("index {} has no pack", index_id)))?;
            let data = match location {
                PackLocation::Existing(pack) => pack.readv(&offsets)?,
                PackLocation::New => self
                    .new_pack
                    .as_mut()
                    .ok_or_else(|| BzrError::BzrCheckError("no pack is being written".into()))?
                    .readv(&offsets)?,
            };
            for ((i, _, _), bytes) in group.into_iter().zip(data) {
                out[i] = bytes;
            }
        }
        Ok(out)
    }

    pub fn get_entries(&self, kind: IndexKind, keys: &BTreeSet<Key>) -> Result<Vec<IndexEntry>> {
        self.indices[kind.slot()].combined().iter_entries(keys)
    }

    /// Rebuild the fulltext of `key`, following delta chains inside this
    /// collection. `None` when the key is not stored here.
    pub fn get_fulltext(&mut self, kind: IndexKind, key: &Key) -> Result<Option<(IndexEntry, Vec<u8>)>> {
        let mut chain = Vec::new();
        let mut current = key.clone();
        loop {
            let wanted: BTreeSet<Key> = [current.clone()].into_iter().collect();
            let Some(entry) = self.get_entries(kind, &wanted)?.pop() else {
                if chain.is_empty() {
                    return Ok(None);
                }
                return Err(BzrError::BzrCheckError(format!(
                    "missing compression parent {} of {}",
                    current, key
                )));
            };
            let raw = self.read_raw_records(kind, std::slice::from_ref(&entry))?.remove(0);
            let (stored_key, body) = crate::container::decode_record(&raw)?;
            if stored_key != current {
                return Err(BzrError::InvalidRecord(format!(
                    "index points {} at a record for {}",
                    current, stored_key
                )));
            }
            let stored = decode_stored(&body)?;
            let basis = if stored.is_delta {
                entry.refs.get(1).and_then(|r| r.first()).cloned()
            } else {
                None
            };
            chain.push((entry, stored));
            match basis {
                Some(basis) if chain.len() <= self.config.max_delta_chain + 1 => current = basis,
                Some(_) => return Err(BzrError::BzrCheckError(format!("delta chain too long for {}", key))),
                None => break,
            }
        }
        let mut text: Vec<u8> = Vec::new();
        let mut first = None;
        while let Some((entry, stored)) = chain.pop() {
            text = if stored.is_delta {
                delta::apply_delta(&text, &stored.payload)?
            } else {
                stored.payload
            };
            if sha_string(&text) != stored.sha {
                return Err(BzrError::InvalidRecord(format!("hash mismatch for {}", entry.key)));
            }
            first = Some(entry);
        }
        Ok(first.map(|entry| (entry, text)))
    }

    /// Length of the delta chain ending at `key` (0 for a fulltext).
    pub fn delta_chain_length(&self, kind: IndexKind, key: &Key) -> Result<usize> {
        let mut length = 0;
        let mut current = key.clone();
        loop {
            let wanted: BTreeSet<Key> = [current.clone()].into_iter().collect();
            let Some(entry) = self.get_entries(kind, &wanted)?.pop() else {
                return Ok(length);
            };
            match entry.refs.get(1).and_then(|r| r.first()) {
                Some(basis) if length <= self.config.max_delta_chain => {
                    length += 1;
                    current = basis.clone();
                }
                Some(_) => return Ok(length),
                None => return Ok(length),
            }
        }
    }

    /// Whether `key` is stored in a pack other than `excluded`.
    pub fn has_key_outside(&self, kind: IndexKind, key: &Key, excluded: &BTreeSet<String>) -> Result<bool> {
        let aggregate = &self.indices[kind.slot()];
        for index in aggregate.combined().indices() {
            let keep = match aggregate.location(index.id()) {
                Some(PackLocation::Existing(pack)) => !excluded.contains(pack.name()),
                Some(PackLocation::New) => true,
                None => false,
            };
            let wanted: BTreeSet<Key> = [key.clone()].into_iter().collect();
            if keep && !index.iter_entries(&wanted)?.is_empty() {
                return Ok(true);
            }
        }
        Ok(false)
    }

    // ==================== Write groups ====================

    pub fn is_in_write_group(&self) -> bool {
        self.new_pack.is_some()
    }

    pub fn new_pack_mut(&mut self) -> Result<&mut NewPack> {
        self.new_pack
            .as_mut()
            .ok_or_else(|| BzrError::BzrCheckError("not in a write group".into()))
    }

    pub fn start_write_group(&mut self, write_locked: bool) -> Result<()> {
        if !write_locked {
            return Err(BzrError::NotWriteLocked(self.transport.base()));
        }
        if self.new_pack.is_some() {
            return Err(BzrError::BzrCheckError("already in a write group".into()));
        }
        let pack = NewPack::new(&self.transport, self.config.pack_cache_limit)?;
        for kind in IndexKind::ALL {
            self.indices[kind.slot()].add_writable_index(pack.index(kind));
        }
        self.new_pack = Some(pack);
        Ok(())
    }

    fn remove_new_pack_indices(&mut self, pack: &NewPack) {
        for kind in IndexKind::ALL {
            self.indices[kind.slot()].remove_index(pack.index(kind).id());
        }
    }

    fn remove_resumed_pack_indices(&mut self) -> Vec<ResumedPack> {
        let resumed = std::mem::take(&mut self.resumed_packs);
        for pack in &resumed {
            self.remove_pack_indices(pack.pack());
        }
        resumed
    }

    /// Text and inventory records in the write group whose delta basis is
    /// not stored in this collection.
    pub fn missing_compression_parents(&self) -> Result<BTreeSet<(IndexKind, Key)>> {
        let mut missing = BTreeSet::new();
        for kind in [IndexKind::Inventory, IndexKind::Text] {
            for entry in self.write_group_entries(kind)? {
                for basis in entry.refs.get(1).into_iter().flatten() {
                    let wanted: BTreeSet<Key> = [basis.clone()].into_iter().collect();
                    if self.get_entries(kind, &wanted)?.is_empty() {
                        missing.insert((kind, basis.clone()));
                    }
                }
            }
        }
        Ok(missing)
    }

    /// Entries written by the current write group, including resumed packs.
    pub fn write_group_entries(&self, kind: IndexKind) -> Result<Vec<IndexEntry>> {
        let mut sources: Vec<Arc<dyn GraphIndexRead>> = Vec::new();
        if let Some(pack) = &self.new_pack {
            sources.push(pack.index(kind));
        }
        for resumed in &self.resumed_packs {
            sources.push(resumed.pack().index(kind));
        }
        let mut entries = Vec::new();
        for index in sources {
            entries.extend(index.iter_all_entries()?);
        }
        Ok(entries)
    }

    pub fn abort_write_group(&mut self) -> Result<()> {
        let mut first_error = None;
        if let Some(mut pack) = self.new_pack.take() {
            self.remove_new_pack_indices(&pack);
            if let Err(e) = pack.abort() {
                first_error.get_or_insert(e);
            }
        }
        for resumed in self.remove_resumed_pack_indices() {
            if let Err(e) = resumed.abort() {
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Finish and register the write group's packs, then autopack. Returns
    /// the names added (an autopack hint).
    pub fn commit_write_group(&mut self, serializer: &Arc<dyn Serializer>) -> Result<Vec<String>> {
        let missing = self.missing_compression_parents()?;
        if !missing.is_empty() {
            let keys: Vec<String> = missing.iter().map(|(kind, key)| format!("{:?}:{}", kind, key)).collect();
            return Err(BzrError::BzrCheckError(format!(
                "repository {} has missing compression parent(s) {:?}",
                self.transport.base(),
                keys
            )));
        }
        let mut pack = self
            .new_pack
            .take()
            .ok_or_else(|| BzrError::BzrCheckError("not in a write group".into()))?;
        self.remove_new_pack_indices(&pack);
        let mut any_new_content = false;
        if pack.data_inserted() {
            pack.finish(false)?;
            let (name, sizes) = finished_identity(&pack)?;
            self.allocate(&name, sizes)?;
            any_new_content = true;
        } else {
            pack.abort()?;
        }
        for resumed in self.remove_resumed_pack_indices() {
            resumed.finish()?;
            self.allocate(resumed.name(), resumed.pack().index_sizes())?;
            any_new_content = true;
        }
        if !any_new_content {
            return Ok(Vec::new());
        }
        info!("committed write group in {}", self.transport.base());
        if self.config.autopack {
            if let Some(result) = self.autopack(serializer)? {
                return Ok(result);
            }
        }
        self.save_pack_names(false, &[])
    }

    /// Park the write group in `upload/`, returning resume tokens.
    pub fn suspend_write_group(&mut self) -> Result<Vec<String>> {
        let mut tokens: Vec<String> = self.resumed_packs.iter().map(|p| p.name().to_string()).collect();
        if let Some(mut pack) = self.new_pack.take() {
            self.remove_new_pack_indices(&pack);
            if pack.data_inserted() {
                pack.finish(true)?;
                tokens.push(finished_identity(&pack)?.0);
            } else {
                pack.abort()?;
            }
        }
        self.remove_resumed_pack_indices();
        Ok(tokens)
    }

    /// Reattach suspended packs. A new write group must already be started.
    pub fn resume_write_group(&mut self, tokens: &[String]) -> Result<()> {
        for token in tokens {
            let resumed = ResumedPack::resume(&self.transport, token)?;
            let pack = Arc::clone(resumed.pack());
            for kind in IndexKind::ALL {
                self.indices[kind.slot()].add_index(pack.index(kind), PackLocation::Existing(Arc::clone(&pack)));
            }
            self.resumed_packs.push(resumed);
        }
        Ok(())
    }

    /// Forget everything cached; the next access re-reads `pack-names`.
    pub fn reset(&mut self) {
        for index in self.indices.iter_mut() {
            index.clear();
        }
        self.new_pack = None;
        self.resumed_packs.clear();
        self.names = None;
        self.packs_by_name.clear();
        self.packs_at_load.clear();
    }
}

pub(crate) fn finished_identity(pack: &NewPack) -> Result<(String, IndexSizes)> {
    match (pack.name(), pack.index_sizes()) {
        (Some(name), Some(sizes)) => Ok((name.to_string(), sizes)),
        _ => Err(BzrError::BzrCheckError("pack is not finished".into())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::encode_stored;
    use crate::repository::RepositoryFormat;
    use crate::transport::MemoryTransport;

    fn new_store() -> Arc<dyn Transport> {
        let t: Arc<dyn Transport> = Arc::new(MemoryTransport::new());
        PackCollection::create(&t).unwrap();
        t
    }

    fn open(t: &Arc<dyn Transport>) -> PackCollection {
        let mut collection = PackCollection::new(Arc::clone(t), RepositoryConfig::default());
        collection.ensure_loaded(true).unwrap();
        collection
    }

    fn add_revision(collection: &mut PackCollection, id: &str) {
        let text = format!("revision {}\n", id);
        let body = encode_stored(false, &sha_string(text.as_bytes()), text.as_bytes()).unwrap();
        collection
            .new_pack_mut()
            .unwrap()
            .add_record(IndexKind::Revision, Key::revision(id.as_bytes()), vec![Vec::new()], &body)
            .unwrap();
    }

    fn commit(collection: &mut PackCollection) -> Vec<String> {
        let serializer = RepositoryFormat::default().serializer().unwrap();
        collection.commit_write_group(&serializer).unwrap()
    }

    fn disk_names(t: &Arc<dyn Transport>) -> Vec<String> {
        open(t).names()
    }

    #[test]
    fn test_max_pack_count() {
        assert_eq!(max_pack_count(0), 1);
        assert_eq!(max_pack_count(1), 1);
        assert_eq!(max_pack_count(10), 1);
        assert_eq!(max_pack_count(11), 2);
        assert_eq!(max_pack_count(1234), 10);
        assert_eq!(max_pack_count(99), 18);
    }

    #[test]
    fn test_pack_distribution() {
        assert_eq!(pack_distribution(0), vec![0]);
        assert_eq!(pack_distribution(1), vec![1]);
        assert_eq!(pack_distribution(11), vec![10, 1]);
        assert_eq!(pack_distribution(1234), vec![1000, 100, 100, 10, 10, 10, 1, 1, 1, 1]);
    }

    #[test]
    fn test_plan_nothing_when_within_distribution() {
        let plan = plan_autopack_combinations(vec![(10, "a"), (1, "b")], vec![10, 1]).unwrap();
        assert!(plan.is_empty());
    }

    #[test]
    fn test_plan_combines_small_packs() {
        // Eleven single-revision packs should become one pack of ten plus
        // the one left over.
        let existing: Vec<(usize, String)> = (0..11).map(|i| (1, format!("p{:02}", i))).collect();
        let plan = plan_autopack_combinations(existing, pack_distribution(11)).unwrap();
        assert_eq!(plan.len(), 1);
        assert_eq!(plan[0].0, 10);
        assert_eq!(plan[0].1.len(), 10);
    }

    #[test]
    fn test_plan_keeps_large_packs() {
        // 10 + 5 + 5: the big pack fills one 10 bucket, the two halves are
        // combined into the other.
        let plan = plan_autopack_combinations(vec![(10, "big"), (5, "a"), (5, "b")], pack_distribution(20)).unwrap();
        assert_eq!(plan, vec![(10, vec!["b", "a"])]);
    }

    #[test]
    fn test_sizes_value() {
        let sizes = [1, 22, 333, 0];
        assert_eq!(format_sizes(&sizes), b"1 22 333 0");
        assert_eq!(parse_sizes(b"1 22 333 0").unwrap(), sizes);
        assert!(parse_sizes(b"1 2 3").is_err());
    }

    #[test]
    fn test_suspended_write_group_commits_after_resume() {
        let t = new_store();
        let mut collection = open(&t);
        collection.start_write_group(true).unwrap();
        add_revision(&mut collection, "r1");
        let tokens = collection.suspend_write_group().unwrap();
        assert_eq!(tokens.len(), 1);
        assert!(!collection.is_in_write_group());
        assert!(disk_names(&t).is_empty());

        let mut resumed = open(&t);
        resumed.start_write_group(true).unwrap();
        resumed.resume_write_group(&tokens).unwrap();
        assert_eq!(resumed.write_group_entries(IndexKind::Revision).unwrap().len(), 1);
        commit(&mut resumed);

        assert_eq!(disk_names(&t), tokens);
        assert!(t.list_dir("upload").unwrap().is_empty());
        assert_eq!(open(&t).total_revisions().unwrap(), 1);
    }

    #[test]
    fn test_resumed_write_group_abort_discards_upload() {
        let t = new_store();
        let mut collection = open(&t);
        collection.start_write_group(true).unwrap();
        add_revision(&mut collection, "r1");
        let tokens = collection.suspend_write_group().unwrap();
        assert!(!t.list_dir("upload").unwrap().is_empty());

        collection.start_write_group(true).unwrap();
        collection.resume_write_group(&tokens).unwrap();
        collection.abort_write_group().unwrap();

        assert!(t.list_dir("upload").unwrap().is_empty());
        assert!(disk_names(&t).is_empty());
        collection.start_write_group(true).unwrap();
        assert!(matches!(
            collection.resume_write_group(&tokens),
            Err(BzrError::UnresumableWriteGroup { .. })
        ));
    }

    #[test]
    fn test_concurrent_writers_merge_pack_names() {
        let t = new_store();
        let mut first = open(&t);
        let mut second = open(&t);

        first.start_write_group(true).unwrap();
        add_revision(&mut first, "r1");
        let first_added = commit(&mut first);
        second.start_write_group(true).unwrap();
        add_revision(&mut second, "r2");
        let second_added = commit(&mut second);
        assert_eq!(first_added.len(), 1);
        assert_eq!(second_added.len(), 1);

        // The second writer kept the first writer's pack and now sees it.
        let mut expected: Vec<String> = first_added.into_iter().chain(second_added).collect();
        expected.sort();
        assert_eq!(disk_names(&t), expected);
        assert_eq!(second.names(), expected);

        assert!(first.reload_pack_names(true).unwrap());
        assert_eq!(first.names(), expected);
        assert!(!first.reload_pack_names(true).unwrap());
    }
}
