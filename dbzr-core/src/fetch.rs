//! Moving revisions between repositories as typed record streams.
//!
//! A source turns a search into substreams (`texts`, then `inventories` or
//! `inventory-deltas`, then `signatures`, then `revisions`). A sink inserts
//! them inside a write group and reports keys it could not complete, so the
//! driver can ask the source for exactly those.

use crate::container::decode_record;
use crate::delta::apply_delta;
use crate::errors::{BzrError, Result};
use crate::graph::{BreadthFirstSearcher, SearchResult, find_ancestry, topo_sort};
use crate::key::{Key, NULL_REVISION, ParentMap, RevisionId, display_id, is_null};
use crate::model::{Inventory, InventoryDelta, Serializer, sha_string};
use crate::pack::IndexKind;
use crate::pack_repository::PackRepository;
use crate::record::{ContentRecord, StorageKind, Stream, Substream, SubstreamKind, decode_stored};
use crate::repository::{MissingKeys, Repository, RepositoryFormat, RepositoryGraph, search_keys};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Revisions examined per round when looking for what a target lacks.
pub const DEFAULT_WALK_BATCH_SIZE: usize = 50;

const SUBSTREAM_ORDER: [SubstreamKind; 5] = [
    SubstreamKind::Texts,
    SubstreamKind::Inventories,
    SubstreamKind::InventoryDeltas,
    SubstreamKind::Signatures,
    SubstreamKind::Revisions,
];

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FetchResult {
    /// Revision records sent by the source.
    pub revisions: usize,
    /// Insert rounds, 2 when missing keys had to be filled in.
    pub rounds: usize,
}

fn substream_kind(kind: IndexKind) -> SubstreamKind {
    match kind {
        IndexKind::Revision => SubstreamKind::Revisions,
        IndexKind::Inventory => SubstreamKind::Inventories,
        IndexKind::Text => SubstreamKind::Texts,
        IndexKind::Signature => SubstreamKind::Signatures,
    }
}

fn index_kind(kind: SubstreamKind) -> Option<IndexKind> {
    match kind {
        SubstreamKind::Revisions => Some(IndexKind::Revision),
        SubstreamKind::Inventories => Some(IndexKind::Inventory),
        SubstreamKind::Texts => Some(IndexKind::Text),
        SubstreamKind::Signatures => Some(IndexKind::Signature),
        SubstreamKind::InventoryDeltas => None,
    }
}

/// Merge substreams of the same kind, in wire order, dropping empty ones.
pub fn normalize_stream(stream: Stream) -> Stream {
    let mut by_kind: BTreeMap<SubstreamKind, Vec<ContentRecord>> = BTreeMap::new();
    for substream in stream {
        by_kind.entry(substream.kind).or_default().extend(substream.records);
    }
    SUBSTREAM_ORDER
        .iter()
        .filter_map(|kind| {
            by_kind
                .remove(kind)
                .filter(|records| !records.is_empty())
                .map(|records| Substream::new(*kind, records))
        })
        .collect()
}

fn revision_ids_of(keys: &[Key]) -> Vec<RevisionId> {
    keys.iter().map(|k| k.first().to_vec()).collect()
}

// ==================== Source ====================

/// Records as stored, so deltas travel as deltas.
fn native_records(repo: &mut PackRepository, kind: IndexKind, keys: &[Key]) -> Result<Vec<ContentRecord>> {
    let wanted: BTreeSet<Key> = keys.iter().cloned().collect();
    let mut by_key: HashMap<Key, _> = repo
        .collection_mut()
        .get_entries(kind, &wanted)?
        .into_iter()
        .map(|e| (e.key.clone(), e))
        .collect();
    let entries: Vec<_> = keys.iter().filter_map(|k| by_key.remove(k)).collect();
    let raw = repo.collection_mut().read_raw_records(kind, &entries)?;
    let mut records = Vec::with_capacity(entries.len());
    for (entry, raw) in entries.into_iter().zip(raw) {
        let (_, body) = decode_record(&raw)?;
        let stored = decode_stored(&body)?;
        let storage = match entry.refs.get(1).and_then(|r| r.first()) {
            Some(basis) if stored.is_delta => StorageKind::Delta { basis: basis.clone() },
            _ if stored.is_delta => {
                return Err(BzrError::InvalidRecord(format!("delta {} has no basis", entry.key)));
            }
            _ => StorageKind::Fulltext,
        };
        records.push(ContentRecord {
            key: entry.key,
            parents: Some(entry.refs.into_iter().next().unwrap_or_default()),
            sha: stored.sha,
            kind: storage,
            bytes: stored.payload,
        });
    }
    Ok(records)
}

fn local_inventory(repo: &mut PackRepository, revision_id: &[u8]) -> Result<Option<Inventory>> {
    match repo.local_fulltext(IndexKind::Inventory, &Key::revision(revision_id))? {
        Some(bytes) => Ok(Some(repo.serializer().read_inventory(&bytes)?)),
        None => Ok(None),
    }
}

pub(crate) fn pack_stream(repo: &mut PackRepository, search: &SearchResult, to_format: &RepositoryFormat) -> Result<Stream> {
    repo.lock_read()?;
    let result = pack_stream_locked(repo, search, to_format);
    let unlocked = repo.unlock();
    let stream = result?;
    unlocked?;
    Ok(stream)
}

fn pack_stream_locked(repo: &mut PackRepository, search: &SearchResult, to_format: &RepositoryFormat) -> Result<Stream> {
    let wanted = search_keys(repo, search)?;
    let mut local = repo.local_parent_map(&wanted)?;
    local.remove(NULL_REVISION);
    let order = topo_sort(&local)?;
    let present: BTreeSet<RevisionId> = local.keys().cloned().collect();
    debug!(
        "streaming {} of {} requested revisions from {}",
        present.len(),
        wanted.len(),
        repo.base()
    );

    let mut inventories: BTreeMap<RevisionId, Inventory> = BTreeMap::new();
    let mut text_keys = Vec::new();
    for revision_id in &order {
        let Some(inventory) = local_inventory(repo, revision_id)? else {
            continue;
        };
        for entry in inventory.entries.values() {
            if entry.has_text() && entry.revision == *revision_id {
                text_keys.push(Key::text(&entry.file_id, revision_id));
            }
        }
        inventories.insert(revision_id.clone(), inventory);
    }
    let revision_keys: Vec<Key> = order.iter().map(|id| Key::revision(id)).collect();

    let mut stream = vec![Substream::new(
        SubstreamKind::Texts,
        native_records(repo, IndexKind::Text, &text_keys)?,
    )];
    if to_format.serializer == repo.format().serializer {
        stream.push(Substream::new(
            SubstreamKind::Inventories,
            native_records(repo, IndexKind::Inventory, &revision_keys)?,
        ));
    } else {
        stream.push(Substream::new(
            SubstreamKind::InventoryDeltas,
            inventory_delta_records(&order, &local, &inventories)?,
        ));
    }
    stream.push(Substream::new(
        SubstreamKind::Signatures,
        native_records(repo, IndexKind::Signature, &revision_keys)?,
    ));
    stream.push(Substream::new(
        SubstreamKind::Revisions,
        native_records(repo, IndexKind::Revision, &revision_keys)?,
    ));

    if repo.has_fallbacks() && present.len() < wanted.len() {
        let referenced: BTreeSet<RevisionId> = local
            .values()
            .flatten()
            .filter(|p| !present.contains(*p) && !is_null(p))
            .cloned()
            .collect();
        let mut refined = search.refine(&present, &referenced);
        for fallback in repo.fallbacks_mut().iter_mut() {
            if refined.is_empty() {
                break;
            }
            let substreams = fallback.get_stream(&refined, to_format)?;
            let mut seen = BTreeSet::new();
            let mut referenced = BTreeSet::new();
            for substream in substreams.iter().filter(|s| s.kind == SubstreamKind::Revisions) {
                for record in substream.records.iter().filter(|r| !r.is_absent()) {
                    seen.insert(record.key.first().to_vec());
                    referenced.extend(record.parents.iter().flatten().map(|p| p.first().to_vec()));
                }
            }
            referenced.retain(|r| !seen.contains(r));
            refined = refined.refine(&seen, &referenced);
            stream.extend(substreams);
        }
    }
    Ok(normalize_stream(stream))
}

/// Inventories as deltas, each against its first parent when that parent is
/// sent earlier in the same stream and against `null:` otherwise.
fn inventory_delta_records(
    order: &[RevisionId],
    parents: &ParentMap,
    inventories: &BTreeMap<RevisionId, Inventory>,
) -> Result<Vec<ContentRecord>> {
    let empty = Inventory::new(NULL_REVISION);
    let mut records = Vec::new();
    for revision_id in order {
        let Some(inventory) = inventories.get(revision_id) else {
            continue;
        };
        let revision_parents = parents.get(revision_id).cloned().unwrap_or_default();
        let basis = revision_parents
            .first()
            .and_then(|p| inventories.get(p))
            .unwrap_or(&empty);
        let bytes = inventory.delta_from(basis).to_bytes()?;
        let parent_keys = revision_parents
            .iter()
            .filter(|p| !is_null(p))
            .map(|p| Key::revision(p))
            .collect();
        records.push(ContentRecord::fulltext(Key::revision(revision_id), Some(parent_keys), bytes));
    }
    Ok(records)
}

pub(crate) fn missing_keys_stream(
    repo: &mut PackRepository,
    missing: &MissingKeys,
    to_format: &RepositoryFormat,
) -> Result<Stream> {
    repo.lock_read()?;
    let result = missing_keys_stream_locked(repo, missing, to_format);
    let unlocked = repo.unlock();
    let stream = result?;
    unlocked?;
    Ok(stream)
}

fn missing_keys_stream_locked(
    repo: &mut PackRepository,
    missing: &MissingKeys,
    to_format: &RepositoryFormat,
) -> Result<Stream> {
    let mut stream = Vec::new();
    let mut remaining = MissingKeys::new();
    for (kind, key) in missing {
        let Some(index) = index_kind(*kind) else {
            return Err(BzrError::InvalidRecord(format!("cannot send missing {} keys", kind)));
        };
        match repo.collection_mut().get_fulltext(index, key)? {
            Some((entry, text)) => {
                let parents = entry.refs.into_iter().next().unwrap_or_default();
                stream.push(Substream::new(
                    *kind,
                    vec![ContentRecord::fulltext(key.clone(), Some(parents), text)],
                ));
            }
            None => {
                remaining.insert((*kind, key.clone()));
            }
        }
    }
    for fallback in repo.fallbacks_mut().iter_mut() {
        if remaining.is_empty() {
            break;
        }
        for substream in fallback.get_stream_for_missing_keys(&remaining, to_format)? {
            for record in substream.records.into_iter().filter(|r| !r.is_absent()) {
                remaining.remove(&(substream.kind, record.key.clone()));
                stream.push(Substream::new(substream.kind, vec![record]));
            }
        }
    }
    for (kind, key) in remaining {
        stream.push(Substream::new(kind, vec![ContentRecord::absent(key)]));
    }
    Ok(normalize_stream(stream))
}

// ==================== Sink ====================

pub(crate) fn insert_pack_stream(
    repo: &mut PackRepository,
    stream: Stream,
    src_format: &RepositoryFormat,
    resume_tokens: &[String],
) -> Result<(Vec<String>, MissingKeys)> {
    let locked_here = !repo.is_locked();
    if locked_here {
        repo.lock_write(None)?;
    }
    let result = insert_locked(repo, stream, src_format, resume_tokens);
    if locked_here {
        let unlocked = repo.unlock();
        if result.is_ok() {
            unlocked?;
        }
    }
    result
}

fn insert_locked(
    repo: &mut PackRepository,
    stream: Stream,
    src_format: &RepositoryFormat,
    resume_tokens: &[String],
) -> Result<(Vec<String>, MissingKeys)> {
    if resume_tokens.is_empty() {
        repo.start_write_group()?;
    } else {
        repo.resume_write_group(resume_tokens)?;
    }
    if let Err(e) = insert_substreams(repo, stream, src_format) {
        repo.abort_write_group(true)?;
        return Err(e);
    }
    let mut missing = MissingKeys::new();
    for (kind, key) in repo.collection_mut().missing_compression_parents()? {
        missing.insert((substream_kind(kind), key));
    }
    if repo.has_fallbacks() {
        missing.extend(missing_parent_inventories(repo)?);
    }
    if !missing.is_empty() {
        let tokens = repo.suspend_write_group()?;
        debug!("suspending write group on {}: {} keys missing", repo.base(), missing.len());
        return Ok((tokens, missing));
    }
    repo.commit_write_group()?;
    Ok((Vec::new(), MissingKeys::new()))
}

fn insert_substreams(repo: &mut PackRepository, stream: Stream, src_format: &RepositoryFormat) -> Result<()> {
    let own = Arc::clone(repo.serializer());
    let source = if src_format.serializer == repo.format().serializer {
        None
    } else {
        Some(src_format.serializer()?)
    };
    for substream in stream {
        match substream.kind {
            SubstreamKind::Texts => {
                for record in substream.records {
                    insert_content(repo, IndexKind::Text, record, None)?;
                }
            }
            SubstreamKind::Inventories => {
                let convert = source.as_ref().map(|src| (Arc::clone(src), Arc::clone(&own)));
                for record in substream.records {
                    insert_content(repo, IndexKind::Inventory, record, convert.clone())?;
                }
            }
            SubstreamKind::InventoryDeltas => {
                for record in substream.records {
                    insert_inventory_delta(repo, record)?;
                }
            }
            SubstreamKind::Signatures => {
                for record in substream.records.into_iter().filter(|r| !r.is_absent()) {
                    repo.add_signature_text(record.key.first(), &record.bytes)?;
                }
            }
            SubstreamKind::Revisions => {
                for record in substream.records.into_iter().filter(|r| !r.is_absent()) {
                    let bytes = match &source {
                        Some(src) => own.write_revision(&src.read_revision(&record.bytes)?)?,
                        None => record.bytes,
                    };
                    let parents = revision_ids_of(record.parents.as_deref().unwrap_or_default());
                    repo.store_revision_bytes(record.key.first(), &parents, &bytes)?;
                }
            }
        }
    }
    Ok(())
}

type Conversion = (Arc<dyn Serializer>, Arc<dyn Serializer>);

fn insert_content(
    repo: &mut PackRepository,
    kind: IndexKind,
    record: ContentRecord,
    convert: Option<Conversion>,
) -> Result<()> {
    if record.is_absent() || repo.has_local_key(kind, &record.key)? {
        return Ok(());
    }
    let parents = record.parents.clone().unwrap_or_default();
    let text = match &record.kind {
        StorageKind::Absent => return Ok(()),
        StorageKind::Fulltext => record.bytes,
        StorageKind::Delta { basis } => {
            if convert.is_some() {
                return Err(BzrError::InvalidRecord(format!(
                    "delta record {} cannot be converted between serializers",
                    record.key
                )));
            }
            match repo.local_fulltext(kind, basis) {
                Ok(Some(basis_text)) => apply_delta(&basis_text, &record.bytes)?,
                Ok(None) | Err(BzrError::BzrCheckError(_)) => {
                    return repo.store_raw_delta(kind, record.key, parents, basis.clone(), &record.sha, &record.bytes);
                }
                Err(e) => return Err(e),
            }
        }
    };
    if sha_string(&text) != record.sha {
        return Err(BzrError::InvalidRecord(format!("hash mismatch for {}", record.key)));
    }
    let text = match convert {
        Some((src, own)) => own.write_inventory(&src.read_inventory(&text)?)?,
        None => text,
    };
    repo.store_content(kind, record.key, parents, &text)?;
    Ok(())
}

fn insert_inventory_delta(repo: &mut PackRepository, record: ContentRecord) -> Result<()> {
    if record.is_absent() || repo.has_local_key(IndexKind::Inventory, &record.key)? {
        return Ok(());
    }
    let delta = InventoryDelta::from_bytes(&record.bytes)?;
    if delta.new_id != record.key.first() {
        return Err(BzrError::InvalidRecord(format!(
            "inventory delta for {} carried in record {}",
            display_id(&delta.new_id),
            record.key
        )));
    }
    let basis = match repo.get_inventory(&delta.basis_id) {
        Ok(basis) => basis,
        Err(BzrError::NoSuchRevision { .. }) => {
            return Err(BzrError::InvalidRecord(format!(
                "inventory delta basis {} for {} is not present",
                display_id(&delta.basis_id),
                record.key
            )));
        }
        Err(e) => return Err(e),
    };
    let inventory = basis.apply_delta(&delta)?;
    let parents = revision_ids_of(record.parents.as_deref().unwrap_or_default());
    repo.add_inventory(&inventory, &parents)?;
    Ok(())
}

/// Parents of newly inserted revisions whose inventories a stacked
/// repository must hold itself.
fn missing_parent_inventories(repo: &mut PackRepository) -> Result<MissingKeys> {
    let entries = repo.collection_mut().write_group_entries(IndexKind::Revision)?;
    let inserted: BTreeSet<RevisionId> = entries.iter().map(|e| e.key.first().to_vec()).collect();
    let parents: BTreeSet<RevisionId> = entries
        .iter()
        .flat_map(|e| e.refs.first().into_iter().flatten())
        .map(|p| p.first().to_vec())
        .filter(|p| !inserted.contains(p) && !is_null(p))
        .collect();
    let mut missing = MissingKeys::new();
    for parent in parents {
        let key = Key::revision(&parent);
        if repo.has_local_key(IndexKind::Inventory, &key)? {
            continue;
        }
        // Ghosts cannot be supplied by anyone.
        if repo.has_revision(&parent)? {
            missing.insert((SubstreamKind::Inventories, key));
        }
    }
    Ok(missing)
}

// ==================== Search ====================

/// Describe a concrete set of revisions as a search.
pub fn search_result_from_keys(keys: BTreeSet<RevisionId>, parent_map: &ParentMap) -> SearchResult {
    let mut referenced = BTreeSet::new();
    for key in &keys {
        for parent in parent_map.get(key).into_iter().flatten() {
            referenced.insert(parent.clone());
        }
    }
    let start_keys = keys.iter().filter(|k| !referenced.contains(*k)).cloned().collect();
    let exclude_keys = referenced
        .into_iter()
        .filter(|p| !keys.contains(p) && !is_null(p))
        .collect();
    SearchResult::Search {
        start_keys,
        exclude_keys,
        count: keys.len(),
        keys,
    }
}

/// Revisions `source` has that `target` lacks, reachable from
/// `revision_ids` (every source revision when `None`).
pub fn search_missing_revision_ids(
    source: &mut dyn Repository,
    target: &mut dyn Repository,
    revision_ids: Option<&BTreeSet<RevisionId>>,
    find_ghosts: bool,
    limit: Option<usize>,
) -> Result<SearchResult> {
    search_missing_revision_ids_batched(source, target, revision_ids, find_ghosts, limit, DEFAULT_WALK_BATCH_SIZE)
}

pub fn search_missing_revision_ids_batched(
    source: &mut dyn Repository,
    target: &mut dyn Repository,
    revision_ids: Option<&BTreeSet<RevisionId>>,
    find_ghosts: bool,
    limit: Option<usize>,
    batch_size: usize,
) -> Result<SearchResult> {
    let mut revision_ids = match revision_ids {
        Some(ids) => ids.clone(),
        None => source.all_revision_ids()?,
    };
    revision_ids.remove(NULL_REVISION);
    if find_ghosts || limit.is_some() {
        return generic_difference(source, target, &revision_ids, limit);
    }
    walk_to_common_revisions(source, target, &revision_ids, batch_size.max(1))
}

fn walk_to_common_revisions(
    source: &mut dyn Repository,
    target: &mut dyn Repository,
    revision_ids: &BTreeSet<RevisionId>,
    batch_size: usize,
) -> Result<SearchResult> {
    let mut searcher = BreadthFirstSearcher::new(revision_ids.iter().cloned());
    loop {
        let mut next_revs = BTreeSet::new();
        let mut ghosts = BTreeSet::new();
        let mut exhausted = false;
        while next_revs.len() < batch_size {
            match searcher.next_with_ghosts(&mut RepositoryGraph(&mut *source))? {
                Some((present, absent)) => {
                    next_revs.extend(present);
                    ghosts.extend(absent);
                }
                None => {
                    exhausted = true;
                    break;
                }
            }
        }
        let mut ghosts_to_check: BTreeSet<RevisionId> = revision_ids.intersection(&ghosts).cloned().collect();
        let revs_to_get: BTreeSet<RevisionId> = next_revs.union(&ghosts_to_check).cloned().collect();
        if !revs_to_get.is_empty() {
            let mut have: BTreeSet<RevisionId> = target.get_parent_map(&revs_to_get)?.into_keys().collect();
            have.insert(NULL_REVISION.to_vec());
            ghosts_to_check.retain(|g| !have.contains(g));
            if let Some(ghost) = ghosts_to_check.into_iter().next() {
                return Err(BzrError::no_such_revision(source.base(), &ghost));
            }
            let stop = searcher.find_seen_ancestors(&have, &mut RepositoryGraph(&mut *source))?;
            searcher.stop_searching_any(&stop);
        }
        if exhausted {
            break;
        }
    }
    let result = SearchResult::from_searcher(&searcher);
    if let SearchResult::Search { keys, .. } = &result {
        debug!("{} revisions missing from {}", keys.len(), target.base());
    }
    Ok(result)
}

fn generic_difference(
    source: &mut dyn Repository,
    target: &mut dyn Repository,
    revision_ids: &BTreeSet<RevisionId>,
    limit: Option<usize>,
) -> Result<SearchResult> {
    let ancestry = find_ancestry(&mut RepositoryGraph(&mut *source), revision_ids)?;
    for id in revision_ids {
        if !ancestry.contains_key(id) && !target.has_revision(id)? {
            return Err(BzrError::no_such_revision(source.base(), id));
        }
    }
    let present: BTreeSet<RevisionId> = ancestry.keys().filter(|k| !is_null(k)).cloned().collect();
    let have = target.has_revisions(&present)?;
    let missing: ParentMap = ancestry
        .into_iter()
        .filter(|(k, _)| present.contains(k) && !have.contains(k))
        .collect();
    let mut order = topo_sort(&missing)?;
    if let Some(limit) = limit {
        order.truncate(limit);
    }
    Ok(search_result_from_keys(order.into_iter().collect(), &missing))
}

// ==================== Driver ====================

/// Copy what `search` selects from `source` into `target`, filling in keys
/// the first insert reports missing.
pub fn fetch(source: &mut dyn Repository, target: &mut dyn Repository, search: &SearchResult) -> Result<FetchResult> {
    if search.is_empty() {
        return Ok(FetchResult::default());
    }
    source.lock_read()?;
    let result = fetch_locked(source, target, search);
    let unlocked = source.unlock();
    let result = result?;
    unlocked?;
    Ok(result)
}

fn fetch_locked(source: &mut dyn Repository, target: &mut dyn Repository, search: &SearchResult) -> Result<FetchResult> {
    let source_format = source.format();
    let target_format = target.format();
    let stream = source.get_stream(search, &target_format)?;
    let revisions = stream
        .iter()
        .filter(|s| s.kind == SubstreamKind::Revisions)
        .map(|s| s.records.iter().filter(|r| !r.is_absent()).count())
        .sum();
    let (tokens, missing) = target.insert_stream(stream, &source_format, &[])?;
    let mut result = FetchResult { revisions, rounds: 1 };
    if missing.is_empty() {
        info!("fetched {} revisions into {}", revisions, target.base());
        return Ok(result);
    }
    debug!("{} keys missing after first insert into {}, refilling", missing.len(), target.base());
    let stream = source.get_stream_for_missing_keys(&missing, &target_format)?;
    let (tokens, still_missing) = target.insert_stream(stream, &source_format, &tokens)?;
    result.rounds = 2;
    if !still_missing.is_empty() {
        discard_suspended(target, &tokens);
        let keys: Vec<String> = still_missing.iter().map(|(k, key)| format!("{}:{}", k, key)).collect();
        return Err(BzrError::BzrCheckError(format!(
            "keys still missing after fetch into {}: {}",
            target.base(),
            keys.join(", ")
        )));
    }
    info!("fetched {} revisions into {}", revisions, target.base());
    Ok(result)
}

fn discard_suspended(target: &mut dyn Repository, tokens: &[String]) {
    if tokens.is_empty() {
        return;
    }
    let locked_here = !target.is_locked();
    if locked_here {
        if let Err(e) = target.lock_write(None) {
            warn!("could not lock {} to discard suspended write group: {}", target.base(), e);
            return;
        }
    }
    match target.resume_write_group(tokens) {
        Ok(()) => {
            let _ = target.abort_write_group(true);
        }
        Err(e) => warn!("could not discard suspended write group in {}: {}", target.base(), e),
    }
    if locked_here {
        let _ = target.unlock();
    }
}

/// Find and copy the revisions `target` lacks, up to `revision_id` (or
/// everything the source has).
pub fn fetch_revisions(
    source: &mut dyn Repository,
    target: &mut dyn Repository,
    revision_id: Option<&[u8]>,
    find_ghosts: bool,
) -> Result<FetchResult> {
    if revision_id.is_some_and(is_null) {
        return Ok(FetchResult::default());
    }
    let wanted: Option<BTreeSet<RevisionId>> = revision_id.map(|id| [id.to_vec()].into_iter().collect());
    source.lock_read()?;
    let target_locked_here = !target.is_locked();
    if target_locked_here {
        if let Err(e) = target.lock_write(None) {
            let _ = source.unlock();
            return Err(e);
        }
    }
    let result = search_missing_revision_ids(source, target, wanted.as_ref(), find_ghosts, None)
        .and_then(|search| fetch(source, target, &search));
    let mut unlocked = source.unlock();
    if target_locked_here {
        unlocked = unlocked.and(target.unlock());
    }
    let result = result?;
    unlocked?;
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(s: &str) -> RevisionId {
        s.as_bytes().to_vec()
    }

    #[test]
    fn test_normalize_stream_orders_and_merges() {
        let record = |s: &str| ContentRecord::fulltext(Key::revision(s.as_bytes()), None, s.as_bytes().to_vec());
        let stream = vec![
            Substream::new(SubstreamKind::Revisions, vec![record("r1")]),
            Substream::new(SubstreamKind::Texts, vec![record("t1")]),
            Substream::new(SubstreamKind::Signatures, vec![]),
            Substream::new(SubstreamKind::Revisions, vec![record("r2")]),
        ];
        let normalized = normalize_stream(stream);
        let kinds: Vec<SubstreamKind> = normalized.iter().map(|s| s.kind).collect();
        assert_eq!(kinds, vec![SubstreamKind::Texts, SubstreamKind::Revisions]);
        assert_eq!(normalized[1].records.len(), 2);
    }

    #[test]
    fn test_search_result_from_keys() {
        let mut parents = ParentMap::new();
        parents.insert(id("b"), vec![id("a")]);
        parents.insert(id("c"), vec![id("b")]);
        let keys: BTreeSet<RevisionId> = [id("b"), id("c")].into_iter().collect();
        match search_result_from_keys(keys, &parents) {
            SearchResult::Search {
                start_keys,
                exclude_keys,
                count,
                ..
            } => {
                assert_eq!(start_keys, [id("c")].into_iter().collect());
                assert_eq!(exclude_keys, [id("a")].into_iter().collect());
                assert_eq!(count, 2);
            }
            other => panic!("unexpected {:?}", other),
        }
    }
}
