//! Graph indices: sorted maps from key to value plus reference lists.
//!
//! Every pack carries four of these, and `pack-names` is one too. A
//! [`GraphIndexBuilder`] accumulates nodes in memory and serializes them; a
//! [`GraphIndex`] reads a serialized index lazily through a transport; a
//! [`CombinedGraphIndex`] overlays several indices so that a repository can
//! query all its packs at once.
//!
//! On-disk layout:
//!
//! ```text
//! DBZR-GRAPH-INDEX 1\n
//! u32 reference list count | u32 key elements | u64 node count   (little endian)
//! node*: key elements (u32 len + bytes each)
//!        value (u32 len + bytes)
//!        per reference list: u32 ref count, then ref keys
//! ```
//!
//! Nodes are written in ascending key order.

use crate::errors::{BzrError, Result};
use crate::key::Key;
use crate::transport::Transport;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::io::Read;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

pub const GRAPH_INDEX_MAGIC: &[u8] = b"DBZR-GRAPH-INDEX 1\n";

/// Process-unique identity of an index instance.
pub type IndexId = u64;

static NEXT_INDEX_ID: AtomicU64 = AtomicU64::new(1);

fn next_index_id() -> IndexId {
    NEXT_INDEX_ID.fetch_add(1, Ordering::Relaxed)
}

/// One node as returned by a query, tagged with the index that holds it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexEntry {
    pub index: IndexId,
    pub key: Key,
    pub value: Vec<u8>,
    pub refs: Vec<Vec<Key>>,
}

type Node = (Vec<u8>, Vec<Vec<Key>>);

/// Read access shared by every index kind.
///
/// Queries return entries in ascending key order. Results are materialized so
/// they stay valid while the index changes underneath.
pub trait GraphIndexRead: Send + Sync + fmt::Debug {
    fn id(&self) -> IndexId;

    fn key_count(&self) -> Result<usize>;

    fn iter_all_entries(&self) -> Result<Vec<IndexEntry>>;

    /// Entries for the requested keys; absent keys are skipped.
    fn iter_entries(&self, keys: &BTreeSet<Key>) -> Result<Vec<IndexEntry>> {
        Ok(self
            .iter_all_entries()?
            .into_iter()
            .filter(|e| keys.contains(&e.key))
            .collect())
    }

    /// Entries whose leading key elements match one of `prefixes`.
    fn iter_entries_prefix(&self, prefixes: &[Key]) -> Result<Vec<IndexEntry>> {
        Ok(self
            .iter_all_entries()?
            .into_iter()
            .filter(|e| prefixes.iter().any(|p| e.key.starts_with(p)))
            .collect())
    }

    fn validate(&self) -> Result<()>;
}

fn check_key(key: &Key, key_elements: usize) -> Result<()> {
    if key.len() != key_elements
        || key
            .parts()
            .iter()
            .any(|part| part.is_empty() || part.contains(&0) || part.contains(&b'\n'))
    {
        return Err(BzrError::BadIndexKey(format!("{:?}", key)));
    }
    Ok(())
}

fn entries_from(
    id: IndexId,
    nodes: &BTreeMap<Key, Node>,
    keys: Option<&BTreeSet<Key>>,
) -> Vec<IndexEntry> {
    let make = |key: &Key, (value, refs): &Node| IndexEntry {
        index: id,
        key: key.clone(),
        value: value.clone(),
        refs: refs.clone(),
    };
    match keys {
        None => nodes.iter().map(|(k, n)| make(k, n)).collect(),
        Some(keys) => keys
            .iter()
            .filter_map(|k| nodes.get_key_value(k))
            .map(|(k, n)| make(k, n))
            .collect(),
    }
}

// ==================== Builder ====================

#[derive(Debug, Default)]
struct BuilderState {
    nodes: BTreeMap<Key, Node>,
    finished: bool,
}

/// In-memory index under construction.
///
/// Nodes are added through `&self`, so a builder can be shared between the
/// pack that writes it and the combined index that answers queries.
#[derive(Debug)]
pub struct GraphIndexBuilder {
    id: IndexId,
    reference_lists: usize,
    key_elements: usize,
    state: RwLock<BuilderState>,
}

impl GraphIndexBuilder {
    pub fn new(reference_lists: usize, key_elements: usize) -> Self {
        Self {
            id: next_index_id(),
            reference_lists,
            key_elements,
            state: RwLock::new(BuilderState::default()),
        }
    }

    pub fn reference_lists(&self) -> usize {
        self.reference_lists
    }

    pub fn key_elements(&self) -> usize {
        self.key_elements
    }

    pub fn add_node(&self, key: Key, value: Vec<u8>, refs: Vec<Vec<Key>>) -> Result<()> {
        check_key(&key, self.key_elements)?;
        if refs.len() != self.reference_lists {
            return Err(BzrError::BadIndexValue(format!(
                "{} reference lists given, index has {}",
                refs.len(),
                self.reference_lists
            )));
        }
        for reference in refs.iter().flatten() {
            check_key(reference, self.key_elements)?;
        }
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        if state.finished {
            return Err(BzrError::IndexFinished(format!("builder {}", self.id)));
        }
        if state.nodes.contains_key(&key) {
            return Err(BzrError::BadIndexDuplicateKey {
                key: key.to_string(),
                index: format!("builder {}", self.id),
            });
        }
        state.nodes.insert(key, (value, refs));
        Ok(())
    }

    pub fn has_key(&self, key: &Key) -> bool {
        self.state
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .nodes
            .contains_key(key)
    }

    pub fn is_finished(&self) -> bool {
        self.state.read().unwrap_or_else(|e| e.into_inner()).finished
    }

    /// Serialize the index. The builder stays readable but accepts no more
    /// nodes.
    pub fn finish(&self) -> Result<Vec<u8>> {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        state.finished = true;
        Ok(serialize_nodes(
            self.reference_lists,
            self.key_elements,
            &state.nodes,
        ))
    }
}

impl GraphIndexRead for GraphIndexBuilder {
    fn id(&self) -> IndexId {
        self.id
    }

    fn key_count(&self) -> Result<usize> {
        Ok(self.state.read().unwrap_or_else(|e| e.into_inner()).nodes.len())
    }

    fn iter_all_entries(&self) -> Result<Vec<IndexEntry>> {
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        Ok(entries_from(self.id, &state.nodes, None))
    }

    fn iter_entries(&self, keys: &BTreeSet<Key>) -> Result<Vec<IndexEntry>> {
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        Ok(entries_from(self.id, &state.nodes, Some(keys)))
    }

    fn validate(&self) -> Result<()> {
        Ok(())
    }
}

// ==================== Serialization ====================

fn put_bytes(out: &mut Vec<u8>, bytes: &[u8]) {
    out.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
    out.extend_from_slice(bytes);
}

fn put_key(out: &mut Vec<u8>, key: &Key) {
    for part in key.parts() {
        put_bytes(out, part);
    }
}

fn serialize_nodes(reference_lists: usize, key_elements: usize, nodes: &BTreeMap<Key, Node>) -> Vec<u8> {
    let mut out = Vec::with_capacity(GRAPH_INDEX_MAGIC.len() + 16 + nodes.len() * 64);
    out.extend_from_slice(GRAPH_INDEX_MAGIC);
    out.extend_from_slice(&(reference_lists as u32).to_le_bytes());
    out.extend_from_slice(&(key_elements as u32).to_le_bytes());
    out.extend_from_slice(&(nodes.len() as u64).to_le_bytes());
    for (key, (value, refs)) in nodes {
        put_key(&mut out, key);
        put_bytes(&mut out, value);
        for list in refs {
            out.extend_from_slice(&(list.len() as u32).to_le_bytes());
            for reference in list {
                put_key(&mut out, reference);
            }
        }
    }
    out
}

#[derive(Debug)]
struct ParsedIndex {
    reference_lists: usize,
    key_elements: usize,
    nodes: BTreeMap<Key, Node>,
}

struct IndexReader<'a> {
    input: &'a [u8],
    name: &'a str,
}

impl IndexReader<'_> {
    fn bad(&self, what: &str) -> BzrError {
        BzrError::BadIndexData(format!("{}: {}", self.name, what))
    }

    fn u32(&mut self) -> Result<u32> {
        let mut buf = [0u8; 4];
        self.input.read_exact(&mut buf).map_err(|_| self.bad("truncated"))?;
        Ok(u32::from_le_bytes(buf))
    }

    fn u64(&mut self) -> Result<u64> {
        let mut buf = [0u8; 8];
        self.input.read_exact(&mut buf).map_err(|_| self.bad("truncated"))?;
        Ok(u64::from_le_bytes(buf))
    }

    fn bytes(&mut self) -> Result<Vec<u8>> {
        let len = self.u32()? as usize;
        if len > self.input.len() {
            return Err(self.bad("length past end of data"));
        }
        let mut buf = vec![0u8; len];
        self.input.read_exact(&mut buf).map_err(|_| self.bad("truncated"))?;
        Ok(buf)
    }

    fn key(&mut self, elements: usize) -> Result<Key> {
        let parts = (0..elements).map(|_| self.bytes()).collect::<Result<Vec<_>>>()?;
        Ok(Key::new(parts))
    }
}

fn parse_index(name: &str, data: &[u8]) -> Result<ParsedIndex> {
    let body = data
        .strip_prefix(GRAPH_INDEX_MAGIC)
        .ok_or_else(|| BzrError::BadIndexData(format!("{}: bad magic", name)))?;
    let mut reader = IndexReader { input: body, name };
    let reference_lists = reader.u32()? as usize;
    let key_elements = reader.u32()? as usize;
    let count = reader.u64()?;
    let mut nodes = BTreeMap::new();
    let mut previous: Option<Key> = None;
    for _ in 0..count {
        let key = reader.key(key_elements)?;
        let value = reader.bytes()?;
        let mut refs = Vec::with_capacity(reference_lists);
        for _ in 0..reference_lists {
            let n = reader.u32()? as usize;
            let list = (0..n)
                .map(|_| reader.key(key_elements))
                .collect::<Result<Vec<_>>>()?;
            refs.push(list);
        }
        if previous.as_ref().is_some_and(|p| p >= &key) {
            return Err(reader.bad("keys out of order"));
        }
        previous = Some(key.clone());
        nodes.insert(key, (value, refs));
    }
    if !reader.input.is_empty() {
        return Err(reader.bad("trailing data"));
    }
    Ok(ParsedIndex {
        reference_lists,
        key_elements,
        nodes,
    })
}

// ==================== On-disk index ====================

/// A serialized index read through a transport on first use.
#[derive(Debug)]
pub struct GraphIndex {
    id: IndexId,
    transport: Arc<dyn Transport>,
    name: String,
    size: Option<u64>,
    parsed: Mutex<Option<Arc<ParsedIndex>>>,
}

impl GraphIndex {
    /// `size` is the expected file size when known (from `pack-names`).
    pub fn new(transport: Arc<dyn Transport>, name: &str, size: Option<u64>) -> Self {
        Self {
            id: next_index_id(),
            transport,
            name: name.to_string(),
            size,
            parsed: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn load(&self) -> Result<Arc<ParsedIndex>> {
        let mut slot = self.parsed.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(parsed) = slot.as_ref() {
            return Ok(Arc::clone(parsed));
        }
        let data = self.transport.get_bytes(&self.name)?;
        if let Some(size) = self.size {
            if size != data.len() as u64 {
                return Err(BzrError::BadIndexData(format!(
                    "{}: expected {} bytes, found {}",
                    self.name,
                    size,
                    data.len()
                )));
            }
        }
        let parsed = Arc::new(parse_index(&self.name, &data)?);
        *slot = Some(Arc::clone(&parsed));
        Ok(parsed)
    }

    pub fn reference_lists(&self) -> Result<usize> {
        Ok(self.load()?.reference_lists)
    }

    pub fn key_elements(&self) -> Result<usize> {
        Ok(self.load()?.key_elements)
    }
}

impl GraphIndexRead for GraphIndex {
    fn id(&self) -> IndexId {
        self.id
    }

    fn key_count(&self) -> Result<usize> {
        Ok(self.load()?.nodes.len())
    }

    fn iter_all_entries(&self) -> Result<Vec<IndexEntry>> {
        Ok(entries_from(self.id, &self.load()?.nodes, None))
    }

    fn iter_entries(&self, keys: &BTreeSet<Key>) -> Result<Vec<IndexEntry>> {
        Ok(entries_from(self.id, &self.load()?.nodes, Some(keys)))
    }

    fn validate(&self) -> Result<()> {
        let parsed = self.load()?;
        for (key, (_, refs)) in &parsed.nodes {
            check_key(key, parsed.key_elements)?;
            if refs.len() != parsed.reference_lists {
                return Err(BzrError::BadIndexData(format!("{}: bad reference lists", self.name)));
            }
        }
        Ok(())
    }
}

/// Parse serialized index bytes without a transport.
pub fn parse_index_bytes(name: &str, data: &[u8]) -> Result<Vec<IndexEntry>> {
    let parsed = parse_index(name, data)?;
    Ok(entries_from(0, &parsed.nodes, None))
}

// ==================== Combined ====================

/// An ordered overlay of indices. On duplicate keys the earliest member wins,
/// and new members are normally inserted at the front.
#[derive(Debug)]
pub struct CombinedGraphIndex {
    id: IndexId,
    indices: RwLock<Vec<Arc<dyn GraphIndexRead>>>,
}

impl Default for CombinedGraphIndex {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

impl CombinedGraphIndex {
    pub fn new(indices: Vec<Arc<dyn GraphIndexRead>>) -> Self {
        Self {
            id: next_index_id(),
            indices: RwLock::new(indices),
        }
    }

    /// Insert a member at `position` (clamped to the member count).
    pub fn insert_index(&self, position: usize, index: Arc<dyn GraphIndexRead>) {
        let mut indices = self.indices.write().unwrap_or_else(|e| e.into_inner());
        let position = position.min(indices.len());
        indices.insert(position, index);
    }

    /// Remove a member by identity. Returns whether it was present.
    pub fn remove_index(&self, id: IndexId) -> bool {
        let mut indices = self.indices.write().unwrap_or_else(|e| e.into_inner());
        let before = indices.len();
        indices.retain(|i| i.id() != id);
        indices.len() != before
    }

    pub fn clear(&self) {
        self.indices.write().unwrap_or_else(|e| e.into_inner()).clear();
    }

    /// A snapshot of the member list.
    pub fn indices(&self) -> Vec<Arc<dyn GraphIndexRead>> {
        self.indices.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn len(&self) -> usize {
        self.indices.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn overlay<F>(&self, mut query: F) -> Result<Vec<IndexEntry>>
    where
        F: FnMut(&dyn GraphIndexRead) -> Result<Vec<IndexEntry>>,
    {
        let mut merged: BTreeMap<Key, IndexEntry> = BTreeMap::new();
        for index in self.indices() {
            for entry in query(index.as_ref())? {
                merged.entry(entry.key.clone()).or_insert(entry);
            }
        }
        Ok(merged.into_values().collect())
    }
}

impl GraphIndexRead for CombinedGraphIndex {
    fn id(&self) -> IndexId {
        self.id
    }

    fn key_count(&self) -> Result<usize> {
        Ok(self.iter_all_entries()?.len())
    }

    fn iter_all_entries(&self) -> Result<Vec<IndexEntry>> {
        self.overlay(|index| index.iter_all_entries())
    }

    fn iter_entries(&self, keys: &BTreeSet<Key>) -> Result<Vec<IndexEntry>> {
        self.overlay(|index| index.iter_entries(keys))
    }

    fn iter_entries_prefix(&self, prefixes: &[Key]) -> Result<Vec<IndexEntry>> {
        self.overlay(|index| index.iter_entries_prefix(prefixes))
    }

    fn validate(&self) -> Result<()> {
        for index in self.indices() {
            index.validate()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MemoryTransport;

    fn rev(id: &str) -> Key {
        Key::revision(id.as_bytes())
    }

    fn sample_builder() -> GraphIndexBuilder {
        let builder = GraphIndexBuilder::new(1, 1);
        builder.add_node(rev("b"), b"2".to_vec(), vec![vec![rev("a")]]).unwrap();
        builder.add_node(rev("a"), b"1".to_vec(), vec![vec![]]).unwrap();
        builder
    }

    #[test]
    fn test_builder_rejects_bad_nodes() {
        let builder = sample_builder();
        assert!(matches!(
            builder.add_node(rev("a"), vec![], vec![vec![]]),
            Err(BzrError::BadIndexDuplicateKey { .. })
        ));
        assert!(matches!(
            builder.add_node(Key::text(b"f", b"r"), vec![], vec![vec![]]),
            Err(BzrError::BadIndexKey(_))
        ));
        assert!(matches!(
            builder.add_node(rev("c"), vec![], vec![]),
            Err(BzrError::BadIndexValue(_))
        ));
        builder.finish().unwrap();
        assert!(matches!(
            builder.add_node(rev("c"), vec![], vec![vec![]]),
            Err(BzrError::IndexFinished(_))
        ));
        // Still readable after finish.
        assert_eq!(builder.key_count().unwrap(), 2);
    }

    #[test]
    fn test_serialized_index_roundtrip_through_transport() {
        let builder = sample_builder();
        let bytes = builder.finish().unwrap();
        let t: Arc<dyn Transport> = Arc::new(MemoryTransport::new());
        t.put_bytes("x.rix", &bytes).unwrap();

        let index = GraphIndex::new(Arc::clone(&t), "x.rix", Some(bytes.len() as u64));
        index.validate().unwrap();
        let entries = index.iter_all_entries().unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].key, rev("a"));
        assert_eq!(entries[1].refs, vec![vec![rev("a")]]);

        let wanted: BTreeSet<Key> = [rev("b"), rev("zz")].into_iter().collect();
        let found = index.iter_entries(&wanted).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].value, b"2");
    }

    #[test]
    fn test_corrupt_index() {
        let t: Arc<dyn Transport> = Arc::new(MemoryTransport::new());
        t.put_bytes("bad", b"not an index").unwrap();
        let index = GraphIndex::new(Arc::clone(&t), "bad", None);
        assert!(matches!(index.key_count(), Err(BzrError::BadIndexData(_))));

        let mut bytes = sample_builder().finish().unwrap();
        bytes.truncate(bytes.len() - 3);
        t.put_bytes("short", &bytes).unwrap();
        let index = GraphIndex::new(Arc::clone(&t), "short", None);
        assert!(matches!(index.iter_all_entries(), Err(BzrError::BadIndexData(_))));
    }

    #[test]
    fn test_prefix_query() {
        let builder = GraphIndexBuilder::new(0, 2);
        builder.add_node(Key::text(b"f1", b"r1"), vec![], vec![]).unwrap();
        builder.add_node(Key::text(b"f1", b"r2"), vec![], vec![]).unwrap();
        builder.add_node(Key::text(b"f2", b"r1"), vec![], vec![]).unwrap();
        let found = builder.iter_entries_prefix(&[Key::revision(b"f1")]).unwrap();
        assert_eq!(found.len(), 2);
    }

    #[test]
    fn test_combined_precedence_and_snapshot() {
        let old = Arc::new(GraphIndexBuilder::new(0, 1));
        old.add_node(rev("a"), b"old".to_vec(), vec![]).unwrap();
        let new = Arc::new(GraphIndexBuilder::new(0, 1));
        new.add_node(rev("a"), b"new".to_vec(), vec![]).unwrap();
        new.add_node(rev("b"), b"new".to_vec(), vec![]).unwrap();

        let combined = CombinedGraphIndex::default();
        combined.insert_index(0, old.clone());
        combined.insert_index(0, new.clone());
        let entries = combined.iter_all_entries().unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].value, b"new");
        assert_eq!(entries[0].index, new.id());

        let snapshot = combined.indices();
        assert!(combined.remove_index(new.id()));
        assert!(!combined.remove_index(new.id()));
        assert_eq!(snapshot.len(), 2);
        assert_eq!(combined.iter_all_entries().unwrap()[0].value, b"old");
        assert_eq!(combined.key_count().unwrap(), 1);
    }
}
