//! Revisions, inventories and the serializers that store them.

use crate::errors::{BzrError, Result};
use crate::key::{FileId, RevisionId};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Lowercase hex SHA-256 of `bytes`.
pub fn sha_string(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Immutable revision metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Revision {
    pub revision_id: RevisionId,
    pub parent_ids: Vec<RevisionId>,
    pub committer: String,
    /// Seconds since the epoch.
    pub timestamp: i64,
    /// Offset from UTC in seconds.
    pub timezone: i32,
    pub message: String,
    /// Hash of the revision's inventory, see [`Inventory::sha`].
    pub inventory_sha: String,
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
}

impl Revision {
    /// A revision stamped with the current time.
    pub fn new(revision_id: &[u8], parent_ids: Vec<RevisionId>, committer: &str, message: &str) -> Self {
        let now = chrono::Local::now();
        Self {
            revision_id: revision_id.to_vec(),
            parent_ids,
            committer: committer.to_string(),
            timestamp: now.timestamp(),
            timezone: now.offset().local_minus_utc(),
            message: message.to_string(),
            inventory_sha: String::new(),
            properties: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryKind {
    Directory,
    File,
    Symlink,
    TreeReference,
}

/// One path in a tree snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InventoryEntry {
    pub file_id: FileId,
    pub parent_id: Option<FileId>,
    pub name: String,
    pub kind: EntryKind,
    /// The revision that last changed this entry.
    pub revision: RevisionId,
    pub text_sha: Option<String>,
    pub text_size: Option<u64>,
    #[serde(default)]
    pub executable: bool,
    #[serde(default)]
    pub symlink_target: Option<String>,
}

impl InventoryEntry {
    pub fn directory(file_id: &[u8], parent_id: Option<&[u8]>, name: &str, revision: &[u8]) -> Self {
        Self {
            file_id: file_id.to_vec(),
            parent_id: parent_id.map(<[u8]>::to_vec),
            name: name.to_string(),
            kind: EntryKind::Directory,
            revision: revision.to_vec(),
            text_sha: None,
            text_size: None,
            executable: false,
            symlink_target: None,
        }
    }

    pub fn file(file_id: &[u8], parent_id: &[u8], name: &str, revision: &[u8], text: &[u8]) -> Self {
        Self {
            file_id: file_id.to_vec(),
            parent_id: Some(parent_id.to_vec()),
            name: name.to_string(),
            kind: EntryKind::File,
            revision: revision.to_vec(),
            text_sha: Some(sha_string(text)),
            text_size: Some(text.len() as u64),
            executable: false,
            symlink_target: None,
        }
    }

    /// Whether this entry has a stored text record.
    pub fn has_text(&self) -> bool {
        self.kind == EntryKind::File
    }
}

/// A full snapshot of the tree namespace for one revision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Inventory {
    pub revision_id: RevisionId,
    pub root_id: Option<FileId>,
    pub entries: BTreeMap<FileId, InventoryEntry>,
}

impl Inventory {
    pub fn new(revision_id: &[u8]) -> Self {
        Self {
            revision_id: revision_id.to_vec(),
            root_id: None,
            entries: BTreeMap::new(),
        }
    }

    pub fn add(&mut self, entry: InventoryEntry) {
        if entry.parent_id.is_none() {
            self.root_id = Some(entry.file_id.clone());
        }
        self.entries.insert(entry.file_id.clone(), entry);
    }

    pub fn get(&self, file_id: &[u8]) -> Option<&InventoryEntry> {
        self.entries.get(file_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Serializer-independent content hash, stored in [`Revision::inventory_sha`].
    pub fn sha(&self) -> Result<String> {
        Ok(sha_string(&bincode::serialize(self)?))
    }

    /// The delta that turns `basis` into `self`.
    pub fn delta_from(&self, basis: &Inventory) -> InventoryDelta {
        let mut changes = Vec::new();
        for (file_id, entry) in &self.entries {
            if basis.entries.get(file_id) != Some(entry) {
                changes.push((file_id.clone(), Some(entry.clone())));
            }
        }
        for file_id in basis.entries.keys() {
            if !self.entries.contains_key(file_id) {
                changes.push((file_id.clone(), None));
            }
        }
        InventoryDelta {
            basis_id: basis.revision_id.clone(),
            new_id: self.revision_id.clone(),
            root_id: self.root_id.clone(),
            changes,
        }
    }

    /// Replay a delta whose basis is this inventory.
    pub fn apply_delta(&self, delta: &InventoryDelta) -> Result<Inventory> {
        if delta.basis_id != self.revision_id {
            return Err(BzrError::InvalidRecord(format!(
                "inventory delta against {} applied to {}",
                String::from_utf8_lossy(&delta.basis_id),
                String::from_utf8_lossy(&self.revision_id)
            )));
        }
        let mut result = self.clone();
        result.revision_id = delta.new_id.clone();
        result.root_id = delta.root_id.clone();
        for (file_id, entry) in &delta.changes {
            match entry {
                Some(entry) => {
                    result.entries.insert(file_id.clone(), entry.clone());
                }
                None => {
                    result.entries.remove(file_id);
                }
            }
        }
        Ok(result)
    }
}

/// Changes between two inventories: `basis_id -> new_id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InventoryDelta {
    pub basis_id: RevisionId,
    pub new_id: RevisionId,
    pub root_id: Option<FileId>,
    /// `None` removes the entry.
    pub changes: Vec<(FileId, Option<InventoryEntry>)>,
}

impl InventoryDelta {
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }
}

/// Codec for revision and inventory records. The serializer name is part of
/// the repository format: repositories can only stack on one another when
/// their serializers match.
pub trait Serializer: Send + Sync + fmt::Debug {
    fn name(&self) -> &'static str;

    fn write_revision(&self, revision: &Revision) -> Result<Vec<u8>>;

    fn read_revision(&self, bytes: &[u8]) -> Result<Revision>;

    /// Inventories are written one entry per line so that line deltas
    /// between successive inventories stay small.
    fn write_inventory(&self, inventory: &Inventory) -> Result<Vec<u8>>;

    fn read_inventory(&self, bytes: &[u8]) -> Result<Inventory>;
}

#[derive(Debug, Serialize, Deserialize)]
struct InventoryHeader {
    revision_id: RevisionId,
    root_id: Option<FileId>,
}

fn split_inventory_lines(bytes: &[u8]) -> Result<(&[u8], Vec<&[u8]>)> {
    let mut lines = bytes.split(|b| *b == b'\n').filter(|l| !l.is_empty());
    let header = lines
        .next()
        .ok_or_else(|| BzrError::serialization("empty inventory"))?;
    Ok((header, lines.collect()))
}

/// Default codec: bincode, with inventory lines hex encoded.
#[derive(Debug, Clone, Copy, Default)]
pub struct BincodeSerializer;

impl BincodeSerializer {
    fn encode_line<T: Serialize>(value: &T) -> Result<Vec<u8>> {
        let mut line = hex::encode(bincode::serialize(value)?).into_bytes();
        line.push(b'\n');
        Ok(line)
    }

    fn decode_line<T: for<'de> Deserialize<'de>>(line: &[u8]) -> Result<T> {
        let raw = hex::decode(line).map_err(BzrError::serialization)?;
        Ok(bincode::deserialize(&raw)?)
    }
}

impl Serializer for BincodeSerializer {
    fn name(&self) -> &'static str {
        "bincode-v1"
    }

    fn write_revision(&self, revision: &Revision) -> Result<Vec<u8>> {
        Ok(bincode::serialize(revision)?)
    }

    fn read_revision(&self, bytes: &[u8]) -> Result<Revision> {
        Ok(bincode::deserialize(bytes)?)
    }

    fn write_inventory(&self, inventory: &Inventory) -> Result<Vec<u8>> {
        let mut out = Self::encode_line(&InventoryHeader {
            revision_id: inventory.revision_id.clone(),
            root_id: inventory.root_id.clone(),
        })?;
        for entry in inventory.entries.values() {
            out.extend_from_slice(&Self::encode_line(entry)?);
        }
        Ok(out)
    }

    fn read_inventory(&self, bytes: &[u8]) -> Result<Inventory> {
        let (header, lines) = split_inventory_lines(bytes)?;
        let header: InventoryHeader = Self::decode_line(header)?;
        let mut inventory = Inventory::new(&header.revision_id);
        for line in lines {
            let entry: InventoryEntry = Self::decode_line(line)?;
            inventory.entries.insert(entry.file_id.clone(), entry);
        }
        inventory.root_id = header.root_id;
        Ok(inventory)
    }
}

/// Human-readable codec using JSON lines.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonSerializer;

impl Serializer for JsonSerializer {
    fn name(&self) -> &'static str {
        "json-v1"
    }

    fn write_revision(&self, revision: &Revision) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(revision)?)
    }

    fn read_revision(&self, bytes: &[u8]) -> Result<Revision> {
        Ok(serde_json::from_slice(bytes)?)
    }

    fn write_inventory(&self, inventory: &Inventory) -> Result<Vec<u8>> {
        let mut out = serde_json::to_vec(&InventoryHeader {
            revision_id: inventory.revision_id.clone(),
            root_id: inventory.root_id.clone(),
        })?;
        out.push(b'\n');
        for entry in inventory.entries.values() {
            out.extend_from_slice(&serde_json::to_vec(entry)?);
            out.push(b'\n');
        }
        Ok(out)
    }

    fn read_inventory(&self, bytes: &[u8]) -> Result<Inventory> {
        let (header, lines) = split_inventory_lines(bytes)?;
        let header: InventoryHeader = serde_json::from_slice(header)?;
        let mut inventory = Inventory::new(&header.revision_id);
        for line in lines {
            let entry: InventoryEntry = serde_json::from_slice(line)?;
            inventory.entries.insert(entry.file_id.clone(), entry);
        }
        inventory.root_id = header.root_id;
        Ok(inventory)
    }
}

/// Look up a serializer by name.
pub fn get_serializer(name: &str) -> Result<Arc<dyn Serializer>> {
    match name {
        "bincode-v1" => Ok(Arc::new(BincodeSerializer)),
        "json-v1" => Ok(Arc::new(JsonSerializer)),
        other => Err(BzrError::UnknownFormat(format!("serializer {}", other))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_inventory(revision: &[u8]) -> Inventory {
        let mut inv = Inventory::new(revision);
        inv.add(InventoryEntry::directory(b"root-id", None, "", revision));
        inv.add(InventoryEntry::file(b"file-a", b"root-id", "a.txt", revision, b"hello\n"));
        inv
    }

    #[test]
    fn test_serializers_preserve_inventory() {
        let inv = sample_inventory(b"rev-1");
        for serializer in [get_serializer("bincode-v1").unwrap(), get_serializer("json-v1").unwrap()] {
            let bytes = serializer.write_inventory(&inv).unwrap();
            assert_eq!(serializer.read_inventory(&bytes).unwrap(), inv, "{}", serializer.name());
        }
        assert!(get_serializer("xml5").is_err());
    }

    #[test]
    fn test_inventory_sha_is_serializer_independent() {
        let inv = sample_inventory(b"rev-1");
        let via_json = JsonSerializer
            .read_inventory(&JsonSerializer.write_inventory(&inv).unwrap())
            .unwrap();
        assert_eq!(inv.sha().unwrap(), via_json.sha().unwrap());
    }

    #[test]
    fn test_inventory_delta_replay() {
        let basis = sample_inventory(b"rev-1");
        let mut next = basis.clone();
        next.revision_id = b"rev-2".to_vec();
        next.entries.remove(&b"file-a".to_vec());
        next.add(InventoryEntry::file(b"file-b", b"root-id", "b.txt", b"rev-2", b"new\n"));

        let delta = next.delta_from(&basis);
        assert_eq!(delta.changes.len(), 2);
        let decoded = InventoryDelta::from_bytes(&delta.to_bytes().unwrap()).unwrap();
        assert_eq!(basis.apply_delta(&decoded).unwrap(), next);
        assert!(next.apply_delta(&decoded).is_err());
    }

    #[test]
    fn test_revision_roundtrip_json() {
        let mut rev = Revision::new(b"rev-1", vec![b"null:".to_vec()], "Jo <jo@example.com>", "msg");
        rev.properties.insert("branch-nick".into(), "trunk".into());
        let bytes = JsonSerializer.write_revision(&rev).unwrap();
        assert_eq!(JsonSerializer.read_revision(&bytes).unwrap(), rev);
    }
}
