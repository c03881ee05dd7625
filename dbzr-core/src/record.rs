//! Content records as they travel in streams and as they are stored in packs.

use crate::errors::{BzrError, Result};
use crate::key::Key;
use crate::model::sha_string;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Compression level for record bodies written to packs.
const RECORD_ZSTD_LEVEL: i32 = 3;

/// How a record's bytes relate to its text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StorageKind {
    Fulltext,
    /// A line delta against the fulltext of `basis`.
    Delta { basis: Key },
    /// The source does not have this key.
    Absent,
}

/// A single record in a stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentRecord {
    pub key: Key,
    /// `None` when the source does not know the parents.
    pub parents: Option<Vec<Key>>,
    /// Hash of the fulltext.
    pub sha: String,
    pub kind: StorageKind,
    pub bytes: Vec<u8>,
}

impl ContentRecord {
    pub fn fulltext(key: Key, parents: Option<Vec<Key>>, bytes: Vec<u8>) -> Self {
        Self {
            key,
            parents,
            sha: sha_string(&bytes),
            kind: StorageKind::Fulltext,
            bytes,
        }
    }

    pub fn absent(key: Key) -> Self {
        Self {
            key,
            parents: None,
            sha: String::new(),
            kind: StorageKind::Absent,
            bytes: Vec::new(),
        }
    }

    pub fn is_absent(&self) -> bool {
        self.kind == StorageKind::Absent
    }

    /// The key this record needs present before it can be expanded.
    pub fn compression_parent(&self) -> Option<&Key> {
        match &self.kind {
            StorageKind::Delta { basis } => Some(basis),
            _ => None,
        }
    }
}

/// The record families a stream carries, in the order they are sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum SubstreamKind {
    Texts,
    Inventories,
    InventoryDeltas,
    Signatures,
    Revisions,
}

impl SubstreamKind {
    pub fn name(self) -> &'static str {
        match self {
            SubstreamKind::Texts => "texts",
            SubstreamKind::Inventories => "inventories",
            SubstreamKind::InventoryDeltas => "inventory-deltas",
            SubstreamKind::Signatures => "signatures",
            SubstreamKind::Revisions => "revisions",
        }
    }

    pub fn from_name(name: &str) -> Result<Self> {
        Ok(match name {
            "texts" => SubstreamKind::Texts,
            "inventories" => SubstreamKind::Inventories,
            "inventory-deltas" => SubstreamKind::InventoryDeltas,
            "signatures" => SubstreamKind::Signatures,
            "revisions" => SubstreamKind::Revisions,
            other => return Err(BzrError::InvalidRecord(format!("unknown substream {}", other))),
        })
    }
}

impl fmt::Display for SubstreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A typed run of records.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Substream {
    pub kind: SubstreamKind,
    pub records: Vec<ContentRecord>,
}

impl Substream {
    pub fn new(kind: SubstreamKind, records: Vec<ContentRecord>) -> Self {
        Self { kind, records }
    }
}

/// A fully materialized stream.
pub type Stream = Vec<Substream>;

/// A record body as stored in a pack, after decompression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredRecord {
    pub is_delta: bool,
    pub sha: String,
    pub payload: Vec<u8>,
}

/// Compress a record body: `"{fulltext|delta} {sha}\n" + payload`.
pub fn encode_stored(is_delta: bool, sha: &str, payload: &[u8]) -> Result<Vec<u8>> {
    let mut raw = Vec::with_capacity(payload.len() + sha.len() + 10);
    raw.extend_from_slice(if is_delta { b"delta " } else { b"fulltext " });
    raw.extend_from_slice(sha.as_bytes());
    raw.push(b'\n');
    raw.extend_from_slice(payload);
    Ok(zstd::stream::encode_all(&raw[..], RECORD_ZSTD_LEVEL)?)
}

pub fn decode_stored(body: &[u8]) -> Result<StoredRecord> {
    let raw = zstd::stream::decode_all(body)?;
    let newline = raw
        .iter()
        .position(|b| *b == b'\n')
        .ok_or_else(|| BzrError::InvalidRecord("record body has no header".into()))?;
    let header = std::str::from_utf8(&raw[..newline])
        .map_err(|_| BzrError::InvalidRecord("record header is not utf-8".into()))?;
    let (kind, sha) = header
        .split_once(' ')
        .ok_or_else(|| BzrError::InvalidRecord(format!("bad record header {:?}", header)))?;
    let is_delta = match kind {
        "fulltext" => false,
        "delta" => true,
        other => return Err(BzrError::InvalidRecord(format!("unknown storage kind {}", other))),
    };
    Ok(StoredRecord {
        is_delta,
        sha: sha.to_string(),
        payload: raw[newline + 1..].to_vec(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stored_body() {
        let body = encode_stored(true, "abc123", b"payload\nbytes").unwrap();
        let stored = decode_stored(&body).unwrap();
        assert!(stored.is_delta);
        assert_eq!(stored.sha, "abc123");
        assert_eq!(stored.payload, b"payload\nbytes");
    }

    #[test]
    fn test_bad_stored_header() {
        let body = zstd::stream::encode_all(&b"zip abc\n"[..], 0).unwrap();
        assert!(matches!(decode_stored(&body), Err(BzrError::InvalidRecord(_))));
    }

    #[test]
    fn test_substream_names() {
        for kind in [
            SubstreamKind::Texts,
            SubstreamKind::Inventories,
            SubstreamKind::InventoryDeltas,
            SubstreamKind::Signatures,
            SubstreamKind::Revisions,
        ] {
            assert_eq!(SubstreamKind::from_name(kind.name()).unwrap(), kind);
        }
        assert!(SubstreamKind::from_name("chk_bytes").is_err());
    }

    #[test]
    fn test_record_helpers() {
        let record = ContentRecord::fulltext(Key::revision(b"r"), None, b"x".to_vec());
        assert_eq!(record.sha.len(), 64);
        assert!(record.compression_parent().is_none());
        assert!(ContentRecord::absent(Key::revision(b"gone")).is_absent());
    }
}
