//! Record keys and revision identifiers.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// A revision identifier: an opaque byte string.
pub type RevisionId = Vec<u8>;

/// A file identifier inside an inventory.
pub type FileId = Vec<u8>;

/// The sentinel revision every history chain ends at.
pub const NULL_REVISION: &[u8] = b"null:";

/// Revision id to parent ids.
pub type ParentMap = BTreeMap<RevisionId, Vec<RevisionId>>;

/// Key to parent keys, for any keyspace.
pub type KeyParentMap = BTreeMap<Key, Vec<Key>>;

pub fn is_null(revision_id: &[u8]) -> bool {
    revision_id == NULL_REVISION
}

/// An ordered tuple of byte strings identifying a record.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Key(Vec<Vec<u8>>);

impl Key {
    pub fn new<I, B>(parts: I) -> Self
    where
        I: IntoIterator<Item = B>,
        B: Into<Vec<u8>>,
    {
        Key(parts.into_iter().map(Into::into).collect())
    }

    /// A single-element key, as used for revisions, inventories and signatures.
    pub fn revision(revision_id: &[u8]) -> Self {
        Key(vec![revision_id.to_vec()])
    }

    /// A `(file_id, revision_id)` text key.
    pub fn text(file_id: &[u8], revision_id: &[u8]) -> Self {
        Key(vec![file_id.to_vec(), revision_id.to_vec()])
    }

    pub fn parts(&self) -> &[Vec<u8>] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// The last element, which is the revision id for every keyspace.
    pub fn last(&self) -> &[u8] {
        self.0.last().map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn first(&self) -> &[u8] {
        self.0.first().map(Vec::as_slice).unwrap_or(&[])
    }

    /// True when the leading elements of `self` equal all of `prefix`.
    pub fn starts_with(&self, prefix: &Key) -> bool {
        prefix.0.len() <= self.0.len() && self.0[..prefix.0.len()] == prefix.0[..]
    }

    /// The same key with the last element replaced.
    pub fn with_last(&self, revision_id: &[u8]) -> Key {
        let mut parts = self.0.clone();
        match parts.last_mut() {
            Some(last) => *last = revision_id.to_vec(),
            None => parts.push(revision_id.to_vec()),
        }
        Key(parts)
    }

    /// Encode as elements joined by NUL, the form used inside containers.
    pub fn to_bytes(&self) -> Vec<u8> {
        self.0.join(&b'\x00')
    }

    pub fn from_bytes(bytes: &[u8]) -> Self {
        Key(bytes.split(|b| *b == b'\x00').map(<[u8]>::to_vec).collect())
    }
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Key(")?;
        for (i, part) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{:?}", String::from_utf8_lossy(part))?;
        }
        write!(f, ")")
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<_> = self.0.iter().map(|p| String::from_utf8_lossy(p)).collect();
        write!(f, "{}", parts.join("/"))
    }
}

/// Lossy display helper for revision ids in messages and logs.
pub fn display_id(id: &[u8]) -> String {
    String::from_utf8_lossy(id).into_owned()
}
