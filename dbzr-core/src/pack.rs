//! Packs: immutable record containers plus their four graph indices.
//!
//! Layout under a repository directory:
//!
//! ```text
//! packs/<name>.pack            finished pack data
//! indices/<name>.{rix,iix,tix,six}
//! upload/<random>.pack         pack being written
//! upload/<name>.pack + indices suspended write group
//! ```
//!
//! A pack's name is the hex SHA-256 of its data, so it is known only once the
//! pack is finished.

use crate::container::{self, CONTAINER_MAGIC};
use crate::errors::{BzrError, Result};
use crate::graph_index::{GraphIndex, GraphIndexBuilder, GraphIndexRead};
use crate::key::Key;
use crate::transport::Transport;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tracing::debug;

pub const PACK_SUFFIX: &str = ".pack";

/// Sizes of the four indices, in [`IndexKind::slot`] order.
pub type IndexSizes = [u64; 4];

/// The four per-pack indices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum IndexKind {
    Revision,
    Inventory,
    Text,
    Signature,
}

impl IndexKind {
    pub const ALL: [IndexKind; 4] = [
        IndexKind::Revision,
        IndexKind::Inventory,
        IndexKind::Text,
        IndexKind::Signature,
    ];

    pub fn suffix(self) -> &'static str {
        match self {
            IndexKind::Revision => ".rix",
            IndexKind::Inventory => ".iix",
            IndexKind::Text => ".tix",
            IndexKind::Signature => ".six",
        }
    }

    /// Position of this index's size in a `pack-names` value.
    pub fn slot(self) -> usize {
        match self {
            IndexKind::Revision => 0,
            IndexKind::Inventory => 1,
            IndexKind::Text => 2,
            IndexKind::Signature => 3,
        }
    }

    /// Revisions keep parents; inventories and texts keep parents and the
    /// compression parent; signatures keep nothing.
    pub fn reference_lists(self) -> usize {
        match self {
            IndexKind::Revision => 1,
            IndexKind::Inventory | IndexKind::Text => 2,
            IndexKind::Signature => 0,
        }
    }

    pub fn key_elements(self) -> usize {
        match self {
            IndexKind::Text => 2,
            _ => 1,
        }
    }
}

/// Encode an index value pointing at a record.
pub fn index_value(offset: u64, length: u64) -> Vec<u8> {
    format!("{} {}", offset, length).into_bytes()
}

pub fn parse_index_value(value: &[u8]) -> Result<(u64, u64)> {
    let bad = || BzrError::BadIndexValue(String::from_utf8_lossy(value).into_owned());
    let text = std::str::from_utf8(value).map_err(|_| bad())?;
    let (offset, length) = text.split_once(' ').ok_or_else(bad)?;
    Ok((
        offset.parse().map_err(|_| bad())?,
        length.parse().map_err(|_| bad())?,
    ))
}

/// A valid pack name: 64 lowercase hex characters.
pub fn is_pack_name(name: &str) -> bool {
    name.len() == 64 && name.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}

// ==================== Writer ====================

/// Buffered appender that hashes everything it writes.
#[derive(Debug)]
pub struct PackWriter {
    transport: Arc<dyn Transport>,
    path: String,
    buffer: Vec<u8>,
    cache_limit: usize,
    written: u64,
    hasher: Sha256,
}

impl PackWriter {
    /// Start a container at `path`. The file appears on the first flush.
    pub fn new(transport: Arc<dyn Transport>, path: &str, cache_limit: usize) -> Result<Self> {
        let mut writer = Self {
            transport,
            path: path.to_string(),
            buffer: Vec::new(),
            cache_limit,
            written: 0,
            hasher: Sha256::new(),
        };
        writer.write(CONTAINER_MAGIC)?;
        Ok(writer)
    }

    /// Append bytes, returning where they landed.
    pub fn write(&mut self, bytes: &[u8]) -> Result<(u64, u64)> {
        let offset = self.written;
        self.buffer.extend_from_slice(bytes);
        self.hasher.update(bytes);
        self.written += bytes.len() as u64;
        if self.buffer.len() > self.cache_limit {
            self.flush()?;
        }
        Ok((offset, bytes.len() as u64))
    }

    pub fn flush(&mut self) -> Result<()> {
        if !self.buffer.is_empty() {
            self.transport.append_bytes(&self.path, &self.buffer)?;
            self.buffer.clear();
        }
        Ok(())
    }

    pub fn bytes_written(&self) -> u64 {
        self.written
    }

    pub fn hex_digest(&self) -> String {
        hex::encode(self.hasher.clone().finalize())
    }
}

// ==================== Readers ====================

fn open_indices(transport: &Arc<dyn Transport>, name: &str, sizes: &IndexSizes) -> [Arc<GraphIndex>; 4] {
    IndexKind::ALL.map(|kind| {
        Arc::new(GraphIndex::new(
            Arc::clone(transport),
            &format!("{}{}", name, kind.suffix()),
            Some(sizes[kind.slot()]),
        ))
    })
}

/// A finished pack, read-only.
#[derive(Debug)]
pub struct ExistingPack {
    name: String,
    data_transport: Arc<dyn Transport>,
    index_transport: Arc<dyn Transport>,
    index_sizes: IndexSizes,
    indices: [Arc<GraphIndex>; 4],
}

impl ExistingPack {
    /// Open `packs/<name>.pack` with indices from `indices/`.
    pub fn open(repo_transport: &Arc<dyn Transport>, name: &str, index_sizes: IndexSizes) -> Result<Self> {
        let data_transport = repo_transport.clone_to("packs")?;
        let index_transport = repo_transport.clone_to("indices")?;
        Ok(Self::with_transports(name, data_transport, index_transport, index_sizes))
    }

    fn with_transports(
        name: &str,
        data_transport: Arc<dyn Transport>,
        index_transport: Arc<dyn Transport>,
        index_sizes: IndexSizes,
    ) -> Self {
        let indices = open_indices(&index_transport, name, &index_sizes);
        Self {
            name: name.to_string(),
            data_transport,
            index_transport,
            index_sizes,
            indices,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn index_sizes(&self) -> IndexSizes {
        self.index_sizes
    }

    pub fn index(&self, kind: IndexKind) -> Arc<GraphIndex> {
        Arc::clone(&self.indices[kind.slot()])
    }

    pub fn file_name(&self) -> String {
        format!("{}{}", self.name, PACK_SUFFIX)
    }

    pub fn data_transport(&self) -> &Arc<dyn Transport> {
        &self.data_transport
    }

    pub fn index_transport(&self) -> &Arc<dyn Transport> {
        &self.index_transport
    }

    pub fn revision_count(&self) -> Result<usize> {
        self.indices[IndexKind::Revision.slot()].key_count()
    }

    /// Read raw container records by `(offset, length)`.
    pub fn readv(&self, offsets: &[(u64, u64)]) -> Result<Vec<Vec<u8>>> {
        self.data_transport.readv(&self.file_name(), offsets)
    }
}

/// A pack left in `upload/` by a suspended write group.
#[derive(Debug)]
pub struct ResumedPack {
    pack: Arc<ExistingPack>,
    upload_transport: Arc<dyn Transport>,
}

impl ResumedPack {
    pub fn resume(repo_transport: &Arc<dyn Transport>, token: &str) -> Result<Self> {
        let unresumable = |reason: &str| BzrError::UnresumableWriteGroup {
            repository: repo_transport.base(),
            tokens: vec![token.to_string()],
            reason: reason.to_string(),
        };
        if !is_pack_name(token) {
            return Err(unresumable("malformed write group token"));
        }
        let upload = repo_transport.clone_to("upload")?;
        if !upload.has(&format!("{}{}", token, PACK_SUFFIX))? {
            return Err(unresumable("missing suspended pack"));
        }
        let mut sizes = [0u64; 4];
        for kind in IndexKind::ALL {
            match upload.stat(&format!("{}{}", token, kind.suffix())) {
                Ok(stat) => sizes[kind.slot()] = stat.size,
                Err(e) if e.is_no_such_file() => return Err(unresumable("missing suspended index")),
                Err(e) => return Err(e),
            }
        }
        let pack = ExistingPack::with_transports(token, Arc::clone(&upload), Arc::clone(&upload), sizes);
        for kind in IndexKind::ALL {
            pack.index(kind).validate().map_err(|e| unresumable(&e.to_string()))?;
        }
        Ok(Self {
            pack: Arc::new(pack),
            upload_transport: upload,
        })
    }

    pub fn pack(&self) -> &Arc<ExistingPack> {
        &self.pack
    }

    pub fn name(&self) -> &str {
        self.pack.name()
    }

    /// Move the pack and its indices into the live directories.
    pub fn finish(&self) -> Result<()> {
        let name = self.pack.name();
        for kind in IndexKind::ALL {
            let file = format!("{}{}", name, kind.suffix());
            self.upload_transport.rename(&file, &format!("../indices/{}", file))?;
        }
        let file = self.pack.file_name();
        self.upload_transport.rename(&file, &format!("../packs/{}", file))?;
        debug!("finished resumed pack {}", name);
        Ok(())
    }

    /// Delete the suspended files.
    pub fn abort(&self) -> Result<()> {
        let name = self.pack.name();
        for kind in IndexKind::ALL {
            delete_if_present(&self.upload_transport, &format!("{}{}", name, kind.suffix()))?;
        }
        delete_if_present(&self.upload_transport, &self.pack.file_name())
    }
}

fn delete_if_present(transport: &Arc<dyn Transport>, path: &str) -> Result<()> {
    match transport.delete(path) {
        Ok(()) => Ok(()),
        Err(e) if e.is_no_such_file() => Ok(()),
        Err(e) => Err(e),
    }
}

// ==================== New pack ====================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PackState {
    Open,
    Finished,
    Aborted,
}

/// The single writable pack of a write group.
#[derive(Debug)]
pub struct NewPack {
    upload_transport: Arc<dyn Transport>,
    index_transport: Arc<dyn Transport>,
    random_name: String,
    writer: PackWriter,
    indices: [Arc<GraphIndexBuilder>; 4],
    name: Option<String>,
    index_sizes: Option<IndexSizes>,
    state: PackState,
}

impl NewPack {
    pub fn new(repo_transport: &Arc<dyn Transport>, cache_limit: usize) -> Result<Self> {
        let upload_transport = repo_transport.clone_to("upload")?;
        let index_transport = repo_transport.clone_to("indices")?;
        let random_name = format!("{}{}", uuid::Uuid::new_v4().simple(), PACK_SUFFIX);
        let writer = PackWriter::new(Arc::clone(&upload_transport), &random_name, cache_limit)?;
        let indices = IndexKind::ALL.map(|kind| Arc::new(GraphIndexBuilder::new(kind.reference_lists(), kind.key_elements())));
        debug!("started new pack upload/{}", random_name);
        Ok(Self {
            upload_transport,
            index_transport,
            random_name,
            writer,
            indices,
            name: None,
            index_sizes: None,
            state: PackState::Open,
        })
    }

    pub fn index(&self, kind: IndexKind) -> Arc<GraphIndexBuilder> {
        Arc::clone(&self.indices[kind.slot()])
    }

    pub fn state(&self) -> PackState {
        self.state
    }

    /// Name, available once finished.
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn index_sizes(&self) -> Option<IndexSizes> {
        self.index_sizes
    }

    fn check_open(&self) -> Result<()> {
        if self.state != PackState::Open {
            return Err(BzrError::BzrCheckError(format!(
                "pack upload/{} is {:?}",
                self.random_name, self.state
            )));
        }
        Ok(())
    }

    /// Store `body` under `key` and index it.
    pub fn add_record(&mut self, kind: IndexKind, key: Key, refs: Vec<Vec<Key>>, body: &[u8]) -> Result<()> {
        let record = container::encode_record(&key, body);
        self.add_raw_record(kind, key, refs, &record)
    }

    /// Store an already framed container record, as copied from another pack.
    pub fn add_raw_record(&mut self, kind: IndexKind, key: Key, refs: Vec<Vec<Key>>, record: &[u8]) -> Result<()> {
        self.check_open()?;
        let index = &self.indices[kind.slot()];
        if index.has_key(&key) {
            return Err(BzrError::BadIndexDuplicateKey {
                key: key.to_string(),
                index: format!("upload/{}{}", self.random_name, kind.suffix()),
            });
        }
        let (offset, length) = self.writer.write(record)?;
        index.add_node(key, index_value(offset, length), refs)
    }

    /// True when any index has keys.
    pub fn data_inserted(&self) -> bool {
        self.indices
            .iter()
            .any(|index| index.key_count().map(|n| n > 0).unwrap_or(false))
    }

    /// Read records written so far.
    pub fn readv(&mut self, offsets: &[(u64, u64)]) -> Result<Vec<Vec<u8>>> {
        self.writer.flush()?;
        self.upload_transport.readv(&self.random_name, offsets)
    }

    /// Seal the pack. With `suspend` the result stays in `upload/` so the
    /// write group can be resumed later; otherwise it goes live in `packs/`
    /// and `indices/`. The caller still has to register the name.
    pub fn finish(&mut self, suspend: bool) -> Result<()> {
        self.check_open()?;
        self.writer.write(container::end_marker())?;
        self.writer.flush()?;
        let name = self.writer.hex_digest();
        let index_target = if suspend {
            &self.upload_transport
        } else {
            &self.index_transport
        };
        let mut sizes = [0u64; 4];
        for kind in IndexKind::ALL {
            let bytes = self.indices[kind.slot()].finish()?;
            index_target.put_bytes(&format!("{}{}", name, kind.suffix()), &bytes)?;
            sizes[kind.slot()] = bytes.len() as u64;
        }
        let target = if suspend {
            format!("{}{}", name, PACK_SUFFIX)
        } else {
            format!("../packs/{}{}", name, PACK_SUFFIX)
        };
        self.upload_transport.rename(&self.random_name, &target)?;
        debug!(
            "finished pack {} ({} bytes, suspended: {})",
            name,
            self.writer.bytes_written(),
            suspend
        );
        self.name = Some(name);
        self.index_sizes = Some(sizes);
        self.state = PackState::Finished;
        Ok(())
    }

    /// Discard the pack. No index is written.
    pub fn abort(&mut self) -> Result<()> {
        if self.state == PackState::Open {
            self.state = PackState::Aborted;
            delete_if_present(&self.upload_transport, &self.random_name)?;
        }
        Ok(())
    }
}
