//! A repository backed by a pack collection on a transport.
//!
//! Layout of the repository directory:
//!
//! ```text
//! format             network name of the repository format
//! repository.json    tunables
//! lock/              write lock
//! pack-names packs/ indices/ upload/ obsolete_packs/
//! ```

use crate::check::{self, CheckReport, ReconcileResult};
use crate::config::RepositoryConfig;
use crate::delta::make_delta;
use crate::errors::{BzrError, Result};
use crate::fetch;
use crate::graph::lefthand_history;
use crate::graph_index::GraphIndexRead;
use crate::key::{Key, NULL_REVISION, ParentMap, RevisionId, display_id, is_null};
use crate::lockdir::LockDir;
use crate::model::{Inventory, Revision, Serializer, sha_string};
use crate::pack::IndexKind;
use crate::pack_collection::PackCollection;
use crate::record::{Stream, encode_stored};
use crate::graph::SearchResult;
use crate::repository::{
    LockMode, MissingKeys, Repository, RepositoryFormat, RepositoryGraph, RevnoLookup, check_fallback_compatible,
};
use crate::transport::Transport;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, warn};

pub const FORMAT_FILE: &str = "format";
const LOCK_DIR: &str = "lock";

pub struct PackRepository {
    transport: Arc<dyn Transport>,
    format: RepositoryFormat,
    serializer: Arc<dyn Serializer>,
    config: RepositoryConfig,
    collection: PackCollection,
    lock: LockDir,
    lock_mode: Option<LockMode>,
    lock_count: usize,
    fallbacks: Vec<Box<dyn Repository>>,
}

impl std::fmt::Debug for PackRepository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PackRepository")
            .field("base", &self.transport.base())
            .field("format", &self.format.network_name)
            .field("lock_mode", &self.lock_mode)
            .field("fallbacks", &self.fallbacks.len())
            .finish()
    }
}

fn revision_keys<'a>(ids: impl IntoIterator<Item = &'a RevisionId>) -> Vec<Key> {
    ids.into_iter().filter(|id| !is_null(id)).map(|id| Key::revision(id)).collect()
}

impl PackRepository {
    /// Create an empty repository in the (existing) directory of `transport`.
    pub fn create(transport: Arc<dyn Transport>, format: &RepositoryFormat) -> Result<Self> {
        if transport.has(FORMAT_FILE)? {
            return Err(BzrError::FileExists(format!("{}{}", transport.base(), FORMAT_FILE)));
        }
        PackCollection::create(&transport)?;
        RepositoryConfig::default().save(transport.as_ref())?;
        LockDir::new(Arc::clone(&transport), LOCK_DIR).create()?;
        transport.put_bytes(FORMAT_FILE, format!("{}\n", format.network_name).as_bytes())?;
        debug!("created repository {} ({})", transport.base(), format.network_name);
        Self::open(transport)
    }

    pub fn open(transport: Arc<dyn Transport>) -> Result<Self> {
        let format_bytes = match transport.get_bytes(FORMAT_FILE) {
            Ok(bytes) => bytes,
            Err(e) if e.is_no_such_file() => return Err(BzrError::NoRepositoryPresent(transport.base())),
            Err(e) => return Err(e),
        };
        let format = RepositoryFormat::from_network_name(&String::from_utf8_lossy(&format_bytes))?;
        let serializer = format.serializer()?;
        let config = RepositoryConfig::load(transport.as_ref())?;
        let collection = PackCollection::new(Arc::clone(&transport), config.clone());
        let lock = LockDir::new(Arc::clone(&transport), LOCK_DIR);
        Ok(Self {
            transport,
            format,
            serializer,
            config,
            collection,
            lock,
            lock_mode: None,
            lock_count: 0,
            fallbacks: Vec::new(),
        })
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub fn config(&self) -> &RepositoryConfig {
        &self.config
    }

    pub fn serializer(&self) -> &Arc<dyn Serializer> {
        &self.serializer
    }

    pub(crate) fn collection_mut(&mut self) -> &mut PackCollection {
        &mut self.collection
    }

    pub(crate) fn fallbacks_mut(&mut self) -> &mut Vec<Box<dyn Repository>> {
        &mut self.fallbacks
    }

    pub(crate) fn ensure_loaded(&mut self) -> Result<()> {
        self.collection.ensure_loaded(self.lock_mode.is_some())?;
        Ok(())
    }

    /// Names of the live packs.
    pub fn pack_names(&mut self) -> Result<Vec<String>> {
        self.ensure_loaded()?;
        Ok(self.collection.names())
    }

    /// Files waiting in `obsolete_packs/`.
    pub fn obsolete_pack_files(&self) -> Result<Vec<String>> {
        self.collection.obsolete_pack_files()
    }

    pub fn break_lock(&mut self) -> Result<()> {
        self.lock.break_lock()
    }

    /// Run autopack outside a write group.
    pub fn autopack(&mut self) -> Result<Option<Vec<String>>> {
        if !self.is_write_locked() {
            return Err(BzrError::NotWriteLocked(self.base()));
        }
        self.ensure_loaded()?;
        self.collection.autopack(&self.serializer)
    }

    /// Re-read `pack-names`, picking up packs written by other processes.
    pub fn refresh_data(&mut self) -> Result<bool> {
        self.collection.reload_pack_names(self.lock_mode.is_some())
    }

    fn require_write_group(&self) -> Result<()> {
        if !self.collection.is_in_write_group() {
            return Err(BzrError::BzrCheckError(format!("{} is not in a write group", self.base())));
        }
        Ok(())
    }

    pub(crate) fn has_local_key(&mut self, kind: IndexKind, key: &Key) -> Result<bool> {
        self.ensure_loaded()?;
        let wanted: BTreeSet<Key> = [key.clone()].into_iter().collect();
        Ok(!self.collection.get_entries(kind, &wanted)?.is_empty())
    }

    /// Fulltext stored in this repository itself, ignoring fallbacks.
    pub(crate) fn local_fulltext(&mut self, kind: IndexKind, key: &Key) -> Result<Option<Vec<u8>>> {
        self.ensure_loaded()?;
        Ok(self.collection.get_fulltext(kind, key)?.map(|(_, text)| text))
    }

    /// Store `text` under `key`, as a delta against the first parent when
    /// that parent is stored here and the chain is short enough.
    pub(crate) fn store_content(&mut self, kind: IndexKind, key: Key, parents: Vec<Key>, text: &[u8]) -> Result<String> {
        self.require_write_group()?;
        let sha = sha_string(text);
        if self.has_local_key(kind, &key)? {
            return Ok(sha);
        }
        let mut stored = None;
        if let Some(basis) = parents.first() {
            if self.collection.delta_chain_length(kind, basis)? < self.config.max_delta_chain {
                if let Some((_, basis_text)) = self.collection.get_fulltext(kind, basis)? {
                    let delta = make_delta(&basis_text, text)?;
                    if delta.len() < text.len() {
                        let refs = vec![parents.clone(), vec![basis.clone()]];
                        stored = Some((encode_stored(true, &sha, &delta)?, refs));
                    }
                }
            }
        }
        let (body, refs) = match stored {
            Some(stored) => stored,
            None => (encode_stored(false, &sha, text)?, vec![parents, Vec::new()]),
        };
        self.collection.new_pack_mut()?.add_record(kind, key, refs, &body)?;
        Ok(sha)
    }

    /// Store an already computed delta whose basis is not available here.
    pub(crate) fn store_raw_delta(
        &mut self,
        kind: IndexKind,
        key: Key,
        parents: Vec<Key>,
        basis: Key,
        sha: &str,
        delta: &[u8],
    ) -> Result<()> {
        self.require_write_group()?;
        let body = encode_stored(true, sha, delta)?;
        self.collection
            .new_pack_mut()?
            .add_record(kind, key, vec![parents, vec![basis]], &body)
    }

    /// Store serialized revision bytes as a fulltext.
    pub(crate) fn store_revision_bytes(&mut self, revision_id: &[u8], parents: &[RevisionId], bytes: &[u8]) -> Result<()> {
        self.require_write_group()?;
        let key = Key::revision(revision_id);
        if self.has_local_key(IndexKind::Revision, &key)? {
            return Ok(());
        }
        let body = encode_stored(false, &sha_string(bytes), bytes)?;
        self.collection
            .new_pack_mut()?
            .add_record(IndexKind::Revision, key, vec![revision_keys(parents)], &body)
    }

    /// Parents known to this repository alone.
    pub(crate) fn local_parent_map(&mut self, revision_ids: &BTreeSet<RevisionId>) -> Result<ParentMap> {
        self.ensure_loaded()?;
        let mut result = ParentMap::new();
        if revision_ids.contains(NULL_REVISION) {
            result.insert(NULL_REVISION.to_vec(), Vec::new());
        }
        let keys: BTreeSet<Key> = revision_keys(revision_ids).into_iter().collect();
        for entry in self.collection.get_entries(IndexKind::Revision, &keys)? {
            let mut parents: Vec<RevisionId> = entry
                .refs
                .first()
                .into_iter()
                .flatten()
                .map(|p| p.first().to_vec())
                .collect();
            if parents.is_empty() {
                parents.push(NULL_REVISION.to_vec());
            }
            result.insert(entry.key.first().to_vec(), parents);
        }
        Ok(result)
    }

    pub(crate) fn local_revision_ids(&mut self) -> Result<BTreeSet<RevisionId>> {
        self.ensure_loaded()?;
        Ok(self
            .collection
            .combined(IndexKind::Revision)
            .iter_all_entries()?
            .into_iter()
            .map(|e| e.key.first().to_vec())
            .collect())
    }

    /// Read lock every fallback, or none of them.
    fn lock_fallbacks(&mut self) -> Result<()> {
        for locked in 0..self.fallbacks.len() {
            if let Err(e) = self.fallbacks[locked].lock_read() {
                for fallback in self.fallbacks[..locked].iter_mut() {
                    if let Err(unlock_error) = fallback.unlock() {
                        warn!("failed to unlock fallback {}: {}", fallback.base(), unlock_error);
                    }
                }
                return Err(e);
            }
        }
        Ok(())
    }

    /// Work done once the outermost lock is taken. On failure the
    /// repository is left unlocked.
    fn start_lock(&mut self, mode: LockMode) -> Result<()> {
        let started = self
            .collection
            .reload_pack_names(true)
            .and_then(|_| self.lock_fallbacks());
        match started {
            Ok(()) => {
                self.lock_mode = Some(mode);
                self.lock_count = 1;
                Ok(())
            }
            Err(e) => {
                self.collection.reset();
                Err(e)
            }
        }
    }
}

impl Repository for PackRepository {
    fn base(&self) -> String {
        self.transport.base()
    }

    fn format(&self) -> RepositoryFormat {
        self.format.clone()
    }

    fn lock_read(&mut self) -> Result<()> {
        match self.lock_mode {
            Some(_) => self.lock_count += 1,
            None => self.start_lock(LockMode::Read)?,
        }
        Ok(())
    }

    fn lock_write(&mut self, token: Option<&str>) -> Result<Option<String>> {
        match self.lock_mode {
            Some(LockMode::Read) => Err(BzrError::ReadOnlyError(self.base())),
            Some(LockMode::Write) => {
                if let Some(token) = token {
                    self.lock.validate_token(token)?;
                }
                self.lock_count += 1;
                Ok(self.lock.token().map(str::to_string))
            }
            None => {
                let taken = self.lock.lock_write(token)?;
                if let Err(e) = self.start_lock(LockMode::Write) {
                    // Leaves a lock adopted through its token on disk.
                    if let Err(unlock_error) = self.lock.unlock() {
                        warn!("failed to release the lock on {}: {}", self.base(), unlock_error);
                    }
                    return Err(e);
                }
                Ok(Some(taken))
            }
        }
    }

    fn unlock(&mut self) -> Result<()> {
        if self.lock_count == 0 {
            return Err(BzrError::LockNotHeld(self.base()));
        }
        self.lock_count -= 1;
        if self.lock_count > 0 {
            return Ok(());
        }
        let mode = self.lock_mode.take();
        let mut result = Ok(());
        if self.collection.is_in_write_group() {
            if let Err(e) = self.collection.abort_write_group() {
                warn!("failed to abort write group of {} at unlock: {}", self.base(), e);
            }
            result = Err(BzrError::BzrCheckError(format!(
                "{} was unlocked with a write group open; it has been aborted",
                self.base()
            )));
        }
        if mode == Some(LockMode::Write) {
            if let Err(e) = self.lock.unlock() {
                result = result.and(Err(e));
            }
        }
        self.collection.reset();
        for fallback in self.fallbacks.iter_mut() {
            if let Err(e) = fallback.unlock() {
                result = result.and(Err(e));
            }
        }
        result
    }

    fn lock_mode(&self) -> Option<LockMode> {
        self.lock_mode
    }

    fn lock_token(&self) -> Option<String> {
        self.lock.token().map(str::to_string)
    }

    fn leave_lock_in_place(&mut self) -> Result<()> {
        if !self.is_write_locked() {
            return Err(BzrError::NotWriteLocked(self.base()));
        }
        self.lock.leave_in_place();
        Ok(())
    }

    fn dont_leave_lock_in_place(&mut self) -> Result<()> {
        if !self.is_write_locked() {
            return Err(BzrError::NotWriteLocked(self.base()));
        }
        self.lock.dont_leave_in_place();
        Ok(())
    }

    fn start_write_group(&mut self) -> Result<()> {
        let write_locked = self.is_write_locked();
        self.collection.start_write_group(write_locked)
    }

    fn commit_write_group(&mut self) -> Result<Vec<String>> {
        self.collection.commit_write_group(&self.serializer)
    }

    fn abort_write_group(&mut self, suppress_errors: bool) -> Result<()> {
        match self.collection.abort_write_group() {
            Ok(()) => Ok(()),
            Err(e) if suppress_errors => {
                warn!("error aborting write group in {}: {}", self.base(), e);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    fn suspend_write_group(&mut self) -> Result<Vec<String>> {
        self.collection.suspend_write_group()
    }

    fn resume_write_group(&mut self, tokens: &[String]) -> Result<()> {
        self.start_write_group()?;
        if let Err(e) = self.collection.resume_write_group(tokens) {
            let _ = self.collection.abort_write_group();
            return Err(e);
        }
        Ok(())
    }

    fn is_in_write_group(&self) -> bool {
        self.collection.is_in_write_group()
    }

    fn add_fallback_repository(&mut self, mut repository: Box<dyn Repository>) -> Result<()> {
        check_fallback_compatible(&self.base(), &self.format, repository.as_ref())?;
        if self.is_locked() {
            repository.lock_read()?;
        }
        self.fallbacks.push(repository);
        Ok(())
    }

    fn has_fallbacks(&self) -> bool {
        !self.fallbacks.is_empty()
    }

    fn take_fallback_repositories(&mut self) -> Vec<Box<dyn Repository>> {
        std::mem::take(&mut self.fallbacks)
    }

    fn reopen(&self) -> Result<Box<dyn Repository>> {
        Ok(Box::new(PackRepository::open(Arc::clone(&self.transport))?))
    }

    fn get_parent_map(&mut self, revision_ids: &BTreeSet<RevisionId>) -> Result<ParentMap> {
        let mut result = self.local_parent_map(revision_ids)?;
        let mut missing: BTreeSet<RevisionId> = revision_ids
            .iter()
            .filter(|id| !result.contains_key(*id))
            .cloned()
            .collect();
        for fallback in self.fallbacks.iter_mut() {
            if missing.is_empty() {
                break;
            }
            let found = fallback.get_parent_map(&missing)?;
            for id in found.keys() {
                missing.remove(id);
            }
            result.extend(found);
        }
        Ok(result)
    }

    fn all_revision_ids(&mut self) -> Result<BTreeSet<RevisionId>> {
        let mut ids = self.local_revision_ids()?;
        for fallback in self.fallbacks.iter_mut() {
            ids.extend(fallback.all_revision_ids()?);
        }
        Ok(ids)
    }

    fn get_revision(&mut self, revision_id: &[u8]) -> Result<Revision> {
        if let Some(bytes) = self.local_fulltext(IndexKind::Revision, &Key::revision(revision_id))? {
            return self.serializer.read_revision(&bytes);
        }
        for fallback in self.fallbacks.iter_mut() {
            match fallback.get_revision(revision_id) {
                Err(BzrError::NoSuchRevision { .. }) => continue,
                other => return other,
            }
        }
        Err(BzrError::no_such_revision(self.base(), revision_id))
    }

    fn get_inventory(&mut self, revision_id: &[u8]) -> Result<Inventory> {
        if is_null(revision_id) {
            return Ok(Inventory::new(NULL_REVISION));
        }
        if let Some(bytes) = self.local_fulltext(IndexKind::Inventory, &Key::revision(revision_id))? {
            return self.serializer.read_inventory(&bytes);
        }
        for fallback in self.fallbacks.iter_mut() {
            match fallback.get_inventory(revision_id) {
                Err(BzrError::NoSuchRevision { .. }) => continue,
                other => return other,
            }
        }
        Err(BzrError::no_such_revision(self.base(), revision_id))
    }

    fn get_file_text(&mut self, key: &Key) -> Result<Vec<u8>> {
        if let Some(text) = self.local_fulltext(IndexKind::Text, key)? {
            return Ok(text);
        }
        for fallback in self.fallbacks.iter_mut() {
            match fallback.get_file_text(key) {
                Err(BzrError::RevisionNotPresent { .. }) => continue,
                other => return other,
            }
        }
        Err(BzrError::RevisionNotPresent {
            revision: display_id(key.last()),
            file: display_id(key.first()),
        })
    }

    fn get_signature_text(&mut self, revision_id: &[u8]) -> Result<Vec<u8>> {
        if let Some(text) = self.local_fulltext(IndexKind::Signature, &Key::revision(revision_id))? {
            return Ok(text);
        }
        for fallback in self.fallbacks.iter_mut() {
            match fallback.get_signature_text(revision_id) {
                Err(BzrError::NoSuchRevision { .. }) => continue,
                other => return other,
            }
        }
        Err(BzrError::no_such_revision(self.base(), revision_id))
    }

    fn get_rev_id_for_revno(&mut self, revno: u64, known: (u64, &[u8])) -> Result<RevnoLookup> {
        let (known_revno, known_id) = known;
        if revno == 0 {
            return Ok(RevnoLookup::Found(NULL_REVISION.to_vec()));
        }
        if revno > known_revno {
            return Err(BzrError::RevnoOutOfBounds {
                revno: revno as i64,
                min: 0,
                max: known_revno as i64,
            });
        }
        let distance = (known_revno - revno) as usize;
        let (history, reached_null) = lefthand_history(&mut RepositoryGraph(self), known_id, Some(distance + 1))?;
        if history.len() == distance + 1 {
            return Ok(RevnoLookup::Found(history[distance].clone()));
        }
        if reached_null {
            return Err(BzrError::RevnoOutOfBounds {
                revno: revno as i64,
                min: (known_revno + 1 - history.len() as u64) as i64,
                max: known_revno as i64,
            });
        }
        match history.last() {
            Some(last) => Ok(RevnoLookup::History(known_revno + 1 - history.len() as u64, last.clone())),
            None => Err(BzrError::no_such_revision(self.base(), known_id)),
        }
    }

    fn add_text(&mut self, key: &Key, parents: &[Key], text: &[u8]) -> Result<String> {
        self.store_content(IndexKind::Text, key.clone(), parents.to_vec(), text)
    }

    fn add_inventory(&mut self, inventory: &Inventory, parents: &[RevisionId]) -> Result<String> {
        let bytes = self.serializer.write_inventory(inventory)?;
        self.store_content(
            IndexKind::Inventory,
            Key::revision(&inventory.revision_id),
            revision_keys(parents),
            &bytes,
        )
    }

    fn add_revision(&mut self, revision: &Revision) -> Result<()> {
        self.require_write_group()?;
        if !self.has_local_key(IndexKind::Inventory, &Key::revision(&revision.revision_id))? {
            return Err(BzrError::RevisionNotPresent {
                revision: display_id(&revision.revision_id),
                file: "inventories".to_string(),
            });
        }
        let bytes = self.serializer.write_revision(revision)?;
        self.store_revision_bytes(&revision.revision_id, &revision.parent_ids, &bytes)
    }

    fn add_signature_text(&mut self, revision_id: &[u8], signature: &[u8]) -> Result<()> {
        self.require_write_group()?;
        let key = Key::revision(revision_id);
        if self.has_local_key(IndexKind::Signature, &key)? {
            return Ok(());
        }
        let body = encode_stored(false, &sha_string(signature), signature)?;
        self.collection
            .new_pack_mut()?
            .add_record(IndexKind::Signature, key, Vec::new(), &body)
    }

    fn get_stream(&mut self, search: &SearchResult, to_format: &RepositoryFormat) -> Result<Stream> {
        fetch::pack_stream(self, search, to_format)
    }

    fn get_stream_for_missing_keys(&mut self, missing: &MissingKeys, to_format: &RepositoryFormat) -> Result<Stream> {
        fetch::missing_keys_stream(self, missing, to_format)
    }

    fn insert_stream(
        &mut self,
        stream: Stream,
        src_format: &RepositoryFormat,
        resume_tokens: &[String],
    ) -> Result<(Vec<String>, MissingKeys)> {
        fetch::insert_pack_stream(self, stream, src_format, resume_tokens)
    }

    fn pack(&mut self, hint: Option<&[String]>, clean_obsolete: bool) -> Result<()> {
        self.lock_write(None)?;
        let result = self
            .collection
            .pack(hint, clean_obsolete, true, &self.serializer);
        let unlocked = self.unlock();
        result.and(unlocked)
    }

    fn check(&mut self) -> Result<CheckReport> {
        self.lock_read()?;
        let report = check::check_pack_repository(self);
        let unlocked = self.unlock();
        let report = report?;
        unlocked?;
        Ok(report)
    }

    fn reconcile(&mut self) -> Result<ReconcileResult> {
        self.lock_write(None)?;
        let result = check::reconcile_pack_repository(self);
        let unlocked = self.unlock();
        let result = result?;
        unlocked?;
        Ok(result)
    }
}
