//! Repository proxy.
//!
//! Locking, write groups, graph queries, revno lookups, streams and packing
//! go over the wire when the server has a verb for them. Everything else
//! (reading and writing individual records, check, reconcile) goes to a
//! [`PackRepository`] opened over [`SmartTransport`], bound on first use.

use super::delegate::Delegate;
use super::{arg_string, expect_ok};
use crate::client::{RpcClient, parse_u64};
use crate::medium::ProtocolVersion;
use crate::translate::{ErrorContext, translate_error};
use crate::vfs::SmartTransport;
use dbzr_core::check::{CheckReport, ReconcileResult};
use dbzr_core::controldir::{CONTROL_DIR, REPOSITORY_DIR};
use dbzr_core::key::is_null;
use dbzr_core::repository::check_fallback_compatible;
use dbzr_core::{
    BzrError, Inventory, Key, LockMode, MissingKeys, NULL_REVISION, PackRepository, ParentMap, Repository,
    RepositoryFormat, Result, Revision, RevisionId, RevnoLookup, SearchRecipe, SearchResult, Stream,
};
use lru::LruCache;
use std::collections::BTreeSet;
use std::fmt;
use std::num::NonZeroUsize;
use std::sync::Arc;
use tracing::{debug, warn};

/// Parent lists remembered while the repository is locked.
const PARENTS_CACHE_SIZE: usize = 10_000;

pub struct RemoteRepository {
    pub(super) client: RpcClient,
    /// Server-relative path of the control directory, `""` or `"a/b/"`.
    pub(super) path: String,
    pub(super) format: RepositoryFormat,
    pub(super) real: Delegate<PackRepository>,
    pub(super) fallbacks: Vec<Box<dyn Repository>>,
    lock_mode: Option<LockMode>,
    lock_count: usize,
    pub(super) lock_token: Option<String>,
    leave_lock: bool,
    write_group_tokens: Option<Vec<String>>,
    parents_cache: Option<LruCache<RevisionId, Vec<RevisionId>>>,
    pub(super) missing_cache: BTreeSet<RevisionId>,
}

impl fmt::Debug for RemoteRepository {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteRepository")
            .field("base", &self.base())
            .field("format", &self.format.network_name)
            .field("lock_mode", &self.lock_mode)
            .field("real", &self.real.is_bound())
            .field("fallbacks", &self.fallbacks.len())
            .finish()
    }
}

impl RemoteRepository {
    pub fn new(client: RpcClient, path: &str, format: RepositoryFormat) -> Self {
        Self {
            client,
            path: super::normalize_dir(path),
            format,
            real: Delegate::Unbound,
            fallbacks: Vec::new(),
            lock_mode: None,
            lock_count: 0,
            lock_token: None,
            leave_lock: false,
            write_group_tokens: None,
            parents_cache: None,
            missing_cache: BTreeSet::new(),
        }
    }

    pub fn client(&self) -> &RpcClient {
        &self.client
    }

    /// Server-relative path of the control directory holding the repository.
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn is_real_bound(&self) -> bool {
        self.real.is_bound()
    }

    pub(super) fn is_before(&self, version: ProtocolVersion) -> bool {
        self.client.medium().is_remote_before(version)
    }

    pub(super) fn remember_before(&self, version: ProtocolVersion) {
        self.client.medium().remember_remote_is_before(version);
    }

    fn error_context(&self) -> ErrorContext {
        let base = self.base();
        ErrorContext::repository(base.clone())
            .with_path(base)
            .with_token(self.lock_token.as_deref())
    }

    pub(super) fn translate(&self, err: BzrError) -> BzrError {
        translate_error(err, &self.error_context())
    }

    pub(super) fn call(&self, verb: &[u8], args: &[&[u8]]) -> Result<Vec<Vec<u8>>> {
        self.client.call(verb, args).map_err(|e| self.translate(e))
    }

    /// Reply checked to open with `ok`; anything else drops the connection.
    pub(super) fn check_ok(&self, reply: &[Vec<u8>]) -> Result<()> {
        expect_ok(reply).map_err(|e| self.client.bad_response(e))
    }

    fn token_arg(&self) -> String {
        self.lock_token.clone().unwrap_or_default()
    }

    // ==================== Delegate ====================

    /// The real repository, opened over plain file operations if it is not
    /// bound yet.
    pub fn ensure_real(&mut self) -> Result<&mut PackRepository> {
        if !self.real.is_bound() {
            debug!("binding real repository for {}", self.base());
            let path = format!("{}{}/{}", self.path, CONTROL_DIR, REPOSITORY_DIR);
            let transport = SmartTransport::new(self.client.clone(), &path)?;
            let real = PackRepository::open(Arc::new(transport))?;
            self.bind_real(real)?;
        }
        let base = self.base();
        self.real
            .get_mut()
            .ok_or_else(|| BzrError::BzrCheckError(format!("{} has no real repository", base)))
    }

    /// Install `real` as the delegate, bringing it to the proxy's state:
    /// same fallbacks, same lock, same write group.
    pub fn bind_real(&mut self, mut real: PackRepository) -> Result<()> {
        if self.real.is_bound() && self.lock_mode.is_some() {
            return Err(BzrError::BzrCheckError(format!(
                "cannot replace the real repository of locked {}",
                self.base()
            )));
        }
        for fallback in &self.fallbacks {
            real.add_fallback_repository(fallback.reopen()?)?;
        }
        match self.lock_mode {
            Some(LockMode::Read) => real.lock_read()?,
            Some(LockMode::Write) => {
                real.lock_write(self.lock_token.as_deref())?;
            }
            None => {}
        }
        if let Some(tokens) = self.write_group_tokens.take() {
            real.resume_write_group(&tokens)?;
        }
        self.real = Delegate::Bound(real);
        Ok(())
    }

    // ==================== Locking ====================

    fn start_caching(&mut self) {
        let capacity = NonZeroUsize::new(PARENTS_CACHE_SIZE).unwrap_or(NonZeroUsize::MIN);
        self.parents_cache = Some(LruCache::new(capacity));
        self.missing_cache.clear();
    }

    fn remote_lock_write(&self, token: Option<&str>) -> Result<String> {
        let reply = self
            .client
            .call(
                b"Repository.lock_write",
                &[self.path.as_bytes(), token.unwrap_or_default().as_bytes()],
            )
            .map_err(|e| translate_error(e, &self.error_context().with_token(token)))?;
        match reply.as_slice() {
            [ok, token] if ok == b"ok" => arg_string(token),
            _ => Err(self.client.bad_response(BzrError::unexpected_response(&reply))),
        }
    }

    fn remote_unlock(&self, token: &str) -> Result<()> {
        let reply = self.call(b"Repository.unlock", &[self.path.as_bytes(), token.as_bytes()])?;
        self.check_ok(&reply)
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

    fn unlock_real_after_failure(&mut self) {
        if let Some(real) = self.real.get_mut() {
            if let Err(e) = real.unlock() {
                warn!("failed to unlock real repository {}: {}", real.base(), e);
            }
        }
    }

    /// Lock the real repository (if bound) and the fallbacks under a new
    /// write lock. Nothing stays locked on failure.
    fn lock_dependents_write(&mut self) -> Result<()> {
        if let Some(real) = self.real.get_mut() {
            real.lock_write(self.lock_token.as_deref())?;
        }
        if let Err(e) = self.lock_fallbacks() {
            self.unlock_real_after_failure();
            return Err(e);
        }
        Ok(())
    }

    /// Take the write lock on behalf of a branch that already locked the
    /// repository on the server, adopting `token` without a request.
    pub fn lock_write_skip_rpc(&mut self, token: Option<&str>) -> Result<Option<String>> {
        self.lock_write_inner(token, true)
    }

    fn lock_write_inner(&mut self, token: Option<&str>, skip_rpc: bool) -> Result<Option<String>> {
        match self.lock_mode {
            Some(LockMode::Read) => Err(BzrError::ReadOnlyError(self.base())),
            Some(LockMode::Write) => {
                if let (Some(given), Some(held)) = (token, self.lock_token.as_deref()) {
                    if given != held {
                        return Err(BzrError::TokenMismatch {
                            given: given.to_string(),
                            lock: held.to_string(),
                        });
                    }
                }
                self.lock_count += 1;
                Ok(self.lock_token.clone())
            }
            None => {
                let previous = self.lock_token.clone();
                if skip_rpc {
                    if let Some(held) = previous.as_deref() {
                        if token != Some(held) {
                            return Err(BzrError::TokenMismatch {
                                given: token.unwrap_or_default().to_string(),
                                lock: held.to_string(),
                            });
                        }
                    }
                    self.lock_token = token.map(str::to_string);
                } else {
                    self.lock_token = Some(self.remote_lock_write(token)?);
                }
                if let Err(e) = self.lock_dependents_write() {
                    // Only a lock this call created on the server is released.
                    if let (false, None, Some(taken)) = (skip_rpc, token, self.lock_token.as_deref()) {
                        if let Err(unlock_error) = self.remote_unlock(taken) {
                            warn!("failed to release the lock on {}: {}", self.base(), unlock_error);
                        }
                    }
                    self.lock_token = previous;
                    return Err(e);
                }
                self.leave_lock = token.is_some();
                self.lock_mode = Some(LockMode::Write);
                self.lock_count = 1;
                self.start_caching();
                Ok(self.lock_token.clone())
            }
        }
    }

    // ==================== Graph ====================

    /// The revisions the client already knows, described so the server can
    /// leave them out of its reply.
    fn cached_search_recipe(&self) -> SearchRecipe {
        let mut start_keys = BTreeSet::new();
        let mut referenced = BTreeSet::new();
        if let Some(cache) = &self.parents_cache {
            for (id, parents) in cache.iter() {
                start_keys.insert(id.clone());
                referenced.extend(parents.iter().filter(|p| !is_null(p)).cloned());
            }
        }
        let count = start_keys.len();
        let mut exclude_keys: BTreeSet<RevisionId> = referenced.difference(&start_keys).cloned().collect();
        exclude_keys.extend(self.missing_cache.iter().cloned());
        start_keys.retain(|k| !referenced.contains(k));
        SearchRecipe::Search {
            start_keys,
            exclude_keys,
            count,
        }
    }

    fn remember_parents(&mut self, parent_map: &ParentMap) {
        if let Some(cache) = self.parents_cache.as_mut() {
            for (id, parents) in parent_map {
                cache.put(id.clone(), parents.clone());
            }
        }
    }

    fn remote_parent_map(&mut self, wanted: &BTreeSet<RevisionId>) -> Result<ParentMap> {
        if self.is_before((1, 2)) {
            return self.parent_map_from_revision_graph(wanted);
        }
        let recipe = self.cached_search_recipe().to_bytes();
        let mut args: Vec<&[u8]> = vec![self.path.as_bytes(), b"include-missing:".as_slice()];
        args.extend(wanted.iter().map(Vec::as_slice));
        let response = self
            .client
            .call_with_body_bytes_expecting_body(b"Repository.get_parent_map", &args, &recipe);
        let (reply, body) = match response {
            Ok(response) => response,
            Err(BzrError::UnknownSmartMethod(verb)) => {
                // Old servers may have choked on the body; start afresh.
                debug!("{} unsupported, falling back to the full revision graph", verb);
                self.client.medium().disconnect();
                self.remember_before((1, 2));
                return self.parent_map_from_revision_graph(wanted);
            }
            Err(e) => return Err(self.translate(e)),
        };
        self.check_ok(&reply)?;
        let text = zstd::stream::decode_all(body.as_slice())
            .map_err(|e| self.client.bad_response(BzrError::SmartProtocolError(format!("bad parent map body: {}", e))))?;
        let mut received = ParentMap::new();
        let mut missing = BTreeSet::new();
        for line in text.split(|b| *b == b'\n').filter(|l| !l.is_empty()) {
            if let Some(id) = line.strip_prefix(b"missing:") {
                missing.insert(id.to_vec());
                continue;
            }
            let (id, parents) = parse_graph_line(line);
            received.insert(id, parents);
        }
        self.remember_parents(&received);
        if self.parents_cache.is_some() {
            self.missing_cache.extend(missing);
        }
        Ok(received.into_iter().filter(|(id, _)| wanted.contains(id)).collect())
    }

    fn parent_map_from_revision_graph(&mut self, wanted: &BTreeSet<RevisionId>) -> Result<ParentMap> {
        let (reply, body) = self
            .client
            .call_expecting_body(b"Repository.get_revision_graph", &[self.path.as_bytes(), b"".as_slice()])
            .map_err(|e| self.translate(e))?;
        self.check_ok(&reply)?;
        let mut graph: ParentMap = body
            .split(|b| *b == b'\n')
            .filter(|l| !l.is_empty())
            .map(parse_graph_line)
            .collect();
        graph.insert(NULL_REVISION.to_vec(), Vec::new());
        self.remember_parents(&graph);
        Ok(graph.into_iter().filter(|(id, _)| wanted.contains(id)).collect())
    }
}

/// `revid parent...`; no parents means the revision descends from `null:`.
fn parse_graph_line(line: &[u8]) -> (RevisionId, Vec<RevisionId>) {
    let mut parts = line.split(|b| *b == b' ').filter(|p| !p.is_empty());
    let id = parts.next().unwrap_or_default().to_vec();
    let mut parents: Vec<RevisionId> = parts.map(<[u8]>::to_vec).collect();
    if parents.is_empty() && !is_null(&id) {
        parents.push(NULL_REVISION.to_vec());
    }
    (id, parents)
}

fn join_tokens(tokens: &[String]) -> String {
    tokens.join(" ")
}

impl Repository for RemoteRepository {
    fn base(&self) -> String {
        self.client.remote_url(&self.path)
    }

    fn format(&self) -> RepositoryFormat {
        self.format.clone()
    }

    fn lock_read(&mut self) -> Result<()> {
        if self.lock_mode.is_some() {
            self.lock_count += 1;
            return Ok(());
        }
        if let Some(real) = self.real.get_mut() {
            real.lock_read()?;
        }
        if let Err(e) = self.lock_fallbacks() {
            self.unlock_real_after_failure();
            return Err(e);
        }
        self.lock_mode = Some(LockMode::Read);
        self.lock_count = 1;
        self.start_caching();
        Ok(())
    }

    fn lock_write(&mut self, token: Option<&str>) -> Result<Option<String>> {
        self.lock_write_inner(token, false)
    }

    fn unlock(&mut self) -> Result<()> {
        if self.lock_count == 0 {
            return Err(BzrError::LockNotHeld(self.base()));
        }
        self.lock_count -= 1;
        if self.lock_count > 0 {
            return Ok(());
        }
        self.parents_cache = None;
        self.missing_cache.clear();
        let mut result = Ok(());
        if let Some(real) = self.real.get_mut() {
            result = real.unlock();
        } else if self.write_group_tokens.is_some() {
            if let Err(e) = self.abort_write_group(true) {
                warn!("failed to abort write group of {} at unlock: {}", self.base(), e);
            }
            result = Err(BzrError::BzrCheckError(format!(
                "{} was unlocked with a write group open; it has been aborted",
                self.base()
            )));
        }
        let mode = self.lock_mode.take();
        let token = self.lock_token.take();
        if mode == Some(LockMode::Write) && !self.leave_lock {
            if let Err(e) = self.remote_unlock(token.as_deref().unwrap_or_default()) {
                result = result.and(Err(e));
            }
        }
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
        self.lock_token.clone()
    }

    fn leave_lock_in_place(&mut self) -> Result<()> {
        if self.lock_token.is_none() {
            return Err(BzrError::NotImplemented(format!(
                "leaving the lock of {} in place without a token",
                self.base()
            )));
        }
        self.leave_lock = true;
        Ok(())
    }

    fn dont_leave_lock_in_place(&mut self) -> Result<()> {
        if self.lock_token.is_none() {
            return Err(BzrError::NotImplemented(format!(
                "releasing the lock of {} without a token",
                self.base()
            )));
        }
        self.leave_lock = false;
        Ok(())
    }

    fn start_write_group(&mut self) -> Result<()> {
        if self.real.is_bound() {
            return self.ensure_real()?.start_write_group();
        }
        if !self.is_write_locked() {
            return Err(BzrError::NotWriteLocked(self.base()));
        }
        if self.write_group_tokens.is_some() {
            return Err(BzrError::BzrCheckError(format!("{} is already in a write group", self.base())));
        }
        if !self.is_before((2, 2)) {
            let token = self.token_arg();
            match self.call(b"Repository.start_write_group", &[self.path.as_bytes(), token.as_bytes()]) {
                Ok(reply) => {
                    self.check_ok(&reply)?;
                    let tokens = reply[1..].iter().map(|t| arg_string(t)).collect::<Result<Vec<_>>>()?;
                    self.write_group_tokens = Some(tokens);
                    return Ok(());
                }
                Err(BzrError::UnknownSmartMethod(_)) => self.remember_before((2, 2)),
                Err(BzrError::UnsuspendableWriteGroup(_)) => {}
                Err(e) => return Err(e),
            }
        }
        self.ensure_real()?.start_write_group()
    }

    fn commit_write_group(&mut self) -> Result<Vec<String>> {
        if let Some(real) = self.real.get_mut() {
            let hint = real.commit_write_group()?;
            self.missing_cache.clear();
            return Ok(hint);
        }
        let Some(tokens) = self.write_group_tokens.clone() else {
            return Err(BzrError::BzrCheckError(format!("{} is not in a write group", self.base())));
        };
        let token = self.token_arg();
        let joined = join_tokens(&tokens);
        let reply = self.call(
            b"Repository.commit_write_group",
            &[self.path.as_bytes(), token.as_bytes(), joined.as_bytes()],
        )?;
        self.check_ok(&reply)?;
        self.write_group_tokens = None;
        self.missing_cache.clear();
        reply[1..].iter().map(|name| arg_string(name)).collect()
    }

    fn abort_write_group(&mut self, suppress_errors: bool) -> Result<()> {
        if let Some(real) = self.real.get_mut() {
            return real.abort_write_group(suppress_errors);
        }
        let Some(tokens) = self.write_group_tokens.clone() else {
            return Err(BzrError::BzrCheckError(format!("{} is not in a write group", self.base())));
        };
        let token = self.token_arg();
        let joined = join_tokens(&tokens);
        let result = self
            .call(
                b"Repository.abort_write_group",
                &[self.path.as_bytes(), token.as_bytes(), joined.as_bytes()],
            )
            .and_then(|reply| self.check_ok(&reply));
        match result {
            Ok(()) => {
                self.write_group_tokens = None;
                Ok(())
            }
            Err(e) if suppress_errors => {
                warn!("error aborting write group in {}: {}", self.base(), e);
                self.write_group_tokens = None;
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    fn suspend_write_group(&mut self) -> Result<Vec<String>> {
        if let Some(real) = self.real.get_mut() {
            return real.suspend_write_group();
        }
        Ok(self.write_group_tokens.take().unwrap_or_default())
    }

    fn resume_write_group(&mut self, tokens: &[String]) -> Result<()> {
        if let Some(real) = self.real.get_mut() {
            return real.resume_write_group(tokens);
        }
        if self.write_group_tokens.is_some() {
            return Err(BzrError::BzrCheckError(format!("{} is already in a write group", self.base())));
        }
        if !self.is_before((2, 2)) {
            let token = self.token_arg();
            let joined = join_tokens(tokens);
            match self.call(
                b"Repository.check_write_group",
                &[self.path.as_bytes(), token.as_bytes(), joined.as_bytes()],
            ) {
                Ok(reply) => {
                    self.check_ok(&reply)?;
                    self.write_group_tokens = Some(tokens.to_vec());
                    return Ok(());
                }
                Err(BzrError::UnknownSmartMethod(_)) => self.remember_before((2, 2)),
                Err(e) => return Err(e),
            }
        }
        self.ensure_real()?.resume_write_group(tokens)
    }

    fn is_in_write_group(&self) -> bool {
        self.write_group_tokens.is_some() || self.real.get().is_some_and(|real| real.is_in_write_group())
    }

    fn add_fallback_repository(&mut self, mut repository: Box<dyn Repository>) -> Result<()> {
        check_fallback_compatible(&self.base(), &self.format, repository.as_ref())?;
        if self.is_locked() {
            repository.lock_read()?;
        }
        if let Some(real) = self.real.get_mut() {
            real.add_fallback_repository(repository.reopen()?)?;
        }
        self.fallbacks.push(repository);
        Ok(())
    }

    fn has_fallbacks(&self) -> bool {
        !self.fallbacks.is_empty()
    }

    fn take_fallback_repositories(&mut self) -> Vec<Box<dyn Repository>> {
        if let Some(real) = self.real.get_mut() {
            for mut stale in real.take_fallback_repositories() {
                while stale.is_locked() {
                    if let Err(e) = stale.unlock() {
                        warn!("failed to unlock fallback {}: {}", stale.base(), e);
                        break;
                    }
                }
            }
        }
        std::mem::take(&mut self.fallbacks)
    }

    fn reopen(&self) -> Result<Box<dyn Repository>> {
        Ok(Box::new(RemoteRepository::new(
            self.client.clone(),
            &self.path,
            self.format.clone(),
        )))
    }

    fn get_parent_map(&mut self, revision_ids: &BTreeSet<RevisionId>) -> Result<ParentMap> {
        let mut result = ParentMap::new();
        let mut wanted = BTreeSet::new();
        for id in revision_ids {
            if is_null(id) {
                result.insert(id.clone(), Vec::new());
            } else if let Some(parents) = self.parents_cache.as_mut().and_then(|cache| cache.get(id)) {
                result.insert(id.clone(), parents.clone());
            } else if !self.missing_cache.contains(id) {
                wanted.insert(id.clone());
            }
        }
        if !wanted.is_empty() {
            result.extend(self.remote_parent_map(&wanted)?);
        }
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
        if !self.is_before((2, 5)) {
            match self
                .client
                .call_expecting_body(b"Repository.all_revision_ids", &[self.path.as_bytes()])
            {
                Ok((reply, body)) => {
                    self.check_ok(&reply)?;
                    let mut ids: BTreeSet<RevisionId> = body
                        .split(|b| *b == b'\n')
                        .filter(|l| !l.is_empty())
                        .map(<[u8]>::to_vec)
                        .collect();
                    for fallback in self.fallbacks.iter_mut() {
                        ids.extend(fallback.all_revision_ids()?);
                    }
                    return Ok(ids);
                }
                Err(BzrError::UnknownSmartMethod(_)) => self.remember_before((2, 5)),
                Err(e) => return Err(self.translate(e)),
            }
        }
        self.ensure_real()?.all_revision_ids()
    }

    fn get_revision(&mut self, revision_id: &[u8]) -> Result<Revision> {
        self.ensure_real()?.get_revision(revision_id)
    }

    fn get_inventory(&mut self, revision_id: &[u8]) -> Result<Inventory> {
        self.ensure_real()?.get_inventory(revision_id)
    }

    fn get_file_text(&mut self, key: &Key) -> Result<Vec<u8>> {
        self.ensure_real()?.get_file_text(key)
    }

    fn get_signature_text(&mut self, revision_id: &[u8]) -> Result<Vec<u8>> {
        self.ensure_real()?.get_signature_text(revision_id)
    }

    fn get_rev_id_for_revno(&mut self, revno: u64, known: (u64, &[u8])) -> Result<RevnoLookup> {
        let (known_revno, known_id) = known;
        if !self.is_before((1, 17)) {
            let revno_arg = revno.to_string();
            let known_arg = known_revno.to_string();
            match self.call(
                b"Repository.get_rev_id_for_revno",
                &[self.path.as_bytes(), revno_arg.as_bytes(), known_arg.as_bytes(), known_id],
            ) {
                Ok(reply) => match reply.as_slice() {
                    [ok, found] if ok == b"ok" => return Ok(RevnoLookup::Found(found.clone())),
                    [history, at_revno, at_id] if history == b"history" => {
                        let mut at = (parse_u64(at_revno)?, at_id.clone());
                        for fallback in self.fallbacks.iter_mut() {
                            match fallback.get_rev_id_for_revno(revno, (at.0, &at.1))? {
                                RevnoLookup::Found(found) => return Ok(RevnoLookup::Found(found)),
                                RevnoLookup::History(r, id) => at = (r, id),
                            }
                        }
                        return Ok(RevnoLookup::History(at.0, at.1));
                    }
                    _ => return Err(self.client.bad_response(BzrError::unexpected_response(&reply))),
                },
                Err(BzrError::UnknownSmartMethod(_)) => self.remember_before((1, 17)),
                Err(e) => return Err(e),
            }
        }
        self.ensure_real()?.get_rev_id_for_revno(revno, known)
    }

    fn add_text(&mut self, key: &Key, parents: &[Key], text: &[u8]) -> Result<String> {
        self.ensure_real()?.add_text(key, parents, text)
    }

    fn add_inventory(&mut self, inventory: &Inventory, parents: &[RevisionId]) -> Result<String> {
        self.ensure_real()?.add_inventory(inventory, parents)
    }

    fn add_revision(&mut self, revision: &Revision) -> Result<()> {
        self.ensure_real()?.add_revision(revision)
    }

    fn add_signature_text(&mut self, revision_id: &[u8], signature: &[u8]) -> Result<()> {
        self.ensure_real()?.add_signature_text(revision_id, signature)
    }

    fn get_stream(&mut self, search: &SearchResult, to_format: &RepositoryFormat) -> Result<Stream> {
        self.remote_get_stream(search, to_format)
    }

    fn get_stream_for_missing_keys(&mut self, missing: &MissingKeys, to_format: &RepositoryFormat) -> Result<Stream> {
        self.remote_missing_keys_stream(missing, to_format)
    }

    fn insert_stream(
        &mut self,
        stream: Stream,
        src_format: &RepositoryFormat,
        resume_tokens: &[String],
    ) -> Result<(Vec<String>, MissingKeys)> {
        self.remote_insert_stream(stream, src_format, resume_tokens)
    }

    fn pack(&mut self, hint: Option<&[String]>, clean_obsolete: bool) -> Result<()> {
        self.lock_write(None)?;
        let result = self.pack_locked(hint, clean_obsolete);
        let unlocked = self.unlock();
        result.and(unlocked)
    }

    fn check(&mut self) -> Result<CheckReport> {
        self.ensure_real()?.check()
    }

    fn reconcile(&mut self) -> Result<ReconcileResult> {
        self.ensure_real()?.reconcile()
    }
}

impl RemoteRepository {
    fn pack_locked(&mut self, hint: Option<&[String]>, clean_obsolete: bool) -> Result<()> {
        if !self.is_before((2, 5)) {
            let token = self.token_arg();
            let clean: &[u8] = if clean_obsolete { b"True" } else { b"False" };
            let (mode, body): (&[u8], String) = match hint {
                Some(names) => (b"hint".as_slice(), names.join("\n")),
                None => (b"all".as_slice(), String::new()),
            };
            match self.client.call_with_body_bytes(
                b"Repository.pack",
                &[self.path.as_bytes(), token.as_bytes(), clean, mode],
                body.as_bytes(),
            ) {
                Ok(reply) => {
                    self.check_ok(&reply)?;
                    if let Some(real) = self.real.get_mut() {
                        real.refresh_data()?;
                    }
                    return Ok(());
                }
                Err(BzrError::UnknownSmartMethod(_)) => self.remember_before((2, 5)),
                Err(e) => return Err(self.translate(e)),
            }
        }
        self.ensure_real()?.pack(hint, clean_obsolete)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_graph_line() {
        assert_eq!(parse_graph_line(b"r2 r1"), (b"r2".to_vec(), vec![b"r1".to_vec()]));
        assert_eq!(
            parse_graph_line(b"r1"),
            (b"r1".to_vec(), vec![NULL_REVISION.to_vec()])
        );
        assert_eq!(
            parse_graph_line(b"m r1 r2"),
            (b"m".to_vec(), vec![b"r1".to_vec(), b"r2".to_vec()])
        );
    }

    #[test]
    fn test_join_tokens() {
        assert_eq!(join_tokens(&["a".to_string(), "b".to_string()]), "a b");
        assert_eq!(join_tokens(&[]), "");
    }
}
