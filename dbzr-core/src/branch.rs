//! Branches: a named tip, tags and an optional stacking location on top of
//! a repository.
//!
//! Layout of the branch directory:
//!
//! ```text
//! format           "DBZR branch 1"
//! last-revision    "<revno> <revision id>"
//! tags             JSON map of tag name to revision id
//! branch.json      BranchConfig
//! lock/            write lock
//! ```

use crate::config::BranchConfig;
use crate::controldir::open_control_dir;
use crate::errors::{BzrError, Result};
use crate::fetch::{FetchResult, fetch_revisions};
use crate::graph::find_ancestry;
use crate::key::{NULL_REVISION, RevisionId, display_id, is_null};
use crate::lockdir::LockDir;
use crate::repository::{LockMode, Repository, RepositoryGraph, RevnoLookup};
use crate::transport::{Transport, directory_url, join_location};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

pub const BRANCH_FORMAT: &str = "DBZR branch 1\n";
pub const LAST_REVISION_FILE: &str = "last-revision";
pub const TAGS_FILE: &str = "tags";
const FORMAT_FILE: &str = "format";
const LOCK_DIR: &str = "lock";

pub type Tags = BTreeMap<String, RevisionId>;

/// Parse the stored tag dictionary. Empty bytes mean no tags.
pub fn parse_tags(bytes: &[u8]) -> Result<Tags> {
    if bytes.iter().all(u8::is_ascii_whitespace) {
        return Ok(Tags::new());
    }
    let map: BTreeMap<String, String> = serde_json::from_slice(bytes)?;
    Ok(map.into_iter().map(|(k, v)| (k, v.into_bytes())).collect())
}

pub fn serialize_tags(tags: &Tags) -> Result<Vec<u8>> {
    let map: BTreeMap<&str, String> = tags
        .iter()
        .map(|(k, v)| (k.as_str(), String::from_utf8_lossy(v).into_owned()))
        .collect();
    Ok(serde_json::to_vec_pretty(&map)?)
}

pub trait Branch: fmt::Debug {
    fn base(&self) -> String;

    fn repository(&mut self) -> &mut dyn Repository;

    fn lock_read(&mut self) -> Result<()>;

    /// Take (or, with `token`, re-enter) the branch write lock; the
    /// repository is write locked too. Returns the branch token.
    fn lock_write(&mut self, token: Option<&str>) -> Result<Option<String>>;

    fn unlock(&mut self) -> Result<()>;

    fn lock_mode(&self) -> Option<LockMode>;

    fn is_locked(&self) -> bool {
        self.lock_mode().is_some()
    }

    fn leave_lock_in_place(&mut self) -> Result<()>;

    fn dont_leave_lock_in_place(&mut self) -> Result<()>;

    fn last_revision_info(&mut self) -> Result<(u64, RevisionId)>;

    fn last_revision(&mut self) -> Result<RevisionId> {
        Ok(self.last_revision_info()?.1)
    }

    fn set_last_revision_info(&mut self, revno: u64, revision_id: &[u8]) -> Result<()>;

    fn get_tags_bytes(&mut self) -> Result<Vec<u8>>;

    fn set_tags_bytes(&mut self, bytes: &[u8]) -> Result<()>;

    fn tags(&mut self) -> Result<Tags> {
        parse_tags(&self.get_tags_bytes()?)
    }

    /// `NotStacked` when the branch has no stacking location.
    fn get_stacked_on_url(&mut self) -> Result<String>;

    /// Stack on the branch at `url`, or with `None` copy the history the
    /// fallback held into this branch's repository and stop stacking.
    fn set_stacked_on_url(&mut self, url: Option<&str>) -> Result<()>;

    fn get_rev_id_for_revno(&mut self, revno: u64) -> Result<RevisionId> {
        let (last_revno, last) = self.last_revision_info()?;
        match self.repository().get_rev_id_for_revno(revno, (last_revno, &last))? {
            RevnoLookup::Found(revision_id) => Ok(revision_id),
            RevnoLookup::History(_, ghost) => Err(BzrError::GhostRevisionsHaveNoRevno {
                revision: display_id(&last),
                ghost: display_id(&ghost),
            }),
        }
    }
}

/// Plain file access to a branch directory.
#[derive(Debug, Clone)]
pub struct BranchFiles {
    transport: Arc<dyn Transport>,
}

impl BranchFiles {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self { transport }
    }

    /// Lay out an empty branch in the (existing) directory of the transport.
    pub fn create(transport: Arc<dyn Transport>) -> Result<Self> {
        if transport.has(FORMAT_FILE)? {
            return Err(BzrError::FileExists(format!("{}{}", transport.base(), FORMAT_FILE)));
        }
        let files = Self::new(transport);
        files.transport.put_bytes(LAST_REVISION_FILE, b"0 null:\n")?;
        files.transport.put_bytes(TAGS_FILE, b"")?;
        BranchConfig::default().save(files.transport.as_ref())?;
        LockDir::new(Arc::clone(&files.transport), LOCK_DIR).create()?;
        files.transport.put_bytes(FORMAT_FILE, BRANCH_FORMAT.as_bytes())?;
        Ok(files)
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub fn check_format(&self) -> Result<()> {
        match self.transport.get_bytes(FORMAT_FILE) {
            Ok(bytes) if bytes == BRANCH_FORMAT.as_bytes() => Ok(()),
            Ok(bytes) => Err(BzrError::UnknownFormat(String::from_utf8_lossy(&bytes).trim().to_string())),
            Err(e) if e.is_no_such_file() => Err(BzrError::NotBranchError {
                path: self.transport.base(),
                detail: None,
            }),
            Err(e) => Err(e),
        }
    }

    pub fn read_last_revision_info(&self) -> Result<(u64, RevisionId)> {
        let bytes = self.transport.get_bytes(LAST_REVISION_FILE)?;
        let text = String::from_utf8_lossy(&bytes);
        let bad = || BzrError::General(format!("corrupt {}{}: {:?}", self.transport.base(), LAST_REVISION_FILE, text));
        let (revno, revision_id) = text.trim_end_matches('\n').split_once(' ').ok_or_else(bad)?;
        let revno = revno.parse().map_err(|_| bad())?;
        Ok((revno, revision_id.as_bytes().to_vec()))
    }

    pub fn write_last_revision_info(&self, revno: u64, revision_id: &[u8]) -> Result<()> {
        let mut line = format!("{} ", revno).into_bytes();
        line.extend_from_slice(revision_id);
        line.push(b'\n');
        self.transport.put_bytes(LAST_REVISION_FILE, &line)
    }

    pub fn read_tags_bytes(&self) -> Result<Vec<u8>> {
        match self.transport.get_bytes(TAGS_FILE) {
            Err(e) if e.is_no_such_file() => Ok(Vec::new()),
            other => other,
        }
    }

    pub fn write_tags_bytes(&self, bytes: &[u8]) -> Result<()> {
        self.transport.put_bytes(TAGS_FILE, bytes)
    }

    pub fn config(&self) -> Result<BranchConfig> {
        BranchConfig::load(self.transport.as_ref())
    }

    pub fn save_config(&self, config: &BranchConfig) -> Result<()> {
        config.save(self.transport.as_ref())
    }
}

/// A branch stored in a local (or VFS) branch directory.
#[derive(Debug)]
pub struct BzrBranch {
    /// The directory the branch is reached through, not its branch
    /// directory. Stacking locations are relative to it.
    base: String,
    files: BranchFiles,
    repository: Box<dyn Repository>,
    lock: LockDir,
    lock_mode: Option<LockMode>,
    lock_count: usize,
    cached_info: Option<(u64, RevisionId)>,
}

impl BzrBranch {
    /// Open the branch directory of `transport` over `repository`, for the
    /// branch at `base`. Stacking is not activated here, see
    /// [`BzrBranch::activate_stacking`].
    pub fn open(base: &str, transport: Arc<dyn Transport>, repository: Box<dyn Repository>) -> Result<Self> {
        let files = BranchFiles::new(Arc::clone(&transport));
        files.check_format()?;
        Ok(Self {
            base: base.to_string(),
            files,
            lock: LockDir::new(transport, LOCK_DIR),
            repository,
            lock_mode: None,
            lock_count: 0,
            cached_info: None,
        })
    }

    pub fn create(base: &str, transport: Arc<dyn Transport>, repository: Box<dyn Repository>) -> Result<Self> {
        BranchFiles::create(Arc::clone(&transport))?;
        Self::open(base, transport, repository)
    }

    pub fn files(&self) -> &BranchFiles {
        &self.files
    }

    /// Add the repository of the stacked-on branch as a fallback.
    pub fn activate_stacking(&mut self) -> Result<()> {
        if let Some(url) = self.files.config()?.stacked_on_location {
            debug!("{} is stacked on {}", self.base(), url);
            self.repository.add_fallback_repository(open_fallback_repository(&self.base, &url)?)?;
        }
        Ok(())
    }

    pub fn break_lock(&mut self) -> Result<()> {
        self.lock.break_lock()
    }

    /// Lock for writing with explicit branch and repository tokens. Returns
    /// both tokens.
    pub fn lock_write_tokens(
        &mut self,
        token: Option<&str>,
        repo_token: Option<&str>,
    ) -> Result<(String, Option<String>)> {
        match self.lock_mode {
            Some(LockMode::Read) => Err(BzrError::ReadOnlyError(self.base())),
            Some(LockMode::Write) => {
                if let Some(token) = token {
                    self.lock.validate_token(token)?;
                }
                let repo_token = self.repository.lock_write(repo_token)?;
                self.lock_count += 1;
                let token = self.lock.token().unwrap_or_default().to_string();
                Ok((token, repo_token))
            }
            None => {
                let repo_token = self.repository.lock_write(repo_token)?;
                match self.lock.lock_write(token) {
                    Ok(token) => {
                        self.lock_mode = Some(LockMode::Write);
                        self.lock_count = 1;
                        Ok((token, repo_token))
                    }
                    Err(e) => {
                        if let Err(unlock_error) = self.repository.unlock() {
                            warn!("failed to unlock repository of {}: {}", self.base(), unlock_error);
                        }
                        Err(e)
                    }
                }
            }
        }
    }

    fn require_write_lock(&self) -> Result<()> {
        if self.lock_mode != Some(LockMode::Write) {
            return Err(BzrError::NotWriteLocked(self.base()));
        }
        Ok(())
    }

    fn check_append_only(&mut self, revision_id: &[u8]) -> Result<()> {
        if !self.files.config()?.append_revisions_only {
            return Ok(());
        }
        let (_, old) = self.last_revision_info()?;
        if is_null(&old) || old == revision_id {
            return Ok(());
        }
        let heads: BTreeSet<RevisionId> = [revision_id.to_vec()].into_iter().collect();
        let ancestry = find_ancestry(&mut RepositoryGraph(self.repository.as_mut()), &heads)?;
        if !ancestry.contains_key(&old) {
            return Err(BzrError::TipChangeRejected(format!(
                "{} is append only and {} does not descend from {}",
                self.base(),
                display_id(revision_id),
                display_id(&old)
            )));
        }
        Ok(())
    }
}

impl Branch for BzrBranch {
    fn base(&self) -> String {
        self.base.clone()
    }

    fn repository(&mut self) -> &mut dyn Repository {
        self.repository.as_mut()
    }

    fn lock_read(&mut self) -> Result<()> {
        match self.lock_mode {
            Some(_) => {
                self.repository.lock_read()?;
                self.lock_count += 1;
            }
            None => {
                self.repository.lock_read()?;
                self.lock_mode = Some(LockMode::Read);
                self.lock_count = 1;
            }
        }
        Ok(())
    }

    fn lock_write(&mut self, token: Option<&str>) -> Result<Option<String>> {
        let (token, _) = self.lock_write_tokens(token, None)?;
        Ok(Some(token))
    }

    fn unlock(&mut self) -> Result<()> {
        if self.lock_count == 0 {
            return Err(BzrError::LockNotHeld(self.base()));
        }
        self.lock_count -= 1;
        let mut result = Ok(());
        if self.lock_count == 0 {
            if self.lock_mode.take() == Some(LockMode::Write) {
                result = self.lock.unlock();
            }
            self.cached_info = None;
        }
        let repo_result = self.repository.unlock();
        result.and(repo_result)
    }

    fn lock_mode(&self) -> Option<LockMode> {
        self.lock_mode
    }

    fn leave_lock_in_place(&mut self) -> Result<()> {
        self.require_write_lock()?;
        self.lock.leave_in_place();
        Ok(())
    }

    fn dont_leave_lock_in_place(&mut self) -> Result<()> {
        self.require_write_lock()?;
        self.lock.dont_leave_in_place();
        Ok(())
    }

    fn last_revision_info(&mut self) -> Result<(u64, RevisionId)> {
        if let Some(info) = &self.cached_info {
            return Ok(info.clone());
        }
        let info = self.files.read_last_revision_info()?;
        if self.lock_mode.is_some() {
            self.cached_info = Some(info.clone());
        }
        Ok(info)
    }

    fn set_last_revision_info(&mut self, revno: u64, revision_id: &[u8]) -> Result<()> {
        self.require_write_lock()?;
        if !is_null(revision_id) && !self.repository.has_revision(revision_id)? {
            return Err(BzrError::no_such_revision(self.base(), revision_id));
        }
        self.check_append_only(revision_id)?;
        self.files.write_last_revision_info(revno, revision_id)?;
        self.cached_info = Some((revno, revision_id.to_vec()));
        Ok(())
    }

    fn get_tags_bytes(&mut self) -> Result<Vec<u8>> {
        self.files.read_tags_bytes()
    }

    fn set_tags_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        self.require_write_lock()?;
        parse_tags(bytes)?;
        self.files.write_tags_bytes(bytes)
    }

    fn get_stacked_on_url(&mut self) -> Result<String> {
        self.files
            .config()?
            .stacked_on_location
            .ok_or_else(|| BzrError::NotStacked(self.base()))
    }

    fn set_stacked_on_url(&mut self, url: Option<&str>) -> Result<()> {
        self.require_write_lock()?;
        if let Some(url) = url {
            check_stacking_location(&self.base, url)?;
        }
        let mut config = self.files.config()?;
        if config.stacked_on_location.is_some() {
            let heads = stacking_heads(self)?;
            unstack_repository(&mut self.repository, &heads)?;
        }
        if let Some(url) = url {
            self.repository.add_fallback_repository(open_fallback_repository(&self.base, url)?)?;
        }
        config.stacked_on_location = url.map(str::to_string);
        self.files.save_config(&config)?;
        info!("{} stacked on {}", self.base(), url.unwrap_or("nothing"));
        Ok(())
    }
}

/// The repository of the branch at `url`, for use as a fallback by the
/// branch at `base`. A relative `url` is relative to `base`.
pub fn open_fallback_repository(base: &str, url: &str) -> Result<Box<dyn Repository>> {
    open_control_dir(&join_location(base, url)?)?.open_repository()
}

/// A branch cannot stack on itself.
pub fn check_stacking_location(base: &str, url: &str) -> Result<()> {
    let target = join_location(base, url)?;
    if directory_url(&target)? == directory_url(base)? {
        return Err(BzrError::UnstackableLocation {
            branch: base.to_string(),
            location: url.to_string(),
        });
    }
    Ok(())
}

/// The tip and tag targets of `branch`, which unstacking must keep.
pub fn stacking_heads(branch: &mut dyn Branch) -> Result<BTreeSet<RevisionId>> {
    let mut heads: BTreeSet<RevisionId> = branch.tags()?.into_values().collect();
    heads.insert(branch.last_revision()?);
    heads.remove(NULL_REVISION);
    Ok(heads)
}

/// Replace a stacked, write-locked `repository` with a fresh instance over
/// the same storage that holds everything reachable from `heads` itself.
pub fn unstack_repository(repository: &mut Box<dyn Repository>, heads: &BTreeSet<RevisionId>) -> Result<()> {
    if !repository.is_write_locked() {
        return Err(BzrError::NotWriteLocked(repository.base()));
    }
    let token = repository.lock_token();
    let mut fresh = repository.reopen()?;
    fresh.lock_write(token.as_deref())?;
    if let Err(e) = copy_heads(repository.as_mut(), fresh.as_mut(), heads) {
        let _ = fresh.leave_lock_in_place();
        let _ = fresh.unlock();
        return Err(e);
    }
    // Hand the physical lock over to the fresh instance.
    repository.leave_lock_in_place()?;
    let mut depth = 0;
    while repository.is_locked() {
        repository.unlock()?;
        depth += 1;
    }
    fresh.dont_leave_lock_in_place()?;
    for _ in 1..depth {
        fresh.lock_write(token.as_deref())?;
    }
    *repository = fresh;
    debug!("unstacked {}", repository.base());
    Ok(())
}

/// Fetch everything reachable from `heads` that `source` has into `target`.
pub fn copy_heads(source: &mut dyn Repository, target: &mut dyn Repository, heads: &BTreeSet<RevisionId>) -> Result<()> {
    for head in heads {
        if source.has_revision(head)? {
            fetch_revisions(source, target, Some(head), true)?;
        }
    }
    Ok(())
}

/// What a pull or push changed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PullResult {
    pub old_revno: u64,
    pub old_revid: RevisionId,
    pub new_revno: u64,
    pub new_revid: RevisionId,
    pub fetch: FetchResult,
    pub tags_updated: usize,
}

/// Bring `target` up to the tip of `source`. Without `overwrite` the target
/// tip must be an ancestor of the source tip; a target that is already
/// ahead is left alone.
pub fn pull(source: &mut dyn Branch, target: &mut dyn Branch, overwrite: bool) -> Result<PullResult> {
    source.lock_read()?;
    if let Err(e) = target.lock_write(None) {
        let _ = source.unlock();
        return Err(e);
    }
    let result = pull_locked(source, target, overwrite);
    let target_unlocked = target.unlock();
    let source_unlocked = source.unlock();
    let result = result?;
    target_unlocked?;
    source_unlocked?;
    Ok(result)
}

fn pull_locked(source: &mut dyn Branch, target: &mut dyn Branch, overwrite: bool) -> Result<PullResult> {
    let (new_revno, new_revid) = source.last_revision_info()?;
    let (old_revno, old_revid) = target.last_revision_info()?;
    let mut result = PullResult {
        old_revno,
        old_revid: old_revid.clone(),
        new_revno: old_revno,
        new_revid: old_revid.clone(),
        fetch: FetchResult::default(),
        tags_updated: 0,
    };
    if new_revid != old_revid && !is_null(&new_revid) {
        result.fetch = fetch_revisions(source.repository(), target.repository(), Some(&new_revid), false)?;
        let fast_forward = is_ancestor(target.repository(), &new_revid, &old_revid)?;
        let up_to_date = is_ancestor(target.repository(), &old_revid, &new_revid)?;
        if overwrite || fast_forward {
            target.set_last_revision_info(new_revno, &new_revid)?;
            result.new_revno = new_revno;
            result.new_revid = new_revid;
        } else if !up_to_date {
            return Err(BzrError::Diverged {
                branch: source.base(),
                other: target.base(),
            });
        }
    }
    result.tags_updated = merge_tags(source, target, overwrite)?;
    Ok(result)
}

/// Whether `ancestor` is in the ancestry of `revision_id` (or is it).
fn is_ancestor(repository: &mut dyn Repository, revision_id: &[u8], ancestor: &[u8]) -> Result<bool> {
    if is_null(ancestor) || revision_id == ancestor {
        return Ok(true);
    }
    let heads: BTreeSet<RevisionId> = [revision_id.to_vec()].into_iter().collect();
    Ok(find_ancestry(&mut RepositoryGraph(repository), &heads)?.contains_key(ancestor))
}

/// Copy tags from `source`; conflicting tags keep the target's value unless
/// overwriting. Returns the number of tags changed.
fn merge_tags(source: &mut dyn Branch, target: &mut dyn Branch, overwrite: bool) -> Result<usize> {
    let incoming = source.tags()?;
    if incoming.is_empty() {
        return Ok(0);
    }
    let mut tags = target.tags()?;
    let mut changed = 0;
    for (name, revision_id) in incoming {
        match tags.get(&name) {
            Some(existing) if *existing == revision_id => {}
            Some(_) if !overwrite => warn!("tag {} differs in {}, keeping it", name, target.base()),
            _ => {
                tags.insert(name, revision_id);
                changed += 1;
            }
        }
    }
    if changed > 0 {
        target.set_tags_bytes(&serialize_tags(&tags)?)?;
    }
    Ok(changed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MemoryTransport;

    #[test]
    fn test_tags_roundtrip() {
        let mut tags = Tags::new();
        tags.insert("v1".into(), b"rev-1".to_vec());
        let bytes = serialize_tags(&tags).unwrap();
        assert_eq!(parse_tags(&bytes).unwrap(), tags);
        assert!(parse_tags(b"").unwrap().is_empty());
        assert!(parse_tags(b"[1]").is_err());
    }

    #[test]
    fn test_branch_files() {
        let t: Arc<dyn Transport> = Arc::new(MemoryTransport::new());
        let files = BranchFiles::create(Arc::clone(&t)).unwrap();
        files.check_format().unwrap();
        assert_eq!(files.read_last_revision_info().unwrap(), (0, b"null:".to_vec()));
        files.write_last_revision_info(3, b"rev 3").unwrap();
        assert_eq!(files.read_last_revision_info().unwrap(), (3, b"rev 3".to_vec()));
        assert!(matches!(BranchFiles::create(t), Err(BzrError::FileExists(_))));
    }

    #[test]
    fn test_missing_branch_format() {
        let t: Arc<dyn Transport> = Arc::new(MemoryTransport::new());
        let files = BranchFiles::new(t);
        assert!(matches!(files.check_format(), Err(BzrError::NotBranchError { .. })));
    }
}
