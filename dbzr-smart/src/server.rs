//! Server side of the smart protocol.
//!
//! [`SmartServerHandler`] turns one request into one response, operating on
//! control directories below a root transport. Verbs are looked up in a
//! table built once per process; verbs the table lacks, or that the handler
//! was told to disable, are answered with `UnknownMethod` so clients step
//! down to older verbs.

use crate::byte_stream::{bytes_to_stream, decode_missing_keys, encode_missing_keys, stream_to_bytes};
use crate::medium::SmartMedium;
use crate::protocol::{SmartRequest, SmartResponse, decode_frame, encode_frame};
use crate::translate::error_to_tuple;
use crate::vfs::decode_offsets;
use dbzr_core::controldir::{self, CONTROL_DIR};
use dbzr_core::branch::BRANCH_FORMAT;
use dbzr_core::graph::{find_ancestry, recreate_search};
use dbzr_core::key::is_null;
use dbzr_core::repository::{RepositoryGraph, search_keys};
use dbzr_core::transport::resolve_segments;
use dbzr_core::{
    Branch, BzrBranch, BzrError, ControlDir, InitializeOptions, LocalControlDir, PackRepository, ParentMap, Repository,
    RepositoryFormat, Result, RevisionId, RevnoLookup, SearchRecipe, SubstreamKind, Transport,
};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, OnceLock};
use tracing::{debug, info};

/// Rough size of parent map text after which the server stops walking
/// beyond the revisions the client asked for.
const PARENT_MAP_BUDGET: usize = 250_000;

const PARENT_MAP_ZSTD_LEVEL: i32 = 3;

type VerbHandler = fn(&SmartServerHandler, &SmartRequest) -> Result<SmartResponse>;

/// Answers smart requests against the control directories under `root`.
pub struct SmartServerHandler {
    root: Arc<dyn Transport>,
    disabled_verbs: HashSet<Vec<u8>>,
}

impl fmt::Debug for SmartServerHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SmartServerHandler")
            .field("root", &self.root.base())
            .field("disabled_verbs", &self.disabled_verbs.len())
            .finish()
    }
}

impl SmartServerHandler {
    pub fn new(root: Arc<dyn Transport>) -> Self {
        Self {
            root,
            disabled_verbs: HashSet::new(),
        }
    }

    /// Answer `verbs` with `UnknownMethod`, as a server predating them would.
    pub fn with_disabled_verbs<I, V>(mut self, verbs: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: AsRef<[u8]>,
    {
        self.disabled_verbs
            .extend(verbs.into_iter().map(|v| v.as_ref().to_vec()));
        self
    }

    pub fn root(&self) -> &Arc<dyn Transport> {
        &self.root
    }

    pub fn is_known_verb(&self, verb: &[u8]) -> bool {
        !self.disabled_verbs.contains(verb) && verbs().contains_key(verb)
    }

    pub fn handle(&self, request: &SmartRequest) -> SmartResponse {
        let handler = match verbs().get(request.verb.as_slice()) {
            Some(handler) if !self.disabled_verbs.contains(&request.verb) => handler,
            _ => {
                debug!("unknown verb {}", request.verb_str());
                return SmartResponse::unknown_method(&request.verb);
            }
        };
        match handler(self, request) {
            Ok(response) => response,
            Err(e) => {
                debug!("{} failed: {}", request.verb_str(), e);
                let mut tuple = error_to_tuple(&e);
                // Branch verbs report missing revisions in the branch's terms.
                if request.verb.starts_with(b"Branch.") && tuple.verb == b"nosuchrevision" {
                    tuple.verb = b"NoSuchRevision".to_vec();
                }
                SmartResponse::error(tuple)
            }
        }
    }

    // ==================== Opening ====================

    fn transport(&self, path: &str) -> Result<Arc<dyn Transport>> {
        self.root.clone_to(&resolve_segments(&[], path)?.join("/"))
    }

    fn control_dir(&self, path: &str) -> Result<LocalControlDir> {
        LocalControlDir::open(self.transport(path)?)
    }

    fn repository(&self, path: &str) -> Result<PackRepository> {
        let dir = self.control_dir(path)?;
        if !dir.has_repository()? {
            return Err(BzrError::NoRepositoryPresent(dir.root_transport().base()));
        }
        dir.open_pack_repository()
    }

    fn branch(&self, path: &str) -> Result<BzrBranch> {
        self.control_dir(path)?.open_bzr_branch()
    }
}

fn verbs() -> &'static HashMap<&'static [u8], VerbHandler> {
    static VERBS: OnceLock<HashMap<&'static [u8], VerbHandler>> = OnceLock::new();
    VERBS.get_or_init(build_verbs)
}

fn build_verbs() -> HashMap<&'static [u8], VerbHandler> {
    let mut map: HashMap<&'static [u8], VerbHandler> = HashMap::new();

    // Control directories.
    map.insert(b"BzrDir.open", bzrdir_open);
    map.insert(b"BzrDir.open_2.1", bzrdir_open_2_1);
    map.insert(b"BzrDir.find_repositoryV1", |h, r| find_repository(h, r, 1));
    map.insert(b"BzrDir.find_repositoryV2", |h, r| find_repository(h, r, 2));
    map.insert(b"BzrDir.find_repositoryV3", |h, r| find_repository(h, r, 3));
    map.insert(b"BzrDir.open_branchV3", bzrdir_open_branch);
    map.insert(b"BzrDir.create_branch", bzrdir_create_branch);
    map.insert(b"BzrDir.initialize_ex_1.16", bzrdir_initialize_ex);

    // Repositories.
    map.insert(b"Repository.lock_write", repository_lock_write);
    map.insert(b"Repository.unlock", repository_unlock);
    map.insert(b"Repository.start_write_group", repository_start_write_group);
    map.insert(b"Repository.check_write_group", repository_check_write_group);
    map.insert(b"Repository.commit_write_group", repository_commit_write_group);
    map.insert(b"Repository.abort_write_group", repository_abort_write_group);
    map.insert(b"Repository.get_parent_map", repository_get_parent_map);
    map.insert(b"Repository.get_revision_graph", repository_get_revision_graph);
    map.insert(b"Repository.all_revision_ids", repository_all_revision_ids);
    map.insert(b"Repository.get_rev_id_for_revno", repository_get_rev_id_for_revno);
    map.insert(b"Repository.pack", repository_pack);
    map.insert(b"Repository.get_stream", repository_get_stream);
    map.insert(b"Repository.get_stream_1.19", repository_get_stream);
    map.insert(b"Repository.get_stream_for_missing_keys", repository_missing_keys_stream);
    map.insert(b"Repository.insert_stream", |h, r| repository_insert_stream(h, r, InsertVerb::Unlocked));
    map.insert(b"Repository.insert_stream_locked", |h, r| {
        repository_insert_stream(h, r, InsertVerb::Locked)
    });
    map.insert(b"Repository.insert_stream_1.19", |h, r| {
        repository_insert_stream(h, r, InsertVerb::Deltas)
    });

    // Branches.
    map.insert(b"Branch.lock_write", branch_lock_write);
    map.insert(b"Branch.unlock", branch_unlock);
    map.insert(b"Branch.last_revision_info", branch_last_revision_info);
    map.insert(b"Branch.set_last_revision_info", branch_set_last_revision_info);
    map.insert(b"Branch.get_tags_bytes", branch_get_tags_bytes);
    map.insert(b"Branch.set_tags_bytes", branch_set_tags_bytes);
    map.insert(b"Branch.get_stacked_on_url", branch_get_stacked_on_url);

    // Plain file operations.
    map.insert(b"get", vfs_get);
    map.insert(b"readv", vfs_readv);
    map.insert(b"put", vfs_put);
    map.insert(b"append", vfs_append);
    map.insert(b"has", vfs_has);
    map.insert(b"stat", vfs_stat);
    map.insert(b"list_dir", vfs_list_dir);
    map.insert(b"mkdir", |h, r| vfs_simple(h, r, |t, p| t.mkdir(p)));
    map.insert(b"delete", |h, r| vfs_simple(h, r, |t, p| t.delete(p)));
    map.insert(b"rmdir", |h, r| vfs_simple(h, r, |t, p| t.rmdir(p)));
    map.insert(b"rename", vfs_rename);

    map
}

// ==================== Arguments ====================

fn arg(request: &SmartRequest, i: usize) -> Result<&[u8]> {
    request.args.get(i).map(Vec::as_slice).ok_or_else(|| {
        BzrError::SmartProtocolError(format!("{} expects at least {} arguments", request.verb_str(), i + 1))
    })
}

fn arg_str(request: &SmartRequest, i: usize) -> Result<&str> {
    std::str::from_utf8(arg(request, i)?).map_err(BzrError::serialization)
}

/// An argument where empty (or absent) means "none".
fn optional_arg(request: &SmartRequest, i: usize) -> Result<Option<&str>> {
    match request.args.get(i) {
        Some(a) if !a.is_empty() => std::str::from_utf8(a).map(Some).map_err(BzrError::serialization),
        _ => Ok(None),
    }
}

fn flag_arg(request: &SmartRequest, i: usize) -> Result<bool> {
    match arg(request, i)? {
        b"True" | b"yes" => Ok(true),
        b"False" | b"no" => Ok(false),
        other => Err(BzrError::SmartProtocolError(format!(
            "bad flag {:?} to {}",
            String::from_utf8_lossy(other),
            request.verb_str()
        ))),
    }
}

fn flag(value: bool) -> &'static [u8] {
    if value { b"True" } else { b"False" }
}

fn body(request: &SmartRequest) -> &[u8] {
    request.body.as_deref().unwrap_or_default()
}

fn split_tokens(joined: &str) -> Vec<String> {
    joined.split_whitespace().map(str::to_string).collect()
}

fn ok() -> SmartResponse {
    SmartResponse::success(&[b"ok"])
}

// ==================== Locking helpers ====================

/// Run `f` under a read lock.
fn read_locked<T>(repo: &mut PackRepository, f: impl FnOnce(&mut PackRepository) -> Result<T>) -> Result<T> {
    repo.lock_read()?;
    let result = f(repo);
    let unlocked = repo.unlock();
    let value = result?;
    unlocked?;
    Ok(value)
}

/// Run `f` under the write lock a client holds through `token`. The physical
/// lock stays with the client afterwards.
fn token_locked<T>(
    repo: &mut PackRepository,
    token: &str,
    f: impl FnOnce(&mut PackRepository) -> Result<T>,
) -> Result<T> {
    repo.lock_write(Some(token))?;
    let result = f(repo);
    let unlocked = repo.unlock();
    let value = result?;
    unlocked?;
    Ok(value)
}

/// Run `f` on a branch re-entered through the client's tokens.
fn branch_token_locked<T>(
    branch: &mut BzrBranch,
    request: &SmartRequest,
    f: impl FnOnce(&mut BzrBranch) -> Result<T>,
) -> Result<T> {
    branch.lock_write_tokens(Some(arg_str(request, 1)?), optional_arg(request, 2)?)?;
    let result = f(branch);
    let unlocked = branch.unlock();
    let value = result?;
    unlocked?;
    Ok(value)
}

// ==================== Control directories ====================

fn bzrdir_exists(handler: &SmartServerHandler, request: &SmartRequest) -> Result<bool> {
    match handler.control_dir(arg_str(request, 0)?) {
        Ok(_) => Ok(true),
        Err(BzrError::NotBranchError { .. }) => Ok(false),
        Err(e) if e.is_no_such_file() => Ok(false),
        Err(e) => Err(e),
    }
}

fn bzrdir_open(handler: &SmartServerHandler, request: &SmartRequest) -> Result<SmartResponse> {
    let answer: &[u8] = if bzrdir_exists(handler, request)? { b"yes" } else { b"no" };
    Ok(SmartResponse::success(&[answer]))
}

fn bzrdir_open_2_1(handler: &SmartServerHandler, request: &SmartRequest) -> Result<SmartResponse> {
    if !bzrdir_exists(handler, request)? {
        return Ok(SmartResponse::success(&[b"no"]));
    }
    let has_tree = handler.control_dir(arg_str(request, 0)?)?.has_workingtree();
    let has_tree: &[u8] = if has_tree { b"yes" } else { b"no" };
    Ok(SmartResponse::success(&[b"yes", has_tree]))
}

fn find_repository(handler: &SmartServerHandler, request: &SmartRequest, version: u8) -> Result<SmartResponse> {
    let format = handler.repository(arg_str(request, 0)?)?.format();
    let mut args: Vec<&[u8]> = vec![
        b"ok".as_slice(),
        b"".as_slice(),
        flag(format.rich_root_data),
        flag(format.supports_tree_reference),
    ];
    if version >= 2 {
        args.push(flag(format.supports_external_lookups));
    }
    if version >= 3 {
        args.push(format.network_name.as_bytes());
    }
    Ok(SmartResponse::success(&args))
}

fn bzrdir_open_branch(handler: &SmartServerHandler, request: &SmartRequest) -> Result<SmartResponse> {
    handler.branch(arg_str(request, 0)?)?;
    Ok(SmartResponse::success(&[b"branch", BRANCH_FORMAT.trim_end().as_bytes()]))
}

fn bzrdir_create_branch(handler: &SmartServerHandler, request: &SmartRequest) -> Result<SmartResponse> {
    handler.control_dir(arg_str(request, 0)?)?.create_branch()?;
    Ok(ok())
}

fn bzrdir_initialize_ex(handler: &SmartServerHandler, request: &SmartRequest) -> Result<SmartResponse> {
    let repository_format = match optional_arg(request, 1)? {
        Some(name) => Some(RepositoryFormat::from_network_name(name)?),
        None => None,
    };
    let options = InitializeOptions {
        repository_format,
        stacked_on: optional_arg(request, 2)?.map(str::to_string),
        stack_on_pwd: optional_arg(request, 3)?.map(str::to_string),
        require_stacking: flag_arg(request, 4)?,
        create_prefix: flag_arg(request, 5)?,
        use_existing_dir: flag_arg(request, 6)?,
    };
    let result = controldir::initialize_ex(handler.transport(arg_str(request, 0)?)?, &options)?;
    let repo_path = match result.repository_path.as_deref() {
        None => "",
        Some("") => ".",
        Some(path) => path,
    };
    let format = result.format.clone().unwrap_or_default();
    let control_dir_name = if result.control_dir_name == CONTROL_DIR {
        ""
    } else {
        result.control_dir_name.as_str()
    };
    let stacked_on = result.stacked_on.clone().unwrap_or_default();
    let stack_pwd = result.stack_pwd.clone().unwrap_or_default();
    let network_name = if result.format.is_some() {
        format.network_name.as_str()
    } else {
        ""
    };
    // The new repository is never left locked for the client.
    let args: [&[u8]; 10] = [
        repo_path.as_bytes(),
        flag(format.rich_root_data),
        flag(format.supports_tree_reference),
        flag(format.supports_external_lookups),
        network_name.as_bytes(),
        control_dir_name.as_bytes(),
        flag(result.require_stacking),
        stacked_on.as_bytes(),
        stack_pwd.as_bytes(),
        b"",
    ];
    Ok(SmartResponse::success(&args))
}

// ==================== Repository locking and write groups ====================

fn repository_lock_write(handler: &SmartServerHandler, request: &SmartRequest) -> Result<SmartResponse> {
    let mut repo = handler.repository(arg_str(request, 0)?)?;
    let token = repo.lock_write(optional_arg(request, 1)?)?.unwrap_or_default();
    repo.leave_lock_in_place()?;
    repo.unlock()?;
    info!("locked repository {}", repo.base());
    Ok(SmartResponse::success(&[b"ok", token.as_bytes()]))
}

fn repository_unlock(handler: &SmartServerHandler, request: &SmartRequest) -> Result<SmartResponse> {
    let mut repo = handler.repository(arg_str(request, 0)?)?;
    repo.lock_write(Some(arg_str(request, 1)?))?;
    repo.dont_leave_lock_in_place()?;
    repo.unlock()?;
    info!("unlocked repository {}", repo.base());
    Ok(ok())
}

fn repository_start_write_group(handler: &SmartServerHandler, request: &SmartRequest) -> Result<SmartResponse> {
    let mut repo = handler.repository(arg_str(request, 0)?)?;
    let tokens = token_locked(&mut repo, arg_str(request, 1)?, |repo| {
        repo.start_write_group()?;
        repo.suspend_write_group()
    })?;
    let mut args: Vec<&[u8]> = vec![b"ok".as_slice()];
    args.extend(tokens.iter().map(|t| t.as_bytes()));
    Ok(SmartResponse::success(&args))
}

fn repository_check_write_group(handler: &SmartServerHandler, request: &SmartRequest) -> Result<SmartResponse> {
    let mut repo = handler.repository(arg_str(request, 0)?)?;
    let tokens = split_tokens(optional_arg(request, 2)?.unwrap_or_default());
    token_locked(&mut repo, arg_str(request, 1)?, |repo| {
        repo.resume_write_group(&tokens)?;
        repo.suspend_write_group()
    })?;
    Ok(ok())
}

fn repository_commit_write_group(handler: &SmartServerHandler, request: &SmartRequest) -> Result<SmartResponse> {
    let mut repo = handler.repository(arg_str(request, 0)?)?;
    let tokens = split_tokens(optional_arg(request, 2)?.unwrap_or_default());
    let hint = token_locked(&mut repo, arg_str(request, 1)?, |repo| {
        repo.resume_write_group(&tokens)?;
        repo.commit_write_group()
    })?;
    let mut args: Vec<&[u8]> = vec![b"ok".as_slice()];
    args.extend(hint.iter().map(|name| name.as_bytes()));
    Ok(SmartResponse::success(&args))
}

fn repository_abort_write_group(handler: &SmartServerHandler, request: &SmartRequest) -> Result<SmartResponse> {
    let mut repo = handler.repository(arg_str(request, 0)?)?;
    let tokens = split_tokens(optional_arg(request, 2)?.unwrap_or_default());
    token_locked(&mut repo, arg_str(request, 1)?, |repo| {
        repo.resume_write_group(&tokens)?;
        repo.abort_write_group(false)
    })?;
    Ok(ok())
}

// ==================== Graph ====================

/// Walk the ancestry of `wanted`, leaving out what the client has seen, until
/// the reply is big enough.
fn walk_parents(
    repo: &mut PackRepository,
    wanted: &BTreeSet<RevisionId>,
    client_seen: &BTreeSet<RevisionId>,
) -> Result<(ParentMap, BTreeSet<RevisionId>)> {
    let mut result = ParentMap::new();
    let mut missing = BTreeSet::new();
    let mut queried = BTreeSet::new();
    let mut next = wanted.clone();
    let mut size = 0usize;
    let mut first = true;
    while !next.is_empty() {
        queried.extend(next.iter().cloned());
        let found = repo.get_parent_map(&next)?;
        if first {
            missing.extend(next.iter().filter(|id| !found.contains_key(*id)).cloned());
        }
        let mut following = BTreeSet::new();
        for (id, parents) in found {
            let parents: Vec<RevisionId> = parents.into_iter().filter(|p| !is_null(p)).collect();
            following.extend(parents.iter().cloned());
            if !client_seen.contains(&id) {
                size += id.len() + parents.iter().map(|p| p.len() + 1).sum::<usize>() + 1;
                result.insert(id, parents);
            }
        }
        if !first && size > PARENT_MAP_BUDGET {
            break;
        }
        first = false;
        next = following.difference(&queried).cloned().collect();
    }
    Ok((result, missing))
}

fn graph_lines(parent_map: &ParentMap) -> Vec<u8> {
    let mut out = Vec::new();
    for (id, parents) in parent_map {
        out.extend_from_slice(id);
        for parent in parents.iter().filter(|p| !is_null(p)) {
            out.push(b' ');
            out.extend_from_slice(parent);
        }
        out.push(b'\n');
    }
    out
}

fn repository_get_parent_map(handler: &SmartServerHandler, request: &SmartRequest) -> Result<SmartResponse> {
    let mut repo = handler.repository(arg_str(request, 0)?)?;
    let mut include_missing = false;
    let mut wanted = BTreeSet::new();
    for a in request.args.iter().skip(1) {
        if a == b"include-missing:" {
            include_missing = true;
        } else {
            wanted.insert(a.clone());
        }
    }
    let recipe = match body(request) {
        b"" => None,
        bytes => Some(SearchRecipe::from_bytes(bytes)?),
    };
    let (parent_map, missing) = read_locked(&mut repo, |repo| {
        let client_seen = match &recipe {
            Some(recipe) => {
                let search = recreate_search(&mut RepositoryGraph(&mut *repo), recipe, true)?;
                search_keys(repo, &search)?
            }
            None => BTreeSet::new(),
        };
        walk_parents(repo, &wanted, &client_seen)
    })?;
    let mut text = graph_lines(&parent_map);
    if include_missing {
        for id in &missing {
            text.extend_from_slice(b"missing:");
            text.extend_from_slice(id);
            text.push(b'\n');
        }
    }
    let compressed = zstd::stream::encode_all(text.as_slice(), PARENT_MAP_ZSTD_LEVEL)?;
    Ok(SmartResponse::success_with_body(&[b"ok"], compressed))
}

fn repository_get_revision_graph(handler: &SmartServerHandler, request: &SmartRequest) -> Result<SmartResponse> {
    let mut repo = handler.repository(arg_str(request, 0)?)?;
    let tip = optional_arg(request, 1)?.map(|t| t.as_bytes().to_vec());
    let graph = read_locked(&mut repo, |repo| match &tip {
        Some(tip) => {
            let heads: BTreeSet<RevisionId> = [tip.clone()].into_iter().collect();
            let ancestry = find_ancestry(&mut RepositoryGraph(&mut *repo), &heads)?;
            if !ancestry.contains_key(tip) {
                return Err(BzrError::no_such_revision(repo.base(), tip));
            }
            Ok(ancestry)
        }
        None => {
            let ids = repo.all_revision_ids()?;
            repo.get_parent_map(&ids)
        }
    })?;
    Ok(SmartResponse::success_with_body(&[b"ok"], graph_lines(&graph)))
}

fn repository_all_revision_ids(handler: &SmartServerHandler, request: &SmartRequest) -> Result<SmartResponse> {
    let mut repo = handler.repository(arg_str(request, 0)?)?;
    let ids = read_locked(&mut repo, |repo| repo.all_revision_ids())?;
    let body: Vec<u8> = ids.into_iter().flat_map(|mut id| {
        id.push(b'\n');
        id
    }).collect();
    Ok(SmartResponse::success_with_body(&[b"ok"], body))
}

fn repository_get_rev_id_for_revno(handler: &SmartServerHandler, request: &SmartRequest) -> Result<SmartResponse> {
    let mut repo = handler.repository(arg_str(request, 0)?)?;
    let revno: u64 = arg_str(request, 1)?.parse().map_err(BzrError::serialization)?;
    let known_revno: u64 = arg_str(request, 2)?.parse().map_err(BzrError::serialization)?;
    let known_id = arg(request, 3)?.to_vec();
    match read_locked(&mut repo, |repo| repo.get_rev_id_for_revno(revno, (known_revno, known_id.as_slice())))? {
        RevnoLookup::Found(id) => Ok(SmartResponse::success(&[b"ok", &id])),
        RevnoLookup::History(at_revno, at_id) => {
            let at_revno = at_revno.to_string();
            Ok(SmartResponse::success(&[b"history", at_revno.as_bytes(), &at_id]))
        }
    }
}

fn repository_pack(handler: &SmartServerHandler, request: &SmartRequest) -> Result<SmartResponse> {
    let mut repo = handler.repository(arg_str(request, 0)?)?;
    let clean_obsolete = flag_arg(request, 2)?;
    let hint: Option<Vec<String>> = match arg(request, 3)? {
        b"hint" => Some(
            String::from_utf8_lossy(body(request))
                .lines()
                .filter(|l| !l.is_empty())
                .map(str::to_string)
                .collect(),
        ),
        _ => None,
    };
    let run = |repo: &mut PackRepository| repo.pack(hint.as_deref(), clean_obsolete);
    match optional_arg(request, 1)? {
        // Packing takes its own write lock, which re-enters the client's.
        Some(token) => {
            repo.lock_write(Some(token))?;
            let result = run(&mut repo);
            let unlocked = repo.unlock();
            result?;
            unlocked?;
        }
        None => run(&mut repo)?,
    }
    Ok(ok())
}

// ==================== Streams ====================

fn repository_get_stream(handler: &SmartServerHandler, request: &SmartRequest) -> Result<SmartResponse> {
    let mut repo = handler.repository(arg_str(request, 0)?)?;
    let to_format = RepositoryFormat::from_network_name(arg_str(request, 1)?)?;
    let recipe = SearchRecipe::from_bytes(body(request))?;
    let stream = read_locked(&mut repo, |repo| {
        let search = recreate_search(&mut RepositoryGraph(&mut *repo), &recipe, true)?;
        repo.get_stream(&search, &to_format)
    })?;
    let body = stream_to_bytes(&stream, &repo.format())?;
    Ok(SmartResponse::success_with_body(&[b"ok"], body))
}

fn repository_missing_keys_stream(handler: &SmartServerHandler, request: &SmartRequest) -> Result<SmartResponse> {
    let mut repo = handler.repository(arg_str(request, 0)?)?;
    let to_format = RepositoryFormat::from_network_name(arg_str(request, 1)?)?;
    let (_, missing) = decode_missing_keys(body(request))?;
    let stream = read_locked(&mut repo, |repo| repo.get_stream_for_missing_keys(&missing, &to_format))?;
    let body = stream_to_bytes(&stream, &repo.format())?;
    Ok(SmartResponse::success_with_body(&[b"ok"], body))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InsertVerb {
    /// `insert_stream`: no lock token, no inventory deltas.
    Unlocked,
    /// `insert_stream_locked`: a lock token, no inventory deltas.
    Locked,
    /// `insert_stream_1.19`: an optional lock token, deltas allowed.
    Deltas,
}

fn repository_insert_stream(
    handler: &SmartServerHandler,
    request: &SmartRequest,
    verb: InsertVerb,
) -> Result<SmartResponse> {
    let path = arg_str(request, 0)?;
    let resume_tokens = split_tokens(optional_arg(request, 1)?.unwrap_or_default());
    let token = match verb {
        InsertVerb::Unlocked => None,
        InsertVerb::Locked => Some(arg_str(request, 2)?),
        InsertVerb::Deltas => optional_arg(request, 2)?,
    };
    let (src_format, stream) = bytes_to_stream(body(request))?;
    if stream.iter().all(|s| s.records.is_empty()) && resume_tokens.is_empty() {
        debug!("{} called with an empty stream", request.verb_str());
        return Ok(ok());
    }
    if verb != InsertVerb::Deltas && stream.iter().any(|s| s.kind == SubstreamKind::InventoryDeltas) {
        return Err(BzrError::SmartProtocolError(format!(
            "{} cannot take inventory deltas",
            request.verb_str()
        )));
    }
    let mut repo = handler.repository(path)?;
    let (tokens, missing) = match token {
        Some(token) => token_locked(&mut repo, token, |repo| {
            repo.insert_stream(stream, &src_format, &resume_tokens)
        })?,
        None => repo.insert_stream(stream, &src_format, &resume_tokens)?,
    };
    if missing.is_empty() {
        return Ok(ok());
    }
    debug!("{} is missing {} keys", repo.base(), missing.len());
    let blob = encode_missing_keys(&tokens, &missing)?;
    Ok(SmartResponse::success(&[b"missing-basis", &blob]))
}

// ==================== Branches ====================

fn branch_lock_write(handler: &SmartServerHandler, request: &SmartRequest) -> Result<SmartResponse> {
    let mut branch = handler.branch(arg_str(request, 0)?)?;
    let (token, repo_token) = branch.lock_write_tokens(optional_arg(request, 1)?, optional_arg(request, 2)?)?;
    branch.leave_lock_in_place()?;
    branch.repository().leave_lock_in_place()?;
    branch.unlock()?;
    info!("locked branch {}", branch.base());
    Ok(SmartResponse::success(&[
        b"ok",
        token.as_bytes(),
        repo_token.unwrap_or_default().as_bytes(),
    ]))
}

fn branch_unlock(handler: &SmartServerHandler, request: &SmartRequest) -> Result<SmartResponse> {
    let mut branch = handler.branch(arg_str(request, 0)?)?;
    branch.lock_write_tokens(Some(arg_str(request, 1)?), optional_arg(request, 2)?)?;
    branch.dont_leave_lock_in_place()?;
    branch.repository().dont_leave_lock_in_place()?;
    branch.unlock()?;
    info!("unlocked branch {}", branch.base());
    Ok(ok())
}

fn branch_last_revision_info(handler: &SmartServerHandler, request: &SmartRequest) -> Result<SmartResponse> {
    let (revno, revision_id) = handler.branch(arg_str(request, 0)?)?.last_revision_info()?;
    let revno = revno.to_string();
    Ok(SmartResponse::success(&[b"ok", revno.as_bytes(), &revision_id]))
}

fn branch_set_last_revision_info(handler: &SmartServerHandler, request: &SmartRequest) -> Result<SmartResponse> {
    let mut branch = handler.branch(arg_str(request, 0)?)?;
    let revno: u64 = arg_str(request, 3)?.parse().map_err(BzrError::serialization)?;
    let revision_id = arg(request, 4)?.to_vec();
    branch_token_locked(&mut branch, request, |branch| {
        branch.set_last_revision_info(revno, &revision_id)
    })?;
    Ok(ok())
}

fn branch_get_tags_bytes(handler: &SmartServerHandler, request: &SmartRequest) -> Result<SmartResponse> {
    let bytes = handler.branch(arg_str(request, 0)?)?.get_tags_bytes()?;
    Ok(SmartResponse::success_with_body(&[b"ok"], bytes))
}

fn branch_set_tags_bytes(handler: &SmartServerHandler, request: &SmartRequest) -> Result<SmartResponse> {
    let mut branch = handler.branch(arg_str(request, 0)?)?;
    let bytes = body(request).to_vec();
    branch_token_locked(&mut branch, request, |branch| branch.set_tags_bytes(&bytes))?;
    Ok(ok())
}

fn branch_get_stacked_on_url(handler: &SmartServerHandler, request: &SmartRequest) -> Result<SmartResponse> {
    let url = handler.branch(arg_str(request, 0)?)?.get_stacked_on_url()?;
    Ok(SmartResponse::success(&[b"ok", url.as_bytes()]))
}

// ==================== Plain file operations ====================

/// Resolve a request path against the root, refusing to leave it.
fn vfs_path(request: &SmartRequest, i: usize) -> Result<String> {
    Ok(resolve_segments(&[], arg_str(request, i)?)?.join("/"))
}

fn vfs_get(handler: &SmartServerHandler, request: &SmartRequest) -> Result<SmartResponse> {
    let bytes = handler.root.get_bytes(&vfs_path(request, 0)?)?;
    Ok(SmartResponse::success_with_body(&[b"ok"], bytes))
}

fn vfs_readv(handler: &SmartServerHandler, request: &SmartRequest) -> Result<SmartResponse> {
    let offsets = decode_offsets(body(request))?;
    let chunks = handler.root.readv(&vfs_path(request, 0)?, &offsets)?;
    Ok(SmartResponse::success_with_body(&[b"readv"], chunks.concat()))
}

fn vfs_put(handler: &SmartServerHandler, request: &SmartRequest) -> Result<SmartResponse> {
    handler.root.put_bytes(&vfs_path(request, 0)?, body(request))?;
    Ok(ok())
}

fn vfs_append(handler: &SmartServerHandler, request: &SmartRequest) -> Result<SmartResponse> {
    let offset = handler.root.append_bytes(&vfs_path(request, 0)?, body(request))?;
    let offset = offset.to_string();
    Ok(SmartResponse::success(&[b"appended", offset.as_bytes()]))
}

fn vfs_has(handler: &SmartServerHandler, request: &SmartRequest) -> Result<SmartResponse> {
    let answer: &[u8] = if handler.root.has(&vfs_path(request, 0)?)? { b"yes" } else { b"no" };
    Ok(SmartResponse::success(&[answer]))
}

fn vfs_stat(handler: &SmartServerHandler, request: &SmartRequest) -> Result<SmartResponse> {
    let stat = handler.root.stat(&vfs_path(request, 0)?)?;
    let size = stat.size.to_string();
    let kind: &[u8] = if stat.is_dir { b"dir" } else { b"file" };
    Ok(SmartResponse::success(&[b"stat", size.as_bytes(), kind]))
}

fn vfs_list_dir(handler: &SmartServerHandler, request: &SmartRequest) -> Result<SmartResponse> {
    let names = handler.root.list_dir(&vfs_path(request, 0)?)?;
    let mut body = names.join("\n").into_bytes();
    if !body.is_empty() {
        body.push(b'\n');
    }
    Ok(SmartResponse::success_with_body(&[b"names"], body))
}

fn vfs_simple(
    handler: &SmartServerHandler,
    request: &SmartRequest,
    op: fn(&dyn Transport, &str) -> Result<()>,
) -> Result<SmartResponse> {
    op(handler.root.as_ref(), &vfs_path(request, 0)?)?;
    Ok(ok())
}

fn vfs_rename(handler: &SmartServerHandler, request: &SmartRequest) -> Result<SmartResponse> {
    handler.root.rename(&vfs_path(request, 0)?, &vfs_path(request, 1)?)?;
    Ok(ok())
}

/// A medium that hands requests straight to an in-process handler, still
/// passing every message through the frame codec.
#[derive(Debug, Clone)]
pub struct LoopbackMedium {
    handler: Arc<SmartServerHandler>,
}

impl LoopbackMedium {
    pub fn new(handler: Arc<SmartServerHandler>) -> Self {
        Self { handler }
    }
}

impl SmartMedium for LoopbackMedium {
    fn send(&mut self, request: &SmartRequest) -> Result<SmartResponse> {
        let request: SmartRequest = decode_frame(&encode_frame(request)?)?;
        let response = self.handler.handle(&request);
        decode_frame(&encode_frame(&response)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dbzr_core::MemoryTransport;

    fn handler() -> SmartServerHandler {
        SmartServerHandler::new(Arc::new(MemoryTransport::new()))
    }

    fn request(verb: &[u8], args: &[&[u8]], body: Option<&[u8]>) -> SmartRequest {
        SmartRequest::new(verb, args, body.map(<[u8]>::to_vec))
    }

    #[test]
    fn test_unknown_and_disabled_verbs() {
        let handler = handler().with_disabled_verbs(["Repository.get_parent_map"]);
        let response = handler.handle(&request(b"Repository.frobnicate", &[], None));
        assert_eq!(response.error_tuple().unwrap().verb, crate::protocol::UNKNOWN_METHOD);
        let response = handler.handle(&request(b"Repository.get_parent_map", &[b""], None));
        assert_eq!(response.error_tuple().unwrap().verb, crate::protocol::UNKNOWN_METHOD);
        assert!(!handler.is_known_verb(b"Repository.get_parent_map"));
        assert!(handler.is_known_verb(b"Repository.get_stream_1.19"));
    }

    #[test]
    fn test_vfs_verbs() {
        let handler = handler();
        let put = handler.handle(&request(b"put", &[b"file"], Some(b"hello")));
        assert_eq!(put.args, vec![b"ok".to_vec()]);
        let appended = handler.handle(&request(b"append", &[b"file"], Some(b" world")));
        assert_eq!(appended.args, vec![b"appended".to_vec(), b"5".to_vec()]);
        let got = handler.handle(&request(b"get", &[b"/file"], None));
        assert_eq!(got.body.as_deref(), Some(b"hello world".as_slice()));
        let readv = handler.handle(&request(b"readv", &[b"file"], Some(b"0,5\n6,5")));
        assert_eq!(readv.body.as_deref(), Some(b"helloworld".as_slice()));
        let stat = handler.handle(&request(b"stat", &[b"file"], None));
        assert_eq!(stat.args[1], b"11".to_vec());

        let escape = handler.handle(&request(b"get", &[b"../etc/passwd"], None));
        assert!(escape.error_tuple().is_some());
        let missing = handler.handle(&request(b"get", &[b"nothing"], None));
        assert_eq!(missing.error_tuple().unwrap().verb, b"NoSuchFile".to_vec());
    }

    #[test]
    fn test_no_control_dir() {
        let handler = handler();
        let response = handler.handle(&request(b"BzrDir.open_2.1", &[b"trunk/"], None));
        assert_eq!(response.args, vec![b"no".to_vec()]);
        let response = handler.handle(&request(b"BzrDir.open_branchV3", &[b"trunk/"], None));
        assert_eq!(response.error_tuple().unwrap().verb, b"nobranch".to_vec());
    }

    #[test]
    fn test_loopback_medium_round_trips_frames() {
        let mut medium = LoopbackMedium::new(Arc::new(handler()));
        let put = medium.send(&request(b"put", &[b"file"], Some(b"hello"))).unwrap();
        assert_eq!(put.args, vec![b"ok".to_vec()]);
        let got = medium.send(&request(b"get", &[b"file"], None)).unwrap();
        assert_eq!(got.body.as_deref(), Some(b"hello".as_slice()));
        let missing = medium.send(&request(b"BzrDir.open_branchV3", &[b"trunk/"], None)).unwrap();
        assert_eq!(missing.error_tuple().unwrap().verb, b"nobranch".to_vec());
    }

    #[test]
    fn test_graph_lines() {
        let mut graph = ParentMap::new();
        graph.insert(b"r1".to_vec(), vec![b"null:".to_vec()]);
        graph.insert(b"r2".to_vec(), vec![b"r1".to_vec(), b"g".to_vec()]);
        assert_eq!(graph_lines(&graph), b"r1\nr2 r1 g\n".to_vec());
    }
}
