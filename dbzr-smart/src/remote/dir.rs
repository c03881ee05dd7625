//! Control directory proxy.

use super::branch::RemoteBranch;
use super::delegate::Delegate;
use super::repository::RemoteRepository;
use super::{arg_string, bool_arg, expect_ok, normalize_dir};
use crate::client::{RpcClient, first_arg};
use crate::medium::ProtocolVersion;
use crate::translate::{ErrorContext, translate_error};
use crate::vfs::SmartTransport;
use dbzr_core::controldir::{self, CONTROL_DIR};
use dbzr_core::{
    Branch, BzrError, ControlDir, InitializeOptions, InitializeResult, LocalControlDir, Repository, RepositoryFormat,
    Result, open_control_dir,
};
use std::cell::RefCell;
use std::sync::Arc;
use tracing::debug;

const FIND_REPOSITORY_VERBS: [(&[u8], ProtocolVersion); 2] = [
    (b"BzrDir.find_repositoryV3", (1, 13)),
    (b"BzrDir.find_repositoryV2", (1, 3)),
];

fn flag(value: bool) -> &'static [u8] {
    if value { b"True" } else { b"False" }
}

#[derive(Debug)]
pub struct RemoteControlDir {
    client: RpcClient,
    /// Server-relative path, `""` or `"a/b/"`.
    path: String,
    has_workingtree: bool,
    real: RefCell<Delegate<LocalControlDir>>,
}

impl RemoteControlDir {
    /// Open the control directory at `path`, checking that the server has
    /// one there.
    pub fn open(client: RpcClient, path: &str) -> Result<Self> {
        let mut dir = Self {
            client,
            path: normalize_dir(path),
            has_workingtree: false,
            real: RefCell::new(Delegate::Unbound),
        };
        dir.check_exists()?;
        Ok(dir)
    }

    pub fn client(&self) -> &RpcClient {
        &self.client
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    fn is_before(&self, version: ProtocolVersion) -> bool {
        self.client.medium().is_remote_before(version)
    }

    fn remember_before(&self, version: ProtocolVersion) {
        self.client.medium().remember_remote_is_before(version);
    }

    fn call(&self, verb: &[u8], args: &[&[u8]]) -> Result<Vec<Vec<u8>>> {
        self.client
            .call(verb, args)
            .map_err(|e| translate_error(e, &ErrorContext::path(self.base())))
    }

    fn not_a_branch(&self) -> BzrError {
        BzrError::NotBranchError {
            path: self.base(),
            detail: None,
        }
    }

    fn check_exists(&mut self) -> Result<()> {
        if !self.is_before((2, 1)) {
            match self.call(b"BzrDir.open_2.1", &[self.path.as_bytes()]) {
                Ok(reply) => {
                    return match reply.as_slice() {
                        [no] if no == b"no" => Err(self.not_a_branch()),
                        [yes, has_tree] if yes == b"yes" => {
                            self.has_workingtree = bool_arg(has_tree)?;
                            Ok(())
                        }
                        _ => Err(self.client.bad_response(BzrError::unexpected_response(&reply))),
                    };
                }
                Err(BzrError::UnknownSmartMethod(_)) => self.remember_before((2, 1)),
                Err(e) => return Err(e),
            }
        }
        let reply = self.call(b"BzrDir.open", &[self.path.as_bytes()])?;
        match first_arg(&reply) {
            b"yes" => Ok(()),
            b"no" => Err(self.not_a_branch()),
            _ => Err(self.client.bad_response(BzrError::unexpected_response(&reply))),
        }
    }

    /// The control directory driven over plain file operations.
    fn ensure_real(&self) -> Result<LocalControlDir> {
        if let Some(real) = self.real.borrow().get() {
            return Ok(real.clone());
        }
        debug!("binding real control directory for {}", self.base());
        let transport = SmartTransport::new(self.client.clone(), &self.path)?;
        let real = LocalControlDir::open(Arc::new(transport))?;
        *self.real.borrow_mut() = Delegate::Bound(real.clone());
        Ok(real)
    }

    fn parse_find_repository(&self, reply: &[Vec<u8>]) -> Result<RepositoryFormat> {
        let [ok, path, rich_root, tree_ref, rest @ ..] = reply else {
            return Err(self.client.bad_response(BzrError::unexpected_response(reply)));
        };
        if ok != b"ok" {
            return Err(self.client.bad_response(BzrError::unexpected_response(reply)));
        }
        if !path.is_empty() {
            return Err(BzrError::NoRepositoryPresent(self.base()));
        }
        let mut format = match rest.get(1) {
            Some(name) => RepositoryFormat::from_network_name(&arg_string(name)?)?,
            None => RepositoryFormat::default(),
        };
        format.rich_root_data = bool_arg(rich_root)?;
        format.supports_tree_reference = bool_arg(tree_ref)?;
        if let Some(external) = rest.first() {
            format.supports_external_lookups = bool_arg(external)?;
        }
        Ok(format)
    }

    /// Find the repository here, trying the newest discovery verb first.
    pub fn open_remote_repository(&self) -> Result<RemoteRepository> {
        for (verb, version) in FIND_REPOSITORY_VERBS {
            if self.is_before(version) {
                continue;
            }
            match self.call(verb, &[self.path.as_bytes()]) {
                Ok(reply) => {
                    let format = self.parse_find_repository(&reply)?;
                    return Ok(RemoteRepository::new(self.client.clone(), &self.path, format));
                }
                Err(BzrError::UnknownSmartMethod(_)) => self.remember_before(version),
                Err(e) => return Err(e),
            }
        }
        let reply = self.call(b"BzrDir.find_repositoryV1", &[self.path.as_bytes()])?;
        let format = self.parse_find_repository(&reply)?;
        Ok(RemoteRepository::new(self.client.clone(), &self.path, format))
    }

    /// Open the branch here as a [`RemoteBranch`], with stacking activated.
    /// `None` when the server names a branch reference instead.
    fn open_remote_branch(&self) -> Result<std::result::Result<RemoteBranch, String>> {
        let reply = self.call(b"BzrDir.open_branchV3", &[self.path.as_bytes()])?;
        match reply.as_slice() {
            [kind, location] if kind == b"ref" => Ok(Err(arg_string(location)?)),
            [kind, _] if kind == b"branch" => {
                let repository = self.open_remote_repository()?;
                let mut branch = RemoteBranch::new(self.client.clone(), &self.path, repository);
                branch.activate_stacking()?;
                Ok(Ok(branch))
            }
            _ => Err(self.client.bad_response(BzrError::unexpected_response(&reply))),
        }
    }

    /// Create a control directory (and, if asked, a repository) at `path`.
    ///
    /// Uses `BzrDir.initialize_ex_1.16`; a server without it gets the local
    /// initializer run over plain file operations.
    pub fn initialize_ex(client: &RpcClient, path: &str, options: &InitializeOptions) -> Result<InitializeResult> {
        let path = normalize_dir(path);
        if !client.medium().is_remote_before((1, 16)) {
            let network_name = options
                .repository_format
                .as_ref()
                .map(|f| f.network_name.clone())
                .unwrap_or_default();
            let stacked_on = options.stacked_on.clone().unwrap_or_default();
            let stack_on_pwd = options.stack_on_pwd.clone().unwrap_or_default();
            let args: [&[u8]; 7] = [
                path.as_bytes(),
                network_name.as_bytes(),
                stacked_on.as_bytes(),
                stack_on_pwd.as_bytes(),
                flag(options.require_stacking),
                flag(options.create_prefix),
                flag(options.use_existing_dir),
            ];
            match client.call(b"BzrDir.initialize_ex_1.16", &args) {
                Ok(reply) => return parse_initialize_reply(client, &reply),
                Err(BzrError::UnknownSmartMethod(_)) => client.medium().remember_remote_is_before((1, 16)),
                Err(e) => return Err(translate_error(e, &ErrorContext::path(client.remote_url(&path)))),
            }
        }
        let transport = SmartTransport::new(client.clone(), &path)?;
        controldir::initialize_ex(Arc::new(transport), options)
    }

    /// Create the branch of this control directory.
    fn create_remote_branch(&self) -> Result<Box<dyn Branch>> {
        match self.call(b"BzrDir.create_branch", &[self.path.as_bytes()]) {
            Ok(reply) => {
                expect_ok(&reply).map_err(|e| self.client.bad_response(e))?;
                self.open_branch()
            }
            Err(BzrError::UnknownSmartMethod(_)) => self.ensure_real()?.create_branch(),
            Err(e) => Err(e),
        }
    }
}

fn optional(arg: &[u8]) -> Result<Option<String>> {
    if arg.is_empty() {
        Ok(None)
    } else {
        arg_string(arg).map(Some)
    }
}

/// `(repo_path, rich_root, tree_ref, external, network_name, control_dir,
/// require_stacking, stacked_on, stack_pwd, repo_lock_token)`; a repository
/// path of `.` means a repository was created in the new directory.
fn parse_initialize_reply(client: &RpcClient, reply: &[Vec<u8>]) -> Result<InitializeResult> {
    let [repo_path, rich_root, tree_ref, external, network_name, control_dir, require_stacking, stacked_on, stack_pwd, token] =
        reply
    else {
        return Err(client.bad_response(BzrError::unexpected_response(reply)));
    };
    let (repository_path, format) = if repo_path.is_empty() {
        (None, None)
    } else {
        let mut format = RepositoryFormat::from_network_name(&arg_string(network_name)?)?;
        format.rich_root_data = bool_arg(rich_root)?;
        format.supports_tree_reference = bool_arg(tree_ref)?;
        format.supports_external_lookups = bool_arg(external)?;
        let path = if repo_path == b"." { String::new() } else { arg_string(repo_path)? };
        (Some(path), Some(format))
    };
    Ok(InitializeResult {
        repository_path,
        format,
        control_dir_name: optional(control_dir)?.unwrap_or_else(|| CONTROL_DIR.to_string()),
        require_stacking: bool_arg(require_stacking)?,
        stacked_on: optional(stacked_on)?,
        stack_pwd: optional(stack_pwd)?,
        repo_lock_token: optional(token)?,
    })
}

impl ControlDir for RemoteControlDir {
    fn base(&self) -> String {
        self.client.remote_url(&self.path)
    }

    fn open_repository(&self) -> Result<Box<dyn Repository>> {
        match self.open_remote_repository() {
            Err(BzrError::UnknownSmartMethod(_)) => self.ensure_real()?.open_repository(),
            other => Ok(Box::new(other?)),
        }
    }

    fn open_branch(&self) -> Result<Box<dyn Branch>> {
        match self.open_remote_branch() {
            Ok(Ok(branch)) => Ok(Box::new(branch)),
            Ok(Err(location)) => {
                debug!("{} is a reference to {}", self.base(), location);
                open_control_dir(&location)?.open_branch()
            }
            Err(BzrError::UnknownSmartMethod(_)) => self.ensure_real()?.open_branch(),
            Err(e) => Err(e),
        }
    }

    fn has_workingtree(&self) -> bool {
        self.has_workingtree
    }

    fn create_branch(&self) -> Result<Box<dyn Branch>> {
        self.create_remote_branch()
    }
}
