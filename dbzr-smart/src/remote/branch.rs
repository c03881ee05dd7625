//! Branch proxy.
//!
//! The branch and its repository are locked together with one
//! `Branch.lock_write` request. Operations without a verb on the server go to
//! a [`BzrBranch`] opened over [`SmartTransport`], which re-enters the same
//! physical locks through the tokens.

use super::delegate::Delegate;
use super::repository::RemoteRepository;
use super::{arg_string, normalize_dir};
use crate::client::{RpcClient, first_arg, parse_u64};
use crate::medium::ProtocolVersion;
use crate::translate::{ErrorContext, translate_error};
use crate::vfs::SmartTransport;
use dbzr_core::branch::{check_stacking_location, copy_heads, open_fallback_repository, stacking_heads};
use dbzr_core::controldir::{BRANCH_DIR, CONTROL_DIR};
use dbzr_core::{Branch, BranchFiles, BzrBranch, BzrError, LockMode, Repository, Result, RevisionId};
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Debug)]
pub struct RemoteBranch {
    client: RpcClient,
    /// Server-relative path of the control directory, `""` or `"a/b/"`.
    path: String,
    repository: RemoteRepository,
    real: Delegate<BzrBranch>,
    lock_mode: Option<LockMode>,
    lock_count: usize,
    lock_token: Option<String>,
    repo_lock_token: Option<String>,
    leave_lock: bool,
    cached_info: Option<(u64, RevisionId)>,
}

impl RemoteBranch {
    /// A proxy for the branch at `path`. Stacking is not activated here, see
    /// [`RemoteBranch::activate_stacking`].
    pub fn new(client: RpcClient, path: &str, repository: RemoteRepository) -> Self {
        Self {
            client,
            path: normalize_dir(path),
            repository,
            real: Delegate::Unbound,
            lock_mode: None,
            lock_count: 0,
            lock_token: None,
            repo_lock_token: None,
            leave_lock: false,
            cached_info: None,
        }
    }

    pub fn remote_repository(&mut self) -> &mut RemoteRepository {
        &mut self.repository
    }

    pub fn is_real_bound(&self) -> bool {
        self.real.is_bound()
    }

    fn is_before(&self, version: ProtocolVersion) -> bool {
        self.client.medium().is_remote_before(version)
    }

    fn remember_before(&self, version: ProtocolVersion) {
        self.client.medium().remember_remote_is_before(version);
    }

    fn error_context(&self) -> ErrorContext {
        let base = self.base();
        ErrorContext::branch(base.clone())
            .with_path(base)
            .with_token(self.lock_token.as_deref())
    }

    fn translate(&self, err: BzrError) -> BzrError {
        translate_error(err, &self.error_context())
    }

    fn bad_reply(&self, reply: &[Vec<u8>]) -> BzrError {
        self.client.bad_response(BzrError::unexpected_response(reply))
    }

    fn tokens(&self) -> (String, String) {
        (
            self.lock_token.clone().unwrap_or_default(),
            self.repo_lock_token.clone().unwrap_or_default(),
        )
    }

    fn require_write_lock(&self) -> Result<()> {
        if self.lock_mode != Some(LockMode::Write) {
            return Err(BzrError::NotWriteLocked(self.base()));
        }
        Ok(())
    }

    fn branch_files(&self) -> Result<BranchFiles> {
        let path = format!("{}{}/{}", self.path, CONTROL_DIR, BRANCH_DIR);
        Ok(BranchFiles::new(Arc::new(SmartTransport::new(self.client.clone(), &path)?)))
    }

    // ==================== Delegate ====================

    /// The real branch, opened over plain file operations and brought to the
    /// proxy's lock state if it is not bound yet.
    pub fn ensure_real(&mut self) -> Result<&mut BzrBranch> {
        if !self.real.is_bound() {
            debug!("binding real branch for {}", self.base());
            let files = self.branch_files()?;
            let mut real = BzrBranch::open(&self.base(), Arc::clone(files.transport()), self.repository.reopen()?)?;
            real.activate_stacking()?;
            match self.lock_mode {
                Some(LockMode::Write) => {
                    real.lock_write_tokens(self.lock_token.as_deref(), self.repo_lock_token.as_deref())?;
                }
                Some(LockMode::Read) => real.lock_read()?,
                None => {}
            }
            self.real = Delegate::Bound(real);
        }
        let base = self.base();
        self.real
            .get_mut()
            .ok_or_else(|| BzrError::BzrCheckError(format!("{} has no real branch", base)))
    }

    /// Release and drop the real branch. Its locks were taken through tokens
    /// or as read locks, so nothing on the server changes.
    fn unbind_real(&mut self) {
        if let Some(mut real) = self.real.take() {
            while real.is_locked() {
                if let Err(e) = real.unlock() {
                    warn!("failed to unlock real branch {}: {}", real.base(), e);
                    break;
                }
            }
        }
    }

    /// Add the repository of the stacked-on branch as a fallback.
    pub fn activate_stacking(&mut self) -> Result<()> {
        match self.get_stacked_on_url() {
            Ok(url) => {
                debug!("{} is stacked on {}", self.base(), url);
                let fallback = open_fallback_repository(&self.base(), &url)?;
                self.repository.add_fallback_repository(fallback)
            }
            Err(BzrError::NotStacked(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    // ==================== Locking ====================

    fn remote_lock_write(&self, token: Option<&str>, repo_token: Option<&str>) -> Result<(String, Option<String>)> {
        let reply = self
            .client
            .call(
                b"Branch.lock_write",
                &[
                    self.path.as_bytes(),
                    token.unwrap_or_default().as_bytes(),
                    repo_token.unwrap_or_default().as_bytes(),
                ],
            )
            .map_err(|e| translate_error(e, &self.error_context().with_token(token)))?;
        match reply.as_slice() {
            [ok, token, repo_token] if ok == b"ok" => {
                let repo_token = if repo_token.is_empty() {
                    None
                } else {
                    Some(arg_string(repo_token)?)
                };
                Ok((arg_string(token)?, repo_token))
            }
            _ => Err(self.bad_reply(&reply)),
        }
    }

    fn remote_unlock(&self) -> Result<()> {
        let (token, repo_token) = self.tokens();
        let reply = self
            .client
            .call(
                b"Branch.unlock",
                &[self.path.as_bytes(), token.as_bytes(), repo_token.as_bytes()],
            )
            .map_err(|e| self.translate(e))?;
        match first_arg(&reply) {
            b"ok" => Ok(()),
            _ => Err(self.bad_reply(&reply)),
        }
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
                if let (Some(given), Some(held)) = (token, self.lock_token.as_deref()) {
                    if given != held {
                        return Err(BzrError::TokenMismatch {
                            given: given.to_string(),
                            lock: held.to_string(),
                        });
                    }
                }
                self.repository.lock_write(self.repo_lock_token.as_deref())?;
                self.lock_count += 1;
                Ok((self.lock_token.clone().unwrap_or_default(), self.repo_lock_token.clone()))
            }
            None => {
                let (token_held, repo_held) = self.remote_lock_write(token, repo_token)?;
                self.repository.lock_write_skip_rpc(repo_held.as_deref())?;
                self.lock_token = Some(token_held.clone());
                self.repo_lock_token = repo_held.clone();
                self.leave_lock = token.is_some();
                self.lock_mode = Some(LockMode::Write);
                self.lock_count = 1;
                if let Some(real) = self.real.get_mut() {
                    real.lock_write_tokens(Some(&token_held), repo_held.as_deref())?;
                }
                Ok((token_held, repo_held))
            }
        }
    }

    // ==================== Stacking ====================

    /// Swap the repository for an unstacked one over the same storage, after
    /// copying in what the branch needs from its fallbacks.
    fn unstack(&mut self) -> Result<()> {
        let heads = stacking_heads(self)?;
        let token = self
            .repository
            .lock_token()
            .ok_or_else(|| BzrError::TokenLockingNotSupported(self.repository.base()))?;
        let mut fresh = RemoteRepository::new(
            self.client.clone(),
            self.repository.path(),
            self.repository.format(),
        );
        fresh.lock_write_skip_rpc(Some(&token))?;
        if let Err(e) = copy_heads(&mut self.repository, &mut fresh, &heads) {
            if let Err(unlock_error) = fresh.unlock() {
                warn!("failed to unlock {}: {}", fresh.base(), unlock_error);
            }
            return Err(e);
        }
        // Both instances hold the lock through the token, so handing it over
        // sends no requests.
        let mut depth = 0;
        while self.repository.is_locked() {
            self.repository.unlock()?;
            depth += 1;
        }
        for _ in 1..depth {
            fresh.lock_write(Some(&token))?;
        }
        let mut old = std::mem::replace(&mut self.repository, fresh);
        drop(old.take_fallback_repositories());
        debug!("unstacked {}", self.base());
        Ok(())
    }
}

impl Branch for RemoteBranch {
    fn base(&self) -> String {
        self.client.remote_url(&self.path)
    }

    fn repository(&mut self) -> &mut dyn Repository {
        &mut self.repository
    }

    fn lock_read(&mut self) -> Result<()> {
        self.repository.lock_read()?;
        if self.lock_mode.is_none() {
            self.lock_mode = Some(LockMode::Read);
            self.lock_count = 0;
            if let Some(real) = self.real.get_mut() {
                real.lock_read()?;
            }
        }
        self.lock_count += 1;
        Ok(())
    }

    fn lock_write(&mut self, token: Option<&str>) -> Result<Option<String>> {
        let repo_token = match token {
            Some(_) => self.repository.lock_token(),
            None => None,
        };
        let (token, _) = self.lock_write_tokens(token, repo_token.as_deref())?;
        Ok(Some(token))
    }

    fn unlock(&mut self) -> Result<()> {
        if self.lock_count == 0 {
            return Err(BzrError::LockNotHeld(self.base()));
        }
        self.lock_count -= 1;
        if self.lock_count > 0 {
            return self.repository.unlock();
        }
        self.cached_info = None;
        let mut result = Ok(());
        if let Some(real) = self.real.get_mut() {
            result = real.unlock();
        }
        if self.lock_mode == Some(LockMode::Write) && !self.leave_lock {
            result = result.and(self.remote_unlock());
        }
        self.lock_mode = None;
        self.lock_token = None;
        self.repo_lock_token = None;
        let repo_result = self.repository.unlock();
        result.and(repo_result)
    }

    fn lock_mode(&self) -> Option<LockMode> {
        self.lock_mode
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

    fn last_revision_info(&mut self) -> Result<(u64, RevisionId)> {
        if let Some(info) = &self.cached_info {
            return Ok(info.clone());
        }
        let reply = self
            .client
            .call(b"Branch.last_revision_info", &[self.path.as_bytes()])
            .map_err(|e| self.translate(e))?;
        let info = match reply.as_slice() {
            [ok, revno, revision_id] if ok == b"ok" => (parse_u64(revno)?, revision_id.clone()),
            _ => return Err(self.bad_reply(&reply)),
        };
        if self.lock_mode.is_some() {
            self.cached_info = Some(info.clone());
        }
        Ok(info)
    }

    fn set_last_revision_info(&mut self, revno: u64, revision_id: &[u8]) -> Result<()> {
        self.require_write_lock()?;
        self.cached_info = None;
        if !self.is_before((1, 6)) {
            let (token, repo_token) = self.tokens();
            let revno_arg = revno.to_string();
            let args: [&[u8]; 5] = [
                self.path.as_bytes(),
                token.as_bytes(),
                repo_token.as_bytes(),
                revno_arg.as_bytes(),
                revision_id,
            ];
            match self.client.call(b"Branch.set_last_revision_info", &args) {
                Ok(reply) => {
                    if first_arg(&reply) != b"ok" {
                        return Err(self.bad_reply(&reply));
                    }
                    self.cached_info = Some((revno, revision_id.to_vec()));
                    return Ok(());
                }
                Err(BzrError::UnknownSmartMethod(_)) => self.remember_before((1, 6)),
                Err(e) => return Err(self.translate(e)),
            }
        }
        self.ensure_real()?.set_last_revision_info(revno, revision_id)?;
        self.cached_info = Some((revno, revision_id.to_vec()));
        Ok(())
    }

    fn get_tags_bytes(&mut self) -> Result<Vec<u8>> {
        if !self.is_before((1, 13)) {
            match self
                .client
                .call_expecting_body(b"Branch.get_tags_bytes", &[self.path.as_bytes()])
            {
                Ok((_, body)) => return Ok(body),
                Err(BzrError::UnknownSmartMethod(_)) => self.remember_before((1, 13)),
                Err(e) => return Err(self.translate(e)),
            }
        }
        self.ensure_real()?.get_tags_bytes()
    }

    fn set_tags_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        self.require_write_lock()?;
        if !self.is_before((1, 18)) {
            let (token, repo_token) = self.tokens();
            match self.client.call_with_body_bytes(
                b"Branch.set_tags_bytes",
                &[self.path.as_bytes(), token.as_bytes(), repo_token.as_bytes()],
                bytes,
            ) {
                Ok(_) => return Ok(()),
                Err(BzrError::UnknownSmartMethod(_)) => self.remember_before((1, 18)),
                Err(e) => return Err(self.translate(e)),
            }
        }
        self.ensure_real()?.set_tags_bytes(bytes)
    }

    fn get_stacked_on_url(&mut self) -> Result<String> {
        match self
            .client
            .call(b"Branch.get_stacked_on_url", &[self.path.as_bytes()])
        {
            Ok(reply) => match reply.as_slice() {
                [ok, url] if ok == b"ok" => arg_string(url),
                _ => Err(self.bad_reply(&reply)),
            },
            Err(BzrError::UnknownSmartMethod(_)) => self.ensure_real()?.get_stacked_on_url(),
            Err(e) => Err(self.translate(e)),
        }
    }

    fn set_stacked_on_url(&mut self, url: Option<&str>) -> Result<()> {
        self.require_write_lock()?;
        let base = self.base();
        if let Some(url) = url {
            check_stacking_location(&base, url)?;
        }
        let files = self.branch_files()?;
        let mut config = files.config()?;
        if config.stacked_on_location.is_some() {
            self.unstack()?;
        }
        if let Some(url) = url {
            self.repository.add_fallback_repository(open_fallback_repository(&base, url)?)?;
        }
        config.stacked_on_location = url.map(str::to_string);
        files.save_config(&config)?;
        // The real branch carries the old fallbacks; rebind on next use.
        self.unbind_real();
        info!("{} stacked on {}", self.base(), url.unwrap_or("nothing"));
        Ok(())
    }
}
