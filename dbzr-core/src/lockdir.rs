//! Cooperative advisory locks held as a directory on a transport.
//!
//! The lock is taken by creating `<path>/held`, which fails when another
//! process already holds it. `<path>/held/info` records the opaque token, so
//! another process (or a smart server acting for a client) can re-enter a held
//! lock by presenting the same token.

use crate::errors::{BzrError, Result};
use crate::transport::Transport;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

/// Contents of the `info` file inside a held lock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockInfo {
    pub token: String,
    /// Unix seconds when the lock was taken.
    pub start_time: i64,
    pub pid: u32,
}

/// A lock directory on a transport.
#[derive(Debug)]
pub struct LockDir {
    transport: Arc<dyn Transport>,
    path: String,
    held_token: Option<String>,
    /// True when the physical lock is owned by whoever issued the token, and
    /// unlocking must leave it in place.
    locked_via_token: bool,
}

impl LockDir {
    pub fn new(transport: Arc<dyn Transport>, path: &str) -> Self {
        Self {
            transport,
            path: path.to_string(),
            held_token: None,
            locked_via_token: false,
        }
    }

    fn held_path(&self) -> String {
        format!("{}/held", self.path)
    }

    fn info_path(&self) -> String {
        format!("{}/held/info", self.path)
    }

    fn url(&self) -> String {
        format!("{}{}", self.transport.base(), self.path)
    }

    /// Create the (unheld) lock directory.
    pub fn create(&self) -> Result<()> {
        self.transport.ensure_dir(&self.path)
    }

    pub fn is_held(&self) -> bool {
        self.held_token.is_some()
    }

    pub fn token(&self) -> Option<&str> {
        self.held_token.as_deref()
    }

    /// Take the physical lock, returning a fresh token.
    pub fn attempt_lock(&mut self) -> Result<String> {
        if self.transport.is_readonly() {
            return Err(BzrError::UnlockableTransport(self.transport.base()));
        }
        if self.held_token.is_some() {
            return Err(BzrError::LockContention {
                lock: self.url(),
                msg: " (already held by this object)".to_string(),
            });
        }
        match self.transport.mkdir(&self.held_path()) {
            Ok(()) => {}
            Err(BzrError::FileExists(_)) => {
                return Err(BzrError::LockContention {
                    lock: self.url(),
                    msg: String::new(),
                });
            }
            Err(e) if e.is_no_such_file() => {
                self.create()?;
                self.transport.mkdir(&self.held_path()).map_err(|e| match e {
                    BzrError::FileExists(_) => BzrError::LockContention {
                        lock: self.url(),
                        msg: String::new(),
                    },
                    other => other,
                })?;
            }
            Err(e) => return Err(e),
        }
        let info = LockInfo {
            token: uuid::Uuid::new_v4().simple().to_string(),
            start_time: chrono::Utc::now().timestamp(),
            pid: std::process::id(),
        };
        self.transport
            .put_bytes(&self.info_path(), &serde_json::to_vec(&info)?)?;
        debug!("took lock {} token {}", self.url(), info.token);
        self.held_token = Some(info.token.clone());
        self.locked_via_token = false;
        Ok(info.token)
    }

    /// Read the current holder, if any.
    pub fn peek(&self) -> Result<Option<LockInfo>> {
        match self.transport.get_bytes(&self.info_path()) {
            Ok(data) => Ok(Some(serde_json::from_slice(&data)?)),
            Err(e) if e.is_no_such_file() => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Check that `token` is the token of the lock currently held on disk.
    pub fn validate_token(&self, token: &str) -> Result<()> {
        let current = self.peek()?.map(|info| info.token).unwrap_or_default();
        if current != token {
            return Err(BzrError::TokenMismatch {
                given: token.to_string(),
                lock: current,
            });
        }
        Ok(())
    }

    /// Lock, or re-enter an existing physical lock when `token` is given.
    pub fn lock_write(&mut self, token: Option<&str>) -> Result<String> {
        match token {
            Some(token) => {
                if let Some(held) = &self.held_token {
                    if held != token {
                        return Err(BzrError::TokenMismatch {
                            given: token.to_string(),
                            lock: held.clone(),
                        });
                    }
                    return Ok(held.clone());
                }
                self.validate_token(token)?;
                self.held_token = Some(token.to_string());
                self.locked_via_token = true;
                Ok(token.to_string())
            }
            None => self.attempt_lock(),
        }
    }

    /// Keep the physical lock on disk when this object unlocks.
    pub fn leave_in_place(&mut self) {
        self.locked_via_token = true;
    }

    pub fn dont_leave_in_place(&mut self) {
        self.locked_via_token = false;
    }

    pub fn unlock(&mut self) -> Result<()> {
        let token = self
            .held_token
            .take()
            .ok_or_else(|| BzrError::LockNotHeld(self.url()))?;
        if self.locked_via_token {
            self.locked_via_token = false;
            return Ok(());
        }
        match self.peek()? {
            Some(info) if info.token == token => {}
            _ => {
                return Err(BzrError::LockNotHeld(format!("{} (lock was broken)", self.url())));
            }
        }
        self.transport.delete(&self.info_path())?;
        self.transport.rmdir(&self.held_path())?;
        debug!("released lock {}", self.url());
        Ok(())
    }

    /// Forcibly remove whatever lock is held on disk.
    pub fn break_lock(&mut self) -> Result<()> {
        if let Err(e) = self.transport.delete(&self.info_path()) {
            if !e.is_no_such_file() {
                return Err(e);
            }
        }
        match self.transport.rmdir(&self.held_path()) {
            Ok(()) => Ok(()),
            Err(e) if e.is_no_such_file() => Ok(()),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MemoryTransport;

    fn lockdir(t: &Arc<dyn Transport>) -> LockDir {
        let lock = LockDir::new(Arc::clone(t), "lock");
        lock.create().unwrap();
        lock
    }

    #[test]
    fn test_contention_and_release() {
        let t: Arc<dyn Transport> = Arc::new(MemoryTransport::new());
        let mut a = lockdir(&t);
        let mut b = lockdir(&t);
        a.attempt_lock().unwrap();
        assert!(matches!(b.attempt_lock(), Err(BzrError::LockContention { .. })));
        a.unlock().unwrap();
        b.attempt_lock().unwrap();
        b.unlock().unwrap();
        assert!(a.peek().unwrap().is_none());
    }

    #[test]
    fn test_reenter_with_token_leaves_lock() {
        let t: Arc<dyn Transport> = Arc::new(MemoryTransport::new());
        let mut owner = lockdir(&t);
        let token = owner.attempt_lock().unwrap();

        let mut other = lockdir(&t);
        assert!(matches!(
            other.lock_write(Some("wrong")),
            Err(BzrError::TokenMismatch { .. })
        ));
        other.lock_write(Some(&token)).unwrap();
        other.unlock().unwrap();
        // The physical lock survives the token holder's unlock.
        assert_eq!(owner.peek().unwrap().unwrap().token, token);
        owner.unlock().unwrap();
    }

    #[test]
    fn test_unlock_not_held() {
        let t: Arc<dyn Transport> = Arc::new(MemoryTransport::new());
        let mut lock = lockdir(&t);
        assert!(matches!(lock.unlock(), Err(BzrError::LockNotHeld(_))));
    }

    #[test]
    fn test_break_lock() {
        let t: Arc<dyn Transport> = Arc::new(MemoryTransport::new());
        let mut a = lockdir(&t);
        a.attempt_lock().unwrap();
        let mut breaker = lockdir(&t);
        breaker.break_lock().unwrap();
        assert!(breaker.attempt_lock().is_ok());
    }
}
