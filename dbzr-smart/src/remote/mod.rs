//! Proxies for control directories, repositories and branches on a smart
//! server.
//!
//! Each proxy prefers the newest verb for an operation and steps down as the
//! server reports verbs it does not know. When nothing is left it binds a
//! real object over [`SmartTransport`](crate::vfs::SmartTransport) and
//! forwards to it.

pub mod branch;
pub mod delegate;
pub mod dir;
pub mod repository;
pub mod stream;

pub use branch::RemoteBranch;
pub use delegate::Delegate;
pub use dir::RemoteControlDir;
pub use repository::RemoteRepository;

use crate::client::first_arg;
use dbzr_core::{BzrError, Result};

/// Normalize a server-relative directory path to `""` or `"a/b/"`.
pub fn normalize_dir(path: &str) -> String {
    let trimmed = path.trim_matches('/');
    if trimmed.is_empty() || trimmed == "." {
        String::new()
    } else {
        format!("{}/", trimmed)
    }
}

/// Require a reply opening with `ok`.
fn expect_ok(args: &[Vec<u8>]) -> Result<()> {
    match first_arg(args) {
        b"ok" => Ok(()),
        _ => Err(BzrError::unexpected_response(args)),
    }
}

fn arg_string(arg: &[u8]) -> Result<String> {
    String::from_utf8(arg.to_vec()).map_err(BzrError::serialization)
}

fn bool_arg(arg: &[u8]) -> Result<bool> {
    match arg {
        b"yes" | b"True" => Ok(true),
        b"no" | b"False" => Ok(false),
        other => Err(BzrError::unexpected_response(&[other.to_vec()])),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_dir() {
        assert_eq!(normalize_dir(""), "");
        assert_eq!(normalize_dir("/"), "");
        assert_eq!(normalize_dir("trunk"), "trunk/");
        assert_eq!(normalize_dir("/a/b/"), "a/b/");
    }

    #[test]
    fn test_bool_arg() {
        assert!(bool_arg(b"yes").unwrap());
        assert!(!bool_arg(b"False").unwrap());
        assert!(bool_arg(b"maybe").is_err());
    }
}
