//! `dbzr://host:port/path` URLs.

use crate::client::RpcClient;
use crate::medium::{SharedMedium, TcpMedium};
use crate::remote::RemoteControlDir;
use dbzr_core::{BzrError, ControlDir, Result, register_scheme};
use url::Url;

pub const SCHEME: &str = "dbzr";

pub const DEFAULT_PORT: u16 = 4155;

/// Split a smart URL into the server address and the path below the root.
pub fn parse_url(url: &str) -> Result<(String, String)> {
    let invalid = |extra: &str| BzrError::InvalidUrl {
        url: url.to_string(),
        extra: extra.to_string(),
    };
    let parsed = Url::parse(url).map_err(|e| invalid(&e.to_string()))?;
    if parsed.scheme() != SCHEME {
        return Err(invalid("not a dbzr:// URL"));
    }
    let host = parsed.host_str().filter(|h| !h.is_empty()).ok_or_else(|| invalid("no host"))?;
    let addr = format!("{}:{}", host, parsed.port().unwrap_or(DEFAULT_PORT));
    Ok((addr, parsed.path().trim_start_matches('/').to_string()))
}

/// Connect a client to the server named by `url`, returning it with the
/// server-relative path.
pub fn connect(url: &str) -> Result<(RpcClient, String)> {
    let (addr, path) = parse_url(url)?;
    let medium = SharedMedium::new(TcpMedium::new(&addr), &format!("{}://{}/", SCHEME, addr));
    Ok((RpcClient::new(medium), path))
}

fn open(url: &str) -> Result<Box<dyn ControlDir>> {
    let (client, path) = connect(url)?;
    Ok(Box::new(RemoteControlDir::open(client, &path)?))
}

/// Route `dbzr://` URLs through the smart client.
pub fn register() {
    register_scheme(SCHEME, open);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_url() {
        assert_eq!(
            parse_url("dbzr://example.com:9000/trunk/").unwrap(),
            ("example.com:9000".to_string(), "trunk/".to_string())
        );
        assert_eq!(
            parse_url("dbzr://localhost").unwrap(),
            ("localhost:4155".to_string(), String::new())
        );
        assert!(parse_url("http://localhost/").is_err());
        assert!(parse_url("dbzr://host:port/").is_err());
        assert!(parse_url("dbzr:///trunk").is_err());
        assert_eq!(
            parse_url("dbzr://[::1]:9000/a/../b").unwrap(),
            ("[::1]:9000".to_string(), "b".to_string())
        );
    }
}
