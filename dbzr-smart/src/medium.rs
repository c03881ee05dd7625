//! Connections to a smart server, and what the client has learned about the
//! server's protocol version.

use crate::protocol::{SmartRequest, SmartResponse, read_frame, write_frame};
use dbzr_core::{BzrError, Result};
use std::fmt;
use std::net::TcpStream;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, warn};

/// A `(major, minor)` protocol release; verbs are tagged with the release
/// that introduced them.
pub type ProtocolVersion = (u32, u32);

/// One request/response channel to a server.
pub trait SmartMedium: Send {
    fn send(&mut self, request: &SmartRequest) -> Result<SmartResponse>;

    /// Drop the connection; the next request reconnects.
    fn disconnect(&mut self) {}
}

struct MediumState {
    base: String,
    medium: Mutex<Box<dyn SmartMedium>>,
    remote_is_before: Mutex<Option<ProtocolVersion>>,
}

/// A medium shared by every proxy talking to the same server, so a
/// capability downgrade learned by one is honoured by all.
#[derive(Clone)]
pub struct SharedMedium {
    inner: Arc<MediumState>,
}

impl fmt::Debug for SharedMedium {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedMedium")
            .field("base", &self.inner.base)
            .field("remote_is_before", &self.remote_is_before())
            .finish()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

impl SharedMedium {
    /// `base` is the URL of the server root, ending in `/`.
    pub fn new(medium: impl SmartMedium + 'static, base: &str) -> Self {
        let mut base = base.to_string();
        if !base.ends_with('/') {
            base.push('/');
        }
        Self {
            inner: Arc::new(MediumState {
                base,
                medium: Mutex::new(Box::new(medium)),
                remote_is_before: Mutex::new(None),
            }),
        }
    }

    pub fn base(&self) -> &str {
        &self.inner.base
    }

    pub fn remote_is_before(&self) -> Option<ProtocolVersion> {
        *lock(&self.inner.remote_is_before)
    }

    /// Whether the server is known to predate `version`.
    pub fn is_remote_before(&self, version: ProtocolVersion) -> bool {
        self.remote_is_before().is_some_and(|bound| version >= bound)
    }

    /// Record that the server predates `version`. The bound only ever moves
    /// down.
    pub fn remember_remote_is_before(&self, version: ProtocolVersion) {
        let mut bound = lock(&self.inner.remote_is_before);
        if let Some(current) = *bound {
            if version > current {
                warn!(
                    "ignoring attempt to raise remote_is_before of {} from {:?} to {:?}",
                    self.inner.base, current, version
                );
                return;
            }
        }
        debug!("{} is before {:?}", self.inner.base, version);
        *bound = Some(version);
    }

    pub fn send(&self, request: &SmartRequest) -> Result<SmartResponse> {
        lock(&self.inner.medium).send(request)
    }

    pub fn disconnect(&self) {
        debug!("disconnecting from {}", self.inner.base);
        lock(&self.inner.medium).disconnect();
    }

    /// Whether `other` is the same connection.
    pub fn same_medium(&self, other: &SharedMedium) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

/// A medium over a TCP connection, opened on first use.
#[derive(Debug)]
pub struct TcpMedium {
    addr: String,
    stream: Option<TcpStream>,
}

impl TcpMedium {
    pub fn new(addr: &str) -> Self {
        Self {
            addr: addr.to_string(),
            stream: None,
        }
    }

    fn stream(&mut self) -> Result<&mut TcpStream> {
        if self.stream.is_none() {
            debug!("connecting to {}", self.addr);
            let stream = TcpStream::connect(&self.addr)?;
            stream.set_nodelay(true)?;
            self.stream = Some(stream);
        }
        self.stream
            .as_mut()
            .ok_or_else(|| BzrError::ConnectionReset(self.addr.clone()))
    }

    fn exchange(&mut self, request: &SmartRequest) -> Result<SmartResponse> {
        let stream = self.stream()?;
        write_frame(stream, request)?;
        read_frame(stream)?.ok_or_else(|| BzrError::ConnectionReset(self.addr.clone()))
    }
}

impl SmartMedium for TcpMedium {
    fn send(&mut self, request: &SmartRequest) -> Result<SmartResponse> {
        let result = self.exchange(request);
        if result.is_err() {
            self.stream = None;
        }
        result
    }

    fn disconnect(&mut self) {
        self.stream = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ResponseStatus;

    struct Echo;

    impl SmartMedium for Echo {
        fn send(&mut self, request: &SmartRequest) -> Result<SmartResponse> {
            Ok(SmartResponse {
                status: ResponseStatus::Success,
                args: vec![request.verb.clone()],
                body: None,
            })
        }
    }

    #[test]
    fn test_remote_is_before_only_lowers() {
        let medium = SharedMedium::new(Echo, "dbzr://example");
        assert_eq!(medium.base(), "dbzr://example/");
        assert!(!medium.is_remote_before((1, 2)));

        medium.remember_remote_is_before((1, 16));
        assert!(medium.is_remote_before((1, 16)));
        assert!(medium.is_remote_before((2, 0)));
        assert!(!medium.is_remote_before((1, 13)));

        medium.remember_remote_is_before((2, 1));
        assert_eq!(medium.remote_is_before(), Some((1, 16)));

        medium.remember_remote_is_before((1, 2));
        assert_eq!(medium.remote_is_before(), Some((1, 2)));
    }

    #[test]
    fn test_clones_share_state() {
        let medium = SharedMedium::new(Echo, "dbzr://example/");
        let other = medium.clone();
        other.remember_remote_is_before((1, 13));
        assert!(medium.is_remote_before((1, 13)));
        assert!(medium.same_medium(&other));
        let response = medium.send(&SmartRequest::new(b"hello", &[], None)).unwrap();
        assert_eq!(response.args, vec![b"hello".to_vec()]);
    }
}
