//! Request helpers on top of a shared medium.

use crate::medium::SharedMedium;
use crate::protocol::{ResponseStatus, SmartRequest, SmartResponse, UNKNOWN_METHOD};
use dbzr_core::{BzrError, Result};
use tracing::debug;

/// Issues requests over a medium and turns error replies into errors.
///
/// Unknown verbs come back as [`BzrError::UnknownSmartMethod`]; every other
/// error reply is [`BzrError::ErrorFromSmartServer`], left for the caller to
/// translate with whatever context it has.
#[derive(Debug, Clone)]
pub struct RpcClient {
    medium: SharedMedium,
}

impl RpcClient {
    pub fn new(medium: SharedMedium) -> Self {
        Self { medium }
    }

    pub fn medium(&self) -> &SharedMedium {
        &self.medium
    }

    pub fn base(&self) -> &str {
        self.medium.base()
    }

    /// Absolute URL of a server-relative path.
    pub fn remote_url(&self, path: &str) -> String {
        format!("{}{}", self.medium.base(), path.trim_start_matches('/'))
    }

    fn request(&self, verb: &[u8], args: &[&[u8]], body: Option<Vec<u8>>) -> Result<SmartResponse> {
        let request = SmartRequest::new(verb, args, body);
        let response = self.medium.send(&request)?;
        if response.status == ResponseStatus::Success {
            return Ok(response);
        }
        match response.error_tuple() {
            Some(tuple) if tuple.verb == UNKNOWN_METHOD => {
                debug!("server does not know {}", request.verb_str());
                Err(BzrError::UnknownSmartMethod(request.verb_str()))
            }
            Some(tuple) => Err(BzrError::ErrorFromSmartServer(tuple)),
            None => Err(self.bad_response(BzrError::SmartProtocolError(format!(
                "empty error reply to {}",
                request.verb_str()
            )))),
        }
    }

    pub fn call(&self, verb: &[u8], args: &[&[u8]]) -> Result<Vec<Vec<u8>>> {
        Ok(self.request(verb, args, None)?.args)
    }

    pub fn call_expecting_body(&self, verb: &[u8], args: &[&[u8]]) -> Result<(Vec<Vec<u8>>, Vec<u8>)> {
        let response = self.request(verb, args, None)?;
        Ok((response.args, response.body.unwrap_or_default()))
    }

    pub fn call_with_body_bytes(&self, verb: &[u8], args: &[&[u8]], body: &[u8]) -> Result<Vec<Vec<u8>>> {
        Ok(self.request(verb, args, Some(body.to_vec()))?.args)
    }

    pub fn call_with_body_bytes_expecting_body(
        &self,
        verb: &[u8],
        args: &[&[u8]],
        body: &[u8],
    ) -> Result<(Vec<Vec<u8>>, Vec<u8>)> {
        let response = self.request(verb, args, Some(body.to_vec()))?;
        Ok((response.args, response.body.unwrap_or_default()))
    }

    /// Send a body produced in chunks. The frame carries the chunks joined.
    pub fn call_with_body_stream<I>(&self, verb: &[u8], args: &[&[u8]], chunks: I) -> Result<Vec<Vec<u8>>>
    where
        I: IntoIterator<Item = Vec<u8>>,
    {
        let body: Vec<u8> = chunks.into_iter().flatten().collect();
        Ok(self.request(verb, args, Some(body))?.args)
    }

    /// Drop the connection after a reply the client could not parse, so the
    /// next request starts on a clean stream.
    pub fn bad_response(&self, err: BzrError) -> BzrError {
        self.medium.disconnect();
        err
    }
}

/// First reply argument, or an empty slice.
pub fn first_arg(args: &[Vec<u8>]) -> &[u8] {
    args.first().map(Vec::as_slice).unwrap_or_default()
}

/// Parse an ASCII decimal reply argument.
pub fn parse_u64(arg: &[u8]) -> Result<u64> {
    std::str::from_utf8(arg)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| BzrError::unexpected_response(&[arg.to_vec()]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::medium::SmartMedium;
    use dbzr_core::ErrorTuple;
    use std::sync::{Arc, Mutex};

    struct Scripted {
        replies: Vec<SmartResponse>,
        disconnects: Arc<Mutex<usize>>,
    }

    impl SmartMedium for Scripted {
        fn send(&mut self, _request: &SmartRequest) -> Result<SmartResponse> {
            Ok(self.replies.remove(0))
        }

        fn disconnect(&mut self) {
            *self.disconnects.lock().unwrap() += 1;
        }
    }

    fn client(replies: Vec<SmartResponse>) -> (RpcClient, Arc<Mutex<usize>>) {
        let disconnects = Arc::new(Mutex::new(0));
        let medium = Scripted {
            replies,
            disconnects: disconnects.clone(),
        };
        (RpcClient::new(SharedMedium::new(medium, "dbzr://server/")), disconnects)
    }

    #[test]
    fn test_error_replies() {
        let (client, _) = client(vec![
            SmartResponse::unknown_method(b"Branch.get_tags_bytes"),
            SmartResponse::error(ErrorTuple::new(b"nobranch", vec![])),
            SmartResponse::success_with_body(&[b"ok"], b"tags".to_vec()),
        ]);
        assert!(matches!(
            client.call(b"Branch.get_tags_bytes", &[b"trunk/"]),
            Err(BzrError::UnknownSmartMethod(verb)) if verb == "Branch.get_tags_bytes"
        ));
        assert!(matches!(
            client.call(b"Branch.get_tags_bytes", &[b"trunk/"]),
            Err(BzrError::ErrorFromSmartServer(t)) if t.verb == b"nobranch"
        ));
        let (args, body) = client.call_expecting_body(b"Branch.get_tags_bytes", &[b"trunk/"]).unwrap();
        assert_eq!(args, vec![b"ok".to_vec()]);
        assert_eq!(body, b"tags");
    }

    #[test]
    fn test_bad_response_disconnects() {
        let (client, disconnects) = client(vec![]);
        let err = client.bad_response(BzrError::SmartProtocolError("garbage".into()));
        assert!(matches!(err, BzrError::SmartProtocolError(_)));
        assert_eq!(*disconnects.lock().unwrap(), 1);
        assert_eq!(client.remote_url("/repo/"), "dbzr://server/repo/");
    }

    #[test]
    fn test_parse_u64() {
        assert_eq!(parse_u64(b"42").unwrap(), 42);
        assert!(parse_u64(b"x").is_err());
        assert_eq!(first_arg(&[]), b"");
    }
}
