//! File access over the smart medium.
//!
//! [`SmartTransport`] is the transport real delegates are opened on when a
//! remote proxy has to fall back to driving the storage format itself.

use crate::client::{RpcClient, first_arg, parse_u64};
use crate::translate::{ErrorContext, translate_error};
use dbzr_core::transport::{FileStat, resolve_segments};
use dbzr_core::{BzrError, Result, Transport};
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct SmartTransport {
    client: RpcClient,
    segments: Vec<String>,
}

impl SmartTransport {
    /// A transport at `path`, relative to the server root.
    pub fn new(client: RpcClient, path: &str) -> Result<Self> {
        Ok(Self {
            segments: resolve_segments(&[], path)?,
            client,
        })
    }

    pub fn client(&self) -> &RpcClient {
        &self.client
    }

    /// Server-relative path of this transport, with a trailing `/` unless it
    /// is the root.
    pub fn remote_path(&self) -> String {
        if self.segments.is_empty() {
            String::new()
        } else {
            format!("{}/", self.segments.join("/"))
        }
    }

    fn abspath(&self, relpath: &str) -> Result<String> {
        Ok(resolve_segments(&self.segments, relpath)?.join("/"))
    }

    fn translate(&self, path: &str, err: BzrError) -> BzrError {
        translate_error(err, &ErrorContext::path(self.client.remote_url(path)))
    }

    fn call(&self, verb: &[u8], relpath: &str) -> Result<Vec<Vec<u8>>> {
        let path = self.abspath(relpath)?;
        self.client
            .call(verb, &[path.as_bytes()])
            .map_err(|e| self.translate(&path, e))
    }

    fn expect_ok(&self, args: Vec<Vec<u8>>) -> Result<()> {
        match first_arg(&args) {
            b"ok" => Ok(()),
            _ => Err(self.client.bad_response(BzrError::unexpected_response(&args))),
        }
    }
}

fn encode_offsets(offsets: &[(u64, u64)]) -> Vec<u8> {
    offsets
        .iter()
        .map(|(offset, length)| format!("{},{}", offset, length))
        .collect::<Vec<_>>()
        .join("\n")
        .into_bytes()
}

/// Parse a readv request body.
pub fn decode_offsets(body: &[u8]) -> Result<Vec<(u64, u64)>> {
    let text = std::str::from_utf8(body).map_err(BzrError::serialization)?;
    text.lines()
        .filter(|line| !line.is_empty())
        .map(|line| {
            let (offset, length) = line
                .split_once(',')
                .ok_or_else(|| BzrError::SmartProtocolError(format!("bad readv offset {:?}", line)))?;
            let offset = offset.parse().map_err(BzrError::serialization)?;
            let length = length.parse().map_err(BzrError::serialization)?;
            Ok((offset, length))
        })
        .collect()
}

impl Transport for SmartTransport {
    fn base(&self) -> String {
        self.client.remote_url(&self.remote_path())
    }

    fn clone_to(&self, relpath: &str) -> Result<Arc<dyn Transport>> {
        Ok(Arc::new(Self {
            client: self.client.clone(),
            segments: resolve_segments(&self.segments, relpath)?,
        }))
    }

    fn get_bytes(&self, relpath: &str) -> Result<Vec<u8>> {
        let path = self.abspath(relpath)?;
        let (_, body) = self
            .client
            .call_expecting_body(b"get", &[path.as_bytes()])
            .map_err(|e| self.translate(&path, e))?;
        Ok(body)
    }

    fn readv(&self, relpath: &str, offsets: &[(u64, u64)]) -> Result<Vec<Vec<u8>>> {
        if offsets.is_empty() {
            return Ok(Vec::new());
        }
        let path = self.abspath(relpath)?;
        let (_, data) = self
            .client
            .call_with_body_bytes_expecting_body(b"readv", &[path.as_bytes()], &encode_offsets(offsets))
            .map_err(|e| self.translate(&path, e))?;
        let mut pos = 0usize;
        let mut chunks = Vec::with_capacity(offsets.len());
        for &(offset, length) in offsets {
            let end = pos + length as usize;
            if end > data.len() {
                return Err(BzrError::ShortReadvError {
                    path: self.client.remote_url(&path),
                    offset,
                    length,
                    actual: data.len().saturating_sub(pos) as u64,
                });
            }
            chunks.push(data[pos..end].to_vec());
            pos = end;
        }
        Ok(chunks)
    }

    fn put_bytes(&self, relpath: &str, bytes: &[u8]) -> Result<()> {
        let path = self.abspath(relpath)?;
        let args = self
            .client
            .call_with_body_bytes(b"put", &[path.as_bytes()], bytes)
            .map_err(|e| self.translate(&path, e))?;
        self.expect_ok(args)
    }

    fn append_bytes(&self, relpath: &str, bytes: &[u8]) -> Result<u64> {
        let path = self.abspath(relpath)?;
        let args = self
            .client
            .call_with_body_bytes(b"append", &[path.as_bytes()], bytes)
            .map_err(|e| self.translate(&path, e))?;
        match args.as_slice() {
            [status, offset] if status == b"appended" => parse_u64(offset),
            _ => Err(self.client.bad_response(BzrError::unexpected_response(&args))),
        }
    }

    fn has(&self, relpath: &str) -> Result<bool> {
        let args = self.call(b"has", relpath)?;
        match first_arg(&args) {
            b"yes" => Ok(true),
            b"no" => Ok(false),
            _ => Err(self.client.bad_response(BzrError::unexpected_response(&args))),
        }
    }

    fn stat(&self, relpath: &str) -> Result<FileStat> {
        let args = self.call(b"stat", relpath)?;
        match args.as_slice() {
            [status, size, kind] if status == b"stat" => Ok(FileStat {
                size: parse_u64(size)?,
                is_dir: kind == b"dir",
            }),
            _ => Err(self.client.bad_response(BzrError::unexpected_response(&args))),
        }
    }

    fn list_dir(&self, relpath: &str) -> Result<Vec<String>> {
        let path = self.abspath(relpath)?;
        let (_, body) = self
            .client
            .call_expecting_body(b"list_dir", &[path.as_bytes()])
            .map_err(|e| self.translate(&path, e))?;
        let text = String::from_utf8(body).map_err(|e| self.client.bad_response(BzrError::serialization(e)))?;
        Ok(text.lines().filter(|l| !l.is_empty()).map(str::to_string).collect())
    }

    fn mkdir(&self, relpath: &str) -> Result<()> {
        let args = self.call(b"mkdir", relpath)?;
        self.expect_ok(args)
    }

    fn rename(&self, from: &str, to: &str) -> Result<()> {
        let from = self.abspath(from)?;
        let to = self.abspath(to)?;
        let args = self
            .client
            .call(b"rename", &[from.as_bytes(), to.as_bytes()])
            .map_err(|e| self.translate(&from, e))?;
        self.expect_ok(args)
    }

    fn delete(&self, relpath: &str) -> Result<()> {
        let args = self.call(b"delete", relpath)?;
        self.expect_ok(args)
    }

    fn rmdir(&self, relpath: &str) -> Result<()> {
        let args = self.call(b"rmdir", relpath)?;
        self.expect_ok(args)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_offsets_roundtrip() {
        let offsets = vec![(0, 10), (100, 3)];
        assert_eq!(decode_offsets(&encode_offsets(&offsets)).unwrap(), offsets);
        assert!(decode_offsets(b"12").is_err());
        assert!(decode_offsets(b"").unwrap().is_empty());
    }
}
