//! Smart protocol wire frames.
//!
//! Every request and response travels as one frame:
//!
//! ```text
//! [magic "DBZS"(4)] [flags(1)] [uncompressed_len(4)] [payload_len(4)] [payload]
//! ```
//!
//! The payload is a bincode encoded [`SmartRequest`] or [`SmartResponse`].
//! Flag bit `0x01` marks a zstd compressed payload, used for large frames.

use dbzr_core::{BzrError, ErrorTuple, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::io::{self, Read, Write};

/// Magic bytes opening every frame.
pub const FRAME_MAGIC: &[u8; 4] = b"DBZS";

/// Flag bit for a zstd compressed payload.
pub const FLAG_COMPRESSED: u8 = 0x01;

/// Length of the fixed frame header.
pub const HEADER_LEN: usize = 13;

/// Payloads above this size are compressed.
pub const COMPRESSION_THRESHOLD: usize = 64 * 1024;

/// Maximum single frame size (256 MB).
pub const MAX_FRAME_SIZE: usize = 256 * 1024 * 1024;

/// Error verb a server answers with for requests it does not implement.
pub const UNKNOWN_METHOD: &[u8] = b"UnknownMethod";

const ZSTD_LEVEL: i32 = 3;

/// A client request: a verb, byte string arguments and an optional body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SmartRequest {
    pub verb: Vec<u8>,
    pub args: Vec<Vec<u8>>,
    pub body: Option<Vec<u8>>,
}

impl SmartRequest {
    pub fn new(verb: &[u8], args: &[&[u8]], body: Option<Vec<u8>>) -> Self {
        Self {
            verb: verb.to_vec(),
            args: args.iter().map(|a| a.to_vec()).collect(),
            body,
        }
    }

    pub fn verb_str(&self) -> String {
        String::from_utf8_lossy(&self.verb).into_owned()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResponseStatus {
    Success,
    Error,
}

/// A server response. For errors `args` is the error tuple, verb first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SmartResponse {
    pub status: ResponseStatus,
    pub args: Vec<Vec<u8>>,
    pub body: Option<Vec<u8>>,
}

impl SmartResponse {
    pub fn success(args: &[&[u8]]) -> Self {
        Self {
            status: ResponseStatus::Success,
            args: args.iter().map(|a| a.to_vec()).collect(),
            body: None,
        }
    }

    pub fn success_with_body(args: &[&[u8]], body: Vec<u8>) -> Self {
        Self {
            body: Some(body),
            ..Self::success(args)
        }
    }

    pub fn error(error: ErrorTuple) -> Self {
        let mut args = Vec::with_capacity(error.args.len() + 1);
        args.push(error.verb);
        args.extend(error.args);
        Self {
            status: ResponseStatus::Error,
            args,
            body: None,
        }
    }

    pub fn unknown_method(verb: &[u8]) -> Self {
        Self::error(ErrorTuple::new(UNKNOWN_METHOD, vec![verb.to_vec()]))
    }

    /// The error tuple of an error response.
    pub fn error_tuple(&self) -> Option<ErrorTuple> {
        if self.status != ResponseStatus::Error {
            return None;
        }
        let (verb, args) = self.args.split_first()?;
        Some(ErrorTuple::new(verb, args.to_vec()))
    }
}

/// Fields of a decoded frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub flags: u8,
    pub uncompressed_len: usize,
    pub payload_len: usize,
}

/// Serialize `message` into a complete frame, compressing large payloads.
pub fn encode_frame<T: Serialize>(message: &T) -> Result<Vec<u8>> {
    let payload = bincode::serialize(message)?;
    let uncompressed_len = payload.len();
    let (flags, data) = if uncompressed_len > COMPRESSION_THRESHOLD {
        (FLAG_COMPRESSED, zstd::encode_all(&payload[..], ZSTD_LEVEL)?)
    } else {
        (0, payload)
    };
    if data.len() > MAX_FRAME_SIZE {
        return Err(BzrError::SmartProtocolError(format!(
            "frame of {} bytes exceeds the {} byte limit",
            data.len(),
            MAX_FRAME_SIZE
        )));
    }
    let mut buf = Vec::with_capacity(HEADER_LEN + data.len());
    buf.extend_from_slice(FRAME_MAGIC);
    buf.push(flags);
    buf.extend_from_slice(&(uncompressed_len as u32).to_le_bytes());
    buf.extend_from_slice(&(data.len() as u32).to_le_bytes());
    buf.extend_from_slice(&data);
    Ok(buf)
}

pub fn decode_header(header: &[u8]) -> Result<FrameHeader> {
    if header.len() < HEADER_LEN {
        return Err(BzrError::SmartProtocolError("frame too short for header".into()));
    }
    if &header[0..4] != FRAME_MAGIC {
        return Err(BzrError::SmartProtocolError("invalid frame magic".into()));
    }
    let mut len = [0u8; 4];
    len.copy_from_slice(&header[5..9]);
    let uncompressed_len = u32::from_le_bytes(len) as usize;
    len.copy_from_slice(&header[9..13]);
    let payload_len = u32::from_le_bytes(len) as usize;
    if payload_len > MAX_FRAME_SIZE || uncompressed_len > MAX_FRAME_SIZE {
        return Err(BzrError::SmartProtocolError(format!(
            "frame of {} bytes exceeds the {} byte limit",
            payload_len.max(uncompressed_len),
            MAX_FRAME_SIZE
        )));
    }
    Ok(FrameHeader {
        flags: header[4],
        uncompressed_len,
        payload_len,
    })
}

/// Decode the payload that followed `header`.
pub fn decode_payload<T: DeserializeOwned>(header: &FrameHeader, payload: &[u8]) -> Result<T> {
    if payload.len() != header.payload_len {
        return Err(BzrError::SmartProtocolError(format!(
            "frame truncated: {} of {} payload bytes",
            payload.len(),
            header.payload_len
        )));
    }
    if header.flags & FLAG_COMPRESSED != 0 {
        let raw = zstd::decode_all(payload)?;
        if raw.len() != header.uncompressed_len {
            return Err(BzrError::SmartProtocolError("decompressed length mismatch".into()));
        }
        Ok(bincode::deserialize(&raw)?)
    } else {
        Ok(bincode::deserialize(payload)?)
    }
}

/// Decode a complete frame held in memory.
pub fn decode_frame<T: DeserializeOwned>(data: &[u8]) -> Result<T> {
    let header = decode_header(data)?;
    let end = HEADER_LEN + header.payload_len;
    if data.len() < end {
        return Err(BzrError::SmartProtocolError("frame truncated".into()));
    }
    decode_payload(&header, &data[HEADER_LEN..end])
}

pub fn write_frame<W: Write, T: Serialize>(writer: &mut W, message: &T) -> Result<()> {
    writer.write_all(&encode_frame(message)?)?;
    writer.flush()?;
    Ok(())
}

/// Read one frame. Returns `None` when the peer closed the connection
/// cleanly between frames.
pub fn read_frame<R: Read, T: DeserializeOwned>(reader: &mut R) -> Result<Option<T>> {
    let mut header = [0u8; HEADER_LEN];
    match reader.read_exact(&mut header[..1]) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    reader.read_exact(&mut header[1..])?;
    let header = decode_header(&header)?;
    let mut payload = vec![0u8; header.payload_len];
    reader.read_exact(&mut payload)?;
    decode_payload(&header, &payload).map(Some)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_frame() {
        let request = SmartRequest::new(b"BzrDir.open_2.1", &[b"repo/"], None);
        let frame = encode_frame(&request).unwrap();
        assert_eq!(&frame[0..4], FRAME_MAGIC);
        assert_eq!(frame[4], 0);
        let decoded: SmartRequest = decode_frame(&frame).unwrap();
        assert_eq!(decoded, request);
    }

    #[test]
    fn test_large_frames_are_compressed() {
        let body = vec![b'x'; COMPRESSION_THRESHOLD * 2];
        let response = SmartResponse::success_with_body(&[b"ok"], body);
        let frame = encode_frame(&response).unwrap();
        assert_eq!(frame[4] & FLAG_COMPRESSED, FLAG_COMPRESSED);
        assert!(frame.len() < COMPRESSION_THRESHOLD);

        let mut reader = &frame[..];
        let decoded: SmartResponse = read_frame(&mut reader).unwrap().unwrap();
        assert_eq!(decoded, response);
        let next: Option<SmartResponse> = read_frame(&mut reader).unwrap();
        assert!(next.is_none());
    }

    #[test]
    fn test_bad_magic_and_truncation() {
        let mut frame = encode_frame(&SmartResponse::success(&[b"ok"])).unwrap();
        assert!(decode_frame::<SmartResponse>(&frame[..frame.len() - 1]).is_err());
        frame[0] = b'X';
        assert!(matches!(
            decode_frame::<SmartResponse>(&frame),
            Err(BzrError::SmartProtocolError(_))
        ));
    }

    #[test]
    fn test_error_response_tuple() {
        let response = SmartResponse::unknown_method(b"Repository.insert_stream_1.19");
        assert_eq!(response.status, ResponseStatus::Error);
        let tuple = response.error_tuple().unwrap();
        assert_eq!(tuple.verb, UNKNOWN_METHOD);
        assert_eq!(tuple.args, vec![b"Repository.insert_stream_1.19".to_vec()]);
        assert!(SmartResponse::success(&[b"ok"]).error_tuple().is_none());
    }
}
