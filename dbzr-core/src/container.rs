//! Record container format used for pack files and stream bodies.
//!
//! ```text
//! DBZR-CONTAINER 1\n
//! 'B' u32 name_len name u64 body_len body     (repeated)
//! 'E'
//! ```
//!
//! A record's name is a key with its elements joined by NUL. Pack indices
//! address whole `B` records by `(offset, length)`, so a record can be read
//! back and validated without the rest of the file.

use crate::errors::{BzrError, Result};
use crate::key::Key;
use std::io::Read;

pub const CONTAINER_MAGIC: &[u8] = b"DBZR-CONTAINER 1\n";
const BYTES_RECORD: u8 = b'B';
const END_MARKER: u8 = b'E';

/// Encode one `B` record.
pub fn encode_record(name: &Key, body: &[u8]) -> Vec<u8> {
    let name = name.to_bytes();
    let mut out = Vec::with_capacity(1 + 4 + name.len() + 8 + body.len());
    out.push(BYTES_RECORD);
    out.extend_from_slice(&(name.len() as u32).to_le_bytes());
    out.extend_from_slice(&name);
    out.extend_from_slice(&(body.len() as u64).to_le_bytes());
    out.extend_from_slice(body);
    out
}

pub fn end_marker() -> &'static [u8] {
    &[END_MARKER]
}

fn read_record(input: &mut &[u8]) -> Result<(Key, Vec<u8>)> {
    let mut len4 = [0u8; 4];
    input
        .read_exact(&mut len4)
        .map_err(|_| BzrError::InvalidRecord("truncated name length".into()))?;
    let name_len = u32::from_le_bytes(len4) as usize;
    if name_len > input.len() {
        return Err(BzrError::InvalidRecord("name past end of data".into()));
    }
    let (name, rest) = input.split_at(name_len);
    *input = rest;
    let mut len8 = [0u8; 8];
    input
        .read_exact(&mut len8)
        .map_err(|_| BzrError::InvalidRecord("truncated body length".into()))?;
    let body_len = u64::from_le_bytes(len8) as usize;
    if body_len > input.len() {
        return Err(BzrError::InvalidRecord(format!(
            "body of {} bytes but only {} available",
            body_len,
            input.len()
        )));
    }
    let (body, rest) = input.split_at(body_len);
    *input = rest;
    Ok((Key::from_bytes(name), body.to_vec()))
}

/// Decode a single `B` record read from a pack by offset and length.
///
/// Only the framing is checked: the record type byte, and that the declared
/// lengths exactly cover the bytes.
pub fn decode_record(bytes: &[u8]) -> Result<(Key, Vec<u8>)> {
    let (&kind, mut rest) = bytes
        .split_first()
        .ok_or_else(|| BzrError::InvalidRecord("empty record".into()))?;
    if kind != BYTES_RECORD {
        return Err(BzrError::InvalidRecord(format!("unexpected record type {:?}", kind as char)));
    }
    let record = read_record(&mut rest)?;
    if !rest.is_empty() {
        return Err(BzrError::InvalidRecord(format!("{} trailing bytes", rest.len())));
    }
    Ok(record)
}

/// Accumulates a whole container in memory.
#[derive(Debug)]
pub struct ContainerWriter {
    buffer: Vec<u8>,
    records: usize,
}

impl Default for ContainerWriter {
    fn default() -> Self {
        Self::new()
    }
}

impl ContainerWriter {
    pub fn new() -> Self {
        Self {
            buffer: CONTAINER_MAGIC.to_vec(),
            records: 0,
        }
    }

    pub fn add_record(&mut self, name: &Key, body: &[u8]) {
        self.buffer.extend_from_slice(&encode_record(name, body));
        self.records += 1;
    }

    pub fn records(&self) -> usize {
        self.records
    }

    pub fn finish(mut self) -> Vec<u8> {
        self.buffer.push(END_MARKER);
        self.buffer
    }
}

/// Parse a complete container into its records.
pub fn read_container(data: &[u8]) -> Result<Vec<(Key, Vec<u8>)>> {
    let mut input = data
        .strip_prefix(CONTAINER_MAGIC)
        .ok_or_else(|| BzrError::InvalidRecord("bad container header".into()))?;
    let mut records = Vec::new();
    loop {
        let (&kind, rest) = input
            .split_first()
            .ok_or_else(|| BzrError::InvalidRecord("container ended without end marker".into()))?;
        input = rest;
        match kind {
            BYTES_RECORD => records.push(read_record(&mut input)?),
            END_MARKER => break,
            other => {
                return Err(BzrError::InvalidRecord(format!("unknown record type {:?}", other as char)));
            }
        }
    }
    if !input.is_empty() {
        return Err(BzrError::InvalidRecord("data after end marker".into()));
    }
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_container_records() {
        let mut writer = ContainerWriter::new();
        writer.add_record(&Key::revision(b"rev-1"), b"first");
        writer.add_record(&Key::text(b"file", b"rev-1"), b"");
        assert_eq!(writer.records(), 2);
        let data = writer.finish();

        let records = read_container(&data).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0], (Key::revision(b"rev-1"), b"first".to_vec()));
        assert_eq!(records[1].0, Key::text(b"file", b"rev-1"));
    }

    #[test]
    fn test_single_record_addressing() {
        let record = encode_record(&Key::revision(b"r"), b"body");
        let mut data = CONTAINER_MAGIC.to_vec();
        let offset = data.len();
        data.extend_from_slice(&record);
        data.push(b'E');
        let (key, body) = decode_record(&data[offset..offset + record.len()]).unwrap();
        assert_eq!(key, Key::revision(b"r"));
        assert_eq!(body, b"body");
        assert!(decode_record(&data[offset..offset + record.len() - 1]).is_err());
        assert!(decode_record(&data[offset + 1..offset + record.len()]).is_err());
    }

    #[test]
    fn test_missing_end_marker() {
        let mut writer = ContainerWriter::new();
        writer.add_record(&Key::revision(b"r"), b"x");
        let mut data = writer.finish();
        data.pop();
        assert!(matches!(read_container(&data), Err(BzrError::InvalidRecord(_))));
    }
}
