//! Record streams on the wire.
//!
//! A stream body is a record container. The first record, named `format`,
//! holds the network name of the source format; each following record is
//! one substream, named by its kind, with the bincode encoded records as
//! its body.

use dbzr_core::container::{ContainerWriter, read_container};
use dbzr_core::{BzrError, ContentRecord, Key, MissingKeys, RepositoryFormat, Result, Stream, Substream, SubstreamKind};

const FORMAT_RECORD: &[u8] = b"format";

pub fn stream_to_bytes(stream: &[Substream], format: &RepositoryFormat) -> Result<Vec<u8>> {
    let mut writer = ContainerWriter::new();
    writer.add_record(&Key::new([FORMAT_RECORD]), format.network_name.as_bytes());
    for substream in stream {
        let body = bincode::serialize(&substream.records)?;
        writer.add_record(&Key::new([substream.kind.name().as_bytes()]), &body);
    }
    Ok(writer.finish())
}

/// Decode a stream body into the source format and its substreams.
pub fn bytes_to_stream(bytes: &[u8]) -> Result<(RepositoryFormat, Stream)> {
    let mut records = read_container(bytes)?.into_iter();
    let format = match records.next() {
        Some((name, body)) if name.first() == FORMAT_RECORD => {
            RepositoryFormat::from_network_name(&String::from_utf8_lossy(&body))?
        }
        _ => return Err(BzrError::InvalidRecord("stream does not start with its format".into())),
    };
    let stream = records
        .map(|(name, body)| {
            let kind = SubstreamKind::from_name(&String::from_utf8_lossy(name.first()))?;
            let records: Vec<ContentRecord> = bincode::deserialize(&body)?;
            Ok(Substream::new(kind, records))
        })
        .collect::<Result<Stream>>()?;
    Ok((format, stream))
}

/// Split a stream before its first inventory-deltas substream. Servers
/// older than 1.19 cannot take deltas; the tail goes through a delegate.
pub fn split_before_inventory_deltas(mut stream: Stream) -> (Stream, Stream) {
    match stream.iter().position(|s| s.kind == SubstreamKind::InventoryDeltas) {
        Some(at) => {
            let tail = stream.split_off(at);
            (stream, tail)
        }
        None => (stream, Vec::new()),
    }
}

/// Body of a `missing-basis` reply: the suspended write group tokens and the
/// keys the sink still needs.
pub fn encode_missing_keys(tokens: &[String], missing: &MissingKeys) -> Result<Vec<u8>> {
    Ok(bincode::serialize(&(tokens, missing))?)
}

pub fn decode_missing_keys(bytes: &[u8]) -> Result<(Vec<String>, MissingKeys)> {
    Ok(bincode::deserialize(bytes)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn substream(kind: SubstreamKind, ids: &[&str]) -> Substream {
        Substream::new(
            kind,
            ids.iter()
                .map(|id| ContentRecord::fulltext(Key::revision(id.as_bytes()), Some(Vec::new()), id.as_bytes().to_vec()))
                .collect(),
        )
    }

    #[test]
    fn test_stream_body() {
        let format = RepositoryFormat::new("json-v1").unwrap();
        let stream = vec![
            substream(SubstreamKind::Texts, &["t1", "t2"]),
            substream(SubstreamKind::Revisions, &["r1"]),
        ];
        let bytes = stream_to_bytes(&stream, &format).unwrap();
        let (decoded_format, decoded) = bytes_to_stream(&bytes).unwrap();
        assert_eq!(decoded_format, format);
        assert_eq!(decoded, stream);

        let (_, empty) = bytes_to_stream(&stream_to_bytes(&[], &format).unwrap()).unwrap();
        assert!(empty.is_empty());
    }

    #[test]
    fn test_split_at_substream_boundary() {
        let stream = vec![
            substream(SubstreamKind::Texts, &["t1"]),
            substream(SubstreamKind::InventoryDeltas, &["r1"]),
            substream(SubstreamKind::Revisions, &["r1"]),
        ];
        let (head, tail) = split_before_inventory_deltas(stream.clone());
        assert_eq!(head, stream[..1].to_vec());
        assert_eq!(tail, stream[1..].to_vec());

        let (head, tail) = split_before_inventory_deltas(stream[2..].to_vec());
        assert_eq!(head.len(), 1);
        assert!(tail.is_empty());
    }

    #[test]
    fn test_missing_keys_body() {
        let mut missing = MissingKeys::new();
        missing.insert((SubstreamKind::Inventories, Key::revision(b"r0")));
        let tokens = vec!["upload-1".to_string()];
        let (t, m) = decode_missing_keys(&encode_missing_keys(&tokens, &missing).unwrap()).unwrap();
        assert_eq!(t, tokens);
        assert_eq!(m, missing);
    }
}
