//! Streams to and from a remote repository.
//!
//! Sources try `get_stream_1.19`, then `get_stream`, then the real
//! repository. Sinks test the insert verbs with an empty stream before
//! sending anything; servers older than 1.19 get the stream up to its first
//! inventory-deltas substream and the rest goes through the real repository.

use super::repository::RemoteRepository;
use crate::byte_stream::{
    bytes_to_stream, decode_missing_keys, encode_missing_keys, split_before_inventory_deltas, stream_to_bytes,
};
use crate::client::first_arg;
use crate::medium::ProtocolVersion;
use dbzr_core::fetch::normalize_stream;
use dbzr_core::key::is_null;
use dbzr_core::{
    BzrError, ContentRecord, MissingKeys, Repository, RepositoryFormat, Result, RevisionId, SearchResult, Stream,
    Substream, SubstreamKind,
};
use std::collections::BTreeSet;
use std::iter;
use tracing::debug;

const GET_STREAM_VERBS: [(&[u8], ProtocolVersion); 2] = [
    (b"Repository.get_stream_1.19", (1, 19)),
    (b"Repository.get_stream", (1, 13)),
];

/// Revisions a stream delivered, and the parents it referenced without
/// delivering.
fn revisions_seen(stream: &[Substream]) -> (BTreeSet<RevisionId>, BTreeSet<RevisionId>) {
    let mut seen = BTreeSet::new();
    let mut referenced = BTreeSet::new();
    for substream in stream.iter().filter(|s| s.kind == SubstreamKind::Revisions) {
        for record in substream.records.iter().filter(|r| !r.is_absent()) {
            seen.insert(record.key.first().to_vec());
            referenced.extend(record.parents.iter().flatten().map(|p| p.first().to_vec()));
        }
    }
    referenced.retain(|r| !seen.contains(r) && !is_null(r));
    (seen, referenced)
}

impl RemoteRepository {
    fn smart_stream(&mut self, search: &SearchResult, to_format: &RepositoryFormat) -> Result<Option<Stream>> {
        let recipe = search.recipe().to_bytes();
        for (verb, version) in GET_STREAM_VERBS {
            if self.is_before(version) {
                continue;
            }
            match self.client.call_with_body_bytes_expecting_body(
                verb,
                &[self.path.as_bytes(), to_format.network_name.as_bytes()],
                &recipe,
            ) {
                Ok((reply, body)) => {
                    self.check_ok(&reply)?;
                    let (_, stream) = bytes_to_stream(&body).map_err(|e| self.client.bad_response(e))?;
                    return Ok(Some(stream));
                }
                Err(BzrError::UnknownSmartMethod(_)) => self.remember_before(version),
                Err(e) => return Err(self.translate(e)),
            }
        }
        Ok(None)
    }

    pub(super) fn remote_get_stream(&mut self, search: &SearchResult, to_format: &RepositoryFormat) -> Result<Stream> {
        let Some(mut stream) = self.smart_stream(search, to_format)? else {
            return self.ensure_real()?.get_stream(search, to_format);
        };
        if !self.fallbacks.is_empty() {
            let (seen, referenced) = revisions_seen(&stream);
            let mut refined = search.refine(&seen, &referenced);
            for fallback in self.fallbacks.iter_mut() {
                if refined.is_empty() {
                    break;
                }
                let substreams = fallback.get_stream(&refined, to_format)?;
                let (seen, referenced) = revisions_seen(&substreams);
                refined = refined.refine(&seen, &referenced);
                stream.extend(substreams);
            }
        }
        Ok(normalize_stream(stream))
    }

    pub(super) fn remote_missing_keys_stream(
        &mut self,
        missing: &MissingKeys,
        to_format: &RepositoryFormat,
    ) -> Result<Stream> {
        if !self.is_before((3, 0)) {
            let body = encode_missing_keys(&[], missing)?;
            match self.client.call_with_body_bytes_expecting_body(
                b"Repository.get_stream_for_missing_keys",
                &[self.path.as_bytes(), to_format.network_name.as_bytes()],
                &body,
            ) {
                Ok((reply, body)) => {
                    self.check_ok(&reply)?;
                    let (_, stream) = bytes_to_stream(&body).map_err(|e| self.client.bad_response(e))?;
                    return self.fill_from_fallbacks(stream, to_format);
                }
                Err(BzrError::UnknownSmartMethod(_)) => self.remember_before((3, 0)),
                Err(e) => return Err(self.translate(e)),
            }
        }
        self.ensure_real()?.get_stream_for_missing_keys(missing, to_format)
    }

    /// Ask the fallbacks for the records the server reported absent.
    fn fill_from_fallbacks(&mut self, mut stream: Stream, to_format: &RepositoryFormat) -> Result<Stream> {
        let mut remaining = MissingKeys::new();
        for substream in stream.iter_mut() {
            let kind = substream.kind;
            substream.records.retain(|record| {
                if record.is_absent() {
                    remaining.insert((kind, record.key.clone()));
                }
                !record.is_absent()
            });
        }
        for fallback in self.fallbacks.iter_mut() {
            if remaining.is_empty() {
                break;
            }
            for substream in fallback.get_stream_for_missing_keys(&remaining, to_format)? {
                for record in substream.records.into_iter().filter(|r| !r.is_absent()) {
                    remaining.remove(&(substream.kind, record.key.clone()));
                    stream.push(Substream::new(substream.kind, vec![record]));
                }
            }
        }
        for (kind, key) in remaining {
            stream.push(Substream::new(kind, vec![ContentRecord::absent(key)]));
        }
        Ok(normalize_stream(stream))
    }

    /// Send `stream` with `verb`. Returns the suspended tokens and missing
    /// keys of a `missing-basis` reply, or `([], {})`.
    fn send_stream(
        &self,
        verb: &[u8],
        stream: &[Substream],
        src_format: &RepositoryFormat,
        resume_tokens: &[String],
        with_token: bool,
    ) -> Result<(Vec<String>, MissingKeys)> {
        let body = stream_to_bytes(stream, src_format)?;
        let resume = resume_tokens.join(" ");
        let token = self.lock_token.clone().unwrap_or_default();
        let mut args: Vec<&[u8]> = vec![self.path.as_bytes(), resume.as_bytes()];
        if with_token {
            args.push(token.as_bytes());
        }
        let reply = self
            .client
            .call_with_body_stream(verb, &args, iter::once(body))
            .map_err(|e| self.translate(e))?;
        match (first_arg(&reply), reply.get(1)) {
            (b"ok", _) => Ok((Vec::new(), MissingKeys::new())),
            (b"missing-basis", Some(blob)) => decode_missing_keys(blob).map_err(|e| self.client.bad_response(e)),
            _ => Err(self.client.bad_response(BzrError::unexpected_response(&reply))),
        }
    }

    /// The insert verb to use, probing with empty streams where needed.
    fn find_insert_verb(
        &mut self,
        src_format: &RepositoryFormat,
        resume_tokens: &[String],
    ) -> Result<Option<(&'static [u8], ProtocolVersion, bool)>> {
        let locked = self.lock_token.is_some();
        let mut candidates: Vec<(&'static [u8], ProtocolVersion, bool)> =
            vec![(b"Repository.insert_stream_1.19".as_slice(), (1, 19), locked)];
        if locked {
            candidates.push((b"Repository.insert_stream_locked".as_slice(), (1, 14), true));
        } else {
            candidates.push((b"Repository.insert_stream".as_slice(), (1, 13), false));
        }
        for (verb, version, with_token) in candidates {
            if self.is_before(version) {
                continue;
            }
            if !resume_tokens.is_empty() {
                // Tested by the insert that produced the tokens.
                return Ok(Some((verb, version, with_token)));
            }
            match self.send_stream(verb, &[], src_format, &[], with_token) {
                Ok(_) => return Ok(Some((verb, version, with_token))),
                Err(BzrError::UnknownSmartMethod(_)) => self.remember_before(version),
                Err(e) => return Err(e),
            }
        }
        Ok(None)
    }

    fn insert_real(
        &mut self,
        stream: Stream,
        src_format: &RepositoryFormat,
        resume_tokens: &[String],
    ) -> Result<(Vec<String>, MissingKeys)> {
        let real = self.ensure_real()?;
        real.refresh_data()?;
        real.insert_stream(stream, src_format, resume_tokens)
    }

    pub(super) fn remote_insert_stream(
        &mut self,
        stream: Stream,
        src_format: &RepositoryFormat,
        resume_tokens: &[String],
    ) -> Result<(Vec<String>, MissingKeys)> {
        if self.is_in_write_group() {
            return Err(BzrError::BzrCheckError(format!(
                "cannot insert a stream into {} inside a write group",
                self.base()
            )));
        }
        self.missing_cache.clear();
        let Some((verb, version, with_token)) = self.find_insert_verb(src_format, resume_tokens)? else {
            debug!("no insert verb on {}, inserting through the real repository", self.base());
            return self.insert_real(stream, src_format, resume_tokens);
        };
        let (head, tail) = if version < (1, 19) {
            split_before_inventory_deltas(stream)
        } else {
            (stream, Vec::new())
        };
        let (tokens, missing) = self.send_stream(verb, &head, src_format, resume_tokens, with_token)?;
        if !tail.is_empty() {
            debug!(
                "{} cannot take inventory deltas, sending the rest of the stream through the real repository",
                self.base()
            );
            // Missing keys of the first part are found again at the end.
            return self.insert_real(tail, src_format, &tokens);
        }
        if missing.is_empty() {
            if let Some(real) = self.real.get_mut() {
                real.refresh_data()?;
            }
        }
        Ok((tokens, missing))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dbzr_core::Key;

    fn revision(id: &str, parents: &[&str]) -> ContentRecord {
        ContentRecord::fulltext(
            Key::revision(id.as_bytes()),
            Some(parents.iter().map(|p| Key::revision(p.as_bytes())).collect()),
            Vec::new(),
        )
    }

    #[test]
    fn test_revisions_seen() {
        let stream = vec![
            Substream::new(SubstreamKind::Texts, vec![revision("t", &["x"])]),
            Substream::new(
                SubstreamKind::Revisions,
                vec![
                    revision("r2", &["r1"]),
                    revision("r3", &["r2", "other"]),
                    revision("r1", &["null:"]),
                    ContentRecord::absent(Key::revision(b"gone")),
                ],
            ),
        ];
        let (seen, referenced) = revisions_seen(&stream);
        let ids = |v: &[&str]| v.iter().map(|s| s.as_bytes().to_vec()).collect::<BTreeSet<_>>();
        assert_eq!(seen, ids(&["r1", "r2", "r3"]));
        assert_eq!(referenced, ids(&["other"]));
    }
}
