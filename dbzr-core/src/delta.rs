//! Line-based delta codec for text and inventory records.
//!
//! A delta is a list of instructions that rebuild the target from its basis:
//! copy a run of basis lines, or insert literal lines. Matching is greedy
//! (longest run starting at any basis occurrence of the current line), which
//! is good enough for storage. It is not a minimal diff.

use crate::errors::{BzrError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeltaOp {
    /// Copy `count` lines of the basis starting at line `start`.
    Copy { start: u32, count: u32 },
    Insert(Vec<Vec<u8>>),
}

/// Split into lines, each keeping its trailing newline.
pub fn split_lines(text: &[u8]) -> Vec<&[u8]> {
    text.split_inclusive(|b| *b == b'\n').collect()
}

pub fn compute_ops(basis: &[u8], target: &[u8]) -> Vec<DeltaOp> {
    let basis_lines = split_lines(basis);
    let target_lines = split_lines(target);
    let mut positions: HashMap<&[u8], Vec<usize>> = HashMap::new();
    for (i, line) in basis_lines.iter().enumerate() {
        positions.entry(*line).or_default().push(i);
    }

    let mut ops = Vec::new();
    let mut pending: Vec<Vec<u8>> = Vec::new();
    let mut t = 0;
    while t < target_lines.len() {
        let mut best: Option<(usize, usize)> = None;
        if let Some(candidates) = positions.get(target_lines[t]) {
            for &start in candidates {
                let mut len = 0;
                while start + len < basis_lines.len()
                    && t + len < target_lines.len()
                    && basis_lines[start + len] == target_lines[t + len]
                {
                    len += 1;
                }
                if best.is_none_or(|(_, best_len)| len > best_len) {
                    best = Some((start, len));
                }
            }
        }
        match best {
            Some((start, count)) => {
                if !pending.is_empty() {
                    ops.push(DeltaOp::Insert(std::mem::take(&mut pending)));
                }
                ops.push(DeltaOp::Copy {
                    start: start as u32,
                    count: count as u32,
                });
                t += count;
            }
            None => {
                pending.push(target_lines[t].to_vec());
                t += 1;
            }
        }
    }
    if !pending.is_empty() {
        ops.push(DeltaOp::Insert(pending));
    }
    ops
}

/// Encode a delta from `basis` to `target`.
pub fn make_delta(basis: &[u8], target: &[u8]) -> Result<Vec<u8>> {
    Ok(bincode::serialize(&compute_ops(basis, target))?)
}

/// Rebuild the target text from `basis` and an encoded delta.
pub fn apply_delta(basis: &[u8], delta: &[u8]) -> Result<Vec<u8>> {
    let ops: Vec<DeltaOp> = bincode::deserialize(delta)?;
    let basis_lines = split_lines(basis);
    let mut out = Vec::with_capacity(basis.len());
    for op in ops {
        match op {
            DeltaOp::Copy { start, count } => {
                let (start, count) = (start as usize, count as usize);
                let lines = basis_lines.get(start..start + count).ok_or_else(|| {
                    BzrError::InvalidRecord(format!(
                        "delta copies lines {}..{} of a {} line basis",
                        start,
                        start + count,
                        basis_lines.len()
                    ))
                })?;
                for line in lines {
                    out.extend_from_slice(line);
                }
            }
            DeltaOp::Insert(lines) => {
                for line in lines {
                    out.extend_from_slice(&line);
                }
            }
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delta_reconstructs_target() {
        let basis = b"one\ntwo\nthree\nfour\n";
        let target = b"zero\none\ntwo\nTHREE\nfour\nfive";
        let delta = make_delta(basis, target).unwrap();
        assert_eq!(apply_delta(basis, &delta).unwrap(), target);
    }

    #[test]
    fn test_delta_reuses_basis_lines() {
        let basis = b"a\nb\nc\nd\n";
        let ops = compute_ops(basis, b"a\nb\nc\nd\ne\n");
        assert_eq!(
            ops,
            vec![
                DeltaOp::Copy { start: 0, count: 4 },
                DeltaOp::Insert(vec![b"e\n".to_vec()])
            ]
        );
    }

    #[test]
    fn test_delta_against_wrong_basis_fails() {
        let delta = make_delta(b"a\nb\nc\n", b"a\nb\nc\n").unwrap();
        assert!(apply_delta(b"a\n", &delta).is_err());
    }

    #[test]
    fn test_empty_texts() {
        let delta = make_delta(b"", b"").unwrap();
        assert_eq!(apply_delta(b"", &delta).unwrap(), b"");
        let delta = make_delta(b"x\n", b"").unwrap();
        assert_eq!(apply_delta(b"x\n", &delta).unwrap(), b"");
    }
}
