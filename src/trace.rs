//! Selection traces: recorded top-k outputs replayed through the cache
//!
//! One line per node evaluation:
//!
//! ```text
//! # layer: token ids | token ids | ...
//! 3: 2 7 | 1 4 | 2 2
//! 4: 5 0
//! ```
//!
//! The layer is the absolute model layer the top-k node belongs to. Lines
//! with several `|`-separated groups are prompt steps, single-group lines
//! are decode steps.

use crate::{Error, Result};
use std::path::Path;

/// One recorded node evaluation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceStep {
    /// Absolute layer index
    pub layer: usize,
    /// Selected ids, one row per token
    pub tokens: Vec<Vec<i32>>,
}

impl TraceStep {
    /// Experts selected per token
    pub fn n_ids(&self) -> usize {
        self.tokens.first().map_or(0, |t| t.len())
    }

    /// Ids flattened row-major
    pub fn ids(&self) -> Vec<i32> {
        self.tokens.iter().flatten().copied().collect()
    }
}

/// Parse trace text
pub fn parse_trace(text: &str) -> Result<Vec<TraceStep>> {
    let mut steps = Vec::new();
    for (lineno, raw) in text.lines().enumerate() {
        let line = raw.split('#').next().unwrap_or("").trim();
        if line.is_empty() {
            continue;
        }
        let bad = |what: &str| Error::Config(format!("trace line {}: {}", lineno + 1, what));

        let (layer, rest) = line.split_once(':').ok_or_else(|| bad("missing ':'"))?;
        let layer = layer
            .trim()
            .parse::<usize>()
            .map_err(|_| bad("layer is not a number"))?;

        let mut tokens = Vec::new();
        for group in rest.split('|') {
            let ids = group
                .split_whitespace()
                .map(|s| s.parse::<i32>().map_err(|_| bad(&format!("bad id {:?}", s))))
                .collect::<Result<Vec<_>>>()?;
            if ids.is_empty() {
                return Err(bad("empty token group"));
            }
            tokens.push(ids);
        }
        if tokens.iter().any(|t| t.len() != tokens[0].len()) {
            return Err(bad("tokens select different numbers of experts"));
        }
        steps.push(TraceStep { layer, tokens });
    }
    Ok(steps)
}

/// Read and parse a trace file
pub fn read_trace(path: impl AsRef<Path>) -> Result<Vec<TraceStep>> {
    parse_trace(&std::fs::read_to_string(path)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_prompt_and_decode_lines() {
        let steps = parse_trace("# prompt\n3: 2 7 | 1 4 | 2 2\n\n4: 5 0  # decode\n").unwrap();
        assert_eq!(steps.len(), 2);
        assert_eq!(steps[0].layer, 3);
        assert_eq!(steps[0].tokens.len(), 3);
        assert_eq!(steps[0].n_ids(), 2);
        assert_eq!(steps[0].ids(), vec![2, 7, 1, 4, 2, 2]);
        assert_eq!(steps[1].tokens, vec![vec![5, 0]]);
    }

    #[test]
    fn test_malformed_lines() {
        assert!(parse_trace("3 2 7").is_err());
        assert!(parse_trace("x: 1").is_err());
        assert!(parse_trace("1: 2 q").is_err());
        assert!(parse_trace("1: 2 3 | 4").is_err());
        assert!(parse_trace("1: 2 | ").is_err());
    }
}
