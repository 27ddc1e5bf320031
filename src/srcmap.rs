//! Solidity compressed source map decompression.
//!
//! A compressed source map is a `;`-separated list of rows, each row
//! `:`-separated as `offset:length:file:jump[:modifierDepth]`. An empty
//! field inherits the corresponding field from the previous row. Only
//! `offset`/`length` matter to the branch classifier; the remaining fields
//! are parsed and discarded.

use crate::error::{FuzzError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SourceRange {
    pub offset: usize,
    pub length: usize,
}

/// Decompress a full source map string into one [SourceRange] per row.
pub fn decompress(map: &str) -> Result<Vec<SourceRange>> {
    let mut rows: Vec<SourceRange> = Vec::new();
    for (i, part) in map.split(';').enumerate() {
        let fields: Vec<&str> = part.split(':').collect();
        let has_offset = fields.first().map_or(false, |f| !f.is_empty());
        let has_length = fields.get(1).map_or(false, |f| !f.is_empty());

        let offset = if has_offset {
            fields[0].parse::<usize>().unwrap_or(0)
        } else if i == 0 {
            return Err(FuzzError::SourceMap(i));
        } else {
            rows[i - 1].offset
        };

        let length = if has_length {
            fields[1].parse::<usize>().unwrap_or(0)
        } else if i == 0 {
            return Err(FuzzError::SourceMap(i));
        } else {
            rows[i - 1].length
        };

        rows.push(SourceRange { offset, length });
    }
    Ok(rows)
}

/// Extract the source snippet covered by `range`, clamped to the bounds of
/// `source` so a slightly-stale source map never panics.
pub fn snippet<'a>(source: &'a str, range: SourceRange) -> &'a str {
    let start = range.offset.min(source.len());
    let end = (range.offset + range.length).min(source.len());
    if start >= end {
        ""
    } else {
        &source[start..end]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decompress_basic() {
        let rows = decompress("10:5:1;:3;20::2").unwrap();
        assert_eq!(
            rows,
            vec![
                SourceRange { offset: 10, length: 5 },
                SourceRange { offset: 10, length: 3 },
                SourceRange { offset: 20, length: 3 },
            ]
        );
    }

    #[test]
    fn test_decompress_missing_first_row_fails() {
        assert!(decompress(":5:1").is_err());
    }

    #[test]
    fn test_snippet_extraction() {
        let source = "pragma solidity; function f() { if (x > 0) {} }";
        let range = SourceRange { offset: 33, length: 10 };
        assert_eq!(snippet(source, range), "if (x > 0");
    }

    #[test]
    fn test_snippet_clamped() {
        let source = "short";
        let range = SourceRange { offset: 2, length: 100 };
        assert_eq!(snippet(source, range), "ort");
    }
}
