//! Branch classification: given a decoded bytecode, its decompressed
//! source map, and the concatenated source text, identify program
//! counters that correspond to source-level control-flow branches and to
//! a handful of vulnerability-relevant opcodes.

use std::collections::{HashMap, HashSet};

use crate::bytecode::{self, Instruction};
use crate::r#const::BRANCH_KEYWORDS;
use crate::srcmap::{self, SourceRange};

const TIMESTAMP: u8 = 0x42;
const NUMBER: u8 = 0x43;
const CALLDATALOAD: u8 = 0x35;
const CALLDATACOPY: u8 = 0x37;
const DELEGATECALL: u8 = 0xf4;
const CALL: u8 = 0xf1;
const CALLCODE: u8 = 0xf2;

const UNCHECKED_PATTERNS: [&str; 5] = [".send(", ".call(", ".delegatecall(", ".callcode(", ".transfer("];

/// The ten pc sets produced by classification, plus a diagnostic snippet
/// map. Populated once per program half (creation or runtime).
#[derive(Debug, Default, Clone)]
pub struct BranchSets {
    pub jumpi: HashSet<usize>,
    pub timestamp: HashSet<usize>,
    pub number: HashSet<usize>,
    pub delegatecall: HashSet<usize>,
    pub delegatecall_no_only_owner: HashSet<usize>,
    pub unchecked_call: HashSet<usize>,
    pub snippets: HashMap<usize, String>,
}

fn strictly_inside(inner: SourceRange, outer: SourceRange) -> bool {
    let inner_end = inner.offset + inner.length;
    let outer_end = outer.offset + outer.length;
    inner.offset >= outer.offset && inner_end <= outer_end && inner != outer
}

fn starts_with_branch_keyword(text: &str) -> bool {
    let trimmed = text.trim_start();
    BRANCH_KEYWORDS.iter().any(|kw| {
        trimmed.starts_with(kw)
            && trimmed[kw.len()..]
                .chars()
                .next()
                .map_or(true, |c| !c.is_alphanumeric())
    })
}

/// Classify one program half (creation or runtime bytecode).
///
/// `constant_ranges` are the source ranges of pure/view ("constant")
/// functions; branches entirely inside one of them are never fuzzed.
pub fn classify(
    code: &[u8],
    source_map_rows: &[SourceRange],
    source: &str,
    constant_ranges: &[SourceRange],
) -> BranchSets {
    let instructions: Vec<Instruction> = bytecode::decode(code);
    let mut sets = BranchSets::default();

    // candidate JUMPIs not yet proven to start a branch; may be promoted by
    // an enclosing branch (short-circuit && / || chains)
    let mut candidates: Vec<(usize, SourceRange)> = Vec::new();
    let mut in_only_owner = false;

    // Pass 1: build the complete jumpi/timestamp/number/delegatecall sets
    // and the full branch-snippet map. Mirrors BytecodeBranch.cpp's first
    // `for` loop over the decompressed source map.
    for (instr, range) in instructions.iter().zip(source_map_rows.iter()) {
        let range = *range;
        let text = srcmap::snippet(source, range);

        match instr.opcode {
            bytecode::JUMPI => {
                let in_constant_fn = constant_ranges.iter().any(|cr| strictly_inside(range, *cr) || range == *cr);
                if in_constant_fn {
                    continue;
                }
                if starts_with_branch_keyword(text) {
                    for (cpc, crange) in candidates.iter() {
                        if strictly_inside(*crange, range) {
                            sets.jumpi.insert(*cpc);
                            sets.snippets.insert(*cpc, srcmap::snippet(source, *crange).to_string());
                        }
                    }
                    sets.jumpi.insert(instr.pc);
                    sets.snippets.insert(instr.pc, text.to_string());
                } else {
                    candidates.push((instr.pc, range));
                }
            }
            TIMESTAMP => {
                let lower = text.to_lowercase();
                if lower.contains("timestamp") || lower.contains("now") {
                    sets.timestamp.insert(instr.pc);
                }
            }
            NUMBER => {
                sets.number.insert(instr.pc);
            }
            CALLDATALOAD | CALLDATACOPY => {
                if text.trim_start().starts_with("function") {
                    in_only_owner = text.to_lowercase().contains("onlyowner");
                }
            }
            DELEGATECALL => {
                if text.contains("delegatecall") {
                    sets.delegatecall.insert(instr.pc);
                    if !in_only_owner {
                        sets.delegatecall_no_only_owner.insert(instr.pc);
                    }
                }
            }
            _ => {}
        }
    }

    // Pass 2: classify CALL/CALLCODE/DELEGATECALL against the now-complete
    // snippet map, so a call wrapped in a `require`/`if`/... that appears
    // later in program order than the call itself is still recognized as
    // checked. Mirrors BytecodeBranch.cpp's second `for` loop.
    for (instr, range) in instructions.iter().zip(source_map_rows.iter()) {
        let text = srcmap::snippet(source, *range);

        match instr.opcode {
            CALL | CALLCODE | DELEGATECALL => {
                classify_call_check(instr.pc, text, &sets.snippets, &mut sets.unchecked_call);
            }
            _ => {}
        }
    }

    sets
}

fn classify_call_check(
    pc: usize,
    text: &str,
    valid_branch_snippets: &HashMap<usize, String>,
    unchecked: &mut HashSet<usize>,
) {
    let matched = UNCHECKED_PATTERNS.iter().find(|p| text.contains(**p));
    let pattern = match matched {
        Some(p) => *p,
        None => return,
    };
    if pattern == ".transfer(" {
        unchecked.insert(pc);
        return;
    }
    let is_wrapped_in_check = valid_branch_snippets.values().any(|s| s.contains(pattern) && s.contains(text));
    if !is_wrapped_in_check {
        unchecked.insert(pc);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flat_rows(n: usize, offset: usize, length: usize) -> Vec<SourceRange> {
        (0..n).map(|_| SourceRange { offset, length }).collect()
    }

    #[test]
    fn test_jumpi_requires_keyword() {
        // PUSH1 1, JUMPI -- no source keyword anywhere -> not a branch
        let code = hex::decode("60015700").unwrap();
        let rows = flat_rows(code.len(), 0, 5);
        let source = "     ";
        let sets = classify(&code, &rows, source, &[]);
        assert!(sets.jumpi.is_empty());
    }

    #[test]
    fn test_jumpi_with_require_keyword() {
        let code = hex::decode("60015700").unwrap();
        let source = "require(x > 0)";
        let mut rows = flat_rows(code.len(), 0, source.len());
        // second instruction (JUMPI at pc 2) carries the require(...) snippet
        rows[1] = SourceRange { offset: 0, length: source.len() };
        let sets = classify(&code, &rows, source, &[]);
        assert!(sets.jumpi.contains(&2));
    }

    #[test]
    fn test_constant_function_excluded() {
        let code = hex::decode("60015700").unwrap();
        let source = "if (x > 0) {}";
        let mut rows = flat_rows(code.len(), 0, source.len());
        rows[1] = SourceRange { offset: 0, length: source.len() };
        let constant_ranges = vec![SourceRange { offset: 0, length: source.len() }];
        let sets = classify(&code, &rows, source, &constant_ranges);
        assert!(sets.jumpi.is_empty());
    }

    #[test]
    fn test_transfer_always_unchecked() {
        let code = hex::decode("f1").unwrap(); // CALL
        let source = "msg.sender.transfer(amount);";
        let rows = flat_rows(code.len(), 0, source.len());
        let sets = classify(&code, &rows, source, &[]);
        assert!(sets.unchecked_call.contains(&0));
    }

    #[test]
    fn test_call_wrapped_in_later_require_is_checked() {
        // CALL, PUSH1 1, JUMPI -- the call's pc precedes the wrapping
        // require's JUMPI pc, so a single forward pass would check it
        // against an as-yet-empty snippet map and wrongly flag it.
        let code = hex::decode("f1600157").unwrap();
        let source = "require(x.call())";
        let call_snippet = "x.call()";
        let call_offset = source.find(call_snippet).unwrap();
        let mut rows = flat_rows(code.len(), 0, source.len());
        rows[0] = SourceRange { offset: call_offset, length: call_snippet.len() };
        rows[2] = SourceRange { offset: 0, length: source.len() };
        let sets = classify(&code, &rows, source, &[]);
        assert!(sets.unchecked_call.is_empty());
    }
}
