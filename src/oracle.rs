//! Vulnerability-pattern oracle: classifies the per-call traces produced by
//! one testcase execution against ten known smart-contract weakness
//! patterns.
//!
//! Grounded in sFuzz's `OracleFactory::analyze`: each classifier makes a
//! single forward pass over one call's `OpcodeContext` stream, flags a
//! hit, and records the program counter(s) responsible so the scheduler
//! can credit the testcase that first found them.

use std::collections::HashSet;

use crate::executor::ExecutionResult;
use crate::oracle_event::OracleEvent;
use crate::r#const::{ORACLE_COMPARISON_GAP, ORACLE_WINDOW, REENTRANCY_DEPTH};
use crate::types::victim_address;

const GT: u8 = 0x11;
const SGT: u8 = 0x13;
const LT: u8 = 0x10;
const SLT: u8 = 0x12;
const EQ: u8 = 0x14;
const SHA3: u8 = 0x20;
const BALANCE: u8 = 0x31;
const TIMESTAMP: u8 = 0x42;
const NUMBER: u8 = 0x43;
const JUMPI: u8 = 0x57;
const CALL: u8 = 0xf1;
const CALLCODE: u8 = 0xf2;
const DELEGATECALL: u8 = 0xf4;
const INVALID: u8 = 0xfe;
const SUICIDE: u8 = 0xff;

fn is_comparison(op: u8) -> bool {
    matches!(op, GT | SGT | LT | SLT | EQ)
}

/// The ten weakness patterns an [ExecutionResult] is checked against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Vulnerability {
    GaslessSend,
    UncheckedCall,
    TimeDependency,
    NumberDependency,
    DelegateCall,
    Reentrancy,
    Freezing,
    Overflow,
    Underflow,
    UnexpectedEther,
}

impl Vulnerability {
    pub const ALL: [Vulnerability; 10] = [
        Vulnerability::GaslessSend,
        Vulnerability::UncheckedCall,
        Vulnerability::TimeDependency,
        Vulnerability::NumberDependency,
        Vulnerability::DelegateCall,
        Vulnerability::Reentrancy,
        Vulnerability::Freezing,
        Vulnerability::Overflow,
        Vulnerability::Underflow,
        Vulnerability::UnexpectedEther,
    ];

    pub fn label(&self) -> &'static str {
        match self {
            Vulnerability::GaslessSend => "gasless_send",
            Vulnerability::UncheckedCall => "exception_disorder",
            Vulnerability::TimeDependency => "time_dependency",
            Vulnerability::NumberDependency => "number_dependency",
            Vulnerability::DelegateCall => "delegatecall_injection",
            Vulnerability::Reentrancy => "reentrancy",
            Vulnerability::Freezing => "freezing_ether",
            Vulnerability::Overflow => "integer_overflow",
            Vulnerability::Underflow => "integer_underflow",
            Vulnerability::UnexpectedEther => "unexpected_ether",
        }
    }
}

/// One run's oracle verdict: which patterns fired, and the program
/// counters that explain why (used both for reporting and to credit the
/// branches that led to a hit).
#[derive(Debug, Default, Clone)]
pub struct OracleReport {
    pub hits: HashSet<Vulnerability>,
    pub distinctions: std::collections::HashMap<Vulnerability, HashSet<usize>>,
}

impl OracleReport {
    fn flag(&mut self, kind: Vulnerability, pc: usize) {
        self.hits.insert(kind);
        self.distinctions.entry(kind).or_default().insert(pc);
    }
}

/// Run every classifier over every call trace in `result`, accumulating
/// one [OracleReport] for the whole testcase.
pub fn analyze(result: &ExecutionResult) -> OracleReport {
    let mut report = OracleReport::default();
    for call in &result.calls {
        gasless_send(call, &mut report);
        unchecked_call(call, &mut report);
        time_dependency(call, &mut report);
        number_dependency(call, &mut report);
        delegate_call(call, &mut report);
        reentrancy(call, &mut report);
        overflow(call, &mut report);
        underflow(call, &mut report);
        unexpected_ether(call, &mut report);
    }
    freezing(result, &mut report);
    report
}

/// A `CALL` one level deep, carrying no calldata, forwarding exactly the
/// 2300-gas stipend (or none) -- the shape of an unguarded `.send()`/
/// `.transfer()` whose failure the caller never checks.
fn gasless_send(call: &[OracleEvent], report: &mut OracleReport) {
    let mut last_pc2 = 0usize;
    let mut last_pc1 = 0usize;
    for ctx in call {
        if ctx.is_gasless {
            report.flag(Vulnerability::GaslessSend, last_pc2);
        }
        last_pc2 = last_pc1;
        last_pc1 = ctx.pc;
    }
}

/// Any sub-call whose failure return value is never checked, or whose
/// revert doesn't unwind the whole transaction.
fn unchecked_call(call: &[OracleEvent], report: &mut OracleReport) {
    let root_exception = call.last().map_or(false, |c| c.opcode == INVALID && c.depth == 0);
    for ctx in call {
        let deep_unhandled_revert = !root_exception && ctx.opcode == INVALID && ctx.depth > 0;
        if deep_unhandled_revert || !ctx.is_checked {
            report.flag(Vulnerability::UncheckedCall, ctx.pc);
        }
    }
}

/// `block.timestamp` read and either fed into a hashed value or reaching a
/// conditional jump within [ORACLE_WINDOW] instructions.
fn time_dependency(call: &[OracleEvent], report: &mut OracleReport) {
    block_attribute_dependency(call, TIMESTAMP, Vulnerability::TimeDependency, report);
}

/// `block.number` read with the same shape as [time_dependency]; commonly
/// misused as a pseudo-random seed.
fn number_dependency(call: &[OracleEvent], report: &mut OracleReport) {
    block_attribute_dependency(call, NUMBER, Vulnerability::NumberDependency, report);
}

fn block_attribute_dependency(call: &[OracleEvent], attribute_op: u8, kind: Vulnerability, report: &mut OracleReport) {
    let mut has_attribute = false;
    let mut reached_jumpi = false;
    let mut last_pc = 0usize;

    for ctx in call {
        if ctx.opcode == attribute_op {
            has_attribute = true;
            last_pc = ctx.pc;
            reached_jumpi = false;
        }
        if has_attribute && !reached_jumpi && ctx.opcode == SHA3 {
            report.flag(kind, last_pc);
        }
        reached_jumpi = reached_jumpi || ctx.opcode == JUMPI;
        if is_comparison(ctx.opcode) && ctx.pc.saturating_sub(last_pc) < ORACLE_COMPARISON_GAP {
            last_pc = ctx.pc;
        }
        if ctx.opcode == JUMPI && ctx.pc.saturating_sub(last_pc) <= ORACLE_WINDOW {
            report.flag(kind, last_pc);
        }
    }
}

/// `DELEGATECALL` reachable without an `onlyOwner`-style guard, where the
/// delegated-to address or calldata appears attacker-controlled.
fn delegate_call(call: &[OracleEvent], report: &mut OracleReport) {
    let root = match call.first() {
        Some(r) => r,
        None => return,
    };
    for ctx in call {
        if ctx.opcode == DELEGATECALL && ctx.no_only_owner {
            let callee_controlled = ctx.callee.map_or(false, |callee| {
                root.caller == callee || hex::encode(&root.calldata).contains(&hex::encode(callee.as_bytes()))
            });
            if root.calldata == ctx.calldata || callee_controlled {
                report.flag(Vulnerability::DelegateCall, ctx.pc);
            }
        }
    }
}

/// A fallback-triggered call chain that loops back into the victim from
/// the fuzzer's attacker contract at [REENTRANCY_DEPTH] or deeper.
fn reentrancy(call: &[OracleEvent], report: &mut OracleReport) {
    let mut may_reentrancy = 0usize;
    for ctx in call {
        if ctx.depth == 0 {
            may_reentrancy = ctx.pc;
        }
        if ctx.depth >= REENTRANCY_DEPTH && ctx.caller == victim_address() {
            report.flag(Vulnerability::Reentrancy, may_reentrancy);
        }
    }
}

/// Ether locked in the contract by a working `DELEGATECALL` path with no
/// matching `CALL`/`CALLCODE`/`SUICIDE` able to ever release it.
fn freezing(result: &ExecutionResult, report: &mut OracleReport) {
    let mut has_delegate = false;
    let mut has_transfer_out = false;
    let mut delegatecall_pc = 0usize;
    for call in &result.calls {
        for ctx in call {
            if ctx.depth == 1 && matches!(ctx.opcode, CALL | CALLCODE | SUICIDE) {
                has_transfer_out = true;
            }
            if ctx.opcode == DELEGATECALL {
                has_delegate = true;
                delegatecall_pc = ctx.pc;
            }
        }
    }
    if has_delegate && !has_transfer_out {
        report.flag(Vulnerability::Freezing, delegatecall_pc);
    }
}

/// Any instruction the executor already marked as an overflowing
/// arithmetic operation or a too-narrow bitmask downcast.
fn overflow(call: &[OracleEvent], report: &mut OracleReport) {
    for ctx in call {
        if ctx.is_overflow {
            report.flag(Vulnerability::Overflow, ctx.pc);
        }
    }
}

/// Any `SUB` whose minuend is smaller than its subtrahend, wrapping around
/// to a huge unsigned value.
fn underflow(call: &[OracleEvent], report: &mut OracleReport) {
    for ctx in call {
        if ctx.is_underflow {
            report.flag(Vulnerability::Underflow, ctx.pc);
        }
    }
}

/// `address.balance` read that feeds a conditional jump on a non-trivial
/// comparison -- a contract whose control flow depends on ether that can
/// be forced in via `SELFDESTRUCT`, bypassing any `payable` guard.
fn unexpected_ether(call: &[OracleEvent], report: &mut OracleReport) {
    let mut has_balance = false;
    let mut reached_jumpi = false;
    let mut last_pc = 0usize;
    for ctx in call {
        if ctx.opcode == BALANCE {
            has_balance = true;
            last_pc = ctx.pc;
            reached_jumpi = false;
        }
        reached_jumpi = reached_jumpi || ctx.opcode == JUMPI;
        if is_comparison(ctx.opcode) && ctx.pc.saturating_sub(last_pc) < ORACLE_COMPARISON_GAP && !ctx.has_zero_condition {
            last_pc = ctx.pc;
        }
        if has_balance && ctx.opcode == JUMPI && ctx.pc.saturating_sub(last_pc) <= ORACLE_WINDOW {
            report.flag(Vulnerability::UnexpectedEther, last_pc);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::EVMAddress;

    fn event(pc: usize, opcode: u8, depth: usize) -> OracleEvent {
        OracleEvent::bare(pc, opcode, depth, EVMAddress::zero())
    }

    #[test]
    fn test_overflow_flagged_from_event_marker() {
        let mut e = event(10, 0x01, 0);
        e.is_overflow = true;
        let mut report = OracleReport::default();
        overflow(&[e], &mut report);
        assert!(report.hits.contains(&Vulnerability::Overflow));
    }

    #[test]
    fn test_time_dependency_requires_nearby_jumpi() {
        let calls = vec![event(0, TIMESTAMP, 0), event(1, GT, 0), event(2, JUMPI, 0)];
        let mut report = OracleReport::default();
        time_dependency(&calls, &mut report);
        assert!(report.hits.contains(&Vulnerability::TimeDependency));
    }

    #[test]
    fn test_time_dependency_flags_jumpi_exactly_at_window_edge() {
        let calls = vec![event(0, TIMESTAMP, 0), event(8, JUMPI, 0)];
        let mut report = OracleReport::default();
        time_dependency(&calls, &mut report);
        assert!(report.hits.contains(&Vulnerability::TimeDependency));
    }

    #[test]
    fn test_time_dependency_absent_without_timestamp() {
        let calls = vec![event(0, GT, 0), event(1, JUMPI, 0)];
        let mut report = OracleReport::default();
        time_dependency(&calls, &mut report);
        assert!(!report.hits.contains(&Vulnerability::TimeDependency));
    }

    #[test]
    fn test_underflow_flagged_from_event_marker() {
        let mut e = event(5, 0x03, 0);
        e.is_underflow = true;
        let mut report = OracleReport::default();
        underflow(&[e], &mut report);
        assert!(report.hits.contains(&Vulnerability::Underflow));
    }

    #[test]
    fn test_reentrancy_requires_depth_threshold() {
        let mut root = event(0, CALL, 0);
        root.caller = EVMAddress::zero();
        let mut deep = event(1, CALL, REENTRANCY_DEPTH);
        deep.caller = victim_address();
        let mut report = OracleReport::default();
        reentrancy(&[root, deep], &mut report);
        assert!(report.hits.contains(&Vulnerability::Reentrancy));
    }
}
