//! Drives one testcase through the EVM adapter, instrumenting every
//! executed instruction to derive branch coverage, predicate distances,
//! and the oracle-relevant event stream.
//!
//! Grounded in sFuzz's `TargetExecutive::exec`/the `Fuzzer::saveIfInterest`
//! step hook: a single pass over the instruction trace maintains a small
//! amount of state (previous instruction, last comparison value, pending
//! JUMPI destinations) and reacts to a handful of opcodes.

use std::collections::{HashMap, HashSet};

use primitive_types::U256;

use crate::abi::{self, Layout};
use crate::branch::BranchSets;
use crate::r#const::PREFIX_PC_CAP;
use crate::contract::{AbiEntry, ContractInfo};
use crate::evm::{EvmAdapter, OpcodeContext};
use crate::oracle_event::OracleEvent;
use crate::types::{self, EVMAddress};

const GT: u8 = 0x11;
const SGT: u8 = 0x13;
const LT: u8 = 0x10;
const SLT: u8 = 0x12;
const EQ: u8 = 0x14;
const ADD: u8 = 0x01;
const MUL: u8 = 0x02;
const SUB: u8 = 0x03;
const AND: u8 = 0x16;
const JUMPI: u8 = 0x57;
const TIMESTAMP: u8 = 0x42;
const NUMBER: u8 = 0x43;
const BALANCE: u8 = 0x31;
const SHA3: u8 = 0x20;
const SUICIDE: u8 = 0xff;
const INVALID: u8 = 0xfe;
const CALL: u8 = 0xf1;
const CALLCODE: u8 = 0xf2;
const DELEGATECALL: u8 = 0xf4;
const STATICCALL: u8 = 0xfa;
const PUSH1: u8 = 0x60;
const PUSH32: u8 = 0x7f;

fn is_comparison(op: u8) -> bool {
    matches!(op, GT | SGT | LT | SLT | EQ)
}

fn is_call(op: u8) -> bool {
    matches!(op, CALL | CALLCODE | DELEGATECALL | STATICCALL)
}

/// Outcome of replaying one testcase against a fresh, rolled-back EVM state.
///
/// `calls` holds one trace per transaction executed (the creation
/// transaction followed by each invoked function, in order) so the oracle
/// can reason about a single call the way sFuzz's `OracleFactory::analyze`
/// does, rather than over a flattened mix of unrelated calls.
#[derive(Debug, Default, Clone)]
pub struct ExecutionResult {
    pub tracebits: HashSet<String>,
    pub predicates: HashMap<String, U256>,
    pub reached_branch: HashMap<String, u32>,
    pub unique_exceptions: HashSet<usize>,
    pub prefix_map: HashMap<String, Vec<usize>>,
    pub calls: Vec<Vec<OracleEvent>>,
}

impl ExecutionResult {
    /// FNV-1a over the sorted tracebits, used as the coverage checksum
    /// (`cksum`) that the mutator compares to detect interesting bytes.
    pub fn cksum(&self) -> u64 {
        let mut ids: Vec<&String> = self.tracebits.iter().collect();
        ids.sort();
        let mut hash: u64 = 0xcbf29ce484222325;
        for id in ids {
            for b in id.as_bytes() {
                hash ^= *b as u64;
                hash = hash.wrapping_mul(0x100000001b3);
            }
        }
        hash
    }

    fn merge(&mut self, other: &mut HookState) {
        self.tracebits.extend(other.result.tracebits.drain());
        for (k, v) in other.result.predicates.drain() {
            self.predicates.entry(k).or_insert(v);
        }
        for (k, v) in other.result.reached_branch.drain() {
            *self.reached_branch.entry(k).or_insert(0) += v;
        }
        self.unique_exceptions.extend(other.result.unique_exceptions.drain());
        for (k, v) in other.result.prefix_map.drain() {
            self.prefix_map.entry(k).or_insert(v);
        }
        self.calls.push(std::mem::take(&mut other.call_trace));
    }
}

/// Mutable state threaded through one call's per-step callback.
struct HookState<'a> {
    branches: &'a BranchSets,
    is_prefuzz: bool,
    prev_inst: Option<u8>,
    last_pc: usize,
    last_comp_value: U256,
    jump_dest1: Option<usize>,
    jump_dest2: Option<usize>,
    pclist: Vec<usize>,
    call_trace: Vec<OracleEvent>,
    result: ExecutionResult,
}

impl<'a> HookState<'a> {
    fn new(branches: &'a BranchSets, is_prefuzz: bool) -> Self {
        Self {
            branches,
            is_prefuzz,
            prev_inst: None,
            last_pc: 0,
            last_comp_value: U256::one(),
            jump_dest1: None,
            jump_dest2: None,
            pclist: Vec::new(),
            call_trace: Vec::new(),
            result: ExecutionResult::default(),
        }
    }

    fn on_step(&mut self, ctx: OpcodeContext) {
        let OpcodeContext {
            pc, opcode, depth, address, stack, memory, gas_cost, gas_left,
        } = ctx;
        let top = |i: usize| -> U256 { stack.get(stack.len().wrapping_sub(1 + i)).copied().unwrap_or_default() };
        let mem_slice = |offset: usize, len: usize| -> Vec<u8> {
            if len == 0 || offset >= memory.len() {
                return Vec::new();
            }
            let end = (offset + len).min(memory.len());
            memory[offset..end].to_vec()
        };

        if is_comparison(opcode) && stack.len() >= 2 {
            let a = top(0);
            let b = top(1);
            self.last_comp_value = if a > b { a - b } else { b - a } + U256::one();
            let mut event = OracleEvent::bare(pc, opcode, depth, address);
            event.has_zero_condition = a.is_zero() || b.is_zero();
            self.call_trace.push(event);
        }

        if opcode == JUMPI && self.branches.jumpi.contains(&pc) && stack.len() >= 2 {
            self.jump_dest1 = Some(top(0).as_usize());
            self.jump_dest2 = Some(pc + 1);
        } else if self.prev_inst == Some(JUMPI) && self.branches.jumpi.contains(&self.last_pc) {
            let branch_id = format!("{}:{}", self.last_pc, pc);
            if self.is_prefuzz {
                self.result.tracebits.insert(branch_id.clone());
                if let (Some(d1), Some(d2)) = (self.jump_dest1, self.jump_dest2) {
                    let other = if pc == d2 { d1 } else { d2 };
                    let other_id = format!("{}:{}", self.last_pc, other);
                    let distance = if self.last_comp_value.is_zero() { U256::MAX } else { self.last_comp_value };
                    self.result.predicates.entry(other_id).or_insert(distance);
                }
            } else {
                *self.result.reached_branch.entry(branch_id.clone()).or_insert(0) += 1;
            }
            if self.pclist.len() <= PREFIX_PC_CAP && !self.result.prefix_map.contains_key(&branch_id) {
                self.result.prefix_map.insert(branch_id, self.pclist.clone());
            }
        }

        if is_call(opcode) && stack.len() >= 3 {
            let has_value_arg = matches!(opcode, CALL | CALLCODE);
            let callee = types::convert_u256_to_h160(top(1));
            let value = if has_value_arg { top(2) } else { U256::zero() };
            let args_idx = if has_value_arg { 3 } else { 2 };
            let mut event = OracleEvent::bare(pc, opcode, depth, address);
            event.callee = Some(callee);
            event.value = value;
            if stack.len() > args_idx + 1 {
                let args_offset = top(args_idx).as_usize();
                let args_len = top(args_idx + 1).as_usize();
                event.calldata = mem_slice(args_offset, args_len);
            }
            if opcode == DELEGATECALL {
                if self.branches.delegatecall.contains(&pc) {
                    event.no_only_owner = self.branches.delegatecall_no_only_owner.contains(&pc);
                    event.is_checked = !self.branches.unchecked_call.contains(&pc);
                    self.call_trace.push(event);
                }
            } else {
                event.is_checked = !self.branches.unchecked_call.contains(&pc);
                self.call_trace.push(event);
            }
        }

        // Any instruction whose cost exceeds the gas left mid-execution: the
        // shape of a `.send()`/`.transfer()` whose 2300-gas stipend runs out
        // inside the callee, silently swallowed by the caller.
        if gas_cost > gas_left {
            let mut event = OracleEvent::bare(pc, opcode, depth, address);
            event.is_gasless = true;
            self.call_trace.push(event);
        }

        if opcode == TIMESTAMP && self.branches.timestamp.contains(&pc) {
            self.call_trace.push(OracleEvent::bare(pc, opcode, depth, address));
        }
        if opcode == NUMBER && self.branches.number.contains(&pc) {
            self.call_trace.push(OracleEvent::bare(pc, opcode, depth, address));
        }
        if matches!(opcode, SUICIDE | INVALID | SHA3 | BALANCE) {
            self.call_trace.push(OracleEvent::bare(pc, opcode, depth, address));
        }

        if self.prev_inst.map_or(false, |p| (PUSH1..=PUSH32).contains(&p)) && opcode == AND && stack.len() >= 2 {
            let pushed = top(0);
            let pretrans = top(1);
            if (pushed.checked_add(U256::one()).unwrap_or_default() % U256::from(16)).is_zero() && pretrans & pushed != pretrans {
                let mut event = OracleEvent::bare(pc, opcode, depth, address);
                event.is_overflow = true;
                self.call_trace.push(event);
            }
        }
        if matches!(opcode, ADD | MUL) && stack.len() >= 2 {
            let a = top(0);
            let b = top(1);
            let overflowed = if opcode == ADD { a.overflowing_add(b).1 } else { a.overflowing_mul(b).1 };
            if overflowed {
                let mut event = OracleEvent::bare(pc, opcode, depth, address);
                event.is_overflow = true;
                self.call_trace.push(event);
            }
        }
        if opcode == SUB && stack.len() >= 2 {
            let a = top(0);
            let b = top(1);
            if a < b {
                let mut event = OracleEvent::bare(pc, opcode, depth, address);
                event.is_underflow = true;
                self.call_trace.push(event);
            }
        }

        if self.is_prefuzz && pc <= PREFIX_PC_CAP && self.pclist.last().map_or(true, |&last| pc > last) {
            self.pclist.push(pc);
        }

        self.prev_inst = Some(opcode);
        self.last_pc = pc;
    }
}

/// Replays one raw testcase buffer: deploys the victim contract, invokes
/// each encoded function call in order, then rolls back world state.
pub fn exec(
    adapter: &mut EvmAdapter,
    contract: &ContractInfo,
    creation_branches: &BranchSets,
    runtime_branches: &BranchSets,
    entries: &[&AbiEntry],
    layouts: &[Layout],
    testcase: &[u8],
    is_prefuzz: bool,
) -> ExecutionResult {
    let savepoint = adapter.savepoint();

    let (caller, attacker_caller) = abi::decode_accounts(testcase);
    let (timestamp, number) = abi::decode_block(testcase);
    adapter.update_env(timestamp, number);
    adapter.set_balance(caller, U256::from(10u64).pow(U256::from(21)));
    adapter.set_balance(attacker_caller, U256::from(10u64).pow(U256::from(21)));

    let victim = contract.deployed_address;
    let mut final_result = ExecutionResult::default();

    let has_constructor = entries.first().map_or(false, |e| e.is_constructor);
    let constructor_calldata = if has_constructor {
        layouts.first().map(|l| l.encode(testcase, &[])).unwrap_or_default()
    } else {
        Vec::new()
    };

    let mut deploy_state = HookState::new(creation_branches, is_prefuzz);
    let deploy_outcome = adapter.deploy(caller, victim, deploy_code(contract, &constructor_calldata), U256::zero(), |ctx| {
        deploy_state.on_step(ctx);
    });
    if deploy_outcome.excepted {
        let pc = deploy_state.last_pc;
        deploy_state.result.unique_exceptions.insert(pc);
        deploy_state.call_trace.push(OracleEvent::bare(pc, INVALID, 0, caller));
    }
    final_result.merge(&mut deploy_state);

    let skip = if has_constructor { 1 } else { 0 };
    invoke_each(adapter, runtime_branches, &entries[skip..], &layouts[skip..], testcase, caller, victim, is_prefuzz, &mut final_result);

    adapter.rollback(savepoint);
    final_result
}

/// Replays a splice-produced double-width testcase against an
/// already-deployed contract: one deploy (from the first half, i.e. the
/// splice partner's constructor args), then every function in `entries`
/// invoked twice -- once against the first half of `testcase` and once
/// against the second, `half_len`-shifted half. Mirrors sFuzz's
/// `transactionLength = 2` replay around `Mutation::splice`
/// (`libfuzzer/Mutation.cpp`).
pub fn exec_spliced(
    adapter: &mut EvmAdapter,
    contract: &ContractInfo,
    creation_branches: &BranchSets,
    runtime_branches: &BranchSets,
    entries: &[&AbiEntry],
    layouts: &[Layout],
    testcase: &[u8],
    half_len: usize,
    is_prefuzz: bool,
) -> ExecutionResult {
    let savepoint = adapter.savepoint();

    let (caller, attacker_caller) = abi::decode_accounts(testcase);
    let (timestamp, number) = abi::decode_block(testcase);
    adapter.update_env(timestamp, number);
    adapter.set_balance(caller, U256::from(10u64).pow(U256::from(21)));
    adapter.set_balance(attacker_caller, U256::from(10u64).pow(U256::from(21)));

    let victim = contract.deployed_address;
    let mut final_result = ExecutionResult::default();

    let has_constructor = entries.first().map_or(false, |e| e.is_constructor);
    let constructor_calldata = if has_constructor {
        layouts.first().map(|l| l.encode(testcase, &[])).unwrap_or_default()
    } else {
        Vec::new()
    };

    let mut deploy_state = HookState::new(creation_branches, is_prefuzz);
    let deploy_outcome = adapter.deploy(caller, victim, deploy_code(contract, &constructor_calldata), U256::zero(), |ctx| {
        deploy_state.on_step(ctx);
    });
    if deploy_outcome.excepted {
        let pc = deploy_state.last_pc;
        deploy_state.result.unique_exceptions.insert(pc);
        deploy_state.call_trace.push(OracleEvent::bare(pc, INVALID, 0, caller));
    }
    final_result.merge(&mut deploy_state);

    let skip = if has_constructor { 1 } else { 0 };
    let call_entries = &entries[skip..];
    let first_layouts = &layouts[skip..];
    invoke_each(adapter, runtime_branches, call_entries, first_layouts, testcase, caller, victim, is_prefuzz, &mut final_result);

    let second_layouts: Vec<Layout> = first_layouts
        .iter()
        .map(|l| Layout { types: l.types.clone(), offset: l.offset + half_len })
        .collect();
    invoke_each(adapter, runtime_branches, call_entries, &second_layouts, testcase, caller, victim, is_prefuzz, &mut final_result);

    adapter.rollback(savepoint);
    final_result
}

/// Invokes each `(entry, layout)` pair in order against `testcase`, merging
/// every call's trace into `final_result`. Shared by [exec] and
/// [exec_spliced] so the double-call replay doesn't duplicate the
/// exception/trace bookkeeping.
fn invoke_each(
    adapter: &mut EvmAdapter,
    runtime_branches: &BranchSets,
    entries: &[&AbiEntry],
    layouts: &[Layout],
    testcase: &[u8],
    caller: EVMAddress,
    victim: EVMAddress,
    is_prefuzz: bool,
    final_result: &mut ExecutionResult,
) {
    for (entry, layout) in entries.iter().zip(layouts.iter()) {
        let calldata = layout.encode(testcase, &entry.selector);
        let mut call_state = HookState::new(runtime_branches, is_prefuzz);
        let mut root = OracleEvent::bare(0, 0, 0, caller);
        root.calldata = calldata.clone();
        call_state.call_trace.push(root);
        let outcome = adapter.invoke(caller, victim, calldata, U256::zero(), |ctx| {
            call_state.on_step(ctx);
        });
        if outcome.excepted {
            let pc = call_state.last_pc;
            call_state.result.unique_exceptions.insert(pc);
            call_state.call_trace.push(OracleEvent::bare(pc, INVALID, 0, caller));
        }
        final_result.merge(&mut call_state);
    }
}

/// sFuzz links constructor args directly onto the end of the creation
/// bytecode, matching how `solc`-produced `bin` already expects them.
fn deploy_code(contract: &ContractInfo, constructor_args: &[u8]) -> Vec<u8> {
    let mut code = contract.creation_code.clone();
    code.extend_from_slice(constructor_args);
    code
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cksum_stable_for_same_tracebits() {
        let mut r1 = ExecutionResult::default();
        r1.tracebits.insert("10:20".to_string());
        r1.tracebits.insert("30:40".to_string());
        let mut r2 = ExecutionResult::default();
        r2.tracebits.insert("30:40".to_string());
        r2.tracebits.insert("10:20".to_string());
        assert_eq!(r1.cksum(), r2.cksum());
    }

    #[test]
    fn test_cksum_differs_for_different_tracebits() {
        let mut r1 = ExecutionResult::default();
        r1.tracebits.insert("10:20".to_string());
        let r2 = ExecutionResult::default();
        assert_ne!(r1.cksum(), r2.cksum());
    }
}
