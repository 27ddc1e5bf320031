//! Thin façade over `revm`, exposing only what the executor needs: deploy,
//! invoke with a per-instruction callback, and world-state snapshot/restore.
//!
//! Grounded in the teacher's own `FuzzHost`/`Host` step-hook split
//! (`evm/host.rs`): generic fuzzing logic never touches `revm` internals
//! directly, it only receives [OpcodeContext] values from this module. The
//! teacher wires its hook through a hand-patched `Host` trait; this crate
//! uses `revm`'s public `Inspector` trait instead, since the patched trait
//! is not something a registry dependency exposes (see DESIGN.md).

use primitive_types::U256;
use revm::db::{CacheDB, EmptyDB};
use revm::interpreter::{InstructionResult, Interpreter};
use revm::primitives::{AccountInfo, Bytecode as RevmBytecode, ExecutionResult, Output, ResultAndState, TransactTo, B256};
use revm::{EVMData, Inspector, EVM};

use crate::types::EVMAddress;

/// `H160` <-> `revm::primitives::Address` both wrap a `[u8; 20]`; these just
/// move the bytes across the crate boundary without altering them.
fn to_revm_address(addr: EVMAddress) -> revm::primitives::Address {
    revm::primitives::Address::from(addr.0)
}

fn from_revm_address(addr: revm::primitives::Address) -> EVMAddress {
    EVMAddress(<[u8; 20]>::from(addr))
}

/// `primitive_types::U256` and `revm::primitives::U256` both hold 256-bit
/// unsigned integers, just with different backing storage; convert via
/// their shared big-endian byte representation.
fn to_revm_u256(v: U256) -> revm::primitives::U256 {
    let mut bytes = [0u8; 32];
    v.to_big_endian(&mut bytes);
    revm::primitives::U256::from_be_bytes(bytes)
}

fn from_revm_u256(v: revm::primitives::U256) -> U256 {
    U256::from_big_endian(&v.to_be_bytes::<32>())
}

/// One instruction-level event, delivered to the executor before the
/// instruction at `pc` executes.
#[derive(Debug, Clone)]
pub struct OpcodeContext {
    pub pc: usize,
    pub opcode: u8,
    pub depth: usize,
    pub address: EVMAddress,
    pub stack: Vec<U256>,
    pub memory: Vec<u8>,
    pub gas_cost: u64,
    pub gas_left: u64,
}

/// Result of replaying one transaction (deploy or function call).
#[derive(Debug, Default)]
pub struct StepOutcome {
    pub output: Vec<u8>,
    pub excepted: bool,
    pub created_address: Option<EVMAddress>,
}

/// Opaque handle returned by [EvmAdapter::savepoint]; pass back to
/// [EvmAdapter::rollback] to restore world state.
pub struct Savepoint(CacheDB<EmptyDB>);

struct StepInspector<'a> {
    on_step: &'a mut dyn FnMut(OpcodeContext),
    // captured by `step`, completed and flushed by `step_end` once the real
    // cost of the instruction is known.
    pending: Option<(OpcodeContext, u64)>,
}

impl<'a, DB: revm::Database> Inspector<DB> for StepInspector<'a> {
    fn step(&mut self, interp: &mut Interpreter, data: &mut EVMData<'_, DB>) -> InstructionResult {
        let gas_left = interp.gas.remaining();
        let ctx = OpcodeContext {
            pc: interp.program_counter(),
            opcode: interp.current_opcode(),
            depth: data.journaled_state.depth() as usize,
            address: from_revm_address(interp.contract.address),
            stack: interp.stack.data().iter().map(|v| from_revm_u256(*v)).collect(),
            memory: interp.memory.data().clone(),
            gas_cost: 0,
            gas_left,
        };
        self.pending = Some((ctx, gas_left));
        InstructionResult::Continue
    }

    fn step_end(&mut self, interp: &mut Interpreter, _data: &mut EVMData<'_, DB>, eval: InstructionResult) -> InstructionResult {
        if let Some((mut ctx, gas_left_before)) = self.pending.take() {
            ctx.gas_cost = gas_left_before.saturating_sub(interp.gas.remaining());
            (self.on_step)(ctx);
        }
        eval
    }
}

pub struct EvmAdapter {
    db: CacheDB<EmptyDB>,
    pub block_timestamp: U256,
    pub block_number: U256,
}

impl Default for EvmAdapter {
    fn default() -> Self {
        Self {
            db: CacheDB::new(EmptyDB::default()),
            block_timestamp: U256::from(1),
            block_number: U256::from(1),
        }
    }
}

impl EvmAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Credit `address` with `value` wei, creating the account if needed.
    pub fn set_balance(&mut self, address: EVMAddress, value: U256) {
        use revm::Database;
        let address = to_revm_address(address);
        let mut info = self.db.basic(address).unwrap_or_default().unwrap_or_default();
        info.balance = to_revm_u256(value);
        self.db.insert_account_info(address, info);
    }

    pub fn update_env(&mut self, timestamp: U256, number: U256) {
        self.block_timestamp = timestamp;
        self.block_number = number;
    }

    /// Deploy `creation_code` from `deployer` at `address` by running the
    /// constructor, storing the resulting runtime code at `address`.
    pub fn deploy(
        &mut self,
        deployer: EVMAddress,
        address: EVMAddress,
        creation_code: Vec<u8>,
        value: U256,
        mut on_step: impl FnMut(OpcodeContext),
    ) -> StepOutcome {
        let mut evm = self.build_evm();
        evm.env.tx.caller = to_revm_address(deployer);
        evm.env.tx.transact_to = TransactTo::Create(revm::primitives::CreateScheme::Fixed(to_revm_address(address)));
        evm.env.tx.data = creation_code.into();
        evm.env.tx.value = to_revm_u256(value);

        let mut inspector = StepInspector { on_step: &mut on_step, pending: None };
        let result = evm.inspect_commit(&mut inspector);
        self.db = evm.db.take().unwrap();
        self.summarize(result)
    }

    /// Invoke `calldata` on `address` as `caller`, driving the per-step
    /// callback for every executed instruction.
    pub fn invoke(
        &mut self,
        caller: EVMAddress,
        address: EVMAddress,
        calldata: Vec<u8>,
        value: U256,
        mut on_step: impl FnMut(OpcodeContext),
    ) -> StepOutcome {
        let mut evm = self.build_evm();
        evm.env.tx.caller = caller;
        evm.env.tx.transact_to = TransactTo::Call(address);
        evm.env.tx.data = calldata.into();
        evm.env.tx.value = value;

        let mut inspector = StepInspector { on_step: &mut on_step, pending: None };
        let result = evm.inspect_commit(&mut inspector);
        self.db = evm.db.take().unwrap();
        self.summarize(result)
    }

    /// Snapshot the world state. O(size of touched accounts); acceptable
    /// for the single-contract-pair scale this crate targets.
    pub fn savepoint(&self) -> Savepoint {
        Savepoint(self.db.clone())
    }

    pub fn rollback(&mut self, savepoint: Savepoint) {
        self.db = savepoint.0;
    }

    fn build_evm(&mut self) -> EVM<CacheDB<EmptyDB>> {
        let mut evm = EVM::new();
        evm.database(std::mem::replace(&mut self.db, CacheDB::new(EmptyDB::default())));
        evm.env.block.timestamp = self.block_timestamp;
        evm.env.block.number = self.block_number;
        evm.env.cfg.disable_balance_check = true;
        evm
    }

    fn summarize(&self, result: revm::primitives::EVMResult<revm::primitives::EVMError<revm::primitives::InvalidTransaction>>) -> StepOutcome {
        match result {
            Ok(ExecutionResult::Success { output, .. }) => {
                let (out_bytes, created) = match output {
                    Output::Call(bytes) => (bytes.to_vec(), None),
                    Output::Create(bytes, addr) => (bytes.to_vec(), addr),
                };
                StepOutcome {
                    output: out_bytes,
                    excepted: false,
                    created_address: created,
                }
            }
            Ok(ExecutionResult::Revert { output, .. }) => StepOutcome {
                output: output.to_vec(),
                excepted: true,
                created_address: None,
            },
            Ok(ExecutionResult::Halt { .. }) | Err(_) => StepOutcome {
                output: Vec::new(),
                excepted: true,
                created_address: None,
            },
        }
    }
}

/// Standalone code storage helper, used by callers that need to pre-seed a
/// contract's runtime code without running a constructor (e.g. to install
/// library placeholders).
pub fn install_runtime_code(adapter: &mut EvmAdapter, address: EVMAddress, code: Vec<u8>) {
    let bytecode = RevmBytecode::new_raw(code.into());
    let mut info = AccountInfo {
        balance: U256::zero(),
        nonce: 1,
        code_hash: B256::zero(),
        code: Some(bytecode),
    };
    info.code_hash = revm::primitives::keccak256(info.code.as_ref().unwrap().bytes());
    adapter.db.insert_account_info(address, info);
}
