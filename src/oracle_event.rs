//! The event shape the executor emits per relevant instruction and the
//! oracle consumes. Kept as its own module since both [crate::executor]
//! and [crate::oracle] depend on it without depending on each other.

use primitive_types::U256;

use crate::types::EVMAddress;

#[derive(Debug, Clone)]
pub struct OracleEvent {
    pub pc: usize,
    pub opcode: u8,
    pub depth: usize,
    pub caller: EVMAddress,
    pub callee: Option<EVMAddress>,
    pub value: U256,
    pub calldata: Vec<u8>,
    pub has_zero_condition: bool,
    pub is_checked: bool,
    pub no_only_owner: bool,
    pub is_gasless: bool,
    pub is_overflow: bool,
    pub is_underflow: bool,
}

impl OracleEvent {
    pub fn bare(pc: usize, opcode: u8, depth: usize, caller: EVMAddress) -> Self {
        Self {
            pc,
            opcode,
            depth,
            caller,
            callee: None,
            value: U256::zero(),
            calldata: Vec::new(),
            has_zero_condition: false,
            is_checked: true,
            no_only_owner: false,
            is_gasless: false,
            is_overflow: false,
            is_underflow: false,
        }
    }
}
