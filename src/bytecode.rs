//! Linear-scan bytecode decoder.
//!
//! Walks raw EVM bytecode into `(pc, opcode)` pairs, skipping PUSH1..PUSH32
//! immediates so later passes never mistake immediate bytes for opcodes.

/// One decoded instruction. `pc` points at the *last* byte of the
/// instruction's span: for a plain opcode that's the opcode byte itself,
/// for PUSH1..PUSH32 it's the last immediate byte. Immediate bytes are
/// never emitted as separate entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Instruction {
    pub pc: usize,
    pub opcode: u8,
}

pub const JUMPI: u8 = 0x57;
pub const JUMPDEST: u8 = 0x5b;
const PUSH1: u8 = 0x60;
const PUSH32: u8 = 0x7f;

/// Decode `code` into its instruction stream. Never fails: unknown opcodes
/// are passed through unchanged, since the decoder has no notion of
/// validity beyond immediate-length skipping.
pub fn decode(code: &[u8]) -> Vec<Instruction> {
    let mut out = Vec::with_capacity(code.len());
    let mut pc = 0usize;
    while pc < code.len() {
        let opcode = code[pc];
        if (PUSH1..=PUSH32).contains(&opcode) {
            let immediate_len = (opcode - PUSH1 + 1) as usize;
            pc += immediate_len;
        }
        out.push(Instruction { pc, opcode });
        pc += 1;
    }
    out
}

/// Find every distinct byte string pushed onto the stack via PUSHn, except
/// those immediately consumed by a JUMPI (those are branch targets, not
/// meaningful data constants). Used to seed the mutator's code dictionary.
pub fn find_constants(code: &[u8]) -> std::collections::HashSet<Vec<u8>> {
    let mut constants = std::collections::HashSet::new();
    let mut pc = 0usize;
    while pc < code.len() {
        let opcode = code[pc];
        if (PUSH1..=PUSH32).contains(&opcode) {
            let immediate_len = (opcode - PUSH1 + 1) as usize;
            let start = pc + 1;
            let end = (start + immediate_len).min(code.len());
            let followed_by_jumpi = end < code.len() && code[end] == JUMPI;
            if !followed_by_jumpi && end > start {
                constants.insert(code[start..end].to_vec());
            }
            pc = end;
        }
        pc += 1;
    }
    constants
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_simple_pushes() {
        let code = hex::decode("600160026003").unwrap();
        let decoded = decode(&code);
        assert_eq!(
            decoded,
            vec![
                Instruction { pc: 1, opcode: 0x60 },
                Instruction { pc: 3, opcode: 0x60 },
                Instruction { pc: 5, opcode: 0x60 },
            ]
        );
    }

    #[test]
    fn test_decode_mixed() {
        // PUSH1 0x01, JUMPI, STOP
        let code = hex::decode("6001570000").unwrap();
        let decoded = decode(&code);
        assert_eq!(decoded[0], Instruction { pc: 1, opcode: 0x60 });
        assert_eq!(decoded[1], Instruction { pc: 2, opcode: 0x57 });
        assert_eq!(decoded[2], Instruction { pc: 3, opcode: 0x00 });
    }

    #[test]
    fn test_find_constants_skips_jump_targets() {
        // PUSH1 0x10, JUMPI (the 0x10 is a jump target, not a constant)
        let code = hex::decode("601057").unwrap();
        assert!(find_constants(&code).is_empty());
    }

    #[test]
    fn test_find_constants_keeps_data() {
        // PUSH1 0xAB, ADD (not a jump target)
        let code = hex::decode("60ab01").unwrap();
        let constants = find_constants(&code);
        assert!(constants.contains(&vec![0xabu8]));
    }
}
