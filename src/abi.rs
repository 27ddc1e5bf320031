//! ABI codec: type-directed random testcase generation and ABI encoding of
//! a raw mutated buffer into deployable/callable calldata.
//!
//! A testcase is a flat byte buffer laid out as
//! `accounts_prefix || block_prefix || constructor_args || function1_args || function2_args ...`
//! Every field occupies a fixed-width slot so the mutator can operate on
//! the buffer with plain byte-level edits and the codec can always
//! re-derive calldata from it deterministically.

use crypto::digest::Digest;
use crypto::sha3::Sha3;
use primitive_types::U256;
use rand::Rng;

use crate::contract::AbiEntry;
use crate::error::{FuzzError, Result};
use crate::types::EVMAddress;

pub const ACCOUNTS_PREFIX_LEN: usize = 20 * 2; // two caller addresses
pub const BLOCK_PREFIX_LEN: usize = 32 * 2; // timestamp, number
const WORD: usize = 32;
/// Cap on the length of a dynamic (bytes/string) field's payload inside a
/// testcase. sFuzz's own fuzz harness bounds dynamic field sizes similarly
/// to keep testcases small and mutation-dense; this crate follows suit.
const MAX_DYNAMIC_LEN: usize = 64;

pub fn keccak256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha3::keccak256();
    hasher.input(data);
    let mut out = [0u8; 32];
    hasher.result(&mut out);
    out
}

/// A single ABI parameter type, restricted to the subset of Solidity types
/// the fuzzer can encode into a fixed-width testcase slot: value types,
/// fixed-size byte arrays, capped dynamic bytes/string, and fixed-size
/// arrays of the above. Dynamic-length arrays are out of scope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DataType {
    Uint(usize),
    Int(usize),
    Address,
    Bool,
    FixedBytes(usize),
    Bytes,
    String,
    FixedArray(Box<DataType>, usize),
}

impl DataType {
    pub fn parse(ty: &str) -> Result<Self> {
        if let Some(stripped) = ty.strip_suffix(']') {
            if let Some(idx) = stripped.rfind('[') {
                let (elem, count) = stripped.split_at(idx);
                let count = &count[1..];
                if count.is_empty() {
                    return Err(FuzzError::Abi(format!("dynamic array type unsupported: {ty}")));
                }
                let n: usize = count
                    .parse()
                    .map_err(|_| FuzzError::Abi(format!("invalid array length in {ty}")))?;
                return Ok(DataType::FixedArray(Box::new(DataType::parse(elem)?), n));
            }
        }
        match ty {
            "address" => Ok(DataType::Address),
            "bool" => Ok(DataType::Bool),
            "bytes" => Ok(DataType::Bytes),
            "string" => Ok(DataType::String),
            t if t.starts_with("uint") => Ok(DataType::Uint(parse_bits(t, "uint")?)),
            t if t.starts_with("int") => Ok(DataType::Int(parse_bits(t, "int")?)),
            t if t.starts_with("bytes") => {
                let n: usize = t[5..]
                    .parse()
                    .map_err(|_| FuzzError::Abi(format!("invalid bytesN type: {t}")))?;
                Ok(DataType::FixedBytes(n))
            }
            other => Err(FuzzError::Abi(format!("unsupported ABI type: {other}"))),
        }
    }

    /// Size, in bytes, of this type's slot inside a raw testcase buffer.
    pub fn slot_width(&self) -> usize {
        match self {
            DataType::Uint(_) | DataType::Int(_) | DataType::Address | DataType::Bool | DataType::FixedBytes(_) => WORD,
            DataType::Bytes | DataType::String => WORD + MAX_DYNAMIC_LEN,
            DataType::FixedArray(inner, n) => inner.slot_width() * n,
        }
    }

    fn random_into(&self, rng: &mut impl Rng, out: &mut Vec<u8>) {
        match self {
            DataType::Uint(_) | DataType::Int(_) => {
                let mut word = [0u8; WORD];
                rng.fill(&mut word);
                out.extend_from_slice(&word);
            }
            DataType::Address => {
                let mut word = [0u8; WORD];
                rng.fill(&mut word[12..32]);
                out.extend_from_slice(&word);
            }
            DataType::Bool => {
                let mut word = [0u8; WORD];
                word[31] = rng.gen_range(0..=1);
                out.extend_from_slice(&word);
            }
            DataType::FixedBytes(n) => {
                let mut word = [0u8; WORD];
                rng.fill(&mut word[..*n]);
                out.extend_from_slice(&word);
            }
            DataType::Bytes | DataType::String => {
                let len = rng.gen_range(0..=MAX_DYNAMIC_LEN) as u64;
                let mut len_word = [0u8; WORD];
                U256::from(len).to_big_endian(&mut len_word);
                out.extend_from_slice(&len_word);
                let mut payload = vec![0u8; MAX_DYNAMIC_LEN];
                rng.fill(payload.as_mut_slice());
                out.extend_from_slice(&payload);
            }
            DataType::FixedArray(inner, n) => {
                for _ in 0..*n {
                    inner.random_into(rng, out);
                }
            }
        }
    }

    /// Normalize a raw slot to its required width, padding with zero or
    /// truncating. Idempotent: re-normalizing an already-normalized slot
    /// returns it unchanged.
    fn postprocess(&self, raw: &[u8]) -> Vec<u8> {
        let width = self.slot_width();
        let mut buf = raw.to_vec();
        buf.resize(width, 0);
        match self {
            DataType::Address => {
                buf[..12].fill(0);
            }
            DataType::Bool => {
                buf[31] &= 1;
                buf[..31].fill(0);
            }
            DataType::Bytes | DataType::String => {
                let len = U256::from_big_endian(&buf[..WORD]);
                let capped = len.min(U256::from(MAX_DYNAMIC_LEN));
                let mut len_word = [0u8; WORD];
                capped.to_big_endian(&mut len_word);
                buf[..WORD].copy_from_slice(&len_word);
            }
            _ => {}
        }
        buf
    }

    /// Encode a normalized slot into standard Solidity ABI head/tail form.
    fn encode(&self, slot: &[u8]) -> Vec<u8> {
        match self {
            DataType::Bytes | DataType::String => {
                let len = U256::from_big_endian(&slot[..WORD]).as_usize().min(MAX_DYNAMIC_LEN);
                let mut out = slot[..WORD].to_vec();
                let mut data = slot[WORD..WORD + len].to_vec();
                let pad = (WORD - data.len() % WORD) % WORD;
                data.extend(std::iter::repeat(0).take(pad));
                out.extend(data);
                out
            }
            DataType::FixedArray(inner, n) => {
                let width = inner.slot_width();
                let mut out = Vec::new();
                for i in 0..*n {
                    out.extend(inner.encode(&slot[i * width..(i + 1) * width]));
                }
                out
            }
            _ => slot.to_vec(),
        }
    }
}

fn parse_bits(ty: &str, prefix: &str) -> Result<usize> {
    let rest = &ty[prefix.len()..];
    if rest.is_empty() {
        return Ok(256);
    }
    rest.parse()
        .map_err(|_| FuzzError::Abi(format!("invalid bit width in {ty}")))
}

/// Generate a fully random raw testcase buffer for `entries` (typically the
/// constructor followed by every non-constant function, in declaration
/// order), reserving `ACCOUNTS_PREFIX_LEN + BLOCK_PREFIX_LEN` leading bytes
/// for the caller/block prefix the executor injects into `Env` before
/// replaying the call sequence.
pub fn random_testcase(rng: &mut impl Rng, entries: &[&AbiEntry]) -> Vec<u8> {
    let mut out = vec![0u8; ACCOUNTS_PREFIX_LEN + BLOCK_PREFIX_LEN];
    rng.fill(out.as_mut_slice());
    for entry in entries {
        for ty in &entry.inputs {
            if let Ok(dt) = DataType::parse(ty) {
                dt.random_into(rng, &mut out);
            }
        }
    }
    out
}

/// Layout of one function's argument slots within the raw buffer.
pub struct Layout {
    pub types: Vec<DataType>,
    pub offset: usize,
}

impl Layout {
    pub fn new(entry: &AbiEntry, offset: usize) -> Result<Self> {
        let types = entry
            .inputs
            .iter()
            .map(|t| DataType::parse(t))
            .collect::<Result<Vec<_>>>()?;
        Ok(Layout { types, offset })
    }

    pub fn width(&self) -> usize {
        self.types.iter().map(DataType::slot_width).sum()
    }

    /// Normalize this layout's region of `buf` in place.
    pub fn postprocess(&self, buf: &mut [u8]) {
        let mut cursor = self.offset;
        for ty in &self.types {
            let w = ty.slot_width();
            if cursor + w > buf.len() {
                break;
            }
            let normalized = ty.postprocess(&buf[cursor..cursor + w]);
            buf[cursor..cursor + w].copy_from_slice(&normalized);
            cursor += w;
        }
    }

    /// Encode this layout's region of `buf` into calldata, prefixed with
    /// `selector` (empty for a constructor's trailing constructor args).
    pub fn encode(&self, buf: &[u8], selector: &[u8]) -> Vec<u8> {
        let mut heads = Vec::new();
        let mut cursor = self.offset;
        for ty in &self.types {
            let w = ty.slot_width();
            let slot = if cursor + w <= buf.len() { &buf[cursor..cursor + w] } else { &[][..] };
            heads.extend(ty.encode(slot));
            cursor += w;
        }
        let mut out = selector.to_vec();
        out.extend(heads);
        out
    }
}

/// Compute the sequential byte layout for the constructor followed by each
/// function in `entries`, after the fixed account/block prefix.
pub fn build_layouts(entries: &[&AbiEntry]) -> Result<Vec<Layout>> {
    let mut cursor = ACCOUNTS_PREFIX_LEN + BLOCK_PREFIX_LEN;
    let mut layouts = Vec::with_capacity(entries.len());
    for entry in entries {
        let layout = Layout::new(entry, cursor)?;
        cursor += layout.width();
        layouts.push(layout);
    }
    Ok(layouts)
}

/// Decode the two fixed caller addresses carried in the prefix.
pub fn decode_accounts(buf: &[u8]) -> (EVMAddress, EVMAddress) {
    let a = EVMAddress::from_slice(&buf[0..20]);
    let b = EVMAddress::from_slice(&buf[20..40]);
    (a, b)
}

/// Decode the block timestamp/number carried in the prefix.
pub fn decode_block(buf: &[u8]) -> (U256, U256) {
    let base = ACCOUNTS_PREFIX_LEN;
    let timestamp = U256::from_big_endian(&buf[base..base + 32]);
    let number = U256::from_big_endian(&buf[base + 32..base + 64]);
    (timestamp, number)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    #[test]
    fn test_parse_types() {
        assert_eq!(DataType::parse("uint256").unwrap(), DataType::Uint(256));
        assert_eq!(DataType::parse("uint").unwrap(), DataType::Uint(256));
        assert_eq!(DataType::parse("bytes32").unwrap(), DataType::FixedBytes(32));
        assert_eq!(DataType::parse("address[3]").unwrap(), DataType::FixedArray(Box::new(DataType::Address), 3));
        assert!(DataType::parse("uint256[]").is_err());
    }

    #[test]
    fn test_postprocess_idempotent() {
        let dt = DataType::Bool;
        let raw = vec![0xffu8; 32];
        let once = dt.postprocess(&raw);
        let twice = dt.postprocess(&once);
        assert_eq!(once, twice);
    }

    #[test]
    fn test_random_testcase_deterministic_layout() {
        let entry = AbiEntry {
            name: "f".to_string(),
            selector: [0; 4],
            inputs: vec!["uint256".to_string(), "address".to_string()],
            is_constant: false,
            is_payable: false,
            is_constructor: false,
        };
        let mut rng = rand::rngs::StdRng::seed_from_u64(1);
        let buf = random_testcase(&mut rng, &[&entry]);
        assert_eq!(buf.len(), ACCOUNTS_PREFIX_LEN + BLOCK_PREFIX_LEN + 64);
    }

    #[test]
    fn test_keccak_known_vector() {
        // keccak256("") = c5d2460186f7233c927e7db2dcc703c0e500b653ca82273b7bfad8045d85a47
        let digest = keccak256(b"");
        assert_eq!(
            hex::encode(digest),
            "c5d2460186f7233c927e7db2dcc703c0e500b653ca82273b7bfad8045d85a47"
        );
    }
}
