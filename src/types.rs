/// Common EVM-sized integer/address aliases shared across the crate.
use primitive_types::{H160, H256, U256, U512};

pub type EVMAddress = H160;
pub type EVMU256 = U256;

/// convert array of 20x u8 to H160
pub fn convert_h160(v: [u8; 20]) -> H160 {
    v.into()
}

/// convert U256 to H160 by taking the last 20 bytes
pub fn convert_u256_to_h160(v: U256) -> H160 {
    let mut temp = H256::zero();
    v.to_big_endian(temp.as_bytes_mut());
    temp.into()
}

/// widen a U256 to U512, used by the overflow oracle to compare wide vs.
/// narrow arithmetic results
pub fn widen(v: U256) -> U512 {
    U512::from(v)
}

/// build a fixed address from a hex string, right-aligned to 20 bytes
pub fn fixed_address(s: &str) -> H160 {
    let bytes = hex::decode(s).expect("fixed_address: invalid hex");
    let mut address = H160::zero();
    let len = bytes.len().min(20);
    address.0[20 - len..].copy_from_slice(&bytes[bytes.len() - len..]);
    address
}

/// address of the contract under test, matching the attacker convention
/// used throughout the fuzzing harness
pub fn victim_address() -> H160 {
    fixed_address("f1f1f1f1f1f1f1f1f1f1f1f1f1f1f1f1f1f1f1f1")
}

/// address of the attacker contract used to trigger reentrancy
pub fn attacker_address() -> H160 {
    fixed_address("f0f0f0f0f0f0f0f0f0f0f0f0f0f0f0f0f0f0f0f0")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_address() {
        let addr = fixed_address("f1f1f1f1f1f1f1f1f1f1f1f1f1f1f1f1f1f1f1f1");
        assert_eq!(addr, victim_address());
    }

    #[test]
    fn test_convert_u256_to_h160() {
        let v = U256::from(0x1234u64);
        let addr = convert_u256_to_h160(v);
        assert_eq!(addr, H160::from_low_u64_be(0x1234));
    }
}
