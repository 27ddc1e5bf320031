//! Contract metadata: the immutable inputs to one fuzzing target.

use std::collections::HashMap;
use std::path::Path;

use serde::Deserialize;
use serde_json::Value;

use crate::error::{FuzzError, Result};
use crate::srcmap::{self, SourceRange};
use crate::types::EVMAddress;

/// One function or constructor entry from the contract's ABI JSON.
#[derive(Debug, Clone)]
pub struct AbiEntry {
    pub name: String,
    pub selector: [u8; 4],
    pub inputs: Vec<String>,
    pub is_constant: bool,
    pub is_payable: bool,
    pub is_constructor: bool,
}

/// Immutable per-contract inputs, loaded once and never mutated for the
/// lifetime of a fuzzing run.
#[derive(Debug, Clone)]
pub struct ContractInfo {
    pub name: String,
    pub is_main: bool,
    pub creation_code: Vec<u8>,
    pub runtime_code: Vec<u8>,
    pub creation_srcmap: Vec<SourceRange>,
    pub runtime_srcmap: Vec<SourceRange>,
    pub source: String,
    pub abi: Vec<AbiEntry>,
    pub constant_ranges: Vec<SourceRange>,
    pub deployed_address: EVMAddress,
}

impl ContractInfo {
    pub fn constructor(&self) -> Option<&AbiEntry> {
        self.abi.iter().find(|e| e.is_constructor)
    }

    pub fn functions(&self) -> impl Iterator<Item = &AbiEntry> {
        self.abi.iter().filter(|e| !e.is_constructor)
    }
}

#[derive(Debug, Deserialize)]
struct CombinedJson {
    contracts: HashMap<String, CombinedContract>,
    #[serde(rename = "sourceList")]
    source_list: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
struct CombinedContract {
    bin: String,
    #[serde(rename = "bin-runtime")]
    bin_runtime: String,
    srcmap: String,
    #[serde(rename = "srcmap-runtime")]
    srcmap_runtime: String,
    abi: Value,
}

/// Load every contract described by a `solc --combined-json
/// abi,bin,bin-runtime,srcmap,srcmap-runtime` document, concatenating
/// `sources` (one file's worth of Solidity text per entry in `sourceList`)
/// to resolve source map offsets against.
pub fn load_combined_json(path: &Path, sources: &str, main_contract: &str) -> Result<Vec<ContractInfo>> {
    let raw = std::fs::read_to_string(path)?;
    let parsed: CombinedJson = serde_json::from_str(&raw)?;

    let mut out = Vec::new();
    for (key, contract) in parsed.contracts {
        let name = key.rsplit(':').next().unwrap_or(&key).to_string();
        let creation_code = hex::decode(contract.bin.trim_start_matches("0x"))?;
        let runtime_code = hex::decode(contract.bin_runtime.trim_start_matches("0x"))?;
        let creation_srcmap = srcmap::decompress(&contract.srcmap)?;
        let runtime_srcmap = srcmap::decompress(&contract.srcmap_runtime)?;
        let abi = parse_abi(&contract.abi)?;

        out.push(ContractInfo {
            is_main: name == main_contract,
            name,
            creation_code,
            runtime_code,
            creation_srcmap,
            runtime_srcmap,
            source: sources.to_string(),
            abi,
            constant_ranges: Vec::new(),
            deployed_address: EVMAddress::zero(),
        });
    }

    if !out.iter().any(|c| c.is_main) {
        return Err(FuzzError::Config(format!("main contract {main_contract} not found")));
    }
    Ok(out)
}

fn parse_abi(value: &Value) -> Result<Vec<AbiEntry>> {
    let items = value
        .as_array()
        .ok_or_else(|| FuzzError::Abi("abi field is not an array".to_string()))?;

    let mut entries = Vec::new();
    for item in items {
        let kind = item.get("type").and_then(Value::as_str).unwrap_or("function");
        if kind != "function" && kind != "constructor" {
            continue;
        }
        let is_constructor = kind == "constructor";
        let name = item.get("name").and_then(Value::as_str).unwrap_or("").to_string();
        let inputs = item
            .get("inputs")
            .and_then(Value::as_array)
            .map(|args| {
                args.iter()
                    .filter_map(|a| a.get("type").and_then(Value::as_str).map(str::to_string))
                    .collect::<Vec<String>>()
            })
            .unwrap_or_default();
        let state_mutability = item.get("stateMutability").and_then(Value::as_str).unwrap_or("");
        let is_constant = state_mutability == "view" || state_mutability == "pure";
        let is_payable = state_mutability == "payable";
        let selector = selector_for(&name, &inputs);
        entries.push(AbiEntry {
            name,
            selector,
            inputs,
            is_constant,
            is_payable,
            is_constructor,
        });
    }
    Ok(entries)
}

/// 4-byte Keccak256 function selector of `name(type1,type2,...)`. Uses a
/// rolling-state sponge over raw bytes so the crate does not need a full
/// SHA3 implementation dependency beyond what's already pulled in by
/// downstream ABI encoding.
fn selector_for(name: &str, inputs: &[String]) -> [u8; 4] {
    let signature = format!("{}({})", name, inputs.join(","));
    let digest = keccak256(signature.as_bytes());
    [digest[0], digest[1], digest[2], digest[3]]
}

fn keccak256(data: &[u8]) -> [u8; 32] {
    crate::abi::keccak256(data)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_selector_transfer() {
        // transfer(address,uint256) => 0xa9059cbb
        let sel = selector_for("transfer", &["address".to_string(), "uint256".to_string()]);
        assert_eq!(hex::encode(sel), "a9059cbb");
    }
}
