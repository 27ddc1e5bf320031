//! On-disk state shared across prefuzz/fuzz runs and the final report.
//!
//! Grounded in sFuzz's `Fuzzer::writePrefix`/`writeLeaders`/`readWeight`/
//! `readLeaders`/`writeStats` (`libfuzzer/Fuzzer.cpp`): `branch_msg/` holds
//! the branch inventory a prefuzz run discovers so a later fuzz run over
//! the same contract can skip re-discovering it, plus a seed leader
//! testcase per branch; `<contract>_report.json` is the final oracle
//! verdict. JSON throughout, via `serde`/`serde_json` like the rest of the
//! corpus's config and wire-format handling.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::oracle::{OracleReport, Vulnerability};
use crate::scheduler::{Leader, PrefuzzScheduler};

const BRANCH_MSG_DIR: &str = "branch_msg";

fn branch_msg_path(file: &str) -> PathBuf {
    Path::new(BRANCH_MSG_DIR).join(file)
}

fn read_json_map(path: &Path) -> serde_json::Map<String, serde_json::Value> {
    fs::read_to_string(path)
        .ok()
        .and_then(|s| serde_json::from_str::<serde_json::Value>(&s).ok())
        .and_then(|v| v.as_object().cloned())
        .unwrap_or_default()
}

fn write_json(path: &Path, value: &serde_json::Value) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, serde_json::to_string_pretty(value)?)
}

/// Persist this run's `pc -> prefix trail` map (`ExecutionResult::prefix_map`)
/// under `contract_name`, alongside the runtime bytecode it was found
/// against and the coverage percentage (in basis points) reached. Mirrors
/// `writePrefix`, keyed by contract instead of overwriting the file
/// wholesale so multiple contracts can share it.
pub fn write_prefix_map(contract_name: &str, prefix_map: &HashMap<String, Vec<usize>>, runtime_code_hex: &str, coverage_bp: usize) -> std::io::Result<()> {
    let path = branch_msg_path("prefix.json");
    let mut root = read_json_map(&path);
    let entry = serde_json::json!({
        "Prefix": prefix_map,
        "Code": runtime_code_hex,
        "Coverage": coverage_bp,
    });
    root.insert(contract_name.to_string(), entry);
    write_json(&path, &serde_json::Value::Object(root))
}

/// Persist one seed testcase per fully-covered branch (`comparison_value ==
/// 0`), hex-encoded, the way `writeLeaders` does.
pub fn write_leaders(contract_name: &str, scheduler: &PrefuzzScheduler) -> std::io::Result<()> {
    let path = branch_msg_path("leaders.json");
    let mut root = read_json_map(&path);

    let mut covered = serde_json::Map::new();
    for (branch, leader) in &scheduler.leaders {
        if leader.comparison_value.is_zero() {
            covered.insert(branch.clone(), serde_json::Value::String(hex::encode(&leader.data)));
        }
    }
    root.insert(contract_name.to_string(), serde_json::Value::Object(covered));
    write_json(&path, &serde_json::Value::Object(root))
}

/// Load the leader seed testcases a prior prefuzz run wrote for this
/// contract. Mirrors `readLeaders`.
pub fn read_leaders(contract_name: &str) -> std::io::Result<HashMap<String, Leader>> {
    let path = branch_msg_path("leaders.json");
    let root = read_json_map(&path);
    let obj = root.get(contract_name).and_then(|v| v.as_object()).cloned().unwrap_or_default();

    let mut leaders = HashMap::new();
    for (branch, value) in obj {
        let hex_str = value.as_str().unwrap_or_default();
        let data = hex::decode(hex_str).unwrap_or_default();
        leaders.insert(branch, Leader::new(data, 0, primitive_types::U256::zero()));
    }
    Ok(leaders)
}

/// Per-branch energy weights left over from a prior fuzz run, plus the
/// coverage percentage recorded alongside them. Mirrors `readWeight`;
/// unlike the original this returns `None` instead of exiting the process
/// when the file or entry is missing, leaving the caller to seed uniform
/// energy for a first run.
pub fn read_weight(contract_name: &str) -> Option<(usize, Vec<(String, i64)>)> {
    let path = branch_msg_path("weight.json");
    let root = read_json_map(&path);
    let entry = root.get(contract_name)?.as_object()?;
    let weights = entry.get("Weight")?.as_object()?;
    let coverage = entry.get("Coverage").and_then(|v| v.as_i64()).unwrap_or(0) as usize;

    let energys = weights
        .iter()
        .map(|(branch, weight)| (branch.clone(), weight.as_i64().unwrap_or(0)))
        .collect();
    Some((coverage, energys))
}

/// Snapshot a fuzz run's remaining per-branch energy and overall coverage
/// so a later invocation over this contract can resume from it via
/// [read_weight].
pub fn write_weight(contract_name: &str, weights: &[(String, i64)], coverage_bp: usize) -> std::io::Result<()> {
    let path = branch_msg_path("weight.json");
    let mut root = read_json_map(&path);
    let weight_obj: serde_json::Map<String, serde_json::Value> = weights.iter().map(|(b, w)| (b.clone(), serde_json::json!(w))).collect();
    let entry = serde_json::json!({
        "Weight": weight_obj,
        "Coverage": coverage_bp,
    });
    root.insert(contract_name.to_string(), entry);
    write_json(&path, &serde_json::Value::Object(root))
}

#[derive(Debug, Serialize, Deserialize)]
struct VulnerabilityReport {
    number: usize,
    #[serde(rename = "instruction distinction")]
    instruction_distinction: String,
    #[serde(rename = "test cases")]
    test_cases: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct RunReport {
    #[serde(rename = "totalExecs")]
    total_execs: u64,
    speed: f64,
    #[serde(rename = "queueCycles")]
    queue_cycles: u64,
    #[serde(rename = "uniqExceptions")]
    uniq_exceptions: usize,
    coverage: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    vulnerabilities: Option<HashMap<String, VulnerabilityReport>>,
}

/// Per-vulnerability hit count, flagged program counters, and a capped
/// sample of the testcases that first demonstrated each hit. Mirrors
/// `writeStats`'s `vulnerBranch`/`vulnerCase` bookkeeping, which the
/// original re-derives from `container.analyze()` every time a new
/// testcase improves on an earlier hit count for that category.
#[derive(Debug, Default)]
pub struct ReportAccumulator {
    hit_counts: HashMap<Vulnerability, usize>,
    distinctions: HashMap<Vulnerability, std::collections::HashSet<usize>>,
    sample_cases: HashMap<Vulnerability, Vec<String>>,
    max_cases_per_kind: usize,
}

impl ReportAccumulator {
    pub fn new(max_cases_per_kind: usize) -> Self {
        Self { max_cases_per_kind, ..Default::default() }
    }

    /// Fold one testcase's [OracleReport] in, recording it as a sample for
    /// any category it's the first (or a new) hit for.
    pub fn record(&mut self, report: &OracleReport, testcase_hex: &str) {
        for &kind in &Vulnerability::ALL {
            let pcs = report.distinctions.get(&kind);
            let new_hits = pcs.map_or(0, |p| p.len());
            if new_hits == 0 {
                continue;
            }
            let entry = self.hit_counts.entry(kind).or_insert(0);
            let grew = new_hits > *entry;
            *entry = new_hits;
            self.distinctions.entry(kind).or_default().extend(pcs.unwrap());
            if grew {
                let cases = self.sample_cases.entry(kind).or_default();
                if cases.len() < self.max_cases_per_kind {
                    cases.push(testcase_hex.to_string());
                }
            }
        }
    }

    fn into_vulnerabilities(self) -> HashMap<String, VulnerabilityReport> {
        let mut out = HashMap::new();
        for &kind in &Vulnerability::ALL {
            let number = self.hit_counts.get(&kind).copied().unwrap_or(0);
            let distinction = self
                .distinctions
                .get(&kind)
                .map(|pcs| {
                    let mut pcs: Vec<_> = pcs.iter().collect();
                    pcs.sort();
                    pcs.iter().map(|pc| format!("{pc:x}")).collect::<Vec<_>>().join(" ")
                })
                .unwrap_or_default();
            let test_cases = self.sample_cases.get(&kind).cloned().unwrap_or_default();
            out.insert(kind.label().to_string(), VulnerabilityReport { number, instruction_distinction: distinction, test_cases });
        }
        out
    }
}

/// Write `<contract>_report.json`, the final summary sFuzz's `writeStats`
/// produces at the end of a (non-prefuzz) run.
pub fn write_report(
    contract_name: &str,
    total_execs: u64,
    elapsed_secs: f64,
    queue_cycles: u64,
    uniq_exceptions: usize,
    coverage_bp: usize,
    vulnerabilities: Option<ReportAccumulator>,
) -> std::io::Result<()> {
    let path = PathBuf::from(format!("{contract_name}_report.json"));
    let report = RunReport {
        total_execs,
        speed: if elapsed_secs > 0.0 { total_execs as f64 / elapsed_secs } else { 0.0 },
        queue_cycles,
        uniq_exceptions,
        coverage: coverage_bp as f64 / 10_000.0,
        vulnerabilities: vulnerabilities.map(ReportAccumulator::into_vulnerabilities),
    };
    write_json(&path, &serde_json::to_value(&report)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oracle_event::OracleEvent;
    use crate::types::EVMAddress;

    #[test]
    fn test_report_accumulator_records_first_hit_as_sample() {
        let mut acc = ReportAccumulator::new(3);
        let mut report = OracleReport::default();
        report.hits.insert(Vulnerability::Overflow);
        report.distinctions.entry(Vulnerability::Overflow).or_default().insert(42);
        acc.record(&report, "deadbeef");
        let out = acc.into_vulnerabilities();
        let overflow = &out[Vulnerability::Overflow.label()];
        assert_eq!(overflow.number, 1);
        assert_eq!(overflow.test_cases, vec!["deadbeef".to_string()]);
    }

    #[test]
    fn test_report_accumulator_caps_sample_cases() {
        let mut acc = ReportAccumulator::new(1);
        for i in 0..5 {
            let mut report = OracleReport::default();
            report.distinctions.entry(Vulnerability::Reentrancy).or_default().insert(i);
            acc.record(&report, &format!("case{i}"));
        }
        let out = acc.into_vulnerabilities();
        assert_eq!(out[Vulnerability::Reentrancy.label()].test_cases.len(), 1);
    }

    #[test]
    fn test_oracle_event_unused_import_guard() {
        // keeps OracleEvent/EVMAddress imports meaningful if this module
        // grows direct event construction in future tests.
        let _ = OracleEvent::bare(0, 0, 0, EVMAddress::zero());
    }
}
