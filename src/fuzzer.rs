//! Top-level orchestration: the prefuzz and fuzz loops that tie contract
//! loading, branch classification, execution, mutation, scheduling, and
//! persistence together.
//!
//! Grounded in sFuzz's `Fuzzer::start()` (`libfuzzer/Fuzzer.cpp`): one
//! `FuzzParam` bundles a contract pair plus an `isPrefuzz` flag, and the
//! two loop bodies below mirror its two `if (fuzzParam.isPrefuzz)`
//! branches. Everything upstream of a single `exec()` call — contract
//! loading, branch classification, dictionary extraction — is computed
//! once per [Target] and reused across the whole run.

use std::time::Instant;

use primitive_types::U256;
use rand::Rng;

use crate::abi::{self, Layout};
use crate::branch::{self, BranchSets};
use crate::bytecode;
use crate::config::RunConfig;
use crate::contract::{AbiEntry, ContractInfo};
use crate::error::{FuzzError, Result};
use crate::evm::EvmAdapter;
use crate::executor::{self, ExecutionResult};
use crate::mutator::{self, EffectorMap};
use crate::oracle;
use crate::persist::{self, ReportAccumulator};
use crate::r#const::MIN_EXEC_SPEED;
use crate::scheduler::{self, FuzzScheduler, Leader, PrefuzzScheduler};
use crate::types;

/// Everything derived once from a victim [ContractInfo] and reused across
/// every testcase execution for the lifetime of a run.
struct Target<'a> {
    contract: &'a ContractInfo,
    entries: Vec<&'a AbiEntry>,
    layouts: Vec<Layout>,
    creation_branches: BranchSets,
    runtime_branches: BranchSets,
    dict: Vec<Vec<u8>>,
}

impl<'a> Target<'a> {
    fn build(contract: &'a ContractInfo) -> Result<Self> {
        let mut entries: Vec<&AbiEntry> = Vec::new();
        if let Some(ctor) = contract.constructor() {
            entries.push(ctor);
        }
        entries.extend(contract.functions());
        let layouts = abi::build_layouts(&entries)?;
        let creation_branches = branch::classify(&contract.creation_code, &contract.creation_srcmap, &contract.source, &contract.constant_ranges);
        let runtime_branches = branch::classify(&contract.runtime_code, &contract.runtime_srcmap, &contract.source, &contract.constant_ranges);

        let mut dict: Vec<Vec<u8>> = bytecode::find_constants(&contract.runtime_code).into_iter().collect();
        dict.extend(bytecode::find_constants(&contract.creation_code));

        Ok(Self { contract, entries, layouts, creation_branches, runtime_branches, dict })
    }

    fn branch_count(&self) -> usize {
        self.creation_branches.jumpi.len() + self.runtime_branches.jumpi.len()
    }

    fn postprocess(&self, buf: &mut [u8]) {
        for layout in &self.layouts {
            layout.postprocess(buf);
        }
    }

    /// Normalize a splice-doubled buffer: each `half_len`-wide half is its
    /// own well-formed testcase, so every layout is applied twice, once at
    /// its normal offset and once shifted into the second half.
    fn postprocess_spliced(&self, buf: &mut [u8], half_len: usize) {
        for layout in &self.layouts {
            layout.postprocess(buf);
            let shifted = Layout { types: layout.types.clone(), offset: layout.offset + half_len };
            shifted.postprocess(buf);
        }
    }

    fn run_exec(&self, adapter: &mut EvmAdapter, testcase: &[u8], is_prefuzz: bool) -> ExecutionResult {
        executor::exec(
            adapter,
            self.contract,
            &self.creation_branches,
            &self.runtime_branches,
            &self.entries,
            &self.layouts,
            testcase,
            is_prefuzz,
        )
    }

    /// Replays a splice-doubled testcase as a single deploy followed by two
    /// sequential rounds of function calls, matching sFuzz's
    /// `transactionLength = 2` splice replay.
    fn run_spliced_exec(&self, adapter: &mut EvmAdapter, testcase: &[u8], half_len: usize, is_prefuzz: bool) -> ExecutionResult {
        executor::exec_spliced(
            adapter,
            self.contract,
            &self.creation_branches,
            &self.runtime_branches,
            &self.entries,
            &self.layouts,
            testcase,
            half_len,
            is_prefuzz,
        )
    }
}

/// One candidate buffer produced by [fuzz_one], tagged with whether it's a
/// normal single-call testcase or a splice-doubled two-call one.
enum Candidate {
    Simple(Vec<u8>),
    Spliced { data: Vec<u8>, half_len: usize },
}

/// Outcome of running the fuzz loop once, independent of which mode it
/// ran in — enough for `main` to decide an exit code and, in fuzz mode,
/// to print a terminal summary.
#[derive(Debug)]
pub struct RunSummary {
    pub total_execs: u64,
    pub elapsed_secs: f64,
    pub queue_cycles: u64,
    pub uniq_exceptions: usize,
    pub coverage_bp: usize,
}

/// Deploy the attacker contract (if present) so later calls against the
/// victim can trigger reentrancy back into it. The victim itself is
/// (re)deployed once per testcase inside `executor::exec`, matching how
/// sFuzz re-runs the constructor every call rather than keeping one
/// persistent deployment across the whole run.
fn bootstrap_evm(attacker: Option<&ContractInfo>) -> EvmAdapter {
    let mut adapter = EvmAdapter::new();
    if let Some(attacker) = attacker {
        let deployer = types::attacker_address();
        adapter.set_balance(deployer, U256::from(10u64).pow(U256::from(21)));
        adapter.deploy(deployer, types::attacker_address(), attacker.creation_code.clone(), U256::zero(), |_| {});
    }
    adapter
}

/// Run one leader through the mutation stages its `fuzzed_count` calls
/// for — full deterministic walk plus havoc on a never-fuzzed leader,
/// havoc plus splice otherwise — feeding each candidate to `on_candidate`.
fn fuzz_one<F>(target: &Target, rng: &mut impl Rng, leader: &Leader, splice_candidates: &[Vec<u8>], mut on_candidate: F)
where
    F: FnMut(Candidate),
{
    let mut emit = |buf: &[u8]| {
        let mut candidate = buf.to_vec();
        target.postprocess(&mut candidate);
        on_candidate(Candidate::Simple(candidate));
    };

    if leader.fuzzed_count == 0 {
        let eff = EffectorMap::all_effective(leader.data.len());
        mutator::deterministic_stages(&leader.data, &eff, &target.dict, &mut emit);
    }
    emit(&mutator::havoc(&leader.data, &target.dict, rng));

    if let Some(spliced) = mutator::splice(&leader.data, splice_candidates, rng) {
        let half_len = spliced.len() / 2;
        let mut candidate = mutator::havoc(&spliced, &target.dict, rng);
        target.postprocess_spliced(&mut candidate, half_len);
        on_candidate(Candidate::Spliced { data: candidate, half_len });
    }
}

/// Branch-discovery loop. Mirrors the prefuzz half of `Fuzzer::start()`:
/// round-robins the queue, mutating each uncovered leader until no new
/// branch or predicate improvement has shown up for a full cycle, the
/// execution rate collapses, or every predicate has flipped to a
/// tracebit. Persists `branch_msg/prefix.json` and
/// `branch_msg/leaders.json` on exit.
pub fn run_prefuzz(config: &RunConfig, victim: &ContractInfo, attacker: Option<&ContractInfo>) -> Result<RunSummary> {
    let target = Target::build(victim)?;
    let mut adapter = bootstrap_evm(attacker);
    let mut rng = rand::thread_rng();
    let mut sched = PrefuzzScheduler::new();

    let seed = abi::random_testcase(&mut rng, &target.entries);
    let seed_result = target.run_exec(&mut adapter, &seed, true);
    sched.save_if_interest(&seed, 0, &seed_result);

    let start = Instant::now();
    let mut last_new_path = Instant::now();
    let mut total_execs: u64 = 1;
    let mut uniq_exceptions = std::collections::HashSet::new();
    let mut prefix_map = seed_result.prefix_map.clone();
    uniq_exceptions.extend(seed_result.unique_exceptions.iter().copied());

    loop {
        let elapsed = start.elapsed().as_secs_f64();
        let since_new_path = last_new_path.elapsed().as_secs_f64();
        let exec_speed = if elapsed > 0.0 { total_execs as f64 / elapsed } else { MIN_EXEC_SPEED + 1.0 };
        if scheduler::should_stop_prefuzz(since_new_path, config.duration.as_secs_f64(), sched.queue_cycle, exec_speed, sched.uncovered_count()) {
            break;
        }

        let Some(branch) = sched.current().map(str::to_owned) else { break };
        let Some(leader) = sched.leaders.get(&branch).cloned() else {
            sched.advance(target.branch_count());
            continue;
        };
        if leader.comparison_value.is_zero() {
            sched.advance(target.branch_count());
            continue;
        }

        let mut found_new_path = false;
        let splice_candidates: Vec<Vec<u8>> = sched.leaders.values().filter(|l| l.data != leader.data).map(|l| l.data.clone()).collect();
        fuzz_one(&target, &mut rng, &leader, &splice_candidates, |candidate| {
            let (data, result) = match candidate {
                Candidate::Simple(data) => {
                    let result = target.run_exec(&mut adapter, &data, true);
                    (data, result)
                }
                Candidate::Spliced { data, half_len } => {
                    let result = target.run_spliced_exec(&mut adapter, &data, half_len, true);
                    (data, result)
                }
            };
            total_execs += 1;
            uniq_exceptions.extend(result.unique_exceptions.iter().copied());
            for (branch_id, trail) in &result.prefix_map {
                prefix_map.entry(branch_id.clone()).or_insert_with(|| trail.clone());
            }
            if sched.save_if_interest(&data, leader.depth, &result) {
                found_new_path = true;
            }
        });
        if found_new_path {
            last_new_path = Instant::now();
        }
        sched.mark_fuzzed();
        sched.advance(target.branch_count());
    }

    let coverage_bp = if target.branch_count() > 0 { sched.tracebits.len() * 10_000 / target.branch_count() } else { 0 };
    persist::write_prefix_map(&victim.name, &prefix_map, &hex::encode(&victim.runtime_code), coverage_bp)?;
    persist::write_leaders(&victim.name, &sched)?;

    Ok(RunSummary {
        total_execs,
        elapsed_secs: start.elapsed().as_secs_f64(),
        queue_cycles: sched.queue_cycle,
        uniq_exceptions: uniq_exceptions.len(),
        coverage_bp,
    })
}

/// Oracle-hunting loop over a pre-discovered branch skeleton. Mirrors the
/// non-prefuzz half of `Fuzzer::start()`: picks the highest-energy branch
/// each round, spends a deterministic pass on a never-fuzzed leader or
/// havoc+splice otherwise, and folds every call's oracle verdict into the
/// final report.
pub fn run_fuzz(config: &RunConfig, victim: &ContractInfo, attacker: Option<&ContractInfo>) -> Result<RunSummary> {
    let target = Target::build(victim)?;
    let mut adapter = bootstrap_evm(attacker);
    let mut rng = rand::thread_rng();
    let mut sched = FuzzScheduler::new();

    let (prior_coverage_bp, weights) = persist::read_weight(&victim.name)
        .ok_or_else(|| FuzzError::MissingWeightFile(format!("branch_msg/weight.json has no entry for {}", victim.name)))?;
    for (branch, weight) in &weights {
        sched.seed_energy(branch.clone(), *weight);
    }
    for (branch, leader) in persist::read_leaders(&victim.name)? {
        sched.insert_leader(branch, leader);
    }

    let start = Instant::now();
    let mut total_execs: u64 = 0;
    let mut uniq_exceptions = std::collections::HashSet::new();
    let mut report = ReportAccumulator::new(config.testcases_num);

    loop {
        let elapsed = start.elapsed().as_secs_f64();
        let exec_speed = if elapsed > 0.0 { total_execs as f64 / elapsed } else { MIN_EXEC_SPEED + 1.0 };
        if scheduler::should_stop_fuzz(elapsed, config.duration.as_secs_f64(), exec_speed, sched.remaining_energy()) {
            break;
        }

        let Some(branch) = sched.pick().map(str::to_owned) else { break };
        let leader = sched
            .leaders
            .get(&branch)
            .cloned()
            .unwrap_or_else(|| Leader::new(abi::random_testcase(&mut rng, &target.entries), 0, U256::zero()));
        let splice_candidates: Vec<Vec<u8>> = sched.leaders.values().filter(|l| l.data != leader.data).map(|l| l.data.clone()).collect();

        fuzz_one(&target, &mut rng, &leader, &splice_candidates, |candidate| {
            let (data, result) = match candidate {
                Candidate::Simple(data) => {
                    let result = target.run_exec(&mut adapter, &data, false);
                    (data, result)
                }
                Candidate::Spliced { data, half_len } => {
                    let result = target.run_spliced_exec(&mut adapter, &data, half_len, false);
                    (data, result)
                }
            };
            total_execs += 1;
            uniq_exceptions.extend(result.unique_exceptions.iter().copied());
            let oracle_report = oracle::analyze(&result);
            if !oracle_report.hits.is_empty() {
                report.record(&oracle_report, &hex::encode(&data));
            }
            sched.save_if_interest(&data, leader.depth, leader.fuzzed_count, &result);
        });
        sched.tick();
        if let Some(l) = sched.leaders.get_mut(&branch) {
            l.fuzzed_count += 1;
        }
    }

    let remaining: Vec<(String, i64)> = weights
        .iter()
        .map(|(b, w)| (b.clone(), sched.branch_hits.get(b).map_or(*w, |hits| (*w - *hits as i64).max(0))))
        .collect();
    persist::write_weight(&victim.name, &remaining, prior_coverage_bp)?;

    let summary = RunSummary {
        total_execs,
        elapsed_secs: start.elapsed().as_secs_f64(),
        queue_cycles: sched.fuzz_rounds,
        uniq_exceptions: uniq_exceptions.len(),
        coverage_bp: prior_coverage_bp,
    };
    persist::write_report(
        &victim.name,
        summary.total_execs,
        summary.elapsed_secs,
        summary.queue_cycles,
        summary.uniq_exceptions,
        summary.coverage_bp,
        Some(report),
    )?;
    Ok(summary)
}

/// Entry point used by `main`: dispatches to [run_prefuzz] or [run_fuzz]
/// depending on `config.prefuzz`, against whichever contract in
/// `contracts` is marked as the main one.
pub fn run(config: &RunConfig, contracts: &[ContractInfo]) -> Result<RunSummary> {
    let victim = contracts
        .iter()
        .find(|c| c.is_main)
        .ok_or_else(|| FuzzError::Config("no main contract marked in loaded set".to_string()))?;
    let attacker = contracts.iter().find(|c| c.name == config.attacker);

    if config.prefuzz {
        run_prefuzz(config, victim, attacker)
    } else {
        run_fuzz(config, victim, attacker)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::srcmap::SourceRange;

    fn abi_entry(name: &str, inputs: &[&str]) -> AbiEntry {
        AbiEntry {
            name: name.to_string(),
            selector: [0; 4],
            inputs: inputs.iter().map(|s| s.to_string()).collect(),
            is_constant: false,
            is_payable: false,
            is_constructor: false,
        }
    }

    fn trivial_contract() -> ContractInfo {
        ContractInfo {
            name: "T".to_string(),
            is_main: true,
            creation_code: hex::decode("6000600055").unwrap(),
            runtime_code: hex::decode("60006000556000").unwrap(),
            creation_srcmap: vec![SourceRange { offset: 0, length: 1 }; 3],
            runtime_srcmap: vec![SourceRange { offset: 0, length: 1 }; 4],
            source: String::new(),
            abi: vec![abi_entry("f", &["uint256"])],
            constant_ranges: vec![],
            deployed_address: types::victim_address(),
        }
    }

    #[test]
    fn test_target_build_layouts_cover_every_entry() {
        let contract = trivial_contract();
        let target = Target::build(&contract).unwrap();
        assert_eq!(target.layouts.len(), target.entries.len());
    }

    #[test]
    fn test_run_prefuzz_executes_without_panicking() {
        let contract = trivial_contract();
        let config = RunConfig {
            duration: std::time::Duration::from_millis(20),
            prefuzz: true,
            ..RunConfig::for_test()
        };
        let summary = run_prefuzz(&config, &contract, None).unwrap();
        assert!(summary.total_execs >= 1);
    }
}
