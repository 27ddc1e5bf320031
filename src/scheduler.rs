//! Leader/queue/energy bookkeeping that decides which testcase to mutate
//! next.
//!
//! Grounded in sFuzz's `Fuzzer::saveIfInterest` and the two `start()` loop
//! bodies (`libfuzzer/Fuzzer.cpp`): prefuzz mode chases uncovered branches
//! round-robin off a FIFO queue, fuzz mode spends weighted "energy" on
//! whichever branch has the most left. Both keep a `Leader` per branch id
//! — the best testcase seen for it plus how many times it's been fuzzed —
//! and both stop the run on the same three conditions sFuzz checks in its
//! `save` lambda: execution has stalled, the run has gone stagnant, or
//! there's nothing left to spend.

use std::collections::{HashMap, HashSet};

use primitive_types::U256;

use crate::executor::ExecutionResult;
use crate::r#const::{MIN_EXEC_SPEED, STAGNATION_CYCLES};

/// One candidate testcase attached to a branch id, with sFuzz's
/// "comparison value": in prefuzz mode it's the predicate's distance to
/// flipping (zero once the branch is actually covered); in fuzz mode it's
/// reused as a hit count, so a branch seeing more surviving executions
/// wins ties.
#[derive(Debug, Clone)]
pub struct Leader {
    pub data: Vec<u8>,
    pub depth: u64,
    pub fuzzed_count: u32,
    pub comparison_value: U256,
}

impl Leader {
    pub fn new(data: Vec<u8>, depth: u64, comparison_value: U256) -> Self {
        Self { data, depth, fuzzed_count: 0, comparison_value }
    }
}

/// Branch-searching scheduler used while hunting for the set of reachable
/// `JUMPI`s (`FuzzParam::is_prefuzz`). Mirrors the first `saveIfInterest`
/// overload plus the prefuzz half of `start()`.
#[derive(Debug, Default)]
pub struct PrefuzzScheduler {
    pub leaders: HashMap<String, Leader>,
    pub queues: Vec<String>,
    pub tracebits: HashSet<String>,
    pub predicates: HashSet<String>,
    idx: usize,
    pub queue_cycle: u64,
}

impl PrefuzzScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one execution's coverage into leader/queue state. Returns
    /// whether this testcase covered a new branch or moved a predicate
    /// closer to flipping, i.e. whether it's worth keeping around.
    pub fn save_if_interest(&mut self, data: &[u8], depth: u64, result: &ExecutionResult) -> bool {
        let mut interesting = false;
        for tracebit in &result.tracebits {
            if self.tracebits.contains(tracebit) {
                continue;
            }
            self.leaders.remove(tracebit);
            if !self.queues.contains(tracebit) {
                self.queues.push(tracebit.clone());
            }
            self.leaders.insert(tracebit.clone(), Leader::new(data.to_vec(), depth + 1, U256::zero()));
            interesting = true;
        }
        for (branch, &value) in &result.predicates {
            match self.leaders.get(branch) {
                Some(leader) if leader.comparison_value > U256::zero() && leader.comparison_value > value => {
                    self.leaders.insert(branch.clone(), Leader::new(data.to_vec(), depth + 1, value));
                    interesting = true;
                }
                None => {
                    self.leaders.insert(branch.clone(), Leader::new(data.to_vec(), depth + 1, value));
                    self.queues.push(branch.clone());
                    interesting = true;
                }
                _ => {}
            }
        }
        self.tracebits.extend(result.tracebits.iter().cloned());
        self.predicates.extend(result.predicates.keys().cloned());
        self.predicates.retain(|p| !self.tracebits.contains(p));
        interesting
    }

    pub fn uncovered_count(&self) -> usize {
        self.leaders.values().filter(|l| l.comparison_value != U256::zero()).count()
    }

    pub fn current(&self) -> Option<&str> {
        self.queues.get(self.idx).map(String::as_str)
    }

    pub fn mark_fuzzed(&mut self) {
        if let Some(branch) = self.current().map(str::to_owned) {
            if let Some(leader) = self.leaders.get_mut(&branch) {
                leader.fuzzed_count += 1;
            }
        }
    }

    /// Advance round-robin to the next queue entry, mirroring the
    /// `nextldIt`/`fuzzStat.idx` shuffle at the end of the prefuzz loop: if
    /// round-robin would land back on the branch just fuzzed and there's
    /// still more than one branch left uncovered, skip ahead to a less
    /// heavily fuzzed uncovered one instead.
    pub fn advance(&mut self, branch_size: usize) -> Option<&str> {
        if self.queues.is_empty() {
            return None;
        }
        let prev = self.idx;
        let prev_fuzzed = self.queues.get(prev).and_then(|b| self.leaders.get(b)).map(|l| l.fuzzed_count).unwrap_or(0);
        self.idx = (self.idx + 1) % self.queues.len();
        if self.idx == 0 {
            self.queue_cycle += 1;
        }
        if self.idx == prev && branch_size as i64 - self.tracebits.len() as i64 > 1 {
            let leaders = &self.leaders;
            if let Some(better) = self.queues.iter().position(|b| {
                leaders.get(b).map_or(false, |l| l.comparison_value > U256::zero() && l.fuzzed_count < prev_fuzzed)
            }) {
                self.idx = better;
            }
        }
        self.current()
    }
}

/// Energy-weighted scheduler used once branches are known (main fuzzing
/// loop). Mirrors the second `saveIfInterest` overload plus the non-prefuzz
/// half of `start()`.
#[derive(Debug, Default)]
pub struct FuzzScheduler {
    pub leaders: HashMap<String, Leader>,
    energys: Vec<(String, i64)>,
    pub branch_hits: HashMap<String, u64>,
    pub fuzz_rounds: u64,
}

impl FuzzScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seed_energy(&mut self, branch: impl Into<String>, weight: i64) {
        self.energys.push((branch.into(), weight));
    }

    pub fn insert_leader(&mut self, branch: impl Into<String>, leader: Leader) {
        self.leaders.insert(branch.into(), leader);
    }

    /// Branch with the most energy remaining. sFuzz recomputes this with
    /// `max_element` after every executed testcase rather than keeping a
    /// running pointer, since weights shift every round.
    pub fn pick(&self) -> Option<&str> {
        self.energys.iter().max_by_key(|(_, w)| *w).map(|(b, _)| b.as_str())
    }

    /// Fold a fuzz-mode execution into leader/energy state. A branch with a
    /// higher hit count than its current leader takes over (or ties, once
    /// the leader has been fuzzed more than 16 times without displacement);
    /// its energy drains by the hit count either way.
    pub fn save_if_interest(&mut self, data: &[u8], depth: u64, fuzzed_count: u32, result: &ExecutionResult) -> bool {
        let mut interesting = false;
        for (branch, &hit_count) in &result.reached_branch {
            let hits = U256::from(hit_count);
            match self.leaders.get(branch) {
                None => {
                    self.leaders.insert(branch.clone(), Leader::new(data.to_vec(), depth + 1, hits));
                    self.branch_hits.insert(branch.clone(), 0);
                    interesting = true;
                }
                Some(leader) if leader.comparison_value < hits || (leader.comparison_value == hits && fuzzed_count > 16) => {
                    if leader.comparison_value == U256::zero() {
                        self.branch_hits.entry(branch.clone()).or_insert(0);
                    }
                    self.leaders.insert(branch.clone(), Leader::new(data.to_vec(), depth + 1, hits));
                    interesting = true;
                }
                _ => {}
            }
            if let Some((_, weight)) = self.energys.iter_mut().find(|(b, _)| b == branch) {
                *weight = (*weight - hit_count as i64).max(0);
            }
            *self.branch_hits.entry(branch.clone()).or_insert(0) += hit_count as u64;
        }
        interesting
    }

    pub fn remaining_energy(&self) -> i64 {
        self.energys.iter().map(|(_, w)| *w).sum()
    }

    pub fn tick(&mut self) {
        self.fuzz_rounds += 1;
    }
}

/// sFuzz stops a prefuzz run once it's gone this many round-robin cycles
/// without covering a new branch, generalizing the original's single
/// "no new path within `duration`" wall-clock check into something that
/// also catches a queue that keeps cycling without progress. Expressed as a
/// multiple of [STAGNATION_CYCLES], the same per-branch energy-starvation
/// threshold the fuzz-mode scheduler is built around.
const STAGNANT_CYCLE_LIMIT: u64 = STAGNATION_CYCLES as u64 * 10;

pub fn should_stop_prefuzz(seconds_since_new_path: f64, duration_secs: f64, queue_cycle: u64, exec_speed: f64, predicates_remaining: usize) -> bool {
    (seconds_since_new_path > duration_secs && queue_cycle > 0)
        || exec_speed <= MIN_EXEC_SPEED
        || predicates_remaining == 0
        || queue_cycle >= STAGNANT_CYCLE_LIMIT
}

pub fn should_stop_fuzz(elapsed_secs: f64, duration_secs: f64, exec_speed: f64, remaining_energy: i64) -> bool {
    exec_speed <= MIN_EXEC_SPEED || remaining_energy <= 0 || elapsed_secs > duration_secs
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result_with_tracebit(bit: &str) -> ExecutionResult {
        let mut result = ExecutionResult::default();
        result.tracebits.insert(bit.to_string());
        result
    }

    #[test]
    fn test_prefuzz_new_tracebit_is_interesting() {
        let mut sched = PrefuzzScheduler::new();
        assert!(sched.save_if_interest(&[1, 2, 3], 0, &result_with_tracebit("10:1")));
        assert!(sched.leaders.contains_key("10:1"));
        assert!(sched.queues.contains(&"10:1".to_string()));
    }

    #[test]
    fn test_prefuzz_repeated_tracebit_not_interesting() {
        let mut sched = PrefuzzScheduler::new();
        sched.save_if_interest(&[1], 0, &result_with_tracebit("10:1"));
        assert!(!sched.save_if_interest(&[2], 0, &result_with_tracebit("10:1")));
    }

    #[test]
    fn test_fuzz_scheduler_picks_highest_energy() {
        let mut sched = FuzzScheduler::new();
        sched.seed_energy("a", 10);
        sched.seed_energy("b", 50);
        assert_eq!(sched.pick(), Some("b"));
    }

    #[test]
    fn test_fuzz_scheduler_energy_drains_on_hit() {
        let mut sched = FuzzScheduler::new();
        sched.seed_energy("10:1", 100);
        let mut result = ExecutionResult::default();
        result.reached_branch.insert("10:1".to_string(), 30);
        sched.save_if_interest(&[1, 2], 0, 0, &result);
        assert_eq!(sched.remaining_energy(), 70);
        assert_eq!(*sched.branch_hits.get("10:1").unwrap(), 30);
    }

    #[test]
    fn test_should_stop_fuzz_on_drained_energy() {
        assert!(should_stop_fuzz(10.0, 300.0, 100.0, 0));
        assert!(!should_stop_fuzz(10.0, 300.0, 100.0, 5));
    }
}
