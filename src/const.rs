//! AFL-family tuning constants, grouped by the module that consumes them.

// src/mutator.rs
/// Maximum absolute value added/subtracted by the arithmetic mutation stages.
pub const ARITH_MAX: u64 = 35;
/// Minimum number of havoc-stage iterations per call.
pub const HAVOC_MIN: usize = 16;
/// Havoc stage applies 2^(1 + U(HAVOC_STACK_POW2)) stacked mutations.
pub const HAVOC_STACK_POW2: u32 = 7;
/// Number of splice attempts before giving up on finding a usable partner.
pub const SPLICE_CYCLES: usize = 15;
/// Deterministic-extras stages (dictionary overlay) never run more than this
/// many entries.
pub const MAX_DET_EXTRAS: usize = 200;
/// An effector map with more than this percentage of "interesting" bytes is
/// treated as fully interesting.
pub const EFF_MAX_PERC: usize = 90;
/// log2 of the effector-map block size (each block covers 2^this bytes).
pub const EFF_MAP_SCALE2: u32 = 4;

/// Interesting 8-bit values tried by the interest-substitution stage.
pub const INTERESTING_8: [i8; 9] = [-128, -1, 0, 1, 16, 32, 64, 100, 127];
/// Interesting 16-bit values (superset of [INTERESTING_8] widened).
pub const INTERESTING_16: [i16; 10] = [-32768, -129, 128, 255, 256, 512, 1000, 1024, 4096, 32767];
/// Interesting 32-bit values (superset of [INTERESTING_16] widened).
pub const INTERESTING_32: [i32; 8] = [
    -2147483648,
    -100663046,
    -32769,
    32768,
    65535,
    65536,
    100663045,
    2147483647,
];

// src/scheduler.rs
/// Branches with no observed hits for this many cycles stop receiving energy.
pub const STAGNATION_CYCLES: usize = 5;
/// Minimum executions/sec below which the scheduler treats the run as stalled.
pub const MIN_EXEC_SPEED: f64 = 10.0;

// src/branch.rs
/// Keywords whose presence in a JUMPI's source snippet marks it as a valid
/// control-flow branch.
pub const BRANCH_KEYWORDS: [&str; 5] = ["if", "while", "for", "require", "assert"];

// src/executor.rs
/// Prefix (pre-branch pc trail) entries beyond this pc are not recorded;
/// bounds the size of `branch_msg/prefix.json`.
pub const PREFIX_PC_CAP: usize = 8192;
/// Call depth at or beyond which a call back into the victim is treated as
/// a reentrancy hit.
pub const REENTRANCY_DEPTH: usize = 10;
/// Window (in instructions) within which a TIMESTAMP/NUMBER/BALANCE read
/// must be followed by a conditional jump to count as a dependency.
/// Compared with `<=`, so a jump exactly 8 instructions away still counts.
pub const ORACLE_WINDOW: usize = 8;
/// Maximum instruction gap between chained comparisons inside that window.
pub const ORACLE_COMPARISON_GAP: usize = 3;
