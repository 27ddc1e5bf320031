//! Run configuration: the CLI-equivalent settings the fuzz loop consumes,
//! decoupled from `clap` so library callers can construct one directly.

use std::path::PathBuf;
use std::time::Duration;

/// How the final report gets surfaced. Mirrors the original's TERMINAL /
/// JSON / BOTH reporter modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReporterMode {
    Terminal,
    #[default]
    Json,
    Both,
}

impl ReporterMode {
    pub fn from_str(s: &str) -> Result<Self, String> {
        match s.to_lowercase().as_str() {
            "terminal" => Ok(ReporterMode::Terminal),
            "json" => Ok(ReporterMode::Json),
            "both" => Ok(ReporterMode::Both),
            other => Err(format!("unknown reporter mode: {other}")),
        }
    }

    pub fn prints_terminal(&self) -> bool {
        matches!(self, ReporterMode::Terminal | ReporterMode::Both)
    }

    pub fn writes_json(&self) -> bool {
        matches!(self, ReporterMode::Json | ReporterMode::Both)
    }
}

/// Fuzzing strategy. Only AFL is implemented; the variant exists so the
/// CLI surface matches the original's reserved `--mode` option.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FuzzMode {
    #[default]
    Afl,
}

impl FuzzMode {
    pub fn from_str(s: &str) -> Result<Self, String> {
        match s.to_lowercase().as_str() {
            "afl" => Ok(FuzzMode::Afl),
            other => Err(format!("unknown fuzz mode: {other} (only \"afl\" is supported)")),
        }
    }
}

/// Everything one fuzz run needs, independent of how it was parsed.
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub contracts_folder: PathBuf,
    pub assets_folder: PathBuf,
    pub mode: FuzzMode,
    pub reporter: ReporterMode,
    pub duration: Duration,
    pub testcases_num: usize,
    pub attacker: String,
    pub prefuzz: bool,
    pub file: Option<PathBuf>,
    pub name: Option<String>,
    pub source: Option<PathBuf>,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            contracts_folder: PathBuf::from("contracts/"),
            assets_folder: PathBuf::from("assets/"),
            mode: FuzzMode::Afl,
            reporter: ReporterMode::Json,
            duration: Duration::from_secs(5),
            testcases_num: 1,
            attacker: "ReentrancyAttacker".to_string(),
            prefuzz: false,
            file: None,
            name: None,
            source: None,
        }
    }
}

impl RunConfig {
    #[cfg(test)]
    pub fn for_test() -> Self {
        Self { duration: Duration::from_millis(50), ..Self::default() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reporter_mode_from_str() {
        assert_eq!(ReporterMode::from_str("BOTH").unwrap(), ReporterMode::Both);
        assert!(ReporterMode::from_str("xml").is_err());
    }

    #[test]
    fn test_default_config_matches_documented_defaults() {
        let config = RunConfig::default();
        assert_eq!(config.duration, Duration::from_secs(5));
        assert_eq!(config.testcases_num, 1);
        assert_eq!(config.attacker, "ReentrancyAttacker");
        assert!(!config.prefuzz);
    }
}
