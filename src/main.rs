use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};

use sfuzz::config::{FuzzMode, ReporterMode, RunConfig};
use sfuzz::contract;
use sfuzz::fuzzer;
use sfuzz::logger;

#[derive(Parser)]
#[command(author, version, about = "Coverage-guided fuzzer for EVM smart contracts")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    Run(RunArgs),
}

#[derive(Parser, Debug)]
struct RunArgs {
    /// Directory of `solc --combined-json` output for the contracts under test.
    #[arg(long, default_value = "contracts/")]
    contracts_folder: PathBuf,

    /// Directory of attacker contracts (e.g. reentrancy harnesses).
    #[arg(long, default_value = "assets/")]
    assets_folder: PathBuf,

    /// Fuzzing strategy; only "afl" is implemented.
    #[arg(long, default_value = "afl")]
    mode: String,

    /// How the final report is surfaced: terminal, json, or both.
    #[arg(long, default_value = "json")]
    reporter: String,

    /// Termination threshold, in seconds.
    #[arg(long, default_value_t = 5)]
    duration: u64,

    /// Max sample testcases persisted per vulnerability kind.
    #[arg(long, default_value_t = 1)]
    testcases_num: usize,

    /// Name of the attacker contract class to deploy alongside the victim.
    #[arg(long, default_value = "ReentrancyAttacker")]
    attacker: String,

    /// Run branch discovery instead of the oracle-hunting loop.
    #[arg(long)]
    prefuzz: bool,

    /// Single-contract mode: combined-json file, overriding --contracts-folder.
    #[arg(long)]
    file: Option<PathBuf>,

    /// Single-contract mode: the contract name to fuzz within that file.
    #[arg(long)]
    name: Option<String>,

    /// Single-contract mode: path to the Solidity source the combined-json was compiled from.
    #[arg(long)]
    source: Option<PathBuf>,
}

impl TryFrom<RunArgs> for RunConfig {
    type Error = anyhow::Error;

    fn try_from(args: RunArgs) -> anyhow::Result<Self> {
        Ok(RunConfig {
            contracts_folder: args.contracts_folder,
            assets_folder: args.assets_folder,
            mode: FuzzMode::from_str(&args.mode).map_err(anyhow::Error::msg)?,
            reporter: ReporterMode::from_str(&args.reporter).map_err(anyhow::Error::msg)?,
            duration: Duration::from_secs(args.duration),
            testcases_num: args.testcases_num,
            attacker: args.attacker,
            prefuzz: args.prefuzz,
            file: args.file,
            name: args.name,
            source: args.source,
        })
    }
}

fn run(args: RunArgs) -> anyhow::Result<()> {
    let file = args.file.clone().ok_or_else(|| anyhow::anyhow!("--file is required (directory-of-contracts mode is not yet implemented)"))?;
    let name = args.name.clone().ok_or_else(|| anyhow::anyhow!("--name is required"))?;
    let source = args
        .source
        .clone()
        .map(std::fs::read_to_string)
        .transpose()?
        .unwrap_or_default();

    let config = RunConfig::try_from(args)?;
    let contracts = contract::load_combined_json(&file, &source, &name)?;
    let summary = fuzzer::run(&config, &contracts)?;

    if config.reporter.prints_terminal() {
        println!(
            "execs={} elapsed={:.1}s cycles={} exceptions={} coverage={:.2}%",
            summary.total_execs,
            summary.elapsed_secs,
            summary.queue_cycles,
            summary.uniq_exceptions,
            summary.coverage_bp as f64 / 100.0
        );
    }
    Ok(())
}

fn main() -> anyhow::Result<()> {
    logger::init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Run(args) => run(args),
    }
}
