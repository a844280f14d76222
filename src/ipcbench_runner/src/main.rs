use clap::Parser;
use ipcbench::{
    calibrate::OverheadPolicy, BenchConfig, BenchError, Harness, Matrix, ResultReporter,
};
use ipcbench_port_std::StdPort;
use std::path::{Path, PathBuf};
use thiserror::Error;

mod report;
mod selection;

fn main() {
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or("ipcbench=info,ipcbench_runner=info"),
    )
    .init();

    if let Err(e) = main_inner() {
        log::error!("Command failed.\n{:?}", e);
        std::process::exit(1);
    }
}

#[derive(Error, Debug)]
enum MainError {
    #[error("Could not read the configuration file '{0}'.")]
    ReadConfig(PathBuf, #[source] std::io::Error),
    #[error("Could not parse the configuration file '{0}'.")]
    ParseConfig(PathBuf, #[source] toml::de::Error),
    #[error("No scenarios match the given filters.")]
    NoScenarios,
    #[error("Could not complete the benchmark run.")]
    Run(#[source] BenchError),
    #[error("{0} scenario(s) were not stable.")]
    Unstable(usize),
}

/// IPC latency benchmarks on the hosted simulated kernel
#[derive(Parser)]
#[command(version)]
struct Opt {
    /// Load the run parameters from a TOML file
    #[arg(short = 'c', long = "config")]
    config: Option<PathBuf>,
    /// Override the number of runs of every scenario
    #[arg(short = 'r', long = "runs")]
    runs: Option<usize>,
    /// Override the number of warmup iterations of every run
    #[arg(short = 'w', long = "warmups")]
    warmups: Option<u32>,
    /// Continue with unstable overhead measurements instead of aborting
    #[arg(long = "allow-unstable-overhead")]
    allow_unstable_overhead: bool,
    /// Exit with an error if any scenario is not stable
    #[arg(long = "require-stable")]
    require_stable: bool,
    /// Skip the null system call benchmark
    #[arg(long = "no-null-syscall")]
    no_null_syscall: bool,
    /// Log the samples of every scenario
    #[arg(short = 'v')]
    verbose: bool,
    /// Print the list of scenarios and exit
    #[arg(long = "list")]
    list: bool,
    /// If specified, only run scenarios containing this string in their
    /// names
    ///
    /// See the documentation of `ScenarioFilter::from_str` for full syntax.
    scenarios: Vec<selection::ScenarioFilter>,
}

fn load_config(path: &Path) -> Result<BenchConfig, MainError> {
    let text =
        std::fs::read_to_string(path).map_err(|e| MainError::ReadConfig(path.to_owned(), e))?;
    parse_config(path, &text)
}

fn parse_config(path: &Path, text: &str) -> Result<BenchConfig, MainError> {
    toml::from_str(text).map_err(|e| MainError::ParseConfig(path.to_owned(), e))
}

fn main_inner() -> anyhow::Result<()> {
    // Parse arguments
    let opt = Opt::parse();

    let mut config = match &opt.config {
        Some(path) => load_config(path)?,
        None => BenchConfig::default(),
    };
    if let Some(runs) = opt.runs {
        config.runs = runs;
    }
    if let Some(warmups) = opt.warmups {
        config.warmups = warmups;
    }
    if opt.allow_unstable_overhead {
        config.overhead_policy = OverheadPolicy::Tolerant;
    }
    if opt.no_null_syscall {
        config.null_syscall = false;
    }
    log::debug!("config = {:?}", config);

    // Select scenarios
    let filter = if opt.scenarios.is_empty() {
        selection::ScenarioFilter::Pass
    } else {
        selection::ScenarioFilter::Disjunction(opt.scenarios.clone())
    };
    let matrix = Matrix::standard(config.long_message_length).filter(|s| filter.matches(s));

    // If `--list` is specified, print the selected scenarios and exit
    if opt.list {
        for scenario in matrix.iter() {
            println!("{:40}{}", scenario.name, scenario.caption);
        }
        return Ok(());
    }

    if matrix.is_empty() {
        return Err(MainError::NoScenarios.into());
    }
    log::info!("Measuring {} scenario(s)", matrix.len());

    let mut harness = Harness::new(StdPort::new(), config);
    let results = harness.run(&matrix).map_err(MainError::Run)?;

    let mut reporter = report::LogReporter {
        verbose: opt.verbose,
    };
    reporter.report(&results);

    let num_unstable = results.unstable().count();
    if opt.require_stable && num_unstable > 0 {
        return Err(MainError::Unstable(num_unstable).into());
    }

    Ok(())
}
