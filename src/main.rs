mod chaos;
mod cluster;
mod error;
mod logging;
mod oracle;
mod sim;
mod workload;

use std::fs::File;
use std::io::BufReader;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing::error;

use chaos::experiment::ExperimentStore;
use chaos::scenario::Scenarios;
use chaos::severity::Severity;
use chaos::suite::SuiteDriver;
use error::{HarnessError, Result};
use logging::{ExperimentLogSink, LogFormat};
use oracle::{FileLogSource, RereadPolicy};
use sim::SimScenario;

/// Exit status of a run halted by `exit_on_violation`.
const VIOLATION_EXIT_CODE: u8 = 42;

#[derive(Parser, Debug)]
#[command(name = "chaos")]
#[command(about = "Fault-injection experiments and write-consistency checks")]
#[command(version)]
struct Args {
    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Text, global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run every test of a suite
    Suite {
        /// Suite file; tests are resolved against `<suite dir>/tests/`
        #[arg(long)]
        suite: PathBuf,
        /// How many times to run the whole suite
        #[arg(long, default_value = "1")]
        repeat: u32,
        /// Name of the aggregate file written to the experiments root
        #[arg(long)]
        run_id: String,
        /// Experiments root
        #[arg(long, default_value = "experiments")]
        root: PathBuf,
    },
    /// Validate a workload log against a committed-log dump
    Check {
        /// Workload log (`thread \t delta_us \t cmd \t args...`)
        #[arg(long)]
        workload_log: PathBuf,
        /// Committed log dump (`offset \t key \t op`)
        #[arg(long)]
        committed_log: PathBuf,
    },
}

fn run_suite(suite: PathBuf, repeat: u32, run_id: String, root: PathBuf, sink: ExperimentLogSink) -> Result<Severity> {
    let mut scenarios = Scenarios::new();
    scenarios.add(Box::new(SimScenario::new()));

    let driver = SuiteDriver::new(&scenarios, ExperimentStore::new(root)).with_log_sink(sink);
    let loaded = driver.load(&suite)?;
    let record = driver.run(&loaded, repeat, &run_id)?;
    Ok(record.result)
}

// A dump is complete once read, so a single empty poll ends the reread.
fn run_check(workload_log: PathBuf, committed_log: PathBuf) -> Result<Severity> {
    let mut reader = BufReader::new(File::open(&workload_log)?);
    let mut source = FileLogSource::open(&committed_log)?;
    let policy = RereadPolicy {
        attempts: 1,
        poll_timeout: Duration::ZERO,
        empty_poll_backoff: Duration::ZERO,
    };
    let report = oracle::validate(&mut reader, &mut source, &policy);
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(report.result)
}

fn main() -> ExitCode {
    let args = Args::parse();
    let sink = ExperimentLogSink::new();
    if let Err(e) = logging::init(args.log_format, sink.clone()) {
        eprintln!("{}", e);
    }

    let outcome = match args.command {
        Command::Suite {
            suite,
            repeat,
            run_id,
            root,
        } => run_suite(suite, repeat, run_id, root, sink).map(|_| ExitCode::SUCCESS),
        Command::Check {
            workload_log,
            committed_log,
        } => run_check(workload_log, committed_log).map(|result| match result {
            Severity::Passed => ExitCode::SUCCESS,
            _ => ExitCode::FAILURE,
        }),
    };

    match outcome {
        Ok(code) => code,
        Err(HarnessError::ViolationHalt { experiment_id }) => {
            error!(target: "chaos", "halted on violation in experiment {}", experiment_id);
            ExitCode::from(VIOLATION_EXIT_CODE)
        }
        Err(e) => {
            error!(target: "chaos", "{}", e);
            ExitCode::FAILURE
        }
    }
}
