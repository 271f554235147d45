//! Suite driver: loads a suite, validates every test up front, runs each
//! test `repeat` times and aggregates the verdicts.

use std::collections::{BTreeMap, HashSet};
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use super::config::{load_test, ExperimentRecord, SuiteConfig, SuiteOptions};
use super::experiment::ExperimentStore;
use super::runner::Orchestrator;
use super::scenario::Scenarios;
use super::severity::Severity;
use crate::error::{HarnessError, Result};
use crate::logging::ExperimentLogSink;

pub const LATEST: &str = "latest";

/// The persisted aggregate of one suite run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SuiteRecord {
    pub name: String,
    pub run_id: String,
    pub result: Severity,
    /// test name -> experiment id -> verdict
    pub test_runs: BTreeMap<String, BTreeMap<String, Severity>>,
}

impl SuiteRecord {
    pub fn new(name: impl Into<String>, run_id: impl Into<String>) -> Self {
        SuiteRecord {
            name: name.into(),
            run_id: run_id.into(),
            result: Severity::Passed,
            test_runs: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LoadedSuite {
    pub name: String,
    pub options: SuiteOptions,
    pub tests: Vec<ExperimentRecord>,
}

/// Load and validate a suite file. Test files are resolved against
/// `<suite dir>/tests/`.
pub fn load_suite(path: &Path, scenarios: &Scenarios, store: &ExperimentStore) -> Result<LoadedSuite> {
    let config = SuiteConfig::load(path)?;
    if config.tests.is_empty() {
        return Err(HarnessError::config(format!("suite {} has no tests", config.name)));
    }
    let tests_dir = path.parent().unwrap_or_else(|| Path::new(".")).join("tests");

    let mut names = HashSet::new();
    let mut tests = Vec::with_capacity(config.tests.len());
    for file in &config.tests {
        let test = load_test(&tests_dir.join(file), &config.settings.test)?;
        if !names.insert(test.name.clone()) {
            return Err(HarnessError::config(format!(
                "test name must be unique, {} has a duplicate",
                test.name
            )));
        }
        let scenario = scenarios
            .get(&test.scenario)
            .ok_or_else(|| HarnessError::config(format!("unknown scenario: {}", test.scenario)))?;
        Orchestrator::new(scenario, store.clone()).validate(&test)?;
        tests.push(test);
    }

    Ok(LoadedSuite {
        name: config.name,
        options: config.settings.suite,
        tests,
    })
}

/// Fold one repetition's verdicts into the suite result.
pub fn fold_repetition(current: Severity, runs: &[Severity], options: SuiteOptions) -> Severity {
    let most = runs.iter().fold(Severity::Passed, |acc, r| acc.more_severe(*r));
    let mut least = runs.iter().fold(Severity::Failed, |acc, r| acc.least_severe(*r));
    if most == Severity::Failed {
        least = Severity::Failed;
    }

    if options.ignore_transient_errors {
        if options.at_least_one_passes {
            current.more_severe(least)
        } else if least == Severity::Failed {
            Severity::Failed
        } else {
            current
        }
    } else {
        current.more_severe(most)
    }
}

pub struct SuiteDriver<'a> {
    scenarios: &'a Scenarios,
    store: ExperimentStore,
    log_sink: Option<ExperimentLogSink>,
}

impl<'a> SuiteDriver<'a> {
    pub fn new(scenarios: &'a Scenarios, store: ExperimentStore) -> Self {
        SuiteDriver {
            scenarios,
            store,
            log_sink: None,
        }
    }

    /// Mirror each experiment's logs into `<root>/<experiment_id>/log`.
    pub fn with_log_sink(mut self, sink: ExperimentLogSink) -> Self {
        self.log_sink = Some(sink);
        self
    }

    pub fn load(&self, path: &Path) -> Result<LoadedSuite> {
        load_suite(path, self.scenarios, &self.store)
    }

    /// Run every test `repeat` times. The aggregate is rewritten after each
    /// experiment. Returns [`HarnessError::ViolationHalt`] as soon as an
    /// experiment halts the run.
    pub fn run(&self, suite: &LoadedSuite, repeat: u32, run_id: &str) -> Result<SuiteRecord> {
        let mut record = SuiteRecord::new(&suite.name, run_id);

        for round in 0..repeat {
            info!(target: "chaos", "suite {} repetition {}/{}", suite.name, round + 1, repeat);
            let mut runs = Vec::with_capacity(suite.tests.len());
            for test in &suite.tests {
                let experiment_id = self.store.next_experiment_id();
                let outcome = self.run_one(test, &experiment_id);
                let result = match &outcome {
                    Ok(result) => *result,
                    Err(HarnessError::ViolationHalt { .. }) => Severity::Failed,
                    Err(_) => Severity::Unknown,
                };
                record
                    .test_runs
                    .entry(test.name.clone())
                    .or_default()
                    .insert(experiment_id, result);
                runs.push(result);
                self.save(&record)?;

                if let Err(e @ HarnessError::ViolationHalt { .. }) = outcome {
                    record.result = Severity::Failed;
                    self.save(&record)?;
                    return Err(e);
                }
            }
            record.result = fold_repetition(record.result, &runs, suite.options);
            self.save(&record)?;
        }
        info!(target: "chaos", "suite {} result: {}", suite.name, record.result);
        Ok(record)
    }

    fn run_one(&self, test: &ExperimentRecord, experiment_id: &str) -> Result<Severity> {
        if let Some(sink) = &self.log_sink {
            let path = self.store.experiment_dir(experiment_id).join("log");
            if let Err(e) = sink.attach(&path) {
                warn!(target: "chaos", "can't open {}: {}", path.display(), e);
            }
        }

        let scenario = self
            .scenarios
            .get(&test.scenario)
            .ok_or_else(|| HarnessError::config(format!("unknown scenario: {}", test.scenario)));
        let outcome = scenario.and_then(|scenario| {
            Orchestrator::new(scenario, self.store.clone())
                .execute(test.clone(), experiment_id.to_string())
                .map(|done| done.result)
        });
        if let Err(e) = &outcome {
            error!(target: "chaos", "test {} (experiment {}): {}", test.name, experiment_id, e);
        }

        if let Some(sink) = &self.log_sink {
            sink.detach();
        }
        outcome
    }

    fn save(&self, record: &SuiteRecord) -> Result<()> {
        self.store.save_document(&record.run_id, record)?;
        self.store.save_document(LATEST, record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chaos::severity::Severity::*;

    fn options(ignore_transient_errors: bool, at_least_one_passes: bool) -> SuiteOptions {
        SuiteOptions {
            ignore_transient_errors,
            at_least_one_passes,
        }
    }

    #[test]
    fn test_strict_mode_takes_the_worst() {
        assert_eq!(fold_repetition(Passed, &[Passed, Unknown, Passed], options(false, false)), Unknown);
        assert_eq!(fold_repetition(Hang, &[Passed], options(false, false)), Hang);
    }

    #[test]
    fn test_ignore_transient_errors_only_fails_on_failed() {
        let opts = options(true, false);
        assert_eq!(fold_repetition(Passed, &[Unknown, Hang], opts), Passed);
        assert_eq!(fold_repetition(Passed, &[Passed, Failed], opts), Failed);
    }

    #[test]
    fn test_at_least_one_passes_uses_the_best() {
        let opts = options(true, true);
        assert_eq!(fold_repetition(Passed, &[Unknown, Passed], opts), Passed);
        assert_eq!(fold_repetition(Passed, &[Unknown, Hang], opts), Unknown);
    }

    #[test]
    fn test_failed_run_poisons_the_best() {
        assert_eq!(fold_repetition(Passed, &[Passed, Failed], options(true, true)), Failed);
    }
}
