//! Experiment state and its on-disk store.
//!
//! Every mutation of the record goes through [`Experiment`], which persists
//! `<root>/<experiment_id>/info.json` after each change so an aborted run
//! still leaves its latest state behind.

use std::fs;
use std::path::{Path, PathBuf};

use serde::Serialize;
use serde_json::Value;
use tracing::debug;

use super::check::CheckOutcome;
use super::config::{ExperimentRecord, Phase};
use super::severity::Severity;
use crate::error::Result;

pub const INFO_FILE: &str = "info.json";

#[derive(Debug, Clone)]
pub struct ExperimentStore {
    root: PathBuf,
}

impl ExperimentStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        ExperimentStore { root: root.into() }
    }

    pub fn experiment_dir(&self, experiment_id: &str) -> PathBuf {
        self.root.join(experiment_id)
    }

    /// A fresh id derived from the wall clock, unique within this root.
    pub fn next_experiment_id(&self) -> String {
        let mut millis = chrono::Utc::now().timestamp_millis();
        while self.experiment_dir(&millis.to_string()).exists() {
            millis += 1;
        }
        millis.to_string()
    }

    pub fn save(&self, record: &ExperimentRecord) -> Result<()> {
        let dir = self.experiment_dir(&record.experiment_id);
        fs::create_dir_all(&dir)?;
        write_json(&dir.join(INFO_FILE), record)
    }

    pub fn load(&self, experiment_id: &str) -> Result<ExperimentRecord> {
        let text = fs::read_to_string(self.experiment_dir(experiment_id).join(INFO_FILE))?;
        Ok(serde_json::from_str(&text)?)
    }

    /// Write `<root>/<name>.json`.
    pub fn save_document<T: Serialize>(&self, name: &str, doc: &T) -> Result<()> {
        fs::create_dir_all(&self.root)?;
        write_json(&self.root.join(format!("{}.json", name)), doc)
    }
}

fn write_json<T: Serialize>(path: &Path, doc: &T) -> Result<()> {
    let text = serde_json::to_string_pretty(doc)?;
    fs::write(path, text)?;
    Ok(())
}

/// The single owner of a running experiment's record.
#[derive(Debug)]
pub struct Experiment {
    record: ExperimentRecord,
    store: ExperimentStore,
}

impl Experiment {
    pub fn new(mut record: ExperimentRecord, experiment_id: String, store: ExperimentStore) -> Self {
        record.experiment_id = experiment_id;
        record.result = Severity::Passed;
        record.phase = None;
        Experiment { record, store }
    }

    pub fn record(&self) -> &ExperimentRecord {
        &self.record
    }

    pub fn id(&self) -> &str {
        &self.record.experiment_id
    }

    pub fn result(&self) -> Severity {
        self.record.result
    }

    pub fn dir(&self) -> PathBuf {
        self.store.experiment_dir(&self.record.experiment_id)
    }

    pub fn persist(&self) -> Result<()> {
        self.store.save(&self.record)
    }

    pub fn enter(&mut self, phase: Phase) -> Result<()> {
        debug!(target: "chaos", "experiment {} enters {:?}", self.id(), phase);
        self.record.phase = Some(phase);
        self.persist()
    }

    /// Raise the result to at least `severity`. Never lowers it.
    pub fn escalate(&mut self, severity: Severity) -> Result<Severity> {
        self.record.result = self.record.result.more_severe(severity);
        self.persist()?;
        Ok(self.record.result)
    }

    /// Merge a check's outcome into `checks[index]` and escalate.
    pub fn record_check(&mut self, index: usize, outcome: CheckOutcome) -> Result<()> {
        if let Some(check) = self.record.checks.get_mut(index) {
            check.result = Some(outcome.result);
            for (key, value) in outcome.diagnostics {
                check.params.insert(key, value);
            }
        }
        self.escalate(outcome.result).map(|_| ())
    }

    /// Attach an extra top-level field to the record.
    pub fn annotate(&mut self, key: &str, value: Value) -> Result<()> {
        self.record.extra.insert(key.to_string(), value);
        self.persist()
    }

    /// Adopt the workload's post-processed record. Analysis may add detail
    /// but cannot lower the result or rename the experiment.
    pub fn absorb_analysis(&mut self, analyzed: ExperimentRecord) -> Result<()> {
        let floor = self.record.result;
        let experiment_id = std::mem::take(&mut self.record.experiment_id);
        self.record = analyzed;
        self.record.experiment_id = experiment_id;
        self.record.result = floor.more_severe(self.record.result);
        self.persist()
    }

    pub fn into_record(self) -> ExperimentRecord {
        self.record
    }
}
