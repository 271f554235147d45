//! Test and suite configuration documents.
//!
//! An experiment record is the test's configuration document plus the
//! result fields filled in while it runs. Unknown fields are preserved so
//! workload-specific analysis can read and extend them.

use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

use super::fault::FaultType;
use super::severity::Severity;
use crate::error::{HarnessError, Result};

/// Name of the built-in pseudo-check evaluated by the orchestrator itself.
pub const PROGRESS_DURING_FAULT: &str = "progress_during_fault";

/// Where an experiment is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Deploying,
    Steady,
    Injecting,
    Impact,
    Healing,
    Recovery,
    Checking,
    Analyzing,
    Done,
    Aborted,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkloadConfig {
    pub name: String,
    #[serde(flatten)]
    pub params: Map<String, Value>,
}

impl WorkloadConfig {
    /// Topic the workload writes to.
    pub fn topic(&self) -> &str {
        self.params.get("topic").and_then(Value::as_str).unwrap_or("chaos")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FaultConfig {
    pub name: String,
    #[serde(flatten)]
    pub params: Map<String, Value>,
}

impl FaultConfig {
    pub fn named(name: impl Into<String>) -> Self {
        FaultConfig {
            name: name.into(),
            params: Map::new(),
        }
    }
}

/// A fault may be given as a bare name or as an object with parameters.
#[derive(Deserialize)]
#[serde(untagged)]
enum FaultSpec {
    Name(String),
    Full(FaultConfig),
}

fn deserialize_fault<'de, D>(deserializer: D) -> std::result::Result<Option<FaultConfig>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<FaultSpec>::deserialize(deserializer)?.map(|spec| match spec {
        FaultSpec::Name(name) => FaultConfig::named(name),
        FaultSpec::Full(config) => config,
    }))
}

/// A requested check. Its outcome is merged back into `result` and `params`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckConfig {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Severity>,
    #[serde(flatten)]
    pub params: Map<String, Value>,
}

impl CheckConfig {
    pub fn named(name: impl Into<String>) -> Self {
        CheckConfig {
            name: name.into(),
            result: None,
            params: Map::new(),
        }
    }

    pub fn is_progress_during_fault(&self) -> bool {
        self.name == PROGRESS_DURING_FAULT
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub steady_s: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub impact_s: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recovery_s: Option<u64>,
    #[serde(default)]
    pub remove_logs_on_success: bool,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Phase waits for one experiment. Zero skips the wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhaseDurations {
    pub steady: Duration,
    pub impact: Duration,
    pub recovery: Duration,
}

impl Settings {
    pub fn durations(&self, fault_type: Option<FaultType>) -> PhaseDurations {
        let (steady, impact, recovery) = match fault_type {
            None => (180, 0, 0),
            Some(FaultType::Recoverable) => (60, 60, 60),
            Some(FaultType::OneOff) => (60, 0, 120),
        };
        PhaseDurations {
            steady: Duration::from_secs(self.steady_s.unwrap_or(steady)),
            impact: Duration::from_secs(self.impact_s.unwrap_or(impact)),
            recovery: Duration::from_secs(self.recovery_s.unwrap_or(recovery)),
        }
    }
}

/// The persisted state of one test execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentRecord {
    pub name: String,
    pub scenario: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub experiment_id: String,
    pub workload: WorkloadConfig,
    #[serde(default, deserialize_with = "deserialize_fault")]
    pub fault: Option<FaultConfig>,
    #[serde(default)]
    pub checks: Vec<CheckConfig>,
    #[serde(default)]
    pub settings: Settings,
    #[serde(default)]
    pub exit_on_violation: bool,
    #[serde(default)]
    pub result: Severity,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<Phase>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// How per-node verdicts of the progress check combine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Selector {
    /// Every node must keep making progress.
    All,
    /// One node making progress is enough.
    Any,
}

/// Parameters of the progress-during-fault check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgressParams {
    pub selector: Selector,
    pub min_delta: i64,
}

impl ProgressParams {
    pub fn from_check(check: &CheckConfig) -> Result<Self> {
        let selector = match check.params.get("selector") {
            None => Selector::All,
            Some(Value::String(s)) if s == "all" => Selector::All,
            Some(Value::String(s)) if s == "any" => Selector::Any,
            Some(other) => {
                return Err(HarnessError::config(format!(
                    "unknown selector value for {}: {}",
                    PROGRESS_DURING_FAULT, other
                )))
            }
        };
        let min_delta = check
            .params
            .get("min-delta")
            .and_then(Value::as_i64)
            .filter(|d| *d >= 0)
            .ok_or_else(|| {
                HarnessError::config(format!("{} requires a non-negative integer min-delta", PROGRESS_DURING_FAULT))
            })?;
        Ok(ProgressParams { selector, min_delta })
    }
}

/// Suite-level switches.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SuiteOptions {
    #[serde(default)]
    pub ignore_transient_errors: bool,
    #[serde(default)]
    pub at_least_one_passes: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SuiteSettings {
    /// Merged into every test's `settings`, overriding the test's values.
    #[serde(default)]
    pub test: Map<String, Value>,
    #[serde(default)]
    pub suite: SuiteOptions,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SuiteConfig {
    pub name: String,
    /// Test files, relative to `<suite dir>/tests/`.
    pub tests: Vec<String>,
    #[serde(default)]
    pub settings: SuiteSettings,
}

impl SuiteConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }
}

/// Load a test file, applying suite-wide setting overrides.
pub fn load_test(path: &Path, overrides: &Map<String, Value>) -> Result<ExperimentRecord> {
    let text = fs::read_to_string(path)?;
    let value: Value = serde_json::from_str(&text)?;
    test_from_value(value, overrides)
}

pub fn test_from_value(mut value: Value, overrides: &Map<String, Value>) -> Result<ExperimentRecord> {
    let doc = value
        .as_object_mut()
        .ok_or_else(|| HarnessError::config("test definition must be a JSON object"))?;
    let settings = doc
        .entry("settings")
        .or_insert_with(|| Value::Object(Map::new()))
        .as_object_mut()
        .ok_or_else(|| HarnessError::config("test settings must be a JSON object"))?;
    for (key, v) in overrides {
        settings.insert(key.clone(), v.clone());
    }
    Ok(serde_json::from_value(value)?)
}
