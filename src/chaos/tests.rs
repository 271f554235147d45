//! Chaos Integration Tests.
//!
//! Whole experiments and suites against the in-process cluster.

use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Map, Value};

use crate::chaos::config::{test_from_value, ExperimentRecord, Phase};
use crate::chaos::experiment::ExperimentStore;
use crate::chaos::fault::{Fault, FaultContext, RecoverableFault};
use crate::chaos::registry::Catalog;
use crate::chaos::runner::Orchestrator;
use crate::chaos::scenario::{Deployment, Scenario, Scenarios};
use crate::chaos::severity::Severity;
use crate::chaos::suite::{SuiteDriver, SuiteRecord};
use crate::chaos::teardown::CLUSTER_LOGS_DIR;
use crate::error::{HarnessError, Result};
use crate::oracle::DIAGNOSTICS_FILE;
use crate::cluster::Node;
use crate::sim::{SimCluster, SimScenario};
use crate::workload::{PhaseEvent, WorkloadFleet, WorkloadInfo};

/// Zero-length phases; the workload still writes in between steps.
fn quick_settings() -> Value {
    json!({"steady_s": 0, "impact_s": 0, "recovery_s": 0})
}

fn test_doc(name: &str, fault: Value, checks: Value) -> Value {
    json!({
        "name": name,
        "scenario": "sim",
        "workload": {"name": "writes", "op_interval_ms": 1},
        "fault": fault,
        "checks": checks,
        "settings": quick_settings(),
    })
}

fn record(value: Value) -> ExperimentRecord {
    test_from_value(value, &Map::new()).unwrap()
}

fn execute(root: &Path, value: Value) -> (String, Result<ExperimentRecord>) {
    let scenario = SimScenario::new();
    let store = ExperimentStore::new(root);
    let experiment_id = store.next_experiment_id();
    let outcome = Orchestrator::new(&scenario, store).execute(record(value), experiment_id.clone());
    (experiment_id, outcome)
}

fn validate(value: Value) -> Result<()> {
    let scenario = SimScenario::new();
    Orchestrator::new(&scenario, ExperimentStore::new("/nonexistent")).validate(&record(value))
}

// =============================================================================
// Experiments
// =============================================================================

#[test]
fn test_steady_state_passes() {
    let dir = tempfile::tempdir().unwrap();
    let mut doc = test_doc("steady", Value::Null, json!([{"name": "consistency"}]));
    doc["settings"]["steady_s"] = json!(1);

    let (id, outcome) = execute(dir.path(), doc);
    let done = outcome.unwrap();
    assert_eq!(done.result, Severity::Passed);
    assert_eq!(done.phase, Some(Phase::Done));
    assert!(done.extra["started_at"].is_string());
    assert!(done.extra["finished_at"].is_string());
    assert_eq!(done.checks[0].result, Some(Severity::Passed));
    assert!(done.checks[0].params["stats"]["writes_confirmed"].as_u64().unwrap() > 0);

    // persisted record matches, logs were collected
    let store = ExperimentStore::new(dir.path());
    assert_eq!(store.load(&id).unwrap(), done);
    let exp_dir = store.experiment_dir(&id);
    assert!(exp_dir.join("10.0.1.1").join("workload.log").exists());
    assert!(!exp_dir.join("10.0.1.1").join(DIAGNOSTICS_FILE).exists());
    assert!(exp_dir.join(CLUSTER_LOGS_DIR).join("10.0.0.1").join("server.log").exists());
}

#[test]
fn test_isolated_leader_recovers() {
    let dir = tempfile::tempdir().unwrap();
    let mut doc = test_doc(
        "isolate",
        json!("isolate_leader"),
        json!([
            {"name": "progress_during_fault", "min-delta": 0},
            {"name": "consistency"},
        ]),
    );
    doc["settings"]["impact_s"] = json!(1);

    let (_, outcome) = execute(dir.path(), doc);
    let done = outcome.unwrap();
    assert_eq!(done.result, Severity::Passed, "{:#?}", done);

    let progress = &done.checks[0];
    assert_eq!(progress.result, Some(Severity::Passed));
    assert!(progress.params["10.0.1.1"]["delta"].as_i64().is_some());
    assert_eq!(done.checks[1].result, Some(Severity::Passed));
}

#[test]
fn test_progress_check_reports_hang() {
    let dir = tempfile::tempdir().unwrap();
    // nobody writes ten thousand times in a zero-length impact phase
    let doc = test_doc(
        "hang",
        json!("isolate_leader"),
        json!([{"name": "progress_during_fault", "min-delta": 10000}]),
    );

    let (_, outcome) = execute(dir.path(), doc);
    let done = outcome.unwrap();
    assert_eq!(done.result, Severity::Hang);
    assert_eq!(done.checks[0].result, Some(Severity::Hang));
    assert_eq!(done.checks[0].params["10.0.1.1"]["result"], json!("HANG"));
}

#[test]
fn test_leadership_transfer_passes() {
    let dir = tempfile::tempdir().unwrap();
    let doc = test_doc("transfer", json!("transfer_leadership"), json!([{"name": "consistency"}]));

    let (_, outcome) = execute(dir.path(), doc);
    assert_eq!(outcome.unwrap().result, Severity::Passed);
}

#[test]
fn test_replica_replacement_passes() {
    let dir = tempfile::tempdir().unwrap();
    let mut doc = test_doc("replace", json!("replace_replica"), json!([{"name": "consistency"}]));
    doc["settings"]["cluster_size"] = json!(4);
    doc["settings"]["replication"] = json!(3);

    let (_, outcome) = execute(dir.path(), doc);
    assert_eq!(outcome.unwrap().result, Severity::Passed);
}

#[test]
fn test_corrupted_record_fails() {
    let dir = tempfile::tempdir().unwrap();
    let doc = test_doc("corrupt", json!("corrupt_newest_record"), json!([{"name": "consistency"}]));

    let (id, outcome) = execute(dir.path(), doc);
    let done = outcome.unwrap();
    assert_eq!(done.result, Severity::Failed);

    let violations = done.checks[0].params["violations"].as_array().unwrap();
    assert!(violations.iter().any(|v| v["kind"] == json!("mismatch")), "{:?}", violations);
    let artifact = ExperimentStore::new(dir.path())
        .experiment_dir(&id)
        .join("10.0.1.1")
        .join(DIAGNOSTICS_FILE);
    assert!(artifact.exists());
}

#[test]
fn test_exit_on_violation_halts() {
    let dir = tempfile::tempdir().unwrap();
    let mut doc = test_doc("halt", json!("corrupt_newest_record"), json!([{"name": "consistency"}]));
    doc["exit_on_violation"] = json!(true);

    let (id, outcome) = execute(dir.path(), doc);
    match outcome {
        Err(HarnessError::ViolationHalt { experiment_id }) => assert_eq!(experiment_id, id),
        other => panic!("expected a halt, got {:?}", other.map(|r| r.result)),
    }

    // workload logs are in, the cluster is left alone
    let store = ExperimentStore::new(dir.path());
    assert_eq!(store.load(&id).unwrap().result, Severity::Failed);
    assert!(store.experiment_dir(&id).join("10.0.1.1").join("workload.log").exists());
    assert!(!store.experiment_dir(&id).join(CLUSTER_LOGS_DIR).exists());
}

#[test]
fn test_failed_fault_escalates_to_unknown() {
    let dir = tempfile::tempdir().unwrap();
    let doc = test_doc(
        "broken",
        json!({"name": "isolate_leader", "topic": "missing"}),
        json!([{"name": "consistency"}]),
    );

    let (id, outcome) = execute(dir.path(), doc);
    assert!(matches!(outcome, Err(HarnessError::Infrastructure(_))));

    let store = ExperimentStore::new(dir.path());
    let saved = store.load(&id).unwrap();
    assert_eq!(saved.result, Severity::Unknown);
    assert_eq!(saved.phase, Some(Phase::Aborted));
    // teardown still ran
    assert!(store.experiment_dir(&id).join("10.0.1.1").join("workload.log").exists());
    assert!(store.experiment_dir(&id).join(CLUSTER_LOGS_DIR).exists());
}

#[test]
fn test_remove_logs_on_success() {
    let dir = tempfile::tempdir().unwrap();
    let mut doc = test_doc("tidy", Value::Null, json!([{"name": "consistency"}]));
    doc["settings"]["remove_logs_on_success"] = json!(true);

    let (id, outcome) = execute(dir.path(), doc);
    assert_eq!(outcome.unwrap().result, Severity::Passed);
    let exp_dir = ExperimentStore::new(dir.path()).experiment_dir(&id);
    assert!(!exp_dir.join("10.0.1.1").join("workload.log").exists());
    assert!(!exp_dir.join(CLUSTER_LOGS_DIR).exists());
    assert!(exp_dir.join("info.json").exists());
}

#[test]
fn test_consistency_needs_single_workload_node() {
    let dir = tempfile::tempdir().unwrap();
    let mut doc = test_doc("two", Value::Null, json!([{"name": "consistency"}]));
    doc["workload"]["nodes"] = json!(2);

    let (_, outcome) = execute(dir.path(), doc);
    let done = outcome.unwrap();
    assert_eq!(done.result, Severity::Unknown);
    assert!(done.checks[0].params["error"].as_str().unwrap().contains("exactly one"));
}

// =============================================================================
// Fault pairing
// =============================================================================

/// Recoverable fault that only records whether it was healed.
struct MarkerFault {
    healed: Arc<AtomicBool>,
    fail_heal: bool,
}

impl RecoverableFault for MarkerFault {
    fn name(&self) -> &str {
        "marker"
    }

    fn inject(&mut self, _ctx: &FaultContext<'_>) -> Result<()> {
        Ok(())
    }

    fn heal(&mut self, _ctx: &FaultContext<'_>) -> Result<()> {
        self.healed.store(true, Ordering::SeqCst);
        if self.fail_heal {
            return Err(HarnessError::infra("heal refused"));
        }
        Ok(())
    }
}

/// One workload node that never answers progress queries.
struct SilentFleet;

impl WorkloadFleet for SilentFleet {
    fn nodes(&self) -> Vec<Node> {
        vec![Node::new(0, "10.0.1.1")]
    }

    fn emit_event(&self, _node: &Node, _event: PhaseEvent) -> Result<()> {
        Ok(())
    }

    fn info(&self, node: &Node) -> Result<WorkloadInfo> {
        Err(HarnessError::infra(format!("{} unreachable", node.ip)))
    }

    fn stop_everywhere(&self) -> Result<()> {
        Ok(())
    }

    fn kill_everywhere(&self) -> Result<()> {
        Ok(())
    }

    fn wait_killed(&self, _timeout: Duration) -> Result<()> {
        Ok(())
    }

    fn fetch_log(&self, _node: &Node, dest: &Path) -> Result<()> {
        fs::write(dest.join("workload.log"), "")?;
        Ok(())
    }
}

struct SilentScenario {
    catalog: Catalog,
}

impl SilentScenario {
    fn new(healed: Arc<AtomicBool>, fail_heal: bool) -> Self {
        let mut catalog = Catalog::default();
        catalog.workload("writes", |_| Ok(()));
        catalog.fault("marker", move |_| {
            Ok(Fault::Recoverable(Box::new(MarkerFault {
                healed: healed.clone(),
                fail_heal,
            })))
        });
        SilentScenario { catalog }
    }
}

impl Scenario for SilentScenario {
    fn name(&self) -> &str {
        "silent"
    }

    fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    fn deploy(&self, _record: &ExperimentRecord) -> Result<Deployment> {
        Ok(Deployment {
            cluster: Arc::new(SimCluster::new(1, &["chaos"])),
            fleet: Arc::new(SilentFleet),
        })
    }
}

fn execute_silent(root: &Path, fail_heal: bool) -> (Arc<AtomicBool>, String, Result<ExperimentRecord>) {
    let healed = Arc::new(AtomicBool::new(false));
    let scenario = SilentScenario::new(healed.clone(), fail_heal);
    let store = ExperimentStore::new(root);
    let experiment_id = store.next_experiment_id();
    let mut doc = test_doc("silent", json!("marker"), json!([]));
    doc["scenario"] = json!("silent");
    let outcome = Orchestrator::new(&scenario, store).execute(record(doc), experiment_id.clone());
    (healed, experiment_id, outcome)
}

#[test]
fn test_injected_fault_is_healed_on_abort() {
    let dir = tempfile::tempdir().unwrap();
    let (healed, id, outcome) = execute_silent(dir.path(), false);

    assert!(matches!(outcome, Err(HarnessError::Infrastructure(_))));
    assert!(healed.load(Ordering::SeqCst));
    let saved = ExperimentStore::new(dir.path()).load(&id).unwrap();
    assert_eq!(saved.result, Severity::Unknown);
    assert_eq!(saved.phase, Some(Phase::Aborted));
    assert!(saved.extra.get("teardown").is_none());
}

#[test]
fn test_failed_heal_on_abort_is_a_diagnostic() {
    let dir = tempfile::tempdir().unwrap();
    let (healed, id, outcome) = execute_silent(dir.path(), true);

    assert!(matches!(outcome, Err(HarnessError::Infrastructure(_))));
    assert!(healed.load(Ordering::SeqCst));
    let saved = ExperimentStore::new(dir.path()).load(&id).unwrap();
    let notes = saved.extra["teardown"].as_array().unwrap();
    assert!(notes.iter().any(|n| n.as_str().unwrap().contains("can't heal marker")));
}

// =============================================================================
// Validation
// =============================================================================

#[test]
fn test_validation_rejects_unknown_names() {
    let unknown_workload = json!({"name": "t", "scenario": "sim", "workload": {"name": "reads"}});
    assert!(validate(unknown_workload).unwrap_err().is_config());
    assert!(validate(test_doc("t", json!("meteor"), json!([]))).unwrap_err().is_config());
    assert!(validate(test_doc("t", Value::Null, json!([{"name": "linearizable"}])))
        .unwrap_err()
        .is_config());
    assert!(validate(test_doc("t", json!("isolate_leader"), json!([{"name": "consistency"}]))).is_ok());
}

#[test]
fn test_progress_check_requires_recoverable_fault() {
    let progress = json!([{"name": "progress_during_fault", "min-delta": 1}]);
    assert!(validate(test_doc("t", Value::Null, progress.clone())).unwrap_err().is_config());
    assert!(validate(test_doc("t", json!("transfer_leadership"), progress.clone()))
        .unwrap_err()
        .is_config());
    assert!(validate(test_doc("t", json!("isolate_leader"), progress)).is_ok());
}

#[test]
fn test_progress_check_params_are_validated() {
    let bad_selector = json!([{"name": "progress_during_fault", "min-delta": 1, "selector": "most"}]);
    assert!(validate(test_doc("t", json!("isolate_leader"), bad_selector)).unwrap_err().is_config());
    let no_delta = json!([{"name": "progress_during_fault"}]);
    assert!(validate(test_doc("t", json!("isolate_leader"), no_delta)).unwrap_err().is_config());
}

#[test]
fn test_invalid_test_touches_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let (id, outcome) = execute(dir.path(), test_doc("t", json!("meteor"), json!([])));
    assert!(outcome.unwrap_err().is_config());
    assert!(!ExperimentStore::new(dir.path()).experiment_dir(&id).exists());
}

// =============================================================================
// Suites
// =============================================================================

fn write_suite(dir: &Path, suite: Value, tests: &[(&str, Value)]) -> std::path::PathBuf {
    fs::create_dir_all(dir.join("tests")).unwrap();
    for (file, doc) in tests {
        fs::write(dir.join("tests").join(file), doc.to_string()).unwrap();
    }
    let path = dir.join("suite.json");
    fs::write(&path, suite.to_string()).unwrap();
    path
}

fn sim_scenarios() -> Scenarios {
    let mut scenarios = Scenarios::new();
    scenarios.add(Box::new(SimScenario::new()));
    scenarios
}

#[test]
fn test_suite_runs_and_aggregates() {
    let suite_dir = tempfile::tempdir().unwrap();
    let root = tempfile::tempdir().unwrap();
    let path = write_suite(
        suite_dir.path(),
        json!({
            "name": "smoke",
            "tests": ["steady.json", "transfer.json"],
            "settings": {"test": quick_settings()},
        }),
        &[
            ("steady.json", test_doc("steady", Value::Null, json!([{"name": "consistency"}]))),
            (
                "transfer.json",
                test_doc("transfer", json!("transfer_leadership"), json!([{"name": "consistency"}])),
            ),
        ],
    );

    let scenarios = sim_scenarios();
    let driver = SuiteDriver::new(&scenarios, ExperimentStore::new(root.path()));
    let suite = driver.load(&path).unwrap();
    let record = driver.run(&suite, 2, "run-1").unwrap();

    assert_eq!(record.result, Severity::Passed);
    assert_eq!(record.test_runs["steady"].len(), 2);
    assert_eq!(record.test_runs["transfer"].len(), 2);

    let saved: SuiteRecord =
        serde_json::from_str(&fs::read_to_string(root.path().join("run-1.json")).unwrap()).unwrap();
    assert_eq!(saved, record);
    assert!(root.path().join("latest.json").exists());
}

#[test]
fn test_suite_failure_is_sticky() {
    let suite_dir = tempfile::tempdir().unwrap();
    let root = tempfile::tempdir().unwrap();
    let path = write_suite(
        suite_dir.path(),
        json!({
            "name": "mixed",
            "tests": ["ok.json", "bad.json"],
            "settings": {"suite": {"ignore_transient_errors": true}},
        }),
        &[
            ("ok.json", test_doc("ok", Value::Null, json!([{"name": "consistency"}]))),
            (
                "bad.json",
                test_doc("bad", json!("corrupt_newest_record"), json!([{"name": "consistency"}])),
            ),
        ],
    );

    let scenarios = sim_scenarios();
    let driver = SuiteDriver::new(&scenarios, ExperimentStore::new(root.path()));
    let record = driver.run(&driver.load(&path).unwrap(), 1, "run-2").unwrap();
    assert_eq!(record.result, Severity::Failed);
}

#[test]
fn test_suite_overrides_test_settings() {
    let suite_dir = tempfile::tempdir().unwrap();
    let mut doc = test_doc("slow", Value::Null, json!([]));
    doc["settings"] = json!({"steady_s": 3600});
    let path = write_suite(
        suite_dir.path(),
        json!({"name": "s", "tests": ["slow.json"], "settings": {"test": {"steady_s": 0}}}),
        &[("slow.json", doc)],
    );

    let scenarios = sim_scenarios();
    let driver = SuiteDriver::new(&scenarios, ExperimentStore::new(suite_dir.path().join("out")));
    let suite = driver.load(&path).unwrap();
    assert_eq!(suite.tests[0].settings.steady_s, Some(0));
}

#[test]
fn test_suite_rejects_duplicates_and_unknown_scenarios() {
    let suite_dir = tempfile::tempdir().unwrap();
    let doc = test_doc("same", Value::Null, json!([]));
    let path = write_suite(
        suite_dir.path(),
        json!({"name": "dup", "tests": ["a.json", "b.json"]}),
        &[("a.json", doc.clone()), ("b.json", doc)],
    );
    let scenarios = sim_scenarios();
    let driver = SuiteDriver::new(&scenarios, ExperimentStore::new(suite_dir.path().join("out")));
    assert!(driver.load(&path).unwrap_err().is_config());

    let mut elsewhere = test_doc("elsewhere", Value::Null, json!([]));
    elsewhere["scenario"] = json!("ec2");
    let path = write_suite(
        suite_dir.path(),
        json!({"name": "remote", "tests": ["c.json"]}),
        &[("c.json", elsewhere)],
    );
    assert!(driver.load(&path).unwrap_err().is_config());
}

#[test]
fn test_suite_stops_on_halt() {
    let suite_dir = tempfile::tempdir().unwrap();
    let root = tempfile::tempdir().unwrap();
    let mut bad = test_doc("bad", json!("corrupt_newest_record"), json!([{"name": "consistency"}]));
    bad["exit_on_violation"] = json!(true);
    let path = write_suite(
        suite_dir.path(),
        json!({"name": "halting", "tests": ["bad.json", "never.json"]}),
        &[
            ("bad.json", bad),
            ("never.json", test_doc("never", Value::Null, json!([]))),
        ],
    );

    let scenarios = sim_scenarios();
    let driver = SuiteDriver::new(&scenarios, ExperimentStore::new(root.path()));
    let err = driver.run(&driver.load(&path).unwrap(), 3, "run-3").unwrap_err();
    assert!(matches!(err, HarnessError::ViolationHalt { .. }));

    let saved: SuiteRecord =
        serde_json::from_str(&fs::read_to_string(root.path().join("run-3.json")).unwrap()).unwrap();
    assert_eq!(saved.result, Severity::Failed);
    assert!(!saved.test_runs.contains_key("never"));
}
