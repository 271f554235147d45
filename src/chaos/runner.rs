//! Experiment orchestrator.
//!
//! Drives one experiment through its phases against a scenario's
//! deployment:
//!
//! ```text
//! no fault:    STEADY -> checks
//! recoverable: STEADY -> inject -> IMPACT -> progress -> heal -> RECOVERY -> checks
//! one-off:     STEADY -> execute -> RECOVERY -> checks
//! ```
//!
//! Any error escalates the record to at least UNKNOWN and persists it before
//! propagating. Log collection runs on every path.

use std::collections::BTreeMap;
use std::path::Path;
use std::thread;
use std::time::Duration;

use serde_json::json;
use tracing::{error, info, warn};

use super::check::{evaluate_progress, CheckContext};
use super::config::{ExperimentRecord, Phase, ProgressParams};
use super::experiment::{Experiment, ExperimentStore};
use super::fault::{Fault, FaultContext, RecoverableFault};
use super::scenario::{Deployment, Scenario};
use super::severity::Severity;
use super::teardown::{heal_best_effort, remove_logs, Teardown, TeardownReport};
use crate::cluster::Cluster;
use crate::error::{HarnessError, Result};
use crate::workload::{PhaseEvent, WorkloadFleet, WorkloadInfo};

/// What an experiment has stood up so far; the abort path unwinds it.
#[derive(Default)]
struct Live {
    deployment: Option<Deployment>,
    /// A recoverable fault between a successful inject and its heal.
    injected: Option<Box<dyn RecoverableFault>>,
}

pub struct Orchestrator<'a> {
    scenario: &'a dyn Scenario,
    store: ExperimentStore,
}

impl<'a> Orchestrator<'a> {
    pub fn new(scenario: &'a dyn Scenario, store: ExperimentStore) -> Self {
        Orchestrator { scenario, store }
    }

    /// Reject unknown names and invalid combinations. Touches nothing.
    pub fn validate(&self, record: &ExperimentRecord) -> Result<()> {
        if record.scenario != self.scenario.name() {
            return Err(HarnessError::config(format!(
                "test {} wants scenario {}, got {}",
                record.name,
                record.scenario,
                self.scenario.name()
            )));
        }
        self.scenario.catalog().validate(record)
    }

    /// Run one experiment to completion and return its final record.
    ///
    /// A FAILED experiment with `exit_on_violation` set returns
    /// [`HarnessError::ViolationHalt`] after its workload logs were
    /// collected; the cluster is left running for inspection.
    pub fn execute(&self, config: ExperimentRecord, experiment_id: String) -> Result<ExperimentRecord> {
        self.validate(&config)?;
        let mut experiment = Experiment::new(config, experiment_id, self.store.clone());
        let mut teardown = Teardown::new();
        let mut live = Live::default();

        if let Err(e) = self.run(&mut experiment, &mut teardown, &mut live) {
            error!(target: "chaos", "experiment {} aborted: {}", experiment.id(), e);
            if let Err(save) = experiment.escalate(Severity::Unknown) {
                error!(target: "chaos", "can't persist experiment {}: {}", experiment.id(), save);
            }
            if let Err(save) = experiment.enter(Phase::Aborted) {
                error!(target: "chaos", "can't persist experiment {}: {}", experiment.id(), save);
            }
            if let Some(deployment) = &live.deployment {
                let dir = experiment.dir();
                let mut report = TeardownReport::default();
                if let Some(mut fault) = live.injected.take() {
                    let ctx = self.fault_context(deployment.cluster.as_ref(), experiment.record());
                    report.merge(heal_best_effort(fault.as_mut(), &ctx));
                }
                report.merge(teardown.fetch_workload_logs(deployment.fleet.as_ref(), &dir));
                report.merge(teardown.fetch_cluster_logs(deployment.cluster.as_ref(), &dir));
                note_teardown(&mut experiment, report);
            }
            return Err(e);
        }

        if experiment.result() == Severity::Failed && experiment.record().exit_on_violation {
            error!(target: "chaos", "experiment {} failed, halting with the cluster left running", experiment.id());
            return Err(HarnessError::ViolationHalt {
                experiment_id: experiment.id().to_string(),
            });
        }

        if let Some(deployment) = &live.deployment {
            let dir = experiment.dir();
            let mut report = teardown.fetch_cluster_logs(deployment.cluster.as_ref(), &dir);
            if experiment.result() == Severity::Passed && experiment.record().settings.remove_logs_on_success {
                report.merge(remove_logs(deployment.fleet.as_ref(), &dir));
            }
            note_teardown(&mut experiment, report);
        }
        experiment.annotate("finished_at", json!(chrono::Utc::now().to_rfc3339()))?;
        experiment.enter(Phase::Done)?;
        Ok(experiment.into_record())
    }

    fn run(
        &self,
        experiment: &mut Experiment,
        teardown: &mut Teardown,
        live: &mut Live,
    ) -> Result<()> {
        experiment.enter(Phase::Deploying)?;
        experiment.annotate("started_at", json!(chrono::Utc::now().to_rfc3339()))?;
        let fault = match &experiment.record().fault {
            Some(config) => Some(self.scenario.catalog().build_fault(config)?),
            None => None,
        };
        info!(target: "chaos", "deploying experiment {}", experiment.id());
        let deployment = live.deployment.insert(self.scenario.deploy(experiment.record())?).clone();
        self.measure(experiment, teardown, &deployment, fault, &mut live.injected)
    }

    fn measure(
        &self,
        experiment: &mut Experiment,
        teardown: &mut Teardown,
        deployment: &Deployment,
        fault: Option<Fault>,
        injected: &mut Option<Box<dyn RecoverableFault>>,
    ) -> Result<()> {
        let cluster = deployment.cluster.as_ref();
        let fleet = deployment.fleet.as_ref();
        let durations = experiment
            .record()
            .settings
            .durations(fault.as_ref().map(Fault::fault_type));

        info!(target: "chaos", "start measuring");
        notify(fleet, PhaseEvent::Measure);
        experiment.enter(Phase::Steady)?;
        wait_phase("steady", durations.steady);

        match fault {
            None => {}
            Some(Fault::Recoverable(mut fault)) => {
                experiment.enter(Phase::Injecting)?;
                notify(fleet, PhaseEvent::Injecting);
                info!(target: "chaos", "injecting {}", fault.name());
                fault.inject(&self.fault_context(cluster, experiment.record()))?;
                info!(target: "chaos", "injected {}", fault.name());
                *injected = Some(fault);
                notify(fleet, PhaseEvent::Injected);

                let at_inject = snapshot(fleet)?;
                experiment.enter(Phase::Impact)?;
                wait_phase("impacted", durations.impact);
                let before_heal = snapshot(fleet)?;
                self.progress_during_fault(experiment, &at_inject, &before_heal)?;

                experiment.enter(Phase::Healing)?;
                notify(fleet, PhaseEvent::Healing);
                // a failed heal is not retried on abort
                let Some(mut fault) = injected.take() else {
                    return Err(HarnessError::infra("injected fault went missing before heal"));
                };
                info!(target: "chaos", "healing {}", fault.name());
                fault.heal(&self.fault_context(cluster, experiment.record()))?;
                info!(target: "chaos", "healed {}", fault.name());
                notify(fleet, PhaseEvent::Healed);

                experiment.enter(Phase::Recovery)?;
                wait_phase("recovering", durations.recovery);
            }
            Some(Fault::OneOff(mut fault)) => {
                experiment.enter(Phase::Injecting)?;
                notify(fleet, PhaseEvent::Injecting);
                info!(target: "chaos", "injecting {}", fault.name());
                fault.execute(&self.fault_context(cluster, experiment.record()))?;
                info!(target: "chaos", "injected {}", fault.name());
                notify(fleet, PhaseEvent::Injected);

                experiment.enter(Phase::Recovery)?;
                wait_phase("recovering / impacted", durations.recovery);
            }
        }

        let dir = experiment.dir();
        let report = teardown.fetch_workload_logs(fleet, &dir);
        note_teardown(experiment, report);

        experiment.enter(Phase::Checking)?;
        self.run_checks(experiment, &dir, cluster, fleet)?;

        experiment.enter(Phase::Analyzing)?;
        let analyzed = fleet.analyze(experiment.record().clone())?;
        experiment.absorb_analysis(analyzed)?;
        info!(target: "chaos", "experiment {} result: {}", experiment.id(), experiment.result());
        Ok(())
    }

    fn fault_context<'r>(&self, cluster: &'r dyn Cluster, record: &'r ExperimentRecord) -> FaultContext<'r> {
        FaultContext {
            cluster,
            record,
            retry: self.scenario.retry_policy(),
        }
    }

    fn progress_during_fault(
        &self,
        experiment: &mut Experiment,
        injected: &BTreeMap<String, WorkloadInfo>,
        before_heal: &BTreeMap<String, WorkloadInfo>,
    ) -> Result<()> {
        let found = experiment
            .record()
            .checks
            .iter()
            .position(|c| c.is_progress_during_fault());
        let Some(index) = found else {
            return Ok(());
        };
        let params = ProgressParams::from_check(&experiment.record().checks[index])?;
        let report = evaluate_progress(&params, injected, before_heal);
        info!(target: "chaos", "progress during fault: {}", report.result);
        experiment.record_check(index, report.into_outcome())
    }

    fn run_checks(
        &self,
        experiment: &mut Experiment,
        dir: &Path,
        cluster: &dyn Cluster,
        fleet: &dyn WorkloadFleet,
    ) -> Result<()> {
        let pending: Vec<_> = experiment
            .record()
            .checks
            .iter()
            .enumerate()
            .filter(|(_, c)| !c.is_progress_during_fault())
            .map(|(i, c)| (i, c.clone()))
            .collect();

        for (index, config) in pending {
            let check = self.scenario.catalog().build_check(&config)?;
            let outcome = check.check(&CheckContext {
                record: experiment.record(),
                experiment_dir: dir,
                cluster,
                fleet,
            })?;
            info!(target: "chaos", "check {}: {}", config.name, outcome.result);
            experiment.record_check(index, outcome)?;
        }
        Ok(())
    }
}

fn notify(fleet: &dyn WorkloadFleet, event: PhaseEvent) {
    for node in fleet.nodes() {
        if let Err(e) = fleet.emit_event(&node, event) {
            warn!(target: "chaos", "can't notify {} about {}: {}", node.ip, event, e);
        }
    }
}

fn snapshot(fleet: &dyn WorkloadFleet) -> Result<BTreeMap<String, WorkloadInfo>> {
    fleet
        .nodes()
        .into_iter()
        .map(|node| fleet.info(&node).map(|info| (node.ip, info)))
        .collect()
}

fn wait_phase(label: &str, duration: Duration) {
    if duration.is_zero() {
        return;
    }
    info!(target: "chaos", "wait for {:?} to record {} state", duration, label);
    thread::sleep(duration);
}

fn note_teardown(experiment: &mut Experiment, report: TeardownReport) {
    if report.is_clean() {
        return;
    }
    let mut diagnostics = experiment
        .record()
        .extra
        .get("teardown")
        .and_then(|v| v.as_array().cloned())
        .unwrap_or_default();
    diagnostics.extend(report.diagnostics.into_iter().map(|d| json!(d)));
    if let Err(e) = experiment.annotate("teardown", json!(diagnostics)) {
        warn!(target: "chaos", "can't persist teardown diagnostics: {}", e);
    }
}
