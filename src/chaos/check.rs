//! Check contract and the progress-during-fault evaluation.

use std::collections::BTreeMap;
use std::path::Path;

use serde::Serialize;
use serde_json::{Map, Value};

use super::config::{ExperimentRecord, ProgressParams, Selector};
use super::severity::Severity;
use crate::cluster::Cluster;
use crate::error::Result;
use crate::workload::{WorkloadFleet, WorkloadInfo};

/// Everything a check may inspect once the workload has been stopped and its
/// logs fetched.
pub struct CheckContext<'a> {
    pub record: &'a ExperimentRecord,
    /// `<root>/<experiment_id>`; workload logs live in `<dir>/<node ip>/`.
    pub experiment_dir: &'a Path,
    pub cluster: &'a dyn Cluster,
    pub fleet: &'a dyn WorkloadFleet,
}

/// Verdict plus whatever the check wants recorded next to it.
#[derive(Debug, Clone, PartialEq)]
pub struct CheckOutcome {
    pub result: Severity,
    pub diagnostics: Map<String, Value>,
}

impl CheckOutcome {
    pub fn new(result: Severity) -> Self {
        CheckOutcome {
            result,
            diagnostics: Map::new(),
        }
    }

    pub fn with(mut self, key: &str, value: Value) -> Self {
        self.diagnostics.insert(key.to_string(), value);
        self
    }
}

pub trait Check: Send {
    fn check(&self, ctx: &CheckContext<'_>) -> Result<CheckOutcome>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct NodeProgress {
    pub delta: i64,
    pub result: Severity,
}

/// Outcome of the progress-during-fault pseudo-check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressReport {
    pub result: Severity,
    pub nodes: BTreeMap<String, NodeProgress>,
}

impl ProgressReport {
    pub fn into_outcome(self) -> CheckOutcome {
        let mut outcome = CheckOutcome::new(self.result);
        for (ip, progress) in self.nodes {
            // serializing two plain fields cannot fail
            let value = serde_json::to_value(progress).unwrap_or(Value::Null);
            outcome.diagnostics.insert(ip, value);
        }
        outcome
    }
}

/// Judge whether the workload kept making progress while the fault was
/// active. Deltas are per node; nodes are never compared with each other.
pub fn evaluate_progress(
    params: &ProgressParams,
    injected: &BTreeMap<String, WorkloadInfo>,
    before_heal: &BTreeMap<String, WorkloadInfo>,
) -> ProgressReport {
    let mut nodes = BTreeMap::new();
    let mut has_any = false;
    let mut has_all = true;
    for (ip, after) in before_heal {
        let before = injected.get(ip).copied().unwrap_or_default();
        let delta = after.succeeded_ops as i64 - before.succeeded_ops as i64;
        let result = if delta < params.min_delta {
            has_all = false;
            Severity::Hang
        } else {
            has_any = true;
            Severity::Passed
        };
        nodes.insert(ip.clone(), NodeProgress { delta, result });
    }

    let progressed = match params.selector {
        Selector::All => has_all,
        Selector::Any => has_any,
    };
    ProgressReport {
        result: if progressed { Severity::Passed } else { Severity::Hang },
        nodes,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn infos(ops: &[u64]) -> BTreeMap<String, WorkloadInfo> {
        ops.iter()
            .enumerate()
            .map(|(i, &succeeded_ops)| (format!("10.0.0.{}", i), WorkloadInfo { succeeded_ops }))
            .collect()
    }

    fn params(selector: Selector, min_delta: i64) -> ProgressParams {
        ProgressParams { selector, min_delta }
    }

    #[test]
    fn test_selector_all_requires_every_node() {
        let report = evaluate_progress(&params(Selector::All, 1), &infos(&[10, 10, 10]), &infos(&[10, 15, 15]));
        assert_eq!(report.result, Severity::Hang);
        assert_eq!(report.nodes["10.0.0.0"].result, Severity::Hang);
        assert_eq!(report.nodes["10.0.0.1"].delta, 5);
    }

    #[test]
    fn test_selector_any_requires_one_node() {
        let report = evaluate_progress(&params(Selector::Any, 1), &infos(&[10, 10, 10]), &infos(&[10, 15, 15]));
        assert_eq!(report.result, Severity::Passed);
    }

    #[test]
    fn test_no_progress_anywhere_hangs_for_any() {
        let report = evaluate_progress(&params(Selector::Any, 1), &infos(&[3, 3]), &infos(&[3, 3]));
        assert_eq!(report.result, Severity::Hang);
    }

    #[test]
    fn test_min_delta_is_inclusive() {
        let report = evaluate_progress(&params(Selector::All, 5), &infos(&[0]), &infos(&[5]));
        assert_eq!(report.result, Severity::Passed);
    }

    #[test]
    fn test_outcome_carries_per_node_deltas() {
        let outcome = evaluate_progress(&params(Selector::All, 1), &infos(&[0]), &infos(&[7])).into_outcome();
        assert_eq!(outcome.result, Severity::Passed);
        assert_eq!(outcome.diagnostics["10.0.0.0"]["delta"], 7);
        assert_eq!(outcome.diagnostics["10.0.0.0"]["result"], "PASSED");
    }
}
