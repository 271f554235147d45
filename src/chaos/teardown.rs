//! Best-effort log collection and cleanup.
//!
//! Nothing here raises. Each step collects what went wrong into a
//! [`TeardownReport`] and is guarded by a flag so it runs at most once per
//! experiment, whichever path (normal completion or abort) reaches it first.

use std::fs;
use std::path::Path;
use std::time::Duration;

use tracing::{info, warn};

use super::fault::{FaultContext, RecoverableFault};
use crate::cluster::Cluster;
use crate::workload::WorkloadFleet;

const KILL_TIMEOUT: Duration = Duration::from_secs(10);

/// Subdirectory of the experiment dir holding cluster server logs.
pub const CLUSTER_LOGS_DIR: &str = "cluster";

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TeardownReport {
    pub diagnostics: Vec<String>,
}

impl TeardownReport {
    fn note(&mut self, msg: String) {
        warn!(target: "chaos", "{}", msg);
        self.diagnostics.push(msg);
    }

    pub fn is_clean(&self) -> bool {
        self.diagnostics.is_empty()
    }

    pub fn merge(&mut self, other: TeardownReport) {
        self.diagnostics.extend(other.diagnostics);
    }
}

#[derive(Debug, Default)]
pub struct Teardown {
    workload_logs_fetched: bool,
    cluster_logs_fetched: bool,
}

impl Teardown {
    pub fn new() -> Self {
        Teardown::default()
    }

    /// Stop the workload everywhere and copy each node's log into
    /// `<dir>/<node ip>/`.
    pub fn fetch_workload_logs(&mut self, fleet: &dyn WorkloadFleet, dir: &Path) -> TeardownReport {
        let mut report = TeardownReport::default();
        if self.workload_logs_fetched {
            return report;
        }
        info!(target: "chaos", "stopping workload everywhere");
        if let Err(e) = fleet.stop_everywhere() {
            report.note(format!("graceful workload stop failed: {}", e));
        }
        if let Err(e) = fleet.kill_everywhere() {
            report.note(format!("workload kill failed: {}", e));
        }
        if let Err(e) = fleet.wait_killed(KILL_TIMEOUT) {
            report.note(format!("workload didn't die: {}", e));
        }
        for node in fleet.nodes() {
            info!(target: "chaos", "fetching oplog from {}", node.ip);
            let dest = dir.join(&node.ip);
            if let Err(e) = fs::create_dir_all(&dest) {
                report.note(format!("can't create {}: {}", dest.display(), e));
                continue;
            }
            if let Err(e) = fleet.fetch_log(&node, &dest) {
                report.note(format!("can't fetch workload log from {}: {}", node.ip, e));
            }
        }
        self.workload_logs_fetched = true;
        report
    }

    /// Stop the cluster and copy every node's server logs into
    /// `<dir>/cluster/<node ip>/`.
    pub fn fetch_cluster_logs(&mut self, cluster: &dyn Cluster, dir: &Path) -> TeardownReport {
        let mut report = TeardownReport::default();
        if self.cluster_logs_fetched {
            return report;
        }
        info!(target: "chaos", "stopping cluster");
        if let Err(e) = cluster.kill_everywhere() {
            report.note(format!("cluster kill failed: {}", e));
        }
        if let Err(e) = cluster.wait_killed(KILL_TIMEOUT) {
            report.note(format!("cluster didn't die: {}", e));
        }
        for node in cluster.nodes() {
            info!(target: "chaos", "fetching logs from {}", node.ip);
            let dest = dir.join(CLUSTER_LOGS_DIR).join(&node.ip);
            if let Err(e) = fs::create_dir_all(&dest) {
                report.note(format!("can't create {}: {}", dest.display(), e));
                continue;
            }
            if let Err(e) = cluster.fetch_logs(&node, &dest) {
                report.note(format!("can't fetch logs from {}: {}", node.ip, e));
            }
        }
        self.cluster_logs_fetched = true;
        report
    }
}

/// Undo a fault left injected by an aborted experiment.
pub fn heal_best_effort(fault: &mut dyn RecoverableFault, ctx: &FaultContext<'_>) -> TeardownReport {
    let mut report = TeardownReport::default();
    info!(target: "chaos", "healing {} after abort", fault.name());
    if let Err(e) = fault.heal(ctx) {
        report.note(format!("can't heal {}: {}", fault.name(), e));
    }
    report
}

/// Delete captured logs of a passed experiment.
pub fn remove_logs(fleet: &dyn WorkloadFleet, dir: &Path) -> TeardownReport {
    let mut report = TeardownReport::default();
    for node in fleet.nodes() {
        let path = dir.join(&node.ip).join("workload.log");
        if let Err(e) = fs::remove_file(&path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                report.note(format!("can't remove {}: {}", path.display(), e));
            }
        }
    }
    let cluster_dir = dir.join(CLUSTER_LOGS_DIR);
    if cluster_dir.exists() {
        if let Err(e) = fs::remove_dir_all(&cluster_dir) {
            report.note(format!("can't remove {}: {}", cluster_dir.display(), e));
        }
    }
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{SimCluster, SimFleet};
    use std::sync::Arc;

    #[test]
    fn test_workload_logs_fetched_once() {
        let dir = tempfile::tempdir().unwrap();
        let cluster = Arc::new(SimCluster::new(3, &["chaos"]));
        let fleet = SimFleet::start(cluster, 1, "chaos", Duration::from_millis(1));
        let mut teardown = Teardown::new();

        let first = teardown.fetch_workload_logs(&fleet, dir.path());
        assert!(first.is_clean(), "{:?}", first);
        let second = teardown.fetch_workload_logs(&fleet, dir.path());
        assert!(second.is_clean());
        assert_eq!(fleet.log_fetches(), 1);
        assert!(dir.path().join(&fleet.nodes()[0].ip).join("workload.log").exists());
    }

    #[test]
    fn test_cluster_logs_fetched_once() {
        let dir = tempfile::tempdir().unwrap();
        let cluster = SimCluster::new(3, &["chaos"]);
        let mut teardown = Teardown::new();

        assert!(teardown.fetch_cluster_logs(&cluster, dir.path()).is_clean());
        assert!(teardown.fetch_cluster_logs(&cluster, dir.path()).is_clean());
        assert_eq!(cluster.log_fetches(), 3);
        assert!(cluster.is_killed());
    }

    #[test]
    fn test_fetch_failures_become_diagnostics() {
        let dir = tempfile::tempdir().unwrap();
        let cluster = SimCluster::new(2, &["chaos"]);
        cluster.fail_log_fetches(true);
        let mut teardown = Teardown::new();

        let report = teardown.fetch_cluster_logs(&cluster, dir.path());
        assert_eq!(report.diagnostics.len(), 2);
        // a failed fetch still counts as the one attempt
        assert!(teardown.fetch_cluster_logs(&cluster, dir.path()).is_clean());
        assert_eq!(cluster.log_fetches(), 2);
    }

    #[test]
    fn test_remove_logs_keeps_info() {
        let dir = tempfile::tempdir().unwrap();
        let cluster = Arc::new(SimCluster::new(3, &["chaos"]));
        let fleet = SimFleet::start(cluster.clone(), 1, "chaos", Duration::from_millis(1));
        let mut teardown = Teardown::new();
        teardown.fetch_workload_logs(&fleet, dir.path());
        teardown.fetch_cluster_logs(cluster.as_ref(), dir.path());
        fs::write(dir.path().join("info.json"), "{}").unwrap();

        assert!(remove_logs(&fleet, dir.path()).is_clean());
        assert!(!dir.path().join(&fleet.nodes()[0].ip).join("workload.log").exists());
        assert!(!dir.path().join(CLUSTER_LOGS_DIR).exists());
        assert!(dir.path().join("info.json").exists());
    }
}
