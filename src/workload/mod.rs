//! Workload fleet: the clients driving writes against the cluster.

use std::fmt;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::chaos::config::ExperimentRecord;
use crate::cluster::Node;
use crate::error::Result;

/// Phase boundaries announced to every workload node so adapters can tag
/// their own logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseEvent {
    Measure,
    Injecting,
    Injected,
    Healing,
    Healed,
}

impl PhaseEvent {
    pub fn as_str(self) -> &'static str {
        match self {
            PhaseEvent::Measure => "measure",
            PhaseEvent::Injecting => "injecting",
            PhaseEvent::Injected => "injected",
            PhaseEvent::Healing => "healing",
            PhaseEvent::Healed => "healed",
        }
    }
}

impl fmt::Display for PhaseEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Point-in-time progress counters of one workload node.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkloadInfo {
    pub succeeded_ops: u64,
}

/// The set of workload nodes of one experiment.
pub trait WorkloadFleet: Send + Sync {
    fn nodes(&self) -> Vec<Node>;

    /// Fire-and-forget notification; never waits for acknowledgment.
    fn emit_event(&self, node: &Node, event: PhaseEvent) -> Result<()>;

    fn info(&self, node: &Node) -> Result<WorkloadInfo>;

    /// Ask every node to stop gracefully.
    fn stop_everywhere(&self) -> Result<()>;

    fn kill_everywhere(&self) -> Result<()>;

    fn wait_killed(&self, timeout: Duration) -> Result<()>;

    /// Copy the node's `workload.log` (and anything else useful) into `dest`.
    fn fetch_log(&self, node: &Node, dest: &Path) -> Result<()>;

    /// Workload-specific post-processing of the finished record.
    fn analyze(&self, record: ExperimentRecord) -> Result<ExperimentRecord> {
        Ok(record)
    }
}
