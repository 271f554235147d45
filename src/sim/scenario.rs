//! The `sim` scenario: an in-process cluster driven by the `writes` workload.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{Map, Value};
use tracing::info;

use super::faults::{CorruptNewest, IsolateLeader, ReplaceReplica, TransferLeadership};
use super::{SimCluster, SimFleet, SimHandle};
use crate::chaos::config::{ExperimentRecord, WorkloadConfig};
use crate::chaos::registry::Catalog;
use crate::chaos::scenario::{Deployment, Scenario};
use crate::cluster::RetryPolicy;
use crate::error::{HarnessError, Result};
use crate::oracle::consistency::{self, ConsistencyCheck};

pub const NAME: &str = "sim";

fn u64_param(params: &Map<String, Value>, key: &str, default: u64) -> Result<u64> {
    match params.get(key) {
        None => Ok(default),
        Some(v) => v
            .as_u64()
            .ok_or_else(|| HarnessError::config(format!("{} must be a non-negative integer", key))),
    }
}

fn u32_param(params: &Map<String, Value>, key: &str, default: u32) -> Result<u32> {
    let v = u64_param(params, key, u64::from(default))?;
    u32::try_from(v).map_err(|_| HarnessError::config(format!("{} is out of range: {}", key, v)))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct WritesParams {
    nodes: u32,
    op_interval: Duration,
}

impl WritesParams {
    fn from_config(config: &WorkloadConfig) -> Result<Self> {
        let nodes = u32_param(&config.params, "nodes", 1)?;
        if nodes == 0 || nodes > 250 {
            return Err(HarnessError::config("writes: nodes must be within 1..=250"));
        }
        Ok(WritesParams {
            nodes,
            op_interval: Duration::from_millis(u64_param(&config.params, "op_interval_ms", 5)?),
        })
    }
}

/// Runs experiments against [`SimCluster`] with the `writes` workload.
pub struct SimScenario {
    catalog: Catalog,
    sim: Arc<SimHandle>,
}

impl SimScenario {
    pub fn new() -> Self {
        let sim = Arc::new(SimHandle::default());
        let mut catalog = Catalog::default();

        catalog.workload("writes", |config| WritesParams::from_config(config).map(|_| ()));

        let handle = sim.clone();
        catalog.fault("isolate_leader", move |config| IsolateLeader::build(handle.clone(), config));
        catalog.fault("transfer_leadership", TransferLeadership::build);
        catalog.fault("replace_replica", ReplaceReplica::build);
        let handle = sim.clone();
        catalog.fault("corrupt_newest_record", move |config| CorruptNewest::build(handle.clone(), config));

        catalog.check(consistency::NAME, ConsistencyCheck::from_config);

        SimScenario { catalog, sim }
    }
}

impl Default for SimScenario {
    fn default() -> Self {
        SimScenario::new()
    }
}

impl Scenario for SimScenario {
    fn name(&self) -> &str {
        NAME
    }

    fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    fn deploy(&self, record: &ExperimentRecord) -> Result<Deployment> {
        let writes = WritesParams::from_config(&record.workload)?;
        let size = u32_param(&record.settings.extra, "cluster_size", 3)?;
        let replication = u32_param(&record.settings.extra, "replication", size)?;
        if size == 0 || replication > size {
            return Err(HarnessError::config(format!(
                "can't replicate {} ways on {} nodes",
                replication, size
            )));
        }

        let topic = record.workload.topic();
        info!(target: "chaos", "starting {} node cluster, topic {} x{}", size, topic, replication);
        let cluster = Arc::new(SimCluster::with_replication(size, replication, &[topic]));
        self.sim.set(cluster.clone());
        let fleet = SimFleet::start(cluster.clone(), writes.nodes, topic, writes.op_interval);
        Ok(Deployment {
            cluster,
            fleet: Arc::new(fleet),
        })
    }

    fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            request_pause: Duration::from_millis(10),
            poll_interval: Duration::from_millis(10),
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::{json, Map};

    use super::*;
    use crate::chaos::config::test_from_value;

    fn record(settings: Value) -> ExperimentRecord {
        test_from_value(
            json!({"name": "t", "scenario": "sim", "workload": {"name": "writes"}, "settings": settings}),
            &Map::new(),
        )
        .unwrap()
    }

    #[test]
    fn test_oversized_cluster_is_config_error() {
        let scenario = SimScenario::new();
        let err = scenario
            .deploy(&record(json!({"cluster_size": 4_294_967_299u64})))
            .err()
            .unwrap();
        assert!(err.is_config(), "{}", err);
        assert!(err.to_string().contains("cluster_size"));
    }

    #[test]
    fn test_replication_beyond_cluster_is_config_error() {
        let scenario = SimScenario::new();
        let err = scenario
            .deploy(&record(json!({"cluster_size": 3, "replication": 4})))
            .err()
            .unwrap();
        assert!(err.is_config());
    }

    #[test]
    fn test_writes_nodes_out_of_u32_range() {
        let config: WorkloadConfig = serde_json::from_value(json!({"name": "writes", "nodes": 4_294_967_297u64})).unwrap();
        assert!(WritesParams::from_config(&config).unwrap_err().is_config());
    }
}
