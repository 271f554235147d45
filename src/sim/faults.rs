//! Faults against the in-process cluster.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use rand::seq::SliceRandom;
use serde_json::Value;
use tracing::info;

use super::SimHandle;
use crate::chaos::config::FaultConfig;
use crate::chaos::fault::{Fault, FaultContext, OneOffFault, RecoverableFault};
use crate::cluster::{reconfigure_with_retry, transfer_leadership_with_retry, Node, NodeId, Resource};
use crate::error::{HarnessError, Result};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

fn timeout_of(config: &FaultConfig) -> Result<Duration> {
    match config.params.get("timeout_s") {
        None => Ok(DEFAULT_TIMEOUT),
        Some(v) => v
            .as_u64()
            .map(Duration::from_secs)
            .ok_or_else(|| HarnessError::config(format!("{}: timeout_s must be a non-negative integer", config.name))),
    }
}

/// Target topic: the fault's own `topic` param, else the workload's.
fn resource_of(ctx: &FaultContext<'_>, topic: &Option<String>) -> Resource {
    Resource::topic(topic.clone().unwrap_or_else(|| ctx.record.workload.topic().to_string()))
}

fn topic_param(config: &FaultConfig) -> Option<String> {
    config.params.get("topic").and_then(Value::as_str).map(str::to_string)
}

/// Cuts the partition leader off from the rest of the cluster, then lets it
/// rejoin.
pub struct IsolateLeader {
    sim: Arc<SimHandle>,
    topic: Option<String>,
    timeout: Duration,
    isolated: Option<NodeId>,
    name: String,
}

impl IsolateLeader {
    pub fn build(sim: Arc<SimHandle>, config: &FaultConfig) -> Result<Fault> {
        let topic = topic_param(config);
        Ok(Fault::Recoverable(Box::new(IsolateLeader {
            sim,
            name: format!("isolating the leader of {}", topic.as_deref().unwrap_or("the workload topic")),
            topic,
            timeout: timeout_of(config)?,
            isolated: None,
        })))
    }
}

impl RecoverableFault for IsolateLeader {
    fn name(&self) -> &str {
        &self.name
    }

    fn inject(&mut self, ctx: &FaultContext<'_>) -> Result<()> {
        let resource = resource_of(ctx, &self.topic);
        let leader = ctx.cluster.leader_of(&resource, self.timeout)?;
        info!(target: "chaos", "isolating {} (leader of {})", leader, resource);
        self.sim.get()?.isolate(leader.id);
        self.isolated = Some(leader.id);
        Ok(())
    }

    fn heal(&mut self, _ctx: &FaultContext<'_>) -> Result<()> {
        if let Some(id) = self.isolated.take() {
            self.sim.get()?.rejoin(id);
        }
        Ok(())
    }
}

/// Moves leadership to a random other replica.
pub struct TransferLeadership {
    topic: Option<String>,
    timeout: Duration,
}

impl TransferLeadership {
    pub fn build(config: &FaultConfig) -> Result<Fault> {
        Ok(Fault::OneOff(Box::new(TransferLeadership {
            topic: topic_param(config),
            timeout: timeout_of(config)?,
        })))
    }
}

impl OneOffFault for TransferLeadership {
    fn name(&self) -> &str {
        "leadership transfer"
    }

    fn execute(&mut self, ctx: &FaultContext<'_>) -> Result<()> {
        let resource = resource_of(ctx, &self.topic);
        let details = ctx.cluster.details_of(&resource, self.timeout)?;
        let current = ctx.cluster.leader_of(&resource, self.timeout)?;
        let candidates: Vec<&Node> = details.replicas.iter().filter(|n| n.id != current.id).collect();
        let target = candidates
            .choose(&mut rand::thread_rng())
            .map(|n| (*n).clone())
            .ok_or_else(|| HarnessError::infra(format!("{} has a single replica", resource)))?;
        info!(target: "chaos", "transferring leadership of {} from {} to {}", resource, current, target);
        transfer_leadership_with_retry(ctx.cluster, &target, &resource, self.timeout, ctx.retry)
    }
}

/// Swaps one replica for a node outside the replica set.
pub struct ReplaceReplica {
    topic: Option<String>,
    timeout: Duration,
}

impl ReplaceReplica {
    pub fn build(config: &FaultConfig) -> Result<Fault> {
        Ok(Fault::OneOff(Box::new(ReplaceReplica {
            topic: topic_param(config),
            timeout: timeout_of(config)?,
        })))
    }
}

impl OneOffFault for ReplaceReplica {
    fn name(&self) -> &str {
        "replica replacement"
    }

    fn execute(&mut self, ctx: &FaultContext<'_>) -> Result<()> {
        let resource = resource_of(ctx, &self.topic);
        let details = ctx.cluster.details_of(&resource, self.timeout)?;
        let spare: Vec<Node> = ctx
            .cluster
            .nodes()
            .into_iter()
            .filter(|n| !details.replicas.iter().any(|r| r.id == n.id))
            .collect();

        let mut rng = rand::thread_rng();
        let (Some(incoming), Some(outgoing)) = (spare.choose(&mut rng), details.replicas.choose(&mut rng)) else {
            return Err(HarnessError::infra(format!("no spare node to move {} to", resource)));
        };
        let mut replicas: Vec<Node> = details.replicas.iter().filter(|n| n.id != outgoing.id).cloned().collect();
        replicas.push(incoming.clone());
        info!(target: "chaos", "moving {} from {} to {}", resource, outgoing, incoming);
        reconfigure_with_retry(ctx.cluster, &replicas, &resource, self.timeout, ctx.retry)
    }
}

/// Rewrites the newest committed record, a stand-in for a replica serving
/// divergent data. Waits for the first committed record.
pub struct CorruptNewest {
    sim: Arc<SimHandle>,
    topic: Option<String>,
    timeout: Duration,
}

impl CorruptNewest {
    pub fn build(sim: Arc<SimHandle>, config: &FaultConfig) -> Result<Fault> {
        Ok(Fault::OneOff(Box::new(CorruptNewest {
            sim,
            topic: topic_param(config),
            timeout: timeout_of(config)?,
        })))
    }
}

impl OneOffFault for CorruptNewest {
    fn name(&self) -> &str {
        "record corruption"
    }

    fn execute(&mut self, ctx: &FaultContext<'_>) -> Result<()> {
        let resource = resource_of(ctx, &self.topic);
        let cluster = self.sim.get()?;
        let begin = Instant::now();
        loop {
            if let Some(offset) = cluster.corrupt_newest(&resource) {
                info!(target: "chaos", "corrupted {} at offset {}", resource, offset);
                return Ok(());
            }
            if begin.elapsed() > self.timeout {
                return Err(HarnessError::timeout(
                    format!("{} stayed empty", resource),
                    begin.elapsed(),
                ));
            }
            thread::sleep(Duration::from_millis(1));
        }
    }
}
