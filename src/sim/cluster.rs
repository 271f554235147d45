//! In-process cluster.
//!
//! Partitions share one committed log per resource. Leadership, replica
//! sets and isolation are modeled just far enough to drive the control
//! operations and to produce the outcomes a real client sees: acknowledged,
//! rejected and timed out (which may or may not have committed).

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::Path;
use std::time::Duration;

use parking_lot::Mutex;
use rand::seq::SliceRandom;
use rand::Rng;
use tracing::debug;

use crate::cluster::{Cluster, Node, NodeId, PartitionDetails, ReconfigurationStatus, Resource};
use crate::error::{HarnessError, Result};
use crate::oracle::source::{CommittedLogSource, CommittedRecord, MemoryLogSource};

/// Produce attempts an isolated leader times out before the rest of the
/// replicas elect a new one.
const ELECTION_DELAY: u32 = 3;

/// What a producer observes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProduceOutcome {
    Committed(i64),
    Rejected(String),
    /// Outcome unknown to the client; the write may still have committed.
    TimedOut,
}

#[derive(Debug)]
struct Partition {
    replicas: Vec<NodeId>,
    leader: Option<NodeId>,
    pending_leader: Option<NodeId>,
    /// Target replica set, and whether an in-progress status was reported.
    pending_replicas: Option<(Vec<NodeId>, bool)>,
    log: Vec<CommittedRecord>,
    next_offset: i64,
    failed_produces: u32,
}

impl Partition {
    fn new(replicas: Vec<NodeId>) -> Self {
        Partition {
            leader: replicas.first().copied(),
            replicas,
            pending_leader: None,
            pending_replicas: None,
            log: Vec::new(),
            next_offset: 0,
            failed_produces: 0,
        }
    }

    fn append(&mut self, key: &str, op: u64) -> i64 {
        let offset = self.next_offset;
        self.next_offset += 1;
        self.log.push(CommittedRecord::new(offset, key, op));
        offset
    }

    fn elect(&mut self, isolated: &HashSet<NodeId>) -> Option<NodeId> {
        let candidates: Vec<NodeId> = self
            .replicas
            .iter()
            .copied()
            .filter(|id| !isolated.contains(id))
            .collect();
        self.leader = candidates.choose(&mut rand::thread_rng()).copied();
        self.failed_produces = 0;
        self.leader
    }
}

#[derive(Debug, Default)]
struct State {
    partitions: HashMap<Resource, Partition>,
    isolated: HashSet<NodeId>,
    killed: bool,
    stall: bool,
    reject_transfers: u32,
    transfer_requests: u32,
    reconfigure_requests: u32,
    log_fetches: u32,
    fail_log_fetches: bool,
    journal: Vec<String>,
}

pub struct SimCluster {
    nodes: Vec<Node>,
    state: Mutex<State>,
}

impl SimCluster {
    /// `size` nodes, every topic replicated on all of them, node 0 leading.
    pub fn new(size: u32, topics: &[&str]) -> Self {
        SimCluster::with_replication(size, size, topics)
    }

    /// Topics replicated on the first `replication` nodes.
    pub fn with_replication(size: u32, replication: u32, topics: &[&str]) -> Self {
        let nodes: Vec<Node> = (0..size).map(|id| Node::new(id, format!("10.0.0.{}", id + 1))).collect();
        let all: Vec<NodeId> = nodes.iter().map(|n| n.id).collect();
        let replicas: Vec<NodeId> = all.iter().copied().take(replication.max(1) as usize).collect();

        let mut partitions = HashMap::new();
        partitions.insert(Resource::controller(), Partition::new(all));
        for topic in topics {
            partitions.insert(Resource::topic(*topic), Partition::new(replicas.clone()));
        }
        SimCluster {
            nodes,
            state: Mutex::new(State {
                partitions,
                ..State::default()
            }),
        }
    }

    fn node(&self, id: NodeId) -> Option<Node> {
        self.nodes.iter().find(|n| n.id == id).cloned()
    }

    fn nodes_of(&self, ids: &[NodeId]) -> Vec<Node> {
        ids.iter().filter_map(|id| self.node(*id)).collect()
    }

    pub fn produce(&self, resource: &Resource, key: &str, op: u64) -> ProduceOutcome {
        let mut state = self.state.lock();
        if state.killed {
            return ProduceOutcome::Rejected("cluster is down".to_string());
        }
        let State {
            partitions,
            isolated,
            journal,
            ..
        } = &mut *state;
        let Some(partition) = partitions.get_mut(resource) else {
            return ProduceOutcome::Rejected(format!("unknown partition {}", resource));
        };
        match partition.leader {
            None => ProduceOutcome::Rejected("no leader".to_string()),
            Some(leader) if isolated.contains(&leader) => {
                // the write may have reached a quorum before the leader was cut off
                if rand::thread_rng().gen_bool(0.5) {
                    partition.append(key, op);
                }
                partition.failed_produces += 1;
                if partition.failed_produces >= ELECTION_DELAY {
                    let elected = partition.elect(isolated);
                    journal.push(format!("{}: leader {} isolated, elected {:?}", resource, leader, elected));
                }
                ProduceOutcome::TimedOut
            }
            Some(_) => ProduceOutcome::Committed(partition.append(key, op)),
        }
    }

    /// Cut `node` off from every other node.
    pub fn isolate(&self, node: NodeId) {
        let mut state = self.state.lock();
        state.isolated.insert(node);
        state.journal.push(format!("node {} isolated", node));
    }

    pub fn rejoin(&self, node: NodeId) {
        let mut state = self.state.lock();
        state.isolated.remove(&node);
        state.journal.push(format!("node {} rejoined", node));
    }

    pub fn is_isolated(&self, node: NodeId) -> bool {
        self.state.lock().isolated.contains(&node)
    }

    /// Rewrite the payload of the newest committed record in place and
    /// return its offset.
    pub fn corrupt_newest(&self, resource: &Resource) -> Option<i64> {
        let mut state = self.state.lock();
        let record = state.partitions.get_mut(resource)?.log.last_mut()?;
        record.op = record.op.wrapping_add(1_000_000);
        let offset = record.offset;
        state.journal.push(format!("{}: corrupted offset {}", resource, offset));
        Some(offset)
    }

    pub fn committed(&self, resource: &Resource) -> Vec<CommittedRecord> {
        self.state
            .lock()
            .partitions
            .get(resource)
            .map(|p| p.log.clone())
            .unwrap_or_default()
    }

    pub fn transfer_requests(&self) -> u32 {
        self.state.lock().transfer_requests
    }

    pub fn reconfigure_requests(&self) -> u32 {
        self.state.lock().reconfigure_requests
    }

    pub fn reject_next_transfers(&self, n: u32) {
        self.state.lock().reject_transfers = n;
    }

    /// Accept control requests but never apply them.
    pub fn stall_convergence(&self, stall: bool) {
        self.state.lock().stall = stall;
    }

    pub fn fail_log_fetches(&self, fail: bool) {
        self.state.lock().fail_log_fetches = fail;
    }

    pub fn log_fetches(&self) -> u32 {
        self.state.lock().log_fetches
    }

    pub fn is_killed(&self) -> bool {
        self.state.lock().killed
    }
}

impl Cluster for SimCluster {
    fn nodes(&self) -> Vec<Node> {
        self.nodes.clone()
    }

    fn leader_of(&self, resource: &Resource, timeout: Duration) -> Result<Node> {
        let mut state = self.state.lock();
        let stall = state.stall;
        let State {
            partitions,
            isolated,
            journal,
            ..
        } = &mut *state;
        let partition = partitions
            .get_mut(resource)
            .ok_or_else(|| HarnessError::infra(format!("unknown partition {}", resource)))?;
        if !stall {
            if let Some(target) = partition.pending_leader.take() {
                partition.leader = Some(target);
                partition.failed_produces = 0;
                journal.push(format!("{}: leadership moved to {}", resource, target));
            }
        }
        if partition.leader.map_or(false, |id| isolated.contains(&id)) {
            partition.elect(isolated);
        }
        partition
            .leader
            .and_then(|id| self.node(id))
            .ok_or_else(|| HarnessError::timeout(format!("{} has no leader", resource), timeout))
    }

    fn details_of(&self, resource: &Resource, _timeout: Duration) -> Result<PartitionDetails> {
        let mut state = self.state.lock();
        let stall = state.stall;
        let State {
            partitions,
            isolated,
            journal,
            ..
        } = &mut *state;
        let partition = partitions
            .get_mut(resource)
            .ok_or_else(|| HarnessError::infra(format!("unknown partition {}", resource)))?;

        let mut status = ReconfigurationStatus::Done;
        if let Some((target, reported)) = partition.pending_replicas.take() {
            if stall || !reported {
                partition.pending_replicas = Some((target, true));
                status = ReconfigurationStatus::InProgress;
            } else {
                partition.replicas = target;
                if partition.leader.map_or(true, |id| !partition.replicas.contains(&id)) {
                    partition.elect(isolated);
                }
                journal.push(format!("{}: replicas now {:?}", resource, partition.replicas));
            }
        }
        Ok(PartitionDetails {
            leader: partition.leader.and_then(|id| self.node(id)),
            replicas: self.nodes_of(&partition.replicas),
            status,
        })
    }

    fn request_leadership_transfer(&self, target: &Node, resource: &Resource) -> Result<()> {
        let mut state = self.state.lock();
        state.transfer_requests += 1;
        if state.killed {
            return Err(HarnessError::infra("cluster is down"));
        }
        if state.reject_transfers > 0 {
            state.reject_transfers -= 1;
            return Err(HarnessError::infra(format!("leadership transfer of {} rejected", resource)));
        }
        if state.isolated.contains(&target.id) {
            return Err(HarnessError::infra(format!("{} is unreachable", target)));
        }
        let partition = state
            .partitions
            .get_mut(resource)
            .ok_or_else(|| HarnessError::infra(format!("unknown partition {}", resource)))?;
        if !partition.replicas.contains(&target.id) {
            return Err(HarnessError::infra(format!("{} doesn't replicate {}", target, resource)));
        }
        partition.pending_leader = Some(target.id);
        debug!(target: "chaos", "sim: transfer of {} to {} accepted", resource, target);
        Ok(())
    }

    fn request_reconfigure(&self, controller: &Node, replicas: &[Node], resource: &Resource) -> Result<()> {
        let mut state = self.state.lock();
        state.reconfigure_requests += 1;
        if state.killed {
            return Err(HarnessError::infra("cluster is down"));
        }
        let controller_leader = state.partitions.get(&Resource::controller()).and_then(|p| p.leader);
        if controller_leader != Some(controller.id) {
            return Err(HarnessError::infra(format!("{} isn't the controller", controller)));
        }
        if replicas.is_empty() || replicas.iter().any(|n| self.node(n.id).is_none()) {
            return Err(HarnessError::infra("invalid replica set"));
        }
        let partition = state
            .partitions
            .get_mut(resource)
            .ok_or_else(|| HarnessError::infra(format!("unknown partition {}", resource)))?;
        partition.pending_replicas = Some((replicas.iter().map(|n| n.id).collect(), false));
        Ok(())
    }

    fn kill_everywhere(&self) -> Result<()> {
        let mut state = self.state.lock();
        state.killed = true;
        state.journal.push("cluster killed".to_string());
        Ok(())
    }

    fn wait_killed(&self, timeout: Duration) -> Result<()> {
        if self.is_killed() {
            Ok(())
        } else {
            Err(HarnessError::timeout("cluster still running", timeout))
        }
    }

    fn fetch_logs(&self, node: &Node, dest: &Path) -> Result<()> {
        let journal = {
            let mut state = self.state.lock();
            state.log_fetches += 1;
            if state.fail_log_fetches {
                return Err(HarnessError::infra(format!("{} unreachable", node.ip)));
            }
            state.journal.join("\n")
        };
        fs::write(dest.join("server.log"), format!("node {}\n{}\n", node, journal))?;
        Ok(())
    }

    fn committed_log(&self, resource: &Resource) -> Result<Box<dyn CommittedLogSource>> {
        let state = self.state.lock();
        let partition = state
            .partitions
            .get(resource)
            .ok_or_else(|| HarnessError::infra(format!("unknown partition {}", resource)))?;
        Ok(Box::new(MemoryLogSource::new(partition.log.clone())))
    }
}
