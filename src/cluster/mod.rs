//! Cluster under test.
//!
//! The harness never speaks the cluster's wire protocol itself. Everything it
//! needs (topology queries, control requests, teardown, and an authoritative
//! read of the committed log) goes through the [`Cluster`] trait.

pub mod control;

use std::fmt;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::oracle::source::CommittedLogSource;

pub use control::{reconfigure_with_retry, transfer_leadership_with_retry, RetryPolicy};

/// Stable node identity inside the cluster.
pub type NodeId = u32;

/// A cluster (or workload) host.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    pub ip: String,
}

impl Node {
    pub fn new(id: NodeId, ip: impl Into<String>) -> Self {
        Node { id, ip: ip.into() }
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (id={})", self.ip, self.id)
    }
}

/// A partition addressed by namespace, topic and partition index.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Resource {
    pub namespace: String,
    pub topic: String,
    pub partition: u32,
}

impl Resource {
    pub fn new(namespace: impl Into<String>, topic: impl Into<String>, partition: u32) -> Self {
        Resource {
            namespace: namespace.into(),
            topic: topic.into(),
            partition,
        }
    }

    /// Partition 0 of a user topic.
    pub fn topic(topic: impl Into<String>) -> Self {
        Resource::new("kafka", topic, 0)
    }

    /// The partition whose leader accepts reconfiguration requests.
    pub fn controller() -> Self {
        Resource::new("redpanda", "controller", 0)
    }
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.namespace, self.topic, self.partition)
    }
}

/// Progress of a replica-set change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconfigurationStatus {
    Done,
    InProgress,
}

/// What a topology query returns for one partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionDetails {
    pub leader: Option<Node>,
    pub replicas: Vec<Node>,
    pub status: ReconfigurationStatus,
}

impl PartitionDetails {
    /// Set equality on node ids.
    pub fn has_replicas(&self, target: &[Node]) -> bool {
        same_members(&self.replicas, target)
    }
}

pub(crate) fn same_members(a: &[Node], b: &[Node]) -> bool {
    a.len() == b.len() && a.iter().all(|n| b.iter().any(|m| m.id == n.id))
}

/// Capability set the orchestrator, the faults and the oracle need from the
/// cluster. Every call blocks at most for the timeout it is given.
pub trait Cluster: Send + Sync {
    fn nodes(&self) -> Vec<Node>;

    /// Wait until the partition has a leader and return it.
    fn leader_of(&self, resource: &Resource, timeout: Duration) -> Result<Node>;

    /// Wait until the partition's details are available and return them.
    fn details_of(&self, resource: &Resource, timeout: Duration) -> Result<PartitionDetails>;

    /// Ask the cluster to move leadership. Acceptance does not imply
    /// completion.
    fn request_leadership_transfer(&self, target: &Node, resource: &Resource) -> Result<()>;

    /// Ask `controller` to move the partition to `replicas`.
    fn request_reconfigure(&self, controller: &Node, replicas: &[Node], resource: &Resource) -> Result<()>;

    fn kill_everywhere(&self) -> Result<()>;

    fn wait_killed(&self, timeout: Duration) -> Result<()>;

    /// Copy the node's server logs into `dest`.
    fn fetch_logs(&self, node: &Node, dest: &Path) -> Result<()>;

    /// Open a committed-only reader positioned at the start of the partition.
    fn committed_log(&self, resource: &Resource) -> Result<Box<dyn CommittedLogSource>>;
}
