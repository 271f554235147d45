//! Bounded-retry control operations.
//!
//! A control request being accepted does not mean it took effect, so every
//! operation here is "request, then confirm": the request step is retried on
//! error, the confirmation step polls the topology at a fixed interval. Both
//! share one wall-clock budget.

use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, error, info};

use super::{same_members, Cluster, Node, ReconfigurationStatus, Resource};
use crate::error::{HarnessError, Result};

/// Pacing of retried requests and convergence polls.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Pause after a rejected request before retrying it.
    pub request_pause: Duration,
    /// Interval between convergence polls.
    pub poll_interval: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            request_pause: Duration::from_secs(1),
            poll_interval: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    /// No pauses at all; used against in-process clusters.
    pub fn immediate() -> Self {
        RetryPolicy {
            request_pause: Duration::ZERO,
            poll_interval: Duration::ZERO,
        }
    }
}

fn remaining(begin: Instant, timeout: Duration) -> Duration {
    timeout.saturating_sub(begin.elapsed())
}

fn pause(d: Duration) {
    if !d.is_zero() {
        thread::sleep(d);
    }
}

/// Block until the topology reports `target` as the leader of `resource`.
pub fn wait_leader_is(
    cluster: &dyn Cluster,
    target: &Node,
    resource: &Resource,
    timeout: Duration,
    policy: RetryPolicy,
) -> Result<()> {
    let begin = Instant::now();
    loop {
        if let Ok(leader) = cluster.leader_of(resource, remaining(begin, timeout)) {
            if leader.id == target.id {
                return Ok(());
            }
        }
        if begin.elapsed() >= timeout {
            return Err(HarnessError::timeout(
                format!("{} didn't become leader of {}", target, resource),
                begin.elapsed(),
            ));
        }
        pause(policy.poll_interval);
    }
}

/// Move leadership of `resource` to `target`.
pub fn transfer_leadership_with_retry(
    cluster: &dyn Cluster,
    target: &Node,
    resource: &Resource,
    timeout: Duration,
    policy: RetryPolicy,
) -> Result<()> {
    let begin = Instant::now();
    let old_leader = cluster.leader_of(resource, timeout)?;
    debug!(target: "chaos", "{} leader: {}", resource, old_leader);
    if old_leader.id == target.id {
        return Ok(());
    }

    loop {
        if begin.elapsed() > timeout {
            return Err(HarnessError::timeout(
                format!("can't transfer leadership of {} to {}", resource, target),
                begin.elapsed(),
            ));
        }
        match cluster.request_leadership_transfer(target, resource) {
            Ok(()) => break,
            Err(e) => {
                error!(target: "chaos", "leadership transfer of {} to {} rejected: {}", resource, target, e);
                pause(policy.request_pause);
            }
        }
    }

    wait_leader_is(cluster, target, resource, remaining(begin, timeout), policy)?;
    debug!(target: "chaos", "{} leader: {}", resource, target);
    Ok(())
}

/// Move `resource` onto exactly `replicas` (set equality on node id).
pub fn reconfigure_with_retry(
    cluster: &dyn Cluster,
    replicas: &[Node],
    resource: &Resource,
    timeout: Duration,
    policy: RetryPolicy,
) -> Result<()> {
    info!(target: "chaos", "reconfiguring {}", resource);
    let begin = Instant::now();
    let current = cluster.details_of(resource, timeout)?;
    if current.has_replicas(replicas) {
        return Ok(());
    }

    let controller = cluster.leader_of(&Resource::controller(), remaining(begin, timeout))?;
    cluster.request_reconfigure(&controller, replicas, resource)?;

    loop {
        if begin.elapsed() > timeout {
            return Err(HarnessError::timeout(
                format!("can't reconfigure {}", resource),
                begin.elapsed(),
            ));
        }
        let details = cluster.details_of(resource, remaining(begin, timeout))?;
        if details.status == ReconfigurationStatus::Done && same_members(&details.replicas, replicas) {
            return Ok(());
        }
        pause(policy.poll_interval);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimCluster;

    fn topic() -> Resource {
        Resource::topic("chaos")
    }

    #[test]
    fn test_transfer_is_noop_when_target_leads() {
        let cluster = SimCluster::new(3, &["chaos"]);
        let leader = cluster.leader_of(&topic(), Duration::from_secs(1)).unwrap();
        transfer_leadership_with_retry(&cluster, &leader, &topic(), Duration::from_secs(1), RetryPolicy::immediate())
            .unwrap();
        assert_eq!(cluster.transfer_requests(), 0);
    }

    #[test]
    fn test_transfer_retries_rejected_requests() {
        let cluster = SimCluster::new(3, &["chaos"]);
        cluster.reject_next_transfers(3);
        let target = cluster.nodes()[2].clone();
        transfer_leadership_with_retry(&cluster, &target, &topic(), Duration::from_secs(5), RetryPolicy::immediate())
            .unwrap();
        assert_eq!(cluster.transfer_requests(), 4);
        assert_eq!(cluster.leader_of(&topic(), Duration::from_secs(1)).unwrap(), target);
    }

    #[test]
    fn test_transfer_times_out_when_leadership_never_moves() {
        let cluster = SimCluster::new(3, &["chaos"]);
        cluster.stall_convergence(true);
        let target = cluster.nodes()[1].clone();
        let err = transfer_leadership_with_retry(
            &cluster,
            &target,
            &topic(),
            Duration::from_millis(50),
            RetryPolicy::immediate(),
        )
        .unwrap_err();
        assert!(matches!(err, HarnessError::Timeout { .. }));
    }

    #[test]
    fn test_reconfigure_is_noop_on_equal_sets() {
        let cluster = SimCluster::new(3, &["chaos"]);
        let mut replicas = cluster.nodes();
        replicas.reverse();
        reconfigure_with_retry(&cluster, &replicas, &topic(), Duration::from_secs(1), RetryPolicy::immediate())
            .unwrap();
        assert_eq!(cluster.reconfigure_requests(), 0);
    }

    #[test]
    fn test_reconfigure_waits_for_done_and_matching_set() {
        let cluster = SimCluster::new(4, &["chaos"]);
        let nodes = cluster.nodes();
        let target = vec![nodes[1].clone(), nodes[2].clone(), nodes[3].clone()];
        reconfigure_with_retry(&cluster, &target, &topic(), Duration::from_secs(5), RetryPolicy::immediate())
            .unwrap();
        assert_eq!(cluster.reconfigure_requests(), 1);
        let details = cluster.details_of(&topic(), Duration::from_secs(1)).unwrap();
        assert!(details.has_replicas(&target));
        assert_eq!(details.status, ReconfigurationStatus::Done);
    }

    #[test]
    fn test_reconfigure_times_out_when_stuck() {
        let cluster = SimCluster::new(4, &["chaos"]);
        cluster.stall_convergence(true);
        let nodes = cluster.nodes();
        let target = vec![nodes[0].clone(), nodes[1].clone(), nodes[2].clone()];
        let err = reconfigure_with_retry(&cluster, &target, &topic(), Duration::from_millis(50), RetryPolicy::immediate())
            .unwrap_err();
        assert!(matches!(err, HarnessError::Timeout { .. }));
    }
}
