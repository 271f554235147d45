//! The `consistency` check: runs the oracle over the workload's log.

use std::time::Duration;

use serde_json::{json, Value};

use super::{validate_node_dir, RereadPolicy};
use crate::chaos::check::{Check, CheckContext, CheckOutcome};
use crate::chaos::config::CheckConfig;
use crate::chaos::severity::Severity;
use crate::cluster::Resource;
use crate::error::{HarnessError, Result};

pub const NAME: &str = "consistency";

pub struct ConsistencyCheck {
    policy: RereadPolicy,
}

impl ConsistencyCheck {
    pub fn new(policy: RereadPolicy) -> Self {
        ConsistencyCheck { policy }
    }

    /// Optional params: `reread_attempts`, `empty_poll_backoff_ms`.
    pub fn from_config(config: &CheckConfig) -> Result<Box<dyn Check>> {
        let mut policy = RereadPolicy::default();
        if let Some(v) = config.params.get("reread_attempts") {
            policy.attempts = v
                .as_u64()
                .and_then(|n| u32::try_from(n).ok())
                .ok_or_else(|| HarnessError::config("reread_attempts must be a non-negative integer"))?;
        }
        if let Some(v) = config.params.get("empty_poll_backoff_ms") {
            let ms = v
                .as_u64()
                .ok_or_else(|| HarnessError::config("empty_poll_backoff_ms must be a non-negative integer"))?;
            policy.empty_poll_backoff = Duration::from_millis(ms);
        }
        Ok(Box::new(ConsistencyCheck::new(policy)))
    }
}

fn unknown(reason: String) -> CheckOutcome {
    CheckOutcome::new(Severity::Unknown).with("error", Value::String(reason))
}

impl Check for ConsistencyCheck {
    fn check(&self, ctx: &CheckContext<'_>) -> Result<CheckOutcome> {
        let nodes = ctx.fleet.nodes();
        if nodes.len() != 1 {
            return Ok(unknown(format!(
                "can't validate {} workload nodes, expected exactly one",
                nodes.len()
            )));
        }
        let node = &nodes[0];

        let resource = Resource::topic(ctx.record.workload.topic());
        let mut source = match ctx.cluster.committed_log(&resource) {
            Ok(source) => source,
            Err(e) => return Ok(unknown(format!("can't open committed log of {}: {}", resource, e))),
        };

        let report = validate_node_dir(&ctx.experiment_dir.join(&node.ip), source.as_mut(), &self.policy);
        let mut outcome = CheckOutcome::new(report.result)
            .with("violations", serde_json::to_value(&report.violations)?)
            .with("stats", serde_json::to_value(&report.stats)?);
        if let Some(error) = report.error {
            outcome = outcome.with("error", json!(error));
        }
        Ok(outcome)
    }
}
