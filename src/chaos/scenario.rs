//! A scenario binds a deployment method to the workloads, faults and checks
//! it supports.

use std::collections::BTreeMap;
use std::sync::Arc;

use super::config::ExperimentRecord;
use super::registry::Catalog;
use crate::cluster::{Cluster, RetryPolicy};
use crate::error::Result;
use crate::workload::WorkloadFleet;

/// A cluster plus a running workload, ready for one experiment.
#[derive(Clone)]
pub struct Deployment {
    pub cluster: Arc<dyn Cluster>,
    pub fleet: Arc<dyn WorkloadFleet>,
}

pub trait Scenario: Send + Sync {
    fn name(&self) -> &str;

    fn catalog(&self) -> &Catalog;

    /// Start a fresh cluster and the record's workload on it.
    fn deploy(&self, record: &ExperimentRecord) -> Result<Deployment>;

    /// Pacing of control-operation retries against this deployment.
    fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::default()
    }
}

/// Scenarios known to a suite run, by name.
#[derive(Default)]
pub struct Scenarios {
    entries: BTreeMap<String, Box<dyn Scenario>>,
}

impl Scenarios {
    pub fn new() -> Self {
        Scenarios::default()
    }

    pub fn add(&mut self, scenario: Box<dyn Scenario>) {
        self.entries.insert(scenario.name().to_string(), scenario);
    }

    pub fn get(&self, name: &str) -> Option<&dyn Scenario> {
        self.entries.get(name).map(|s| s.as_ref())
    }
}
