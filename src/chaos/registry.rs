//! Name to factory tables for workloads, faults and checks.
//!
//! Configuration documents only ever name things; a scenario's [`Catalog`]
//! turns those names into live objects.

use std::collections::BTreeMap;
use std::sync::Arc;

use super::check::Check;
use super::config::{CheckConfig, ExperimentRecord, FaultConfig, ProgressParams, WorkloadConfig, PROGRESS_DURING_FAULT};
use super::fault::{Fault, FaultType};
use crate::error::{HarnessError, Result};

pub type FaultFactory = Arc<dyn Fn(&FaultConfig) -> Result<Fault> + Send + Sync>;
pub type CheckFactory = Arc<dyn Fn(&CheckConfig) -> Result<Box<dyn Check>> + Send + Sync>;
/// Validates a workload configuration. The fleet itself is started by the
/// scenario's deploy step.
pub type WorkloadFactory = Arc<dyn Fn(&WorkloadConfig) -> Result<()> + Send + Sync>;

pub struct Registry<F> {
    entries: BTreeMap<String, F>,
}

impl<F> Registry<F> {
    pub fn new() -> Self {
        Registry {
            entries: BTreeMap::new(),
        }
    }

    pub fn register(&mut self, name: impl Into<String>, factory: F) {
        self.entries.insert(name.into(), factory);
    }

    pub fn get(&self, name: &str) -> Option<&F> {
        self.entries.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }
}

impl<F> Default for Registry<F> {
    fn default() -> Self {
        Registry::new()
    }
}

/// Everything a scenario knows how to build.
#[derive(Default)]
pub struct Catalog {
    pub workloads: Registry<WorkloadFactory>,
    pub faults: Registry<FaultFactory>,
    pub checks: Registry<CheckFactory>,
}

impl Catalog {
    pub fn workload(&mut self, name: &str, factory: impl Fn(&WorkloadConfig) -> Result<()> + Send + Sync + 'static) {
        self.workloads.register(name, Arc::new(factory));
    }

    pub fn fault(&mut self, name: &str, factory: impl Fn(&FaultConfig) -> Result<Fault> + Send + Sync + 'static) {
        self.faults.register(name, Arc::new(factory));
    }

    pub fn check(
        &mut self,
        name: &str,
        factory: impl Fn(&CheckConfig) -> Result<Box<dyn Check>> + Send + Sync + 'static,
    ) {
        self.checks.register(name, Arc::new(factory));
    }

    pub fn build_fault(&self, config: &FaultConfig) -> Result<Fault> {
        let factory = self
            .faults
            .get(&config.name)
            .ok_or_else(|| HarnessError::config(format!("unknown fault: {}", config.name)))?;
        factory(config)
    }

    pub fn build_check(&self, config: &CheckConfig) -> Result<Box<dyn Check>> {
        let factory = self
            .checks
            .get(&config.name)
            .ok_or_else(|| HarnessError::config(format!("unknown check: {}", config.name)))?;
        factory(config)
    }

    /// Reject a configuration before any cluster state is touched.
    pub fn validate(&self, record: &ExperimentRecord) -> Result<()> {
        let workload = self
            .workloads
            .get(&record.workload.name)
            .ok_or_else(|| HarnessError::config(format!("unknown workload: {}", record.workload.name)))?;
        workload(&record.workload)?;

        let fault_type = match &record.fault {
            Some(config) => Some(self.build_fault(config)?.fault_type()),
            None => None,
        };

        for check in &record.checks {
            if check.is_progress_during_fault() {
                ProgressParams::from_check(check)?;
                match fault_type {
                    None => {
                        return Err(HarnessError::config(format!(
                            "{} works only with a fault",
                            PROGRESS_DURING_FAULT
                        )))
                    }
                    Some(FaultType::OneOff) => {
                        return Err(HarnessError::config(format!(
                            "{} works only with RECOVERABLE faults",
                            PROGRESS_DURING_FAULT
                        )))
                    }
                    Some(FaultType::Recoverable) => {}
                }
            } else if !self.checks.contains(&check.name) {
                return Err(HarnessError::config(format!("unknown check: {}", check.name)));
            }
        }
        Ok(())
    }
}
