//! In-process deployment: a simulated cluster, a threaded workload fleet
//! and faults that act on them. Backs the `sim` scenario and the tests.

pub mod cluster;
pub mod faults;
pub mod scenario;
pub mod workload;

use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{HarnessError, Result};

pub use cluster::SimCluster;
pub use scenario::SimScenario;
pub use workload::SimFleet;

/// The cluster of the experiment currently deployed by a [`SimScenario`].
/// Faults are built before deployment, so they resolve it when they act.
#[derive(Default)]
pub struct SimHandle {
    current: Mutex<Option<Arc<SimCluster>>>,
}

impl SimHandle {
    pub fn set(&self, cluster: Arc<SimCluster>) {
        *self.current.lock() = Some(cluster);
    }

    pub fn get(&self) -> Result<Arc<SimCluster>> {
        self.current
            .lock()
            .clone()
            .ok_or_else(|| HarnessError::infra("no simulated cluster deployed"))
    }
}
