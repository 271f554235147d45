//! Fault contract.
//!
//! A fault is either recoverable (inject, then heal, always paired within
//! one experiment) or one-off (a single action whose effect persists or
//! resolves by itself during recovery). How a fault is physically realized
//! is up to its implementation.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::config::ExperimentRecord;
use crate::cluster::{Cluster, RetryPolicy};
use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FaultType {
    Recoverable,
    #[serde(rename = "ONEOFF")]
    OneOff,
}

impl fmt::Display for FaultType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FaultType::Recoverable => f.write_str("RECOVERABLE"),
            FaultType::OneOff => f.write_str("ONEOFF"),
        }
    }
}

/// What a fault gets to act on.
pub struct FaultContext<'a> {
    pub cluster: &'a dyn Cluster,
    pub record: &'a ExperimentRecord,
    pub retry: RetryPolicy,
}

/// A fault that owns the transient state it creates and fully reverses it.
pub trait RecoverableFault: Send {
    /// Human-readable description.
    fn name(&self) -> &str;

    fn inject(&mut self, ctx: &FaultContext<'_>) -> Result<()>;

    fn heal(&mut self, ctx: &FaultContext<'_>) -> Result<()>;
}

/// A single irreversible action.
pub trait OneOffFault: Send {
    fn name(&self) -> &str;

    fn execute(&mut self, ctx: &FaultContext<'_>) -> Result<()>;
}

pub enum Fault {
    Recoverable(Box<dyn RecoverableFault>),
    OneOff(Box<dyn OneOffFault>),
}

impl Fault {
    pub fn fault_type(&self) -> FaultType {
        match self {
            Fault::Recoverable(_) => FaultType::Recoverable,
            Fault::OneOff(_) => FaultType::OneOff,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Fault::Recoverable(f) => f.name(),
            Fault::OneOff(f) => f.name(),
        }
    }
}

impl fmt::Debug for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fault")
            .field("type", &self.fault_type())
            .field("name", &self.name())
            .finish()
    }
}
