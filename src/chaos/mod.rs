//! Chaos experiments: configuration, fault and check contracts, the
//! orchestrator that drives one experiment, and the suite driver.

pub mod check;
pub mod config;
pub mod experiment;
pub mod fault;
pub mod registry;
pub mod runner;
pub mod scenario;
pub mod severity;
pub mod suite;
pub mod teardown;

#[cfg(test)]
mod tests;
