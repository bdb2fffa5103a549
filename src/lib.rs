//! Core library for the energy_fl campaign driver.
//!
//! Runs sweeps of federated learning experiments on a fleet of edge devices
//! while power collectors sample USB testers next to the parties. Every
//! experiment is recorded in a persistent ledger so an interrupted campaign
//! resumes where it stopped. The library is shared by the `energy_fl`
//! orchestrator binary and the `power_collector` binary deployed to
//! collectors.

pub mod artifacts;
pub mod bus;
pub mod config;
pub mod error;
pub mod error_recovery;
pub mod experiment;
pub mod ledger;
pub mod logging;
pub mod orchestrator;
pub mod remote;
pub mod telemetry;
pub mod topology;
pub mod training;

pub use error::{AppResult, FleetError};
