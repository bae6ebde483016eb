//! Simulated sub-element devices.
//!
//! These stand in for the real CSP, SDP and MCCS subarrays, their masters
//! and the dish masters. They speak the same commands and publish the same
//! attributes, with configurable transition latency and per-command fault
//! injection, and are hosted on a [`tmc_core::LocalTransport`] like any
//! other device.

#![forbid(unsafe_code)]

pub mod dish;
pub mod faults;
pub mod master;
pub mod subarray;

pub use dish::SimulatedDishMaster;
pub use faults::{Fault, FaultTable};
pub use master::SimulatedMaster;
pub use subarray::SimulatedSubarray;
