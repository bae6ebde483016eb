//! Subarray node of the TMC control plane.
//!
//! A subarray node turns one observation command into commands for its
//! leaf nodes and folds their replies back into a single observation state:
//!
//! - **Composition**: which CSP, SDP, MCCS and dish leaves the node drives
//! - **Resources**: receptor and station allocation, duplicate checks
//! - **Split**: per-leaf payloads, including Mid cross-wiring
//! - **Orchestrator**: asynchronous fan-out and synchronous power calls
//! - **Node**: admission, resolution against child states, health roll-up

#![forbid(unsafe_code)]

pub mod composition;
mod event_loop;
pub mod node;
pub mod orchestrator;
pub mod resources;
pub mod scan_timer;
pub mod split;

pub use composition::Composition;
pub use node::SubarrayNode;
pub use resources::{AssignRequest, ResourceAssignment};
