//! Central node of the TMC control plane.
//!
//! - **Layout**: master leaves, subarray nodes and dish leaves of the telescope
//! - **Routing**: resource commands to the selected subarray, cross-subarray
//!   receptor check
//! - **Node**: telescope start-up and standby, telescope health roll-up

#![forbid(unsafe_code)]

pub mod layout;
pub mod node;
pub mod routing;

pub use layout::TelescopeLayout;
pub use node::CentralNode;
