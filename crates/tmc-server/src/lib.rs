//! Single-process TMC deployment.
//!
//! Hosts a whole telescope on one in-process transport: simulated
//! sub-elements, leaf nodes, subarray nodes and the central node.
//!
//! ```text
//! central_node
//!  ├── {csp,sdp,mccs}_master leaves ──► simulated masters
//!  ├── dish leaves (Mid) ──────────────► simulated dish masters
//!  └── tm_subarray_node/N
//!       ├── {csp,sdp,mccs}_subarrayNN leaves ──► simulated subarrays
//!       └── dish leaves (Mid)
//! ```
//!
//! # Configuration
//!
//! Configuration is read from `tmc.toml` in the current directory, an
//! optional file given with `--config`, then `TMC_` environment variables.
//!
//! ```toml
//! [telescope]
//! kind = "mid"
//! subarrays = 2
//! receptors = ["0001", "0002", "0003", "0004"]
//!
//! [commands]
//! timeout_secs = 60
//! ```

#![forbid(unsafe_code)]

pub mod config;
pub mod deployment;
pub mod fqdn;

pub use config::ConfigError;
pub use deployment::{Deployment, Simulators};
