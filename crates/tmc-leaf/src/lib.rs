//! Leaf nodes of the TMC control plane.
//!
//! Each leaf is a 1:1 proxy for one sub-element device. It mirrors the
//! child's state onto its own attributes and translates commands:
//!
//! - **Master leaf**: power commands for the CSP, SDP and MCCS masters
//! - **CSP subarray leaf**: observation commands plus the delay-model publisher
//! - **SDP subarray leaf**: observation commands, `receiveAddresses`
//! - **MCCS subarray leaf**: observation commands, Low `Configure` translation
//! - **Dish leaf**: mode commands and the desired-pointing streamer

#![forbid(unsafe_code)]

pub mod context;
pub mod csp;
pub mod delay;
pub mod dish;
pub mod master;
pub mod mccs;
pub mod pointing;
pub mod sdp;
pub mod translate;

pub use context::LeafContext;
pub use csp::CspSubarrayLeaf;
pub use delay::DelayPublisher;
pub use dish::DishLeaf;
pub use master::MasterLeaf;
pub use mccs::MccsSubarrayLeaf;
pub use pointing::PointingStreamer;
pub use sdp::SdpSubarrayLeaf;
