//! Core building blocks for the TMC control plane.
//!
//! This crate provides what every control device shares:
//!
//! - **Types**: power, observation, health and pointing states, result codes
//! - **Transport**: the middleware abstraction and the in-process [`LocalTransport`]
//! - **Attributes**: per-device attribute store with change-event delivery
//! - **Observation state machine**: admission table and pending-command tracking
//! - **Aggregation**: health and observation roll-up over children
//! - **Events**: the bounded queue between transport callbacks and a device
//! - **Configuration**: figment-based deployment configuration

#![forbid(unsafe_code)]

pub mod aggregation;
pub mod attribute;
pub mod clock;
pub mod config;
pub mod device;
pub mod error;
pub mod events;
pub mod obs_state;
pub mod payload;
pub mod subscriptions;
pub mod transport;
pub mod types;

pub use attribute::{names, AttrValue, AttributeEvent, AttributeStore, EventCallback};
pub use config::TmcConfig;
pub use device::DeviceServer;
pub use error::{TmcError, TmcResult};
pub use events::{DeviceEvent, EventReceiver, EventSender, QueuedEvent, TimerKind};
pub use obs_state::{ObsCommand, ObsStateMachine};
pub use subscriptions::SubscriptionSet;
pub use transport::{CommandCompletion, LocalTransport, SubscriptionId, Transport};
pub use types::{
    CommandResponse, DishMode, HealthState, ObsState, OpState, PointingState, ResultCode,
    SubElementKind, Telescope,
};
