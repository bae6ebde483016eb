//! Dish leaf node.
//!
//! Forwards mode commands to the dish master, converts the Configure target
//! into a stream of desired az/el positions and stops that stream on every
//! command that ends tracking.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use tmc_core::config::PointingConfig;
use tmc_core::device::unknown_command;
use tmc_core::transport::properties;
use tmc_core::{
    names, payload, AttributeStore, CommandResponse, DeviceServer, DishMode,
    PointingState, TmcError, TmcResult, Transport,
};
use tmc_sky::target::radec_from_pointing;
use tmc_sky::{Antenna, SkyModel, Target};
use tracing::{info, instrument};

use crate::context::LeafContext;
use crate::pointing::{PointingStreamer, StreamTarget};

/// Property naming the proxied dish master.
pub const DISH_MASTER_PROPERTY: &str = "DishMasterFQDN";

/// Property holding the receptor id of the dish, e.g. `0001`.
pub const RECEPTOR_ID_PROPERTY: &str = "ReceptorId";

/// Proxy for one dish master.
#[derive(Debug)]
pub struct DishLeaf {
    ctx: LeafContext,
    sky: Arc<dyn SkyModel>,
    antenna: Antenna,
    target: Mutex<Option<Target>>,
    streamer: PointingStreamer,
}

impl DishLeaf {
    /// Read properties, locate the antenna and start mirroring.
    ///
    /// # Errors
    ///
    /// Returns `Config` when a property is missing or the receptor is not in
    /// the antenna table, or the subscription error.
    pub async fn start(
        fqdn: &str,
        transport: Arc<dyn Transport>,
        sky: Arc<dyn SkyModel>,
        config: &PointingConfig,
    ) -> TmcResult<Arc<Self>> {
        let child = properties::string(transport.as_ref(), fqdn, DISH_MASTER_PROPERTY).await?;
        let receptor = properties::string(transport.as_ref(), fqdn, RECEPTOR_ID_PROPERTY).await?;
        let ctx = LeafContext::new(fqdn, child, transport);
        let antenna = ctx
            .antenna_table()
            .await?
            .get(&receptor)
            .cloned()
            .ok_or_else(|| {
                TmcError::config(format!("receptor {receptor} is not in the antenna table"))
            })?;

        ctx.mirror(&[
            names::STATE,
            names::HEALTH_STATE,
            names::POINTING_STATE,
            names::DISH_MODE,
            names::ACHIEVED_POINTING,
        ])
        .await?;
        info!(fqdn, dish = %ctx.child(), receptor = %antenna.name, "dish leaf started");
        Ok(Arc::new(Self {
            ctx,
            sky,
            antenna,
            target: Mutex::new(None),
            streamer: PointingStreamer::new(config),
        }))
    }

    /// Receptor id of the dish.
    #[must_use]
    pub fn receptor(&self) -> &str {
        &self.antenna.name
    }

    /// Current target, if one was configured.
    #[must_use]
    pub fn target(&self) -> Option<Target> {
        self.target.lock().clone()
    }

    /// Whether desired pointing is being streamed.
    #[must_use]
    pub fn is_tracking(&self) -> bool {
        self.streamer.is_running()
    }

    /// Mirrored dish mode.
    #[must_use]
    pub fn dish_mode(&self) -> Option<DishMode> {
        self.ctx
            .attributes()
            .get(names::DISH_MODE)
            .and_then(|v| v.as_dish_mode())
    }

    /// Mirrored pointing state.
    #[must_use]
    pub fn pointing_state(&self) -> Option<PointingState> {
        self.ctx
            .attributes()
            .get(names::POINTING_STATE)
            .and_then(|v| v.as_pointing())
    }

    fn start_stream(&self, target: Target) {
        self.streamer.start(StreamTarget {
            transport: self.ctx.transport().clone(),
            dish_master: self.ctx.child().to_owned(),
            sky: self.sky.clone(),
            antenna: self.antenna.clone(),
            target,
            attributes: self.ctx.attributes().clone(),
        });
    }

    async fn configure(&self, argin: Option<Value>) -> TmcResult<CommandResponse> {
        let document = payload::parse_object(argin)?;
        let pointing = document
            .get("pointing")
            .ok_or_else(|| TmcError::invalid_payload("missing key pointing"))?;
        let target = self.sky.to_target(&radec_from_pointing(pointing)?)?;
        let band = match payload::lookup(&document, &["dish", "receiverBand"]) {
            Some(Value::String(band)) => band.clone(),
            Some(Value::Number(band)) => band.to_string(),
            _ => return Err(TmcError::invalid_payload("missing key dish.receiverBand")),
        };

        self.streamer.stop();
        *self.target.lock() = Some(target.clone());
        self.ctx.call(&format!("ConfigureBand{band}"), None).await?;
        self.ctx.call("Track", None).await?;
        self.start_stream(target);
        Ok(CommandResponse::ok(format!(
            "Configure completed, tracking in band {band}"
        )))
    }

    async fn track(&self, argin: Option<Value>) -> TmcResult<CommandResponse> {
        let target = match argin {
            Some(Value::String(radec)) => self.sky.to_target(&radec)?,
            None | Some(Value::Null) => self
                .target()
                .ok_or_else(|| TmcError::invalid_payload("no target configured"))?,
            Some(other) => {
                return Err(TmcError::invalid_payload(format!(
                    "Track expects a radec string, got {other}"
                )))
            }
        };
        *self.target.lock() = Some(target.clone());
        self.ctx.call("Track", None).await?;
        self.start_stream(target);
        Ok(CommandResponse::ok("Track started"))
    }

    async fn stop_tracking(&self, command: &str) -> TmcResult<CommandResponse> {
        let was_tracking = self.streamer.stop();
        if command != "StopTrack" && command != "Abort" {
            *self.target.lock() = None;
        }
        if was_tracking || self.pointing_state() != Some(PointingState::Ready) {
            self.ctx.call("TrackStop", None).await?;
        }
        Ok(CommandResponse::ok(format!("{command} completed")))
    }
}

#[async_trait]
impl DeviceServer for DishLeaf {
    fn fqdn(&self) -> &str {
        self.ctx.fqdn()
    }

    fn attributes(&self) -> &AttributeStore {
        self.ctx.attributes()
    }

    #[instrument(skip(self, argin), fields(fqdn = %self.ctx.fqdn()))]
    async fn command_inout(&self, command: &str, argin: Option<Value>) -> TmcResult<CommandResponse> {
        match command {
            "SetStandbyLPMode" | "SetStandbyFPMode" | "SetStowMode" => {
                self.streamer.stop();
                self.ctx.call(command, None).await
            }
            "SetOperateMode" => self.ctx.call(command, None).await,
            "Configure" => self.configure(argin).await,
            "Track" => self.track(argin).await,
            "StopTrack" | "Abort" | "End" | "Restart" | "ObsReset" => {
                self.stop_tracking(command).await
            }
            "Scan" | "EndScan" => self.ctx.call(command, None).await,
            other => Err(unknown_command(self.fqdn(), other)),
        }
    }
}
