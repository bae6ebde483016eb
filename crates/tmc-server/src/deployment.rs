//! Assembly of a complete telescope on one [`LocalTransport`].
//!
//! Devices come up in dependency order: simulated sub-elements first, then
//! the leaf nodes that mirror them, then the subarray nodes and finally the
//! central node. Properties are written to the transport's property database
//! before each device reads them.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::Value;
use tmc_central::layout::{
    CSP_MASTER_LEAF_PROPERTY, DISH_LEAF_NODES_PROPERTY, MCCS_MASTER_LEAF_PROPERTY,
    SDP_MASTER_LEAF_PROPERTY, SUBARRAY_NODES_PROPERTY,
};
use tmc_central::CentralNode;
use tmc_core::{
    DeviceServer, LocalTransport, OpState, SubElementKind, Telescope, TmcConfig, TmcResult,
    Transport,
};
use tmc_leaf::context::ANTENNA_TABLE_PROPERTY;
use tmc_leaf::csp::CSP_SUBARRAY_PROPERTY;
use tmc_leaf::dish::{DISH_MASTER_PROPERTY, RECEPTOR_ID_PROPERTY};
use tmc_leaf::master::master_property;
use tmc_leaf::mccs::{MCCS_SUBARRAY_PROPERTY, STATION_REFERENCE_PROPERTY};
use tmc_leaf::sdp::SDP_SUBARRAY_PROPERTY;
use tmc_leaf::{CspSubarrayLeaf, DishLeaf, MasterLeaf, MccsSubarrayLeaf, SdpSubarrayLeaf};
use tmc_sim::{SimulatedDishMaster, SimulatedMaster, SimulatedSubarray};
use tmc_sky::SkyModel;
use tmc_subarray::composition::{
    CSP_LEAF_PROPERTY, DISH_LEAF_PREFIX_PROPERTY, MCCS_LEAF_PROPERTY, RECEPTOR_LIST_PROPERTY,
    SDP_LEAF_PROPERTY, SUBARRAY_ID_PROPERTY,
};
use tmc_subarray::SubarrayNode;
use tracing::{info, warn};

use crate::fqdn;

/// The simulated sub-element devices of a deployment.
#[derive(Debug, Default)]
pub struct Simulators {
    /// Sub-element masters by kind.
    pub masters: BTreeMap<SubElementKind, Arc<SimulatedMaster>>,
    /// Sub-element subarrays by kind, subarray 1 first.
    pub subarrays: BTreeMap<SubElementKind, Vec<Arc<SimulatedSubarray>>>,
    /// Dish masters by receptor id.
    pub dishes: BTreeMap<String, Arc<SimulatedDishMaster>>,
}

impl Simulators {
    /// Simulated subarray of `kind` for subarray `id`.
    #[must_use]
    pub fn subarray(&self, kind: SubElementKind, id: u32) -> Option<&Arc<SimulatedSubarray>> {
        let index = usize::try_from(id).ok()?.checked_sub(1)?;
        self.subarrays.get(&kind)?.get(index)
    }
}

/// Every device of one telescope, hosted on one transport.
pub struct Deployment {
    telescope: Telescope,
    transport: LocalTransport,
    /// The central node.
    pub central: Arc<CentralNode>,
    /// Subarray nodes, subarray 1 first.
    pub subarrays: Vec<Arc<SubarrayNode>>,
    /// CSP subarray leaves, subarray 1 first.
    pub csp_leaves: Vec<Arc<CspSubarrayLeaf>>,
    /// MCCS subarray leaves (Low), subarray 1 first.
    pub mccs_leaves: Vec<Arc<MccsSubarrayLeaf>>,
    /// Dish leaves (Mid) by receptor id.
    pub dish_leaves: BTreeMap<String, Arc<DishLeaf>>,
    /// Simulated sub-elements.
    pub sims: Simulators,
}

impl std::fmt::Debug for Deployment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Deployment")
            .field("telescope", &self.telescope)
            .field("devices", &self.transport.device_names().len())
            .finish_non_exhaustive()
    }
}

const fn observation_kinds(telescope: Telescope) -> &'static [SubElementKind] {
    match telescope {
        Telescope::Mid => &[SubElementKind::Csp, SubElementKind::Sdp],
        Telescope::Low => &[SubElementKind::Csp, SubElementKind::Sdp, SubElementKind::Mccs],
    }
}

fn register(transport: &LocalTransport, device: Arc<dyn DeviceServer>) -> TmcResult<()> {
    transport.register(device)
}

impl Deployment {
    /// Build and start every device described by `config`.
    ///
    /// # Errors
    ///
    /// Returns `Config` when the configuration is inconsistent, or the error
    /// of the first device that fails to start.
    pub async fn build(config: &TmcConfig, sky: Arc<dyn SkyModel>) -> TmcResult<Self> {
        config.validate()?;
        let telescope = config.telescope.kind;
        let transport = LocalTransport::new();
        let shared: Arc<dyn Transport> = Arc::new(transport.clone());
        let latency = config.simulation.transition_latency();
        let kinds = observation_kinds(telescope);
        let receptors: &[String] = match telescope {
            Telescope::Mid => &config.telescope.receptors,
            Telescope::Low => &[],
        };
        let subarray_ids: Vec<u32> = (1..=config.telescope.subarrays).collect();
        let mut sims = Simulators::default();

        for &kind in kinds {
            let sim = Arc::new(SimulatedMaster::new(&fqdn::master(telescope, kind)));
            register(&transport, sim.clone())?;
            transport.set_property(
                &fqdn::master_leaf(telescope, kind),
                master_property(kind),
                sim.fqdn(),
            );
            sims.masters.insert(kind, sim);
        }
        for &id in &subarray_ids {
            for &kind in kinds {
                let sim = Arc::new(SimulatedSubarray::new(
                    &fqdn::subarray(telescope, kind, id),
                    kind,
                    latency,
                ));
                register(&transport, sim.clone())?;
                let leaf = fqdn::subarray_leaf(telescope, kind, id);
                match kind {
                    SubElementKind::Csp => {
                        transport.set_property(&leaf, CSP_SUBARRAY_PROPERTY, sim.fqdn());
                        transport.set_property(&leaf, ANTENNA_TABLE_PROPERTY, config.antennas.table.as_str());
                    }
                    SubElementKind::Sdp => {
                        transport.set_property(&leaf, SDP_SUBARRAY_PROPERTY, sim.fqdn());
                    }
                    SubElementKind::Mccs => {
                        let reference = config.telescope.station_reference;
                        transport.set_property(&leaf, MCCS_SUBARRAY_PROPERTY, sim.fqdn());
                        transport.set_property(
                            &leaf,
                            STATION_REFERENCE_PROPERTY,
                            format!(
                                "{}, {}, {}",
                                reference.latitude, reference.longitude, reference.altitude
                            ),
                        );
                    }
                    SubElementKind::Dish => {}
                }
                sims.subarrays.entry(kind).or_default().push(sim);
            }
        }
        for receptor in receptors {
            let sim = Arc::new(SimulatedDishMaster::new(&fqdn::dish_master(receptor), latency));
            register(&transport, sim.clone())?;
            let leaf = fqdn::dish_leaf(receptor);
            transport.set_property(&leaf, DISH_MASTER_PROPERTY, sim.fqdn());
            transport.set_property(&leaf, RECEPTOR_ID_PROPERTY, receptor.as_str());
            transport.set_property(&leaf, ANTENNA_TABLE_PROPERTY, config.antennas.table.as_str());
            sims.dishes.insert(receptor.clone(), sim);
        }

        for &kind in kinds {
            let leaf = MasterLeaf::start(&fqdn::master_leaf(telescope, kind), kind, shared.clone()).await?;
            register(&transport, leaf)?;
        }
        let mut csp_leaves = Vec::new();
        let mut mccs_leaves = Vec::new();
        for &id in &subarray_ids {
            let csp = CspSubarrayLeaf::start(
                &fqdn::subarray_leaf(telescope, SubElementKind::Csp, id),
                shared.clone(),
                sky.clone(),
                &config.delay_model,
            )
            .await?;
            register(&transport, csp.clone())?;
            csp_leaves.push(csp);

            let sdp = SdpSubarrayLeaf::start(
                &fqdn::subarray_leaf(telescope, SubElementKind::Sdp, id),
                shared.clone(),
            )
            .await?;
            register(&transport, sdp)?;

            if telescope == Telescope::Low {
                let mccs = MccsSubarrayLeaf::start(
                    &fqdn::subarray_leaf(telescope, SubElementKind::Mccs, id),
                    shared.clone(),
                    sky.clone(),
                )
                .await?;
                register(&transport, mccs.clone())?;
                mccs_leaves.push(mccs);
            }
        }
        let mut dish_leaves = BTreeMap::new();
        for receptor in receptors {
            let leaf = DishLeaf::start(
                &fqdn::dish_leaf(receptor),
                shared.clone(),
                sky.clone(),
                &config.pointing,
            )
            .await?;
            register(&transport, leaf.clone())?;
            dish_leaves.insert(receptor.clone(), leaf);
        }

        let mut subarrays = Vec::new();
        for &id in &subarray_ids {
            let node = fqdn::subarray_node(telescope, id);
            transport.set_property(&node, SUBARRAY_ID_PROPERTY, id);
            transport.set_property(
                &node,
                CSP_LEAF_PROPERTY,
                fqdn::subarray_leaf(telescope, SubElementKind::Csp, id),
            );
            transport.set_property(
                &node,
                SDP_LEAF_PROPERTY,
                fqdn::subarray_leaf(telescope, SubElementKind::Sdp, id),
            );
            match telescope {
                Telescope::Mid => {
                    transport.set_property(&node, DISH_LEAF_PREFIX_PROPERTY, fqdn::dish_leaf_prefix());
                    transport.set_property(&node, RECEPTOR_LIST_PROPERTY, receptors.to_vec());
                }
                Telescope::Low => transport.set_property(
                    &node,
                    MCCS_LEAF_PROPERTY,
                    fqdn::subarray_leaf(telescope, SubElementKind::Mccs, id),
                ),
            }
            let subarray = SubarrayNode::start(&node, shared.clone(), config).await?;
            register(&transport, subarray.clone())?;
            subarrays.push(subarray);
        }

        let central_fqdn = fqdn::central_node(telescope);
        let master_leaf_properties = [
            (SubElementKind::Csp, CSP_MASTER_LEAF_PROPERTY),
            (SubElementKind::Sdp, SDP_MASTER_LEAF_PROPERTY),
            (SubElementKind::Mccs, MCCS_MASTER_LEAF_PROPERTY),
        ];
        for (kind, property) in master_leaf_properties {
            if kinds.contains(&kind) {
                transport.set_property(&central_fqdn, property, fqdn::master_leaf(telescope, kind));
            }
        }
        let subarray_fqdns: Vec<String> = subarrays.iter().map(|s| s.fqdn().to_owned()).collect();
        transport.set_property(&central_fqdn, SUBARRAY_NODES_PROPERTY, subarray_fqdns);
        if telescope == Telescope::Mid {
            let dish_fqdns: Vec<String> = receptors.iter().map(|r| fqdn::dish_leaf(r)).collect();
            transport.set_property(&central_fqdn, DISH_LEAF_NODES_PROPERTY, Value::from(dish_fqdns));
        }
        let central = CentralNode::start(&central_fqdn, shared, config).await?;
        register(&transport, central.clone())?;

        info!(
            telescope = %telescope,
            subarrays = subarrays.len(),
            receptors = receptors.len(),
            devices = transport.device_names().len(),
            "deployment ready"
        );
        Ok(Self {
            telescope,
            transport,
            central,
            subarrays,
            csp_leaves,
            mccs_leaves,
            dish_leaves,
            sims,
        })
    }

    /// Which telescope this is.
    #[must_use]
    pub const fn telescope(&self) -> Telescope {
        self.telescope
    }

    /// The transport hosting every device.
    #[must_use]
    pub const fn transport(&self) -> &LocalTransport {
        &self.transport
    }

    /// Subarray node `id`.
    #[must_use]
    pub fn subarray(&self, id: u32) -> Option<&Arc<SubarrayNode>> {
        let index = usize::try_from(id).ok()?.checked_sub(1)?;
        self.subarrays.get(index)
    }

    /// Put the telescope in standby if it is on, then stop hosting every
    /// device so their tasks wind down.
    pub async fn shutdown(self) {
        if self.central.attributes().op_state() == Some(OpState::On) {
            match self.central.command_inout("StandByTelescope", None).await {
                Ok(reply) if reply.is_success() => {}
                Ok(reply) => warn!(%reply, "standby incomplete during shutdown"),
                Err(e) => warn!(error = %e, "standby failed during shutdown"),
            }
        }
        let names = self.transport.device_names();
        for fqdn in &names {
            self.transport.deregister(fqdn);
        }
        info!(telescope = %self.telescope, devices = names.len(), "deployment stopped");
    }
}
