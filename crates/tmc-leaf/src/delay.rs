//! Periodic delay-model publication for the CSP subarray leaf.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tmc_core::config::DelayModelConfig;
use tmc_core::{clock, names, AttrValue, AttributeStore, TmcError, TmcResult};
use tmc_sky::{Antenna, AntennaTable, DelayModelCalculator, DelayModelDocument, SkyModel, Target};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// What the delay model is computed for. Captured from `AssignResources`
/// and `Configure`.
#[derive(Debug, Clone, Default)]
pub struct DelayTracking {
    /// Receptors assigned to the subarray.
    pub receptors: Vec<String>,
    /// Current pointing target.
    pub target: Option<Target>,
    /// Frequency slice ids of the current configuration.
    pub fsids: Vec<u64>,
}

struct Shared {
    attributes: Arc<AttributeStore>,
    table: AntennaTable,
    tracking: Mutex<DelayTracking>,
    // Held across compute and publish so documents are written in epoch order.
    calculator: Mutex<DelayModelCalculator>,
}

/// Publishes `delayModel` every interval while the mirrored obsState is
/// `CONFIGURING`, `READY` or `SCANNING`.
pub struct DelayPublisher {
    shared: Arc<Shared>,
    interval: Duration,
    token: Mutex<Option<CancellationToken>>,
}

impl DelayPublisher {
    /// Create an idle publisher writing to `attributes`.
    ///
    /// # Errors
    ///
    /// Returns `Config` when the antenna table is empty.
    pub fn new(
        attributes: Arc<AttributeStore>,
        sky: Arc<dyn SkyModel>,
        table: AntennaTable,
        config: &DelayModelConfig,
    ) -> TmcResult<Self> {
        let reference = table
            .reference()
            .ok_or_else(|| TmcError::config("antenna table is empty"))?;
        let calculator = DelayModelCalculator::new(
            sky,
            reference,
            Duration::from_secs(config.lookahead_secs),
        );
        Ok(Self {
            shared: Arc::new(Shared {
                attributes,
                table,
                tracking: Mutex::new(DelayTracking::default()),
                calculator: Mutex::new(calculator),
            }),
            interval: config.interval(),
            token: Mutex::new(None),
        })
    }

    /// Update the tracked receptors, target and fsids.
    pub fn update(&self, f: impl FnOnce(&mut DelayTracking)) {
        f(&mut self.shared.tracking.lock());
    }

    /// Snapshot of what is tracked.
    #[must_use]
    pub fn tracking(&self) -> DelayTracking {
        self.shared.tracking.lock().clone()
    }

    /// Whether the periodic task is running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.token
            .lock()
            .as_ref()
            .is_some_and(|token| !token.is_cancelled())
    }

    /// Start the periodic task. A running task is left alone.
    pub fn start(&self) {
        let mut slot = self.token.lock();
        if slot.as_ref().is_some_and(|token| !token.is_cancelled()) {
            return;
        }
        let token = CancellationToken::new();
        *slot = Some(token.clone());
        drop(slot);

        info!(
            fqdn = %self.shared.attributes.owner(),
            interval_secs = self.interval.as_secs(),
            "starting delay-model publisher"
        );
        tokio::spawn(publish_loop(self.shared.clone(), token, self.interval));
    }

    /// Stop the periodic task.
    pub fn stop(&self) {
        if let Some(token) = self.token.lock().take() {
            token.cancel();
        }
    }

    /// Compute and publish one document now, if the leaf is tracking.
    ///
    /// Returns the published document.
    ///
    /// # Errors
    ///
    /// Returns the sky model or fit error.
    pub fn publish_once(&self) -> TmcResult<Option<DelayModelDocument>> {
        publish(&self.shared)
    }
}

impl Drop for DelayPublisher {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for DelayPublisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DelayPublisher")
            .field("fqdn", &self.shared.attributes.owner())
            .field("interval", &self.interval)
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

async fn publish_loop(shared: Arc<Shared>, token: CancellationToken, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            biased;
            () = token.cancelled() => break,
            _ = ticker.tick() => {}
        }
        if let Err(e) = publish(&shared) {
            warn!(fqdn = %shared.attributes.owner(), error = %e, "delay model not published");
            shared
                .attributes
                .set_activity(format!("delay model not published: {e}"));
        }
    }
    debug!(fqdn = %shared.attributes.owner(), "delay-model publisher stopped");
}

fn publish(shared: &Shared) -> TmcResult<Option<DelayModelDocument>> {
    let tracks = shared
        .attributes
        .obs_state()
        .is_some_and(|state| state.tracks_delays());
    if !tracks {
        return Ok(None);
    }

    let tracking = shared.tracking.lock().clone();
    let Some(target) = tracking.target else {
        return Ok(None);
    };
    let (antennas, missing): (Vec<Antenna>, _) = shared.table.select(&tracking.receptors);
    if !missing.is_empty() {
        warn!(missing = ?missing, "receptors absent from the antenna table");
    }
    if antennas.is_empty() {
        return Ok(None);
    }

    let mut calculator = shared.calculator.lock();
    let document = calculator.compute(&target, &antennas, &tracking.fsids, clock::now())?;
    let encoded = serde_json::to_string(&document)?;
    shared
        .attributes
        .set(names::DELAY_MODEL, AttrValue::String(encoded));
    drop(calculator);

    debug!(epoch = document.epoch, receptors = antennas.len(), "delay model published");
    Ok(Some(document))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use tmc_core::config::DEFAULT_ANTENNA_TABLE;
    use tmc_core::ObsState;
    use tmc_sky::SphericalSkyModel;

    fn publisher(interval_secs: u64) -> (Arc<AttributeStore>, DelayPublisher) {
        let attributes = Arc::new(AttributeStore::new("ska_mid/tm_leaf_node/csp_subarray01"));
        let config = DelayModelConfig {
            update_interval_secs: interval_secs,
            lookahead_secs: 60,
        };
        let publisher = DelayPublisher::new(
            attributes.clone(),
            Arc::new(SphericalSkyModel::new()),
            AntennaTable::parse(DEFAULT_ANTENNA_TABLE).unwrap(),
            &config,
        )
        .unwrap();
        publisher.update(|t| {
            t.receptors = vec!["0001".into(), "0002".into()];
            t.target = Some(Target::parse("radec,21:08:47.92,-88:57:22.9").unwrap());
            t.fsids = vec![1, 2];
        });
        (attributes, publisher)
    }

    fn published(attributes: &AttributeStore) -> Option<DelayModelDocument> {
        let text = attributes.get(names::DELAY_MODEL)?;
        serde_json::from_str(text.as_str()?).ok()
    }

    #[test]
    fn idle_outside_tracking_states() {
        let (attributes, publisher) = publisher(10);
        attributes.set_obs_state(ObsState::Idle);
        assert!(publisher.publish_once().unwrap().is_none());
        assert!(attributes.get(names::DELAY_MODEL).is_none());
    }

    #[test]
    fn document_has_six_coefficients_per_fsid() {
        let (attributes, publisher) = publisher(10);
        attributes.set_obs_state(ObsState::Ready);
        publisher.publish_once().unwrap().unwrap();

        let document = published(&attributes).unwrap();
        assert_eq!(document.delay_details.len(), 2);
        for receptor in &document.delay_details {
            assert_eq!(receptor.receptor_delay_details.len(), 2);
            for fsid in &receptor.receptor_delay_details {
                assert_eq!(fsid.delay_coeff.len(), 6);
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn publishes_every_interval_with_rising_epochs() {
        let (attributes, publisher) = publisher(10);
        attributes.set_obs_state(ObsState::Configuring);

        let epochs = Arc::new(Mutex::new(Vec::new()));
        let sink = epochs.clone();
        attributes.subscribe(
            names::DELAY_MODEL,
            Arc::new(move |event| {
                if let Ok(AttrValue::String(text)) = event.value {
                    let document: DelayModelDocument = serde_json::from_str(&text).unwrap();
                    sink.lock().push(document.epoch);
                }
            }),
        );

        publisher.start();
        tokio::time::sleep(Duration::from_secs(35)).await;
        publisher.stop();

        let epochs = epochs.lock().clone();
        assert_eq!(epochs.len(), 4, "{epochs:?}");
        assert!(epochs.windows(2).all(|w| w[1] > w[0]));
        for pair in epochs.windows(2) {
            assert!((pair[1] - pair[0] - 10.0).abs() < 0.5);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn stop_halts_publication() {
        let (attributes, publisher) = publisher(10);
        attributes.set_obs_state(ObsState::Scanning);
        publisher.start();
        assert!(publisher.is_running());
        tokio::time::sleep(Duration::from_secs(1)).await;
        publisher.stop();
        let before = attributes.get(names::DELAY_MODEL);
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(attributes.get(names::DELAY_MODEL), before);
        assert!(!publisher.is_running());
    }
}
