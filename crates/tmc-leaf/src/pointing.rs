//! Desired-pointing streamer.
//!
//! While a dish tracks, a task computes the target's az/el for the dish at a
//! fixed cadence and writes `[timestamp_ms, az, el]` to the dish master.
//! Samples outside the elevation window are skipped and reported through
//! `activityMessage`. One cancellation token stops the task; nothing is
//! written after it is cancelled.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tmc_core::config::PointingConfig;
use tmc_core::{clock, names, AttrValue, AttributeStore, TmcError, Transport};
use tmc_sky::{Antenna, SkyModel, Target};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Everything the streaming task needs.
#[derive(Clone)]
pub struct StreamTarget {
    /// Transport to reach the dish master.
    pub transport: Arc<dyn Transport>,
    /// Dish master fqdn.
    pub dish_master: String,
    /// Sky model.
    pub sky: Arc<dyn SkyModel>,
    /// Antenna of the dish.
    pub antenna: Antenna,
    /// Target to track.
    pub target: Target,
    /// Store receiving activity messages.
    pub attributes: Arc<AttributeStore>,
}

/// Owns at most one running streaming task.
#[derive(Debug)]
pub struct PointingStreamer {
    cadence: Duration,
    elevation_min: f64,
    elevation_max: f64,
    token: Mutex<Option<CancellationToken>>,
}

impl PointingStreamer {
    /// Create an idle streamer.
    #[must_use]
    pub fn new(config: &PointingConfig) -> Self {
        Self {
            cadence: config.cadence(),
            elevation_min: config.elevation_min,
            elevation_max: config.elevation_max,
            token: Mutex::new(None),
        }
    }

    /// Whether a task is running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.token
            .lock()
            .as_ref()
            .is_some_and(|token| !token.is_cancelled())
    }

    /// Start streaming, replacing any running task.
    pub fn start(&self, stream: StreamTarget) {
        let token = CancellationToken::new();
        if let Some(previous) = self.token.lock().replace(token.clone()) {
            previous.cancel();
        }
        info!(
            dish = %stream.dish_master,
            ra = stream.target.ra,
            dec = stream.target.dec,
            "starting desired-pointing stream"
        );
        tokio::spawn(stream_loop(
            stream,
            token,
            self.cadence,
            (self.elevation_min, self.elevation_max),
        ));
    }

    /// Stop streaming. Returns `true` when a task was running.
    pub fn stop(&self) -> bool {
        match self.token.lock().take() {
            Some(token) => {
                let was_running = !token.is_cancelled();
                token.cancel();
                was_running
            }
            None => false,
        }
    }
}

impl Drop for PointingStreamer {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn stream_loop(
    stream: StreamTarget,
    token: CancellationToken,
    cadence: Duration,
    (min, max): (f64, f64),
) {
    let mut ticker = tokio::time::interval(cadence);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut visible = true;

    loop {
        tokio::select! {
            biased;
            () = token.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let now = clock::now();
        let (az, el) = match stream.sky.apparent_azel(&stream.target, now, &stream.antenna) {
            Ok(position) => position,
            Err(e) => {
                warn!(dish = %stream.dish_master, error = %e, "cannot compute pointing");
                stream.attributes.set_activity(format!("pointing error: {e}"));
                continue;
            }
        };

        if !(min..=max).contains(&el) {
            if visible {
                let err = TmcError::OutOfElevationLimits {
                    elevation: el,
                    min,
                    max,
                };
                debug!(dish = %stream.dish_master, error = %err, "skipping sample");
                stream
                    .attributes
                    .set_activity(format!("target not visible: {err}"));
                visible = false;
            }
            continue;
        }
        if !visible {
            stream.attributes.set_activity("target visible again");
            visible = true;
        }

        if token.is_cancelled() {
            break;
        }
        let sample = AttrValue::DoubleArray(vec![clock::unix_millis(now), az, el]);
        if let Err(e) = stream
            .transport
            .write_attr(&stream.dish_master, names::DESIRED_POINTING, sample)
            .await
        {
            warn!(dish = %stream.dish_master, error = %e, "desiredPointing write failed");
        }
    }
    debug!(dish = %stream.dish_master, "desired-pointing stream stopped");
}
