//! Wall clock used for pointing and delay timestamps.
//!
//! Time is read as a fixed UTC anchor plus the elapsed tokio time, so every
//! periodic task in the process sees the same monotonic timeline, including
//! under a paused test runtime.

use std::sync::OnceLock;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use tokio::time::Instant;

static ANCHOR: OnceLock<(Instant, DateTime<Utc>)> = OnceLock::new();

/// Current UTC time.
#[must_use]
pub fn now() -> DateTime<Utc> {
    let (base, wall) = *ANCHOR.get_or_init(|| (Instant::now(), Utc::now()));
    let elapsed = Instant::now().saturating_duration_since(base);
    ChronoDuration::from_std(elapsed).map_or(wall, |d| wall + d)
}

/// UTC time as fractional unix seconds.
#[must_use]
pub fn unix_seconds(at: DateTime<Utc>) -> f64 {
    at.timestamp() as f64 + f64::from(at.timestamp_subsec_nanos()) * 1e-9
}

/// Milliseconds since the unix epoch.
#[must_use]
pub fn unix_millis(at: DateTime<Utc>) -> f64 {
    at.timestamp_millis() as f64
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn clock_follows_tokio_time() {
        let before = now();
        tokio::time::advance(std::time::Duration::from_secs(10)).await;
        let after = now();

        let elapsed = (after - before).num_milliseconds();
        assert!((10_000..10_100).contains(&elapsed), "elapsed {elapsed} ms");
    }

    #[test]
    fn unix_seconds_keeps_fraction() {
        let at = DateTime::from_timestamp(1_700_000_000, 250_000_000).unwrap();
        assert!((unix_seconds(at) - 1_700_000_000.25).abs() < 1e-6);
        assert!((unix_millis(at) - 1_700_000_000_250.0).abs() < 1e-6);
    }
}
