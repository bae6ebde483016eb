//! Translation of the Low `Configure` document into the form the MCCS
//! subarray expects.

use chrono::{DateTime, Utc};
use serde_json::{json, Map, Value};
use tmc_core::{clock, payload, TmcError, TmcResult};
use tmc_sky::target::radec_from_pointing;
use tmc_sky::{Antenna, SkyModel};

/// Coordinate system whose targets already carry `Az` / `El`.
const HORIZON: &str = "horizon";

/// Rewrite a Low `Configure` document.
///
/// `station_beam_pointings` becomes `station_beams`; each beam gets the ids
/// of every configured station and `sky_coordinates = [t, az, 0.0, el, 0.0]`
/// in place of its `target`. RA/Dec targets are converted once, as seen from
/// `station` at `now`.
///
/// # Errors
///
/// Returns `InvalidPayload` for missing keys and `InvalidTarget` for a target
/// that cannot be parsed.
pub fn mccs_configure(
    document: &Value,
    sky: &dyn SkyModel,
    station: &Antenna,
    now: DateTime<Utc>,
) -> TmcResult<Value> {
    let stations = payload::require_array(document, &["stations"])?;
    let station_ids = stations
        .iter()
        .map(|station| payload::require_u64(station, &["station_id"]))
        .collect::<TmcResult<Vec<_>>>()?;

    let timestamp = clock::unix_seconds(now);
    let beams = payload::require_array(document, &["station_beam_pointings"])?
        .iter()
        .map(|pointing| {
            let (az, el) = beam_azel(pointing, sky, station, now)?;
            let mut beam: Map<String, Value> = pointing
                .as_object()
                .cloned()
                .ok_or_else(|| TmcError::invalid_payload("station beam pointing is not an object"))?;
            beam.remove("target");
            beam.insert("station_id".to_owned(), json!(station_ids));
            beam.insert(
                "sky_coordinates".to_owned(),
                json!([timestamp, az, 0.0, el, 0.0]),
            );
            Ok(Value::Object(beam))
        })
        .collect::<TmcResult<Vec<_>>>()?;

    let mut translated = document.clone();
    if let Some(object) = translated.as_object_mut() {
        object.remove("station_beam_pointings");
        object.insert("station_beams".to_owned(), Value::Array(beams));
    }
    Ok(translated)
}

fn beam_azel(
    pointing: &Value,
    sky: &dyn SkyModel,
    station: &Antenna,
    now: DateTime<Utc>,
) -> TmcResult<(f64, f64)> {
    let system = payload::require_str(pointing, &["target", "system"])?;
    if system.eq_ignore_ascii_case(HORIZON) {
        let az = payload::require_f64(pointing, &["target", "Az"])?;
        let el = payload::require_f64(pointing, &["target", "El"])?;
        return Ok((az, el));
    }
    let target = sky.to_target(&radec_from_pointing(pointing)?)?;
    sky.apparent_azel(&target, now, station)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use tmc_sky::{Lla, SphericalSkyModel};

    fn station() -> Antenna {
        Antenna::at("station", Lla::new(-26.8247, 116.7644, 377.0))
    }

    fn now() -> DateTime<Utc> {
        "2024-03-20T12:00:00Z".parse().unwrap()
    }

    fn low_configure(target: Value) -> Value {
        json!({
            "stations": [{"station_id": 1, "tile_ids": [1, 2]},
                         {"station_id": 2, "tile_ids": [3, 4]}],
            "station_beam_pointings": [{
                "station_beam_id": 1,
                "target": target,
                "update_rate": 0.0,
                "channels": [[0, 8, 1, 1], [8, 8, 2, 1]],
            }],
        })
    }

    #[test]
    fn horizon_target_is_copied() {
        let document = low_configure(json!({
            "system": "HORIZON", "name": "DriftScan", "Az": 180.0, "El": 45.0,
        }));
        let translated =
            mccs_configure(&document, &SphericalSkyModel::new(), &station(), now()).unwrap();

        assert!(translated.get("station_beam_pointings").is_none());
        let beam = &translated["station_beams"][0];
        assert!(beam.get("target").is_none());
        assert_eq!(beam["station_id"], json!([1, 2]));
        assert_eq!(beam["station_beam_id"], 1);
        assert_eq!(beam["channels"][1], json!([8, 8, 2, 1]));

        let coordinates = beam["sky_coordinates"].as_array().unwrap();
        assert_eq!(coordinates.len(), 5);
        assert_eq!(coordinates[1], 180.0);
        assert_eq!(coordinates[2], 0.0);
        assert_eq!(coordinates[3], 45.0);
        assert_eq!(coordinates[4], 0.0);
        assert_eq!(translated["stations"], document["stations"]);
    }

    #[test]
    fn radec_target_is_converted() {
        let document = low_configure(json!({
            "system": "ICRS", "name": "SCP", "RA": "0:0:0", "dec": "-90:0:0",
        }));
        let translated =
            mccs_configure(&document, &SphericalSkyModel::new(), &station(), now()).unwrap();
        let coordinates = translated["station_beams"][0]["sky_coordinates"]
            .as_array()
            .unwrap();
        let el = coordinates[3].as_f64().unwrap();
        // The celestial pole sits at the site's latitude.
        assert!((el - 26.8247).abs() < 0.2, "el {el}");
    }

    #[test]
    fn missing_stations_is_invalid() {
        let document = json!({"station_beam_pointings": []});
        let err = mccs_configure(&document, &SphericalSkyModel::new(), &station(), now())
            .unwrap_err();
        assert_eq!(err.kind(), "InvalidPayload");
    }
}
