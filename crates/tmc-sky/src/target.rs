//! Sky targets and their text descriptions.
//!
//! A target description is `radec,<RA>,<Dec>`, optionally preceded by a
//! name: `Polaris Australis,radec,21:08:47.92,-88:57:22.9`. Sexagesimal RA is
//! in hours, decimal RA in degrees. Dec is always degrees.

use serde_json::Value;
use tmc_core::{payload, TmcError, TmcResult};

use crate::time::normalize_degrees;

/// An equatorial target.
#[derive(Debug, Clone, PartialEq)]
pub struct Target {
    /// Optional display name.
    pub name: Option<String>,
    /// Right ascension in degrees, `[0, 360)`.
    pub ra: f64,
    /// Declination in degrees, `[-90, 90]`.
    pub dec: f64,
}

impl Target {
    /// Create a target from angles in degrees.
    ///
    /// # Errors
    ///
    /// Returns `InvalidTarget` when the declination is outside `[-90, 90]` or
    /// either angle is not finite.
    pub fn new(name: Option<String>, ra: f64, dec: f64) -> TmcResult<Self> {
        if !ra.is_finite() || !dec.is_finite() || !(-90.0..=90.0).contains(&dec) {
            return Err(TmcError::InvalidTarget(format!("ra {ra}, dec {dec}")));
        }
        Ok(Self {
            name,
            ra: normalize_degrees(ra),
            dec,
        })
    }

    /// Parse a `radec` description.
    ///
    /// # Errors
    ///
    /// Returns `InvalidTarget` when the text is not a `radec` description or
    /// an angle cannot be parsed.
    pub fn parse(description: &str) -> TmcResult<Self> {
        let fields: Vec<&str> = description.split(',').map(str::trim).collect();
        let invalid = || TmcError::InvalidTarget(description.to_owned());

        let (name, rest) = match fields.as_slice() {
            [tag, rest @ ..] if tag.eq_ignore_ascii_case("radec") => (None, rest),
            [name, tag, rest @ ..] if tag.eq_ignore_ascii_case("radec") => {
                (Some((*name).to_owned()), rest)
            }
            _ => return Err(invalid()),
        };
        let [ra, dec] = rest else {
            return Err(invalid());
        };

        let ra = parse_angle(ra, true).ok_or_else(invalid)?;
        let dec = parse_angle(dec, false).ok_or_else(invalid)?;
        Self::new(name.filter(|n| !n.is_empty()), ra, dec)
    }
}

/// Parse an angle. Sexagesimal `h:m:s` is scaled by 15 when `hours` is set.
fn parse_angle(text: &str, hours: bool) -> Option<f64> {
    if !text.contains(':') {
        return text.parse().ok();
    }

    let negative = text.starts_with('-');
    let mut value = 0.0;
    let mut scale = 1.0;
    for part in text.trim_start_matches(['-', '+']).split(':') {
        let component: f64 = part.parse().ok()?;
        if component < 0.0 {
            return None;
        }
        value += component / scale;
        scale *= 60.0;
    }
    if negative {
        value = -value;
    }
    Some(if hours { value * 15.0 } else { value })
}

/// Build the `radec,<RA>,<Dec>` description from a Configure `pointing`
/// block (`pointing.target.{RA,dec}`).
///
/// # Errors
///
/// Returns `InvalidPayload` when the keys are missing.
pub fn radec_from_pointing(pointing: &Value) -> TmcResult<String> {
    let ra = payload::require_str(pointing, &["target", "RA"])?;
    let dec = payload::require_str(pointing, &["target", "dec"])?;
    Ok(format!("radec,{ra},{dec}"))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use rstest::rstest;
    use serde_json::json;

    #[test]
    fn parses_sexagesimal() {
        let target = Target::parse("radec,21:08:47.92,-88:57:22.9").unwrap();
        assert!((target.ra - 317.199_666).abs() < 1e-5);
        assert!((target.dec + 88.956_361).abs() < 1e-5);
        assert!(target.name.is_none());
    }

    #[test]
    fn parses_named_decimal() {
        let target = Target::parse("Sgr A*, radec, 266.4168, -29.0078").unwrap();
        assert_eq!(target.name.as_deref(), Some("Sgr A*"));
        assert!((target.ra - 266.4168).abs() < 1e-9);
    }

    #[test]
    fn negative_zero_degrees() {
        let target = Target::parse("radec,00:00:00,-00:30:00").unwrap();
        assert!((target.dec + 0.5).abs() < 1e-12);
    }

    #[rstest]
    #[case("azel,10,20")]
    #[case("radec,12:00:00")]
    #[case("radec,12:xx:00,10")]
    #[case("radec,10,95")]
    #[case("")]
    fn rejects_bad_descriptions(#[case] text: &str) {
        assert!(matches!(Target::parse(text), Err(TmcError::InvalidTarget(_))));
    }

    #[test]
    fn description_from_pointing() {
        let pointing = json!({"target": {"system": "ICRS", "name": "Polaris Australis",
            "RA": "21:08:47.92", "dec": "-88:57:22.9"}});
        assert_eq!(
            radec_from_pointing(&pointing).unwrap(),
            "radec,21:08:47.92,-88:57:22.9"
        );
        assert!(radec_from_pointing(&json!({})).is_err());
    }
}
