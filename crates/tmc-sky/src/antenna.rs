//! Static antenna table.
//!
//! One record per line: `name, ref_lat, ref_lon, ref_alt, enu_x, enu_y,
//! enu_z, ...`. Extra fields are ignored, as are blank lines and lines
//! starting with `#`. The antenna position is the reference position moved
//! by the ENU offset.

use tmc_core::{TmcError, TmcResult};

use crate::geodesy::{ecef_to_lla, enu_to_ecef, Ecef, Enu, Lla};

/// One antenna of the array.
#[derive(Debug, Clone, PartialEq)]
pub struct Antenna {
    /// Antenna name; receptor id for dishes.
    pub name: String,
    /// Array reference position.
    pub reference: Lla,
    /// Offset from the reference position.
    pub offset: Enu,
    /// Geodetic position of the antenna.
    pub position: Lla,
    /// ECEF position of the antenna.
    pub ecef: Ecef,
}

impl Antenna {
    /// Create an antenna from its reference position and offset.
    #[must_use]
    pub fn new(name: impl Into<String>, reference: Lla, offset: Enu) -> Self {
        let ecef = enu_to_ecef(offset, reference);
        Self {
            name: name.into(),
            reference,
            offset,
            position: ecef_to_lla(&ecef),
            ecef,
        }
    }

    /// Antenna sitting exactly on `reference`.
    #[must_use]
    pub fn at(name: impl Into<String>, reference: Lla) -> Self {
        Self::new(name, reference, Enu::default())
    }
}

/// Parsed antenna table.
#[derive(Debug, Clone, Default)]
pub struct AntennaTable {
    antennas: Vec<Antenna>,
}

impl AntennaTable {
    /// Parse table text.
    ///
    /// # Errors
    ///
    /// Returns `Config` naming the line when a record is short, has a
    /// non-numeric field or repeats a name.
    pub fn parse(text: &str) -> TmcResult<Self> {
        let mut antennas: Vec<Antenna> = Vec::new();

        for (index, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let line_no = index + 1;
            let fields: Vec<&str> = line.split(',').map(str::trim).collect();
            if fields.len() < 7 {
                return Err(TmcError::config(format!(
                    "antenna table line {line_no}: expected 7 fields, got {}",
                    fields.len()
                )));
            }

            let mut numbers = [0.0_f64; 6];
            for (slot, field) in numbers.iter_mut().zip(&fields[1..7]) {
                *slot = field.parse().map_err(|_| {
                    TmcError::config(format!(
                        "antenna table line {line_no}: '{field}' is not a number"
                    ))
                })?;
            }

            let name = fields[0];
            if antennas.iter().any(|a| a.name == name) {
                return Err(TmcError::config(format!(
                    "antenna table line {line_no}: duplicate antenna {name}"
                )));
            }

            let [lat, lon, alt, east, north, up] = numbers;
            antennas.push(Antenna::new(
                name,
                Lla::new(lat, lon, alt),
                Enu::new(east, north, up),
            ));
        }

        Ok(Self { antennas })
    }

    /// Antenna by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Antenna> {
        self.antennas.iter().find(|a| a.name == name)
    }

    /// Antennas for the given names, in that order. Unknown names are
    /// returned separately.
    #[must_use]
    pub fn select<'a>(&self, names: &'a [String]) -> (Vec<Antenna>, Vec<&'a str>) {
        let mut found = Vec::new();
        let mut missing = Vec::new();
        for name in names {
            match self.get(name) {
                Some(antenna) => found.push(antenna.clone()),
                None => missing.push(name.as_str()),
            }
        }
        (found, missing)
    }

    /// The array reference position as a zero-offset antenna, taken from the
    /// first record.
    #[must_use]
    pub fn reference(&self) -> Option<Antenna> {
        self.antennas
            .first()
            .map(|a| Antenna::at("reference", a.reference))
    }

    /// All antennas in table order.
    #[must_use]
    pub fn antennas(&self) -> &[Antenna] {
        &self.antennas
    }

    /// Number of antennas.
    #[must_use]
    pub fn len(&self) -> usize {
        self.antennas.len()
    }

    /// Whether the table is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.antennas.is_empty()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use tmc_core::config::DEFAULT_ANTENNA_TABLE;

    #[test]
    fn parses_default_table() {
        let table = AntennaTable::parse(DEFAULT_ANTENNA_TABLE).unwrap();
        assert_eq!(table.len(), 4);

        let first = table.get("0001").unwrap();
        assert!((first.position.latitude + 30.7130).abs() < 1e-9);

        let reference = table.reference().unwrap();
        assert!((reference.ecef - first.ecef).norm() < 1e-6);
        let second = table.get("0002").unwrap();
        assert!(((second.ecef - reference.ecef).norm() - 125.54).abs() < 0.1);
    }

    #[test]
    fn select_reports_missing() {
        let table = AntennaTable::parse(DEFAULT_ANTENNA_TABLE).unwrap();
        let names = vec!["0002".to_owned(), "0099".to_owned()];
        let (found, missing) = table.select(&names);
        assert_eq!(found.len(), 1);
        assert_eq!(missing, vec!["0099"]);
    }

    #[test]
    fn short_record_is_rejected() {
        let err = AntennaTable::parse("# header\n0001, 1.0, 2.0").unwrap_err();
        assert!(err.to_string().contains("line 2"));
    }

    #[test]
    fn extra_fields_are_ignored() {
        let table =
            AntennaTable::parse("SKA001, -30.7, 21.4, 1000, 1, 2, 3, 15.0, mid").unwrap();
        assert_eq!(table.get("SKA001").unwrap().offset, Enu::new(1.0, 2.0, 3.0));
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let text = "a, 0, 0, 0, 0, 0, 0\na, 0, 0, 0, 1, 0, 0";
        assert!(AntennaTable::parse(text).is_err());
    }
}
