//! NUT -> canonical name mapping
//!
//! A JSON file with three sections maps NUT variable names onto
//! canonical metric/inventory names. Entries may contain a single `#`
//! wildcard standing for a digit run, substituted into the target, e.g.
//! `"input.L#.current": "current.input.L#"`.

use crate::error::MonitorError;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;
use tracing::debug;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Mapping {
    #[serde(default, rename = "physicsMapping")]
    physics: BTreeMap<String, String>,
    #[serde(default, rename = "inventoryMapping")]
    inventory: BTreeMap<String, String>,
    #[serde(default, rename = "sensorInventoryMapping")]
    sensor_inventory: BTreeMap<String, String>,
}

impl Mapping {
    /// Load the mapping file. Replaces any previously loaded mapping.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, MonitorError> {
        let text = std::fs::read_to_string(path.as_ref())?;
        let mapping: Mapping =
            serde_json::from_str(&text).map_err(|e| MonitorError::Mapping(e.to_string()))?;
        debug!(
            physics = mapping.physics.len(),
            inventory = mapping.inventory.len(),
            sensor_inventory = mapping.sensor_inventory.len(),
            "mapping loaded"
        );
        Ok(mapping)
    }

    pub fn is_empty(&self) -> bool {
        self.physics.is_empty() && self.inventory.is_empty()
    }

    pub fn map_physics(&self, nut_name: &str) -> Option<String> {
        map_name(&self.physics, nut_name)
    }

    pub fn map_inventory(&self, nut_name: &str) -> Option<String> {
        map_name(&self.inventory, nut_name)
    }

    pub fn map_sensor_inventory(&self, nut_name: &str) -> Option<String> {
        map_name(&self.sensor_inventory, nut_name)
    }

    #[cfg(test)]
    pub fn for_tests() -> Self {
        let entry = |pairs: &[(&str, &str)]| -> BTreeMap<String, String> {
            pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect()
        };
        Self {
            physics: entry(&[
                ("ups.load", "load.default"),
                ("ups.status", "status.ups"),
                ("ups.alarm", "ups.alarm"),
                ("ups.test.result", "ups.test.result"),
                ("input.L#.current", "current.input.L#"),
                ("input.L#.load", "load.input.L#"),
                ("input.current.nominal", "current.input.nominal"),
                ("outlet.#.status", "status.outlet.#"),
                ("battery.charge", "charge.battery"),
            ]),
            inventory: entry(&[
                ("ups.model", "model"),
                ("ups.serial", "serial_no"),
                ("ups.mfr", "manufacturer"),
            ]),
            sensor_inventory: entry(&[
                ("ambient.#.mfr", "ambient.#.manufacturer"),
                ("ambient.#.model", "ambient.#.model"),
                ("ambient.#.serial", "ambient.#.serial_no"),
            ]),
        }
    }
}

/// Apply one mapping table: exact match first, then the `#` wildcard
/// patterns with the captured digits substituted into the target.
fn map_name(table: &BTreeMap<String, String>, nut_name: &str) -> Option<String> {
    if let Some(target) = table.get(nut_name) {
        return Some(target.clone());
    }

    for (pattern, target) in table {
        let Some(hash) = pattern.find('#') else {
            continue;
        };
        let (prefix, suffix) = (&pattern[..hash], &pattern[hash + 1..]);
        if !nut_name.starts_with(prefix) || !nut_name.ends_with(suffix) {
            continue;
        }
        let middle = &nut_name[prefix.len()..nut_name.len() - suffix.len()];
        if !middle.is_empty() && middle.chars().all(|c| c.is_ascii_digit()) {
            return Some(target.replacen('#', middle, 1));
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn exact_and_wildcard_mapping() {
        let mapping = Mapping::for_tests();
        assert_eq!(mapping.map_physics("ups.load").unwrap(), "load.default");
        assert_eq!(
            mapping.map_physics("input.L1.current").unwrap(),
            "current.input.L1"
        );
        assert_eq!(
            mapping.map_physics("outlet.12.status").unwrap(),
            "status.outlet.12"
        );
        assert!(mapping.map_physics("input.Lx.current").is_none());
        assert!(mapping.map_physics("nothing.at.all").is_none());
    }

    #[test]
    fn load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{
  "physicsMapping": {{ "ups.load": "load.default" }},
  "inventoryMapping": {{ "ups.model": "model" }}
}}"#
        )
        .unwrap();

        let mapping = Mapping::load(file.path()).unwrap();
        assert_eq!(mapping.map_physics("ups.load").unwrap(), "load.default");
        assert_eq!(mapping.map_inventory("ups.model").unwrap(), "model");
        assert!(!mapping.is_empty());
    }

    #[test]
    fn malformed_file_is_a_mapping_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "this is not json").unwrap();
        assert!(matches!(
            Mapping::load(file.path()),
            Err(MonitorError::Mapping(_))
        ));
    }
}
