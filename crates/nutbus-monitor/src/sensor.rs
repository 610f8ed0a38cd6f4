//! Environmental sensor records
//!
//! A sensor is an asset resolved to its NUT host and ambient index:
//! index 0 for a legacy EMP001, 1..N for addressable EMP002 units. The
//! record keeps the last measurements, ordered contact states and the
//! child map linking EMP001 dry-contact ports to `sensorgpio` assets.

use crate::mapping::Mapping;
use nutbus_proto::MetricMessage;
use nutbus_state::Asset;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

pub type ChildrenMap = BTreeMap<String, String>;

#[derive(Debug, Clone)]
pub struct Sensor {
    asset: Arc<Asset>,
    /// Parent asset name; may differ from the asset record after legacy
    /// port re-homing.
    location: String,
    /// Daisy-chain position of the parent (0 = standalone).
    chain: u32,
    /// NUT device the measurements are read from.
    nut_master: String,
    /// Ambient index on the master; 0 for EMP001.
    index: u32,
    /// GPI port -> child sensorgpio asset name.
    children: ChildrenMap,

    temperature: Option<String>,
    humidity: Option<String>,
    contacts: Vec<String>,
    inventory: BTreeMap<String, String>,
}

impl Sensor {
    pub fn new(
        asset: Arc<Asset>,
        location: String,
        chain: u32,
        nut_master: String,
        index: u32,
        children: ChildrenMap,
    ) -> Self {
        Self {
            asset,
            location,
            chain,
            nut_master,
            index,
            children,
            temperature: None,
            humidity: None,
            contacts: Vec::new(),
            inventory: BTreeMap::new(),
        }
    }

    pub fn asset_name(&self) -> &str {
        self.asset.name()
    }

    pub fn location(&self) -> &str {
        &self.location
    }

    pub fn chain(&self) -> u32 {
        self.chain
    }

    pub fn nut_master(&self) -> &str {
        &self.nut_master
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn children(&self) -> &ChildrenMap {
        &self.children
    }

    pub fn inventory(&self) -> &BTreeMap<String, String> {
        &self.inventory
    }

    /// Port used in topics: the asset's port when set, the resolved
    /// index otherwise.
    pub fn display_port(&self) -> String {
        let port = self.asset.port();
        if port.is_empty() {
            self.index.to_string()
        } else {
            port.to_string()
        }
    }

    /// Prefix of the sensor inside the NUT variable namespace. A sensor
    /// on a daisy chain is always addressed through the master position.
    pub fn nut_prefix(&self) -> String {
        let mut prefix = String::new();
        if self.chain != 0 {
            prefix.push_str("device.1.");
        }
        prefix.push_str("ambient.");
        if self.index != 0 {
            prefix.push_str(&format!("{}.", self.index));
        }
        prefix
    }

    /// External naming prefix, addressed through the parent's own chain
    /// position.
    pub fn sensor_prefix(&self) -> String {
        let mut prefix = String::new();
        if self.chain != 0 {
            prefix.push_str(&format!("device.{}.", self.chain));
        }
        prefix.push_str("ambient.");
        let port = self.asset.port();
        if !port.is_empty() && port != "0" {
            prefix.push_str(&format!("{port}."));
        }
        prefix
    }

    /// `.<port>@<location>`
    pub fn topic_suffix(&self) -> String {
        format!(".{}@{}", self.display_port(), self.location)
    }

    /// `.GPI<gpi>.<port>@<location>` for dry-contact children.
    pub fn topic_suffix_external(&self, gpi_port: &str) -> String {
        format!(".GPI{}.{}@{}", gpi_port, self.display_port(), self.location)
    }

    /// Refresh measurements from the master's variable dump.
    pub fn update_from_vars(&mut self, vars: &BTreeMap<String, Vec<String>>) {
        let prefix = self.nut_prefix();
        let first = |name: &str| -> Option<String> {
            vars.get(&format!("{prefix}{name}"))
                .and_then(|values| values.first())
                .cloned()
        };

        // presence gate, when the device reports one
        if let Some(present) = first("present") {
            if present != "yes" {
                debug!(
                    sensor = self.asset_name(),
                    master = %self.nut_master,
                    "sensor not present or disconnected"
                );
                return;
            }
        }

        match first("temperature") {
            Some(value) => self.temperature = Some(value),
            None => debug!(sensor = self.asset_name(), "temperature not present"),
        }
        match first("humidity") {
            Some(value) => self.humidity = Some(value),
            None => debug!(sensor = self.asset_name(), "humidity not present"),
        }

        self.contacts.clear();
        for contact in 1..=2 {
            let Some(state) = first(&format!("contacts.{contact}.status")) else {
                continue;
            };
            if state == "unknown" || state == "bad" {
                debug!(sensor = self.asset_name(), contact, %state, "contact state discarded");
                continue;
            }
            let state = if state == "active" || state == "inactive" {
                // EMP002 style: apply the configured polarity
                match first(&format!("contacts.{contact}.config")) {
                    Some(config) if config == "normal-opened" => {
                        if state == "active" { "closed" } else { "opened" }
                    }
                    Some(_) => {
                        if state == "active" { "opened" } else { "closed" }
                    }
                    None => {
                        debug!(sensor = self.asset_name(), contact, "dry-contact status without config");
                        continue;
                    }
                }
                .to_string()
            } else if state == "open" {
                // EMP001 legacy spelling
                "opened".to_string()
            } else {
                state
            };
            self.contacts.push(state);
        }
    }

    /// Refresh inventory attributes through the sensor-inventory
    /// mapping. EMP001 units expose no per-index inventory.
    pub fn update_inventory(&mut self, vars: &BTreeMap<String, Vec<String>>, mapping: &Mapping) {
        if self.index == 0 {
            return;
        }
        let chain_prefix = if self.chain != 0 { "device.1." } else { "" };
        let index_prefix = format!("ambient.{}.", self.index);

        for (key, values) in vars {
            let Some(stripped) = key.strip_prefix(chain_prefix) else {
                continue;
            };
            if !stripped.starts_with(&index_prefix) {
                continue;
            }
            let Some(mapped) = mapping.map_sensor_inventory(stripped) else {
                continue;
            };
            let Some(value) = values.first() else {
                continue;
            };
            // store under the attribute name, index prefix dropped
            let name = mapped
                .strip_prefix(&index_prefix)
                .unwrap_or(&mapped)
                .to_string();
            self.inventory.insert(name, value.clone());
        }
    }

    /// Metric batch for this sensor: (topic, message) pairs.
    pub fn collect_metrics(&self, ttl: u64) -> Vec<(String, MetricMessage)> {
        let mut metrics = Vec::new();
        let port = self.display_port();

        if let Some(temperature) = &self.temperature {
            let message = MetricMessage::new(
                format!("temperature.{port}"),
                self.location.clone(),
                temperature.clone(),
                "C",
                ttl,
            )
            .with_aux("port", &port)
            .with_aux("sname", self.asset_name());
            metrics.push((format!("temperature{}", self.topic_suffix()), message));
        }

        if let Some(humidity) = &self.humidity {
            let message = MetricMessage::new(
                format!("humidity.{port}"),
                self.location.clone(),
                humidity.clone(),
                "%",
                ttl,
            )
            .with_aux("port", &port)
            .with_aux("sname", self.asset_name());
            metrics.push((format!("humidity{}", self.topic_suffix()), message));
        }

        for (gpi, state) in self.contacts.iter().enumerate() {
            let gpi_port = (gpi + 1).to_string();
            let Some(child) = self.children.get(&gpi_port) else {
                debug!(
                    sensor = self.asset_name(),
                    gpi = %gpi_port,
                    "no child for dry-contact port"
                );
                continue;
            };
            let message = MetricMessage::new(
                format!("status.GPI{gpi_port}.{port}"),
                self.location.clone(),
                state.clone(),
                "",
                ttl,
            )
            .with_aux("port", &port)
            .with_aux("ext-port", &gpi_port)
            .with_aux("sname", child);
            metrics.push((
                format!("status{}", self.topic_suffix_external(&gpi_port)),
                message,
            ));
        }

        metrics
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nutbus_proto::{AssetMessage, AssetOperation};

    fn sensor_asset(name: &str, parent: &str, port: Option<&str>) -> Arc<Asset> {
        let mut msg = AssetMessage::new(name, AssetOperation::Create)
            .with_aux("type", "device")
            .with_aux("subtype", "sensor")
            .with_aux("parent_name.1", parent);
        if let Some(port) = port {
            msg = msg.with_ext("port", port);
        }
        Arc::new(Asset::from_message(&msg))
    }

    fn vars(pairs: &[(&str, &str)]) -> BTreeMap<String, Vec<String>> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), vec![v.to_string()]))
            .collect()
    }

    #[test]
    fn standalone_emp001_prefixes() {
        let sensor = Sensor::new(
            sensor_asset("a", "ups", None),
            "ups".into(),
            0,
            "ups".into(),
            0,
            ChildrenMap::new(),
        );
        assert_eq!(sensor.sensor_prefix(), "ambient.");
        assert_eq!(sensor.nut_prefix(), "ambient.");
        assert_eq!(sensor.topic_suffix(), ".0@ups");
    }

    #[test]
    fn standalone_emp002_prefixes() {
        let sensor = Sensor::new(
            sensor_asset("b", "ups", Some("2")),
            "ups".into(),
            0,
            "ups".into(),
            2,
            ChildrenMap::new(),
        );
        assert_eq!(sensor.sensor_prefix(), "ambient.2.");
        assert_eq!(sensor.nut_prefix(), "ambient.2.");
        assert_eq!(sensor.topic_suffix(), ".2@ups");
    }

    #[test]
    fn daisychain_follower_addresses_the_master_position() {
        // chain-2 parent, sub-address resolved to ambient index 3
        let sensor = Sensor::new(
            sensor_asset("s", "epdu-2", None),
            "epdu-2".into(),
            2,
            "epdu-1".into(),
            3,
            ChildrenMap::new(),
        );
        assert_eq!(sensor.nut_master(), "epdu-1");
        assert_eq!(sensor.nut_prefix(), "device.1.ambient.3.");
        assert_eq!(sensor.topic_suffix(), ".3@epdu-2");
        assert_eq!(sensor.chain(), 2);
    }

    #[test]
    fn daisychain_sensor_prefix_keeps_the_parent_chain() {
        let sensor = Sensor::new(
            sensor_asset("d", "epdu2", Some("3")),
            "epdu2".into(),
            2,
            "ups2".into(),
            3,
            ChildrenMap::new(),
        );
        assert_eq!(sensor.sensor_prefix(), "device.2.ambient.3.");
        assert_eq!(sensor.topic_suffix(), ".3@epdu2");
    }

    #[test]
    fn measurements_and_polarity() {
        let mut sensor = Sensor::new(
            sensor_asset("s", "ups", Some("1")),
            "ups".into(),
            0,
            "ups".into(),
            1,
            ChildrenMap::new(),
        );
        sensor.update_from_vars(&vars(&[
            ("ambient.1.temperature", "21.5"),
            ("ambient.1.humidity", "45"),
            ("ambient.1.contacts.1.status", "active"),
            ("ambient.1.contacts.1.config", "normal-opened"),
            ("ambient.1.contacts.2.status", "inactive"),
            ("ambient.1.contacts.2.config", "normal-closed"),
        ]));

        assert_eq!(sensor.temperature.as_deref(), Some("21.5"));
        assert_eq!(sensor.humidity.as_deref(), Some("45"));
        assert_eq!(sensor.contacts, vec!["closed", "closed"]);
    }

    #[test]
    fn emp001_open_is_normalized_and_bad_states_dropped() {
        let mut sensor = Sensor::new(
            sensor_asset("s", "ups", None),
            "ups".into(),
            0,
            "ups".into(),
            0,
            ChildrenMap::new(),
        );
        sensor.update_from_vars(&vars(&[
            ("ambient.contacts.1.status", "open"),
            ("ambient.contacts.2.status", "bad"),
        ]));
        assert_eq!(sensor.contacts, vec!["opened"]);
    }

    #[test]
    fn absent_sensor_skips_measurements() {
        let mut sensor = Sensor::new(
            sensor_asset("s", "ups", Some("1")),
            "ups".into(),
            0,
            "ups".into(),
            1,
            ChildrenMap::new(),
        );
        sensor.update_from_vars(&vars(&[
            ("ambient.1.present", "no"),
            ("ambient.1.temperature", "21.5"),
        ]));
        assert!(sensor.temperature.is_none());
    }

    #[test]
    fn contact_metrics_need_a_child() {
        let mut children = ChildrenMap::new();
        children.insert("1".to_string(), "sensorgpio-1".to_string());
        let mut sensor = Sensor::new(
            sensor_asset("s", "ups", None),
            "ups".into(),
            0,
            "ups".into(),
            0,
            children,
        );
        sensor.update_from_vars(&vars(&[
            ("ambient.contacts.1.status", "open"),
            ("ambient.contacts.2.status", "closed"),
        ]));

        let metrics = sensor.collect_metrics(240);
        // only the first contact has a child
        assert_eq!(metrics.len(), 1);
        let (topic, message) = &metrics[0];
        assert_eq!(topic, "status.GPI1.0@ups");
        assert_eq!(message.quantity, "status.GPI1.0");
        assert_eq!(message.value, "opened");
        assert_eq!(message.aux.get("sname").unwrap(), "sensorgpio-1");
        assert_eq!(message.ttl, 240);
    }

    #[test]
    fn temperature_metric_carries_port_and_sname() {
        let mut sensor = Sensor::new(
            sensor_asset("sensor-3", "epdu-2", None),
            "epdu-2".into(),
            2,
            "epdu-1".into(),
            3,
            ChildrenMap::new(),
        );
        sensor.update_from_vars(&vars(&[("device.1.ambient.3.temperature", "18")]));

        let metrics = sensor.collect_metrics(240);
        let (topic, message) = &metrics[0];
        assert_eq!(topic, "temperature.3@epdu-2");
        assert_eq!(message.quantity, "temperature.3");
        assert_eq!(message.asset, "epdu-2");
        assert_eq!(message.unit, "C");
        assert_eq!(message.aux.get("sname").unwrap(), "sensor-3");
    }

    #[test]
    fn inventory_goes_through_the_mapping() {
        let mut sensor = Sensor::new(
            sensor_asset("s", "ups", Some("2")),
            "ups".into(),
            0,
            "ups".into(),
            2,
            ChildrenMap::new(),
        );
        sensor.update_inventory(
            &vars(&[("ambient.2.mfr", "Eaton"), ("ambient.2.model", "EMPDT1H1C2")]),
            &Mapping::for_tests(),
        );
        assert_eq!(sensor.inventory().get("manufacturer").unwrap(), "Eaton");
        assert_eq!(sensor.inventory().get("model").unwrap(), "EMPDT1H1C2");
    }
}
