//! Device polling engine
//!
//! Per polling interval: refresh raw NUT variables for every allowed
//! power device, map them to canonical quantities, synthesize the
//! derived values (ePDU load, alarm and status bitfields, power status,
//! outlet statuses) and publish metrics and inventory.

use crate::alarm::upsalarm_to_int;
use crate::device::NutDevice;
use crate::error::MonitorError;
use crate::mapping::Mapping;
use crate::status::{power_status, upsstatus_to_int, STATUS_ALARM};
use nutbus_client::NutClient;
use nutbus_proto::{subject, BusClient, InventoryMessage, MetricMessage};
use nutbus_state::Reader;
use std::collections::BTreeMap;
use std::path::Path;
use std::time::{Duration, Instant};
use tracing::{debug, error, warn};

/// Full inventory republish interval.
pub const INVENTORY_REPEAT: Duration = Duration::from_secs(3600);

const UNIT_TABLE: [(&str, &str); 11] = [
    ("temperature", "C"),
    ("realpower", "W"),
    ("voltage", "V"),
    ("current", "A"),
    ("load", "%"),
    ("charge", "%"),
    ("frequency", "Hz"),
    ("power", "VA"),
    ("runtime", "s"),
    ("timer", "s"),
    ("delay", "s"),
];

/// Unit inferred from the leading path component of a quantity.
pub fn unit_for_quantity(quantity: &str) -> &'static str {
    let head = quantity.split('.').next().unwrap_or("");
    UNIT_TABLE
        .iter()
        .find(|(name, _)| *name == head)
        .map(|(_, unit)| *unit)
        .unwrap_or("")
}

/// Trim a float to its shortest decimal representation.
pub fn format_value(value: f64) -> String {
    let text = format!("{value:.2}");
    text.trim_end_matches('0').trim_end_matches('.').to_string()
}

/// Derive `load.default` for ePDUs that do not publish it: reuse
/// `load.input.L1` when mapped, otherwise compute from
/// `current.input.L1` against the nominal or configured maximum.
pub fn derive_load_default(
    measurements: &BTreeMap<String, String>,
    max_current: Option<f64>,
) -> Option<String> {
    if measurements.contains_key("load.default") {
        return None;
    }
    if let Some(value) = measurements.get("load.input.L1") {
        return Some(value.clone());
    }

    let current: f64 = measurements.get("current.input.L1")?.parse().ok()?;
    let max = match measurements.get("current.input.nominal") {
        Some(nominal) => nominal.parse().ok()?,
        None => max_current?,
    };
    if max == 0.0 {
        return None;
    }
    Some(format_value(current * 100.0 / max))
}

/// Metric batch for one polled device.
pub fn collect_device_metrics(
    device: &mut NutDevice,
    metric_ttl: u64,
    status_ttl: u64,
) -> Vec<MetricMessage> {
    let asset = device.asset_name().to_string();
    let mut metrics = Vec::new();

    let measurements = device.physics(false);
    for (quantity, value) in &measurements {
        metrics.push(MetricMessage::new(
            quantity.clone(),
            asset.clone(),
            value.clone(),
            unit_for_quantity(quantity),
            metric_ttl,
        ));
        device.set_changed(quantity, false);
    }

    // ePDUs that do not publish load.default still have it derivable
    if device.subtype() == "epdu" {
        if let Some(value) = derive_load_default(&measurements, device.max_current()) {
            metrics.push(MetricMessage::new(
                "load.default",
                asset.clone(),
                value,
                "%",
                metric_ttl,
            ));
        }
    }

    // alarms as a bitfield
    let mut has_alarms = false;
    if let Some(alarms) = device.property("ups.alarm") {
        let bits = upsalarm_to_int(&alarms);
        has_alarms = bits != 0;
        if has_alarms {
            debug!(%asset, bits, %alarms, "active device alarms");
        }
        metrics.push(MetricMessage::new(
            "ups.alarm",
            asset.clone(),
            bits.to_string(),
            "",
            metric_ttl,
        ));
        device.set_changed("ups.alarm", false);
    }

    // status + test result as a bitfield; meaningless for ePDUs and
    // unusable while the driver reports nothing or WAIT
    if let Some(status) = device.property("status.ups") {
        if !status.is_empty() && status != "WAIT" && device.subtype() != "epdu" {
            let test = device
                .property("ups.test.result")
                .unwrap_or_else(|| "no test initiated".to_string());
            let mut bits = upsstatus_to_int(&status, &test);
            if has_alarms {
                bits |= STATUS_ALARM;
            }
            // status survives data-stale windows through the longer TTL
            metrics.push(MetricMessage::new(
                "status.ups",
                asset.clone(),
                bits.to_string(),
                "",
                status_ttl,
            ));
            metrics.push(MetricMessage::new(
                "power.status",
                asset.clone(),
                power_status(bits),
                "",
                status_ttl,
            ));
            device.set_changed("status.ups", false);
        }
    }

    // outlet statuses; contiguous numbering, stop at the first gap
    for outlet in 1..100 {
        let property = format!("status.outlet.{outlet}");
        let Some(status) = device.property(&property) else {
            break;
        };
        let value = if status == "on" { 42 } else { 0 };
        metrics.push(MetricMessage::new(
            property.clone(),
            asset.clone(),
            value.to_string(),
            "",
            metric_ttl,
        ));
        device.set_changed(&property, false);
    }

    metrics
}

/// The device polling engine.
pub struct NutAgent {
    reader: Reader,
    devices: BTreeMap<String, NutDevice>,
    mapping: Mapping,
    mapping_loaded: bool,
    metric_ttl: u64,
    last_inventory: Option<Instant>,
}

impl NutAgent {
    pub fn new(reader: Reader) -> Self {
        Self {
            reader,
            devices: BTreeMap::new(),
            mapping: Mapping::default(),
            mapping_loaded: false,
            metric_ttl: 60,
            last_inventory: None,
        }
    }

    pub fn load_mapping(&mut self, path: impl AsRef<Path>) -> Result<(), MonitorError> {
        self.mapping = Mapping::load(path)?;
        self.mapping_loaded = !self.mapping.is_empty();
        Ok(())
    }

    pub fn mapping_loaded(&self) -> bool {
        self.mapping_loaded
    }

    /// Metric TTL; status metrics go out with ttl * 3 / 2.
    pub fn set_ttl(&mut self, ttl: u64) {
        self.metric_ttl = ttl;
    }

    fn status_ttl(&self) -> u64 {
        self.metric_ttl * 3 / 2
    }

    /// Sync the device list with the committed catalog. Devices joining
    /// a daisy chain poll through their master's NUT name.
    pub fn update_device_list(&mut self) {
        if !self.reader.refresh() {
            return;
        }
        let state = self.reader.state();

        let mut devices = BTreeMap::new();
        for (name, asset) in state.power_devices() {
            let nut_name = if asset.daisy_chain() == 0 {
                name.clone()
            } else {
                let master = state.ip2master(asset.ip());
                if master.is_empty() {
                    debug!(asset = %name, "daisy-chain device without master, skipped");
                    continue;
                }
                master.to_string()
            };
            // keep accumulated state across refreshes
            match self.devices.remove(name) {
                Some(existing) if existing.nut_name() == nut_name => {
                    devices.insert(name.clone(), existing);
                }
                _ => {
                    devices.insert(name.clone(), NutDevice::new(asset.clone(), nut_name));
                }
            }
        }
        self.devices = devices;
    }

    /// One polling pass: refresh from NUT, publish metrics and
    /// inventory. Per-device errors never stop the loop.
    pub async fn on_poll(&mut self, nut: &mut NutClient, bus: &BusClient) {
        if !self.mapping_loaded {
            warn!("no mapping loaded, skipping device poll");
            return;
        }

        // one NUT read per distinct chain host
        let mut fetched: BTreeMap<String, BTreeMap<String, Vec<String>>> = BTreeMap::new();
        for device in self.devices.values() {
            if fetched.contains_key(device.nut_name()) {
                continue;
            }
            match nut.get_all_variables(device.nut_name()).await {
                Ok(vars) => {
                    fetched.insert(device.nut_name().to_string(), vars);
                }
                Err(err) => {
                    warn!(device = device.nut_name(), error = %err, "cannot read device from NUT");
                }
            }
        }

        let advertise_all = match self.last_inventory {
            Some(at) if at.elapsed() < INVENTORY_REPEAT => false,
            _ => {
                self.last_inventory = Some(Instant::now());
                true
            }
        };

        let metric_ttl = self.metric_ttl;
        let status_ttl = self.status_ttl();

        for device in self.devices.values_mut() {
            let Some(vars) = fetched.get(device.nut_name()) else {
                continue;
            };
            // regular cycles debounce insignificant measurement drifts
            // through the per-key candidate; the periodic full publish
            // forces adoption so a parked reading cannot linger
            device.update(vars, &self.mapping, advertise_all);

            for metric in collect_device_metrics(device, metric_ttl, status_ttl) {
                let topic =
                    subject::metric_topic(subject::DEVICE_METRICS, &metric.quantity, &metric.asset);
                if let Err(err) = bus.publish_json(topic, &metric).await {
                    error!(
                        quantity = %metric.quantity,
                        asset = %metric.asset,
                        error = %err,
                        "failed to send measurement"
                    );
                }
            }

            // status.ups is never advertised as inventory
            let mut items = device.inventory(!advertise_all);
            items.remove("status.ups");
            if items.is_empty() {
                continue;
            }
            for name in items.keys() {
                device.set_changed(name, false);
            }
            let message = InventoryMessage {
                asset: device.asset_name().to_string(),
                items,
            };
            let topic = subject::inventory_topic(&message.asset);
            debug!(%topic, "new inventory message");
            if let Err(err) = bus.publish_json(topic, &message).await {
                error!(asset = %message.asset, error = %err, "failed to send inventory");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nutbus_proto::{AssetMessage, AssetOperation};
    use nutbus_state::{Asset, StateManager};
    use std::sync::Arc;

    fn epdu(name: &str, max_current: Option<&str>) -> Arc<Asset> {
        let mut msg = AssetMessage::new(name, AssetOperation::Create)
            .with_aux("type", "device")
            .with_aux("subtype", "epdu")
            .with_ext("ip.1", "10.0.0.2");
        if let Some(max) = max_current {
            msg = msg.with_ext("max_current", max);
        }
        Arc::new(Asset::from_message(&msg))
    }

    fn measurements(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn units_follow_the_leading_component() {
        assert_eq!(unit_for_quantity("temperature.3"), "C");
        assert_eq!(unit_for_quantity("realpower.output.L1"), "W");
        assert_eq!(unit_for_quantity("load.default"), "%");
        assert_eq!(unit_for_quantity("runtime.battery"), "s");
        assert_eq!(unit_for_quantity("status.ups"), "");
    }

    #[test]
    fn load_default_prefers_the_mapped_phase_load() {
        let m = measurements(&[("load.input.L1", "37")]);
        assert_eq!(derive_load_default(&m, None).unwrap(), "37");
    }

    #[test]
    fn load_default_computed_from_nominal_current() {
        let m = measurements(&[("current.input.L1", "4.0"), ("current.input.nominal", "16")]);
        assert_eq!(derive_load_default(&m, None).unwrap(), "25");
    }

    #[test]
    fn load_default_falls_back_to_configured_maximum() {
        let m = measurements(&[("current.input.L1", "8")]);
        assert_eq!(derive_load_default(&m, Some(32.0)).unwrap(), "25");
        assert!(derive_load_default(&m, None).is_none());
        assert!(derive_load_default(&m, Some(0.0)).is_none());
    }

    #[test]
    fn existing_load_default_is_not_overridden() {
        let m = measurements(&[("load.default", "50"), ("current.input.L1", "4")]);
        assert!(derive_load_default(&m, Some(16.0)).is_none());
    }

    fn polled_device(pairs: &[(&str, &str)], asset: Arc<Asset>) -> NutDevice {
        let mut device = NutDevice::new(asset.clone(), asset.name().to_string());
        let vars: BTreeMap<String, Vec<String>> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), vec![v.to_string()]))
            .collect();
        device.update(&vars, &Mapping::for_tests(), true);
        device
    }

    #[test]
    fn epdu_metrics_include_derived_load() {
        let mut device = polled_device(
            &[("input.L1.current", "4.0"), ("input.current.nominal", "16")],
            epdu("epdu-7", None),
        );
        let metrics = collect_device_metrics(&mut device, 60, 90);
        let load = metrics
            .iter()
            .find(|m| m.quantity == "load.default")
            .expect("derived load.default");
        assert_eq!(load.value, "25");
        assert_eq!(load.unit, "%");
    }

    #[test]
    fn epdu_status_is_suppressed() {
        let mut device = polled_device(&[("ups.status", "OL")], epdu("epdu-7", None));
        let metrics = collect_device_metrics(&mut device, 60, 90);
        assert!(!metrics.iter().any(|m| m.quantity == "status.ups"));
    }

    #[test]
    fn ups_status_and_power_status_with_longer_ttl() {
        let ups = Arc::new(Asset::from_message(
            &AssetMessage::new("ups-1", AssetOperation::Create)
                .with_aux("type", "device")
                .with_aux("subtype", "ups")
                .with_ext("ip.1", "10.0.0.1"),
        ));
        let mut device = polled_device(&[("ups.status", "OL CHRG")], ups);
        let metrics = collect_device_metrics(&mut device, 60, 90);

        let status = metrics.iter().find(|m| m.quantity == "status.ups").unwrap();
        assert_eq!(status.ttl, 90);
        assert_eq!(
            status.value,
            (crate::status::STATUS_OL | crate::status::STATUS_CHRG).to_string()
        );
        let power = metrics.iter().find(|m| m.quantity == "power.status").unwrap();
        assert_eq!(power.value, "online");
        assert_eq!(power.ttl, 90);
    }

    #[test]
    fn outlet_statuses_stop_at_the_first_gap() {
        let mut device = polled_device(
            &[("outlet.1.status", "on"), ("outlet.2.status", "off"), ("outlet.4.status", "on")],
            epdu("epdu-7", None),
        );
        let metrics = collect_device_metrics(&mut device, 60, 90);
        let outlets: Vec<_> = metrics
            .iter()
            .filter(|m| m.quantity.starts_with("status.outlet."))
            .collect();
        assert_eq!(outlets.len(), 2);
        assert_eq!(outlets[0].value, "42");
        assert_eq!(outlets[1].value, "0");
    }

    #[test]
    fn device_list_follows_the_catalog() {
        let manager = StateManager::new();
        let mut writer = manager.writer();
        let mut agent = NutAgent::new(manager.reader());

        writer.state().update_from_asset(
            &AssetMessage::new("epdu-1", AssetOperation::Create)
                .with_aux("type", "device")
                .with_aux("subtype", "epdu")
                .with_ext("ip.1", "1.1.1.2")
                .with_ext("daisy_chain", "1"),
        );
        writer.state().update_from_asset(
            &AssetMessage::new("epdu-2", AssetOperation::Create)
                .with_aux("type", "device")
                .with_aux("subtype", "epdu")
                .with_ext("ip.1", "1.1.1.2")
                .with_ext("daisy_chain", "2"),
        );
        writer.commit();

        agent.update_device_list();
        assert_eq!(agent.devices.len(), 2);
        // the follower polls through the master's NUT name
        assert_eq!(agent.devices.get("epdu-2").unwrap().nut_name(), "epdu-1");
    }
}
