//! Asset catalog snapshots
//!
//! A committed catalog is immutable; the writer mutates its private
//! uncommitted copy and `recompute()` rebuilds the derived indices at
//! commit time.

use crate::asset::Asset;
use nutbus_proto::{AssetMessage, AssetOperation, MetricMessage};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, info};

pub type AssetMap = BTreeMap<String, Arc<Asset>>;

const RACK_CONTROLLER: &str = "rackcontroller-0";

/// One snapshot of the monitored fleet.
#[derive(Debug, Clone, Default)]
pub struct AssetCatalog {
    power_devices: AssetMap,
    sensors: AssetMap,
    /// Subset of `power_devices` the licensing state permits to monitor.
    allowed_devices: AssetMap,
    /// Primary IP -> daisy-chain master name (chain <= 1 only).
    ip2master: HashMap<String, String>,
    monitoring_allowed: bool,
}

impl AssetCatalog {
    pub fn new() -> Self {
        Self {
            monitoring_allowed: true,
            ..Self::default()
        }
    }

    /// Apply one asset event. Returns true when the catalog changed.
    pub fn update_from_asset(&mut self, message: &AssetMessage) -> bool {
        let name = message.name.as_str();

        if matches!(
            message.operation,
            AssetOperation::Delete | AssetOperation::Retire
        ) || message.status() != "active"
        {
            return self.power_devices.remove(name).is_some()
                | self.sensors.remove(name).is_some();
        }

        if !matches!(
            message.operation,
            AssetOperation::Create | AssetOperation::Update
        ) {
            return false;
        }

        if message.aux("type") != Some("device") {
            return false;
        }

        let map = match message.aux("subtype") {
            Some("ups") | Some("epdu") | Some("sts") | Some("ats") => &mut self.power_devices,
            Some("sensor") => {
                // sensors wired to the rack controller are not ours
                if message.aux("parent_name.1") == Some(RACK_CONTROLLER) {
                    return false;
                }
                &mut self.sensors
            }
            Some("sensorgpio") => {
                if message.aux("parent_name.1") == Some(RACK_CONTROLLER)
                    || message.aux("parent_name.2") == Some(RACK_CONTROLLER)
                {
                    return false;
                }
                &mut self.sensors
            }
            _ => return false,
        };

        map.insert(name.to_string(), Arc::new(Asset::from_message(message)));
        true
    }

    /// Apply a licensing metric. Returns true when the gate changed.
    pub fn update_from_licensing(&mut self, metric: &MetricMessage) -> bool {
        if metric.asset != RACK_CONTROLLER || metric.quantity != "monitoring.global" {
            return false;
        }
        match metric.value.trim().parse::<i32>() {
            Ok(v) => {
                let allowed = v == 1;
                let changed = allowed != self.monitoring_allowed;
                self.monitoring_allowed = allowed;
                changed
            }
            Err(_) => false,
        }
    }

    /// Rebuild the ip->master index and the allowed-device set.
    pub fn recompute(&mut self) {
        self.ip2master.clear();
        for (name, asset) in &self.power_devices {
            let ip = asset.ip();
            if ip.is_empty() {
                // strange: a power device without an IP
                continue;
            }
            if asset.daisy_chain() <= 1 {
                self.ip2master.insert(ip.to_string(), name.clone());
            }
        }

        self.allowed_devices.clear();
        if self.monitoring_allowed {
            self.allowed_devices = self.power_devices.clone();
            info!(
                devices = self.allowed_devices.len(),
                "monitoring enabled, devices will be monitored"
            );
        } else {
            debug!("monitoring disabled by licensing");
        }
    }

    /// Power devices the current licensing state allows to monitor.
    pub fn power_devices(&self) -> &AssetMap {
        &self.allowed_devices
    }

    pub fn all_power_devices(&self) -> &AssetMap {
        &self.power_devices
    }

    pub fn sensors(&self) -> &AssetMap {
        &self.sensors
    }

    /// Daisy-chain master name for an IP, or "" for orphans.
    pub fn ip2master(&self, ip: &str) -> &str {
        self.ip2master.get(ip).map(String::as_str).unwrap_or("")
    }

    pub fn monitoring_allowed(&self) -> bool {
        self.monitoring_allowed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nutbus_proto::AssetOperation;

    fn device(name: &str, subtype: &str, ip: &str, chain: Option<&str>) -> AssetMessage {
        let mut msg = AssetMessage::new(name, AssetOperation::Create)
            .with_aux("type", "device")
            .with_aux("subtype", subtype)
            .with_ext("ip.1", ip);
        if let Some(chain) = chain {
            msg = msg.with_ext("daisy_chain", chain);
        }
        msg
    }

    #[test]
    fn daisychain_master_owns_the_ip() {
        let mut catalog = AssetCatalog::new();
        assert!(catalog.update_from_asset(&device("epdu-1", "epdu", "1.1.1.2", Some("1"))));
        assert!(catalog.update_from_asset(&device("epdu-2", "epdu", "1.1.1.2", Some("2"))));
        catalog.recompute();

        assert_eq!(catalog.ip2master("1.1.1.2"), "epdu-1");
        assert_eq!(catalog.ip2master("9.9.9.9"), "");
    }

    #[test]
    fn rackcontroller_sensors_are_excluded() {
        let mut catalog = AssetCatalog::new();
        let msg = AssetMessage::new("sensor-9", AssetOperation::Create)
            .with_aux("type", "device")
            .with_aux("subtype", "sensor")
            .with_aux("parent_name.1", "rackcontroller-0");
        assert!(!catalog.update_from_asset(&msg));
        assert!(catalog.sensors().is_empty());
    }

    #[test]
    fn delete_and_nonactive_remove_the_asset() {
        let mut catalog = AssetCatalog::new();
        catalog.update_from_asset(&device("ups-1", "ups", "1.1.1.1", None));
        assert_eq!(catalog.all_power_devices().len(), 1);

        let delete = AssetMessage::new("ups-1", AssetOperation::Delete);
        assert!(catalog.update_from_asset(&delete));
        assert!(catalog.all_power_devices().is_empty());

        catalog.update_from_asset(&device("ups-1", "ups", "1.1.1.1", None));
        let inactive = device("ups-1", "ups", "1.1.1.1", None).with_aux("status", "nonactive");
        assert!(catalog.update_from_asset(&inactive));
        assert!(catalog.all_power_devices().is_empty());
    }

    #[test]
    fn licensing_gates_the_allowed_set() {
        let mut catalog = AssetCatalog::new();
        catalog.update_from_asset(&device("ups-1", "ups", "1.1.1.1", None));

        let deny = MetricMessage::new("monitoring.global", "rackcontroller-0", "0", "", 60);
        assert!(catalog.update_from_licensing(&deny));
        catalog.recompute();
        assert!(catalog.power_devices().is_empty());
        assert_eq!(catalog.all_power_devices().len(), 1);

        let allow = MetricMessage::new("monitoring.global", "rackcontroller-0", "1", "", 60);
        assert!(catalog.update_from_licensing(&allow));
        catalog.recompute();
        assert_eq!(catalog.power_devices().len(), 1);
    }
}
