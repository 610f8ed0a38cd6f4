//! Sensor topology resolution and polling
//!
//! Rebuilds the sensor list from the committed catalog, resolving each
//! sensor to its NUT host and ambient index: the modbus sub-address is
//! matched against `ambient.<i>.address` for i in 1..=ambient.count;
//! legacy port-only sensors are verified against the parent serial and
//! re-homed when it moved, with the learned sub-address persisted back
//! through the asset service.

use crate::error::MonitorError;
use crate::mapping::Mapping;
use crate::sensor::{ChildrenMap, Sensor};
use nutbus_client::NutClient;
use nutbus_proto::bus::REQUEST_TIMEOUT;
use nutbus_proto::{subject, AssetMessage, BusClient, InventoryMessage};
use nutbus_state::{AssetCatalog, Reader};
use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeMap, BTreeSet};
use std::hash::{Hash, Hasher};
use std::path::Path;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Full sensor inventory republish interval.
pub const INVENTORY_REPEAT: Duration = Duration::from_secs(3600);

/// Pending sub-address/parent correction for the asset service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SensorAssetUpdate {
    pub asset: String,
    pub parent: String,
    pub sub_address: String,
}

/// Outcome of a pure rebuild pass.
#[derive(Debug, Default)]
pub struct SensorListBuild {
    pub sensors: BTreeMap<String, Sensor>,
    pub updates: Vec<SensorAssetUpdate>,
    /// A recoverable NUT error occurred; the next cycle must rebuild
    /// unconditionally.
    pub had_error: bool,
}

fn first_value<'a>(vars: &'a BTreeMap<String, Vec<String>>, key: &str) -> Option<&'a str> {
    vars.get(key)
        .and_then(|values| values.first())
        .map(String::as_str)
}

/// Masters whose variable dumps the rebuild needs.
pub fn masters_to_query(state: &AssetCatalog) -> BTreeSet<String> {
    let mut masters = BTreeSet::new();
    for sensor in state.sensors().values() {
        let Some(parent) = state.power_devices().get(sensor.location()) else {
            continue;
        };
        let master = if parent.daisy_chain() == 0 {
            parent.name().to_string()
        } else {
            state.ip2master(parent.ip()).to_string()
        };
        if !master.is_empty() {
            masters.insert(master);
        }
    }
    masters
}

/// Rebuild the sensor list from the catalog and the fetched master
/// variable dumps. Pure; NUT communication failures surface as missing
/// dump entries.
pub fn build_sensor_list(
    state: &AssetCatalog,
    master_vars: &BTreeMap<String, BTreeMap<String, Vec<String>>>,
    previous: &BTreeMap<String, Sensor>,
) -> SensorListBuild {
    let mut build = SensorListBuild::default();
    let devices = state.power_devices();
    let sensors = state.sensors();

    debug!(count = sensors.len(), "updating sensor list");

    // first pass: EMP001 dry-contact children register on their parent
    let mut children: BTreeMap<String, ChildrenMap> = BTreeMap::new();
    for (name, asset) in sensors {
        let parent_name = asset.location();
        if sensors.contains_key(parent_name) && !devices.contains_key(parent_name) {
            let port = asset.port();
            if port.is_empty() {
                debug!(sensor = %name, "child sensor has no port");
                continue;
            }
            children
                .entry(parent_name.to_string())
                .or_default()
                .insert(port.to_string(), name.clone());
            debug!(sensor = %name, parent = %parent_name, %port, "registered dry-contact child");
        }
    }

    for (name, asset) in sensors {
        let parent_name = asset.location();
        if parent_name.is_empty() {
            debug!(sensor = %name, "sensor ignored (no location)");
            continue;
        }
        let Some(parent) = devices.get(parent_name) else {
            if !sensors.contains_key(parent_name) {
                debug!(sensor = %name, parent = %parent_name, "sensor ignored (unknown location)");
            }
            continue;
        };

        let chain = parent.daisy_chain();
        let ip = parent.ip();
        let master = if chain == 0 {
            parent.name().to_string()
        } else {
            state.ip2master(ip).to_string()
        };
        if chain != 0 && master.is_empty() {
            error!(sensor = %name, parent = %parent_name, "daisy-chain host not found");
            continue;
        }
        let own_children = children
            .get(name)
            .cloned()
            .or_else(|| previous.get(name).map(|s| s.children().clone()))
            .unwrap_or_default();

        let port = asset.port();
        if port.is_empty() || port == "0" {
            // EMP001: index 0, no address resolution needed
            build.sensors.insert(
                name.clone(),
                Sensor::new(
                    asset.clone(),
                    parent_name.to_string(),
                    chain,
                    master,
                    0,
                    own_children,
                ),
            );
            continue;
        }

        // EMP002
        let Some(vars) = master_vars.get(&master) else {
            warn!(sensor = %name, %master, "no data from NUT host, retry in a moment");
            build.had_error = true;
            continue;
        };
        let prefix = if chain == 0 { "" } else { "device.1." };

        let sub_address = asset.sub_address();
        let mut index = 0u32;
        let mut location = parent_name.to_string();
        let mut final_chain = chain;

        if !sub_address.is_empty() {
            // preferred: match the modbus sub-address over the
            // advertised ambient units
            let count: u32 = first_value(vars, &format!("{prefix}ambient.count"))
                .and_then(|value| value.parse().ok())
                .unwrap_or(0);
            for candidate in 1..=count {
                if first_value(vars, &format!("{prefix}ambient.{candidate}.address")) == Some(sub_address) {
                    index = candidate;
                    debug!(sensor = %name, index, sub_address, "matched sub-address");
                    break;
                }
            }
        } else {
            // legacy: the port is the index candidate
            index = port.parse().unwrap_or(0);
            if index > 0 {
                // verify the sensor still hangs off this parent
                if let Some(serial) = first_value(vars, &format!("{prefix}ambient.{index}.parent.serial")) {
                    if !serial.is_empty() && serial != parent.serial() {
                        if let Some(new_parent) = devices
                            .values()
                            .find(|device| device.ip() == ip && device.serial() == serial)
                        {
                            debug!(sensor = %name, parent = new_parent.name(), "re-homing sensor");
                            location = new_parent.name().to_string();
                            final_chain = new_parent.daisy_chain();
                        }
                    }
                }
                // learn the modbus address and persist it
                if let Some(address) = first_value(vars, &format!("{prefix}ambient.{index}.address")) {
                    build.updates.push(SensorAssetUpdate {
                        asset: name.clone(),
                        parent: location.clone(),
                        sub_address: address.to_string(),
                    });
                }
            }
        }

        if index == 0 {
            // unmapped sensors stay out of publication until resolved
            warn!(sensor = %name, "ambient index not resolved, sensor omitted");
            continue;
        }

        build.sensors.insert(
            name.clone(),
            Sensor::new(asset.clone(), location, final_chain, master, index, own_children),
        );
    }

    if build.had_error {
        debug!(count = build.sensors.len(), "sensor list loaded with errors");
    } else {
        debug!(count = build.sensors.len(), "sensor list loaded");
    }
    build
}

/// The sensor polling engine.
pub struct Sensors {
    reader: Reader,
    sensors: BTreeMap<String, Sensor>,
    mapping: Mapping,
    inventory_hashes: BTreeMap<String, u64>,
    force_rebuild: bool,
    last_inventory: Option<Instant>,
    polling_secs: u64,
}

impl Sensors {
    pub fn new(reader: Reader) -> Self {
        Self {
            reader,
            sensors: BTreeMap::new(),
            mapping: Mapping::default(),
            inventory_hashes: BTreeMap::new(),
            force_rebuild: true,
            last_inventory: None,
            polling_secs: 30,
        }
    }

    pub fn load_mapping(&mut self, path: impl AsRef<Path>) -> Result<(), MonitorError> {
        self.mapping = Mapping::load(path)?;
        Ok(())
    }

    pub fn set_polling_secs(&mut self, secs: u64) {
        self.polling_secs = secs;
    }

    /// Sensor metrics outlive several missed polls.
    fn sensor_ttl(&self) -> u64 {
        self.polling_secs * 8
    }

    /// Rebuild the sensor list when the catalog moved (or a previous
    /// cycle failed), then push learned sub-addresses to the asset
    /// service.
    pub async fn update_sensor_list(&mut self, nut: &mut NutClient, bus: &BusClient) {
        if !self.reader.refresh() && !self.force_rebuild {
            return;
        }
        let state = self.reader.state().clone();

        let mut master_vars = BTreeMap::new();
        for master in masters_to_query(&state) {
            match nut.get_all_variables(&master).await {
                Ok(vars) => {
                    master_vars.insert(master, vars);
                }
                Err(err) => {
                    warn!(%master, error = %err, "cannot read master from NUT");
                }
            }
        }

        let build = build_sensor_list(&state, &master_vars, &self.sensors);
        self.force_rebuild = build.had_error;

        // drop inventory hashes of sensors that fell out of the list
        self.inventory_hashes
            .retain(|name, _| build.sensors.contains_key(name));
        self.sensors = build.sensors;

        for update in build.updates {
            if let Err(err) = push_asset_update(bus, &update).await {
                error!(asset = %update.asset, error = %err, "failed to persist sensor sub-address");
            }
        }
    }

    /// Refresh measurements and inventory from NUT.
    pub async fn update_from_nut(&mut self, nut: &mut NutClient) {
        let mut fetched: BTreeMap<String, BTreeMap<String, Vec<String>>> = BTreeMap::new();
        for sensor in self.sensors.values() {
            if fetched.contains_key(sensor.nut_master()) {
                continue;
            }
            match nut.get_all_variables(sensor.nut_master()).await {
                Ok(vars) => {
                    fetched.insert(sensor.nut_master().to_string(), vars);
                }
                Err(err) => {
                    warn!(master = sensor.nut_master(), error = %err, "reading data from NUT failed");
                    self.force_rebuild = true;
                }
            }
        }

        for sensor in self.sensors.values_mut() {
            if let Some(vars) = fetched.get(sensor.nut_master()) {
                sensor.update_from_vars(vars);
                sensor.update_inventory(vars, &self.mapping);
            }
        }
    }

    /// Publish all sensor measurements.
    pub async fn publish(&self, bus: &BusClient) {
        let ttl = self.sensor_ttl();
        for sensor in self.sensors.values() {
            for (topic, message) in sensor.collect_metrics(ttl) {
                let subject = format!("{}.{}", subject::SENSOR_METRICS, topic);
                if let Err(err) = bus.publish_json(subject, &message).await {
                    error!(%topic, error = %err, "failed to send sensor measurement");
                }
            }
        }
    }

    /// Publish sensor inventory: changed content always, everything on
    /// the long repeat cycle.
    pub async fn advertise_inventory(&mut self, bus: &BusClient) {
        let advertise_all = match self.last_inventory {
            Some(at) if at.elapsed() < INVENTORY_REPEAT => false,
            _ => {
                self.last_inventory = Some(Instant::now());
                true
            }
        };

        for sensor in self.sensors.values() {
            let items = sensor.inventory();
            if items.is_empty() {
                continue;
            }
            let mut hasher = DefaultHasher::new();
            for (key, value) in items {
                key.hash(&mut hasher);
                value.hash(&mut hasher);
            }
            let hash = hasher.finish();
            let changed = self.inventory_hashes.get(sensor.asset_name()) != Some(&hash);
            if !changed && !advertise_all {
                continue;
            }
            self.inventory_hashes
                .insert(sensor.asset_name().to_string(), hash);

            let message = InventoryMessage {
                asset: sensor.asset_name().to_string(),
                items: items.clone(),
            };
            let topic = subject::inventory_topic(sensor.asset_name());
            debug!(%topic, "new sensor inventory message");
            if let Err(err) = bus.publish_json(topic, &message).await {
                error!(asset = sensor.asset_name(), error = %err, "failed to send sensor inventory");
            }
        }
    }

    pub fn sensors(&self) -> &BTreeMap<String, Sensor> {
        &self.sensors
    }
}

/// Persist a learned sub-address/parent through the asset service: fetch
/// the current record, patch it and send it back READWRITE.
async fn push_asset_update(bus: &BusClient, update: &SensorAssetUpdate) -> Result<(), MonitorError> {
    let uuid = Uuid::new_v4().to_string();
    let reply = bus
        .request_frames(
            subject::ASSET_MAILBOX_DETAIL,
            &["GET".to_string(), uuid.clone(), update.asset.clone()],
            REQUEST_TIMEOUT,
        )
        .await?;
    if reply.first() != Some(&uuid) {
        warn!(asset = %update.asset, "mismatched asset detail reply, update dropped");
        return Ok(());
    }
    let Some(body) = reply.get(1) else {
        warn!(asset = %update.asset, "asset detail reply misses body, update dropped");
        return Ok(());
    };
    let mut asset: AssetMessage = match serde_json::from_str(body) {
        Ok(asset) => asset,
        Err(err) => {
            warn!(asset = %update.asset, error = %err, "asset detail not decodable, update dropped");
            return Ok(());
        }
    };

    let current_parent = asset.aux("parent_name.1").unwrap_or("");
    if asset.ext("endpoint.1.sub_address") == Some(update.sub_address.as_str())
        && current_parent == update.parent
    {
        return Ok(());
    }

    asset
        .ext
        .insert("endpoint.1.sub_address".into(), update.sub_address.clone());
    asset
        .aux
        .insert("parent_name.1".into(), update.parent.clone());
    asset.operation = nutbus_proto::AssetOperation::Update;

    let uuid = Uuid::new_v4().to_string();
    let body = serde_json::to_string(&asset).unwrap_or_default();
    let reply = bus
        .request_frames(
            subject::ASSET_MAILBOX_MANIPULATION,
            &["READWRITE".to_string(), uuid, body],
            REQUEST_TIMEOUT,
        )
        .await?;
    match reply.first().map(String::as_str) {
        Some("OK") => {
            info!(asset = %update.asset, sub_address = %update.sub_address, "persisted sensor sub-address");
            Ok(())
        }
        other => {
            warn!(asset = %update.asset, reply = ?other, "asset service rejected sensor update");
            Ok(())
        }
    }
}
