//! Threshold alert scanning and publication
//!
//! Per polled power device the scanner enumerates threshold-bearing
//! quantities (a quantity exists iff the device exposes `<q>.status`),
//! repairs incomplete threshold sets, announces rule definitions to the
//! external rule engine and publishes ACTIVE/RESOLVED alert events.

use crate::error::MonitorError;
use nutbus_client::NutClient;
use nutbus_proto::bus::REQUEST_TIMEOUT;
use nutbus_proto::{subject, AlertMessage, AlertState, BusClient};
use nutbus_state::{Asset, Reader};
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, error, warn};

/// Thresholds and rule bookkeeping for one (asset, quantity) pair.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceAlert {
    pub name: String,
    pub low_warning: String,
    pub high_warning: String,
    pub low_critical: String,
    pub high_critical: String,
    /// Last observed `<q>.status` value.
    pub status: String,
    /// Timestamp of the last status change.
    pub timestamp: i64,
    pub rule_published: bool,
    pub rule_rescanned: bool,
}

/// Repair incomplete thresholds: an empty warning copies the critical
/// and vice versa, on both sides.
pub fn fix_alert_limits(alert: &mut DeviceAlert) {
    if alert.low_warning.is_empty() && !alert.low_critical.is_empty() {
        alert.low_warning = alert.low_critical.clone();
    }
    if !alert.low_warning.is_empty() && alert.low_critical.is_empty() {
        alert.low_critical = alert.low_warning.clone();
    }
    if alert.high_warning.is_empty() && !alert.high_critical.is_empty() {
        alert.high_warning = alert.high_critical.clone();
    }
    if !alert.high_warning.is_empty() && alert.high_critical.is_empty() {
        alert.high_critical = alert.high_warning.clone();
    }
}

fn values_unit(alert_name: &str) -> &'static str {
    if alert_name.contains("power") {
        "W"
    } else if alert_name.contains("voltage") {
        "V"
    } else if alert_name.contains("current") {
        "A"
    } else {
        ""
    }
}

/// Rule descriptor sent to the rule engine.
pub fn rule_json(alert: &DeviceAlert, asset: &str) -> serde_json::Value {
    let rule_name = format!("{}@{}", alert.name, asset);
    let result = |severity: &str, text: &str| {
        json!({
            "action": [{"action": "EMAIL"}, {"action": "SMS"}],
            "severity": severity,
            "description": format!("{} is {} for {}", alert.name, text, asset),
        })
    };
    json!({
        "threshold": {
            "rule_name": rule_name,
            "rule_source": "NUT",
            "rule_class": "Device internal",
            "rule_hierarchy": "internal.device",
            "rule_desc": alert.name,
            "target": rule_name,
            "element": asset,
            "values_unit": values_unit(&alert.name),
            "values": [
                {"low_warning": alert.low_warning},
                {"low_critical": alert.low_critical},
                {"high_warning": alert.high_warning},
                {"high_critical": alert.high_critical},
            ],
            "results": [
                {"low_critical": result("CRITICAL", "critically low")},
                {"low_warning": result("WARNING", "low")},
                {"high_warning": result("WARNING", "high")},
                {"high_critical": result("CRITICAL", "critically high")},
            ],
        }
    })
}

/// Map a quantity status onto (state, severity, description suffix).
/// Unknown severities default to ACTIVE WARNING with a log line.
pub fn severity_for_status(status: &str, name: &str) -> (AlertState, &'static str, String) {
    match status {
        "good" => (AlertState::Resolved, "ok", format!("{name} is resolved")),
        "warning-low" => (AlertState::Active, "WARNING", format!("{name} is low")),
        "critical-low" => (
            AlertState::Active,
            "CRITICAL",
            format!("{name} is critically low"),
        ),
        "warning-high" => (AlertState::Active, "WARNING", format!("{name} is high")),
        "critical-high" => (
            AlertState::Active,
            "CRITICAL",
            format!("{name} is critically high"),
        ),
        other => {
            error!(status = other, quantity = name, "unknown alert severity, set to WARNING");
            (AlertState::Active, "WARNING", format!("{name} is {other}"))
        }
    }
}

/// Alert state of one power device.
#[derive(Debug)]
pub struct AlertDevice {
    asset: Arc<Asset>,
    nut_name: String,
    scanned: bool,
    alerts: BTreeMap<String, DeviceAlert>,
}

impl AlertDevice {
    pub fn new(asset: Arc<Asset>, nut_name: String) -> Self {
        Self {
            asset,
            nut_name,
            scanned: false,
            alerts: BTreeMap::new(),
        }
    }

    pub fn asset_name(&self) -> &str {
        self.asset.name()
    }

    pub fn nut_name(&self) -> &str {
        &self.nut_name
    }

    pub fn chain(&self) -> u32 {
        self.asset.daisy_chain()
    }

    pub fn scanned(&self) -> bool {
        self.scanned
    }

    pub fn alerts(&self) -> &BTreeMap<String, DeviceAlert> {
        &self.alerts
    }

    fn daisychain_prefix(&self) -> String {
        match self.chain() {
            0 => String::new(),
            chain => format!("device.{chain}."),
        }
    }

    /// Track one quantity if the device evaluates it and all four
    /// thresholds can be populated.
    pub fn add_alert(&mut self, quantity: &str, vars: &BTreeMap<String, Vec<String>>) {
        debug!(asset = self.asset_name(), quantity, "device provides alert quantity");
        let prefix = format!("{}{}", self.daisychain_prefix(), quantity);

        let mut alert = DeviceAlert {
            name: quantity.to_string(),
            ..DeviceAlert::default()
        };
        let mut updating = false;
        let mut existing = DeviceAlert::default();
        if let Some(current) = self.alerts.get(quantity) {
            if current.rule_rescanned {
                debug!(asset = self.asset_name(), quantity, "alert already known");
                return;
            }
            updating = true;
            existing = current.clone();
            alert = existing.clone();
        }

        // the device does the evaluation; no status, no alert
        if !vars.contains_key(&format!("{prefix}.status")) {
            debug!(asset = self.asset_name(), quantity, "device does not expose a status");
            return;
        }

        let first = |suffix: &str| -> Option<String> {
            vars.get(&format!("{prefix}{suffix}"))
                .and_then(|values| values.first().cloned())
        };

        // some devices provide only <q>.high / <q>.low
        if let Some(value) = first(".high") {
            alert.high_warning = value.clone();
            alert.high_critical = value;
        }
        if let Some(value) = first(".low") {
            alert.low_warning = value.clone();
            alert.low_critical = value;
        }
        // some provide the full warning/critical split
        if let Some(value) = first(".high.warning") {
            alert.high_warning = value;
        }
        if let Some(value) = first(".high.critical") {
            alert.high_critical = value;
        }
        if let Some(value) = first(".low.warning") {
            alert.low_warning = value;
        }
        if let Some(value) = first(".low.critical") {
            alert.low_critical = value;
        }

        fix_alert_limits(&mut alert);
        if alert.low_warning.is_empty()
            || alert.low_critical.is_empty()
            || alert.high_warning.is_empty()
            || alert.high_critical.is_empty()
        {
            error!(
                asset = self.asset_name(),
                quantity, "thresholds are not fully present, alert rejected"
            );
            return;
        }

        alert.rule_rescanned = true;
        if updating && alert.rule_published {
            // a threshold change re-announces the rule
            if alert.low_warning != existing.low_warning
                || alert.high_warning != existing.high_warning
                || alert.low_critical != existing.low_critical
                || alert.high_critical != existing.high_critical
            {
                alert.rule_published = false;
            }
        }
        self.alerts.insert(quantity.to_string(), alert);
    }

    /// Enumerate threshold-capable quantities from a variable dump.
    /// Entries not re-marked by this scan are removed as obsolete.
    pub fn scan_capabilities(&mut self, vars: &BTreeMap<String, Vec<String>>) {
        debug!(asset = self.asset_name(), "scanning alert capabilities");
        let prefix = self.daisychain_prefix();

        for alert in self.alerts.values_mut() {
            alert.rule_rescanned = false;
        }

        if vars.contains_key(&format!("{prefix}ambient.temperature.status")) {
            self.add_alert("ambient.temperature", vars);
            self.scanned = true;
        }
        if vars.contains_key(&format!("{prefix}ambient.humidity.status")) {
            self.add_alert("ambient.humidity", vars);
            self.scanned = true;
        }
        for phase in 1..=3 {
            for kind in ["current", "voltage"] {
                let quantity = format!("input.L{phase}.{kind}");
                if vars.contains_key(&format!("{prefix}{quantity}.status")) {
                    self.add_alert(&quantity, vars);
                    self.scanned = true;
                }
            }
        }
        for group in 1..=1000 {
            let mut found = false;
            for kind in ["current", "voltage"] {
                let quantity = format!("outlet.group.{group}.{kind}");
                if vars.contains_key(&format!("{prefix}{quantity}.status")) {
                    self.add_alert(&quantity, vars);
                    found = true;
                    self.scanned = true;
                }
            }
            if !found {
                break;
            }
        }

        self.alerts.retain(|_, alert| alert.rule_rescanned);
    }

    /// Refresh observed statuses from a variable dump.
    pub fn update_status(&mut self, vars: &BTreeMap<String, Vec<String>>, now: i64) {
        let prefix = self.daisychain_prefix();
        for (quantity, alert) in &mut self.alerts {
            let key = format!("{prefix}{quantity}.status");
            let Some(value) = vars.get(&key).and_then(|values| values.first()) else {
                debug!(asset = self.asset.name(), quantity = %quantity, "status not present");
                continue;
            };
            if &alert.status != value {
                alert.status = value.clone();
                alert.timestamp = now;
            }
        }
    }

    /// Publish unacknowledged rule definitions to the rule engine.
    /// `ALREADY_EXISTS` counts as success; anything else retries next
    /// cycle.
    pub async fn publish_rules(&mut self, bus: &BusClient) {
        let asset = self.asset.name().to_string();
        for alert in self.alerts.values_mut() {
            if alert.rule_published {
                continue;
            }
            let rule_name = format!("{}@{}", alert.name, asset);
            debug!(rule = %rule_name, "publishing rule");
            let frames = vec!["ADD".to_string(), rule_json(alert, &asset).to_string()];
            match bus
                .request_frames(subject::RULE_MAILBOX, &frames, REQUEST_TIMEOUT)
                .await
            {
                Ok(reply) => {
                    let result = reply.first().map(String::as_str).unwrap_or("");
                    let reason = reply.get(1).map(String::as_str).unwrap_or("");
                    if result == "OK" || reason == "ALREADY_EXISTS" || result == "ALREADY_EXISTS" {
                        alert.rule_published = true;
                    } else {
                        error!(rule = %rule_name, %result, %reason, "rule engine rejected rule");
                    }
                }
                Err(err) => warn!(rule = %rule_name, error = %err, "cannot reach rule engine"),
            }
        }
    }

    /// Publish one alert event per tracked quantity.
    pub async fn publish_alerts(&self, bus: &BusClient, ttl: u64) {
        debug!(
            asset = self.asset.name(),
            alerts = self.alerts.len(),
            "publishing alerts"
        );
        for alert in self.alerts.values() {
            if alert.status.is_empty() {
                continue;
            }
            let (state, severity, description) = severity_for_status(&alert.status, &alert.name);
            let rule = format!("{}@{}", alert.name, self.asset.name());
            let message = AlertMessage {
                rule: rule.clone(),
                element: self.asset.name().to_string(),
                state,
                severity: severity.to_string(),
                description,
                timestamp: alert.timestamp,
                ttl,
            };
            let topic = subject::alert_topic(&rule, severity, self.asset.name());
            if let Err(err) = bus.publish_json(topic, &message).await {
                error!(rule = %rule, error = %err, "failed to publish alert");
            }
        }
    }
}

/// The alert scanning engine over all allowed power devices.
pub struct AlertEngine {
    reader: Reader,
    devices: BTreeMap<String, AlertDevice>,
    capabilities_updated: bool,
    polling_secs: u64,
}

impl AlertEngine {
    pub fn new(reader: Reader) -> Self {
        Self {
            reader,
            devices: BTreeMap::new(),
            capabilities_updated: false,
            polling_secs: 30,
        }
    }

    pub fn set_polling_secs(&mut self, secs: u64) {
        self.polling_secs = secs;
    }

    fn alert_ttl(&self) -> u64 {
        self.polling_secs * 3
    }

    /// Sync the tracked device set with the committed catalog.
    pub fn update_device_list(&mut self) {
        if !self.reader.refresh() {
            return;
        }
        let state = self.reader.state();

        let mut devices = BTreeMap::new();
        for (name, asset) in state.power_devices() {
            let nut_name = match asset.daisy_chain() {
                0 => name.clone(),
                1 => name.clone(),
                _ => {
                    let master = state.ip2master(asset.ip());
                    if master.is_empty() {
                        debug!(asset = %name, "daisy-chain device without master, skipped");
                        continue;
                    }
                    master.to_string()
                }
            };
            match self.devices.remove(name) {
                Some(existing)
                    if existing.nut_name() == nut_name
                        && existing.chain() == asset.daisy_chain() =>
                {
                    devices.insert(name.clone(), existing);
                }
                _ => {
                    devices.insert(name.clone(), AlertDevice::new(asset.clone(), nut_name));
                    self.capabilities_updated = false;
                }
            }
        }
        self.devices = devices;
    }

    /// One alert cycle: rescan capabilities when needed, refresh
    /// statuses, publish rules and events.
    pub async fn on_poll(&mut self, nut: &mut NutClient, bus: &BusClient) -> Result<(), MonitorError> {
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
                    warn!(device = device.nut_name(), error = %err, "communication problem with device");
                }
            }
        }

        if !self.capabilities_updated {
            let mut all_scanned = true;
            for device in self.devices.values_mut() {
                match fetched.get(device.nut_name()) {
                    Some(vars) if !vars.is_empty() => device.scan_capabilities(vars),
                    _ => all_scanned = false,
                }
            }
            self.capabilities_updated = all_scanned;
            debug!(updated = self.capabilities_updated, "alert capabilities updated");
        }

        let now = chrono::Utc::now().timestamp();
        let ttl = self.alert_ttl();
        for device in self.devices.values_mut() {
            if let Some(vars) = fetched.get(device.nut_name()) {
                device.update_status(vars, now);
            }
            device.publish_rules(bus).await;
            device.publish_alerts(bus, ttl).await;
        }
        Ok(())
    }
}
