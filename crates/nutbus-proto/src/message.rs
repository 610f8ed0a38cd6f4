//! Typed bus messages
//!
//! Asset events carry two attribute maps: `aux` (type, subtype, parents,
//! status) and `ext` (network addresses, serials, user configuration).
//! Metrics, alerts and inventory mirror the platform's stream payloads.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Operation carried by an asset event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AssetOperation {
    Create,
    Update,
    Delete,
    Retire,
    Inventory,
}

/// One asset lifecycle event or asset detail record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetMessage {
    /// Stable internal name, e.g. `epdu-42`.
    pub name: String,
    pub operation: AssetOperation,
    /// Auxiliary attributes: `type`, `subtype`, `parent_name.<n>`, `status`.
    #[serde(default)]
    pub aux: BTreeMap<String, String>,
    /// Extended attributes: `ip.<n>`, `port`, `serial_no`, `daisy_chain`,
    /// `max_current`, `max_power`, `upsconf_block`, `endpoint.<n>.<key>`, …
    #[serde(default)]
    pub ext: BTreeMap<String, String>,
}

impl AssetMessage {
    pub fn new(name: impl Into<String>, operation: AssetOperation) -> Self {
        Self {
            name: name.into(),
            operation,
            aux: BTreeMap::new(),
            ext: BTreeMap::new(),
        }
    }

    pub fn aux(&self, key: &str) -> Option<&str> {
        self.aux.get(key).map(String::as_str)
    }

    pub fn ext(&self, key: &str) -> Option<&str> {
        self.ext.get(key).map(String::as_str)
    }

    /// Asset status; absent means "active".
    pub fn status(&self) -> &str {
        self.aux("status").unwrap_or("active")
    }

    pub fn with_aux(mut self, key: &str, value: &str) -> Self {
        self.aux.insert(key.to_string(), value.to_string());
        self
    }

    pub fn with_ext(mut self, key: &str, value: &str) -> Self {
        self.ext.insert(key.to_string(), value.to_string());
        self
    }
}

/// A single metric sample.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricMessage {
    /// Quantity name, e.g. `load.default` or `temperature.3`.
    pub quantity: String,
    /// Asset the sample belongs to.
    pub asset: String,
    pub value: String,
    pub unit: String,
    /// Seconds the sample stays valid.
    pub ttl: u64,
    /// Unix timestamp of the sample.
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub aux: BTreeMap<String, String>,
}

impl MetricMessage {
    pub fn new(
        quantity: impl Into<String>,
        asset: impl Into<String>,
        value: impl Into<String>,
        unit: impl Into<String>,
        ttl: u64,
    ) -> Self {
        Self {
            quantity: quantity.into(),
            asset: asset.into(),
            value: value.into(),
            unit: unit.into(),
            ttl,
            timestamp: Utc::now().timestamp(),
            aux: BTreeMap::new(),
        }
    }

    pub fn with_aux(mut self, key: &str, value: &str) -> Self {
        self.aux.insert(key.to_string(), value.to_string());
        self
    }
}

/// Alert event lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AlertState {
    Active,
    Resolved,
}

impl AlertState {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertState::Active => "ACTIVE",
            AlertState::Resolved => "RESOLVED",
        }
    }
}

/// One alert event published to the alert stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlertMessage {
    /// Rule name, `quantity@asset`.
    pub rule: String,
    /// Asset the alert is raised on.
    pub element: String,
    pub state: AlertState,
    /// `ok`, `WARNING` or `CRITICAL`.
    pub severity: String,
    pub description: String,
    /// Timestamp of the last observed status change.
    pub timestamp: i64,
    pub ttl: u64,
}

/// Inventory attributes for one asset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InventoryMessage {
    pub asset: String,
    pub items: BTreeMap<String, String>,
}
