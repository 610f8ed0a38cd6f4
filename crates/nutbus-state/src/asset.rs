//! Immutable asset records
//!
//! An `Asset` is constructed from an asset event and never mutated
//! afterwards; concurrent snapshots share it by `Arc`.

use nutbus_proto::AssetMessage;
use std::collections::BTreeMap;

/// One power device or sensor as described by the inventory service.
#[derive(Debug, Clone, PartialEq)]
pub struct Asset {
    name: String,
    friendly_name: String,
    serial: String,
    ip: String,
    port: String,
    subtype: String,
    location: String,
    upsconf_block: Option<String>,
    upsconf_enable_dmf: bool,
    max_current: Option<f64>,
    max_power: Option<f64>,
    daisy_chain: u32,
    /// `endpoint.1.*` attributes with the prefix stripped.
    endpoint: BTreeMap<String, String>,
    /// Raw attribute maps, kept for configuration-template substitution.
    ext: BTreeMap<String, String>,
    aux: BTreeMap<String, String>,
}

impl Asset {
    pub fn from_message(message: &AssetMessage) -> Self {
        let ext = &message.ext;
        let aux = &message.aux;

        let endpoint = ext
            .iter()
            .filter_map(|(k, v)| {
                k.strip_prefix("endpoint.1.")
                    .map(|suffix| (suffix.to_string(), v.clone()))
            })
            .collect();

        Self {
            name: message.name.clone(),
            friendly_name: ext.get("name").cloned().unwrap_or_default(),
            serial: ext.get("serial_no").cloned().unwrap_or_default(),
            ip: ext.get("ip.1").cloned().unwrap_or_default(),
            port: ext.get("port").cloned().unwrap_or_default(),
            subtype: aux.get("subtype").cloned().unwrap_or_default(),
            location: aux.get("parent_name.1").cloned().unwrap_or_default(),
            upsconf_block: ext.get("upsconf_block").cloned(),
            upsconf_enable_dmf: ext.get("upsconf_enable_dmf").map(String::as_str) == Some("true"),
            max_current: ext.get("max_current").and_then(|v| v.parse().ok()),
            max_power: ext.get("max_power").and_then(|v| v.parse().ok()),
            daisy_chain: ext
                .get("daisy_chain")
                .and_then(|v| v.parse().ok())
                .unwrap_or(0),
            endpoint,
            ext: ext.clone(),
            aux: aux.clone(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn friendly_name(&self) -> &str {
        &self.friendly_name
    }

    pub fn serial(&self) -> &str {
        &self.serial
    }

    pub fn ip(&self) -> &str {
        &self.ip
    }

    pub fn port(&self) -> &str {
        &self.port
    }

    pub fn subtype(&self) -> &str {
        &self.subtype
    }

    /// Parent asset name (`parent_name.1`).
    pub fn location(&self) -> &str {
        &self.location
    }

    pub fn upsconf_block(&self) -> Option<&str> {
        self.upsconf_block.as_deref()
    }

    pub fn upsconf_enable_dmf(&self) -> bool {
        self.upsconf_enable_dmf
    }

    pub fn max_current(&self) -> Option<f64> {
        self.max_current
    }

    pub fn max_power(&self) -> Option<f64> {
        self.max_power
    }

    /// 0 = standalone, 1 = daisy-chain master, >= 2 = follower.
    pub fn daisy_chain(&self) -> u32 {
        self.daisy_chain
    }

    pub fn has_endpoint(&self) -> bool {
        !self.endpoint.is_empty()
    }

    /// `endpoint.1.*` attributes, prefix stripped.
    pub fn endpoint(&self) -> &BTreeMap<String, String> {
        &self.endpoint
    }

    /// Modbus sub-address of an EMP002 sensor, if set.
    pub fn sub_address(&self) -> &str {
        self.endpoint
            .get("sub_address")
            .map(String::as_str)
            .unwrap_or("")
    }

    pub fn ext_attr(&self, key: &str) -> Option<&str> {
        self.ext.get(key).map(String::as_str)
    }

    pub fn aux_attr(&self, key: &str) -> Option<&str> {
        self.aux.get(key).map(String::as_str)
    }

    pub fn is_power_device(&self) -> bool {
        matches!(self.subtype.as_str(), "ups" | "epdu" | "sts" | "ats")
    }

    pub fn is_sensor(&self) -> bool {
        matches!(self.subtype.as_str(), "sensor" | "sensorgpio")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nutbus_proto::AssetOperation;

    #[test]
    fn asset_extracts_endpoint_attributes() {
        let msg = AssetMessage::new("sensor-3", AssetOperation::Create)
            .with_aux("type", "device")
            .with_aux("subtype", "sensor")
            .with_aux("parent_name.1", "epdu-2")
            .with_ext("port", "5")
            .with_ext("endpoint.1.protocol", "nut_snmp")
            .with_ext("endpoint.1.sub_address", "3");

        let asset = Asset::from_message(&msg);
        assert_eq!(asset.endpoint().get("protocol").unwrap(), "nut_snmp");
        assert_eq!(asset.sub_address(), "3");
        assert_eq!(asset.location(), "epdu-2");
        assert!(asset.is_sensor());
    }

    #[test]
    fn numeric_attributes_fail_soft() {
        let msg = AssetMessage::new("ups-1", AssetOperation::Create)
            .with_ext("daisy_chain", "not-a-number")
            .with_ext("max_current", "16.0");
        let asset = Asset::from_message(&msg);
        assert_eq!(asset.daisy_chain(), 0);
        assert_eq!(asset.max_current(), Some(16.0));
        assert_eq!(asset.max_power(), None);
    }
}
