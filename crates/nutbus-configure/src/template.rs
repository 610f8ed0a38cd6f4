//! Configuration-type templates
//!
//! A template maps NUT keys to values that may reference asset attributes
//! with `${asset.ext.<key>}` or `${asset.aux.<key>}`. Instantiation
//! against an asset either yields a concrete configuration or fails when
//! a referenced attribute is missing.

use crate::candidate::DeviceConfiguration;
use crate::secw::security_document_types;
use nutbus_state::Asset;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// A reusable description of how a family of NUT configurations is
/// instantiated from an asset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigurationType {
    pub id: u64,
    pub pretty_name: String,
    pub default_attributes: DeviceConfiguration,
    /// Accepted credential document types: {"Snmpv1"}, {"Snmpv3"} or none.
    pub secw_document_types: BTreeSet<String>,
}

impl ConfigurationType {
    /// The built-in template set.
    pub fn defaults() -> Vec<ConfigurationType> {
        fn attrs(pairs: &[(&str, &str)]) -> DeviceConfiguration {
            pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect()
        }
        fn types(names: &[&str]) -> BTreeSet<String> {
            names.iter().map(|n| n.to_string()).collect()
        }

        vec![
            ConfigurationType {
                id: 0,
                pretty_name: "NetXML protocol".into(),
                default_attributes: attrs(&[
                    ("driver", "netxml-ups"),
                    ("port", "http://${asset.ext.ip.1}"),
                ]),
                secw_document_types: BTreeSet::new(),
            },
            ConfigurationType {
                id: 1,
                pretty_name: "SNMPv1 protocol".into(),
                default_attributes: attrs(&[("driver", "snmp-ups"), ("port", "${asset.ext.ip.1}")]),
                secw_document_types: types(&["Snmpv1"]),
            },
            ConfigurationType {
                id: 2,
                pretty_name: "SNMPv3 protocol".into(),
                default_attributes: attrs(&[
                    ("driver", "snmp-ups"),
                    ("port", "${asset.ext.ip.1}"),
                    ("snmp_version", "v3"),
                ]),
                secw_document_types: types(&["Snmpv3"]),
            },
            ConfigurationType {
                id: 3,
                pretty_name: "SNMPv1 protocol (DMF)".into(),
                default_attributes: attrs(&[
                    ("driver", "snmp-ups-dmf"),
                    ("port", "${asset.ext.ip.1}"),
                ]),
                secw_document_types: types(&["Snmpv1"]),
            },
            ConfigurationType {
                id: 4,
                pretty_name: "SNMPv3 protocol (DMF)".into(),
                default_attributes: attrs(&[
                    ("driver", "snmp-ups-dmf"),
                    ("port", "${asset.ext.ip.1}"),
                    ("snmp_version", "v3"),
                ]),
                secw_document_types: types(&["Snmpv3"]),
            },
        ]
    }
}

/// Instantiate a template against an asset. Returns `None` when any
/// referenced attribute is missing.
pub fn instantiate(asset: &Asset, template: &DeviceConfiguration) -> Option<DeviceConfiguration> {
    let mut result = DeviceConfiguration::new();
    for (key, value) in template {
        result.insert(key.clone(), substitute(asset, value)?);
    }
    Some(result)
}

fn substitute(asset: &Asset, templated: &str) -> Option<String> {
    let mut out = String::new();
    let mut rest = templated;

    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let end = after.find('}')?;
        let token = &after[..end];

        let value = if let Some(key) = token.strip_prefix("asset.ext.") {
            asset.ext_attr(key)
        } else if let Some(key) = token.strip_prefix("asset.aux.") {
            asset.aux_attr(key)
        } else {
            None
        }?;

        out.push_str(value);
        rest = &after[end + 1..];
    }
    out.push_str(rest);
    Some(out)
}

/// First configuration type whose instantiation matches the candidate's
/// driver, port and derived credential document types.
pub fn match_best_type<'a>(
    asset: &Asset,
    config: &DeviceConfiguration,
    types: &'a [ConfigurationType],
) -> Option<&'a ConfigurationType> {
    types.iter().find(|config_type| {
        let Some(instantiated) = instantiate(asset, &config_type.default_attributes) else {
            return false;
        };
        instantiated.get("driver") == config.get("driver")
            && instantiated.get("port") == config.get("port")
            && security_document_types(config) == config_type.secw_document_types
    })
}

/// Strip a candidate down to the attributes worth persisting: template
/// defaults and credential-derived keys are reconstructed at load time.
pub fn storable_attributes(
    config: &DeviceConfiguration,
    config_type: &ConfigurationType,
) -> DeviceConfiguration {
    const CREDENTIAL_KEYS: [&str; 9] = [
        "device",
        "port",
        "community",
        "secLevel",
        "secName",
        "authPassword",
        "authProtocol",
        "privPassword",
        "privProtocol",
    ];

    let mut result = config.clone();
    for key in config_type.default_attributes.keys() {
        result.remove(key);
    }
    for key in CREDENTIAL_KEYS {
        result.remove(key);
    }
    result
}
