//! Candidate acquisition
//!
//! Three paths, in order: the asset's verbatim configuration block, a
//! structured endpoint description, or an active scan. The chosen
//! candidate is completed with the per-driver boilerplate before it is
//! persisted.

use crate::candidate::{can_netxml, can_snmp, parse_config_text, DeviceConfiguration};
use crate::error::ConfigureError;
use crate::scan::{ScanOptions, Scanner};
use crate::secw::CredentialSet;
use nutbus_state::Asset;
use tracing::{info, warn};

/// Parse the verbatim `upsconf_block` of an asset.
///
/// The first character is the user-chosen line separator; the rest is the
/// block with that separator in place of newlines. A payload that already
/// begins with `[` is a complete section, otherwise the asset name is
/// prepended as the section header. An empty payload yields the
/// degenerate `{name = <asset>}` configuration.
pub fn configs_from_upsconf_block(name: &str, block: &str) -> Vec<DeviceConfiguration> {
    let mut chars = block.chars();
    let separator = chars.next();
    let payload: String = chars.collect();

    if separator.is_none() || payload.is_empty() {
        // downstream tooling may reject a config with nothing but a name
        warn!(
            asset = name,
            "empty verbatim configuration block, emitting name-only configuration"
        );
        let config: DeviceConfiguration = [("name".to_string(), name.to_string())]
            .into_iter()
            .collect();
        return vec![config];
    }

    let separator = separator.unwrap();
    let text: String = payload
        .chars()
        .map(|c| if c == separator { '\n' } else { c })
        .collect();

    let text = if text.starts_with('[') {
        info!(asset = name, "verbatim block carries its own device tag");
        text
    } else {
        info!(asset = name, "prepending asset name as device tag to verbatim block");
        format!("[{name}]\n{text}\n")
    };

    parse_config_text(&text)
        .into_iter()
        .map(|(_, config)| config)
        .collect()
}

/// Build a configuration directly from a structured endpoint.
pub fn configs_from_endpoint(
    asset: &Asset,
    credentials: &CredentialSet,
) -> Result<Vec<DeviceConfiguration>, ConfigureError> {
    let ip = asset.ip();
    if ip.is_empty() {
        return Err(ConfigureError::NoAddress(asset.name().to_string()));
    }
    let endpoint = asset.endpoint();
    let protocol = endpoint.get("protocol").map(String::as_str).unwrap_or("");

    let config = match protocol {
        "nut_xml_pdc" => {
            let mut port = format!("http://{ip}");
            if let Some(endpoint_port) = endpoint.get("port") {
                port = format!("{port}:{endpoint_port}");
            }
            [
                ("driver".to_string(), "netxml-ups".to_string()),
                ("port".to_string(), port),
            ]
            .into_iter()
            .collect()
        }
        "nut_snmp" => {
            let credential_id = endpoint
                .get("nut_snmp.secw_credential_id")
                .ok_or_else(|| ConfigureError::CredentialNotFound(asset.name().to_string()))?;
            let mut config = credentials
                .driver_keys(credential_id)
                .ok_or_else(|| ConfigureError::CredentialNotFound(credential_id.clone()))?;
            let mut port = ip.to_string();
            if let Some(endpoint_port) = endpoint.get("port") {
                port = format!("{port}:{endpoint_port}");
            }
            config.insert("driver".into(), "snmp-ups".into());
            config.insert("port".into(), port);
            config
        }
        "nut_powercom" => {
            let credential_id = endpoint
                .get("nut_powercom.secw_credential_id")
                .ok_or_else(|| ConfigureError::CredentialNotFound(asset.name().to_string()))?;
            let mut config = credentials
                .driver_keys(credential_id)
                .ok_or_else(|| ConfigureError::CredentialNotFound(credential_id.clone()))?;
            config.insert("driver".into(), "etn-nut-powerconnect".into());
            config.insert("port".into(), ip.to_string());
            config.insert("auto".into(), "true".into());
            config
        }
        other => {
            return Err(ConfigureError::Malformed(format!(
                "unknown endpoint protocol {other:?}"
            )))
        }
    };
    Ok(vec![config])
}

/// True when the endpoint protocol is one the resolver understands.
pub fn has_supported_endpoint(asset: &Asset) -> bool {
    matches!(
        asset.endpoint().get("protocol").map(String::as_str),
        Some("nut_snmp") | Some("nut_powercom") | Some("nut_xml_pdc")
    )
}

/// Acquire candidates for an asset through the configured paths.
pub async fn acquire_candidates(
    asset: &Asset,
    credentials: &CredentialSet,
    scanner: &Scanner,
    opts: ScanOptions,
) -> Result<Vec<DeviceConfiguration>, ConfigureError> {
    if let Some(block) = asset.upsconf_block() {
        return Ok(configs_from_upsconf_block(asset.name(), block));
    }
    if has_supported_endpoint(asset) {
        return configs_from_endpoint(asset, credentials);
    }
    let opts = ScanOptions {
        use_dmf: asset.upsconf_enable_dmf() || opts.use_dmf,
        ..opts
    };
    scanner.scan_address(asset.ip(), credentials, opts).await
}

/// Complete a chosen candidate before persistence. The `synchronous`
/// flag follows the asset's declared subtype, not the candidate's MIB.
pub fn complete_candidate(
    config: &mut DeviceConfiguration,
    name: &str,
    subtype: &str,
    polling_secs: u64,
) {
    config.insert("name".into(), name.to_string());
    if subtype == "epdu" && can_snmp(config) {
        config.insert("synchronous".into(), "yes".into());
    }
    if can_netxml(config) {
        config.insert("timeout".into(), "15".into());
    }
    if can_snmp(config) {
        config.insert("pollfreq".into(), polling_secs.to_string());
    } else {
        config.insert("pollinterval".into(), polling_secs.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nutbus_proto::{AssetMessage, AssetOperation};

    fn endpoint_asset(protocol: &str, extra: &[(&str, &str)]) -> Asset {
        let mut msg = AssetMessage::new("ups-7", AssetOperation::Create)
            .with_aux("type", "device")
            .with_aux("subtype", "ups")
            .with_ext("ip.1", "10.0.0.7")
            .with_ext("endpoint.1.protocol", protocol);
        for (key, value) in extra {
            msg = msg.with_ext(&format!("endpoint.1.{key}"), value);
        }
        Asset::from_message(&msg)
    }

    fn credentials() -> CredentialSet {
        CredentialSet {
            snmpv1: vec![crate::secw::Snmpv1Credential {
                id: "doc-1".into(),
                name: String::new(),
                community: "private".into(),
            }],
            snmpv3: vec![],
        }
    }

    #[test]
    fn verbatim_block_with_own_section() {
        let block = ";[my-ups];driver = dummy-ups;port = auto";
        let configs = configs_from_upsconf_block("ups-1", block);
        assert_eq!(configs.len(), 1);
        assert_eq!(configs[0].get("driver").unwrap(), "dummy-ups");
        assert_eq!(configs[0].get("port").unwrap(), "auto");
    }

    #[test]
    fn verbatim_block_without_section_gets_the_asset_name() {
        let block = "|driver = netxml-ups|port = http://10.0.0.1";
        let configs = configs_from_upsconf_block("ups-2", block);
        assert_eq!(configs.len(), 1);
        assert_eq!(configs[0].get("driver").unwrap(), "netxml-ups");
    }

    #[test]
    fn empty_verbatim_block_degenerates_to_name_only() {
        let configs = configs_from_upsconf_block("ups-3", "");
        assert_eq!(configs.len(), 1);
        assert_eq!(configs[0].len(), 1);
        assert_eq!(configs[0].get("name").unwrap(), "ups-3");
    }

    #[test]
    fn xml_pdc_endpoint_builds_http_port() {
        let asset = endpoint_asset("nut_xml_pdc", &[("port", "8080")]);
        let configs = configs_from_endpoint(&asset, &credentials()).unwrap();
        assert_eq!(configs[0].get("driver").unwrap(), "netxml-ups");
        assert_eq!(configs[0].get("port").unwrap(), "http://10.0.0.7:8080");
    }

    #[test]
    fn snmp_endpoint_flattens_the_credential() {
        let asset = endpoint_asset("nut_snmp", &[("nut_snmp.secw_credential_id", "doc-1")]);
        let configs = configs_from_endpoint(&asset, &credentials()).unwrap();
        assert_eq!(configs[0].get("driver").unwrap(), "snmp-ups");
        assert_eq!(configs[0].get("port").unwrap(), "10.0.0.7");
        assert_eq!(configs[0].get("community").unwrap(), "private");
    }

    #[test]
    fn powercom_endpoint_sets_auto() {
        let asset = endpoint_asset("nut_powercom", &[("nut_powercom.secw_credential_id", "doc-1")]);
        let configs = configs_from_endpoint(&asset, &credentials()).unwrap();
        assert_eq!(configs[0].get("driver").unwrap(), "etn-nut-powerconnect");
        assert_eq!(configs[0].get("auto").unwrap(), "true");
    }

    #[test]
    fn missing_credential_is_an_error() {
        let asset = endpoint_asset("nut_snmp", &[("nut_snmp.secw_credential_id", "absent")]);
        assert!(matches!(
            configs_from_endpoint(&asset, &credentials()),
            Err(ConfigureError::CredentialNotFound(_))
        ));
    }

    #[test]
    fn completion_adds_driver_boilerplate() {
        let mut snmp_epdu: DeviceConfiguration = [
            ("driver".to_string(), "snmp-ups".to_string()),
            ("mibs".to_string(), "eaton_epdu".to_string()),
            ("port".to_string(), "10.0.0.1".to_string()),
        ]
        .into_iter()
        .collect();
        complete_candidate(&mut snmp_epdu, "epdu-1", "epdu", 30);
        assert_eq!(snmp_epdu.get("name").unwrap(), "epdu-1");
        assert_eq!(snmp_epdu.get("synchronous").unwrap(), "yes");
        assert_eq!(snmp_epdu.get("pollfreq").unwrap(), "30");
        assert!(!snmp_epdu.contains_key("pollinterval"));

        let mut netxml: DeviceConfiguration = [
            ("driver".to_string(), "netxml-ups".to_string()),
            ("port".to_string(), "http://10.0.0.1".to_string()),
        ]
        .into_iter()
        .collect();
        complete_candidate(&mut netxml, "ups-1", "ups", 30);
        assert_eq!(netxml.get("timeout").unwrap(), "15");
        assert_eq!(netxml.get("pollinterval").unwrap(), "30");
        assert!(!netxml.contains_key("synchronous"));
    }

    #[test]
    fn synchronous_follows_the_asset_subtype() {
        // an ePDU whose candidate carries no recognizable ePDU MIB
        let mut odd_mib: DeviceConfiguration = [
            ("driver".to_string(), "snmp-ups".to_string()),
            ("mibs".to_string(), "ietf".to_string()),
            ("port".to_string(), "10.0.0.1".to_string()),
        ]
        .into_iter()
        .collect();
        complete_candidate(&mut odd_mib, "epdu-9", "epdu", 30);
        assert_eq!(odd_mib.get("synchronous").unwrap(), "yes");

        // a UPS never gets the flag, ePDU-looking MIB or not
        let mut ups: DeviceConfiguration = [
            ("driver".to_string(), "snmp-ups".to_string()),
            ("mibs".to_string(), "eaton_epdu".to_string()),
            ("port".to_string(), "10.0.0.1".to_string()),
        ]
        .into_iter()
        .collect();
        complete_candidate(&mut ups, "ups-9", "ups", 30);
        assert!(!ups.contains_key("synchronous"));
    }
}
