//! Device configuration candidates
//!
//! A candidate is a flat map of NUT driver keys. Serialization is the
//! ups.conf section format; parsing accepts both that format and the
//! one-line scanner output.

use std::collections::BTreeMap;

/// NUT driver keys -> values, ordered for stable serialization.
pub type DeviceConfiguration = BTreeMap<String, String>;

/// Drivers that speak SNMP.
pub const SNMP_DRIVERS: [&str; 3] = ["snmp-ups", "snmp-ups-dmf", "snmp-ups-old"];

const EPDU_MIBS: [&str; 6] = [
    "eaton_epdu",
    "aphel_genesisII",
    "aphel_revelation",
    "pulizzi_switched1",
    "pulizzi_switched2",
    "emerson_avocent_pdu",
];

const ATS_MIBS: [&str; 4] = ["eaton_ats16", "eaton_ats16_g2", "eaton_ats30", "apc_ats"];

pub fn is_epdu(config: &DeviceConfiguration) -> bool {
    if let Some(mibs) = config.get("mibs") {
        if EPDU_MIBS.contains(&mibs.as_str()) {
            return true;
        }
    }
    if let Some(desc) = config.get("desc") {
        if desc.contains("epdu") {
            return true;
        }
    }
    false
}

pub fn is_ats(config: &DeviceConfiguration) -> bool {
    config
        .get("mibs")
        .map(|mibs| ATS_MIBS.contains(&mibs.as_str()))
        .unwrap_or(false)
}

pub fn is_ups(config: &DeviceConfiguration) -> bool {
    !(is_epdu(config) || is_ats(config))
}

pub fn can_snmp(config: &DeviceConfiguration) -> bool {
    config
        .get("driver")
        .map(|driver| SNMP_DRIVERS.contains(&driver.as_str()))
        .unwrap_or(false)
}

pub fn can_netxml(config: &DeviceConfiguration) -> bool {
    config.get("driver").map(String::as_str) == Some("netxml-ups")
}

/// SNMP protocol version of a candidate: 3 when declared or implied by a
/// security name, otherwise 1.
pub fn snmp_version(config: &DeviceConfiguration) -> i32 {
    match config.get("snmp_version").map(String::as_str) {
        Some("v3") => 3,
        Some("v2c") => 2,
        Some("v1") => 1,
        _ if config.contains_key("secName") => 3,
        _ => 1,
    }
}

pub fn snmp_security_level(config: &DeviceConfiguration) -> &str {
    config.get("secLevel").map(String::as_str).unwrap_or("")
}

pub fn snmp_community(config: &DeviceConfiguration) -> &str {
    config.get("community").map(String::as_str).unwrap_or("")
}

pub fn snmp_mib(config: &DeviceConfiguration) -> &str {
    config.get("mibs").map(String::as_str).unwrap_or("")
}

/// Serialize one candidate as a ups.conf section. Keys come out in map
/// order, every value quoted.
pub fn serialize_config(name: Option<&str>, config: &DeviceConfiguration) -> String {
    let mut out = String::new();
    if let Some(name) = name {
        out.push_str(&format!("[{name}]\n"));
    }
    for (key, value) in config {
        out.push_str(&format!("{key} = \"{value}\"\n"));
    }
    out
}

/// Parse ups.conf-style text into `(section, configuration)` pairs.
/// Values may be quoted or bare; `#` starts a comment.
pub fn parse_config_text(text: &str) -> Vec<(String, DeviceConfiguration)> {
    let mut sections: Vec<(String, DeviceConfiguration)> = Vec::new();

    for raw in text.lines() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some(name) = line.strip_prefix('[').and_then(|rest| rest.strip_suffix(']')) {
            sections.push((name.trim().to_string(), DeviceConfiguration::new()));
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim().to_string();
        let value = unquote(value.trim());
        if let Some((_, config)) = sections.last_mut() {
            config.insert(key, value);
        }
    }
    sections
}

/// Parse the one-line-per-candidate scanner output format:
/// `SNMP:driver="snmp-ups",port="10.0.0.1",mibs="eaton_epdu",…`
pub fn parse_scanner_output(output: &str) -> Vec<DeviceConfiguration> {
    let mut configs = Vec::new();

    for raw in output.lines() {
        let line = raw.trim();
        if line.is_empty() {
            continue;
        }
        // drop the bus-type prefix up to the first colon
        let body = match line.split_once(':') {
            Some((_, body)) => body,
            None => continue,
        };

        let mut config = DeviceConfiguration::new();
        for pair in split_scanner_pairs(body) {
            if let Some((key, value)) = pair.split_once('=') {
                config.insert(key.trim().to_string(), unquote(value.trim()));
            }
        }
        if config.contains_key("driver") {
            configs.push(config);
        }
    }
    configs
}

/// Split `key="a,b",key2="c"` on commas outside quotes.
fn split_scanner_pairs(body: &str) -> Vec<String> {
    let mut pairs = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    for ch in body.chars() {
        match ch {
            '"' => {
                in_quotes = !in_quotes;
                current.push(ch);
            }
            ',' if !in_quotes => pairs.push(std::mem::take(&mut current)),
            _ => current.push(ch),
        }
    }
    if !current.is_empty() {
        pairs.push(current);
    }
    pairs
}

fn unquote(value: &str) -> String {
    let value = value.trim();
    if value.len() >= 2 && value.starts_with('"') && value.ends_with('"') {
        value[1..value.len() - 1]
            .replace("\\\"", "\"")
            .replace("\\\\", "\\")
    } else {
        value.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snmp_epdu() -> DeviceConfiguration {
        parse_scanner_output(
            r#"SNMP:driver="snmp-ups",port="10.130.33.140",mibs="eaton_epdu",community="public""#,
        )
        .remove(0)
    }

    #[test]
    fn classification_by_mib_and_desc() {
        let epdu = snmp_epdu();
        assert!(is_epdu(&epdu));
        assert!(!is_ats(&epdu));
        assert!(can_snmp(&epdu));
        assert!(!can_netxml(&epdu));

        let mut by_desc = DeviceConfiguration::new();
        by_desc.insert("driver".into(), "netxml-ups".into());
        by_desc.insert("desc".into(), "EPDU MA 0U epdu".into());
        assert!(is_epdu(&by_desc));
        assert!(can_netxml(&by_desc));

        let mut ats = DeviceConfiguration::new();
        ats.insert("driver".into(), "snmp-ups".into());
        ats.insert("mibs".into(), "apc_ats".into());
        assert!(is_ats(&ats));
        assert!(!is_ups(&ats));
    }

    #[test]
    fn snmp_version_inference() {
        let mut config = DeviceConfiguration::new();
        config.insert("driver".into(), "snmp-ups".into());
        assert_eq!(snmp_version(&config), 1);
        config.insert("secName".into(), "private".into());
        assert_eq!(snmp_version(&config), 3);
        config.insert("snmp_version".into(), "v3".into());
        assert_eq!(snmp_version(&config), 3);
    }

    #[test]
    fn scanner_output_parses_quoted_commas() {
        let configs = parse_scanner_output(
            r#"SNMP:driver="snmp-ups",port="10.0.0.1",desc="EPDU MA 0U (C20 16A 1P)20XC13:4XC19",community="public"
XML:driver="netxml-ups",port="http://10.0.0.1"
"#,
        );
        assert_eq!(configs.len(), 2);
        assert_eq!(
            configs[0].get("desc").unwrap(),
            "EPDU MA 0U (C20 16A 1P)20XC13:4XC19"
        );
        assert_eq!(configs[1].get("port").unwrap(), "http://10.0.0.1");
    }

    #[test]
    fn serialize_parse_roundtrip() {
        let config = snmp_epdu();
        let text = serialize_config(Some("epdu-1"), &config);
        let parsed = parse_config_text(&text);
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].0, "epdu-1");
        assert_eq!(parsed[0].1, config);
    }

    #[test]
    fn config_text_accepts_bare_values() {
        let parsed = parse_config_text("[ups-1]\ndriver = dummy-ups\nport = auto\n# comment\n");
        assert_eq!(parsed[0].1.get("driver").unwrap(), "dummy-ups");
        assert_eq!(parsed[0].1.get("port").unwrap(), "auto");
    }
}
