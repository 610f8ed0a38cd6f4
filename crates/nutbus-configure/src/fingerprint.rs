//! Configuration fingerprints and change detection
//!
//! A fingerprint reduces a candidate to the keys that decide whether the
//! same access path is being described: driver, port and the
//! driver-specific credential keys. Cosmetic fields like `desc` never
//! participate.

use crate::candidate::DeviceConfiguration;
use std::collections::BTreeSet;

/// Drivers whose working state the scan can assess. Anything else is
/// classified unknown-state and never marked non-working.
const ASSESSABLE_DRIVERS: [&str; 4] = ["netxml-ups", "snmp-ups", "snmp-ups-dmf", "dummy-snmp"];

const SNMP_FINGERPRINT_KEYS: [&str; 11] = [
    "driver",
    "port",
    "mibs",
    "snmp_version",
    "community",
    "secLevel",
    "secName",
    "authPassword",
    "authProtocol",
    "privPassword",
    "privProtocol",
];

const NETXML_FINGERPRINT_KEYS: [&str; 2] = ["driver", "port"];

pub fn can_working_state_be_assessed(config: &DeviceConfiguration) -> bool {
    config
        .get("driver")
        .map(|driver| ASSESSABLE_DRIVERS.contains(&driver.as_str()))
        .unwrap_or(false)
}

/// Extract the fingerprint of a candidate. Unrecognized drivers
/// fingerprint as themselves.
pub fn extract_fingerprint(config: &DeviceConfiguration) -> DeviceConfiguration {
    let keys: &[&str] = match config.get("driver").map(String::as_str) {
        Some("snmp-ups") | Some("snmp-ups-dmf") => &SNMP_FINGERPRINT_KEYS,
        Some("netxml-ups") => &NETXML_FINGERPRINT_KEYS,
        _ => return config.clone(),
    };

    keys.iter()
        .filter_map(|key| {
            config
                .get(*key)
                .map(|value| (key.to_string(), value.clone()))
        })
        .collect()
}

/// True when every entry of `subset` (except `desc`) appears identically
/// in `superset`.
pub fn is_subset_of(subset: &DeviceConfiguration, superset: &DeviceConfiguration) -> bool {
    subset.iter().all(|(key, value)| {
        key == "desc" || superset.get(key).map(|other| other == value).unwrap_or(false)
    })
}

/// Classification of known and detected candidates after a scan.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct ComputeUpdate {
    pub working: Vec<DeviceConfiguration>,
    pub non_working: Vec<DeviceConfiguration>,
    pub new: Vec<DeviceConfiguration>,
    pub unknown_state: Vec<DeviceConfiguration>,
}

/// Sort candidates into categories from what the database knows and what
/// the scan detected.
pub fn compute_update(
    known: &[DeviceConfiguration],
    detected: &[DeviceConfiguration],
) -> ComputeUpdate {
    let mut result = ComputeUpdate::default();

    let detected_fingerprints: BTreeSet<DeviceConfiguration> =
        detected.iter().map(extract_fingerprint).collect();
    let mut matched_fingerprints: BTreeSet<DeviceConfiguration> = BTreeSet::new();

    for known_config in known {
        if !can_working_state_be_assessed(known_config) {
            result.unknown_state.push(known_config.clone());
            continue;
        }
        let known_fingerprint = extract_fingerprint(known_config);
        match detected_fingerprints
            .iter()
            .find(|detected_fp| is_subset_of(detected_fp, &known_fingerprint))
        {
            Some(matched) => {
                result.working.push(known_config.clone());
                matched_fingerprints.insert(matched.clone());
            }
            None => result.non_working.push(known_config.clone()),
        }
    }

    for detected_config in detected {
        if !matched_fingerprints.contains(&extract_fingerprint(detected_config)) {
            result.new.push(detected_config.clone());
        }
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::candidate::parse_scanner_output;

    #[test]
    fn fingerprint_drops_cosmetic_fields() {
        let config = parse_scanner_output(
            r#"SNMP:driver="snmp-ups",port="10.0.0.1",desc="EPDU",mibs="eaton_epdu",community="public",extra="extra""#,
        )
        .remove(0);
        let fingerprint = extract_fingerprint(&config);
        assert!(!fingerprint.contains_key("desc"));
        assert!(!fingerprint.contains_key("extra"));
        assert_eq!(fingerprint.get("community").unwrap(), "public");
    }

    #[test]
    fn subset_matching_ignores_desc() {
        let superset = parse_scanner_output(
            r#"SNMP:driver="snmp-ups",port="10.0.0.1",desc="one thing",community="public",extra="extra""#,
        )
        .remove(0);
        let subset = parse_scanner_output(
            r#"SNMP:driver="snmp-ups",port="10.0.0.1",desc="another thing",community="public""#,
        )
        .remove(0);
        assert!(is_subset_of(&subset, &superset));
        assert!(!is_subset_of(&superset, &subset));
    }

    #[test]
    fn everything_detected_is_new_when_nothing_is_known() {
        let detected = parse_scanner_output(
            r#"SNMP:driver="snmp-ups",port="10.0.0.1",mibs="eaton_epdu",community="public"
SNMP:driver="snmp-ups",port="10.0.0.1",mibs="eaton_epdu",snmp_version="v3",secLevel="authPriv",secName="private",authPassword="a",privPassword="p",authProtocol="MD5",privProtocol="DES"
"#,
        );
        let result = compute_update(&[], &detected);
        assert!(result.working.is_empty());
        assert!(result.non_working.is_empty());
        assert!(result.unknown_state.is_empty());
        assert_eq!(result.new, detected);
    }

    #[test]
    fn classification_with_disjoint_fingerprints() {
        // known = {A(f1), B(f2)}, detected = {f1, f3}
        // -> working {A}, non-working {B}, new {f3}, unknown {}
        let known = parse_scanner_output(
            r#"SNMP:driver="snmp-ups",port="10.0.0.1",mibs="eaton_epdu",community="public"
SNMP:driver="snmp-ups",port="10.0.0.1",mibs="eaton_epdu",community="private"
"#,
        );
        let detected = parse_scanner_output(
            r#"SNMP:driver="snmp-ups",port="10.0.0.1",mibs="eaton_epdu",community="public"
SNMP:driver="snmp-ups",port="10.0.0.1",mibs="eaton_epdu",community="surprise"
"#,
        );
        let result = compute_update(&known, &detected);
        assert_eq!(result.working, vec![known[0].clone()]);
        assert_eq!(result.non_working, vec![known[1].clone()]);
        assert_eq!(result.new, vec![detected[1].clone()]);
        assert!(result.unknown_state.is_empty());
    }

    #[test]
    fn unrecognized_drivers_are_never_non_working() {
        let known = parse_scanner_output(r#"SNMP:driver="dummy-ups",port="10.0.0.1""#);
        let result = compute_update(&known, &[]);
        assert_eq!(result.unknown_state, known);
        assert!(result.non_working.is_empty());
    }

    #[test]
    fn cosmetic_variants_share_one_fingerprint() {
        let known = parse_scanner_output(
            r#"SNMP:driver="snmp-ups",port="10.0.0.1",mibs="eaton_epdu",community="public"
SNMP:driver="snmp-ups",port="10.0.0.1",mibs="eaton_epdu",community="public",desc="other"
"#,
        );
        let detected = parse_scanner_output(
            r#"SNMP:driver="snmp-ups",port="10.0.0.1",mibs="eaton_epdu",community="public""#,
        );
        let result = compute_update(&known, &detected);
        // both cosmetic variants match the same detected fingerprint
        assert_eq!(result.working.len(), 2);
        assert!(result.new.is_empty());
    }
}
