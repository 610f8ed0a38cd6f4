//! Candidate ranking
//!
//! A stable total order over candidates, used both to pick the best one
//! and to reorder stored priorities. The device category is derived from
//! the asset subtype.

use crate::candidate::{
    can_netxml, can_snmp, is_ats, is_epdu, snmp_community, snmp_mib, snmp_security_level,
    snmp_version, DeviceConfiguration,
};
use std::cmp::Ordering;
use tracing::debug;

const UPS_DRIVER_PRIORITY: [&str; 4] = ["dummy-ups", "netxml-ups", "snmp-ups", "snmp-ups-dmf"];
const EPDU_DRIVER_PRIORITY: [&str; 4] = ["dummy-ups", "snmp-ups", "snmp-ups-dmf", "netxml-ups"];
const SNMP_MIB_PRIORITY: [&str; 2] = ["pw", "mge"];
const SNMP_SEC_PRIORITY: [&str; 3] = ["authPriv", "authNoPriv", "noAuthNoPriv"];

/// Position-based "a ranks before b" over a priority slice; entries not
/// listed rank last.
fn is_before(priority: &[&str], a: &str, b: &str) -> bool {
    let pos = |value: &str| {
        priority
            .iter()
            .position(|p| *p == value)
            .unwrap_or(priority.len())
    };
    pos(a) < pos(b)
}

fn prefers_epdu_order(subtype: &str) -> bool {
    matches!(subtype, "epdu" | "pdu" | "sts" | "ats")
}

/// Compare two candidates for an asset of the given subtype; `Less` means
/// `a` is preferred.
pub fn compare_preferred(
    subtype: &str,
    a: &DeviceConfiguration,
    b: &DeviceConfiguration,
) -> Ordering {
    let empty = String::new();
    let driver_a = a.get("driver").unwrap_or(&empty);
    let driver_b = b.get("driver").unwrap_or(&empty);

    if driver_a != driver_b {
        let priority: &[&str] = if prefers_epdu_order(subtype) {
            &EPDU_DRIVER_PRIORITY
        } else {
            &UPS_DRIVER_PRIORITY
        };
        return if is_before(priority, driver_a, driver_b) {
            Ordering::Less
        } else {
            Ordering::Greater
        };
    }

    if can_snmp(a) && can_snmp(b) {
        // most recent SNMP version first
        let (va, vb) = (snmp_version(a), snmp_version(b));
        if va != vb {
            return vb.cmp(&va);
        }
        // most secure SNMPv3 level first
        let (sa, sb) = (snmp_security_level(a), snmp_security_level(b));
        if sa != sb {
            return if is_before(&SNMP_SEC_PRIORITY, sa, sb) {
                Ordering::Less
            } else {
                Ordering::Greater
            };
        }
        // some MIBs over others
        let (ma, mb) = (snmp_mib(a), snmp_mib(b));
        if ma != mb {
            return if is_before(&SNMP_MIB_PRIORITY, ma, mb) {
                Ordering::Less
            } else {
                Ordering::Greater
            };
        }
        // communities other than public first
        let (ca, cb) = (snmp_community(a), snmp_community(b));
        if ca != "public" && cb == "public" {
            return Ordering::Less;
        }
        if ca == "public" && cb != "public" {
            return Ordering::Greater;
        }
    }

    a.cmp(b)
}

/// Indexes of `configs` ordered from most to least preferred.
pub fn sort_preferred(subtype: &str, configs: &[DeviceConfiguration]) -> Vec<usize> {
    let mut indexes: Vec<usize> = (0..configs.len()).collect();
    indexes.sort_by(|&a, &b| compare_preferred(subtype, &configs[a], &configs[b]));
    indexes
}

/// Pick the best candidate out of a scan batch.
///
/// An SNMP-capable ePDU or ATS uses SNMP even when NetXML answered;
/// otherwise NetXML wins when present, then SNMP by MIB preference.
pub fn select_best(configs: &[DeviceConfiguration]) -> Option<usize> {
    if configs.is_empty() {
        return None;
    }

    let any_epdu = configs.iter().any(is_epdu);
    let any_ats = configs.iter().any(is_ats);
    let any_snmp = configs.iter().any(can_snmp);
    let any_netxml = configs.iter().any(can_netxml);
    debug!(
        candidates = configs.len(),
        any_epdu, any_ats, any_snmp, any_netxml, "selecting best configuration"
    );

    if any_snmp && (any_epdu || any_ats) {
        best_snmp_mib(configs)
    } else if any_netxml {
        configs.iter().position(can_netxml)
    } else if any_snmp {
        best_snmp_mib(configs)
    } else {
        Some(0)
    }
    .or(Some(0))
}

/// First candidate whose MIB matches the priority list (`pw`, `mge`, then
/// any non-empty MIB).
fn best_snmp_mib(configs: &[DeviceConfiguration]) -> Option<usize> {
    for preferred in SNMP_MIB_PRIORITY {
        if let Some(index) = configs.iter().position(|c| snmp_mib(c) == preferred) {
            return Some(index);
        }
    }
    configs.iter().position(|c| !snmp_mib(c).is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::candidate::parse_scanner_output;

    fn driver_only(driver: &str) -> DeviceConfiguration {
        let mut config = DeviceConfiguration::new();
        config.insert("driver".into(), driver.into());
        config.insert("port".into(), "10.0.0.1".into());
        config
    }

    #[test]
    fn epdu_driver_order() {
        let configs = vec![
            driver_only("netxml-ups"),
            driver_only("snmp-ups"),
            driver_only("snmp-ups-dmf"),
            driver_only("dummy-ups"),
        ];
        let order = sort_preferred("epdu", &configs);
        let drivers: Vec<&str> = order
            .iter()
            .map(|&i| configs[i].get("driver").unwrap().as_str())
            .collect();
        assert_eq!(drivers, vec!["dummy-ups", "snmp-ups", "snmp-ups-dmf", "netxml-ups"]);
    }

    #[test]
    fn ups_driver_order() {
        let configs = vec![
            driver_only("snmp-ups-dmf"),
            driver_only("snmp-ups"),
            driver_only("netxml-ups"),
            driver_only("dummy-ups"),
        ];
        let order = sort_preferred("ups", &configs);
        let drivers: Vec<&str> = order
            .iter()
            .map(|&i| configs[i].get("driver").unwrap().as_str())
            .collect();
        assert_eq!(drivers, vec!["dummy-ups", "netxml-ups", "snmp-ups", "snmp-ups-dmf"]);
    }

    #[test]
    fn snmpv3_ranks_before_public_v1() {
        let configs = parse_scanner_output(
            r#"SNMP:driver="snmp-ups",port="10.0.0.1",mibs="eaton_epdu",community="public"
SNMP:driver="snmp-ups",port="10.0.0.1",mibs="eaton_epdu",snmp_version="v3",secLevel="authPriv",secName="private",authPassword="a",authProtocol="MD5",privPassword="p",privProtocol="DES"
"#,
        );
        let order = sort_preferred("ups", &configs);
        assert_eq!(order, vec![1, 0]);
    }

    #[test]
    fn full_preference_order_matches_reference() {
        // the five-candidate fixture of the original ranking test
        let configs = parse_scanner_output(
            r#"SNMP:driver="snmp-ups",port="10.130.33.140",mibs="eaton_epdu",community="public"
SNMP:driver="snmp-ups",port="10.130.33.140",mibs="eaton_epdu",snmp_version="v3",secLevel="authPriv",secName="private",authPassword="azertyui",privPassword="qsdfghjk",authProtocol="MD5",privProtocol="DES"
XML:driver="netxml-ups",port="http://10.130.33.140"
SNMP:driver="snmp-ups",port="10.130.33.140",mibs="eaton_epdu",snmp_version="v3",secLevel="noAuthNoPriv",secName="public"
SNMP:driver="snmp-ups",port="10.130.33.140",mibs="eaton_epdu",community="private"
"#,
        );
        assert_eq!(sort_preferred("ups", &configs), vec![2, 1, 3, 4, 0]);
        assert_eq!(sort_preferred("epdu", &configs), vec![1, 3, 4, 0, 2]);
    }

    #[test]
    fn snmp_capable_epdu_prefers_snmp_over_netxml() {
        let configs = parse_scanner_output(
            r#"XML:driver="netxml-ups",port="http://10.0.0.1"
SNMP:driver="snmp-ups",port="10.0.0.1",mibs="eaton_epdu",community="public"
"#,
        );
        assert_eq!(select_best(&configs), Some(1));
    }

    #[test]
    fn plain_ups_prefers_netxml() {
        let configs = parse_scanner_output(
            r#"SNMP:driver="snmp-ups",port="10.0.0.1",mibs="ietf",community="public"
XML:driver="netxml-ups",port="http://10.0.0.1"
"#,
        );
        assert_eq!(select_best(&configs), Some(1));
    }

    #[test]
    fn empty_batch_selects_nothing() {
        assert_eq!(select_best(&[]), None);
    }
}
