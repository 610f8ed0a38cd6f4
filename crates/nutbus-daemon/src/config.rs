//! Process configuration
//!
//! TOML file with the daemon's tunables. Every section has workable
//! defaults so an empty file (or none at all) yields a running daemon.

use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct DaemonConfig {
    #[serde(default)]
    pub nut: NutSection,
    #[serde(default)]
    pub log: LogSection,
    #[serde(default)]
    pub bus: BusSection,
    #[serde(default)]
    pub configuration: ConfigurationSection,
    #[serde(default)]
    pub rescan_policy: RescanPolicySection,
    #[serde(default)]
    pub preferences: PreferencesSection,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NutSection {
    /// Base polling period in seconds.
    #[serde(default = "default_polling_interval")]
    pub polling_interval: u64,
    /// Command-path daemon host.
    #[serde(default = "default_nut_host")]
    pub host: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct LogSection {
    /// Logger configuration hint passed to the EnvFilter.
    #[serde(default)]
    pub config: String,
    #[serde(default)]
    pub verbose: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BusSection {
    #[serde(default = "default_bus_url")]
    pub url: String,
    #[serde(default = "default_agent_name")]
    pub agent_name: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigurationSection {
    /// Scan concurrency.
    #[serde(default = "default_scanner_pool")]
    pub thread_pool_scanner_size: usize,
    /// Target directory for per-asset driver configuration files.
    #[serde(default = "default_repository_dir")]
    pub nut_repository_directory: PathBuf,
    /// Candidate database location.
    #[serde(default = "default_store_dir")]
    pub candidate_store_directory: PathBuf,
    /// NUT -> canonical mapping file loaded at CONFIGURE time.
    #[serde(default = "default_mapping_file")]
    pub mapping_file: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RescanPolicySection {
    #[serde(default = "default_true")]
    pub on_start: bool,
    #[serde(default)]
    pub on_security_wallet_create: bool,
    #[serde(default = "default_true")]
    pub on_security_wallet_update: bool,
    #[serde(default = "default_true")]
    pub on_security_wallet_delete: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PreferencesSection {
    #[serde(default = "default_true")]
    pub automatic_priority_sort: bool,
    #[serde(default)]
    pub prefer_dmf_for_snmp: bool,
    #[serde(default)]
    pub scan_dummy_ups: bool,
}

impl DaemonConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&text)?)
    }
}

fn default_polling_interval() -> u64 {
    30
}

fn default_nut_host() -> String {
    "localhost".to_string()
}

fn default_bus_url() -> String {
    "nats://127.0.0.1:4222".to_string()
}

fn default_agent_name() -> String {
    "nutbus".to_string()
}

fn default_scanner_pool() -> usize {
    20
}

fn default_repository_dir() -> PathBuf {
    PathBuf::from("/var/lib/nutbus/devices")
}

fn default_store_dir() -> PathBuf {
    PathBuf::from("/var/lib/nutbus/candidates")
}

fn default_mapping_file() -> PathBuf {
    PathBuf::from("/usr/share/nutbus/mapping.conf")
}

fn default_true() -> bool {
    true
}

impl Default for NutSection {
    fn default() -> Self {
        Self {
            polling_interval: default_polling_interval(),
            host: default_nut_host(),
            username: String::new(),
            password: String::new(),
        }
    }
}

impl Default for BusSection {
    fn default() -> Self {
        Self {
            url: default_bus_url(),
            agent_name: default_agent_name(),
        }
    }
}

impl Default for ConfigurationSection {
    fn default() -> Self {
        Self {
            thread_pool_scanner_size: default_scanner_pool(),
            nut_repository_directory: default_repository_dir(),
            candidate_store_directory: default_store_dir(),
            mapping_file: default_mapping_file(),
        }
    }
}

impl Default for RescanPolicySection {
    fn default() -> Self {
        Self {
            on_start: true,
            on_security_wallet_create: false,
            on_security_wallet_update: true,
            on_security_wallet_delete: true,
        }
    }
}

impl Default for PreferencesSection {
    fn default() -> Self {
        Self {
            automatic_priority_sort: true,
            prefer_dmf_for_snmp: false,
            scan_dummy_ups: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn empty_config_uses_defaults() {
        let config: DaemonConfig = toml::from_str("").unwrap();
        assert_eq!(config.nut.polling_interval, 30);
        assert_eq!(config.nut.host, "localhost");
        assert_eq!(config.configuration.thread_pool_scanner_size, 20);
        assert!(config.preferences.automatic_priority_sort);
        assert!(!config.preferences.prefer_dmf_for_snmp);
        assert!(config.rescan_policy.on_start);
    }

    #[test]
    fn sections_override_defaults() {
        let config: DaemonConfig = toml::from_str(
            r#"
[nut]
polling_interval = 15
username = "monitor"
password = "secret"

[configuration]
thread_pool_scanner_size = 4
nut_repository_directory = "/tmp/devices"

[preferences]
prefer_dmf_for_snmp = true
"#,
        )
        .unwrap();
        assert_eq!(config.nut.polling_interval, 15);
        assert_eq!(config.nut.username, "monitor");
        assert_eq!(config.configuration.thread_pool_scanner_size, 4);
        assert!(config.preferences.prefer_dmf_for_snmp);
    }

    #[test]
    fn load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "[nut]\npolling_interval = 10\n").unwrap();
        let config = DaemonConfig::load(file.path()).unwrap();
        assert_eq!(config.nut.polling_interval, 10);
    }

    #[test]
    fn unknown_keys_are_rejected() {
        assert!(toml::from_str::<DaemonConfig>("[nut]\nbogus = 1\n").is_err());
    }
}
