//! Active device scanning
//!
//! Front-end over the external `nut-scanner` binary. Scans run on a
//! semaphore-bounded pool; SNMPv3 credentials are tried first and SNMPv1
//! is skipped when any of them answers, NetXML is always attempted.

use crate::candidate::{parse_scanner_output, DeviceConfiguration};
use crate::error::ConfigureError;
use crate::secw::{CredentialSet, Snmpv1Credential, Snmpv3Credential};
use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

/// Default per-scan timeout in seconds.
pub const SCAN_TIMEOUT_SECS: u64 = 10;

#[derive(Debug, Clone, Copy)]
pub struct ScanOptions {
    pub timeout_secs: u64,
    /// Report `snmp-ups-dmf` instead of `snmp-ups` for SNMP hits.
    pub use_dmf: bool,
    /// Also probe the remote NUT port, yielding `dummy-ups` candidates.
    pub scan_dummy_ups: bool,
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self {
            timeout_secs: SCAN_TIMEOUT_SECS,
            use_dmf: false,
            scan_dummy_ups: false,
        }
    }
}

/// Bounded scan pool over the `nut-scanner` binary.
#[derive(Clone)]
pub struct Scanner {
    binary: String,
    pool: Arc<Semaphore>,
}

impl Scanner {
    pub fn new(pool_size: usize) -> Self {
        Self {
            binary: "nut-scanner".to_string(),
            pool: Arc::new(Semaphore::new(pool_size.max(1))),
        }
    }

    #[cfg(test)]
    pub fn with_binary(binary: &str, pool_size: usize) -> Self {
        Self {
            binary: binary.to_string(),
            pool: Arc::new(Semaphore::new(pool_size.max(1))),
        }
    }

    async fn run(&self, args: Vec<String>, opts: &ScanOptions) -> Vec<DeviceConfiguration> {
        let Ok(_permit) = self.pool.clone().acquire_owned().await else {
            return Vec::new();
        };

        let output = tokio::time::timeout(
            // leave the scanner a grace period past its own timeout
            Duration::from_secs(opts.timeout_secs + 5),
            Command::new(&self.binary).args(&args).output(),
        )
        .await;

        let output = match output {
            Ok(Ok(output)) => output,
            Ok(Err(err)) => {
                warn!(error = %err, "nut-scanner could not be launched");
                return Vec::new();
            }
            Err(_) => {
                warn!("nut-scanner timed out");
                return Vec::new();
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout);
        let mut configs = parse_scanner_output(&stdout);
        if opts.use_dmf {
            for config in &mut configs {
                if config.get("driver").map(String::as_str) == Some("snmp-ups") {
                    config.insert("driver".into(), "snmp-ups-dmf".into());
                }
            }
        }
        debug!(candidates = configs.len(), "scan finished");
        configs
    }

    fn base_args(ip: &str, timeout_secs: u64) -> Vec<String> {
        vec![
            "--parsable".into(),
            "--quiet".into(),
            "--start_ip".into(),
            ip.into(),
            "--end_ip".into(),
            ip.into(),
            "--timeout".into(),
            timeout_secs.to_string(),
        ]
    }

    pub async fn scan_snmpv1(
        &self,
        ip: &str,
        credential: &Snmpv1Credential,
        opts: ScanOptions,
    ) -> Vec<DeviceConfiguration> {
        info!(community = %credential.community, %ip, "scanning SNMPv1 protocol");
        let mut args = Self::base_args(ip, opts.timeout_secs);
        args.extend([
            "--snmp_scan".into(),
            "--community".into(),
            credential.community.clone(),
        ]);
        self.run(args, &opts).await
    }

    pub async fn scan_snmpv3(
        &self,
        ip: &str,
        credential: &Snmpv3Credential,
        opts: ScanOptions,
    ) -> Vec<DeviceConfiguration> {
        info!(security_name = %credential.security_name, %ip, "scanning SNMPv3 protocol");
        let mut args = Self::base_args(ip, opts.timeout_secs);
        args.extend([
            "--snmp_scan".into(),
            "--secLevel".into(),
            credential.security_level.clone(),
            "--secName".into(),
            credential.security_name.clone(),
        ]);
        if let (Some(protocol), Some(password)) =
            (&credential.auth_protocol, &credential.auth_password)
        {
            args.extend([
                "--authProtocol".into(),
                protocol.clone(),
                "--authPassword".into(),
                password.clone(),
            ]);
        }
        if let (Some(protocol), Some(password)) =
            (&credential.priv_protocol, &credential.priv_password)
        {
            args.extend([
                "--privProtocol".into(),
                protocol.clone(),
                "--privPassword".into(),
                password.clone(),
            ]);
        }
        self.run(args, &opts).await
    }

    pub async fn scan_netxml(&self, ip: &str, opts: ScanOptions) -> Vec<DeviceConfiguration> {
        info!(%ip, "scanning NetXML protocol");
        let mut args = Self::base_args(ip, opts.timeout_secs);
        args.push("--xml_scan".into());
        self.run(args, &opts).await
    }

    /// Probe a remote NUT daemon; hits come back as `dummy-ups`
    /// passthrough candidates.
    pub async fn scan_nut(&self, ip: &str, opts: ScanOptions) -> Vec<DeviceConfiguration> {
        info!(%ip, "scanning remote NUT protocol");
        let mut args = Self::base_args(ip, opts.timeout_secs);
        args.push("--oldnut_scan".into());
        self.run(args, &opts).await
    }

    /// Scan one address with every protocol per the acquisition policy.
    pub async fn scan_address(
        &self,
        ip: &str,
        credentials: &CredentialSet,
        opts: ScanOptions,
    ) -> Result<Vec<DeviceConfiguration>, ConfigureError> {
        if ip.is_empty() {
            return Err(ConfigureError::NoAddress(ip.to_string()));
        }

        let netxml = self.scan_netxml(ip, opts);

        // SNMPv3 batch in parallel; fall back to SNMPv1 only when it
        // yields nothing.
        let v3_batch = join_all(
            credentials
                .snmpv3
                .iter()
                .map(|credential| self.scan_snmpv3(ip, credential, opts)),
        );

        let (netxml_results, v3_results) = tokio::join!(netxml, v3_batch);

        let mut snmp: Vec<DeviceConfiguration> = v3_results.into_iter().flatten().collect();
        if snmp.is_empty() {
            let v1_results = join_all(
                credentials
                    .snmpv1
                    .iter()
                    .map(|credential| self.scan_snmpv1(ip, credential, opts)),
            )
            .await;
            snmp = v1_results.into_iter().flatten().collect();
        } else {
            info!(%ip, "SNMPv3 answered, skipping SNMPv1 scan");
        }

        let mut results = snmp;
        results.extend(netxml_results);
        if opts.scan_dummy_ups {
            results.extend(self.scan_nut(ip, opts).await);
        }
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // `echo` stands in for nut-scanner: it prints its arguments, which do
    // not parse as candidates, exercising the plumbing without the binary.
    #[tokio::test]
    async fn missing_devices_scan_to_empty() {
        let scanner = Scanner::with_binary("echo", 2);
        let credentials = CredentialSet::default();
        let results = scanner
            .scan_address("192.0.2.1", &credentials, ScanOptions::default())
            .await
            .unwrap();
        assert!(results.is_empty());
    }

    #[tokio::test]
    async fn empty_ip_is_rejected() {
        let scanner = Scanner::with_binary("echo", 2);
        let credentials = CredentialSet::default();
        let err = scanner
            .scan_address("", &credentials, ScanOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ConfigureError::NoAddress(_)));
    }

    #[tokio::test]
    async fn unlaunchable_scanner_degrades_to_no_candidates() {
        let scanner = Scanner::with_binary("/nonexistent/nut-scanner", 1);
        let credential = Snmpv1Credential {
            id: "doc".into(),
            name: String::new(),
            community: "public".into(),
        };
        let results = scanner
            .scan_snmpv1("192.0.2.1", &credential, ScanOptions::default())
            .await;
        assert!(results.is_empty());
    }
}
