//! Configuration pipeline orchestration
//!
//! scan -> classify -> persist -> prioritize -> apply, serialized per
//! asset through the protection map. The chosen candidate lands in the
//! file repository and its driver unit in the lifecycle manager.

use crate::candidate::{serialize_config, DeviceConfiguration};
use crate::drivers::DriverLifecycle;
use crate::error::ConfigureError;
use crate::fingerprint::{compute_update, is_subset_of};
use crate::rank::{select_best, sort_preferred};
use crate::repository::ConfigRepository;
use crate::resolver::{acquire_candidates, complete_candidate, has_supported_endpoint};
use crate::scan::{ScanOptions, Scanner};
use crate::secw::{match_document_ids, CredentialSet};
use crate::store::{CandidateRecord, CandidateStore};
use crate::template::{instantiate, match_best_type, storable_attributes, ConfigurationType};
use nutbus_state::{Asset, ProtectAsset};
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tracing::{info, warn};

/// Tunables from the `[preferences]` and `[configuration]` sections.
#[derive(Debug, Clone)]
pub struct ManagerOptions {
    pub automatic_priority_sort: bool,
    pub prefer_dmf_for_snmp: bool,
    pub scan_dummy_ups: bool,
    pub scan_timeout_secs: u64,
    pub polling_interval_secs: u64,
}

impl Default for ManagerOptions {
    fn default() -> Self {
        Self {
            automatic_priority_sort: true,
            prefer_dmf_for_snmp: false,
            scan_dummy_ups: false,
            scan_timeout_secs: crate::scan::SCAN_TIMEOUT_SECS,
            polling_interval_secs: 30,
        }
    }
}

pub struct ConfigurationManager {
    store: CandidateStore,
    repository: ConfigRepository,
    drivers: Arc<DriverLifecycle>,
    scanner: Scanner,
    protect: ProtectAsset,
    types: Vec<ConfigurationType>,
    options: ManagerOptions,
    /// Asset name -> credential document ids its configuration uses.
    device_credentials: Mutex<HashMap<String, BTreeSet<String>>>,
}

impl ConfigurationManager {
    pub fn new(
        store: CandidateStore,
        repository: ConfigRepository,
        drivers: Arc<DriverLifecycle>,
        scanner: Scanner,
        options: ManagerOptions,
    ) -> Self {
        Self {
            store,
            repository,
            drivers,
            scanner,
            protect: ProtectAsset::new(),
            types: ConfigurationType::defaults(),
            options,
            device_credentials: Mutex::new(HashMap::new()),
        }
    }

    pub fn repository(&self) -> &ConfigRepository {
        &self.repository
    }

    pub fn set_polling_interval(&mut self, secs: u64) {
        self.options.polling_interval_secs = secs;
    }

    /// Run the full pipeline for one asset. Returns true once a
    /// configuration file is in place and its driver scheduled.
    ///
    /// Assets carrying a verbatim block or a structured endpoint are
    /// applied directly; only scan results go through the candidate
    /// database.
    pub async fn process_asset(
        &self,
        asset: &Asset,
        credentials: &CredentialSet,
    ) -> Result<bool, ConfigureError> {
        let _guard = self.protect.lock(asset.name()).await;

        if asset.upsconf_block().is_some() || has_supported_endpoint(asset) {
            return self.apply_direct(asset, credentials).await;
        }

        self.scan_asset_configurations(asset, credentials).await?;
        if self.options.automatic_priority_sort {
            self.sort_priorities(asset, credentials)?;
        }
        self.apply_asset_configuration(asset, credentials)
    }

    /// Apply the best candidate of the verbatim or endpoint path.
    async fn apply_direct(
        &self,
        asset: &Asset,
        credentials: &CredentialSet,
    ) -> Result<bool, ConfigureError> {
        let opts = ScanOptions {
            timeout_secs: self.options.scan_timeout_secs,
            use_dmf: self.options.prefer_dmf_for_snmp,
            scan_dummy_ups: self.options.scan_dummy_ups,
        };
        let configs = acquire_candidates(asset, credentials, &self.scanner, opts).await?;
        let Some(best) = select_best(&configs) else {
            warn!(asset = asset.name(), "no suitable configuration found");
            return Ok(false);
        };
        let mut chosen = configs[best].clone();
        complete_candidate(
            &mut chosen,
            asset.name(),
            asset.subtype(),
            self.options.polling_interval_secs,
        );

        self.device_credentials
            .lock()
            .insert(asset.name().to_string(), match_document_ids(&chosen, credentials));

        let text = serialize_config(Some(asset.name()), &chosen);
        if self.repository.apply(asset.name(), &text)? {
            self.drivers.schedule_start(asset.name());
        }
        Ok(true)
    }

    /// Scan the asset and fold the result into the candidate store:
    /// existing records flip working/non-working, unmatched detections
    /// become new records.
    pub async fn scan_asset_configurations(
        &self,
        asset: &Asset,
        credentials: &CredentialSet,
    ) -> Result<(), ConfigureError> {
        let known_records = self.store.list(asset.name())?;
        let known = self.instantiate_records(asset, &known_records, credentials);

        let opts = ScanOptions {
            timeout_secs: self.options.scan_timeout_secs,
            use_dmf: self.options.prefer_dmf_for_snmp,
            scan_dummy_ups: self.options.scan_dummy_ups,
        };
        let detected = acquire_candidates(asset, credentials, &self.scanner, opts).await?;

        let update = compute_update(&known, &detected);
        info!(
            asset = asset.name(),
            working = update.working.len(),
            non_working = update.non_working.len(),
            new = update.new.len(),
            unknown = update.unknown_state.len(),
            "configuration scan summary"
        );

        // flip working flags on records we could classify
        for (configs, working) in [
            (&update.working, true),
            (&update.unknown_state, true),
            (&update.non_working, false),
        ] {
            for config in configs {
                match known
                    .iter()
                    .zip(&known_records)
                    .find(|(instantiated, _)| is_subset_of(config, instantiated))
                {
                    Some((_, record)) => {
                        self.store.set_working(asset.name(), record.id, working)?;
                    }
                    None => warn!(
                        asset = asset.name(),
                        "classified configuration has no matching record, ignored"
                    ),
                }
            }
        }

        // persist newly discovered candidates
        for config in &update.new {
            match match_best_type(asset, config, &self.types) {
                Some(config_type) => {
                    let attributes = storable_attributes(config, config_type);
                    let secw_ids = match_document_ids(config, credentials);
                    let id = self.store.insert(
                        asset.name(),
                        config_type.id,
                        true,
                        true,
                        secw_ids,
                        attributes,
                    )?;
                    info!(
                        asset = asset.name(),
                        id,
                        type_name = %config_type.pretty_name,
                        driver = config.get("driver").map(String::as_str).unwrap_or(""),
                        "persisted new device configuration"
                    );
                }
                None => warn!(
                    asset = asset.name(),
                    "no configuration type matches detected candidate, discarded"
                ),
            }
        }

        Ok(())
    }

    /// Re-rank the stored candidates by the software preference order.
    pub fn sort_priorities(
        &self,
        asset: &Asset,
        credentials: &CredentialSet,
    ) -> Result<(), ConfigureError> {
        let records = self.store.list(asset.name())?;
        if records.len() < 2 {
            return Ok(());
        }
        let configs = self.instantiate_records(asset, &records, credentials);
        let order: Vec<u64> = sort_preferred(asset.subtype(), &configs)
            .into_iter()
            .map(|index| records[index].id)
            .collect();
        self.store.set_priorities(asset.name(), &order)
    }

    /// Write the best working candidate to the repository and schedule
    /// its driver. Returns false when no candidate is usable.
    pub fn apply_asset_configuration(
        &self,
        asset: &Asset,
        credentials: &CredentialSet,
    ) -> Result<bool, ConfigureError> {
        let records = self.store.candidates(asset.name())?;
        let configs = self.instantiate_records(asset, &records, credentials);

        let Some(mut chosen) = configs.into_iter().next() else {
            warn!(asset = asset.name(), "no usable configuration candidate");
            return Ok(false);
        };
        complete_candidate(
            &mut chosen,
            asset.name(),
            asset.subtype(),
            self.options.polling_interval_secs,
        );

        let secw_ids: BTreeSet<String> = records
            .iter()
            .flat_map(|record| record.secw_document_ids.iter().cloned())
            .collect();
        self.device_credentials
            .lock()
            .insert(asset.name().to_string(), secw_ids);

        let text = serialize_config(Some(asset.name()), &chosen);
        if self.repository.apply(asset.name(), &text)? {
            self.drivers.schedule_start(asset.name());
        }
        Ok(true)
    }

    /// Drop everything known about an asset and stop its driver.
    pub fn remove_asset_configuration(&self, name: &str) -> Result<(), ConfigureError> {
        info!(asset = name, "removing asset configuration");
        self.store.remove_asset(name)?;
        self.device_credentials.lock().remove(name);
        if self.repository.forget(name)? {
            self.drivers.schedule_stop(name);
        }
        self.protect.remove(name);
        Ok(())
    }

    /// Assets whose applied configuration references a credential
    /// document.
    pub fn assets_using_credential(&self, document_id: &str) -> Vec<String> {
        self.device_credentials
            .lock()
            .iter()
            .filter(|(_, ids)| ids.contains(document_id))
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Reconstruct concrete configurations from stored records: template
    /// defaults instantiated against the asset, stored attributes
    /// overlaid, credentials flattened in.
    fn instantiate_records(
        &self,
        asset: &Asset,
        records: &[CandidateRecord],
        credentials: &CredentialSet,
    ) -> Vec<DeviceConfiguration> {
        records
            .iter()
            .map(|record| {
                let mut config = self
                    .types
                    .iter()
                    .find(|t| t.id == record.type_id)
                    .and_then(|t| instantiate(asset, &t.default_attributes))
                    .unwrap_or_default();
                for (key, value) in &record.attributes {
                    config.insert(key.clone(), value.clone());
                }
                for id in &record.secw_document_ids {
                    if let Some(keys) = credentials.driver_keys(id) {
                        for (key, value) in keys {
                            config.insert(key, value);
                        }
                    }
                }
                config
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::secw::Snmpv1Credential;
    use nutbus_proto::{AssetMessage, AssetOperation};

    fn manager(dir: &std::path::Path) -> ConfigurationManager {
        ConfigurationManager::new(
            CandidateStore::open(dir.join("db")).unwrap(),
            ConfigRepository::new(dir.join("devices")),
            Arc::new(DriverLifecycle::new()),
            Scanner::with_binary("echo", 2),
            ManagerOptions::default(),
        )
    }

    fn epdu_asset() -> Asset {
        Asset::from_message(
            &AssetMessage::new("epdu-1", AssetOperation::Create)
                .with_aux("type", "device")
                .with_aux("subtype", "epdu")
                .with_ext("ip.1", "10.130.33.140"),
        )
    }

    fn credentials() -> CredentialSet {
        CredentialSet {
            snmpv1: vec![Snmpv1Credential {
                id: "doc-1".into(),
                name: String::new(),
                community: "public".into(),
            }],
            snmpv3: vec![],
        }
    }

    #[test]
    fn apply_writes_file_and_tracks_credentials() {
        let dir = tempfile::tempdir().unwrap();
        let m = manager(dir.path());
        let asset = epdu_asset();
        let creds = credentials();

        // one stored SNMPv1 candidate
        let attributes: DeviceConfiguration =
            [("mibs".to_string(), "eaton_epdu".to_string())].into_iter().collect();
        m.store
            .insert(
                "epdu-1",
                1,
                true,
                true,
                ["doc-1".to_string()].into_iter().collect(),
                attributes,
            )
            .unwrap();

        assert!(m.apply_asset_configuration(&asset, &creds).unwrap());

        let text = std::fs::read_to_string(dir.path().join("devices/epdu-1")).unwrap();
        assert!(text.contains("driver = \"snmp-ups\""));
        assert!(text.contains("port = \"10.130.33.140\""));
        assert!(text.contains("community = \"public\""));
        assert!(text.contains("synchronous = \"yes\""));
        assert!(text.contains("name = \"epdu-1\""));

        assert_eq!(m.assets_using_credential("doc-1"), vec!["epdu-1"]);
        assert!(m.assets_using_credential("doc-2").is_empty());
    }

    #[test]
    fn apply_without_candidates_reports_false() {
        let dir = tempfile::tempdir().unwrap();
        let m = manager(dir.path());
        assert!(!m.apply_asset_configuration(&epdu_asset(), &credentials()).unwrap());
    }

    #[test]
    fn remove_clears_store_and_repository() {
        let dir = tempfile::tempdir().unwrap();
        let m = manager(dir.path());
        let asset = epdu_asset();
        let creds = credentials();

        m.store
            .insert("epdu-1", 1, true, true, BTreeSet::new(), DeviceConfiguration::new())
            .unwrap();
        m.apply_asset_configuration(&asset, &creds).unwrap();

        m.remove_asset_configuration("epdu-1").unwrap();
        assert!(m.store.list("epdu-1").unwrap().is_empty());
        assert!(m.repository.known_assets().unwrap().is_empty());
    }

    #[tokio::test]
    async fn verbatim_asset_configures_without_scanner() {
        let dir = tempfile::tempdir().unwrap();
        let m = manager(dir.path());
        let creds = CredentialSet::default();

        let asset = Asset::from_message(
            &AssetMessage::new("ups-9", AssetOperation::Create)
                .with_aux("type", "device")
                .with_aux("subtype", "ups")
                .with_ext("ip.1", "10.0.0.9")
                .with_ext("upsconf_block", ";driver = dummy-ups;port = auto"),
        );

        assert!(m.process_asset(&asset, &creds).await.unwrap());
        let text = std::fs::read_to_string(dir.path().join("devices/ups-9")).unwrap();
        assert!(text.contains("driver = \"dummy-ups\""));
        assert!(text.contains("pollinterval = \"30\""));
        // the candidate database stays out of the verbatim path
        assert!(m.store.list("ups-9").unwrap().is_empty());
    }
}
