//! Autoconfiguration scheduler
//!
//! Tracks a per-asset configuration state machine over the committed
//! catalog and chooses the next wake-up from it: fresh verbatim assets
//! and deletions are near-immediate, discovery waits a few seconds,
//! failed configurations retry after a minute, configured assets sleep.

use nutbus_configure::secw::{fetch_credentials, CredentialSet};
use nutbus_configure::ConfigurationManager;
use nutbus_proto::BusClient;
use nutbus_state::{Asset, Reader};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigState {
    New,
    Configuring,
    Configured,
    Deleting,
}

#[derive(Debug)]
struct Entry {
    state: ConfigState,
    asset: Option<Arc<Asset>>,
    traversal_color: bool,
}

/// Credential-store change notification.
#[derive(Debug, Clone, Deserialize)]
pub struct CredentialEvent {
    pub operation: String,
    pub document_id: String,
    #[serde(default)]
    pub document_type: String,
}

/// Which credential-store operations trigger a rescan.
#[derive(Debug, Clone, Copy)]
pub struct RescanPolicy {
    pub on_start: bool,
    pub on_create: bool,
    pub on_update: bool,
    pub on_delete: bool,
}

pub struct Autoconfig {
    reader: Reader,
    devices: BTreeMap<String, Entry>,
    traversal_color: bool,
    credentials: CredentialSet,
}

impl Autoconfig {
    pub fn new(reader: Reader) -> Self {
        Self {
            reader,
            devices: BTreeMap::new(),
            traversal_color: false,
            credentials: CredentialSet::default(),
        }
    }

    pub fn credentials(&self) -> &CredentialSet {
        &self.credentials
    }

    pub async fn refresh_credentials(&mut self, bus: &BusClient) {
        match fetch_credentials(bus).await {
            Ok(set) => self.credentials = set,
            Err(err) => warn!(error = %err, "credential refresh failed, keeping previous snapshot"),
        }
    }

    /// Sync the state machine with the committed catalog: new and
    /// updated assets go (back) to New, vanished ones to Deleting, and
    /// stale config files with no catalog asset are scheduled for
    /// removal.
    pub fn on_update(&mut self, known_files: &[String]) {
        if !self.reader.refresh() {
            return;
        }
        self.traversal_color = !self.traversal_color;
        let color = self.traversal_color;
        let state = self.reader.state();

        for (name, asset) in state.all_power_devices() {
            // only the chain master is configured through the scanner
            if asset.daisy_chain() > 1 {
                debug!(asset = %name, "daisy-chain follower skipped in discovery");
                continue;
            }
            match self.devices.get_mut(name) {
                None => {
                    self.devices.insert(
                        name.clone(),
                        Entry {
                            state: ConfigState::New,
                            asset: Some(asset.clone()),
                            traversal_color: color,
                        },
                    );
                }
                Some(entry) => {
                    let updated = entry
                        .asset
                        .as_ref()
                        .map(|known| !Arc::ptr_eq(known, asset))
                        .unwrap_or(true);
                    if updated {
                        entry.state = ConfigState::New;
                        entry.asset = Some(asset.clone());
                    }
                    entry.traversal_color = color;
                }
            }
        }

        // devices that left the catalog
        for entry in self.devices.values_mut() {
            if entry.traversal_color != color {
                entry.state = ConfigState::Deleting;
                entry.asset = None;
            }
        }

        // stale config files (can happen after a restart)
        for name in known_files {
            if !self.devices.contains_key(name) {
                self.devices.insert(
                    name.clone(),
                    Entry {
                        state: ConfigState::Deleting,
                        asset: None,
                        traversal_color: color,
                    },
                );
            }
        }
    }

    /// Work through the state machine once.
    pub async fn on_poll(&mut self, manager: &ConfigurationManager) {
        let mut finished = Vec::new();
        for (name, entry) in &mut self.devices {
            match entry.state {
                ConfigState::New | ConfigState::Configuring => {
                    let Some(asset) = entry.asset.clone() else {
                        entry.state = ConfigState::Deleting;
                        continue;
                    };
                    match manager.process_asset(&asset, &self.credentials).await {
                        Ok(true) => {
                            info!(asset = %name, "asset configured");
                            entry.state = ConfigState::Configured;
                        }
                        Ok(false) => {
                            // try again later
                            entry.state = ConfigState::Configuring;
                        }
                        Err(err) => {
                            warn!(asset = %name, error = %err, "configuration attempt failed");
                            entry.state = ConfigState::Configuring;
                        }
                    }
                }
                ConfigState::Configured => {}
                ConfigState::Deleting => {
                    if let Err(err) = manager.remove_asset_configuration(name) {
                        warn!(asset = %name, error = %err, "configuration removal failed");
                    }
                    finished.push(name.clone());
                }
            }
        }
        for name in finished {
            self.devices.remove(&name);
        }
    }

    /// React to a credential-store change: refresh the snapshot and
    /// rescan the assets referencing the changed document.
    pub async fn on_credential_event(
        &mut self,
        bus: &BusClient,
        manager: &ConfigurationManager,
        event: &CredentialEvent,
        policy: RescanPolicy,
    ) {
        let should_rescan = match event.operation.as_str() {
            "create" => policy.on_create,
            "update" => policy.on_update,
            "delete" => policy.on_delete,
            other => {
                warn!(operation = other, "unknown credential event dropped");
                false
            }
        };
        if !should_rescan {
            return;
        }
        info!(
            operation = %event.operation,
            document = %event.document_id,
            "credential change triggers rescan"
        );
        self.refresh_credentials(bus).await;

        for name in manager.assets_using_credential(&event.document_id) {
            if let Some(entry) = self.devices.get_mut(&name) {
                entry.state = ConfigState::New;
            }
        }
        // endpoint-configured assets reference their document directly
        for entry in self.devices.values_mut() {
            let references = entry
                .asset
                .as_ref()
                .map(|asset| {
                    asset
                        .endpoint()
                        .values()
                        .any(|value| value == &event.document_id)
                })
                .unwrap_or(false);
            if references {
                entry.state = ConfigState::New;
            }
        }
    }

    /// Force a full reconfiguration pass.
    pub fn rescan_all(&mut self) {
        for entry in self.devices.values_mut() {
            if entry.state == ConfigState::Configured {
                entry.state = ConfigState::New;
            }
        }
    }

    /// Next wake-up, from the most urgent per-asset state. `None` means
    /// nothing to do until the catalog moves.
    pub fn timeout(&self) -> Option<Duration> {
        let mut have_quick = false;
        let mut have_discovery = false;
        let mut have_failed = false;

        for entry in self.devices.values() {
            match entry.state {
                ConfigState::New => {
                    let verbatim = entry
                        .asset
                        .as_ref()
                        .map(|asset| asset.upsconf_block().is_some())
                        .unwrap_or(false);
                    if verbatim {
                        have_quick = true;
                    } else {
                        have_discovery = true;
                    }
                }
                ConfigState::Configuring => have_failed = true,
                ConfigState::Configured => {}
                ConfigState::Deleting => have_quick = true,
            }
        }

        if have_quick {
            Some(Duration::from_millis(100))
        } else if have_discovery {
            Some(Duration::from_secs(5))
        } else if have_failed {
            Some(Duration::from_secs(60))
        } else {
            None
        }
    }

    #[cfg(test)]
    fn state_of(&self, name: &str) -> Option<ConfigState> {
        self.devices.get(name).map(|entry| entry.state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nutbus_proto::{AssetMessage, AssetOperation};
    use nutbus_state::StateManager;

    fn ups(name: &str, verbatim: bool) -> AssetMessage {
        let mut msg = AssetMessage::new(name, AssetOperation::Create)
            .with_aux("type", "device")
            .with_aux("subtype", "ups")
            .with_ext("ip.1", "10.0.0.1");
        if verbatim {
            msg = msg.with_ext("upsconf_block", ";driver = dummy-ups;port = auto");
        }
        msg
    }

    #[test]
    fn new_assets_schedule_discovery() {
        let manager = StateManager::new();
        let mut writer = manager.writer();
        let mut autoconfig = Autoconfig::new(manager.reader());

        writer.state().update_from_asset(&ups("ups-1", false));
        writer.commit();
        autoconfig.on_update(&[]);

        assert_eq!(autoconfig.state_of("ups-1"), Some(ConfigState::New));
        assert_eq!(autoconfig.timeout(), Some(Duration::from_secs(5)));
    }

    #[test]
    fn verbatim_assets_configure_fast() {
        let manager = StateManager::new();
        let mut writer = manager.writer();
        let mut autoconfig = Autoconfig::new(manager.reader());

        writer.state().update_from_asset(&ups("ups-1", true));
        writer.commit();
        autoconfig.on_update(&[]);

        assert_eq!(autoconfig.timeout(), Some(Duration::from_millis(100)));
    }

    #[test]
    fn removed_assets_move_to_deleting() {
        let manager = StateManager::new();
        let mut writer = manager.writer();
        let mut autoconfig = Autoconfig::new(manager.reader());

        writer.state().update_from_asset(&ups("ups-1", false));
        writer.commit();
        autoconfig.on_update(&[]);

        writer
            .state()
            .update_from_asset(&AssetMessage::new("ups-1", AssetOperation::Delete));
        writer.commit();
        autoconfig.on_update(&[]);

        assert_eq!(autoconfig.state_of("ups-1"), Some(ConfigState::Deleting));
        assert_eq!(autoconfig.timeout(), Some(Duration::from_millis(100)));
    }

    #[test]
    fn stale_files_are_scheduled_for_deletion() {
        let manager = StateManager::new();
        let mut autoconfig = Autoconfig::new(manager.reader());
        manager.writer().commit();

        autoconfig.on_update(&["ghost-1".to_string()]);
        assert_eq!(autoconfig.state_of("ghost-1"), Some(ConfigState::Deleting));
    }

    #[test]
    fn daisy_followers_are_not_configured() {
        let manager = StateManager::new();
        let mut writer = manager.writer();
        let mut autoconfig = Autoconfig::new(manager.reader());

        writer.state().update_from_asset(
            &AssetMessage::new("epdu-2", AssetOperation::Create)
                .with_aux("type", "device")
                .with_aux("subtype", "epdu")
                .with_ext("ip.1", "10.0.0.2")
                .with_ext("daisy_chain", "2"),
        );
        writer.commit();
        autoconfig.on_update(&[]);

        assert_eq!(autoconfig.state_of("epdu-2"), None);
        assert_eq!(autoconfig.timeout(), None);
    }

    #[test]
    fn idle_when_everything_is_configured() {
        let manager = StateManager::new();
        let autoconfig = Autoconfig::new(manager.reader());
        assert_eq!(autoconfig.timeout(), None);
    }
}
