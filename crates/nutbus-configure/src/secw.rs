//! Credential documents
//!
//! SNMPv1 and SNMPv3 documents from the external credential store, their
//! flattening into NUT driver keys, and the bus-mailbox client used to
//! refresh the local snapshot. The store itself stays external.

use crate::candidate::DeviceConfiguration;
use crate::error::ConfigureError;
use nutbus_proto::bus::REQUEST_TIMEOUT;
use nutbus_proto::{subject, BusClient};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use tracing::{debug, warn};
use uuid::Uuid;

/// Credential usage tag the store filters on.
pub const MONITORING_USAGE: &str = "discovery_monitoring";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snmpv1Credential {
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub community: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snmpv3Credential {
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub security_name: String,
    /// `noAuthNoPriv`, `authNoPriv` or `authPriv`.
    pub security_level: String,
    #[serde(default)]
    pub auth_protocol: Option<String>,
    #[serde(default)]
    pub auth_password: Option<String>,
    #[serde(default)]
    pub priv_protocol: Option<String>,
    #[serde(default)]
    pub priv_password: Option<String>,
}

/// The credential snapshot used by one configuration cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialSet {
    #[serde(default)]
    pub snmpv1: Vec<Snmpv1Credential>,
    #[serde(default)]
    pub snmpv3: Vec<Snmpv3Credential>,
}

impl CredentialSet {
    pub fn is_empty(&self) -> bool {
        self.snmpv1.is_empty() && self.snmpv3.is_empty()
    }

    pub fn find_v1(&self, id: &str) -> Option<&Snmpv1Credential> {
        self.snmpv1.iter().find(|c| c.id == id)
    }

    pub fn find_v3(&self, id: &str) -> Option<&Snmpv3Credential> {
        self.snmpv3.iter().find(|c| c.id == id)
    }

    /// Flatten the document with the given id into driver keys.
    pub fn driver_keys(&self, id: &str) -> Option<DeviceConfiguration> {
        if let Some(v1) = self.find_v1(id) {
            return Some(v1_driver_keys(v1));
        }
        self.find_v3(id).map(v3_driver_keys)
    }
}

pub fn v1_driver_keys(credential: &Snmpv1Credential) -> DeviceConfiguration {
    [("community".to_string(), credential.community.clone())]
        .into_iter()
        .collect()
}

pub fn v3_driver_keys(credential: &Snmpv3Credential) -> DeviceConfiguration {
    let mut keys = DeviceConfiguration::new();
    keys.insert("snmp_version".into(), "v3".into());
    keys.insert("secLevel".into(), credential.security_level.clone());
    keys.insert("secName".into(), credential.security_name.clone());
    if let Some(protocol) = &credential.auth_protocol {
        keys.insert("authProtocol".into(), protocol.clone());
    }
    if let Some(password) = &credential.auth_password {
        keys.insert("authPassword".into(), password.clone());
    }
    if let Some(protocol) = &credential.priv_protocol {
        keys.insert("privProtocol".into(), protocol.clone());
    }
    if let Some(password) = &credential.priv_password {
        keys.insert("privPassword".into(), password.clone());
    }
    keys
}

/// Credential document types a candidate implies: `community` -> Snmpv1,
/// `secName` -> Snmpv3.
pub fn security_document_types(config: &DeviceConfiguration) -> BTreeSet<String> {
    let mut types = BTreeSet::new();
    if config.contains_key("community") {
        types.insert("Snmpv1".to_string());
    }
    if config.contains_key("secName") {
        types.insert("Snmpv3".to_string());
    }
    types
}

/// Document ids whose flattened keys all appear in the candidate.
pub fn match_document_ids(config: &DeviceConfiguration, credentials: &CredentialSet) -> BTreeSet<String> {
    let matches = |keys: &DeviceConfiguration| {
        keys.iter()
            .all(|(k, v)| config.get(k).map(|other| other == v).unwrap_or(false))
    };

    let mut ids = BTreeSet::new();
    for v1 in &credentials.snmpv1 {
        if matches(&v1_driver_keys(v1)) {
            ids.insert(v1.id.clone());
        }
    }
    for v3 in &credentials.snmpv3 {
        if matches(&v3_driver_keys(v3)) {
            ids.insert(v3.id.clone());
        }
    }
    ids
}

/// Fetch the monitoring credential set from the store mailbox.
///
/// A failed fetch is transient: the previous snapshot stays in use.
pub async fn fetch_credentials(bus: &BusClient) -> Result<CredentialSet, ConfigureError> {
    let uuid = Uuid::new_v4().to_string();
    let frames = vec!["GET".to_string(), uuid.clone(), MONITORING_USAGE.to_string()];
    let reply = bus
        .request_frames(subject::CREDENTIAL_MAILBOX, &frames, REQUEST_TIMEOUT)
        .await?;

    if reply.first() != Some(&uuid) {
        warn!("credential store reply carries a mismatched correlation id");
        return Err(ConfigureError::Malformed(
            "mismatched credential reply uuid".into(),
        ));
    }
    let body = reply
        .get(1)
        .ok_or_else(|| ConfigureError::Malformed("credential reply misses body".into()))?;
    let set: CredentialSet =
        serde_json::from_str(body).map_err(|e| ConfigureError::Malformed(e.to_string()))?;
    debug!(
        v1 = set.snmpv1.len(),
        v3 = set.snmpv3.len(),
        "fetched credentials from store"
    );
    Ok(set)
}
