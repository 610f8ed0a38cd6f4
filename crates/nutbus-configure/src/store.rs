//! Candidate database
//!
//! Per-asset candidate records in an embedded sled tree. The stored order
//! is the priority order; record ids are stable across reorderings.

use crate::candidate::DeviceConfiguration;
use crate::error::ConfigureError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::Path;

/// One persisted candidate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidateRecord {
    pub id: u64,
    /// Configuration type the candidate was instantiated from.
    pub type_id: u64,
    pub working: bool,
    pub in_use: bool,
    /// Linked credential-store document ids.
    pub secw_document_ids: BTreeSet<String>,
    /// Attributes beyond the template defaults and credential keys.
    pub attributes: DeviceConfiguration,
}

/// Candidate records per asset, in priority order.
pub struct CandidateStore {
    db: sled::Db,
}

impl CandidateStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, ConfigureError> {
        Ok(Self {
            db: sled::open(path)?,
        })
    }

    /// All records of an asset, most preferred first.
    pub fn list(&self, asset: &str) -> Result<Vec<CandidateRecord>, ConfigureError> {
        match self.db.get(asset.as_bytes())? {
            Some(bytes) => serde_json::from_slice(&bytes)
                .map_err(|e| ConfigureError::Malformed(e.to_string())),
            None => Ok(Vec::new()),
        }
    }

    /// Working candidates of an asset, most preferred first.
    pub fn candidates(&self, asset: &str) -> Result<Vec<CandidateRecord>, ConfigureError> {
        Ok(self
            .list(asset)?
            .into_iter()
            .filter(|record| record.working)
            .collect())
    }

    /// Append a new record; returns its id.
    pub fn insert(
        &self,
        asset: &str,
        type_id: u64,
        working: bool,
        in_use: bool,
        secw_document_ids: BTreeSet<String>,
        attributes: DeviceConfiguration,
    ) -> Result<u64, ConfigureError> {
        let id = self.db.generate_id()?;
        let mut records = self.list(asset)?;
        records.push(CandidateRecord {
            id,
            type_id,
            working,
            in_use,
            secw_document_ids,
            attributes,
        });
        self.put(asset, &records)?;
        Ok(id)
    }

    /// Flip the working flag of one record.
    pub fn set_working(&self, asset: &str, id: u64, working: bool) -> Result<(), ConfigureError> {
        let mut records = self.list(asset)?;
        for record in &mut records {
            if record.id == id {
                record.working = working;
            }
        }
        self.put(asset, &records)
    }

    /// Reorder records to the given id order; unknown ids are ignored,
    /// unlisted records keep their relative order at the end.
    pub fn set_priorities(&self, asset: &str, order: &[u64]) -> Result<(), ConfigureError> {
        let records = self.list(asset)?;
        let mut reordered = Vec::with_capacity(records.len());
        for id in order {
            if let Some(record) = records.iter().find(|r| r.id == *id) {
                reordered.push(record.clone());
            }
        }
        for record in &records {
            if !order.contains(&record.id) {
                reordered.push(record.clone());
            }
        }
        self.put(asset, &reordered)
    }

    /// Drop every record of an asset.
    pub fn remove_asset(&self, asset: &str) -> Result<(), ConfigureError> {
        self.db.remove(asset.as_bytes())?;
        self.db.flush()?;
        Ok(())
    }

    /// Asset names holding at least one record.
    pub fn assets(&self) -> Result<Vec<String>, ConfigureError> {
        let mut names = Vec::new();
        for entry in self.db.iter() {
            let (key, _) = entry?;
            if let Ok(name) = std::str::from_utf8(&key) {
                names.push(name.to_string());
            }
        }
        Ok(names)
    }

    fn put(&self, asset: &str, records: &[CandidateRecord]) -> Result<(), ConfigureError> {
        let bytes =
            serde_json::to_vec(records).map_err(|e| ConfigureError::Malformed(e.to_string()))?;
        self.db.insert(asset.as_bytes(), bytes)?;
        self.db.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, CandidateStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = CandidateStore::open(dir.path().join("candidates")).unwrap();
        (dir, store)
    }

    fn attributes(mib: &str) -> DeviceConfiguration {
        [("mibs".to_string(), mib.to_string())].into_iter().collect()
    }

    #[test]
    fn insert_list_roundtrip() {
        let (_dir, store) = store();
        let id = store
            .insert("epdu-1", 1, true, true, BTreeSet::new(), attributes("eaton_epdu"))
            .unwrap();
        let records = store.list("epdu-1").unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].id, id);
        assert!(records[0].working);
    }

    #[test]
    fn working_flag_and_candidate_filter() {
        let (_dir, store) = store();
        let id1 = store
            .insert("ups-1", 1, true, false, BTreeSet::new(), attributes("pw"))
            .unwrap();
        let id2 = store
            .insert("ups-1", 2, true, false, BTreeSet::new(), attributes("mge"))
            .unwrap();

        store.set_working("ups-1", id1, false).unwrap();
        let candidates = store.candidates("ups-1").unwrap();
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].id, id2);
    }

    #[test]
    fn priorities_reorder_records() {
        let (_dir, store) = store();
        let id1 = store
            .insert("ups-1", 1, true, false, BTreeSet::new(), attributes("a"))
            .unwrap();
        let id2 = store
            .insert("ups-1", 1, true, false, BTreeSet::new(), attributes("b"))
            .unwrap();

        store.set_priorities("ups-1", &[id2, id1]).unwrap();
        let records = store.list("ups-1").unwrap();
        assert_eq!(records[0].id, id2);
        assert_eq!(records[1].id, id1);
    }

    #[test]
    fn remove_asset_clears_records() {
        let (_dir, store) = store();
        store
            .insert("ups-1", 1, true, false, BTreeSet::new(), attributes("a"))
            .unwrap();
        store.remove_asset("ups-1").unwrap();
        assert!(store.list("ups-1").unwrap().is_empty());
        assert!(store.assets().unwrap().is_empty());
    }
}
