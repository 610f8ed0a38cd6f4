//! Driver configuration files
//!
//! One file per asset under the repository directory. Replacement is
//! content-equality-gated: equal inputs never rewrite the file, so driver
//! restarts only happen on real changes.

use crate::error::ConfigureError;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

pub struct ConfigRepository {
    dir: PathBuf,
}

impl ConfigRepository {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, asset: &str) -> PathBuf {
        self.dir.join(asset)
    }

    /// Write the configuration file iff its text changed. Returns true
    /// when the file was (re)written.
    pub fn apply(&self, asset: &str, text: &str) -> Result<bool, ConfigureError> {
        fs::create_dir_all(&self.dir)?;
        let path = self.path_for(asset);

        let existing = fs::read_to_string(&path).unwrap_or_default();
        if existing == text {
            debug!(asset, "configuration file unchanged, nothing to do");
            return Ok(false);
        }

        info!(asset, path = %path.display(), "configuration file outdated, replacing");
        let tmp = self.dir.join(format!(".{asset}.tmp"));
        fs::write(&tmp, text)?;
        fs::rename(&tmp, &path)?;
        Ok(true)
    }

    /// Remove the configuration file. Returns true when it existed.
    pub fn forget(&self, asset: &str) -> Result<bool, ConfigureError> {
        let path = self.path_for(asset);
        match fs::remove_file(&path) {
            Ok(()) => {
                info!(asset, path = %path.display(), "removed configuration file");
                Ok(true)
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    /// Asset names with a configuration file on disk.
    pub fn known_assets(&self) -> Result<Vec<String>, ConfigureError> {
        let mut names = Vec::new();
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(names),
            Err(err) => return Err(err.into()),
        };
        for entry in entries {
            let entry = entry?;
            if entry.file_type()?.is_file() {
                if let Some(name) = entry.file_name().to_str() {
                    if !name.starts_with('.') {
                        names.push(name.to_string());
                    }
                }
            }
        }
        names.sort();
        Ok(names)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn apply_is_content_gated() {
        let dir = tempfile::tempdir().unwrap();
        let repo = ConfigRepository::new(dir.path());

        assert!(repo.apply("ups-1", "[ups-1]\ndriver = \"dummy-ups\"\n").unwrap());
        // equal input writes nothing
        assert!(!repo.apply("ups-1", "[ups-1]\ndriver = \"dummy-ups\"\n").unwrap());
        // a change writes again
        assert!(repo.apply("ups-1", "[ups-1]\ndriver = \"snmp-ups\"\n").unwrap());

        let text = std::fs::read_to_string(dir.path().join("ups-1")).unwrap();
        assert_eq!(text, "[ups-1]\ndriver = \"snmp-ups\"\n");
    }

    #[test]
    fn forget_and_known_assets() {
        let dir = tempfile::tempdir().unwrap();
        let repo = ConfigRepository::new(dir.path());

        repo.apply("ups-1", "a").unwrap();
        repo.apply("epdu-2", "b").unwrap();
        assert_eq!(repo.known_assets().unwrap(), vec!["epdu-2", "ups-1"]);

        assert!(repo.forget("ups-1").unwrap());
        assert!(!repo.forget("ups-1").unwrap());
        assert_eq!(repo.known_assets().unwrap(), vec!["epdu-2"]);
    }

    #[test]
    fn missing_directory_lists_empty() {
        let repo = ConfigRepository::new("/nonexistent/nutbus-test");
        assert!(repo.known_assets().unwrap().is_empty());
    }
}
