//! Durable key/value config store (C4), YAML-backed with dirty-bit tracking.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::ConfigError;

const CONF_YAML: &str = "juicepass_bridge.yaml";

#[derive(Debug, Default, Serialize, Deserialize)]
struct ConfigMap(BTreeMap<String, String>);

/// File-backed key/value store. Loaded once at startup, rewritten only when
/// `flush_if_dirty` observes that a value actually changed.
#[derive(Debug)]
pub struct ConfigStore {
    path: PathBuf,
    values: BTreeMap<String, String>,
    dirty: bool,
}

impl ConfigStore {
    /// Creates the config directory (if absent) and points at `<config_loc>/juicepass_bridge.yaml`.
    pub fn new(config_loc: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let dir = config_loc.as_ref();
        std::fs::create_dir_all(dir).map_err(|source| ConfigError::Write {
            path: dir.to_path_buf(),
            source,
        })?;
        let path = dir.join(CONF_YAML);
        info!(path = %path.display(), "config_loc");
        let mut store = Self {
            path,
            values: BTreeMap::new(),
            dirty: false,
        };
        store.load()?;
        Ok(store)
    }

    fn load(&mut self) -> Result<(), ConfigError> {
        match std::fs::read_to_string(&self.path) {
            Ok(contents) if !contents.trim().is_empty() => {
                let ConfigMap(map) = serde_yaml::from_str(&contents)?;
                self.values = map;
            }
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(source) => {
                return Err(ConfigError::Read {
                    path: self.path.clone(),
                    source,
                });
            }
        }
        Ok(())
    }

    /// Atomically rewrites the backing file: write to a sibling temp file, then rename.
    fn write(&mut self) -> Result<(), ConfigError> {
        let tmp_path = self.path.with_extension("yaml.tmp");
        let yaml = serde_yaml::to_string(&ConfigMap(self.values.clone()))?;
        std::fs::write(&tmp_path, yaml).map_err(|source| ConfigError::Write {
            path: tmp_path.clone(),
            source,
        })?;
        std::fs::rename(&tmp_path, &self.path).map_err(|source| ConfigError::Write {
            path: self.path.clone(),
            source,
        })?;
        self.dirty = false;
        Ok(())
    }

    pub fn flush_if_dirty(&mut self) -> Result<(), ConfigError> {
        if self.dirty {
            self.write()?;
        }
        Ok(())
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    /// Falls back to the global key when no per-device key is present.
    pub fn get_device(&self, device: &str, key: &str) -> Option<&str> {
        self.values
            .get(&format!("{device}_{key}"))
            .or_else(|| self.values.get(key))
            .map(String::as_str)
    }

    pub fn set(&mut self, key: &str, value: impl Into<String>) {
        let value = value.into();
        if self.values.get(key) != Some(&value) {
            self.values.insert(key.to_string(), value);
            self.dirty = true;
        }
    }

    pub fn set_device(&mut self, device: &str, key: &str, value: impl Into<String>) {
        self.set(&format!("{device}_{key}"), value);
    }

    pub fn remove(&mut self, key: &str) {
        if self.values.remove(key).is_some() {
            self.dirty = true;
        }
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_is_idempotent_on_unchanged_value() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = ConfigStore::new(dir.path()).unwrap();
        store.set("k", "v");
        assert!(store.is_dirty());
        store.flush_if_dirty().unwrap();
        assert!(!store.is_dirty());
        store.set("k", "v");
        assert!(!store.is_dirty(), "re-setting the same value must not mark dirty");
    }

    #[test]
    fn get_device_falls_back_to_global() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = ConfigStore::new(dir.path()).unwrap();
        store.set("current_rating", "40");
        assert_eq!(store.get_device("SERIAL123", "current_rating"), Some("40"));
        store.set_device("SERIAL123", "current_rating", "32");
        assert_eq!(store.get_device("SERIAL123", "current_rating"), Some("32"));
    }

    #[test]
    fn values_persist_across_reload() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut store = ConfigStore::new(dir.path()).unwrap();
            store.set("ENELX_IP", "54.161.147.91:8047");
            store.flush_if_dirty().unwrap();
        }
        let reloaded = ConfigStore::new(dir.path()).unwrap();
        assert_eq!(reloaded.get("ENELX_IP"), Some("54.161.147.91:8047"));
    }
}
