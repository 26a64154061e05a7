//! Node configuration and where it is persisted.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use busmux_frame::MAX_ID;

use crate::error::{ProtocolError, Result};

/// Identity of a node on the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Bus id, 0..=127.
    pub id: u8,
}

impl NodeConfig {
    pub const DEFAULT_ID: u8 = 1;

    pub fn new(id: u8) -> Result<Self> {
        let config = Self { id };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.id > MAX_ID {
            return Err(ProtocolError::InvalidId(self.id));
        }
        Ok(())
    }
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            id: Self::DEFAULT_ID,
        }
    }
}

/// Backing storage for a [`NodeConfig`].
///
/// `load` returns `None` when nothing has been saved yet.
pub trait ConfigStore: Send {
    fn load(&mut self) -> Result<Option<NodeConfig>>;
    fn store(&mut self, config: &NodeConfig) -> Result<()>;
}

/// Keeps the config in memory only.
#[derive(Debug, Clone, Default)]
pub struct MemoryConfigStore {
    saved: Option<NodeConfig>,
}

impl MemoryConfigStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: NodeConfig) -> Self {
        Self {
            saved: Some(config),
        }
    }

    pub fn saved(&self) -> Option<&NodeConfig> {
        self.saved.as_ref()
    }
}

impl ConfigStore for MemoryConfigStore {
    fn load(&mut self) -> Result<Option<NodeConfig>> {
        Ok(self.saved)
    }

    fn store(&mut self, config: &NodeConfig) -> Result<()> {
        self.saved = Some(*config);
        Ok(())
    }
}

/// Persists the config as a small JSON document.
///
/// Writes go to a sibling temp file that is renamed over the target.
#[derive(Debug, Clone)]
pub struct JsonFileConfigStore {
    path: PathBuf,
}

impl JsonFileConfigStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn io_error(&self, source: std::io::Error) -> ProtocolError {
        ProtocolError::ConfigIo {
            path: self.path.clone(),
            source,
        }
    }
}

impl ConfigStore for JsonFileConfigStore {
    fn load(&mut self) -> Result<Option<NodeConfig>> {
        let text = match fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(self.io_error(err)),
        };
        let config: NodeConfig = serde_json::from_str(&text)?;
        config.validate()?;
        debug!(path = %self.path.display(), id = config.id, "loaded node config");
        Ok(Some(config))
    }

    fn store(&mut self, config: &NodeConfig) -> Result<()> {
        config.validate()?;
        let mut json = serde_json::to_vec_pretty(config)?;
        json.push(b'\n');

        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);

        let write = || -> std::io::Result<()> {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(&json)?;
            file.sync_all()?;
            fs::rename(&tmp, &self.path)
        };
        write().map_err(|err| {
            let _ = fs::remove_file(&tmp);
            self.io_error(err)
        })?;
        debug!(path = %self.path.display(), id = config.id, "saved node config");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unique_path(name: &str) -> PathBuf {
        use std::sync::atomic::{AtomicU64, Ordering};
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        let n = COUNTER.fetch_add(1, Ordering::Relaxed);
        PathBuf::from(format!(
            "/tmp/busmux-config-{}-{n}-{name}.json",
            std::process::id()
        ))
    }

    #[test]
    fn defaults_to_id_one() {
        assert_eq!(NodeConfig::default().id, 1);
        let parsed: NodeConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(parsed.id, 1);
    }

    #[test]
    fn rejects_ids_above_127() {
        assert!(matches!(
            NodeConfig::new(128),
            Err(ProtocolError::InvalidId(128))
        ));
        assert!(NodeConfig::new(127).is_ok());
    }

    #[test]
    fn memory_store_round_trip() {
        let mut store = MemoryConfigStore::new();
        assert!(store.load().unwrap().is_none());
        store.store(&NodeConfig { id: 9 }).unwrap();
        assert_eq!(store.load().unwrap(), Some(NodeConfig { id: 9 }));
    }

    #[test]
    fn json_store_persists_and_reloads() {
        let path = unique_path("persist");
        let mut store = JsonFileConfigStore::new(&path);
        assert!(store.load().unwrap().is_none());

        store.store(&NodeConfig { id: 42 }).unwrap();
        let mut reopened = JsonFileConfigStore::new(&path);
        assert_eq!(reopened.load().unwrap(), Some(NodeConfig { id: 42 }));

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn json_store_rejects_out_of_range_file() {
        let path = unique_path("range");
        fs::write(&path, r#"{"id": 200}"#).unwrap();
        let mut store = JsonFileConfigStore::new(&path);
        assert!(matches!(store.load(), Err(ProtocolError::InvalidId(200))));
        let _ = fs::remove_file(&path);
    }
}
