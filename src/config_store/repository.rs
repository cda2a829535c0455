//! ConfigStore Repository
//!
//! File access layer for ConfigStore. The whole config is one JSON object;
//! saves are read-modify-write of the named top-level keys.

use super::types::{default_config, keys, CONFIG_VERSION};
use crate::error::{Error, Result};
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::sync::Mutex;

/// Durable key/value storage for the config map
#[async_trait]
pub trait ConfigPersistence: Send + Sync {
    /// Load the full config map
    async fn load(&self) -> Result<Map<String, Value>>;

    /// Merge the given top-level keys into storage
    async fn save(&self, partial: Map<String, Value>) -> Result<()>;
}

/// JSON file repository
pub struct ConfigRepository {
    path: PathBuf,
    /// Serializes read-modify-write cycles
    write_lock: Mutex<()>,
}

impl ConfigRepository {
    /// Create new repository backed by `<data_dir>/config.json`
    pub fn new(data_dir: &Path) -> Self {
        Self {
            path: data_dir.join("config.json"),
            write_lock: Mutex::new(()),
        }
    }

    /// Path of the backing file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Ensure the file exists and carries the current version.
    ///
    /// A missing, corrupt or version-mismatched file is replaced with defaults.
    pub async fn init(&self) -> Result<()> {
        let _guard = self.write_lock.lock().await;

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let needs_reset = match self.read_file().await {
            Ok(Some(existing)) => {
                let version = existing.get(keys::VERSION).and_then(|v| v.as_str());
                if version != Some(CONFIG_VERSION) {
                    tracing::info!(
                        found = ?version,
                        expected = CONFIG_VERSION,
                        "Config version mismatch, recreating config"
                    );
                    true
                } else {
                    false
                }
            }
            Ok(None) => true,
            Err(e) => {
                tracing::warn!(error = %e, "Config file unreadable, recreating");
                true
            }
        };

        if needs_reset {
            self.write_file(&default_config()).await?;
            tracing::info!(
                path = %self.path.display(),
                version = CONFIG_VERSION,
                "Created new config file"
            );
        }

        Ok(())
    }

    async fn read_file(&self) -> Result<Option<Map<String, Value>>> {
        let raw = match fs::read(&self.path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        if raw.is_empty() {
            return Ok(None);
        }
        match serde_json::from_slice::<Value>(&raw)? {
            Value::Object(map) => Ok(Some(map)),
            _ => Err(Error::Persistence(format!(
                "{} does not contain a JSON object",
                self.path.display()
            ))),
        }
    }

    /// Write through a temp file so readers never see a half-written config
    async fn write_file(&self, map: &Map<String, Value>) -> Result<()> {
        let tmp = self.path.with_extension("json.tmp");
        let body = serde_json::to_vec_pretty(map)?;
        fs::write(&tmp, body).await?;
        fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

#[async_trait]
impl ConfigPersistence for ConfigRepository {
    async fn load(&self) -> Result<Map<String, Value>> {
        Ok(self.read_file().await?.unwrap_or_default())
    }

    async fn save(&self, partial: Map<String, Value>) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let mut config = self.read_file().await.unwrap_or_else(|e| {
            tracing::error!(error = %e, "Error loading config file before save");
            None
        });
        let config = config.get_or_insert_with(Map::new);
        for (key, value) in partial {
            config.insert(key, value);
        }
        self.write_file(config).await
    }
}
