//! ConfigStore - persisted runtime configuration
//!
//! ## Responsibilities
//!
//! - Versioned JSON config file (`<data_dir>/config.json`)
//! - Feed/dispatch tunables, exposure mode, push subscriptions
//! - Camera state snapshots written by the camera state store
//!
//! Reads go through an in-memory cache; writes persist first and then
//! merge into the cache.

mod repository;
mod service;
mod types;

pub use repository::{ConfigPersistence, ConfigRepository};
pub use service::{
    feed_settings_from, push_subscriptions_from, startup_mode_from, tunnel_provider_from,
    ConfigService,
};
pub use types::*;

use serde_json::{Map, Value};
use std::sync::Arc;
use tokio::sync::RwLock;

/// ConfigStore instance
pub struct ConfigStore {
    service: ConfigService,
    /// In-memory cache for frequent reads
    cache: Arc<RwLock<ConfigCache>>,
}

impl ConfigStore {
    /// Create new ConfigStore and load the cache
    pub async fn new(repo: Arc<dyn ConfigPersistence>) -> crate::Result<Self> {
        let service = ConfigService::new(repo);
        let cache = Arc::new(RwLock::new(ConfigCache::default()));

        let store = Self { service, cache };

        // Initial cache load
        store.refresh_cache().await?;

        Ok(store)
    }

    /// Get service reference
    pub fn service(&self) -> &ConfigService {
        &self.service
    }

    /// Refresh in-memory cache
    pub async fn refresh_cache(&self) -> crate::Result<()> {
        let settings = self.service.get_all_settings().await?;

        let mut cache = self.cache.write().await;
        cache.settings = settings;

        tracing::info!("ConfigStore cache refreshed: {} keys", cache.settings.len());

        Ok(())
    }

    /// Persist a partial map and merge it into the cache
    pub async fn save(&self, partial: Map<String, Value>) -> crate::Result<()> {
        self.service.save_settings(partial.clone()).await?;

        let mut cache = self.cache.write().await;
        for (key, value) in partial {
            cache.settings.insert(key, value);
        }
        Ok(())
    }

    /// Persist a single key
    pub async fn set(&self, key: &str, value: Value) -> crate::Result<()> {
        let mut partial = Map::new();
        partial.insert(key.to_string(), value);
        self.save(partial).await
    }

    /// Get cached setting (fast read)
    pub async fn get_cached_setting(&self, key: &str) -> Option<Value> {
        self.cache.read().await.settings.get(key).cloned()
    }

    /// Clone of the full cached map
    pub async fn get_cached_settings(&self) -> Map<String, Value> {
        self.cache.read().await.settings.clone()
    }

    /// Feed settings with config overrides applied
    pub async fn feed_settings(&self) -> FeedSettings {
        feed_settings_from(&self.cache.read().await.settings)
    }

    /// Persisted camera state snapshots keyed by camera id
    pub async fn camera_states(&self) -> Map<String, Value> {
        self.cache
            .read()
            .await
            .settings
            .get(keys::CAMERA_STATES)
            .and_then(|v| v.as_object())
            .cloned()
            .unwrap_or_default()
    }
}

/// In-memory cache for ConfigStore
#[derive(Default)]
struct ConfigCache {
    settings: Map<String, Value>,
}
