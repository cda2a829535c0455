//! ConfigStore Service
//!
//! Business logic layer for ConfigStore

use super::repository::ConfigPersistence;
use super::types::*;
use crate::error::{Error, Result};
use serde_json::{Map, Value};
use std::sync::Arc;

/// ConfigStore service for business logic
pub struct ConfigService {
    repo: Arc<dyn ConfigPersistence>,
}

impl ConfigService {
    /// Create new service
    pub fn new(repo: Arc<dyn ConfigPersistence>) -> Self {
        Self { repo }
    }

    /// Load the whole config map
    pub async fn get_all_settings(&self) -> Result<Map<String, Value>> {
        self.repo.load().await
    }

    /// Persist a partial map of top-level keys
    pub async fn save_settings(&self, partial: Map<String, Value>) -> Result<()> {
        self.repo.save(partial).await
    }

    /// Persist a single key
    pub async fn set_setting(&self, key: &str, value: Value) -> Result<()> {
        let mut partial = Map::new();
        partial.insert(key.to_string(), value);
        self.repo.save(partial).await
    }

    // ========================================
    // Push Subscriptions
    // ========================================

    /// List registered subscriptions
    pub async fn list_push_subscriptions(&self) -> Result<Vec<PushSubscription>> {
        let settings = self.repo.load().await?;
        Ok(push_subscriptions_from(&settings))
    }

    /// Register an endpoint. Re-registering an endpoint returns its existing entry.
    pub async fn add_push_subscription(&self, endpoint: &str) -> Result<PushSubscription> {
        if endpoint.is_empty() {
            return Err(Error::Validation("endpoint must not be empty".to_string()));
        }

        let mut subs = self.list_push_subscriptions().await?;
        if let Some(existing) = subs.iter().find(|s| s.endpoint == endpoint) {
            return Ok(existing.clone());
        }

        let sub = PushSubscription {
            id: uuid::Uuid::new_v4().to_string(),
            endpoint: endpoint.to_string(),
        };
        subs.push(sub.clone());
        self.set_setting(keys::PUSH_SUBSCRIPTIONS, serde_json::to_value(&subs)?)
            .await?;

        tracing::info!(subscription_id = %sub.id, "Push subscription added");
        Ok(sub)
    }

    /// Remove a subscription by id. Returns whether it existed.
    pub async fn remove_push_subscription(&self, id: &str) -> Result<bool> {
        let mut subs = self.list_push_subscriptions().await?;
        let before = subs.len();
        subs.retain(|s| s.id != id);
        if subs.len() == before {
            return Ok(false);
        }
        self.set_setting(keys::PUSH_SUBSCRIPTIONS, serde_json::to_value(&subs)?)
            .await?;
        Ok(true)
    }
}

// ========================================
// Typed views over a settings map
// ========================================

/// Startup mode, `Local` when unset or unrecognized
pub fn startup_mode_from(settings: &Map<String, Value>) -> StartupMode {
    settings
        .get(keys::STARTUP_MODE)
        .and_then(|v| serde_json::from_value(v.clone()).ok())
        .unwrap_or_default()
}

/// Configured tunnel provider, if any
pub fn tunnel_provider_from(settings: &Map<String, Value>) -> Option<TunnelProvider> {
    settings
        .get(keys::TUNNEL_PROVIDER)
        .and_then(|v| serde_json::from_value(v.clone()).ok())
}

/// Registered subscriptions; malformed entries are skipped
pub fn push_subscriptions_from(settings: &Map<String, Value>) -> Vec<PushSubscription> {
    settings
        .get(keys::PUSH_SUBSCRIPTIONS)
        .and_then(|v| v.as_array())
        .map(|items| {
            items
                .iter()
                .filter_map(|item| serde_json::from_value(item.clone()).ok())
                .collect()
        })
        .unwrap_or_default()
}

/// Built-in feed settings with any explicit config keys applied
pub fn feed_settings_from(settings: &Map<String, Value>) -> FeedSettings {
    let mut feed = FeedSettings::default();
    let get_u64 = |key: &str| settings.get(key).and_then(|v| v.as_u64());

    if let Some(v) = get_u64(keys::STREAM_MAX_FPS) {
        feed.stream_max_fps = v as u32;
    }
    if let Some(v) = get_u64(keys::STREAM_TUNNEL_FPS) {
        feed.stream_tunnel_fps = v as u32;
    }
    if let Some(v) = get_u64(keys::STREAM_JPEG_QUALITY) {
        feed.stream_jpeg_quality = v.min(100) as u8;
    }
    if let Some(v) = get_u64(keys::STREAM_MAX_WIDTH) {
        feed.stream_max_width = v as u32;
    }
    if let Some(v) = settings
        .get(keys::DETECTION_INTERVAL_MS)
        .and_then(|v| v.as_f64())
    {
        feed.detection_interval_ms = v;
    }
    if let Some(v) = get_u64(keys::PRINTER_STAT_POLLING_RATE_MS) {
        feed.printer_stat_polling_rate_ms = v;
    }
    if let Some(v) = get_u64(keys::MIN_SSE_DISPATCH_DELAY_MS) {
        feed.min_sse_dispatch_delay_ms = v;
    }
    feed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config_store::ConfigRepository;
    use serde_json::json;

    fn map(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(m) => m,
            _ => panic!("expected object"),
        }
    }

    #[test]
    fn test_feed_settings_overrides() {
        let settings = map(json!({
            "stream_max_fps": 12,
            "printer_stat_polling_rate_ms": 500,
            "detection_interval_ms": 250.0
        }));
        let feed = feed_settings_from(&settings);
        assert_eq!(feed.stream_max_fps, 12);
        assert_eq!(feed.printer_stat_polling_rate_ms, 500);
        assert_eq!(feed.detection_interval_ms, 250.0);
        assert_eq!(feed.stream_tunnel_fps, 10);
    }

    #[test]
    fn test_startup_mode_falls_back_to_local() {
        assert_eq!(startup_mode_from(&map(json!({}))), StartupMode::Local);
        assert_eq!(
            startup_mode_from(&map(json!({"startup_mode": "bogus"}))),
            StartupMode::Local
        );
        assert_eq!(
            tunnel_provider_from(&map(json!({"tunnel_provider": "ngrok"}))),
            Some(TunnelProvider::Ngrok)
        );
    }

    #[tokio::test]
    async fn test_push_subscription_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let repo = ConfigRepository::new(dir.path());
        repo.init().await.unwrap();
        let service = ConfigService::new(Arc::new(repo));

        let sub = service
            .add_push_subscription("http://hooks.local/a")
            .await
            .unwrap();
        let again = service
            .add_push_subscription("http://hooks.local/a")
            .await
            .unwrap();
        assert_eq!(sub, again);
        assert_eq!(service.list_push_subscriptions().await.unwrap().len(), 1);

        assert!(service.remove_push_subscription(&sub.id).await.unwrap());
        assert!(!service.remove_push_subscription(&sub.id).await.unwrap());
        assert!(service.list_push_subscriptions().await.unwrap().is_empty());
    }
}
