//! ConfigStore data types
//!
//! Keys and typed views over the JSON config file

use serde::{Deserialize, Serialize};

/// Config layout version. A file with any other version is recreated on startup.
pub const CONFIG_VERSION: &str = "1.0.0";

/// Top-level keys of the config file
pub mod keys {
    pub const VERSION: &str = "version";
    pub const STARTUP_MODE: &str = "startup_mode";
    pub const SITE_DOMAIN: &str = "site_domain";
    pub const TUNNEL_PROVIDER: &str = "tunnel_provider";
    pub const STREAM_OPTIMIZE_FOR_TUNNEL: &str = "stream_optimize_for_tunnel";
    pub const STREAM_MAX_FPS: &str = "stream_max_fps";
    pub const STREAM_TUNNEL_FPS: &str = "stream_tunnel_fps";
    pub const STREAM_JPEG_QUALITY: &str = "stream_jpeg_quality";
    pub const STREAM_MAX_WIDTH: &str = "stream_max_width";
    pub const DETECTION_INTERVAL_MS: &str = "detection_interval_ms";
    pub const PRINTER_STAT_POLLING_RATE_MS: &str = "printer_stat_polling_rate_ms";
    pub const MIN_SSE_DISPATCH_DELAY_MS: &str = "min_sse_dispatch_delay_ms";
    pub const PUSH_SUBSCRIPTIONS: &str = "push_subscriptions";
    pub const CAMERA_STATES: &str = "camera_states";
}

/// How the site is exposed
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum StartupMode {
    Setup,
    #[default]
    Local,
    Tunnel,
}

/// Tunnel provider used in tunnel mode
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TunnelProvider {
    Ngrok,
    Cloudflare,
}

/// Registered notification endpoint
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PushSubscription {
    pub id: String,
    pub endpoint: String,
}

/// Feed and dispatch tunables with their built-in defaults
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FeedSettings {
    pub stream_max_fps: u32,
    pub stream_tunnel_fps: u32,
    pub stream_jpeg_quality: u8,
    pub stream_tunnel_jpeg_quality: u8,
    pub stream_max_width: u32,
    pub stream_tunnel_max_width: u32,
    pub detections_per_second: u32,
    pub detection_interval_ms: f64,
    pub detection_tunnel_interval_ms: f64,
    pub printer_stat_polling_rate_ms: u64,
    pub min_sse_dispatch_delay_ms: u64,
}

impl Default for FeedSettings {
    fn default() -> Self {
        let detections_per_second = 15;
        Self {
            stream_max_fps: 30,
            stream_tunnel_fps: 10,
            stream_jpeg_quality: 85,
            stream_tunnel_jpeg_quality: 60,
            stream_max_width: 1280,
            stream_tunnel_max_width: 640,
            detections_per_second,
            detection_interval_ms: 1000.0 / detections_per_second as f64,
            detection_tunnel_interval_ms: 1000.0 / detections_per_second as f64,
            printer_stat_polling_rate_ms: 2000,
            min_sse_dispatch_delay_ms: 100,
        }
    }
}

/// Default contents written when the config file is (re)created
pub fn default_config() -> serde_json::Map<String, serde_json::Value> {
    let mut map = serde_json::Map::new();
    map.insert(keys::VERSION.into(), CONFIG_VERSION.into());
    map.insert(keys::STARTUP_MODE.into(), serde_json::Value::Null);
    map.insert(keys::SITE_DOMAIN.into(), serde_json::Value::Null);
    map.insert(keys::TUNNEL_PROVIDER.into(), serde_json::Value::Null);
    map.insert(keys::PUSH_SUBSCRIPTIONS.into(), serde_json::json!([]));
    map.insert(keys::CAMERA_STATES.into(), serde_json::json!({}));
    map
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_feed_settings_defaults() {
        let settings = FeedSettings::default();
        assert_eq!(settings.stream_max_fps, 30);
        assert_eq!(settings.stream_tunnel_max_width, 640);
        assert!((settings.detection_interval_ms - 66.666).abs() < 0.01);
        assert_eq!(settings.min_sse_dispatch_delay_ms, 100);
    }

    #[test]
    fn test_startup_mode_serde() {
        let mode: StartupMode = serde_json::from_str("\"tunnel\"").unwrap();
        assert_eq!(mode, StartupMode::Tunnel);
        assert_eq!(serde_json::to_string(&StartupMode::Local).unwrap(), "\"local\"");
    }
}
