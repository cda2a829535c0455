//! StreamOptimizer - exposure-mode aware feed settings
//!
//! ## Responsibilities
//!
//! - Derive fps / JPEG quality / width / detection cadence from the
//!   exposure mode (local or tunnel) and explicit config keys
//! - Cache the derived settings, re-reading config at most every 30s
//! - Resize frames for streaming and detection
//! - MJPEG live feed

mod feed;

pub use feed::{mjpeg_feed, MJPEG_BOUNDARY};

use crate::config_store::{
    keys, startup_mode_from, tunnel_provider_from, ConfigStore, FeedSettings, StartupMode,
};
use crate::frame_source::Frame;
use image::imageops::{self, FilterType};
use serde::Serialize;
use serde_json::{Map, Value};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

/// How long derived settings stay cached
const SETTINGS_TTL: Duration = Duration::from_secs(30);

/// Derived feed settings
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct StreamSettings {
    pub max_fps: u32,
    pub jpeg_quality: u8,
    pub max_width: u32,
    pub detection_interval_ms: f64,
    pub is_tunnel_mode: bool,
    pub startup_mode: StartupMode,
}

impl StreamSettings {
    /// Settings for a config map
    pub fn from_config(config: &Map<String, Value>) -> Self {
        let defaults = FeedSettings::default();
        let startup_mode = startup_mode_from(config);

        let is_tunnel_mode = match config
            .get(keys::STREAM_OPTIMIZE_FOR_TUNNEL)
            .and_then(|v| v.as_bool())
        {
            Some(forced) => forced,
            None => {
                startup_mode == StartupMode::Tunnel && tunnel_provider_from(config).is_some()
            }
        };

        let get_u64 = |key: &str| config.get(key).and_then(|v| v.as_u64());

        let (max_fps, quality, width, interval) = if is_tunnel_mode {
            (
                get_u64(keys::STREAM_TUNNEL_FPS)
                    .map(|v| v as u32)
                    .unwrap_or(defaults.stream_tunnel_fps),
                defaults.stream_tunnel_jpeg_quality,
                defaults.stream_tunnel_max_width,
                defaults.detection_tunnel_interval_ms,
            )
        } else {
            (
                get_u64(keys::STREAM_MAX_FPS)
                    .map(|v| v as u32)
                    .unwrap_or(defaults.stream_max_fps),
                defaults.stream_jpeg_quality,
                defaults.stream_max_width,
                defaults.detection_interval_ms,
            )
        };

        Self {
            max_fps,
            jpeg_quality: get_u64(keys::STREAM_JPEG_QUALITY)
                .map(|v| v.clamp(1, 100) as u8)
                .unwrap_or(quality),
            max_width: get_u64(keys::STREAM_MAX_WIDTH)
                .map(|v| v as u32)
                .unwrap_or(width),
            detection_interval_ms: config
                .get(keys::DETECTION_INTERVAL_MS)
                .and_then(|v| v.as_f64())
                .unwrap_or(interval),
            is_tunnel_mode,
            startup_mode,
        }
    }
}

/// Cached settings provider
pub struct StreamOptimizer {
    config: Arc<ConfigStore>,
    cache: Mutex<Option<(Instant, StreamSettings)>>,
}

impl StreamOptimizer {
    pub fn new(config: Arc<ConfigStore>) -> Self {
        Self {
            config,
            cache: Mutex::new(None),
        }
    }

    fn cached(&self) -> Option<StreamSettings> {
        let cache = self.cache.lock().ok()?;
        match cache.as_ref() {
            Some((at, settings)) if at.elapsed() < SETTINGS_TTL => Some(settings.clone()),
            _ => None,
        }
    }

    /// Current settings (cached for 30s)
    pub async fn settings(&self) -> StreamSettings {
        if let Some(settings) = self.cached() {
            return settings;
        }

        let settings = StreamSettings::from_config(&self.config.get_cached_settings().await);
        if let Ok(mut cache) = self.cache.lock() {
            *cache = Some((Instant::now(), settings.clone()));
        }
        tracing::debug!(
            mode = if settings.is_tunnel_mode { "tunnel" } else { "local" },
            max_fps = settings.max_fps,
            max_width = settings.max_width,
            jpeg_quality = settings.jpeg_quality,
            "Stream settings refreshed"
        );
        settings
    }

    /// Drop cached settings so the next read re-derives them
    pub fn invalidate(&self) {
        if let Ok(mut cache) = self.cache.lock() {
            cache.take();
        }
    }

    /// Time between detection ticks
    pub async fn detection_interval(&self) -> Duration {
        let ms = self.settings().await.detection_interval_ms.max(1.0);
        Duration::from_secs_f64(ms / 1000.0)
    }
}

/// Remaining wait before the next frame may be sent, if any
pub fn frame_wait(settings: &StreamSettings, last_frame: Instant) -> Option<Duration> {
    if settings.max_fps == 0 {
        return None;
    }
    let min_interval = Duration::from_secs_f64(1.0 / settings.max_fps as f64);
    min_interval.checked_sub(last_frame.elapsed()).filter(|d| !d.is_zero())
}

/// Downscale preserving aspect ratio when wider than `max_width`
pub fn resize_to_width(frame: &Frame, max_width: u32) -> Frame {
    let (width, height) = (frame.width(), frame.height());
    if max_width == 0 || width <= max_width {
        return frame.clone();
    }
    let new_height = ((height as f64) * (max_width as f64 / width as f64)).max(1.0) as u32;
    let resized = imageops::resize(frame.image.as_ref(), max_width, new_height, FilterType::Triangle);
    Frame {
        image: Arc::new(resized),
        captured_at: frame.captured_at,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config_store::testing::memory_store;
    use image::RgbImage;
    use serde_json::json;

    fn settings_for(value: Value) -> StreamSettings {
        StreamSettings::from_config(value.as_object().unwrap())
    }

    #[test]
    fn test_local_defaults() {
        let s = settings_for(json!({}));
        assert!(!s.is_tunnel_mode);
        assert_eq!((s.max_fps, s.jpeg_quality, s.max_width), (30, 85, 1280));
        assert!((s.detection_interval_ms - 1000.0 / 15.0).abs() < 1e-9);
    }

    #[test]
    fn test_tunnel_requires_provider() {
        let s = settings_for(json!({"startup_mode": "tunnel"}));
        assert!(!s.is_tunnel_mode);

        let s = settings_for(json!({"startup_mode": "tunnel", "tunnel_provider": "cloudflare"}));
        assert!(s.is_tunnel_mode);
        assert_eq!((s.max_fps, s.jpeg_quality, s.max_width), (10, 60, 640));
    }

    #[test]
    fn test_override_wins() {
        let s = settings_for(json!({
            "startup_mode": "tunnel",
            "tunnel_provider": "ngrok",
            "stream_optimize_for_tunnel": false
        }));
        assert!(!s.is_tunnel_mode);

        let s = settings_for(json!({"stream_optimize_for_tunnel": true, "stream_tunnel_fps": 5}));
        assert!(s.is_tunnel_mode);
        assert_eq!(s.max_fps, 5);
    }

    #[test]
    fn test_explicit_keys() {
        let s = settings_for(json!({
            "stream_max_fps": 24,
            "stream_jpeg_quality": 70,
            "stream_max_width": 800,
            "detection_interval_ms": 500.0
        }));
        assert_eq!((s.max_fps, s.jpeg_quality, s.max_width), (24, 70, 800));
        assert_eq!(s.detection_interval_ms, 500.0);
    }

    #[test]
    fn test_resize_preserves_aspect() {
        let frame = Frame::new(RgbImage::new(2000, 1000));
        let out = resize_to_width(&frame, 1280);
        assert_eq!((out.width(), out.height()), (1280, 640));

        let small = Frame::new(RgbImage::new(320, 240));
        assert!(Arc::ptr_eq(&resize_to_width(&small, 1280).image, &small.image));
    }

    #[tokio::test(start_paused = true)]
    async fn test_fps_limit() {
        let s = settings_for(json!({"stream_max_fps": 10}));
        let last = Instant::now();
        assert!(frame_wait(&s, last).is_some());
        tokio::time::advance(Duration::from_millis(150)).await;
        assert!(frame_wait(&s, last).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cache_expires_and_invalidates() {
        let config = memory_store().await;
        let optimizer = StreamOptimizer::new(config.clone());

        assert_eq!(optimizer.settings().await.max_fps, 30);

        config.set(keys::STREAM_MAX_FPS, json!(12)).await.unwrap();
        assert_eq!(optimizer.settings().await.max_fps, 30);

        tokio::time::advance(Duration::from_secs(31)).await;
        assert_eq!(optimizer.settings().await.max_fps, 12);

        config.set(keys::STREAM_MAX_FPS, json!(8)).await.unwrap();
        optimizer.invalidate();
        assert_eq!(optimizer.settings().await.max_fps, 8);
    }
}
