//! Application state
//!
//! Holds all shared components and state

use crate::alert_manager::AlertManager;
use crate::camera_state::{CameraStateStore, DEFAULT_HISTORY_CAP};
use crate::config_store::{ConfigRepository, ConfigStore};
use crate::detection::DetectionService;
use crate::frame_source::{CaptureBackend, FfmpegCapture};
use crate::inference::{build_engine, ClassNames, InferenceBackend, InferenceEngine};
use crate::notifier::{Notifier, WebhookNotifier};
use crate::printer::{HttpPrinterConnector, PrinterConnector, PrinterGateway, PrinterMonitor};
use crate::realtime_hub::RealtimeHub;
use crate::shared_stream::SharedStreamManager;
use crate::stream_optimizer::StreamOptimizer;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Application configuration
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Server host
    pub host: String,
    /// Server port
    pub port: u16,
    /// Directory holding config.json
    pub data_dir: PathBuf,
    /// Inference backend selection
    pub inference: InferenceBackend,
    /// Ordered model class names
    pub class_names: Vec<String>,
    /// Class that counts as a defect
    pub defect_label: String,
    /// ffmpeg input format for capture devices (e.g. v4l2)
    pub capture_input_format: Option<String>,
    /// Static frontend files, served at `/` when set
    pub static_dir: Option<PathBuf>,
}

impl Default for AppConfig {
    fn default() -> Self {
        let inference_url = std::env::var("INFERENCE_URL")
            .unwrap_or_else(|_| "http://127.0.0.1:8500".to_string());
        Self {
            host: std::env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            port: std::env::var("PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(8080),
            data_dir: std::env::var("DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./data")),
            inference: parse_inference_backend(
                &std::env::var("INFERENCE_BACKEND").unwrap_or_else(|_| "http".to_string()),
                inference_url,
            ),
            class_names: std::env::var("CLASS_NAMES")
                .map(|names| parse_class_names(&names))
                .unwrap_or_else(|_| vec!["failure".to_string(), "success".to_string()]),
            defect_label: std::env::var("DEFECT_LABEL").unwrap_or_else(|_| "failure".to_string()),
            capture_input_format: std::env::var("CAPTURE_INPUT_FORMAT")
                .ok()
                .filter(|f| !f.is_empty()),
            static_dir: std::env::var("STATIC_DIR").ok().map(PathBuf::from),
        }
    }
}

/// `http` or `stub[:label]`; anything else falls back to http
fn parse_inference_backend(value: &str, url: String) -> InferenceBackend {
    match value.split_once(':') {
        Some(("stub", label)) => InferenceBackend::Stub {
            label: label.to_string(),
        },
        _ if value == "stub" => InferenceBackend::Stub {
            label: "success".to_string(),
        },
        _ => {
            if value != "http" {
                tracing::warn!(backend = %value, "Unknown inference backend, using http");
            }
            InferenceBackend::Http { url }
        }
    }
}

fn parse_class_names(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|name| name.trim().to_string())
        .filter(|name| !name.is_empty())
        .collect()
}

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    /// Application config
    pub config: AppConfig,
    /// ConfigStore (config.json)
    pub config_store: Arc<ConfigStore>,
    /// Shared capture streams
    pub streams: Arc<SharedStreamManager>,
    /// Camera records
    pub cameras: Arc<CameraStateStore>,
    /// RealtimeHub (SSE)
    pub realtime: Arc<RealtimeHub>,
    pub optimizer: Arc<StreamOptimizer>,
    pub alerts: Arc<AlertManager>,
    pub detection: Arc<DetectionService>,
    pub printer_gateway: Arc<PrinterGateway>,
    pub printer_monitor: Arc<PrinterMonitor>,
    /// Process start, for uptime
    pub started_at: Instant,
}

impl AppState {
    /// Build every component with the production backends
    pub async fn build(config: AppConfig) -> crate::Result<Self> {
        let classes = ClassNames::new(config.class_names.clone(), &config.defect_label)?;
        let engine = build_engine(&config.inference, &classes)?;
        let capture = Arc::new(FfmpegCapture::new(config.capture_input_format.clone()));
        Self::assemble(config, classes, capture, engine, Arc::new(HttpPrinterConnector)).await
    }

    /// Build every component around the given collaborators
    pub async fn assemble(
        config: AppConfig,
        classes: ClassNames,
        capture: Arc<dyn CaptureBackend>,
        engine: Arc<dyn InferenceEngine>,
        printers: Arc<dyn PrinterConnector>,
    ) -> crate::Result<Self> {
        let repo = ConfigRepository::new(&config.data_dir);
        repo.init().await?;
        tracing::info!(path = %repo.path().display(), "Config file ready");
        let config_store = Arc::new(ConfigStore::new(Arc::new(repo)).await?);
        let feed = config_store.feed_settings().await;

        let streams = Arc::new(SharedStreamManager::new(capture));
        let realtime = Arc::new(RealtimeHub::new(Duration::from_millis(
            feed.min_sse_dispatch_delay_ms,
        )));
        let cameras =
            CameraStateStore::load(config_store.clone(), streams.clone(), DEFAULT_HISTORY_CAP).await;
        let optimizer = Arc::new(StreamOptimizer::new(config_store.clone()));

        let printer_gateway = Arc::new(PrinterGateway::new(printers.clone()));
        let printer_monitor = Arc::new(PrinterMonitor::new(printers, realtime.clone()));

        let notifier: Arc<dyn Notifier> = Arc::new(WebhookNotifier::new(config_store.clone()));
        let alerts = AlertManager::new(
            cameras.clone(),
            realtime.clone(),
            notifier,
            printer_gateway.clone(),
        );
        let detection = DetectionService::new(
            cameras.clone(),
            streams.clone(),
            optimizer.clone(),
            engine,
            classes,
            alerts.clone(),
            realtime.clone(),
        );

        Ok(Self {
            config,
            config_store,
            streams,
            cameras,
            realtime,
            optimizer,
            alerts,
            detection,
            printer_gateway,
            printer_monitor,
            started_at: Instant::now(),
        })
    }

    /// Printer polling interval from config
    pub async fn printer_polling_interval(&self) -> Duration {
        Duration::from_millis(
            self.config_store
                .feed_settings()
                .await
                .printer_stat_polling_rate_ms,
        )
    }

    /// Start printer polling for every camera with a bound printer
    pub async fn resume_printer_polling(&self) {
        let interval = self.printer_polling_interval().await;
        for (camera_id, record) in self.cameras.list().await {
            if let Some(printer) = &record.printer_config {
                self.printer_monitor.start(&camera_id, printer, interval).await;
            }
        }
    }

    /// Stop detection, polling and capture, then persist camera state
    pub async fn shutdown(&self) {
        self.detection.stop_all().await;
        self.printer_monitor.stop_all().await;
        self.streams.release_all().await;
        if let Err(e) = self.cameras.flush().await {
            tracing::error!(error = %e, "Failed to persist camera states on shutdown");
        }
    }
}
