//! API Routes

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{delete, get, post, put},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::time::Duration;
use tower_http::cors::{Any, CorsLayer};
use tower_http::services::{ServeDir, ServeFile};
use tower_http::trace::TraceLayer;

use super::stream_routes::{camera_feed, event_stream};
use crate::camera_state::CameraRecord;
use crate::config_store::keys;
use crate::detection::StartOutcome;
use crate::models::{AlertAction, ApiResponse};
use crate::printer::{PrinterConfig, PrinterType};
use crate::shared_stream::StreamHealth;
use crate::state::AppState;
use crate::Error;

/// Camera fields only the server may change
const RUNTIME_FIELDS: &[&str] = &[
    "live_detection_running",
    "last_result",
    "last_time",
    "start_time",
    "error",
    "current_alert_id",
    "detection_history",
    "printer_id",
    "printer_config",
];

/// Config keys owned by other endpoints or by the server
const RESERVED_SETTINGS: &[&str] = &[keys::VERSION, keys::CAMERA_STATES, keys::PUSH_SUBSCRIPTIONS];

/// Create API router
pub fn create_router(state: AppState) -> Router {
    let static_dir = state.config.static_dir.clone();

    let router = Router::new()
        // Health
        .route("/healthz", get(super::health_check))
        // Cameras
        .route("/api/cameras", get(list_cameras))
        .route("/api/cameras", post(create_camera))
        .route("/api/cameras/:id", get(get_camera))
        .route("/api/cameras/:id", put(update_camera))
        .route("/api/cameras/:id", delete(delete_camera))
        .route("/api/cameras/:id/feed", get(camera_feed))
        .route("/api/cameras/:id/printer", put(bind_printer))
        .route("/api/cameras/:id/printer", delete(unbind_printer))
        // Live detection
        .route("/api/detect/live/start", post(start_live_detection))
        .route("/api/detect/live/stop", post(stop_live_detection))
        // Alerts
        .route("/api/alert/dismiss", post(resolve_alert))
        .route("/api/alert/active", get(active_alerts))
        // Realtime events (SSE)
        .route("/api/events", get(event_stream))
        // Settings
        .route("/api/stream/settings", get(stream_settings))
        .route("/api/settings", get(get_settings))
        .route("/api/settings", put(update_settings))
        // Push subscriptions
        .route("/api/notifications/subscriptions", get(list_subscriptions))
        .route("/api/notifications/subscriptions", post(add_subscription))
        .route("/api/notifications/subscriptions/:id", delete(remove_subscription))
        .with_state(state);

    let router = match static_dir {
        Some(dir) => {
            tracing::info!(static_dir = %dir.display(), "Static file serving enabled");
            router.fallback_service(
                ServeDir::new(&dir).not_found_service(ServeFile::new(dir.join("index.html"))),
            )
        }
        None => router,
    };

    router
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
}

// ========================================
// Camera API Handlers
// ========================================

/// Printer binding without its API key
#[derive(Debug, Serialize)]
struct PrinterView {
    name: String,
    printer_type: PrinterType,
    base_url: String,
}

/// Camera as returned by the API
#[derive(Debug, Serialize)]
struct CameraView {
    camera_uuid: String,
    nickname: String,
    source: String,
    brightness: f64,
    contrast: f64,
    focus: f64,
    sensitivity: f64,
    countdown_time: f64,
    countdown_action: AlertAction,
    majority_vote_window: usize,
    majority_vote_threshold: usize,
    live_detection_running: bool,
    last_result: Option<String>,
    last_time: Option<f64>,
    start_time: Option<f64>,
    error: Option<String>,
    current_alert_id: Option<String>,
    printer_id: Option<String>,
    printer: Option<PrinterView>,
    total_detections: usize,
    frame_rate: f64,
    stream: Option<StreamHealth>,
}

impl CameraView {
    fn new(camera_id: String, record: CameraRecord, stream: Option<StreamHealth>) -> Self {
        Self {
            total_detections: record.detection_history.len(),
            frame_rate: record.frame_rate(),
            printer: record.printer_config.map(|p| PrinterView {
                name: p.name,
                printer_type: p.printer_type,
                base_url: p.base_url,
            }),
            camera_uuid: camera_id,
            nickname: record.nickname,
            source: record.source,
            brightness: record.brightness,
            contrast: record.contrast,
            focus: record.focus,
            sensitivity: record.sensitivity,
            countdown_time: record.countdown_time,
            countdown_action: record.countdown_action,
            majority_vote_window: record.majority_vote_window,
            majority_vote_threshold: record.majority_vote_threshold,
            live_detection_running: record.live_detection_running,
            last_result: record.last_result,
            last_time: record.last_time,
            start_time: record.start_time,
            error: record.error,
            current_alert_id: record.current_alert_id,
            printer_id: record.printer_id,
            stream,
        }
    }
}

async fn camera_view(state: &AppState, camera_id: &str) -> Result<CameraView, Error> {
    let record = state
        .cameras
        .get_existing(camera_id)
        .await
        .ok_or_else(|| Error::NotFound(format!("Camera {} not found", camera_id)))?;
    let stream = state.streams.health(camera_id).await;
    Ok(CameraView::new(camera_id.to_string(), record, stream))
}

fn reject_fields(partial: &Map<String, Value>, reserved: &[&str]) -> Result<(), Error> {
    let rejected: Vec<&str> = partial
        .keys()
        .map(String::as_str)
        .filter(|key| reserved.contains(key))
        .collect();
    if rejected.is_empty() {
        Ok(())
    } else {
        Err(Error::Validation(format!(
            "fields cannot be set here: {}",
            rejected.join(", ")
        )))
    }
}

async fn list_cameras(State(state): State<AppState>) -> impl IntoResponse {
    let mut cameras = Vec::new();
    for (camera_id, record) in state.cameras.list().await {
        let stream = state.streams.health(&camera_id).await;
        cameras.push(CameraView::new(camera_id, record, stream));
    }
    Json(ApiResponse::success(cameras))
}

#[derive(Debug, Deserialize)]
struct CreateCameraRequest {
    camera_uuid: Option<String>,
    nickname: String,
    source: String,
    /// Any other camera settings (sensitivity, countdown_time, ...)
    #[serde(flatten)]
    settings: Map<String, Value>,
}

async fn create_camera(
    State(state): State<AppState>,
    Json(req): Json<CreateCameraRequest>,
) -> Result<impl IntoResponse, Error> {
    if req.source.trim().is_empty() {
        return Err(Error::Validation("source is required".to_string()));
    }
    reject_fields(&req.settings, RUNTIME_FIELDS)?;

    let camera_id = req
        .camera_uuid
        .filter(|id| !id.trim().is_empty())
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    if state.cameras.get_existing(&camera_id).await.is_some() {
        return Err(Error::Validation(format!("Camera {} already exists", camera_id)));
    }

    state
        .cameras
        .insert(&camera_id, CameraRecord::new(req.nickname, req.source))
        .await;
    if !req.settings.is_empty() {
        state.cameras.update(&camera_id, &req.settings).await;
    }

    tracing::info!(camera_id = %camera_id, "Camera registered");
    let view = camera_view(&state, &camera_id).await?;
    Ok((StatusCode::CREATED, Json(ApiResponse::success(view))))
}

async fn get_camera(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, Error> {
    Ok(Json(ApiResponse::success(camera_view(&state, &id).await?)))
}

async fn update_camera(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(partial): Json<Map<String, Value>>,
) -> Result<impl IntoResponse, Error> {
    if state.cameras.get_existing(&id).await.is_none() {
        return Err(Error::NotFound(format!("Camera {} not found", id)));
    }
    reject_fields(&partial, RUNTIME_FIELDS)?;

    state.cameras.update(&id, &partial).await;
    Ok(Json(ApiResponse::success(camera_view(&state, &id).await?)))
}

async fn delete_camera(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, Error> {
    let record = state
        .cameras
        .get_existing(&id)
        .await
        .ok_or_else(|| Error::NotFound(format!("Camera {} not found", id)))?;

    state.detection.stop(&id).await;
    state.printer_monitor.stop(&id).await;
    if let Some(alert_id) = record.current_alert_id {
        state.alerts.resolve(&alert_id, AlertAction::Dismiss).await;
    }
    state.cameras.remove(&id).await;

    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
struct BindPrinterRequest {
    printer_id: Option<String>,
    #[serde(flatten)]
    config: PrinterConfig,
}

async fn bind_printer(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<BindPrinterRequest>,
) -> Result<impl IntoResponse, Error> {
    if req.config.base_url.trim().is_empty() {
        return Err(Error::Validation("base_url is required".to_string()));
    }
    let printer_id = req.printer_id.unwrap_or_else(|| req.config.name.clone());
    let config = req.config;

    state
        .cameras
        .update_with(&id, |record| {
            record.printer_id = Some(printer_id);
            record.printer_config = Some(config.clone());
        })
        .await
        .ok_or_else(|| Error::NotFound(format!("Camera {} not found", id)))?;

    let interval = state.printer_polling_interval().await;
    state.printer_monitor.start(&id, &config, interval).await;

    tracing::info!(camera_id = %id, printer = %config.name, "Printer bound");
    Ok(Json(ApiResponse::success(camera_view(&state, &id).await?)))
}

async fn unbind_printer(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, Error> {
    let had_printer = state
        .cameras
        .update_with(&id, |record| {
            record.printer_id = None;
            record.printer_config.take().is_some()
        })
        .await
        .ok_or_else(|| Error::NotFound(format!("Camera {} not found", id)))?;

    state.printer_monitor.stop(&id).await;
    if had_printer {
        tracing::info!(camera_id = %id, "Printer unbound");
    }
    Ok(Json(ApiResponse::success(camera_view(&state, &id).await?)))
}

// ========================================
// Live Detection API Handlers
// ========================================

#[derive(Debug, Deserialize)]
struct DetectionRequest {
    camera_uuid: String,
}

#[derive(Debug, Serialize)]
struct DetectionResponse {
    camera_uuid: String,
    live_detection_running: bool,
    message: String,
}

async fn start_live_detection(
    State(state): State<AppState>,
    Json(req): Json<DetectionRequest>,
) -> Result<impl IntoResponse, Error> {
    let outcome = state.detection.start(&req.camera_uuid).await?;
    let nickname = state
        .cameras
        .get_existing(&req.camera_uuid)
        .await
        .map(|r| r.nickname)
        .unwrap_or_default();

    let message = match outcome {
        StartOutcome::Started => format!("Live detection started for camera {}", nickname),
        StartOutcome::AlreadyRunning => {
            format!("Live detection already running for camera {}", nickname)
        }
    };
    Ok(Json(ApiResponse::success(DetectionResponse {
        camera_uuid: req.camera_uuid,
        live_detection_running: true,
        message,
    })))
}

async fn stop_live_detection(
    State(state): State<AppState>,
    Json(req): Json<DetectionRequest>,
) -> Result<impl IntoResponse, Error> {
    let record = state
        .cameras
        .get_existing(&req.camera_uuid)
        .await
        .ok_or_else(|| Error::NotFound(format!("Camera {} not found", req.camera_uuid)))?;

    let message = if state.detection.stop(&req.camera_uuid).await {
        format!("Live detection stopped for camera {}", record.nickname)
    } else {
        format!("Live detection not running for camera {}", record.nickname)
    };
    Ok(Json(ApiResponse::success(DetectionResponse {
        camera_uuid: req.camera_uuid,
        live_detection_running: false,
        message,
    })))
}

// ========================================
// Alert API Handlers
// ========================================

#[derive(Debug, Deserialize)]
struct ResolveAlertRequest {
    alert_id: String,
    #[serde(default)]
    action: AlertAction,
}

async fn resolve_alert(
    State(state): State<AppState>,
    Json(req): Json<ResolveAlertRequest>,
) -> Result<impl IntoResponse, Error> {
    if !state.alerts.resolve(&req.alert_id, req.action).await {
        return Err(Error::NotFound(format!("Alert {} not found", req.alert_id)));
    }
    Ok(Json(ApiResponse::success(json!({
        "alert_id": req.alert_id,
        "action": req.action,
    }))))
}

async fn active_alerts(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({ "active_alerts": state.alerts.active().await }))
}

// ========================================
// Settings API Handlers
// ========================================

async fn stream_settings(State(state): State<AppState>) -> impl IntoResponse {
    Json(ApiResponse::success(state.optimizer.settings().await))
}

fn visible_settings(mut settings: Map<String, Value>) -> Map<String, Value> {
    settings.remove(keys::CAMERA_STATES);
    settings.remove(keys::PUSH_SUBSCRIPTIONS);
    settings
}

async fn get_settings(State(state): State<AppState>) -> impl IntoResponse {
    Json(ApiResponse::success(visible_settings(
        state.config_store.get_cached_settings().await,
    )))
}

async fn update_settings(
    State(state): State<AppState>,
    Json(partial): Json<Map<String, Value>>,
) -> Result<impl IntoResponse, Error> {
    reject_fields(&partial, RESERVED_SETTINGS)?;

    let touches_dispatch = partial.contains_key(keys::MIN_SSE_DISPATCH_DELAY_MS);
    state.config_store.save(partial).await?;
    state.optimizer.invalidate();

    if touches_dispatch {
        let delay = state.config_store.feed_settings().await.min_sse_dispatch_delay_ms;
        state
            .realtime
            .set_min_dispatch_interval(Duration::from_millis(delay));
    }

    Ok(Json(ApiResponse::success(visible_settings(
        state.config_store.get_cached_settings().await,
    ))))
}

// ========================================
// Push Subscription API Handlers
// ========================================

#[derive(Debug, Deserialize)]
struct SubscribeRequest {
    endpoint: String,
}

async fn list_subscriptions(State(state): State<AppState>) -> Result<impl IntoResponse, Error> {
    let subscriptions = state.config_store.service().list_push_subscriptions().await?;
    Ok(Json(ApiResponse::success(subscriptions)))
}

async fn add_subscription(
    State(state): State<AppState>,
    Json(req): Json<SubscribeRequest>,
) -> Result<impl IntoResponse, Error> {
    let subscription = state
        .config_store
        .service()
        .add_push_subscription(&req.endpoint)
        .await?;
    Ok((StatusCode::CREATED, Json(ApiResponse::success(subscription))))
}

async fn remove_subscription(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, Error> {
    if !state
        .config_store
        .service()
        .remove_push_subscription(&id)
        .await?
    {
        return Err(Error::NotFound(format!("Subscription {} not found", id)));
    }
    Ok(StatusCode::NO_CONTENT)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inference::{ClassNames, StubInferenceEngine};
    use crate::printer::testing::{FakeConnector, FakePrinter};
    use crate::shared_stream::testing::{FakeBackend, FakeMode};
    use crate::state::AppConfig;
    use std::sync::Arc;

    struct Server {
        base: String,
        client: reqwest::Client,
        state: AppState,
        _dir: tempfile::TempDir,
    }

    async fn serve() -> Server {
        let dir = tempfile::tempdir().unwrap();
        let config = AppConfig {
            host: "127.0.0.1".to_string(),
            port: 0,
            data_dir: dir.path().to_path_buf(),
            inference: crate::inference::InferenceBackend::Stub {
                label: "success".to_string(),
            },
            class_names: vec!["failure".to_string(), "success".to_string()],
            defect_label: "failure".to_string(),
            capture_input_format: None,
            static_dir: None,
        };
        let state = AppState::assemble(
            config,
            ClassNames::default(),
            FakeBackend::new(FakeMode::Frames(Duration::from_millis(5))),
            Arc::new(StubInferenceEngine::new(1, 2)),
            Arc::new(FakeConnector(FakePrinter::new("Operational"))),
        )
        .await
        .unwrap();

        let app = create_router(state.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });

        Server {
            base: format!("http://{}", addr),
            client: reqwest::Client::new(),
            state,
            _dir: dir,
        }
    }

    impl Server {
        async fn create(&self, body: Value) -> reqwest::Response {
            self.client
                .post(format!("{}/api/cameras", self.base))
                .json(&body)
                .send()
                .await
                .unwrap()
        }
    }

    #[tokio::test]
    async fn test_camera_crud() {
        let server = serve().await;

        let resp = server
            .create(json!({"camera_uuid": "cam-1", "nickname": "Bench", "source": "0", "sensitivity": 1.2}))
            .await;
        assert_eq!(resp.status(), StatusCode::CREATED);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["data"]["sensitivity"], 1.2);

        let duplicate = server
            .create(json!({"camera_uuid": "cam-1", "nickname": "Bench", "source": "0"}))
            .await;
        assert_eq!(duplicate.status(), StatusCode::BAD_REQUEST);

        let resp = server
            .client
            .put(format!("{}/api/cameras/cam-1", server.base))
            .json(&json!({"nickname": "Prusa", "majority_vote_window": 7}))
            .send()
            .await
            .unwrap();
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["data"]["nickname"], "Prusa");
        assert_eq!(body["data"]["majority_vote_window"], 7);

        let protected = server
            .client
            .put(format!("{}/api/cameras/cam-1", server.base))
            .json(&json!({"current_alert_id": "x"}))
            .send()
            .await
            .unwrap();
        assert_eq!(protected.status(), StatusCode::BAD_REQUEST);

        let list: Value = server
            .client
            .get(format!("{}/api/cameras", server.base))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(list["data"].as_array().unwrap().len(), 1);

        let deleted = server
            .client
            .delete(format!("{}/api/cameras/cam-1", server.base))
            .send()
            .await
            .unwrap();
        assert_eq!(deleted.status(), StatusCode::NO_CONTENT);

        let missing = server
            .client
            .get(format!("{}/api/cameras/cam-1", server.base))
            .send()
            .await
            .unwrap();
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);
        let body: Value = missing.json().await.unwrap();
        assert_eq!(body["error_code"], "NOT_FOUND");
    }

    #[tokio::test]
    async fn test_detection_start_stop() {
        let server = serve().await;
        server
            .create(json!({"camera_uuid": "cam-1", "nickname": "Bench", "source": "0"}))
            .await;

        let start = |server: &Server| {
            server
                .client
                .post(format!("{}/api/detect/live/start", server.base))
                .json(&json!({"camera_uuid": "cam-1"}))
                .send()
        };
        let body: Value = start(&server).await.unwrap().json().await.unwrap();
        assert_eq!(body["data"]["message"], "Live detection started for camera Bench");
        let body: Value = start(&server).await.unwrap().json().await.unwrap();
        assert_eq!(
            body["data"]["message"],
            "Live detection already running for camera Bench"
        );
        assert!(server.state.detection.is_running("cam-1").await);

        let body: Value = server
            .client
            .post(format!("{}/api/detect/live/stop", server.base))
            .json(&json!({"camera_uuid": "cam-1"}))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(body["data"]["live_detection_running"], false);
        assert!(!server.state.detection.is_running("cam-1").await);

        server.state.shutdown().await;
    }

    #[tokio::test]
    async fn test_unknown_alert_is_not_found() {
        let server = serve().await;
        let resp = server
            .client
            .post(format!("{}/api/alert/dismiss", server.base))
            .json(&json!({"alert_id": "cam-1_missing", "action": "dismiss"}))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        let active: Value = server
            .client
            .get(format!("{}/api/alert/active", server.base))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(active["active_alerts"], json!([]));
    }

    #[tokio::test]
    async fn test_settings_update_invalidates_stream_settings() {
        let server = serve().await;
        let settings: Value = server
            .client
            .get(format!("{}/api/stream/settings", server.base))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(settings["data"]["max_fps"], 30);

        let resp = server
            .client
            .put(format!("{}/api/settings", server.base))
            .json(&json!({"stream_max_fps": 12, "min_sse_dispatch_delay_ms": 250}))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(
            server.state.realtime.min_dispatch_interval(),
            Duration::from_millis(250)
        );

        let settings: Value = server
            .client
            .get(format!("{}/api/stream/settings", server.base))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(settings["data"]["max_fps"], 12);

        let reserved = server
            .client
            .put(format!("{}/api/settings", server.base))
            .json(&json!({"camera_states": {}}))
            .send()
            .await
            .unwrap();
        assert_eq!(reserved.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_printer_binding_starts_polling() {
        let server = serve().await;
        server
            .create(json!({"camera_uuid": "cam-1", "nickname": "Bench", "source": "0"}))
            .await;

        let body: Value = server
            .client
            .put(format!("{}/api/cameras/cam-1/printer", server.base))
            .json(&json!({
                "name": "MK4",
                "printer_type": "octoprint",
                "base_url": "http://octopi.local",
                "api_key": "secret"
            }))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(body["data"]["printer"]["name"], "MK4");
        assert!(body["data"]["printer"].get("api_key").is_none());
        assert!(server.state.printer_monitor.is_polling("cam-1").await);

        server
            .client
            .delete(format!("{}/api/cameras/cam-1/printer", server.base))
            .send()
            .await
            .unwrap();
        assert!(!server.state.printer_monitor.is_polling("cam-1").await);
    }
}
