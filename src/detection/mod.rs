//! DetectionService - live defect detection per camera
//!
//! ## Responsibilities
//!
//! - One detection task per camera (STOPPED -> RUNNING -> STOPPED)
//! - Frame -> adjust -> resize -> inference -> history -> majority vote
//! - Alert claims through the camera state store
//! - `camera_state` events after every classification
//!
//! The running flag lives in the camera record; the task handle lives here.

pub mod voting;

use crate::alert_manager::{new_alert_id, AlertManager};
use crate::camera_state::CameraStateStore;
use crate::error::{Error, Result};
use crate::frame_adjust::{self, Adjustments};
use crate::inference::{ClassNames, InferenceEngine, PriorStats};
use crate::models::now_ts;
use crate::realtime_hub::{CameraStateMessage, HubMessage, RealtimeHub};
use crate::shared_stream::SharedStreamManager;
use crate::stream_optimizer::{resize_to_width, StreamOptimizer};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

/// How long stop waits for the task before aborting it
const STOP_GRACE: Duration = Duration::from_millis(250);

/// Error recorded when the shared stream yields nothing
pub const FRAME_UNAVAILABLE: &str = "Failed to get frame from shared stream";

/// Detections between progress log lines
const PROGRESS_EVERY: u64 = 100;

/// Result of a start request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    Started,
    AlreadyRunning,
}

/// DetectionService instance
pub struct DetectionService {
    cameras: Arc<CameraStateStore>,
    streams: Arc<SharedStreamManager>,
    optimizer: Arc<StreamOptimizer>,
    engine: Arc<dyn InferenceEngine>,
    classes: ClassNames,
    alerts: Arc<AlertManager>,
    hub: Arc<RealtimeHub>,
    tasks: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl DetectionService {
    pub fn new(
        cameras: Arc<CameraStateStore>,
        streams: Arc<SharedStreamManager>,
        optimizer: Arc<StreamOptimizer>,
        engine: Arc<dyn InferenceEngine>,
        classes: ClassNames,
        alerts: Arc<AlertManager>,
        hub: Arc<RealtimeHub>,
    ) -> Arc<Self> {
        Arc::new(Self {
            cameras,
            streams,
            optimizer,
            engine,
            classes,
            alerts,
            hub,
            tasks: Mutex::new(HashMap::new()),
        })
    }

    /// Start live detection for a registered camera
    pub async fn start(self: &Arc<Self>, camera_id: &str) -> Result<StartOutcome> {
        let started = self
            .cameras
            .update_with(camera_id, |record| {
                if record.live_detection_running {
                    return false;
                }
                record.reset_runtime();
                record.start_time = Some(now_ts());
                record.live_detection_running = true;
                true
            })
            .await
            .ok_or_else(|| Error::NotFound(format!("camera {}", camera_id)))?;

        if !started {
            tracing::debug!(camera_id = %camera_id, "Live detection already running");
            return Ok(StartOutcome::AlreadyRunning);
        }

        let handle = tokio::spawn(self.clone().run(camera_id.to_string()));
        if let Some(previous) = self.tasks.lock().await.insert(camera_id.to_string(), handle) {
            previous.abort();
        }

        tracing::info!(camera_id = %camera_id, engine = self.engine.name(), "Live detection started");
        Ok(StartOutcome::Started)
    }

    /// Stop live detection; false when it was not running
    pub async fn stop(&self, camera_id: &str) -> bool {
        let was_running = self
            .cameras
            .update_with(camera_id, |record| {
                std::mem::replace(&mut record.live_detection_running, false)
            })
            .await
            .unwrap_or(false);

        let handle = self.tasks.lock().await.remove(camera_id);
        if let Some(mut handle) = handle {
            if tokio::time::timeout(STOP_GRACE, &mut handle).await.is_err() {
                tracing::debug!(camera_id = %camera_id, "Detection task did not stop in time, aborting");
                handle.abort();
            }
        }

        let record = self
            .cameras
            .update_with(camera_id, |record| {
                record.start_time = None;
                record.live_detection_running = false;
                record.clone()
            })
            .await;
        if let Some(record) = record {
            self.hub
                .publish(HubMessage::CameraState(CameraStateMessage::from_record(camera_id, &record)));
        }

        if was_running {
            tracing::info!(camera_id = %camera_id, "Live detection stopped");
        }
        was_running
    }

    /// Stop every detection task (shutdown)
    pub async fn stop_all(&self) {
        let ids: Vec<String> = self.tasks.lock().await.keys().cloned().collect();
        for camera_id in ids {
            self.stop(&camera_id).await;
        }
    }

    /// Whether a detection task is alive for the camera
    pub async fn is_running(&self, camera_id: &str) -> bool {
        self.tasks
            .lock()
            .await
            .get(camera_id)
            .map(|handle| !handle.is_finished())
            .unwrap_or(false)
    }

    pub async fn running_count(&self) -> usize {
        self.tasks
            .lock()
            .await
            .values()
            .filter(|handle| !handle.is_finished())
            .count()
    }

    async fn run(self: Arc<Self>, camera_id: String) {
        let mut detections: u64 = 0;

        loop {
            let Some(record) = self.cameras.get_existing(&camera_id).await else {
                break;
            };
            if !record.live_detection_running {
                break;
            }

            let Some(frame) = self.streams.wait_for_frame(&camera_id, &record.source).await else {
                tracing::warn!(camera_id = %camera_id, "{}", FRAME_UNAVAILABLE);
                let failed = self
                    .cameras
                    .update_with(&camera_id, |record| {
                        record.error = Some(FRAME_UNAVAILABLE.to_string());
                        record.live_detection_running = false;
                        record.clone()
                    })
                    .await;
                if let Some(failed) = failed {
                    self.hub.publish_force(HubMessage::CameraState(
                        CameraStateMessage::from_record(&camera_id, &failed),
                    ));
                }
                break;
            };

            let adjustments = Adjustments::from(&record);
            let max_width = self.optimizer.settings().await.max_width;
            let prepared = tokio::task::spawn_blocking(move || {
                let adjusted = frame_adjust::apply(&frame, &adjustments);
                let detection_frame = resize_to_width(&adjusted, max_width);
                (adjusted, detection_frame)
            })
            .await;
            let (adjusted, detection_frame) = match prepared {
                Ok(frames) => frames,
                Err(e) => {
                    tracing::error!(camera_id = %camera_id, error = %e, "Frame preparation failed");
                    break;
                }
            };

            let prior = PriorStats {
                sensitivity: record.sensitivity,
                defect_idx: self.classes.defect_idx(),
            };
            let prediction = match self.engine.predict(&detection_frame, &prior).await {
                Ok(prediction) => prediction,
                Err(e) => {
                    tracing::debug!(camera_id = %camera_id, error = %e, "Detection inference error");
                    tokio::time::sleep(self.optimizer.detection_interval().await).await;
                    continue;
                }
            };

            let label = self.classes.label(prediction.class_index);
            let timestamp = now_ts();
            let Some(updated) = self
                .cameras
                .append_detection(&camera_id, &label, timestamp)
                .await
            else {
                break;
            };
            self.hub
                .publish(HubMessage::CameraState(CameraStateMessage::from_record(&camera_id, &updated)));
            detections += 1;

            if prediction.class_index == self.classes.defect_idx() {
                let alert_id = new_alert_id(&camera_id);
                if let Some(claimed) = self
                    .cameras
                    .claim_alert(&camera_id, &alert_id, self.classes.defect_label())
                    .await
                {
                    // Runs detached so a stop cannot leave the claim dangling
                    let raised = self
                        .alerts
                        .raise(camera_id.clone(), alert_id, claimed, adjusted, timestamp)
                        .await;
                    if let Err(e) = raised {
                        tracing::error!(camera_id = %camera_id, error = %e, "Alert task failed");
                    }
                }
            }

            let interval = self.optimizer.detection_interval().await;
            if detections % PROGRESS_EVERY == 0 {
                let settings = self.optimizer.settings().await;
                tracing::debug!(
                    camera_id = %camera_id,
                    detections = detections,
                    interval_ms = interval.as_millis() as u64,
                    mode = if settings.is_tunnel_mode { "tunnel" } else { "local" },
                    "Detection progress"
                );
            }
            tokio::time::sleep(interval).await;
        }

        tracing::debug!(camera_id = %camera_id, detections = detections, "Detection loop exited");
    }
}
