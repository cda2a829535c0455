//! AlertManager - defect alert lifecycle
//!
//! ## Responsibilities
//!
//! - Build alerts (snapshot, title, countdown) after a successful claim
//! - Countdown expiry with the camera's configured action
//! - Explicit resolution (dismiss / cancel print / pause print)
//! - Alert events and push notifications
//!
//! Resolution removes the alert from the table first, so only one of the
//! countdown and an explicit action ever acts on it.

use crate::camera_state::{CameraRecord, CameraStateStore};
use crate::frame_source::Frame;
use crate::models::AlertAction;
use crate::notifier::Notifier;
use crate::printer::PrinterGateway;
use crate::realtime_hub::{HubMessage, RealtimeHub};
use base64::Engine;
use serde::{Serialize, Serializer};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

/// JPEG quality for alert snapshots
const SNAPSHOT_JPEG_QUALITY: u8 = 90;

/// Defect alert
#[derive(Debug, Clone, Serialize)]
pub struct Alert {
    pub id: String,
    /// JPEG bytes, base64 on the wire
    #[serde(serialize_with = "serialize_base64")]
    pub snapshot: Vec<u8>,
    pub title: String,
    pub message: String,
    pub timestamp: f64,
    pub countdown_time: f64,
    pub countdown_action: AlertAction,
    #[serde(rename = "camera_uuid")]
    pub camera_id: String,
    pub has_printer: bool,
}

fn serialize_base64<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&base64::engine::general_purpose::STANDARD.encode(bytes))
}

/// Alert id for a camera: `<camera_id>_<uuid>`
pub fn new_alert_id(camera_id: &str) -> String {
    format!("{}_{}", camera_id, uuid::Uuid::new_v4())
}

struct ActiveAlert {
    alert: Alert,
    timer: Option<JoinHandle<()>>,
}

/// AlertManager instance
pub struct AlertManager {
    cameras: Arc<CameraStateStore>,
    hub: Arc<RealtimeHub>,
    notifier: Arc<dyn Notifier>,
    gateway: Arc<PrinterGateway>,
    alerts: Mutex<HashMap<String, ActiveAlert>>,
}

impl AlertManager {
    pub fn new(
        cameras: Arc<CameraStateStore>,
        hub: Arc<RealtimeHub>,
        notifier: Arc<dyn Notifier>,
        gateway: Arc<PrinterGateway>,
    ) -> Arc<Self> {
        Arc::new(Self {
            cameras,
            hub,
            notifier,
            gateway,
            alerts: Mutex::new(HashMap::new()),
        })
    }

    /// Register an alert for a claimed `alert_id` and start its countdown.
    ///
    /// `record` is the camera record as of the claim and `frame` the
    /// adjusted full-size frame the defect was detected on.
    pub async fn create_alert(
        self: &Arc<Self>,
        camera_id: &str,
        alert_id: &str,
        record: &CameraRecord,
        frame: &Frame,
        timestamp: f64,
    ) -> crate::Result<Alert> {
        let snapshot = {
            let frame = frame.clone();
            tokio::task::spawn_blocking(move || frame.to_jpeg(SNAPSHOT_JPEG_QUALITY))
                .await
                .map_err(|e| crate::Error::Internal(format!("snapshot encoder failed: {}", e)))??
        };

        let alert = Alert {
            id: alert_id.to_string(),
            snapshot,
            title: format!("Defect - Camera {}", record.nickname),
            message: format!("Defect detected on camera {}", record.nickname),
            timestamp,
            countdown_time: record.countdown_time,
            countdown_action: record.countdown_action,
            camera_id: camera_id.to_string(),
            has_printer: record.printer_config.is_some(),
        };

        self.alerts.lock().await.insert(
            alert.id.clone(),
            ActiveAlert {
                alert: alert.clone(),
                timer: None,
            },
        );

        let countdown = Duration::from_secs_f64(alert.countdown_time.max(0.0));
        let timer = tokio::spawn({
            let manager = self.clone();
            let alert_id = alert.id.clone();
            let action = alert.countdown_action;
            async move {
                tokio::time::sleep(countdown).await;
                tracing::info!(alert_id = %alert_id, action = %action, "Alert countdown expired");
                manager.finish(&alert_id, action, false).await;
            }
        });
        // The countdown may already have resolved a zero-length alert
        if let Some(active) = self.alerts.lock().await.get_mut(&alert.id) {
            active.timer = Some(timer);
        }

        // Alerts bypass the per-type throttle so concurrent cameras are not dropped
        self.hub.publish_force(HubMessage::Alert(alert.clone()));

        tokio::spawn({
            let notifier = self.notifier.clone();
            let title = alert.title.clone();
            let message = alert.message.clone();
            async move {
                notifier.notify(&title, &message).await;
            }
        });

        tracing::info!(
            camera_id = %camera_id,
            alert_id = %alert.id,
            countdown_sec = alert.countdown_time,
            action = %alert.countdown_action,
            has_printer = alert.has_printer,
            "Defect alert raised"
        );

        Ok(alert)
    }

    /// Build the alert for a claimed `alert_id` on its own task.
    ///
    /// The claim is already set on the camera record, so creation must not be
    /// cut short by the caller being aborted. A failed creation releases the
    /// claim.
    pub fn raise(
        self: &Arc<Self>,
        camera_id: String,
        alert_id: String,
        record: CameraRecord,
        frame: Frame,
        timestamp: f64,
    ) -> JoinHandle<Option<Alert>> {
        let manager = self.clone();
        tokio::spawn(async move {
            match manager
                .create_alert(&camera_id, &alert_id, &record, &frame, timestamp)
                .await
            {
                Ok(alert) => Some(alert),
                Err(e) => {
                    tracing::error!(camera_id = %camera_id, alert_id = %alert_id, error = %e, "Failed to create alert");
                    manager.cameras.clear_alert(&camera_id, &alert_id).await;
                    None
                }
            }
        })
    }

    /// Resolve an alert with `action`; false when it is already gone
    pub async fn resolve(&self, alert_id: &str, action: AlertAction) -> bool {
        self.finish(alert_id, action, true).await
    }

    async fn finish(&self, alert_id: &str, action: AlertAction, abort_timer: bool) -> bool {
        let Some(active) = self.alerts.lock().await.remove(alert_id) else {
            tracing::debug!(alert_id = %alert_id, "Alert already resolved");
            return false;
        };

        if abort_timer {
            if let Some(timer) = active.timer {
                timer.abort();
            }
        }

        let camera_id = active.alert.camera_id;
        if action.suspends_print() {
            let printer = self
                .cameras
                .get_existing(&camera_id)
                .await
                .and_then(|record| record.printer_config);
            self.gateway
                .suspend_print_job(&camera_id, printer.as_ref(), action)
                .await;
        }

        self.cameras.clear_alert(&camera_id, alert_id).await;

        tracing::info!(camera_id = %camera_id, alert_id = %alert_id, action = %action, "Alert resolved");
        true
    }

    pub async fn get(&self, alert_id: &str) -> Option<Alert> {
        self.alerts
            .lock()
            .await
            .get(alert_id)
            .map(|active| active.alert.clone())
    }

    /// Unresolved alerts, oldest first
    pub async fn active(&self) -> Vec<Alert> {
        let mut alerts: Vec<Alert> = self
            .alerts
            .lock()
            .await
            .values()
            .map(|active| active.alert.clone())
            .collect();
        alerts.sort_by(|a, b| a.timestamp.total_cmp(&b.timestamp));
        alerts
    }

    pub async fn active_count(&self) -> usize {
        self.alerts.lock().await.len()
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Counts notifications instead of sending them
    #[derive(Default)]
    pub struct CountingNotifier {
        pub sent: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl Notifier for CountingNotifier {
        async fn notify(&self, _title: &str, _body: &str) -> usize {
            self.sent.fetch_add(1, Ordering::SeqCst);
            1
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::CountingNotifier;
    use super::*;
    use crate::camera_state::testing::temp_store;
    use crate::printer::testing::{printer_config, FakeConnector, FakePrinter};
    use crate::shared_stream::testing::FakeMode;
    use image::RgbImage;
    use std::sync::atomic::Ordering;

    struct Fixture {
        manager: Arc<AlertManager>,
        cameras: Arc<CameraStateStore>,
        printer: Arc<FakePrinter>,
        notifier: Arc<CountingNotifier>,
        _dir: tempfile::TempDir,
    }

    async fn fixture(countdown_time: f64, action: AlertAction) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let (cameras, _, _) = temp_store(&dir, FakeMode::OpenFails).await;

        let mut record = CameraRecord::new("Bench", "0");
        record.countdown_time = countdown_time;
        record.countdown_action = action;
        record.printer_config = Some(printer_config());
        cameras.insert("cam-1", record).await;

        let printer = FakePrinter::new("Printing");
        let notifier = Arc::new(CountingNotifier::default());
        let manager = AlertManager::new(
            cameras.clone(),
            Arc::new(RealtimeHub::new(Duration::ZERO)),
            notifier.clone(),
            Arc::new(PrinterGateway::new(Arc::new(FakeConnector(printer.clone())))),
        );
        Fixture {
            manager,
            cameras,
            printer,
            notifier,
            _dir: dir,
        }
    }

    async fn raise(f: &Fixture) -> Alert {
        f.cameras.append_detection("cam-1", "failure", 1.0).await;
        f.cameras.append_detection("cam-1", "failure", 2.0).await;
        let alert_id = new_alert_id("cam-1");
        let record = f
            .cameras
            .claim_alert("cam-1", &alert_id, "failure")
            .await
            .unwrap();
        let frame = Frame::new(RgbImage::new(16, 16));
        f.manager
            .create_alert("cam-1", &alert_id, &record, &frame, 2.0)
            .await
            .unwrap()
    }

    async fn current_alert(f: &Fixture) -> Option<String> {
        f.cameras.get_existing("cam-1").await.unwrap().current_alert_id
    }

    #[tokio::test]
    async fn test_alert_contents() {
        let f = fixture(60.0, AlertAction::Dismiss).await;
        let alert = raise(&f).await;

        assert!(alert.id.starts_with("cam-1_"));
        assert_eq!(alert.title, "Defect - Camera Bench");
        assert_eq!(alert.message, "Defect detected on camera Bench");
        assert!(alert.has_printer);
        assert_eq!(&alert.snapshot[..2], &[0xFF, 0xD8]);

        let json = serde_json::to_value(&alert).unwrap();
        assert_eq!(json["camera_uuid"], "cam-1");
        assert!(json["snapshot"].as_str().unwrap().starts_with("/9j/"));

        tokio::task::yield_now().await;
        assert_eq!(f.notifier.sent.load(Ordering::SeqCst), 1);
        assert_eq!(f.manager.active().await.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_countdown_dismisses() {
        let f = fixture(2.0, AlertAction::Dismiss).await;
        let alert = raise(&f).await;
        assert_eq!(current_alert(&f).await, Some(alert.id.clone()));

        tokio::time::sleep(Duration::from_millis(2100)).await;

        assert!(f.manager.get(&alert.id).await.is_none());
        assert!(current_alert(&f).await.is_none());
        assert!(f.printer.calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_explicit_dismiss_wins_over_countdown() {
        let f = fixture(2.0, AlertAction::CancelPrint).await;
        let alert = raise(&f).await;

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(f.manager.resolve(&alert.id, AlertAction::Dismiss).await);
        assert!(!f.manager.resolve(&alert.id, AlertAction::Dismiss).await);

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(f.printer.calls().is_empty());
        assert!(current_alert(&f).await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_countdown_cancels_print() {
        let f = fixture(1.0, AlertAction::CancelPrint).await;
        raise(&f).await;

        tokio::time::sleep(Duration::from_millis(1100)).await;
        assert_eq!(f.printer.calls(), vec!["cancel"]);
        assert_eq!(f.manager.active_count().await, 0);
    }

    #[tokio::test]
    async fn test_raise_completes_when_caller_goes_away() {
        let f = fixture(60.0, AlertAction::Dismiss).await;
        f.cameras.append_detection("cam-1", "failure", 1.0).await;
        f.cameras.append_detection("cam-1", "failure", 2.0).await;
        let alert_id = new_alert_id("cam-1");
        let record = f
            .cameras
            .claim_alert("cam-1", &alert_id, "failure")
            .await
            .unwrap();

        // Dropping the handle detaches the task; the alert is still built
        drop(f.manager.raise(
            "cam-1".to_string(),
            alert_id.clone(),
            record,
            Frame::new(RgbImage::new(16, 16)),
            2.0,
        ));

        for _ in 0..200 {
            if f.manager.get(&alert_id).await.is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(f.manager.get(&alert_id).await.is_some());
        assert_eq!(current_alert(&f).await, Some(alert_id));
    }

    #[tokio::test]
    async fn test_resolve_with_pause_suspends_printer() {
        let f = fixture(60.0, AlertAction::Dismiss).await;
        let alert = raise(&f).await;

        assert!(f.manager.resolve(&alert.id, AlertAction::PausePrint).await);
        assert_eq!(f.printer.calls(), vec!["pause"]);
        assert!(current_alert(&f).await.is_none());
    }
}
