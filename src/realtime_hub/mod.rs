//! RealtimeHub - SSE Distribution
//!
//! ## Responsibilities
//!
//! - Client connection management
//! - Single ordered outbound queue with one drain loop
//! - Per-event-type throttling (drop when the last enqueued event of the
//!   same type is newer than the minimum dispatch interval)
//!
//! Wire format of every event: `{"event": <type>, "data": <payload>}`

use crate::alert_manager::Alert;
use crate::camera_state::CameraRecord;
use crate::printer::PrinterState;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::time::Instant;
use uuid::Uuid;

/// Hub message types
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", content = "data")]
#[serde(rename_all = "snake_case")]
pub enum HubMessage {
    Alert(Alert),
    CameraState(CameraStateMessage),
    PrinterState(PrinterStateMessage),
}

/// Throttle key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Alert,
    CameraState,
    PrinterState,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Alert => "alert",
            EventKind::CameraState => "camera_state",
            EventKind::PrinterState => "printer_state",
        }
    }
}

impl HubMessage {
    pub fn kind(&self) -> EventKind {
        match self {
            HubMessage::Alert(_) => EventKind::Alert,
            HubMessage::CameraState(_) => EventKind::CameraState,
            HubMessage::PrinterState(_) => EventKind::PrinterState,
        }
    }
}

/// Camera detection status
#[derive(Debug, Clone, Serialize)]
pub struct CameraStateMessage {
    pub camera_uuid: String,
    pub start_time: Option<f64>,
    pub last_result: Option<String>,
    pub last_time: Option<f64>,
    pub total_detections: usize,
    pub frame_rate: f64,
    pub error: Option<String>,
    pub live_detection_running: bool,
}

impl CameraStateMessage {
    pub fn from_record(camera_id: &str, record: &CameraRecord) -> Self {
        Self {
            camera_uuid: camera_id.to_string(),
            start_time: record.start_time,
            last_result: record.last_result.clone(),
            last_time: record.last_time,
            total_detections: record.detection_history.len(),
            frame_rate: record.frame_rate(),
            error: record.error.clone(),
            live_detection_running: record.live_detection_running,
        }
    }
}

/// Printer status for the printer bound to a camera
#[derive(Debug, Clone, Serialize)]
pub struct PrinterStateMessage {
    pub camera_uuid: String,
    #[serde(flatten)]
    pub state: PrinterState,
}

/// Client connection
struct ClientConnection {
    id: Uuid,
    tx: mpsc::UnboundedSender<String>,
}

/// RealtimeHub instance
pub struct RealtimeHub {
    connections: RwLock<HashMap<Uuid, ClientConnection>>,
    connection_count: AtomicU64,
    queue_tx: mpsc::UnboundedSender<HubMessage>,
    queue_rx: Mutex<Option<mpsc::UnboundedReceiver<HubMessage>>>,
    /// Last enqueue time per event type
    last_enqueued: std::sync::Mutex<HashMap<EventKind, Instant>>,
    min_dispatch_interval_ms: AtomicU64,
}

impl RealtimeHub {
    /// Create new RealtimeHub
    pub fn new(min_dispatch_interval: Duration) -> Self {
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        Self {
            connections: RwLock::new(HashMap::new()),
            connection_count: AtomicU64::new(0),
            queue_tx,
            queue_rx: Mutex::new(Some(queue_rx)),
            last_enqueued: std::sync::Mutex::new(HashMap::new()),
            min_dispatch_interval_ms: AtomicU64::new(min_dispatch_interval.as_millis() as u64),
        }
    }

    pub fn min_dispatch_interval(&self) -> Duration {
        Duration::from_millis(self.min_dispatch_interval_ms.load(Ordering::Relaxed))
    }

    pub fn set_min_dispatch_interval(&self, interval: Duration) {
        self.min_dispatch_interval_ms
            .store(interval.as_millis() as u64, Ordering::Relaxed);
    }

    /// Register a new client
    pub async fn register(&self) -> (Uuid, mpsc::UnboundedReceiver<String>) {
        let id = Uuid::new_v4();
        let (tx, rx) = mpsc::unbounded_channel();

        {
            let mut connections = self.connections.write().await;
            connections.insert(id, ClientConnection { id, tx });
        }

        self.connection_count.fetch_add(1, Ordering::Relaxed);

        tracing::info!(connection_id = %id, "Client connected");

        (id, rx)
    }

    /// Unregister a client
    pub async fn unregister(&self, id: &Uuid) {
        let mut connections = self.connections.write().await;
        if connections.remove(id).is_some() {
            self.connection_count.fetch_sub(1, Ordering::Relaxed);
            tracing::info!(connection_id = %id, "Client disconnected");
        }
    }

    /// Enqueue unless an event of the same type was enqueued within the
    /// minimum dispatch interval. Returns whether it was enqueued.
    pub fn publish(&self, message: HubMessage) -> bool {
        let kind = message.kind();
        let now = Instant::now();
        let min_interval = self.min_dispatch_interval();

        {
            let Ok(mut last) = self.last_enqueued.lock() else {
                return false;
            };
            if let Some(prev) = last.get(&kind) {
                let since = now.duration_since(*prev);
                if since < min_interval {
                    tracing::debug!(
                        event = kind.as_str(),
                        since_ms = since.as_millis() as u64,
                        "Throttling event dispatch"
                    );
                    return false;
                }
            }
            last.insert(kind, now);
        }

        self.enqueue(message)
    }

    /// Enqueue regardless of throttling and refresh the type's timestamp
    pub fn publish_force(&self, message: HubMessage) -> bool {
        let kind = message.kind();
        if let Ok(mut last) = self.last_enqueued.lock() {
            last.insert(kind, Instant::now());
        }
        self.enqueue(message)
    }

    /// Forget the throttle timestamp of one event type
    pub fn reset_throttle(&self, kind: EventKind) {
        if let Ok(mut last) = self.last_enqueued.lock() {
            if last.remove(&kind).is_some() {
                tracing::debug!(event = kind.as_str(), "Reset throttle");
            }
        }
    }

    fn enqueue(&self, message: HubMessage) -> bool {
        if let Err(e) = self.queue_tx.send(message) {
            tracing::error!(error = %e, "Outbound queue closed");
            return false;
        }
        true
    }

    /// Drain the outbound queue, broadcasting each event in order.
    ///
    /// Only the first caller drains; later calls return immediately.
    pub async fn run_dispatch(&self) {
        let Some(mut rx) = self.queue_rx.lock().await.take() else {
            tracing::warn!("Dispatch loop already running");
            return;
        };

        tracing::info!("Event dispatch loop started");
        while let Some(message) = rx.recv().await {
            self.broadcast(&message).await;
        }
    }

    /// Broadcast message to all clients; dead clients are pruned
    pub async fn broadcast(&self, message: &HubMessage) {
        let json = match serde_json::to_string(message) {
            Ok(j) => j,
            Err(e) => {
                tracing::error!(error = %e, "Failed to serialize message");
                return;
            }
        };

        let dead: Vec<Uuid> = {
            let connections = self.connections.read().await;
            tracing::debug!(
                event = message.kind().as_str(),
                client_count = connections.len(),
                "Sending to connected clients"
            );
            connections
                .values()
                .filter(|conn| conn.tx.send(json.clone()).is_err())
                .map(|conn| conn.id)
                .collect()
        };

        for id in dead {
            tracing::warn!(connection_id = %id, "Dropping unreachable client");
            self.unregister(&id).await;
        }
    }

    /// Get connection count
    pub fn connection_count(&self) -> u64 {
        self.connection_count.load(Ordering::Relaxed)
    }
}

impl Default for RealtimeHub {
    fn default() -> Self {
        Self::new(Duration::from_millis(100))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tokio::time::timeout;

    fn camera_event(camera_id: &str) -> HubMessage {
        HubMessage::CameraState(CameraStateMessage::from_record(
            camera_id,
            &CameraRecord::default(),
        ))
    }

    fn printer_event() -> HubMessage {
        HubMessage::PrinterState(PrinterStateMessage {
            camera_uuid: "cam-1".to_string(),
            state: PrinterState::default(),
        })
    }

    async fn next(rx: &mut mpsc::UnboundedReceiver<String>) -> Option<String> {
        timeout(Duration::from_secs(1), rx.recv()).await.ok().flatten()
    }

    #[tokio::test(start_paused = true)]
    async fn test_throttle_drops_close_events() {
        let hub = Arc::new(RealtimeHub::new(Duration::from_millis(100)));
        let (_id, mut rx) = hub.register().await;
        tokio::spawn({
            let hub = hub.clone();
            async move { hub.run_dispatch().await }
        });

        assert!(hub.publish(camera_event("a")));
        tokio::time::advance(Duration::from_millis(10)).await;
        assert!(!hub.publish(camera_event("b")));

        assert!(next(&mut rx).await.unwrap().contains("\"camera_uuid\":\"a\""));
        assert!(next(&mut rx).await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_spaced_events_both_delivered() {
        let hub = Arc::new(RealtimeHub::new(Duration::from_millis(100)));
        let (_id, mut rx) = hub.register().await;
        tokio::spawn({
            let hub = hub.clone();
            async move { hub.run_dispatch().await }
        });

        assert!(hub.publish(camera_event("a")));
        tokio::time::advance(Duration::from_millis(150)).await;
        assert!(hub.publish(camera_event("b")));

        assert!(next(&mut rx).await.unwrap().contains("\"camera_uuid\":\"a\""));
        assert!(next(&mut rx).await.unwrap().contains("\"camera_uuid\":\"b\""));
    }

    #[tokio::test(start_paused = true)]
    async fn test_throttle_is_per_type() {
        let hub = RealtimeHub::new(Duration::from_millis(100));
        assert!(hub.publish(camera_event("a")));
        assert!(hub.publish(printer_event()));
        assert!(!hub.publish(printer_event()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_force_and_reset() {
        let hub = RealtimeHub::new(Duration::from_millis(100));
        assert!(hub.publish_force(camera_event("a")));
        // force refreshed the timestamp
        assert!(!hub.publish(camera_event("b")));

        hub.reset_throttle(EventKind::CameraState);
        assert!(hub.publish(camera_event("c")));
        assert!(hub.publish_force(camera_event("d")));
    }

    #[tokio::test]
    async fn test_dead_client_pruned() {
        let hub = RealtimeHub::new(Duration::ZERO);
        let (_alive_id, mut alive) = hub.register().await;
        let (_dead_id, dead) = hub.register().await;
        drop(dead);

        hub.broadcast(&camera_event("a")).await;

        assert!(alive.recv().await.is_some());
        assert_eq!(hub.connection_count(), 1);
    }

    #[test]
    fn test_wire_format() {
        let json = serde_json::to_value(camera_event("cam-9")).unwrap();
        assert_eq!(json["event"], "camera_state");
        assert_eq!(json["data"]["camera_uuid"], "cam-9");
        assert_eq!(json["data"]["total_detections"], 0);

        let json = serde_json::to_value(printer_event()).unwrap();
        assert_eq!(json["event"], "printer_state");
        assert!(json["data"].get("job_info").is_some());
    }
}
