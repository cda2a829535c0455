//! Printer state polling
//!
//! One task per camera with a bound printer, publishing `printer_state`
//! events at the configured polling rate.

use super::{PrinterConfig, PrinterConnector};
use crate::realtime_hub::{HubMessage, PrinterStateMessage, RealtimeHub};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

pub struct PrinterMonitor {
    connector: Arc<dyn PrinterConnector>,
    hub: Arc<RealtimeHub>,
    tasks: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl PrinterMonitor {
    pub fn new(connector: Arc<dyn PrinterConnector>, hub: Arc<RealtimeHub>) -> Self {
        Self {
            connector,
            hub,
            tasks: Mutex::new(HashMap::new()),
        }
    }

    /// Start (or restart) polling for a camera's printer
    pub async fn start(&self, camera_id: &str, config: &PrinterConfig, interval: Duration) {
        let client = self.connector.connect(config);
        let hub = self.hub.clone();
        let camera_uuid = camera_id.to_string();
        let interval = interval.max(Duration::from_millis(100));

        let handle = tokio::spawn(async move {
            loop {
                match client.printer_state().await {
                    Ok(state) => {
                        hub.publish(HubMessage::PrinterState(PrinterStateMessage {
                            camera_uuid: camera_uuid.clone(),
                            state,
                        }));
                    }
                    Err(e) => {
                        tracing::warn!(camera_id = %camera_uuid, error = %e, "Error polling printer state");
                    }
                }
                tokio::time::sleep(interval).await;
            }
        });

        if let Some(previous) = self.tasks.lock().await.insert(camera_id.to_string(), handle) {
            previous.abort();
        }
        tracing::debug!(
            camera_id = %camera_id,
            printer = %config.name,
            interval_ms = interval.as_millis() as u64,
            "Started printer state polling"
        );
    }

    /// Stop polling; returns whether a task was running
    pub async fn stop(&self, camera_id: &str) -> bool {
        match self.tasks.lock().await.remove(camera_id) {
            Some(handle) => {
                handle.abort();
                tracing::debug!(camera_id = %camera_id, "Stopped printer state polling");
                true
            }
            None => false,
        }
    }

    pub async fn stop_all(&self) {
        let mut tasks = self.tasks.lock().await;
        for (_, handle) in tasks.drain() {
            handle.abort();
        }
    }

    pub async fn is_polling(&self, camera_id: &str) -> bool {
        self.tasks.lock().await.contains_key(camera_id)
    }
}
