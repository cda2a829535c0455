//! Camera State Store
//!
//! Owns every camera record behind one lock. Mutations publish a snapshot to
//! a single background writer that persists `camera_states` through the
//! ConfigStore; a newer snapshot replaces one the writer has not picked up yet.
//!
//! History-only appends are persisted every 100 detections.

mod types;

pub use types::*;

use crate::config_store::{keys, ConfigStore};
use crate::detection::voting::passes_majority_vote;
use crate::shared_stream::SharedStreamManager;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{watch, Mutex};

/// Appended detections between history persists
const PERSIST_EVERY_APPENDS: usize = 100;

#[derive(Default)]
struct StoreInner {
    cameras: HashMap<String, CameraRecord>,
    appends_since_persist: usize,
    /// Sequence of the newest snapshot taken
    snapshot_seq: u64,
}

/// Snapshot handed to the writer
type Snapshot = Option<(u64, Value)>;

/// Lockable map of camera records
pub struct CameraStateStore {
    inner: Mutex<StoreInner>,
    history_cap: usize,
    streams: Arc<SharedStreamManager>,
    config: Arc<ConfigStore>,
    persist_tx: watch::Sender<Snapshot>,
    /// Sequence of the newest snapshot written; writes of older ones are skipped
    written_seq: Arc<Mutex<u64>>,
}

impl CameraStateStore {
    /// Load records from the ConfigStore and start the persistence writer
    pub async fn load(
        config: Arc<ConfigStore>,
        streams: Arc<SharedStreamManager>,
        history_cap: usize,
    ) -> Arc<Self> {
        let mut cameras = HashMap::new();
        for (camera_id, raw) in config.camera_states().await {
            let mut record = match serde_json::from_value::<CameraRecord>(raw) {
                Ok(record) => record,
                Err(e) => {
                    tracing::warn!(
                        camera_id = %camera_id,
                        error = %e,
                        "Invalid persisted camera state, using defaults"
                    );
                    CameraRecord::default()
                }
            };
            // No detection task or alert survives a restart
            record.live_detection_running = false;
            record.start_time = None;
            record.current_alert_id = None;
            cameras.insert(camera_id, record);
        }

        tracing::info!(cameras = cameras.len(), "Camera states loaded");

        let (persist_tx, persist_rx) = watch::channel(None);
        let store = Arc::new(Self {
            inner: Mutex::new(StoreInner {
                cameras,
                ..StoreInner::default()
            }),
            history_cap: history_cap.max(1),
            streams,
            config: config.clone(),
            persist_tx,
            written_seq: Arc::new(Mutex::new(0)),
        });

        tokio::spawn(run_writer(persist_rx, config, store.written_seq.clone()));
        store
    }

    fn snapshot(cameras: &HashMap<String, CameraRecord>) -> Value {
        let mut map = Map::new();
        for (camera_id, record) in cameras {
            match serde_json::to_value(record.persisted()) {
                Ok(value) => {
                    map.insert(camera_id.clone(), value);
                }
                Err(e) => {
                    tracing::error!(camera_id = %camera_id, error = %e, "Failed to serialize camera state");
                }
            }
        }
        Value::Object(map)
    }

    /// Hand the latest snapshot to the writer
    fn schedule_persist(&self, inner: &mut StoreInner) {
        inner.appends_since_persist = 0;
        inner.snapshot_seq += 1;
        self.persist_tx
            .send_replace(Some((inner.snapshot_seq, Self::snapshot(&inner.cameras))));
    }

    /// Persist the current state and wait for the write (shutdown)
    pub async fn flush(&self) -> crate::Result<()> {
        let (seq, snapshot) = {
            let mut inner = self.inner.lock().await;
            inner.appends_since_persist = 0;
            inner.snapshot_seq += 1;
            (inner.snapshot_seq, Self::snapshot(&inner.cameras))
        };
        write_snapshot(&self.config, &self.written_seq, seq, snapshot).await
    }

    /// Record for `camera_id`, creating a default one if missing or `reset`
    pub async fn get(&self, camera_id: &str, reset: bool) -> CameraRecord {
        let mut inner = self.inner.lock().await;
        if reset || !inner.cameras.contains_key(camera_id) {
            inner
                .cameras
                .insert(camera_id.to_string(), CameraRecord::default());
            self.schedule_persist(&mut inner);
        }
        inner.cameras.get(camera_id).cloned().unwrap_or_default()
    }

    /// Record for `camera_id` if registered
    pub async fn get_existing(&self, camera_id: &str) -> Option<CameraRecord> {
        self.inner.lock().await.cameras.get(camera_id).cloned()
    }

    /// Register or replace a record
    pub async fn insert(&self, camera_id: &str, record: CameraRecord) {
        let mut inner = self.inner.lock().await;
        inner.cameras.insert(camera_id.to_string(), record);
        self.schedule_persist(&mut inner);
    }

    /// Merge named fields into the record, creating it if missing.
    ///
    /// Unknown field names and values of the wrong type are logged and skipped.
    pub async fn update(&self, camera_id: &str, partial: &Map<String, Value>) -> CameraRecord {
        let mut inner = self.inner.lock().await;
        let current = inner.cameras.get(camera_id).cloned().unwrap_or_default();

        let mut merged = match serde_json::to_value(&current) {
            Ok(Value::Object(map)) => map,
            _ => Map::new(),
        };

        let mut record = current;
        for (field, value) in partial {
            if !merged.contains_key(field) {
                tracing::warn!(camera_id = %camera_id, field = %field, "Unknown camera field ignored");
                continue;
            }
            let previous = merged.insert(field.clone(), value.clone());
            match serde_json::from_value::<CameraRecord>(Value::Object(merged.clone())) {
                Ok(updated) => record = updated,
                Err(e) => {
                    tracing::warn!(
                        camera_id = %camera_id,
                        field = %field,
                        error = %e,
                        "Invalid value for camera field ignored"
                    );
                    if let Some(previous) = previous {
                        merged.insert(field.clone(), previous);
                    }
                }
            }
        }

        if record.majority_vote_threshold > record.majority_vote_window {
            tracing::warn!(
                camera_id = %camera_id,
                window = record.majority_vote_window,
                threshold = record.majority_vote_threshold,
                "Majority vote threshold exceeds window; alerts will never trigger"
            );
        }

        inner.cameras.insert(camera_id.to_string(), record.clone());
        self.schedule_persist(&mut inner);
        record
    }

    /// Apply a typed mutation to an existing record
    pub async fn update_with<R>(
        &self,
        camera_id: &str,
        f: impl FnOnce(&mut CameraRecord) -> R,
    ) -> Option<R> {
        let mut inner = self.inner.lock().await;
        let result = f(inner.cameras.get_mut(camera_id)?);
        self.schedule_persist(&mut inner);
        Some(result)
    }

    /// Append a classification; returns the updated record
    pub async fn append_detection(
        &self,
        camera_id: &str,
        label: &str,
        timestamp: f64,
    ) -> Option<CameraRecord> {
        let mut inner = self.inner.lock().await;
        let cap = self.history_cap;
        let record = inner.cameras.get_mut(camera_id)?;
        record.push_detection(
            DetectionEntry {
                timestamp,
                label: label.to_string(),
            },
            cap,
        );
        record.last_result = Some(label.to_string());
        record.last_time = Some(timestamp);
        let snapshot = record.clone();

        inner.appends_since_persist += 1;
        if inner.appends_since_persist >= PERSIST_EVERY_APPENDS {
            self.schedule_persist(&mut inner);
        }
        Some(snapshot)
    }

    pub async fn list_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.inner.lock().await.cameras.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// All records, sorted by id
    pub async fn list(&self) -> Vec<(String, CameraRecord)> {
        let mut all: Vec<(String, CameraRecord)> = self
            .inner
            .lock()
            .await
            .cameras
            .iter()
            .map(|(id, record)| (id.clone(), record.clone()))
            .collect();
        all.sort_by(|a, b| a.0.cmp(&b.0));
        all
    }

    /// Remove a camera and release its shared stream
    pub async fn remove(&self, camera_id: &str) -> bool {
        let removed = {
            let mut inner = self.inner.lock().await;
            let removed = inner.cameras.remove(camera_id).is_some();
            if removed {
                self.schedule_persist(&mut inner);
            }
            removed
        };
        if removed {
            self.streams.release(camera_id).await;
            tracing::info!(camera_id = %camera_id, "Camera removed");
        }
        removed
    }

    /// Set `current_alert_id` if no alert is active and the majority vote passes.
    ///
    /// Returns the record as of the claim.
    pub async fn claim_alert(
        &self,
        camera_id: &str,
        alert_id: &str,
        defect_label: &str,
    ) -> Option<CameraRecord> {
        let mut inner = self.inner.lock().await;
        let record = inner.cameras.get_mut(camera_id)?;
        if record.current_alert_id.is_some() {
            return None;
        }
        if !passes_majority_vote(
            &record.detection_history,
            defect_label,
            record.majority_vote_window,
            record.majority_vote_threshold,
        ) {
            return None;
        }
        record.current_alert_id = Some(alert_id.to_string());
        let claimed = record.clone();
        self.schedule_persist(&mut inner);
        Some(claimed)
    }

    /// Clear `current_alert_id` if it still refers to `alert_id`
    pub async fn clear_alert(&self, camera_id: &str, alert_id: &str) -> bool {
        let mut inner = self.inner.lock().await;
        let Some(record) = inner.cameras.get_mut(camera_id) else {
            return false;
        };
        if record.current_alert_id.as_deref() != Some(alert_id) {
            return false;
        }
        record.current_alert_id = None;
        self.schedule_persist(&mut inner);
        true
    }

    #[cfg(test)]
    fn subscribe_persist(&self) -> watch::Receiver<Snapshot> {
        self.persist_tx.subscribe()
    }
}

async fn write_snapshot(
    config: &ConfigStore,
    written_seq: &Mutex<u64>,
    seq: u64,
    snapshot: Value,
) -> crate::Result<()> {
    let mut written = written_seq.lock().await;
    if seq <= *written {
        return Ok(());
    }
    config.set(keys::CAMERA_STATES, snapshot).await?;
    *written = seq;
    Ok(())
}

/// Persist snapshots until the store is dropped
async fn run_writer(
    mut rx: watch::Receiver<Snapshot>,
    config: Arc<ConfigStore>,
    written_seq: Arc<Mutex<u64>>,
) {
    while rx.changed().await.is_ok() {
        let snapshot = rx.borrow_and_update().clone();
        if let Some((seq, snapshot)) = snapshot {
            if let Err(e) = write_snapshot(&config, &written_seq, seq, snapshot).await {
                tracing::error!(error = %e, "Failed to persist camera states");
            }
        }
    }
    tracing::debug!("Camera state writer stopped");
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::config_store::ConfigRepository;
    use crate::shared_stream::testing::{fast_config, FakeBackend, FakeMode};

    /// Store backed by a temp-dir config file
    pub async fn temp_store(
        dir: &tempfile::TempDir,
        mode: FakeMode,
    ) -> (Arc<CameraStateStore>, Arc<ConfigStore>, Arc<SharedStreamManager>) {
        let repo = ConfigRepository::new(dir.path());
        repo.init().await.unwrap();
        let config = Arc::new(ConfigStore::new(Arc::new(repo)).await.unwrap());
        let streams = Arc::new(SharedStreamManager::with_config(
            FakeBackend::new(mode),
            fast_config(),
        ));
        let store = CameraStateStore::load(config.clone(), streams.clone(), DEFAULT_HISTORY_CAP).await;
        (store, config, streams)
    }
}

#[cfg(test)]
mod tests {
    use super::testing::temp_store;
    use super::*;
    use crate::shared_stream::testing::FakeMode;
    use serde_json::json;
    use std::time::Duration;

    fn frames() -> FakeMode {
        FakeMode::Frames(Duration::from_millis(5))
    }

    #[tokio::test]
    async fn test_get_creates_and_resets() {
        let dir = tempfile::tempdir().unwrap();
        let (store, _, _) = temp_store(&dir, frames()).await;

        store.insert("cam-1", CameraRecord::new("Bench", "0")).await;
        assert_eq!(store.get("cam-1", false).await.nickname, "Bench");
        assert_eq!(store.get("cam-1", true).await.nickname, "");
        assert_eq!(store.get("cam-2", false).await.majority_vote_window, 5);
        assert_eq!(store.list_ids().await, vec!["cam-1", "cam-2"]);
    }

    #[tokio::test]
    async fn test_update_merges_known_fields_only() {
        let dir = tempfile::tempdir().unwrap();
        let (store, _, _) = temp_store(&dir, frames()).await;
        store.insert("cam-1", CameraRecord::new("Bench", "0")).await;

        let partial = json!({
            "sensitivity": 1.4,
            "countdown_action": "pause_print",
            "majority_vote_window": "wide",
            "not_a_field": true
        });
        let record = store
            .update("cam-1", partial.as_object().unwrap())
            .await;

        assert_eq!(record.sensitivity, 1.4);
        assert_eq!(record.countdown_action, crate::models::AlertAction::PausePrint);
        assert_eq!(record.majority_vote_window, 5);
        assert_eq!(record.nickname, "Bench");
    }

    #[tokio::test]
    async fn test_history_is_capped() {
        let dir = tempfile::tempdir().unwrap();
        let repo = crate::config_store::ConfigRepository::new(dir.path());
        repo.init().await.unwrap();
        let config = Arc::new(ConfigStore::new(Arc::new(repo)).await.unwrap());
        let streams = Arc::new(SharedStreamManager::with_config(
            crate::shared_stream::testing::FakeBackend::new(frames()),
            crate::shared_stream::testing::fast_config(),
        ));
        let store = CameraStateStore::load(config, streams, 5).await;
        store.insert("cam-1", CameraRecord::default()).await;

        for i in 0..7 {
            store.append_detection("cam-1", "success", i as f64).await;
        }

        let record = store.get("cam-1", false).await;
        let stamps: Vec<f64> = record.detection_history.iter().map(|e| e.timestamp).collect();
        assert_eq!(stamps, vec![2.0, 3.0, 4.0, 5.0, 6.0]);
        assert_eq!(record.last_time, Some(6.0));
    }

    #[tokio::test]
    async fn test_appends_persist_every_hundred() {
        let dir = tempfile::tempdir().unwrap();
        let (store, _, _) = temp_store(&dir, frames()).await;
        store.insert("cam-1", CameraRecord::default()).await;

        let mut rx = store.subscribe_persist();
        for i in 0..99 {
            store.append_detection("cam-1", "success", i as f64).await;
        }
        assert!(!rx.has_changed().unwrap());

        store.append_detection("cam-1", "success", 99.0).await;
        assert!(rx.has_changed().unwrap());
    }

    #[tokio::test]
    async fn test_claim_alert_is_exclusive() {
        let dir = tempfile::tempdir().unwrap();
        let (store, _, _) = temp_store(&dir, frames()).await;
        store.insert("cam-1", CameraRecord::default()).await;

        // one defect is below the default threshold of 2
        store.append_detection("cam-1", "failure", 1.0).await;
        assert!(store.claim_alert("cam-1", "cam-1_a", "failure").await.is_none());

        store.append_detection("cam-1", "failure", 2.0).await;
        assert!(store.claim_alert("cam-1", "cam-1_a", "failure").await.is_some());
        assert!(store.claim_alert("cam-1", "cam-1_b", "failure").await.is_none());

        assert!(!store.clear_alert("cam-1", "cam-1_b").await);
        assert!(store.clear_alert("cam-1", "cam-1_a").await);
        assert!(store.claim_alert("cam-1", "cam-1_b", "failure").await.is_some());
    }

    #[tokio::test]
    async fn test_state_survives_reload() {
        let dir = tempfile::tempdir().unwrap();
        let (store, config, streams) = temp_store(&dir, frames()).await;

        let mut record = CameraRecord::new("Prusa", "/dev/video0");
        record.live_detection_running = true;
        record.current_alert_id = Some("cam-1_x".to_string());
        store.insert("cam-1", record).await;
        store.append_detection("cam-1", "success", 5.0).await;
        store.flush().await.unwrap();

        config.refresh_cache().await.unwrap();
        let reloaded = CameraStateStore::load(config, streams, DEFAULT_HISTORY_CAP).await;
        let record = reloaded.get_existing("cam-1").await.unwrap();
        assert_eq!(record.nickname, "Prusa");
        assert_eq!(record.detection_history.len(), 1);
        assert!(!record.live_detection_running);
        assert!(record.current_alert_id.is_none());
    }

    #[tokio::test]
    async fn test_remove_releases_stream() {
        let dir = tempfile::tempdir().unwrap();
        let (store, _, streams) = temp_store(&dir, frames()).await;
        store.insert("cam-1", CameraRecord::new("Bench", "0")).await;
        streams.acquire("cam-1", "0").await;

        assert!(store.remove("cam-1").await);
        assert!(!store.remove("cam-1").await);
        assert_eq!(streams.stream_count().await, 0);
        assert!(store.get_existing("cam-1").await.is_none());
    }
}
