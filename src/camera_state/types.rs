//! Camera record types

use crate::models::AlertAction;
use crate::printer::PrinterConfig;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Default detection history cap
pub const DEFAULT_HISTORY_CAP: usize = 10_000;

/// History entries kept in persisted snapshots
pub const PERSISTED_HISTORY_LIMIT: usize = 1_000;

/// One classified frame
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DetectionEntry {
    /// Epoch seconds
    pub timestamp: f64,
    pub label: String,
}

/// Authoritative record of one camera
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CameraRecord {
    pub nickname: String,
    /// Device path, index or URL
    pub source: String,

    pub brightness: f64,
    pub contrast: f64,
    pub focus: f64,
    pub sensitivity: f64,

    /// Seconds before an unattended alert resolves itself
    pub countdown_time: f64,
    pub countdown_action: AlertAction,
    pub majority_vote_window: usize,
    pub majority_vote_threshold: usize,

    pub live_detection_running: bool,
    pub last_result: Option<String>,
    pub last_time: Option<f64>,
    pub start_time: Option<f64>,
    pub error: Option<String>,
    pub current_alert_id: Option<String>,

    pub printer_id: Option<String>,
    pub printer_config: Option<PrinterConfig>,

    pub detection_history: VecDeque<DetectionEntry>,
}

impl Default for CameraRecord {
    fn default() -> Self {
        Self {
            nickname: String::new(),
            source: String::new(),
            brightness: 1.0,
            contrast: 1.0,
            focus: 1.0,
            sensitivity: 1.0,
            countdown_time: 60.0,
            countdown_action: AlertAction::Dismiss,
            majority_vote_window: 5,
            majority_vote_threshold: 2,
            live_detection_running: false,
            last_result: None,
            last_time: None,
            start_time: None,
            error: None,
            current_alert_id: None,
            printer_id: None,
            printer_config: None,
            detection_history: VecDeque::new(),
        }
    }
}

impl CameraRecord {
    /// Record for a newly registered camera
    pub fn new(nickname: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            nickname: nickname.into(),
            source: source.into(),
            ..Self::default()
        }
    }

    /// Append and evict the oldest entries beyond `cap`
    pub fn push_detection(&mut self, entry: DetectionEntry, cap: usize) {
        self.detection_history.push_back(entry);
        while self.detection_history.len() > cap {
            self.detection_history.pop_front();
        }
    }

    /// Clear runtime detection fields before a new run.
    ///
    /// `current_alert_id` is kept: it is released only when the alert resolves.
    pub fn reset_runtime(&mut self) {
        self.detection_history.clear();
        self.last_result = None;
        self.last_time = None;
        self.start_time = None;
        self.error = None;
    }

    /// Classifications per second across the retained history
    pub fn frame_rate(&self) -> f64 {
        let n = self.detection_history.len();
        if n < 2 {
            return 0.0;
        }
        let first = self.detection_history.front().map(|e| e.timestamp).unwrap_or(0.0);
        let last = self.detection_history.back().map(|e| e.timestamp).unwrap_or(0.0);
        let duration = last - first;
        if duration > 0.0 {
            (n - 1) as f64 / duration
        } else {
            0.0
        }
    }

    /// Copy suitable for persistence (history trimmed)
    pub fn persisted(&self) -> Self {
        let mut copy = self.clone();
        let excess = copy
            .detection_history
            .len()
            .saturating_sub(PERSISTED_HISTORY_LIMIT);
        copy.detection_history.drain(..excess);
        copy
    }
}
