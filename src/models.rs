//! Shared data models

use serde::{Deserialize, Serialize};

/// API response wrapper
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            ok: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn error(msg: impl Into<String>) -> Self {
        Self {
            ok: false,
            data: None,
            error: Some(msg.into()),
        }
    }
}

/// Health check response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub uptime_sec: u64,
    pub cameras: usize,
    pub detections_running: usize,
    pub active_alerts: usize,
    pub sse_clients: usize,
}

/// What happens to an alert when it is resolved
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum AlertAction {
    #[default]
    Dismiss,
    CancelPrint,
    PausePrint,
}

impl AlertAction {
    /// Whether the action touches the printer
    pub fn suspends_print(&self) -> bool {
        matches!(self, AlertAction::CancelPrint | AlertAction::PausePrint)
    }
}

impl std::fmt::Display for AlertAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AlertAction::Dismiss => write!(f, "dismiss"),
            AlertAction::CancelPrint => write!(f, "cancel_print"),
            AlertAction::PausePrint => write!(f, "pause_print"),
        }
    }
}

/// Current wall-clock time as epoch seconds
pub fn now_ts() -> f64 {
    chrono::Utc::now().timestamp_millis() as f64 / 1000.0
}
