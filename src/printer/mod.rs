//! Printer capability
//!
//! ## Responsibilities
//!
//! - Printer binding types stored on the camera record
//! - `PrinterControl` abstraction over a printer REST API (OctoPrint)
//! - Alert-driven job suspension (`PrinterGateway`)
//! - Periodic printer state polling (`PrinterMonitor`)

mod monitor;
mod octoprint;

pub use monitor::PrinterMonitor;
pub use octoprint::OctoPrintClient;

use crate::error::Result;
use crate::models::AlertAction;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Supported printer APIs
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum PrinterType {
    #[default]
    Octoprint,
}

/// Printer bound to a camera
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PrinterConfig {
    pub name: String,
    #[serde(default)]
    pub printer_type: PrinterType,
    pub base_url: String,
    pub api_key: String,
}

/// Job progress as reported by the printer
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Progress {
    pub completion: Option<f64>,
    pub filepos: Option<u64>,
    pub print_time: Option<u64>,
    pub print_time_left: Option<u64>,
}

/// Current job
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobInfo {
    #[serde(default)]
    pub job: serde_json::Value,
    #[serde(default)]
    pub progress: Option<Progress>,
    pub state: String,
    #[serde(default)]
    pub error: Option<String>,
}

/// Coarse job state
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobState {
    Printing,
    Other(String),
}

impl From<&JobInfo> for JobState {
    fn from(info: &JobInfo) -> Self {
        if info.state == "Printing" {
            JobState::Printing
        } else {
            JobState::Other(info.state.clone())
        }
    }
}

/// Nozzle and bed temperatures
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PrinterTemperatures {
    pub nozzle_actual: Option<f64>,
    pub nozzle_target: Option<f64>,
    pub bed_actual: Option<f64>,
    pub bed_target: Option<f64>,
}

/// Snapshot published as a `printer_state` event
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PrinterState {
    pub job_info: Option<JobInfo>,
    pub temperatures: Option<PrinterTemperatures>,
}

/// Printer REST operations
#[async_trait]
pub trait PrinterControl: Send + Sync {
    async fn job_info(&self) -> Result<JobInfo>;

    async fn cancel_job(&self) -> Result<()>;

    async fn pause_job(&self) -> Result<()>;

    async fn temperatures(&self) -> Result<PrinterTemperatures>;

    async fn job_state(&self) -> Result<JobState> {
        Ok(JobState::from(&self.job_info().await?))
    }

    /// Cancel or pause according to the alert action; dismiss does nothing
    async fn suspend(&self, action: AlertAction) -> Result<()> {
        match action {
            AlertAction::CancelPrint => self.cancel_job().await,
            AlertAction::PausePrint => self.pause_job().await,
            AlertAction::Dismiss => Ok(()),
        }
    }

    /// Job and temperatures; a failing half is left empty
    async fn printer_state(&self) -> Result<PrinterState> {
        let job_info = self.job_info().await?;
        let temperatures = match self.temperatures().await {
            Ok(t) => Some(t),
            Err(e) => {
                tracing::debug!(error = %e, "Printer temperatures unavailable");
                None
            }
        };
        Ok(PrinterState {
            job_info: Some(job_info),
            temperatures,
        })
    }
}

/// Builds clients for printer bindings
pub trait PrinterConnector: Send + Sync {
    fn connect(&self, config: &PrinterConfig) -> Arc<dyn PrinterControl>;
}

/// Connector for real printers
#[derive(Debug, Default)]
pub struct HttpPrinterConnector;

impl PrinterConnector for HttpPrinterConnector {
    fn connect(&self, config: &PrinterConfig) -> Arc<dyn PrinterControl> {
        match config.printer_type {
            PrinterType::Octoprint => Arc::new(OctoPrintClient::new(
                config.base_url.clone(),
                config.api_key.clone(),
            )),
        }
    }
}

/// Suspends print jobs on alert resolution
pub struct PrinterGateway {
    connector: Arc<dyn PrinterConnector>,
}

impl PrinterGateway {
    pub fn new(connector: Arc<dyn PrinterConnector>) -> Self {
        Self { connector }
    }

    pub fn connector(&self) -> Arc<dyn PrinterConnector> {
        self.connector.clone()
    }

    /// Pause or cancel the bound printer's job.
    ///
    /// Returns true when the job was suspended or nothing was printing,
    /// false on a missing binding or a client error.
    pub async fn suspend_print_job(
        &self,
        camera_id: &str,
        config: Option<&PrinterConfig>,
        action: AlertAction,
    ) -> bool {
        let Some(config) = config else {
            tracing::warn!(camera_id = %camera_id, "No printer bound, cannot suspend job");
            return false;
        };
        let client = self.connector.connect(config);

        match client.job_state().await {
            Ok(JobState::Printing) => {}
            Ok(JobState::Other(state)) => {
                tracing::debug!(camera_id = %camera_id, state = %state, "Printer not printing, nothing to suspend");
                return true;
            }
            Err(e) => {
                tracing::error!(camera_id = %camera_id, printer = %config.name, error = %e, "Failed to read job state");
                return false;
            }
        }

        match client.suspend(action).await {
            Ok(()) => {
                tracing::info!(
                    camera_id = %camera_id,
                    printer = %config.name,
                    action = %action,
                    "Print job suspended"
                );
                true
            }
            Err(e) => {
                tracing::error!(
                    camera_id = %camera_id,
                    printer = %config.name,
                    action = %action,
                    error = %e,
                    "Failed to suspend print job"
                );
                false
            }
        }
    }
}
