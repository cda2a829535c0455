//! OctoPrint REST client

use super::{JobInfo, PrinterControl, PrinterTemperatures};
use crate::error::{Error, Result};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use std::collections::HashMap;
use std::time::Duration;

#[derive(Debug, Deserialize)]
struct TemperatureReading {
    actual: Option<f64>,
    target: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct PrinterResponse {
    #[serde(default)]
    temperature: HashMap<String, TemperatureReading>,
}

/// OctoPrint client authenticated with `X-Api-Key`
pub struct OctoPrintClient {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl OctoPrintClient {
    pub fn new(base_url: String, api_key: String) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_default();

        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn job_command(&self, body: serde_json::Value) -> Result<()> {
        let resp = self
            .client
            .post(self.url("/api/job"))
            .header("X-Api-Key", &self.api_key)
            .json(&body)
            .send()
            .await?;

        if !resp.status().is_success() {
            return Err(Error::Printer(format!(
                "job command {} failed: {}",
                body["command"],
                resp.status()
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl PrinterControl for OctoPrintClient {
    async fn job_info(&self) -> Result<JobInfo> {
        let resp = self
            .client
            .get(self.url("/api/job"))
            .header("X-Api-Key", &self.api_key)
            .send()
            .await?;

        if !resp.status().is_success() {
            return Err(Error::Printer(format!("job info failed: {}", resp.status())));
        }
        Ok(resp.json().await?)
    }

    async fn cancel_job(&self) -> Result<()> {
        self.job_command(json!({"command": "cancel"})).await
    }

    async fn pause_job(&self) -> Result<()> {
        self.job_command(json!({"command": "pause", "action": "pause"}))
            .await
    }

    async fn temperatures(&self) -> Result<PrinterTemperatures> {
        let resp = self
            .client
            .get(self.url("/api/printer"))
            .header("X-Api-Key", &self.api_key)
            .send()
            .await?;

        if !resp.status().is_success() {
            return Err(Error::Printer(format!(
                "printer state failed: {}",
                resp.status()
            )));
        }
        let body: PrinterResponse = resp.json().await?;
        Ok(temperatures_from(&body))
    }
}

fn temperatures_from(body: &PrinterResponse) -> PrinterTemperatures {
    let tool = body.temperature.get("tool0");
    let bed = body.temperature.get("bed");
    PrinterTemperatures {
        nozzle_actual: tool.and_then(|t| t.actual),
        nozzle_target: tool.and_then(|t| t.target),
        bed_actual: bed.and_then(|b| b.actual),
        bed_target: bed.and_then(|b| b.target),
    }
}
