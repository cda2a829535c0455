//! HTTP model-server backend
//!
//! POSTs the frame as JPEG (multipart `image`) to `{base_url}/v1/distances`
//! and expects `{"distances": [f64, ...]}` ordered like the class names.

use super::{classify, InferenceEngine, Prediction, PriorStats};
use crate::error::{Error, Result};
use crate::frame_source::Frame;
use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use serde::Deserialize;
use std::time::Duration;

/// JPEG quality for frames sent to the model server
const UPLOAD_JPEG_QUALITY: u8 = 90;

#[derive(Debug, Deserialize)]
struct DistancesResponse {
    distances: Vec<f64>,
}

/// Remote inference client
pub struct HttpInferenceEngine {
    client: reqwest::Client,
    base_url: String,
}

impl HttpInferenceEngine {
    /// Create new client
    pub fn new(base_url: String) -> Self {
        Self::with_timeout(base_url, Duration::from_secs(10))
    }

    /// Create new client with custom timeout
    pub fn with_timeout(base_url: String, timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_default();

        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl InferenceEngine for HttpInferenceEngine {
    async fn predict(&self, frame: &Frame, prior: &PriorStats) -> Result<Prediction> {
        let url = format!("{}/v1/distances", self.base_url);

        let jpeg = frame.to_jpeg(UPLOAD_JPEG_QUALITY)?;
        let form = Form::new().part(
            "image",
            Part::bytes(jpeg)
                .file_name("frame.jpg")
                .mime_str("image/jpeg")?,
        );

        let resp = self.client.post(&url).multipart(form).send().await?;

        if !resp.status().is_success() {
            return Err(Error::Inference(format!(
                "model server returned {}",
                resp.status()
            )));
        }

        let body: DistancesResponse = resp.json().await?;
        let class_index = classify(&body.distances, prior.defect_idx, prior.sensitivity)?;

        Ok(Prediction {
            class_index,
            distances: body.distances,
        })
    }

    fn name(&self) -> &'static str {
        "http"
    }
}
