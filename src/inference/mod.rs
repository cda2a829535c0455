//! Inference - defect classification backends
//!
//! ## Responsibilities
//!
//! - Backend abstraction (`InferenceEngine`)
//! - Prototype matching with per-camera sensitivity
//! - Class name / defect label mapping
//! - Backend selection at startup

mod http;

pub use http::HttpInferenceEngine;

use crate::error::{Error, Result};
use crate::frame_source::Frame;
use async_trait::async_trait;
use std::sync::Arc;

/// Per-call classification context
#[derive(Debug, Clone, Copy)]
pub struct PriorStats {
    pub sensitivity: f64,
    pub defect_idx: usize,
}

/// Classification result
#[derive(Debug, Clone, PartialEq)]
pub struct Prediction {
    pub class_index: usize,
    /// Distance from the frame embedding to each class prototype
    pub distances: Vec<f64>,
}

/// Defect classifier backend
#[async_trait]
pub trait InferenceEngine: Send + Sync {
    async fn predict(&self, frame: &Frame, prior: &PriorStats) -> Result<Prediction>;

    /// Backend name for logs
    fn name(&self) -> &'static str;
}

/// Nearest-prototype classification biased toward the defect class.
///
/// A non-defect winner is overridden when the defect prototype is within
/// `sensitivity` times the winning distance.
pub fn classify(distances: &[f64], defect_idx: usize, sensitivity: f64) -> Result<usize> {
    let (winner, min_dist) = distances
        .iter()
        .copied()
        .enumerate()
        .filter(|(_, d)| !d.is_nan())
        .min_by(|a, b| a.1.total_cmp(&b.1))
        .ok_or_else(|| Error::Inference("no prototype distances".to_string()))?;

    if winner == defect_idx {
        return Ok(winner);
    }
    match distances.get(defect_idx) {
        Some(&dist_to_defect) if dist_to_defect <= min_dist * sensitivity => Ok(defect_idx),
        _ => Ok(winner),
    }
}

/// Ordered class names and the defect class
#[derive(Debug, Clone)]
pub struct ClassNames {
    names: Vec<String>,
    defect_idx: usize,
}

impl ClassNames {
    pub fn new(names: Vec<String>, defect_label: &str) -> Result<Self> {
        let defect_idx = names
            .iter()
            .position(|n| n == defect_label)
            .ok_or_else(|| {
                Error::Config(format!(
                    "defect label '{}' is not one of {:?}",
                    defect_label, names
                ))
            })?;
        Ok(Self { names, defect_idx })
    }

    pub fn defect_idx(&self) -> usize {
        self.defect_idx
    }

    pub fn defect_label(&self) -> &str {
        &self.names[self.defect_idx]
    }

    /// Label for a class index; out-of-range indexes render as the number
    pub fn label(&self, class_index: usize) -> String {
        self.names
            .get(class_index)
            .cloned()
            .unwrap_or_else(|| class_index.to_string())
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

impl Default for ClassNames {
    fn default() -> Self {
        Self {
            names: vec!["failure".to_string(), "success".to_string()],
            defect_idx: 0,
        }
    }
}

/// Fixed-class backend for dry runs
pub struct StubInferenceEngine {
    class_index: usize,
    classes: usize,
}

impl StubInferenceEngine {
    pub fn new(class_index: usize, classes: usize) -> Self {
        Self {
            class_index,
            classes: classes.max(class_index + 1),
        }
    }
}

#[async_trait]
impl InferenceEngine for StubInferenceEngine {
    async fn predict(&self, _frame: &Frame, _prior: &PriorStats) -> Result<Prediction> {
        let distances = (0..self.classes)
            .map(|i| if i == self.class_index { 0.0 } else { 1.0 })
            .collect();
        Ok(Prediction {
            class_index: self.class_index,
            distances,
        })
    }

    fn name(&self) -> &'static str {
        "stub"
    }
}

/// Backend selection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InferenceBackend {
    Http { url: String },
    /// Always predicts the named class
    Stub { label: String },
}

/// Build the configured engine once at startup
pub fn build_engine(
    backend: &InferenceBackend,
    classes: &ClassNames,
) -> Result<Arc<dyn InferenceEngine>> {
    let engine: Arc<dyn InferenceEngine> = match backend {
        InferenceBackend::Http { url } => Arc::new(HttpInferenceEngine::new(url.clone())),
        InferenceBackend::Stub { label } => {
            let index = classes
                .names
                .iter()
                .position(|n| n == label)
                .ok_or_else(|| Error::Config(format!("stub label '{}' is not a class", label)))?;
            Arc::new(StubInferenceEngine::new(index, classes.len()))
        }
    };
    tracing::info!(backend = engine.name(), "Inference engine ready");
    Ok(engine)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::RgbImage;

    #[test]
    fn test_classify_argmin() {
        assert_eq!(classify(&[0.9, 0.2], 0, 1.0).unwrap(), 1);
        assert_eq!(classify(&[0.1, 0.4], 0, 1.0).unwrap(), 0);
    }

    #[test]
    fn test_classify_applies_sensitivity() {
        // defect at 0.25 vs winner 0.2: within 1.3x but not 1.1x
        assert_eq!(classify(&[0.25, 0.2], 0, 1.3).unwrap(), 0);
        assert_eq!(classify(&[0.25, 0.2], 0, 1.1).unwrap(), 1);
    }

    #[test]
    fn test_classify_rejects_empty() {
        assert!(classify(&[], 0, 1.0).is_err());
    }

    #[test]
    fn test_class_names() {
        let names = ClassNames::new(vec!["ok".into(), "spaghetti".into()], "spaghetti").unwrap();
        assert_eq!(names.defect_idx(), 1);
        assert_eq!(names.label(0), "ok");
        assert_eq!(names.label(7), "7");
        assert!(ClassNames::new(vec!["ok".into()], "spaghetti").is_err());
    }

    #[tokio::test]
    async fn test_stub_engine_predicts_fixed_class() {
        let classes = ClassNames::default();
        let engine = build_engine(
            &InferenceBackend::Stub {
                label: "success".into(),
            },
            &classes,
        )
        .unwrap();
        let frame = Frame::new(RgbImage::new(4, 4));
        let prior = PriorStats {
            sensitivity: 1.0,
            defect_idx: classes.defect_idx(),
        };
        let prediction = engine.predict(&frame, &prior).await.unwrap();
        assert_eq!(prediction.class_index, 1);
        assert_eq!(prediction.distances, vec![1.0, 0.0]);
    }
}
