use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Context, Result};
use image::RgbImage;

use crate::detect::backend::{
    DetectionCapability, DetectorBackend, PredictConfig, ValidationConfig,
};
use crate::detect::result::{Detection, Prediction, ValidationMetrics};
use crate::metrics::keys;
use crate::train::TrainConfig;

/// Calls observed by a `StubBackend`, shared with the test that created it.
#[derive(Debug, Default)]
pub struct StubCalls {
    pub validations: Vec<ValidationConfig>,
    pub predictions: Vec<PredictConfig>,
    pub trainings: Vec<TrainConfig>,
}

/// In-process backend for tests and dry runs.
///
/// Reports fixed metrics, detects one object covering the centre of every
/// image and writes a placeholder weight file when asked to train.
pub struct StubBackend {
    metrics: ValidationMetrics,
    confidence: f32,
    calls: Arc<Mutex<StubCalls>>,
}

impl StubBackend {
    pub fn new() -> Self {
        let mut metrics = ValidationMetrics::new();
        metrics.insert(keys::PRECISION, 0.8);
        metrics.insert(keys::RECALL, 0.7);
        metrics.insert(keys::MAP50, 0.75);
        metrics.insert(keys::MAP50_95, 0.5);
        metrics.insert(keys::FITNESS, keys::fitness(0.75, 0.5));
        Self {
            metrics,
            confidence: 0.9,
            calls: Arc::new(Mutex::new(StubCalls::default())),
        }
    }

    /// Replace the metrics returned by `validate`.
    pub fn with_metrics(mut self, metrics: ValidationMetrics) -> Self {
        self.metrics = metrics;
        self
    }

    /// Confidence attached to the synthetic detection.
    pub fn with_confidence(mut self, confidence: f32) -> Self {
        self.confidence = confidence;
        self
    }

    /// Handle for inspecting calls after the backend has been moved.
    pub fn calls(&self) -> Arc<Mutex<StubCalls>> {
        self.calls.clone()
    }

    fn record<F: FnOnce(&mut StubCalls)>(&self, f: F) -> Result<()> {
        let mut guard = self
            .calls
            .lock()
            .map_err(|_| anyhow!("stub call log poisoned"))?;
        f(&mut guard);
        Ok(())
    }
}

impl Default for StubBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl DetectorBackend for StubBackend {
    fn name(&self) -> &'static str {
        "stub"
    }

    fn supports(&self, _capability: DetectionCapability) -> bool {
        true
    }

    fn validate(&mut self, config: &ValidationConfig) -> Result<ValidationMetrics> {
        self.record(|calls| calls.validations.push(config.clone()))?;
        Ok(self.metrics.clone())
    }

    fn predict(&mut self, image: &RgbImage, config: &PredictConfig) -> Result<Prediction> {
        self.record(|calls| calls.predictions.push(config.clone()))?;
        if self.confidence < config.conf {
            return Ok(Prediction::default());
        }
        let (w, h) = image.dimensions();
        let (w, h) = (w as f32, h as f32);
        Ok(Prediction::new(vec![Detection {
            x1: w * 0.25,
            y1: h * 0.25,
            x2: w * 0.75,
            y2: h * 0.75,
            confidence: self.confidence,
            class_id: 0,
            label: "object".to_string(),
        }]))
    }

    fn train(&mut self, config: &TrainConfig) -> Result<()> {
        self.record(|calls| calls.trainings.push(config.clone()))?;
        let weights_dir = config.run_dir().join("weights");
        std::fs::create_dir_all(&weights_dir)
            .with_context(|| format!("failed to create {}", weights_dir.display()))?;
        let best = weights_dir.join("best.pt");
        std::fs::write(&best, b"stub-weights")
            .with_context(|| format!("failed to write {}", best.display()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn predict_cfg(conf: f32) -> PredictConfig {
        PredictConfig {
            imgsz: 64,
            conf,
            device: "cpu".to_string(),
        }
    }

    #[test]
    fn stub_detects_centre_box() {
        let mut backend = StubBackend::new();
        let image = RgbImage::new(64, 64);
        let prediction = backend.predict(&image, &predict_cfg(0.25)).unwrap();
        assert_eq!(prediction.detections.len(), 1);
        let det = &prediction.detections[0];
        assert_eq!((det.x1, det.y1, det.x2, det.y2), (16.0, 16.0, 48.0, 48.0));
    }

    #[test]
    fn stub_respects_confidence_threshold() {
        let mut backend = StubBackend::new().with_confidence(0.3);
        let image = RgbImage::new(8, 8);
        let prediction = backend.predict(&image, &predict_cfg(0.5)).unwrap();
        assert!(prediction.is_empty());
        assert_eq!(backend.calls().lock().unwrap().predictions.len(), 1);
    }

    #[test]
    fn stub_reports_box_metrics_in_order() {
        let mut backend = StubBackend::new();
        let cfg = ValidationConfig {
            weights: "best.pt".into(),
            data: "data.yaml".into(),
            imgsz: 640,
            batch: 16,
            device: "cpu".to_string(),
            split: Default::default(),
        };
        let metrics = backend.validate(&cfg).unwrap();
        let names: Vec<&str> = metrics.iter().map(|(k, _)| k).collect();
        assert_eq!(
            names,
            vec![
                keys::PRECISION,
                keys::RECALL,
                keys::MAP50,
                keys::MAP50_95,
                keys::FITNESS
            ]
        );
        assert_eq!(backend.calls().lock().unwrap().validations, vec![cfg]);
    }
}
