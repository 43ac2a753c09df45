use std::path::PathBuf;

use anyhow::Result;
use image::RgbImage;

use crate::detect::result::{Prediction, ValidationMetrics};
use crate::train::TrainConfig;

/// Operations a detection toolkit backend can provide.
#[non_exhaustive]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DetectionCapability {
    Validate,
    Predict,
    Train,
}

/// Dataset split to evaluate against.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum DatasetSplit {
    #[default]
    Val,
    Train,
}

impl DatasetSplit {
    pub fn as_str(&self) -> &'static str {
        match self {
            DatasetSplit::Val => "val",
            DatasetSplit::Train => "train",
        }
    }
}

/// Configuration passed through unchanged to a validation run.
#[derive(Clone, Debug, PartialEq)]
pub struct ValidationConfig {
    pub weights: PathBuf,
    /// Dataset descriptor, consumed opaquely by the backend.
    pub data: PathBuf,
    pub imgsz: u32,
    pub batch: u32,
    pub device: String,
    pub split: DatasetSplit,
}

/// Configuration for a single prediction call.
#[derive(Clone, Debug, PartialEq)]
pub struct PredictConfig {
    pub imgsz: u32,
    pub conf: f32,
    pub device: String,
}

/// Detection toolkit backend.
///
/// The toolkit owns detection, training and evaluation. Callers only pass
/// configuration through and consume what comes back.
pub trait DetectorBackend: Send {
    /// Backend identifier.
    fn name(&self) -> &'static str;

    /// Returns true when the backend supports a capability.
    fn supports(&self, capability: DetectionCapability) -> bool;

    /// Evaluate weights against a dataset and return metrics in reported order.
    fn validate(&mut self, config: &ValidationConfig) -> Result<ValidationMetrics>;

    /// Run detection on an already resized RGB image.
    fn predict(&mut self, image: &RgbImage, config: &PredictConfig) -> Result<Prediction>;

    /// Start a training run. Artifacts are written under `config.run_dir()`.
    fn train(&mut self, config: &TrainConfig) -> Result<()>;
}
