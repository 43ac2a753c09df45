#![cfg(feature = "backend-tract")]

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use image::RgbImage;
use tract_onnx::prelude::*;

use crate::detect::backend::{
    DetectionCapability, DetectorBackend, PredictConfig, ValidationConfig,
};
use crate::detect::labels::ClassNames;
use crate::detect::result::{Detection, Prediction, ValidationMetrics};
use crate::train::TrainConfig;

/// IoU above which overlapping boxes of the same class are suppressed.
pub const NMS_IOU: f32 = 0.45;

/// Tract-based backend for an ONNX export of the detector.
///
/// Runs the exported model in-process on square RGB inputs. Only prediction is
/// available; validation and training need the full toolkit.
pub struct TractBackend {
    model: TypedRunnableModel<TypedModel>,
    imgsz: u32,
    class_names: ClassNames,
}

impl TractBackend {
    /// Load an ONNX model from disk for a fixed `imgsz × imgsz` input.
    pub fn new<P: AsRef<Path>>(model_path: P, imgsz: u32) -> Result<Self> {
        let model_path = model_path.as_ref();
        let side = imgsz as usize;
        let model = tract_onnx::onnx()
            .model_for_path(model_path)
            .with_context(|| format!("failed to load ONNX model from {}", model_path.display()))?
            .with_input_fact(
                0,
                InferenceFact::dt_shape(f32::datum_type(), tvec!(1, 3, side, side)),
            )
            .context("failed to set input fact")?
            .into_optimized()
            .context("failed to optimize ONNX model")?
            .into_runnable()
            .context("failed to build runnable ONNX model")?;

        Ok(Self {
            model,
            imgsz,
            class_names: ClassNames::default(),
        })
    }

    pub fn with_class_names(mut self, class_names: ClassNames) -> Self {
        self.class_names = class_names;
        self
    }

    fn build_input(&self, image: &RgbImage) -> Result<Tensor> {
        let (width, height) = image.dimensions();
        if width != self.imgsz || height != self.imgsz {
            return Err(anyhow!(
                "image size {}x{} does not match model input {}x{}",
                width,
                height,
                self.imgsz,
                self.imgsz
            ));
        }
        let input = tract_ndarray::Array4::from_shape_fn(
            (1, 3, height as usize, width as usize),
            |(_, channel, y, x)| image.get_pixel(x as u32, y as u32)[channel] as f32 / 255.0,
        );
        Ok(input.into_tensor())
    }

    /// Decode a `[1, 4 + classes, anchors]` head into thresholded boxes.
    fn decode(&self, outputs: TVec<TValue>, conf: f32) -> Result<Vec<Detection>> {
        let output = outputs
            .first()
            .ok_or_else(|| anyhow!("model produced no outputs"))?;
        let view = output
            .to_array_view::<f32>()
            .context("model output tensor was not f32")?;
        let shape = view.shape().to_vec();
        if shape.len() != 3 || shape[0] != 1 || shape[1] < 5 {
            return Err(anyhow!("unexpected model output shape {:?}", shape));
        }
        let (rows, anchors) = (shape[1], shape[2]);
        let mut candidates = Vec::new();
        for a in 0..anchors {
            let mut best = (0usize, f32::NEG_INFINITY);
            for c in 4..rows {
                let score = view[[0, c, a]];
                if score > best.1 {
                    best = (c - 4, score);
                }
            }
            if best.1 < conf {
                continue;
            }
            let (cx, cy, w, h) = (view[[0, 0, a]], view[[0, 1, a]], view[[0, 2, a]], view[[0, 3, a]]);
            candidates.push(Detection {
                x1: cx - w / 2.0,
                y1: cy - h / 2.0,
                x2: cx + w / 2.0,
                y2: cy + h / 2.0,
                confidence: best.1,
                class_id: best.0,
                label: self.class_names.label(best.0),
            });
        }
        Ok(non_max_suppression(candidates, NMS_IOU))
    }
}

impl DetectorBackend for TractBackend {
    fn name(&self) -> &'static str {
        "tract"
    }

    fn supports(&self, capability: DetectionCapability) -> bool {
        matches!(capability, DetectionCapability::Predict)
    }

    fn validate(&mut self, _config: &ValidationConfig) -> Result<ValidationMetrics> {
        Err(anyhow!("tract backend cannot run validation"))
    }

    fn predict(&mut self, image: &RgbImage, config: &PredictConfig) -> Result<Prediction> {
        let input = self.build_input(image)?;
        let outputs = self
            .model
            .run(tvec!(input.into()))
            .context("ONNX inference failed")?;
        Ok(Prediction::new(self.decode(outputs, config.conf)?))
    }

    fn train(&mut self, _config: &TrainConfig) -> Result<()> {
        Err(anyhow!("tract backend cannot train"))
    }
}

/// Class-wise greedy NMS, highest confidence first.
pub fn non_max_suppression(mut candidates: Vec<Detection>, iou: f32) -> Vec<Detection> {
    candidates.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
    let mut kept: Vec<Detection> = Vec::new();
    for cand in candidates {
        let suppressed = kept
            .iter()
            .any(|k| k.class_id == cand.class_id && k.iou(&cand) > iou);
        if !suppressed {
            kept.push(cand);
        }
    }
    kept
}

#[cfg(test)]
mod tests {
    use super::*;

    fn det(x1: f32, class_id: usize, confidence: f32) -> Detection {
        Detection {
            x1,
            y1: 0.0,
            x2: x1 + 10.0,
            y2: 10.0,
            confidence,
            class_id,
            label: String::new(),
        }
    }

    #[test]
    fn nms_drops_overlapping_same_class() {
        let kept = non_max_suppression(
            vec![det(0.0, 0, 0.6), det(1.0, 0, 0.9), det(1.0, 1, 0.5), det(50.0, 0, 0.4)],
            NMS_IOU,
        );
        let summary: Vec<(usize, f32)> = kept.iter().map(|d| (d.class_id, d.confidence)).collect();
        assert_eq!(summary, vec![(0, 0.9), (1, 0.5), (0, 0.4)]);
    }
}
