//! Training launcher configuration.
//!
//! Every parameter the toolkit's trainer receives is a named field here. The
//! defaults reproduce the tuned run the rest of the tools expect: a medium
//! pretrained model, 100 epochs at 640px, and moderate color, geometric and
//! mixing augmentation.

use std::path::PathBuf;

use anyhow::{anyhow, Result};

use crate::detect::{BackendRegistry, DatasetSplit, ValidationConfig};
use crate::metrics;

pub const TRAIN_STATS_FILE: &str = "train_stats.json";

#[derive(Clone, Debug, PartialEq)]
pub struct TrainConfig {
    /// Pretrained weights to start from.
    pub model: String,
    /// Dataset descriptor.
    pub data: PathBuf,
    pub device: String,
    /// Range: >= 1.
    pub epochs: u32,
    /// Square training size. Range: >= 32, multiple of 32.
    pub imgsz: u32,
    /// Range: >= 1.
    pub batch: u32,
    /// Data loader workers.
    pub workers: u32,

    /// Hue shift fraction. Range: 0..=1.
    pub hsv_h: f64,
    /// Saturation shift fraction. Range: 0..=1.
    pub hsv_s: f64,
    /// Brightness shift fraction. Range: 0..=1.
    pub hsv_v: f64,

    /// Rotation in degrees (+/-). Range: -180..=180.
    pub degrees: f64,
    /// Translation fraction (+/-). Range: 0..=1.
    pub translate: f64,
    /// Scale gain (+/-). Range: >= 0.
    pub scale: f64,
    /// Shear in degrees (+/-). Range: -180..=180.
    pub shear: f64,
    /// Perspective fraction. Range: 0..=0.001.
    pub perspective: f64,
    /// Vertical flip probability. Range: 0..=1.
    pub flipud: f64,
    /// Horizontal flip probability. Range: 0..=1.
    pub fliplr: f64,

    /// Mosaic probability. Range: 0..=1.
    pub mosaic: f64,
    /// Mixup probability. Range: 0..=1.
    pub mixup: f64,
    /// Copy-paste probability. Range: 0..=1.
    pub copy_paste: f64,

    /// Root directory for all runs.
    pub project: PathBuf,
    /// This run's sub-directory under `project`.
    pub name: String,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            model: "yolov8m.pt".to_string(),
            data: PathBuf::from("./data.yaml"),
            device: "cuda:0".to_string(),
            epochs: 100,
            imgsz: 640,
            batch: 16,
            workers: 8,
            hsv_h: 0.015,
            hsv_s: 0.7,
            hsv_v: 0.4,
            degrees: 10.0,
            translate: 0.1,
            scale: 0.5,
            shear: 2.0,
            perspective: 0.001,
            flipud: 0.5,
            fliplr: 0.5,
            mosaic: 1.0,
            mixup: 0.2,
            copy_paste: 0.1,
            project: PathBuf::from("runs/detect"),
            name: "klilprofiles".to_string(),
        }
    }
}

impl TrainConfig {
    pub fn run_dir(&self) -> PathBuf {
        self.project.join(&self.name)
    }

    pub fn best_weights(&self) -> PathBuf {
        self.run_dir().join("weights").join("best.pt")
    }

    pub fn train_stats_path(&self) -> PathBuf {
        self.run_dir().join(TRAIN_STATS_FILE)
    }

    pub fn validate(&self) -> Result<()> {
        if self.model.trim().is_empty() {
            return Err(anyhow!("model must not be empty"));
        }
        if self.data.as_os_str().is_empty() {
            return Err(anyhow!("data must not be empty"));
        }
        if self.device.trim().is_empty() {
            return Err(anyhow!("device must not be empty"));
        }
        if self.project.as_os_str().is_empty() || self.name.trim().is_empty() {
            return Err(anyhow!("project and name must not be empty"));
        }
        if self.epochs == 0 {
            return Err(anyhow!("epochs must be at least 1"));
        }
        if self.imgsz < 32 || self.imgsz % 32 != 0 {
            return Err(anyhow!(
                "imgsz must be a multiple of 32 and at least 32, got {}",
                self.imgsz
            ));
        }
        if self.batch == 0 {
            return Err(anyhow!("batch must be at least 1"));
        }

        let unit = [
            ("hsv_h", self.hsv_h),
            ("hsv_s", self.hsv_s),
            ("hsv_v", self.hsv_v),
            ("translate", self.translate),
            ("flipud", self.flipud),
            ("fliplr", self.fliplr),
            ("mosaic", self.mosaic),
            ("mixup", self.mixup),
            ("copy_paste", self.copy_paste),
        ];
        for (name, value) in unit {
            check_range(name, value, 0.0, 1.0)?;
        }
        check_range("degrees", self.degrees, -180.0, 180.0)?;
        check_range("shear", self.shear, -180.0, 180.0)?;
        check_range("perspective", self.perspective, 0.0, 0.001)?;
        check_range("scale", self.scale, 0.0, f64::MAX)?;
        Ok(())
    }

    /// The bundle as `key=value` arguments, in a stable order.
    pub fn args(&self) -> Vec<String> {
        vec![
            format!("model={}", self.model),
            format!("data={}", self.data.display()),
            format!("device={}", self.device),
            format!("epochs={}", self.epochs),
            format!("imgsz={}", self.imgsz),
            format!("batch={}", self.batch),
            format!("workers={}", self.workers),
            format!("hsv_h={}", self.hsv_h),
            format!("hsv_s={}", self.hsv_s),
            format!("hsv_v={}", self.hsv_v),
            format!("degrees={}", self.degrees),
            format!("translate={}", self.translate),
            format!("scale={}", self.scale),
            format!("shear={}", self.shear),
            format!("perspective={}", self.perspective),
            format!("flipud={}", self.flipud),
            format!("fliplr={}", self.fliplr),
            format!("mosaic={}", self.mosaic),
            format!("mixup={}", self.mixup),
            format!("copy_paste={}", self.copy_paste),
            format!("project={}", self.project.display()),
            format!("name={}", self.name),
        ]
    }
}

fn check_range(name: &str, value: f64, min: f64, max: f64) -> Result<()> {
    if !value.is_finite() || value < min || value > max {
        return Err(anyhow!(
            "{} must be within {}..={}, got {}",
            name,
            min,
            max,
            value
        ));
    }
    Ok(())
}

/// What a training launch produced.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TrainOutcome {
    pub run_dir: PathBuf,
    /// Set when training-split metrics were written for later gap reports.
    pub train_stats: Option<PathBuf>,
}

/// Validate the bundle, train, then record training-split metrics next to the
/// weights. Failure to record the metrics is logged, not returned.
pub fn launch(registry: &BackendRegistry, config: &TrainConfig) -> Result<TrainOutcome> {
    config.validate()?;
    log::info!(
        "training {} on {} for {} epochs into {}",
        config.model,
        config.data.display(),
        config.epochs,
        config.run_dir().display()
    );
    registry.train(config)?;

    let run_dir = config.run_dir();
    let best = config.best_weights();
    if !best.exists() {
        log::warn!("no weights at {}; skipping train stats", best.display());
        return Ok(TrainOutcome {
            run_dir,
            train_stats: None,
        });
    }

    let validation = ValidationConfig {
        weights: best,
        data: config.data.clone(),
        imgsz: config.imgsz,
        batch: config.batch,
        device: config.device.clone(),
        split: DatasetSplit::Train,
    };
    let stats_path = config.train_stats_path();
    let written = registry
        .validate(&validation)
        .and_then(|m| metrics::write_train_stats(&stats_path, &m));
    match written {
        Ok(()) => {
            log::info!("train stats written to {}", stats_path.display());
            Ok(TrainOutcome {
                run_dir,
                train_stats: Some(stats_path),
            })
        }
        Err(e) => {
            log::warn!("failed to record train stats: {:#}", e);
            Ok(TrainOutcome {
                run_dir,
                train_stats: None,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        TrainConfig::default().validate().unwrap();
    }

    #[test]
    fn rejects_out_of_range_values() {
        let cfg = TrainConfig {
            mixup: 1.5,
            ..TrainConfig::default()
        };
        assert!(cfg.validate().unwrap_err().to_string().contains("mixup"));

        let cfg = TrainConfig {
            imgsz: 650,
            ..TrainConfig::default()
        };
        assert!(cfg.validate().is_err());

        let cfg = TrainConfig {
            perspective: 0.01,
            ..TrainConfig::default()
        };
        assert!(cfg.validate().is_err());

        let cfg = TrainConfig {
            epochs: 0,
            ..TrainConfig::default()
        };
        assert!(cfg.validate().is_err());

        let cfg = TrainConfig {
            hsv_s: f64::NAN,
            ..TrainConfig::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn args_render_full_bundle() {
        let args = TrainConfig::default().args();
        assert_eq!(args.len(), 22);
        assert_eq!(args[0], "model=yolov8m.pt");
        assert!(args.contains(&"hsv_h=0.015".to_string()));
        assert!(args.contains(&"perspective=0.001".to_string()));
        assert!(args.contains(&"mosaic=1".to_string()));
        assert_eq!(args[20], "project=runs/detect");
        assert_eq!(args[21], "name=klilprofiles");
    }

    #[test]
    fn run_paths_follow_project_and_name() {
        let cfg = TrainConfig::default();
        assert_eq!(cfg.run_dir(), PathBuf::from("runs/detect/klilprofiles"));
        assert_eq!(
            cfg.best_weights(),
            PathBuf::from("runs/detect/klilprofiles/weights/best.pt")
        );
    }
}
