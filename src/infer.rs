//! Single and batch inference: decode, square resize, predict, annotate, save.
//!
//! Outputs are named by processing position (`result_<n>.jpg`), not by input
//! file name, so a later run writing the same index replaces the earlier file.

use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use image::imageops::FilterType;
use image::RgbImage;

use crate::detect::{BackendRegistry, PredictConfig};

pub const IMAGE_EXTENSIONS: [&str; 6] = ["jpg", "jpeg", "png", "bmp", "tif", "tiff"];
pub const DEFAULT_WEIGHTS: &str = "runs/detect/train12/weights/best.pt";
pub const DEFAULT_IMGSZ: u32 = 640;
pub const DEFAULT_CONF: f32 = 0.25;
pub const DEFAULT_DEVICE: &str = "cuda:0";
pub const DEFAULT_OUTDIR: &str = "results";

#[derive(Clone, Debug, PartialEq)]
pub struct InferOptions {
    /// Both width and height the input is resized to.
    pub imgsz: u32,
    pub conf: f32,
    pub device: String,
    pub outdir: PathBuf,
}

impl Default for InferOptions {
    fn default() -> Self {
        Self {
            imgsz: DEFAULT_IMGSZ,
            conf: DEFAULT_CONF,
            device: DEFAULT_DEVICE.to_string(),
            outdir: PathBuf::from(DEFAULT_OUTDIR),
        }
    }
}

impl InferOptions {
    pub fn predict_config(&self) -> PredictConfig {
        PredictConfig {
            imgsz: self.imgsz,
            conf: self.conf,
            device: self.device.clone(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.imgsz == 0 {
            return Err(anyhow!("imgsz must be greater than zero"));
        }
        if !(0.0..=1.0).contains(&self.conf) {
            return Err(anyhow!("conf must be within 0..=1, got {}", self.conf));
        }
        Ok(())
    }
}

pub fn output_path(outdir: &Path, index: usize) -> PathBuf {
    outdir.join(format!("result_{}.jpg", index))
}

pub fn has_image_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| {
            IMAGE_EXTENSIONS
                .iter()
                .any(|allowed| ext.eq_ignore_ascii_case(allowed))
        })
        .unwrap_or(false)
}

/// Images to process for `source`.
///
/// A directory yields its regular files with an image extension, sorted by
/// file name. Anything else is taken as a single image path as-is.
pub fn gather_images(source: &Path) -> Result<Vec<PathBuf>> {
    if !source.is_dir() {
        return Ok(vec![source.to_path_buf()]);
    }
    let entries = std::fs::read_dir(source)
        .with_context(|| format!("failed to list {}", source.display()))?;
    let mut paths = Vec::new();
    for entry in entries {
        let entry = entry.with_context(|| format!("failed to list {}", source.display()))?;
        let path = entry.path();
        if path.is_file() && has_image_extension(&path) {
            paths.push(path);
        }
    }
    paths.sort_by(|a, b| a.file_name().cmp(&b.file_name()));
    Ok(paths)
}

/// Decode and stretch to `imgsz × imgsz`. Aspect ratio is not preserved.
pub fn load_resized(path: &Path, imgsz: u32) -> Result<RgbImage> {
    let decoded = image::open(path)
        .with_context(|| format!("cannot load '{}'", path.display()))?
        .to_rgb8();
    Ok(image::imageops::resize(
        &decoded,
        imgsz,
        imgsz,
        FilterType::Triangle,
    ))
}

fn predict_and_save(
    registry: &BackendRegistry,
    image: &RgbImage,
    options: &InferOptions,
    index: usize,
) -> Result<PathBuf> {
    let prediction = registry.predict(image, &options.predict_config())?;
    log::debug!("{} detections", prediction.detections.len());
    let annotated = prediction.plot(image);
    let out = output_path(&options.outdir, index);
    annotated
        .save(&out)
        .with_context(|| format!("failed to write {}", out.display()))?;
    log::info!("saved {}", out.display());
    Ok(out)
}

/// Annotate one image. An undecodable image is an error raised before the
/// backend is queried.
pub fn run_single(
    registry: &BackendRegistry,
    source: &Path,
    options: &InferOptions,
) -> Result<PathBuf> {
    options.validate()?;
    let image = load_resized(source, options.imgsz)?;
    save_single(registry, &image, options)
}

/// Like `run_single`, but the backends are only built once the image has
/// decoded, so a bad input never loads a model.
pub fn run_single_with<F>(source: &Path, options: &InferOptions, load_backends: F) -> Result<PathBuf>
where
    F: FnOnce() -> Result<BackendRegistry>,
{
    options.validate()?;
    let image = load_resized(source, options.imgsz)?;
    let registry = load_backends()?;
    save_single(&registry, &image, options)
}

fn save_single(registry: &BackendRegistry, image: &RgbImage, options: &InferOptions) -> Result<PathBuf> {
    std::fs::create_dir_all(&options.outdir)
        .with_context(|| format!("failed to create {}", options.outdir.display()))?;
    predict_and_save(registry, image, options, 0)
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BatchSummary {
    pub written: Vec<PathBuf>,
    pub skipped: Vec<PathBuf>,
}

/// Annotate every path in order. Undecodable images are skipped with a
/// warning; their index is not reused. `on_item` runs after each path.
pub fn run_batch<F: FnMut(&Path)>(
    registry: &BackendRegistry,
    paths: &[PathBuf],
    options: &InferOptions,
    mut on_item: F,
) -> Result<BatchSummary> {
    options.validate()?;
    let mut summary = BatchSummary::default();
    if paths.is_empty() {
        return Ok(summary);
    }
    std::fs::create_dir_all(&options.outdir)
        .with_context(|| format!("failed to create {}", options.outdir.display()))?;

    for (index, path) in paths.iter().enumerate() {
        match load_resized(path, options.imgsz) {
            Ok(image) => {
                let out = predict_and_save(registry, &image, options, index)?;
                summary.written.push(out);
            }
            Err(e) => {
                log::warn!("skipping '{}': not a valid image ({:#})", path.display(), e);
                summary.skipped.push(path.clone());
            }
        }
        on_item(path);
    }
    Ok(summary)
}
