use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::detect::backends::yolo_cli::{DEFAULT_PYTHON_BIN, DEFAULT_YOLO_BIN};
use crate::detect::{BackendRegistry, ClassNames, StubBackend, YoloCliBackend};
use crate::report::DEFAULT_RESULTS_DIR;
use crate::train::TrainConfig;

const DEFAULT_TRAIN_STATS_PATH: &str = "runs/detect/train12/train_stats.json";

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum BackendKind {
    #[default]
    YoloCli,
    Tract,
    Stub,
}

impl FromStr for BackendKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "yolo-cli" | "yolo" => Ok(BackendKind::YoloCli),
            "tract" => Ok(BackendKind::Tract),
            "stub" => Ok(BackendKind::Stub),
            other => Err(anyhow!(
                "unknown backend '{}' (expected yolo-cli, tract or stub)",
                other
            )),
        }
    }
}

#[derive(Debug, Deserialize, Default)]
struct ToolkitConfigFile {
    backend: Option<String>,
    yolo_bin: Option<PathBuf>,
    python_bin: Option<PathBuf>,
    class_names: Option<PathBuf>,
    train: Option<TrainConfigFile>,
    stats: Option<StatsConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct TrainConfigFile {
    model: Option<String>,
    data: Option<PathBuf>,
    device: Option<String>,
    epochs: Option<u32>,
    imgsz: Option<u32>,
    batch: Option<u32>,
    workers: Option<u32>,
    hsv_h: Option<f64>,
    hsv_s: Option<f64>,
    hsv_v: Option<f64>,
    degrees: Option<f64>,
    translate: Option<f64>,
    scale: Option<f64>,
    shear: Option<f64>,
    perspective: Option<f64>,
    flipud: Option<f64>,
    fliplr: Option<f64>,
    mosaic: Option<f64>,
    mixup: Option<f64>,
    copy_paste: Option<f64>,
    project: Option<PathBuf>,
    name: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct StatsConfigFile {
    train_stats_path: Option<PathBuf>,
    results_dir: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct ToolkitConfig {
    pub backend: BackendKind,
    pub yolo_bin: PathBuf,
    /// Interpreter with the toolkit's Python package, used for validation.
    pub python_bin: PathBuf,
    pub class_names: Option<PathBuf>,
    pub train: TrainConfig,
    pub stats: StatsSettings,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatsSettings {
    pub train_stats_path: PathBuf,
    pub results_dir: PathBuf,
}

impl Default for ToolkitConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::default(),
            yolo_bin: PathBuf::from(DEFAULT_YOLO_BIN),
            python_bin: PathBuf::from(DEFAULT_PYTHON_BIN),
            class_names: None,
            train: TrainConfig::default(),
            stats: StatsSettings {
                train_stats_path: PathBuf::from(DEFAULT_TRAIN_STATS_PATH),
                results_dir: PathBuf::from(DEFAULT_RESULTS_DIR),
            },
        }
    }
}

impl ToolkitConfig {
    /// Defaults, then the JSON file named by `DETKIT_CONFIG`, then env overrides.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("DETKIT_CONFIG").ok();
        let file_cfg = match config_path.as_deref() {
            Some(path) if !path.trim().is_empty() => Some(read_config_file(Path::new(path))?),
            _ => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default())?;
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: ToolkitConfigFile) -> Result<Self> {
        let mut cfg = Self::default();
        if let Some(backend) = file.backend.as_deref() {
            cfg.backend = backend.parse()?;
        }
        if let Some(bin) = file.yolo_bin {
            cfg.yolo_bin = bin;
        }
        if let Some(bin) = file.python_bin {
            cfg.python_bin = bin;
        }
        cfg.class_names = file.class_names;
        if let Some(train) = file.train {
            train.apply(&mut cfg.train);
        }
        if let Some(stats) = file.stats {
            if let Some(path) = stats.train_stats_path {
                cfg.stats.train_stats_path = path;
            }
            if let Some(dir) = stats.results_dir {
                cfg.stats.results_dir = dir;
            }
        }
        Ok(cfg)
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Some(backend) = non_empty_env("DETKIT_BACKEND") {
            self.backend = backend.parse()?;
        }
        if let Some(bin) = non_empty_env("DETKIT_YOLO_BIN") {
            self.yolo_bin = PathBuf::from(bin);
        }
        if let Some(bin) = non_empty_env("DETKIT_PYTHON") {
            self.python_bin = PathBuf::from(bin);
        }
        if let Some(path) = non_empty_env("DETKIT_CLASS_NAMES") {
            self.class_names = Some(PathBuf::from(path));
        }
        if let Some(path) = non_empty_env("DETKIT_TRAIN_STATS") {
            self.stats.train_stats_path = PathBuf::from(path);
        }
        if let Some(dir) = non_empty_env("DETKIT_RESULTS_DIR") {
            self.stats.results_dir = PathBuf::from(dir);
        }
        if let Some(device) = non_empty_env("DETKIT_TRAIN_DEVICE") {
            self.train.device = device;
        }
        if let Some(epochs) = non_empty_env("DETKIT_TRAIN_EPOCHS") {
            self.train.epochs = epochs
                .trim()
                .parse()
                .map_err(|_| anyhow!("DETKIT_TRAIN_EPOCHS must be a positive integer"))?;
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if self.yolo_bin.as_os_str().is_empty() {
            return Err(anyhow!("yolo_bin must not be empty"));
        }
        if self.python_bin.as_os_str().is_empty() {
            return Err(anyhow!("python_bin must not be empty"));
        }
        self.train.validate()
    }

    pub fn load_class_names(&self) -> Result<ClassNames> {
        match &self.class_names {
            Some(path) => ClassNames::from_file(path),
            None => Ok(ClassNames::default()),
        }
    }

    /// Build the backend registry for `kind`.
    ///
    /// `weights` is what prediction runs with. Selecting `tract` also registers
    /// the command-line backend so validation and training stay available; the
    /// ONNX model is only loaded when `weights` is given.
    pub fn build_registry(
        &self,
        kind: BackendKind,
        weights: Option<&Path>,
        imgsz: u32,
    ) -> Result<BackendRegistry> {
        let names = self.load_class_names()?;
        let mut cli = YoloCliBackend::new(&self.yolo_bin)
            .with_python(&self.python_bin)
            .with_class_names(names.clone());
        if let Some(weights) = weights {
            cli = cli.with_weights(weights);
        }

        let mut registry = BackendRegistry::new();
        match kind {
            BackendKind::YoloCli => registry.register(cli),
            BackendKind::Stub => registry.register(StubBackend::new()),
            BackendKind::Tract => {
                match weights {
                    Some(weights) => register_tract(&mut registry, weights, imgsz, names)?,
                    None => log::info!("no model weights given; tract backend not loaded"),
                }
                registry.register(cli);
            }
        }
        log::debug!(
            "backends registered: {:?}, default {:?}",
            registry.list(),
            registry.default_name()
        );
        Ok(registry)
    }
}

#[cfg(feature = "backend-tract")]
fn register_tract(
    registry: &mut BackendRegistry,
    weights: &Path,
    imgsz: u32,
    names: ClassNames,
) -> Result<()> {
    let backend = crate::detect::backends::TractBackend::new(weights, imgsz)?
        .with_class_names(names);
    registry.register(backend);
    Ok(())
}

#[cfg(not(feature = "backend-tract"))]
fn register_tract(
    _registry: &mut BackendRegistry,
    _weights: &Path,
    _imgsz: u32,
    _names: ClassNames,
) -> Result<()> {
    Err(anyhow!(
        "tract backend not available (backend-tract feature disabled)"
    ))
}

impl TrainConfigFile {
    fn apply(self, cfg: &mut TrainConfig) {
        macro_rules! set {
            ($src:expr, $dst:expr; $($field:ident),* $(,)?) => {
                $(if let Some(v) = $src.$field { $dst.$field = v; })*
            };
        }
        set!(
            self, cfg;
            model, data, device, epochs, imgsz, batch, workers, hsv_h, hsv_s, hsv_v, degrees,
            translate, scale, shear, perspective, flipud, fliplr, mosaic, mixup, copy_paste,
            project, name,
        );
    }
}

fn read_config_file(path: &Path) -> Result<ToolkitConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let cfg = serde_json::from_str(&raw)
        .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?;
    Ok(cfg)
}

fn non_empty_env(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}
