//! Detection toolkit harness.
//!
//! Command-line tools around an external object-detection toolkit:
//!
//! - `train`: launches a training run from a fully enumerated [`TrainConfig`].
//! - `infer` / `infer_batch`: square-resize images, predict, draw boxes and
//!   labels, save `result_<n>.jpg`.
//! - `val_report`: validates weights, merges the metrics with saved training
//!   metrics and writes a JSON and a CSV report with overfitting gaps.
//!
//! # Module Structure
//!
//! - `detect`: toolkit capability trait, backends and registry
//! - `metrics`: metric descriptions, training stats, merge
//! - `report`: report files
//! - `infer`: image gathering and annotation runs
//! - `overlay`: box and label rendering
//! - `train`: training bundle and launch
//! - `config`: file + environment configuration

pub mod config;
pub mod detect;
pub mod infer;
pub mod metrics;
pub mod overlay;
pub mod report;
pub mod train;
pub mod ui;

pub use config::{BackendKind, ToolkitConfig};
pub use detect::{
    BackendRegistry, DatasetSplit, Detection, DetectionCapability, DetectorBackend,
    PredictConfig, Prediction, StubBackend, ValidationConfig, ValidationMetrics,
};
pub use infer::{
    gather_images, run_batch, run_single, run_single_with, BatchSummary, InferOptions,
};
pub use metrics::{describe_metric, load_train_stats, merge, MetricRecord, MetricsReport, TrainStats};
pub use report::{run_val_report, write_report, ReportPaths};
pub use train::{TrainConfig, TrainOutcome};
