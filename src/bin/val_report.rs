//! val_report - validation metrics with overfitting gaps
//!
//! Runs validation on the trained weights, pairs every reported metric with
//! its training-time value (when one was saved) and writes
//! `<results>/val_stats_detailed.json` and `<results>/val_stats_detailed.csv`.

use anyhow::Result;
use clap::Parser;
use std::io::IsTerminal;
use std::path::PathBuf;

use detkit::infer::{DEFAULT_DEVICE, DEFAULT_IMGSZ, DEFAULT_WEIGHTS};
use detkit::ui::Ui;
use detkit::{BackendKind, DatasetSplit, ToolkitConfig, ValidationConfig};

#[derive(Parser, Debug)]
#[command(author, version, about = "Validate trained weights and report overfitting gaps")]
struct Args {
    /// Path to trained weights.
    #[arg(long, default_value = DEFAULT_WEIGHTS)]
    weights: PathBuf,
    /// Dataset descriptor.
    #[arg(long, default_value = "./data.yaml")]
    data: PathBuf,
    /// Validation image size.
    #[arg(long, default_value_t = DEFAULT_IMGSZ)]
    imgsz: u32,
    /// Validation batch size.
    #[arg(long, default_value_t = 16)]
    batch: u32,
    /// Device, e.g. 'cpu' or 'cuda:0'.
    #[arg(long, default_value = DEFAULT_DEVICE)]
    device: String,
    /// Saved training metrics. Defaults to the configured path.
    #[arg(long)]
    train_stats: Option<PathBuf>,
    /// Report directory. Defaults to the configured one.
    #[arg(long)]
    results_dir: Option<PathBuf>,
    /// Toolkit backend (yolo-cli|tract|stub). Defaults to the configured one.
    #[arg(long)]
    backend: Option<BackendKind>,
    /// UI mode for stderr progress (auto|plain|pretty)
    #[arg(long, default_value = "auto", value_name = "MODE")]
    ui: String,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();
    let ui = Ui::from_args(&args.ui, std::io::stderr().is_terminal());
    let cfg = ToolkitConfig::load()?;

    let train_stats = args
        .train_stats
        .unwrap_or_else(|| cfg.stats.train_stats_path.clone());
    let results_dir = args
        .results_dir
        .unwrap_or_else(|| cfg.stats.results_dir.clone());
    let validation = ValidationConfig {
        weights: args.weights,
        data: args.data,
        imgsz: args.imgsz,
        batch: args.batch,
        device: args.device,
        split: DatasetSplit::Val,
    };

    let registry = cfg.build_registry(args.backend.unwrap_or(cfg.backend), None, args.imgsz)?;
    let (report, paths) = {
        let _stage = ui.stage("Validate and write report");
        detkit::run_val_report(&registry, &validation, &train_stats, &results_dir)?
    };
    println!(
        "Saved detailed stats ({} metrics):\n  JSON -> {}\n  CSV  -> {}",
        report.len(),
        paths.json.display(),
        paths.csv.display()
    );
    Ok(())
}
