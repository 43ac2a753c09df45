//! train - launch a detector training run
//!
//! Takes no arguments. The training bundle comes from `TrainConfig` defaults,
//! optionally overridden by the JSON file named in `DETKIT_CONFIG` and the
//! `DETKIT_*` environment variables. After training, training-split metrics
//! are saved to `<project>/<name>/train_stats.json` for `val_report`.

use anyhow::Result;
use clap::Parser;
use std::io::IsTerminal;

use detkit::ui::Ui;
use detkit::{BackendKind, ToolkitConfig};

#[derive(Parser, Debug)]
#[command(author, version, about = "Train the detector with the configured bundle")]
struct Args {
    /// Toolkit backend (yolo-cli|stub). Defaults to the configured one.
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

    let registry = cfg.build_registry(
        args.backend.unwrap_or(cfg.backend),
        None,
        cfg.train.imgsz,
    )?;
    let outcome = {
        let _stage = ui.stage("Train");
        detkit::train::launch(&registry, &cfg.train)?
    };

    println!("training run written to {}", outcome.run_dir.display());
    if let Some(path) = outcome.train_stats {
        println!("train stats written to {}", path.display());
    }
    Ok(())
}
