//! infer_batch - annotate one image or every image in a folder
//!
//! Folder sources are filtered by image extension and processed in file-name
//! order; output `n` is `<outdir>/result_<n>.jpg`. Images that fail to decode
//! are skipped.

use anyhow::Result;
use clap::Parser;
use std::io::IsTerminal;
use std::path::PathBuf;

use detkit::infer::{DEFAULT_CONF, DEFAULT_DEVICE, DEFAULT_IMGSZ, DEFAULT_OUTDIR, DEFAULT_WEIGHTS};
use detkit::ui::Ui;
use detkit::{BackendKind, InferOptions, ToolkitConfig};

#[derive(Parser, Debug)]
#[command(author, version, about = "Run the detector on one image or all in a folder")]
struct Args {
    /// Path to an image or a folder of images.
    source: PathBuf,
    /// Path to trained weights.
    #[arg(long, default_value = DEFAULT_WEIGHTS)]
    weights: PathBuf,
    /// Resize both width and height to this size.
    #[arg(long, default_value_t = DEFAULT_IMGSZ)]
    imgsz: u32,
    /// Confidence threshold.
    #[arg(long, default_value_t = DEFAULT_CONF)]
    conf: f32,
    /// Device, e.g. 'cpu' or 'cuda:0'.
    #[arg(long, default_value = DEFAULT_DEVICE)]
    device: String,
    /// Folder to save annotated outputs.
    #[arg(long, default_value = DEFAULT_OUTDIR)]
    outdir: PathBuf,
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

    let paths = detkit::gather_images(&args.source)?;
    if paths.is_empty() {
        println!("No valid images found in '{}'", args.source.display());
        return Ok(());
    }

    let registry = {
        let _stage = ui.stage("Load model");
        cfg.build_registry(
            args.backend.unwrap_or(cfg.backend),
            Some(&args.weights),
            args.imgsz,
        )?
    };
    let options = InferOptions {
        imgsz: args.imgsz,
        conf: args.conf,
        device: args.device,
        outdir: args.outdir,
    };

    let summary = {
        let progress = ui.progress("Detect", paths.len());
        detkit::run_batch(&registry, &paths, &options, |_| progress.inc())?
    };
    for out in &summary.written {
        println!("Saved: {}", out.display());
    }
    if !summary.skipped.is_empty() {
        println!("Skipped {} invalid image(s)", summary.skipped.len());
    }
    Ok(())
}
