//! infer - annotate one image with the trained detector
//!
//! The image is stretched to `imgsz × imgsz`, run through the detector and
//! written to `<outdir>/result_0.jpg` with boxes and class labels.

use anyhow::Result;
use clap::Parser;
use std::io::IsTerminal;
use std::path::PathBuf;

use detkit::infer::{DEFAULT_CONF, DEFAULT_DEVICE, DEFAULT_IMGSZ, DEFAULT_OUTDIR, DEFAULT_WEIGHTS};
use detkit::ui::Ui;
use detkit::{BackendKind, InferOptions, ToolkitConfig};

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Run the detector on one image (resized to square) and save an annotated copy"
)]
struct Args {
    /// Path to input image.
    source: PathBuf,
    /// Path to trained weights.
    #[arg(long, default_value = DEFAULT_WEIGHTS)]
    weights: PathBuf,
    /// Size (both width and height) to resize input to.
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

    let options = InferOptions {
        imgsz: args.imgsz,
        conf: args.conf,
        device: args.device,
        outdir: args.outdir,
    };
    let kind = args.backend.unwrap_or(cfg.backend);
    let out = {
        let _stage = ui.stage("Detect");
        detkit::run_single_with(&args.source, &options, || {
            cfg.build_registry(kind, Some(&args.weights), args.imgsz)
        })?
    };
    println!("Saved: {}", out.display());
    Ok(())
}
