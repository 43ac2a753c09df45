//! Backend that drives the detection toolkit from the command line.
//!
//! Training and prediction spawn one `yolo detect <mode>` process with
//! `key=value` arguments. Validation runs a short script through the
//! toolkit's Python API and reads `results_dict` back as JSON, falling back
//! to the `yolo detect val` summary table when the interpreter or the toolkit
//! module is missing. Predictions are read back from the label files the
//! toolkit writes with `save_txt=True`.

use std::io;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use std::sync::OnceLock;

use anyhow::{anyhow, Context, Result};
use image::RgbImage;
use regex::Regex;

use crate::detect::backend::{
    DetectionCapability, DetectorBackend, PredictConfig, ValidationConfig,
};
use crate::detect::labels::ClassNames;
use crate::detect::result::{Detection, Prediction, ValidationMetrics};
use crate::metrics::keys;
use crate::train::TrainConfig;

pub const DEFAULT_YOLO_BIN: &str = "yolo";
pub const DEFAULT_PYTHON_BIN: &str = "python3";

/// Prefix of the line carrying the metrics JSON.
const METRICS_MARKER: &str = "DETKIT_METRICS ";
/// Exit code of the validation script when the toolkit cannot be imported.
const TOOLKIT_MISSING: i32 = 3;

/// Takes the same `key=value` arguments as `yolo detect val` and prints
/// `results_dict` as an ordered list of `[key, value]` pairs. Non-finite
/// values become `null`.
const VALIDATE_SCRIPT: &str = r#"
import json, math, sys
try:
    from ultralytics import YOLO
except ImportError:
    sys.exit(3)
args = dict(arg.split("=", 1) for arg in sys.argv[1:])
model = YOLO(args.pop("model"))
args["imgsz"] = int(args["imgsz"])
args["batch"] = int(args["batch"])
metrics = model.val(name="val", exist_ok=True, plots=False, **args)
pairs = []
for key, value in metrics.results_dict.items():
    value = float(value)
    pairs.append([key, value if math.isfinite(value) else None])
print("DETKIT_METRICS " + json.dumps(pairs), flush=True)
"#;

pub struct YoloCliBackend {
    program: PathBuf,
    python: PathBuf,
    weights: Option<PathBuf>,
    class_names: ClassNames,
}

impl YoloCliBackend {
    pub fn new<P: AsRef<Path>>(program: P) -> Self {
        Self {
            program: program.as_ref().to_path_buf(),
            python: PathBuf::from(DEFAULT_PYTHON_BIN),
            weights: None,
            class_names: ClassNames::default(),
        }
    }

    /// Interpreter that has the toolkit's Python package installed.
    pub fn with_python<P: AsRef<Path>>(mut self, python: P) -> Self {
        self.python = python.as_ref().to_path_buf();
        self
    }

    /// Weights used by `predict`. Validation and training carry their own.
    pub fn with_weights<P: AsRef<Path>>(mut self, weights: P) -> Self {
        self.weights = Some(weights.as_ref().to_path_buf());
        self
    }

    pub fn with_class_names(mut self, class_names: ClassNames) -> Self {
        self.class_names = class_names;
        self
    }

    fn command(&self, mode: &str) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.arg("detect").arg(mode);
        cmd
    }

    fn run_captured(&self, mut cmd: Command, mode: &str) -> Result<String> {
        log::debug!("running {:?}", cmd);
        let output = cmd
            .output()
            .with_context(|| format!("failed to launch {}", self.program.display()))?;
        checked_output(&format!("{} detect {}", self.program.display(), mode), &output)
    }

    /// Full-precision metrics through the Python API. `None` when the
    /// interpreter or the toolkit module is not available.
    fn validate_structured(
        &self,
        config: &ValidationConfig,
        project: &Path,
    ) -> Result<Option<ValidationMetrics>> {
        let mut cmd = Command::new(&self.python);
        cmd.arg("-c")
            .arg(VALIDATE_SCRIPT)
            .args(validation_args(config, project));
        log::debug!("running {} validation script", self.python.display());
        let output = match cmd.output() {
            Ok(output) => output,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                log::warn!(
                    "{} not found; reading metrics from the yolo summary table",
                    self.python.display()
                );
                return Ok(None);
            }
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("failed to launch {}", self.python.display()))
            }
        };
        if output.status.code() == Some(TOOLKIT_MISSING) {
            log::warn!(
                "toolkit not importable from {}; reading metrics from the yolo summary table",
                self.python.display()
            );
            return Ok(None);
        }
        let text = checked_output(
            &format!("{} validation script", self.python.display()),
            &output,
        )?;
        parse_metrics_json(&text).map(Some)
    }
}

impl DetectorBackend for YoloCliBackend {
    fn name(&self) -> &'static str {
        "yolo-cli"
    }

    fn supports(&self, capability: DetectionCapability) -> bool {
        match capability {
            DetectionCapability::Predict => self.weights.is_some(),
            DetectionCapability::Validate | DetectionCapability::Train => true,
        }
    }

    fn validate(&mut self, config: &ValidationConfig) -> Result<ValidationMetrics> {
        let scratch = tempfile::tempdir().context("failed to create scratch directory")?;
        if let Some(metrics) = self.validate_structured(config, scratch.path())? {
            return Ok(metrics);
        }
        let mut cmd = self.command("val");
        cmd.args(validation_args(config, scratch.path()))
            .arg("plots=False")
            .arg("name=val")
            .arg("exist_ok=True");
        let output = self.run_captured(cmd, "val")?;
        parse_val_summary(&output)
    }

    fn predict(&mut self, image: &RgbImage, config: &PredictConfig) -> Result<Prediction> {
        let weights = self
            .weights
            .as_ref()
            .ok_or_else(|| anyhow!("yolo-cli backend has no weights configured for predict"))?;
        let scratch = tempfile::tempdir().context("failed to create scratch directory")?;
        let input = scratch.path().join("input.png");
        image
            .save(&input)
            .with_context(|| format!("failed to write {}", input.display()))?;

        let project = scratch.path().join("out");
        let mut cmd = self.command("predict");
        cmd.arg(kv("model", weights.display()))
            .arg(kv("source", input.display()))
            .arg(kv("imgsz", config.imgsz))
            .arg(kv("conf", config.conf))
            .arg(kv("device", &config.device))
            .arg("save=False")
            .arg("save_txt=True")
            .arg("save_conf=True")
            .arg(kv("project", project.display()))
            .arg("name=predict")
            .arg("exist_ok=True");
        self.run_captured(cmd, "predict")?;

        // No label file is written when nothing was detected.
        let labels = project.join("predict").join("labels").join("input.txt");
        if !labels.exists() {
            return Ok(Prediction::default());
        }
        let raw = std::fs::read_to_string(&labels)
            .with_context(|| format!("failed to read {}", labels.display()))?;
        let (w, h) = image.dimensions();
        let detections = parse_label_lines(&raw, w, h, &self.class_names)?;
        Ok(Prediction::new(detections))
    }

    fn train(&mut self, config: &TrainConfig) -> Result<()> {
        let mut cmd = self.command("train");
        cmd.args(config.args());
        log::debug!("running {:?}", cmd);
        let status = cmd
            .status()
            .with_context(|| format!("failed to launch {}", self.program.display()))?;
        if !status.success() {
            return Err(anyhow!(
                "{} detect train exited with {}",
                self.program.display(),
                status
            ));
        }
        Ok(())
    }
}

fn kv(key: &str, value: impl std::fmt::Display) -> String {
    format!("{}={}", key, value)
}

fn validation_args(config: &ValidationConfig, project: &Path) -> Vec<String> {
    vec![
        kv("model", config.weights.display()),
        kv("data", config.data.display()),
        kv("imgsz", config.imgsz),
        kv("batch", config.batch),
        kv("device", &config.device),
        kv("split", config.split.as_str()),
        kv("project", project.display()),
    ]
}

/// Stdout followed by stderr; an error carrying the last lines on failure.
fn checked_output(what: &str, output: &Output) -> Result<String> {
    let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
    text.push_str(&String::from_utf8_lossy(&output.stderr));
    if !output.status.success() {
        let tail: Vec<&str> = text.lines().rev().take(5).collect();
        return Err(anyhow!(
            "{} exited with {}: {}",
            what,
            output.status,
            tail.into_iter().rev().collect::<Vec<_>>().join(" | ")
        ));
    }
    Ok(text)
}

fn ansi_escape() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\x1b\[[0-9;]*[A-Za-z]").expect("static regex"))
}

/// Metrics from the validation script's marker line, in reported order.
/// `null` entries are left out.
pub fn parse_metrics_json(output: &str) -> Result<ValidationMetrics> {
    let line = output
        .lines()
        .rev()
        .find_map(|line| line.trim_start().strip_prefix(METRICS_MARKER))
        .ok_or_else(|| anyhow!("validation script printed no metrics"))?;
    let pairs: Vec<(String, Option<f64>)> =
        serde_json::from_str(line).context("malformed metrics from validation script")?;
    let mut metrics = ValidationMetrics::new();
    for (key, value) in pairs {
        match value {
            Some(value) => metrics.insert(key, value),
            None => log::warn!("metric {} is not finite; leaving it out", key),
        }
    }
    Ok(metrics)
}

/// Extract box metrics from the `all` row of the validation summary table.
///
/// The row reads `all <images> <instances> <P> <R> <mAP50> <mAP50-95>`, each
/// printed to three significant digits. When several tables are printed the
/// last one wins. Non-finite cells (`nan` on an empty split) are left out.
pub fn parse_val_summary(output: &str) -> Result<ValidationMetrics> {
    let clean = ansi_escape().replace_all(output, "");
    let mut summary: Option<[f64; 4]> = None;
    for line in clean.lines() {
        let mut fields = line.split_whitespace();
        if fields.next() != Some("all") {
            continue;
        }
        let numbers = match fields.map(str::parse::<f64>).collect::<Result<Vec<_>, _>>() {
            Ok(numbers) => numbers,
            Err(_) => continue,
        };
        if numbers.len() != 6 {
            continue;
        }
        summary = Some([numbers[2], numbers[3], numbers[4], numbers[5]]);
    }

    let [precision, recall, map50, map50_95] =
        summary.ok_or_else(|| anyhow!("validation output has no 'all' summary row"))?;
    let entries = [
        (keys::PRECISION, precision),
        (keys::RECALL, recall),
        (keys::MAP50, map50),
        (keys::MAP50_95, map50_95),
        (keys::FITNESS, keys::fitness(map50, map50_95)),
    ];
    let mut metrics = ValidationMetrics::new();
    for (key, value) in entries {
        if value.is_finite() {
            metrics.insert(key, value);
        } else {
            log::warn!("metric {} is not finite; leaving it out", key);
        }
    }
    Ok(metrics)
}

/// Parse `cls xc yc w h conf` label lines (normalized) into pixel boxes.
pub fn parse_label_lines(
    raw: &str,
    width: u32,
    height: u32,
    names: &ClassNames,
) -> Result<Vec<Detection>> {
    let (w, h) = (width as f32, height as f32);
    let mut detections = Vec::new();
    for (lineno, line) in raw.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() != 6 {
            return Err(anyhow!(
                "label line {} has {} fields, expected 6",
                lineno + 1,
                fields.len()
            ));
        }
        let class_id: usize = fields[0]
            .parse()
            .with_context(|| format!("invalid class id on label line {}", lineno + 1))?;
        let mut values = [0f32; 5];
        for (slot, field) in values.iter_mut().zip(&fields[1..]) {
            *slot = field
                .parse()
                .with_context(|| format!("invalid number on label line {}", lineno + 1))?;
        }
        let [xc, yc, bw, bh, confidence] = values;
        detections.push(Detection {
            x1: (xc - bw / 2.0) * w,
            y1: (yc - bh / 2.0) * h,
            x2: (xc + bw / 2.0) * w,
            y2: (yc + bh / 2.0) * h,
            confidence,
            class_id,
            label: names.label(class_id),
        });
    }
    Ok(detections)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::DatasetSplit;

    const VAL_OUTPUT: &str = "\
Ultralytics 8.1.0 Python-3.10 torch-2.1 CUDA:0
Model summary (fused): 218 layers, 25840339 parameters, 0 gradients
\x1b[34m\x1b[1mval: \x1b[0mScanning /data/labels/val.cache... 128 images
                 Class     Images  Instances      Box(P          R      mAP50  mAP50-95)
                   all        128        929       0.64      0.537      0.605      0.446
                 polyp        128        929       0.64      0.537      0.605      0.446
Speed: 0.2ms preprocess, 4.1ms inference, 0.0ms loss, 1.1ms postprocess per image
";

    fn val_cfg(split: DatasetSplit) -> ValidationConfig {
        ValidationConfig {
            weights: "best.pt".into(),
            data: "data.yaml".into(),
            imgsz: 640,
            batch: 16,
            device: "cpu".to_string(),
            split,
        }
    }

    #[test]
    fn parses_summary_row() {
        let metrics = parse_val_summary(VAL_OUTPUT).unwrap();
        assert_eq!(metrics.get(keys::PRECISION), Some(0.64));
        assert_eq!(metrics.get(keys::RECALL), Some(0.537));
        assert_eq!(metrics.get(keys::MAP50), Some(0.605));
        assert_eq!(metrics.get(keys::MAP50_95), Some(0.446));
        assert_eq!(metrics.get(keys::FITNESS), Some(keys::fitness(0.605, 0.446)));
        assert_eq!(metrics.len(), 5);
    }

    #[test]
    fn summary_row_drops_nan_cells() {
        let output = "                   all         12          0        nan        nan          0          0\n";
        let metrics = parse_val_summary(output).unwrap();
        assert_eq!(metrics.get(keys::PRECISION), None);
        assert_eq!(metrics.get(keys::RECALL), None);
        assert_eq!(metrics.get(keys::MAP50), Some(0.0));
        assert_eq!(metrics.get(keys::FITNESS), Some(0.0));
        assert!(metrics.iter().all(|(_, value)| value.is_finite()));
    }

    #[test]
    fn missing_summary_is_an_error() {
        assert!(parse_val_summary("Speed: 1ms\n").is_err());
    }

    #[test]
    fn metrics_json_keeps_order_and_precision() {
        let output = "Ultralytics 8.1.0\n\
            DETKIT_METRICS [[\"metrics/precision(B)\", 0.6412345678901234], \
            [\"metrics/recall(B)\", null], [\"fitness\", 0.4612]]\n\
            Speed: 1ms\n";
        let metrics = parse_metrics_json(output).unwrap();
        let names: Vec<&str> = metrics.iter().map(|(k, _)| k).collect();
        assert_eq!(names, vec![keys::PRECISION, keys::FITNESS]);
        assert_eq!(metrics.get(keys::PRECISION), Some(0.6412345678901234));
    }

    #[test]
    fn metrics_json_requires_marker() {
        assert!(parse_metrics_json("Speed: 1ms\n").is_err());
        assert!(parse_metrics_json("DETKIT_METRICS {not json\n").is_err());
    }

    #[test]
    fn label_lines_become_pixel_boxes() {
        let names = ClassNames::parse("polyp\n");
        let dets = parse_label_lines("0 0.5 0.5 0.25 0.5 0.91\n\n", 640, 640, &names).unwrap();
        assert_eq!(dets.len(), 1);
        let d = &dets[0];
        assert_eq!((d.x1, d.y1, d.x2, d.y2), (240.0, 160.0, 400.0, 480.0));
        assert_eq!(d.label, "polyp");
        assert_eq!(d.confidence, 0.91);
    }

    #[test]
    fn malformed_label_line_is_rejected() {
        let names = ClassNames::default();
        assert!(parse_label_lines("0 0.5 0.5\n", 10, 10, &names).is_err());
    }

    #[test]
    fn predict_requires_weights() {
        let backend = YoloCliBackend::new(DEFAULT_YOLO_BIN);
        assert!(!backend.supports(DetectionCapability::Predict));
        assert!(backend.supports(DetectionCapability::Validate));
        let backend = backend.with_weights("best.pt");
        assert!(backend.supports(DetectionCapability::Predict));
    }

    #[test]
    fn missing_program_fails_to_launch() {
        let mut backend = YoloCliBackend::new("/nonexistent/yolo-binary")
            .with_python("/nonexistent/python-binary");
        let err = backend.validate(&val_cfg(DatasetSplit::Val)).unwrap_err();
        assert!(format!("{:#}", err).contains("failed to launch"));
    }

    /// Stand-ins for the toolkit executables that record their arguments.
    #[cfg(unix)]
    mod fake_toolkit {
        use super::*;
        use std::os::unix::fs::PermissionsExt;

        const FAKE_YOLO: &str = r#"printf '%s\n' "$@" > "$(dirname "$0")/yolo_argv.txt"
case "$2" in
  val)
    echo '                 Class     Images  Instances      Box(P          R      mAP50  mAP50-95)'
    echo '                   all        128        929      0.641      0.537      0.605      0.446'
    ;;
  predict)
    for arg in "$@"; do
      case "$arg" in project=*) project="${arg#project=}" ;; esac
    done
    mkdir -p "$project/predict/labels"
    echo '0 0.5 0.5 0.25 0.5 0.91' > "$project/predict/labels/input.txt"
    ;;
esac
"#;

        const FAKE_PYTHON: &str = r#"shift 2
printf '%s\n' "$@" > "$(dirname "$0")/python_argv.txt"
echo 'Ultralytics 8.1.0'
echo 'DETKIT_METRICS [["metrics/precision(B)", 0.6412345678901234], ["metrics/recall(B)", null], ["fitness", 0.4612]]'
"#;

        const PYTHON_WITHOUT_TOOLKIT: &str = "exit 3\n";

        fn script(dir: &Path, name: &str, body: &str) -> PathBuf {
            let path = dir.join(name);
            let mut text = String::from("#!/bin/sh\n");
            text.push_str(body);
            std::fs::write(&path, text).unwrap();
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
            path
        }

        fn recorded(dir: &Path, name: &str) -> Vec<String> {
            std::fs::read_to_string(dir.join(name))
                .unwrap()
                .lines()
                .map(str::to_string)
                .collect()
        }

        #[test]
        fn validation_script_gets_config_and_full_precision_comes_back() {
            let dir = tempfile::tempdir().unwrap();
            let yolo = script(dir.path(), "yolo", FAKE_YOLO);
            let python = script(dir.path(), "python", FAKE_PYTHON);
            let mut backend = YoloCliBackend::new(yolo).with_python(python);

            let metrics = backend.validate(&val_cfg(DatasetSplit::Train)).unwrap();
            assert_eq!(metrics.get(keys::PRECISION), Some(0.6412345678901234));
            assert_eq!(metrics.get(keys::RECALL), None);
            assert_eq!(metrics.get(keys::FITNESS), Some(0.4612));

            let argv = recorded(dir.path(), "python_argv.txt");
            assert_eq!(
                &argv[..6],
                &[
                    "model=best.pt",
                    "data=data.yaml",
                    "imgsz=640",
                    "batch=16",
                    "device=cpu",
                    "split=train"
                ]
            );
            assert!(argv[6].starts_with("project="));
            assert!(!dir.path().join("yolo_argv.txt").exists());
        }

        #[test]
        fn validation_falls_back_to_summary_table() {
            let dir = tempfile::tempdir().unwrap();
            let yolo = script(dir.path(), "yolo", FAKE_YOLO);
            let python = script(dir.path(), "python", PYTHON_WITHOUT_TOOLKIT);
            let mut backend = YoloCliBackend::new(yolo).with_python(python);

            let metrics = backend.validate(&val_cfg(DatasetSplit::Val)).unwrap();
            assert_eq!(metrics.get(keys::PRECISION), Some(0.641));
            assert_eq!(metrics.len(), 5);

            let argv = recorded(dir.path(), "yolo_argv.txt");
            assert_eq!(
                &argv[..8],
                &[
                    "detect",
                    "val",
                    "model=best.pt",
                    "data=data.yaml",
                    "imgsz=640",
                    "batch=16",
                    "device=cpu",
                    "split=val"
                ]
            );
            assert!(argv.contains(&"plots=False".to_string()));
        }

        #[test]
        fn predict_passes_thresholds_and_reads_label_file() {
            let dir = tempfile::tempdir().unwrap();
            let yolo = script(dir.path(), "yolo", FAKE_YOLO);
            let mut backend = YoloCliBackend::new(yolo)
                .with_weights("weights/best.pt")
                .with_class_names(ClassNames::parse("polyp\n"));

            let image = RgbImage::new(640, 640);
            let config = PredictConfig {
                imgsz: 640,
                conf: 0.4,
                device: "cpu".to_string(),
            };
            let prediction = backend.predict(&image, &config).unwrap();
            assert_eq!(prediction.detections.len(), 1);
            let det = &prediction.detections[0];
            assert_eq!((det.x1, det.y1, det.x2, det.y2), (240.0, 160.0, 400.0, 480.0));
            assert_eq!(det.caption(), "polyp 0.91");

            let argv = recorded(dir.path(), "yolo_argv.txt");
            assert_eq!(&argv[..2], &["detect", "predict"]);
            for expected in [
                "model=weights/best.pt",
                "imgsz=640",
                "conf=0.4",
                "device=cpu",
                "save_txt=True",
                "save_conf=True",
            ] {
                assert!(argv.iter().any(|a| a == expected), "missing {}", expected);
            }
            assert!(argv
                .iter()
                .any(|a| a.starts_with("source=") && a.ends_with("input.png")));
        }

        #[test]
        fn train_hands_over_every_bundle_argument() {
            let dir = tempfile::tempdir().unwrap();
            let yolo = script(dir.path(), "yolo", FAKE_YOLO);
            let mut backend = YoloCliBackend::new(yolo);

            let config = TrainConfig::default();
            backend.train(&config).unwrap();

            let mut expected = vec!["detect".to_string(), "train".to_string()];
            expected.extend(config.args());
            assert_eq!(recorded(dir.path(), "yolo_argv.txt"), expected);
        }
    }
}
