//! Report writer: the merged metrics as a nested JSON document and as a flat
//! CSV table with one row per metric.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Serialize;

use crate::detect::{BackendRegistry, ValidationConfig};
use crate::metrics::{self, MetricsReport};

pub const DEFAULT_RESULTS_DIR: &str = "results";
pub const JSON_REPORT_NAME: &str = "val_stats_detailed.json";
pub const CSV_REPORT_NAME: &str = "val_stats_detailed.csv";
pub const CSV_HEADER: [&str; 5] = [
    "metric",
    "value",
    "train_value",
    "overfitting_gap",
    "description",
];

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReportPaths {
    pub json: PathBuf,
    pub csv: PathBuf,
}

impl ReportPaths {
    pub fn in_dir(dir: &Path) -> Self {
        Self {
            json: dir.join(JSON_REPORT_NAME),
            csv: dir.join(CSV_REPORT_NAME),
        }
    }
}

/// Write both report files under `dir`, creating it if needed.
pub fn write_report(dir: &Path, report: &MetricsReport) -> Result<ReportPaths> {
    std::fs::create_dir_all(dir)
        .with_context(|| format!("failed to create results directory {}", dir.display()))?;
    let paths = ReportPaths::in_dir(dir);

    std::fs::write(&paths.json, render_json(report)?)
        .with_context(|| format!("failed to write {}", paths.json.display()))?;
    std::fs::write(&paths.csv, render_csv(report))
        .with_context(|| format!("failed to write {}", paths.csv.display()))?;

    log::info!(
        "wrote {} metrics to {} and {}",
        report.len(),
        paths.json.display(),
        paths.csv.display()
    );
    Ok(paths)
}

/// Validate, merge with training stats and write both report files.
pub fn run_val_report(
    registry: &BackendRegistry,
    validation: &ValidationConfig,
    train_stats_path: &Path,
    results_dir: &Path,
) -> Result<(MetricsReport, ReportPaths)> {
    let train_stats = metrics::load_train_stats(train_stats_path)?;
    let val_stats = registry.validate(validation)?;
    let report = metrics::merge(&val_stats, &train_stats);
    let paths = write_report(results_dir, &report)?;
    Ok((report, paths))
}

/// Pretty JSON with four-space indentation.
pub fn render_json(report: &MetricsReport) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
    let mut ser = serde_json::Serializer::with_formatter(&mut buf, formatter);
    report.serialize(&mut ser)?;
    Ok(buf)
}

pub fn render_csv(report: &MetricsReport) -> String {
    let mut out = CSV_HEADER.join(",");
    out.push('\n');
    for (key, record) in report.iter() {
        let row = [
            csv_field(key),
            format_number(Some(record.value)),
            format_number(record.train_value),
            format_number(record.overfitting_gap),
            csv_field(&record.description),
        ];
        out.push_str(&row.join(","));
        out.push('\n');
    }
    out
}

/// Shortest round-trip float text; absent values become empty cells.
fn format_number(value: Option<f64>) -> String {
    match value {
        Some(v) => format!("{:?}", v),
        None => String::new(),
    }
}

fn csv_field(raw: &str) -> String {
    if raw.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", raw.replace('"', "\"\""))
    } else {
        raw.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::ValidationMetrics;
    use crate::metrics::{keys, merge, TrainStats};

    #[test]
    fn csv_quotes_only_when_needed() {
        assert_eq!(csv_field("metrics/mAP50(B)"), "metrics/mAP50(B)");
        assert_eq!(csv_field("a,b"), "\"a,b\"");
        assert_eq!(csv_field("say \"hi\""), "\"say \"\"hi\"\"\"");
    }

    #[test]
    fn csv_rows_follow_report_order() {
        let validation: ValidationMetrics = [(keys::RECALL, 0.5), (keys::PRECISION, 0.25)]
            .into_iter()
            .collect();
        let train: TrainStats = [(keys::PRECISION, 0.75)].into_iter().collect();
        let csv = render_csv(&merge(&validation, &train));
        let lines: Vec<&str> = csv.lines().collect();
        assert_eq!(lines[0], "metric,value,train_value,overfitting_gap,description");
        assert_eq!(
            lines[1],
            "metrics/recall(B),0.5,,,Recall @ IoU=0.50: Fraction of ground-truth boxes detected."
        );
        assert_eq!(
            lines[2],
            "metrics/precision(B),0.25,0.75,0.5,Precision @ IoU=0.50: Fraction of detected boxes that are correct."
        );
        assert_eq!(lines.len(), 3);
    }

    #[test]
    fn json_uses_four_space_indent() {
        let validation: ValidationMetrics = [("k", 1.5)].into_iter().collect();
        let json = render_json(&merge(&validation, &TrainStats::default())).unwrap();
        let text = String::from_utf8(json).unwrap();
        assert!(text.starts_with("{\n    \"k\": {\n        \"value\": 1.5,"));
    }
}
