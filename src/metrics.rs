//! Validation metrics merged with training-time metrics.
//!
//! The merge is driven by the validation result: every reported key becomes
//! one `MetricRecord`, in reported order. Training stats only contribute a
//! `train_value` and the derived `overfitting_gap` for keys that validation
//! also reported.

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use serde::ser::{SerializeMap, Serializer};
use serde::{Deserialize, Serialize};

use crate::detect::ValidationMetrics;

/// Metric keys reported by detection validation.
pub mod keys {
    pub const PRECISION: &str = "metrics/precision(B)";
    pub const RECALL: &str = "metrics/recall(B)";
    pub const MAP50: &str = "metrics/mAP50(B)";
    pub const MAP50_95: &str = "metrics/mAP50-95(B)";
    pub const FITNESS: &str = "fitness";

    /// Weighted model fitness used to pick the best checkpoint.
    pub fn fitness(map50: f64, map50_95: f64) -> f64 {
        0.1 * map50 + 0.9 * map50_95
    }
}

pub const NO_DESCRIPTION: &str = "No description available.";

/// Human-readable description of a metric key.
pub fn describe_metric(key: &str) -> &'static str {
    match key {
        keys::PRECISION => {
            "Precision @ IoU=0.50: Fraction of detected boxes that are correct."
        }
        keys::RECALL => "Recall @ IoU=0.50: Fraction of ground-truth boxes detected.",
        keys::MAP50 => "mAP @ IoU=0.50: Mean Average Precision at IoU=0.50.",
        keys::MAP50_95 => "mAP @ IoU=0.50:0.95: Average mAP across IoUs from 0.50 to 0.95.",
        _ => NO_DESCRIPTION,
    }
}

/// Training-time metrics: a flat JSON object of metric key to number.
#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
#[serde(transparent)]
pub struct TrainStats(HashMap<String, f64>);

impl TrainStats {
    pub fn get(&self, key: &str) -> Option<f64> {
        self.0.get(key).copied()
    }
}

impl<K: Into<String>> FromIterator<(K, f64)> for TrainStats {
    fn from_iter<I: IntoIterator<Item = (K, f64)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }
}

/// Load training stats. A missing file is not an error: the report simply
/// carries no training values.
pub fn load_train_stats(path: &Path) -> Result<TrainStats> {
    if !path.exists() {
        log::warn!(
            "train stats not found at {}; overfitting gaps will be empty",
            path.display()
        );
        return Ok(TrainStats::default());
    }
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read train stats {}", path.display()))?;
    let stats = serde_json::from_str(&raw)
        .with_context(|| format!("invalid train stats {}", path.display()))?;
    Ok(stats)
}

/// Persist metrics in the format `load_train_stats` reads. Non-finite values
/// have no JSON number form and are left out.
pub fn write_train_stats(path: &Path, metrics: &ValidationMetrics) -> Result<()> {
    let finite: ValidationMetrics = metrics
        .iter()
        .filter(|(key, value)| {
            if !value.is_finite() {
                log::warn!("not recording non-finite train metric {} ({})", key, value);
            }
            value.is_finite()
        })
        .collect();
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let json = serde_json::to_string_pretty(&finite)?;
    std::fs::write(path, json)
        .with_context(|| format!("failed to write train stats {}", path.display()))?;
    Ok(())
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct MetricRecord {
    pub value: f64,
    pub description: String,
    pub train_value: Option<f64>,
    /// `train_value - value`; absent when there is no training value.
    pub overfitting_gap: Option<f64>,
}

/// Merged metrics in validation order.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct MetricsReport {
    records: Vec<(String, MetricRecord)>,
}

impl MetricsReport {
    pub fn get(&self, key: &str) -> Option<&MetricRecord> {
        self.records.iter().find(|(k, _)| k == key).map(|(_, r)| r)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &MetricRecord)> {
        self.records.iter().map(|(k, r)| (k.as_str(), r))
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

impl Serialize for MetricsReport {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.records.len()))?;
        for (key, record) in &self.records {
            map.serialize_entry(key, record)?;
        }
        map.end()
    }
}

pub fn merge(validation: &ValidationMetrics, train: &TrainStats) -> MetricsReport {
    let records = validation
        .iter()
        .map(|(key, value)| {
            let train_value = train.get(key);
            let record = MetricRecord {
                value,
                description: describe_metric(key).to_string(),
                train_value,
                overfitting_gap: train_value.map(|t| t - value),
            };
            (key.to_string(), record)
        })
        .collect();
    MetricsReport { records }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn describes_known_and_unknown_keys() {
        assert!(describe_metric(keys::MAP50).starts_with("mAP @ IoU=0.50:"));
        assert!(describe_metric(keys::RECALL).starts_with("Recall"));
        assert_eq!(describe_metric(keys::FITNESS), NO_DESCRIPTION);
        assert_eq!(describe_metric(""), NO_DESCRIPTION);
        assert_eq!(describe_metric("metrics/precision(M)"), NO_DESCRIPTION);
    }

    #[test]
    fn gap_is_train_minus_validation() {
        let validation: ValidationMetrics = [(keys::PRECISION, 0.6), (keys::RECALL, 0.5)]
            .into_iter()
            .collect();
        let train: TrainStats = [(keys::PRECISION, 0.9)].into_iter().collect();
        let report = merge(&validation, &train);

        let precision = report.get(keys::PRECISION).unwrap();
        assert_eq!(precision.train_value, Some(0.9));
        assert_eq!(precision.overfitting_gap, Some(0.9 - 0.6));

        let recall = report.get(keys::RECALL).unwrap();
        assert_eq!(recall.train_value, None);
        assert_eq!(recall.overfitting_gap, None);
    }

    #[test]
    fn train_only_keys_are_dropped() {
        let validation: ValidationMetrics = [(keys::MAP50, 0.7)].into_iter().collect();
        let train: TrainStats = [(keys::MAP50, 0.8), ("metrics/extra", 1.0)]
            .into_iter()
            .collect();
        let report = merge(&validation, &train);
        assert_eq!(report.len(), 1);
        assert!(report.get("metrics/extra").is_none());
    }

    #[test]
    fn report_serializes_in_validation_order_with_nulls() {
        let validation: ValidationMetrics = [("z", 1.0), ("a", 2.0)].into_iter().collect();
        let report = merge(&validation, &TrainStats::default());
        let json = serde_json::to_string(&report).unwrap();
        assert_eq!(
            json,
            r#"{"z":{"value":1.0,"description":"No description available.","train_value":null,"overfitting_gap":null},"a":{"value":2.0,"description":"No description available.","train_value":null,"overfitting_gap":null}}"#
        );
    }

    #[test]
    fn non_finite_train_metrics_are_left_out_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run/train_stats.json");
        let metrics: ValidationMetrics = [
            (keys::PRECISION, f64::NAN),
            (keys::RECALL, f64::INFINITY),
            (keys::MAP50, 0.25),
        ]
        .into_iter()
        .collect();
        write_train_stats(&path, &metrics).unwrap();

        let stats = load_train_stats(&path).unwrap();
        assert_eq!(stats.get(keys::MAP50), Some(0.25));
        assert_eq!(stats.get(keys::PRECISION), None);
        assert_eq!(stats.get(keys::RECALL), None);
    }
}
