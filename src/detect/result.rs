use image::RgbImage;
use serde::ser::{Serialize, SerializeMap, Serializer};

use crate::overlay;

/// One detected object in pixel coordinates of the image it was predicted on.
#[derive(Clone, Debug, PartialEq)]
pub struct Detection {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
    pub confidence: f32,
    pub class_id: usize,
    pub label: String,
}

impl Detection {
    pub fn area(&self) -> f32 {
        (self.x2 - self.x1).max(0.0) * (self.y2 - self.y1).max(0.0)
    }

    pub fn intersection(&self, other: &Detection) -> f32 {
        let x1 = self.x1.max(other.x1);
        let y1 = self.y1.max(other.y1);
        let x2 = self.x2.min(other.x2);
        let y2 = self.y2.min(other.y2);
        (x2 - x1).max(0.0) * (y2 - y1).max(0.0)
    }

    pub fn iou(&self, other: &Detection) -> f32 {
        let union = self.area() + other.area() - self.intersection(other);
        if union <= 0.0 {
            return 0.0;
        }
        self.intersection(other) / union
    }

    /// Caption drawn above the box, e.g. `polyp 0.87`.
    pub fn caption(&self) -> String {
        format!("{} {:.2}", self.label, self.confidence)
    }
}

/// Result of one prediction call.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Prediction {
    pub detections: Vec<Detection>,
}

impl Prediction {
    pub fn new(detections: Vec<Detection>) -> Self {
        Self { detections }
    }

    pub fn is_empty(&self) -> bool {
        self.detections.is_empty()
    }

    /// Render boxes and labels onto a copy of `image`.
    pub fn plot(&self, image: &RgbImage) -> RgbImage {
        let mut canvas = image.clone();
        for det in &self.detections {
            overlay::draw_detection(&mut canvas, det);
        }
        canvas
    }
}

/// Scalar metrics keyed by name, in the order the backend reported them.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ValidationMetrics {
    entries: Vec<(String, f64)>,
}

impl ValidationMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a metric. Replacing keeps the original position.
    pub fn insert(&mut self, key: impl Into<String>, value: f64) {
        let key = key.into();
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((key, value)),
        }
    }

    pub fn get(&self, key: &str) -> Option<f64> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| *v)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), *v))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<K: Into<String>> FromIterator<(K, f64)> for ValidationMetrics {
    fn from_iter<I: IntoIterator<Item = (K, f64)>>(iter: I) -> Self {
        let mut metrics = ValidationMetrics::new();
        for (k, v) in iter {
            metrics.insert(k, v);
        }
        metrics
    }
}

impl Serialize for ValidationMetrics {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.entries.len()))?;
        for (key, value) in &self.entries {
            map.serialize_entry(key, value)?;
        }
        map.end()
    }
}
