//! Anomaly detection: series model, detectors and the sensitivity table.

pub mod forecast;
pub mod isolation_forest;
pub mod lof;
#[cfg(feature = "matrix-profile")]
pub mod matrix_profile;
pub mod moving_average;
pub mod registry;
pub mod sensitivity;
pub mod stats;
pub mod zscore;

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use registry::{Detector, DetectorMeta, DetectorRegistry};
pub use sensitivity::{Hyperparameters, SensitivityResolver};

#[derive(Debug, Clone, Error, PartialEq)]
pub enum DetectError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("insufficient data for {method}: need {needed} points, have {have}")]
    InsufficientData {
        method: String,
        needed: usize,
        have: usize,
    },

    #[error("detection method '{method}' is unavailable: {reason}")]
    DetectorUnavailable { method: String, reason: String },

    #[error("{method} failed: {reason}")]
    Computation { method: String, reason: String },

    #[error("event store failure: {0}")]
    Storage(String),
}

impl DetectError {
    /// Stable machine-readable kind, used in API and per-series error markers.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidInput(_) => "invalid_input",
            Self::InsufficientData { .. } => "insufficient_data",
            Self::DetectorUnavailable { .. } => "detector_unavailable",
            Self::Computation { .. } => "computation",
            Self::Storage(_) => "storage",
        }
    }

    pub(crate) fn computation(method: &str, reason: impl Into<String>) -> Self {
        Self::Computation {
            method: method.to_string(),
            reason: reason.into(),
        }
    }

    pub(crate) fn cancelled(method: &str) -> Self {
        Self::computation(method, "cancelled before completion")
    }
}

/// Ordinal knob: `low` flags the fewest points, `high` the most.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Sensitivity {
    Low,
    #[default]
    Medium,
    High,
}

impl Sensitivity {
    pub const ALL: [Sensitivity; 3] = [Sensitivity::Low, Sensitivity::Medium, Sensitivity::High];
}

impl FromStr for Sensitivity {
    type Err = DetectError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "low" => Ok(Self::Low),
            "medium" => Ok(Self::Medium),
            "high" => Ok(Self::High),
            other => Err(DetectError::InvalidInput(format!(
                "unknown sensitivity '{other}' (expected low/medium/high)"
            ))),
        }
    }
}

impl fmt::Display for Sensitivity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Low => write!(f, "low"),
            Self::Medium => write!(f, "medium"),
            Self::High => write!(f, "high"),
        }
    }
}

/// A single sample of a metric.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MetricPoint {
    pub timestamp: DateTime<Utc>,
    pub value: f64,
}

impl MetricPoint {
    pub fn new(timestamp: DateTime<Utc>, value: f64) -> Self {
        Self { timestamp, value }
    }
}

/// An ordered series for one (resource, metric) stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricSeries {
    pub resource_id: String,
    pub metric_name: String,
    pub points: Vec<MetricPoint>,
}

impl MetricSeries {
    pub fn new(
        resource_id: impl Into<String>,
        metric_name: impl Into<String>,
        points: Vec<MetricPoint>,
    ) -> Self {
        Self {
            resource_id: resource_id.into(),
            metric_name: metric_name.into(),
            points,
        }
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn values(&self) -> Vec<f64> {
        self.points.iter().map(|p| p.value).collect()
    }

    /// Seconds elapsed since the first point, one entry per point.
    pub fn elapsed_secs(&self) -> Vec<f64> {
        let Some(first) = self.points.first() else {
            return Vec::new();
        };
        self.points
            .iter()
            .map(|p| (p.timestamp - first.timestamp).num_milliseconds() as f64 / 1000.0)
            .collect()
    }

    /// Median spacing between consecutive points, if there are at least two.
    pub fn median_interval(&self) -> Option<chrono::Duration> {
        if self.points.len() < 2 {
            return None;
        }
        let mut gaps: Vec<i64> = self
            .points
            .windows(2)
            .map(|w| (w[1].timestamp - w[0].timestamp).num_milliseconds())
            .collect();
        gaps.sort_unstable();
        Some(chrono::Duration::milliseconds(gaps[gaps.len() / 2]))
    }

    /// Check the per-series envelope rules: identifiers present, finite values,
    /// strictly increasing timestamps.
    pub fn validate(&self) -> Result<(), DetectError> {
        if self.resource_id.trim().is_empty() {
            return Err(DetectError::InvalidInput("resource_id is required".into()));
        }
        if self.metric_name.trim().is_empty() {
            return Err(DetectError::InvalidInput(format!(
                "metric_name is required (resource '{}')",
                self.resource_id
            )));
        }
        if let Some(i) = self.points.iter().position(|p| !p.value.is_finite()) {
            return Err(DetectError::InvalidInput(format!(
                "{}/{}: value at index {i} is not finite",
                self.resource_id, self.metric_name
            )));
        }
        if let Some(i) = self
            .points
            .windows(2)
            .position(|w| w[1].timestamp <= w[0].timestamp)
        {
            return Err(DetectError::InvalidInput(format!(
                "{}/{}: timestamps must be strictly increasing (index {})",
                self.resource_id,
                self.metric_name,
                i + 1
            )));
        }
        Ok(())
    }
}

/// Output of one detector evaluation over one series.
///
/// `flags[i]` is exactly `scores[i] > threshold`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DetectionResult {
    pub resource_id: String,
    pub metric_name: String,
    pub method: String,
    pub sensitivity: Sensitivity,
    pub scores: Vec<f64>,
    pub flags: Vec<bool>,
    pub threshold: f64,
}

impl DetectionResult {
    pub fn new(
        series: &MetricSeries,
        method: &str,
        sensitivity: Sensitivity,
        scores: Vec<f64>,
        threshold: f64,
    ) -> Self {
        let flags = scores.iter().map(|&s| s > threshold).collect();
        Self {
            resource_id: series.resource_id.clone(),
            metric_name: series.metric_name.clone(),
            method: method.to_string(),
            sensitivity,
            scores,
            flags,
            threshold,
        }
    }

    pub fn anomaly_count(&self) -> usize {
        self.flags.iter().filter(|&&f| f).count()
    }

    /// Indices of flagged points in ascending order.
    pub fn flagged(&self) -> impl Iterator<Item = usize> + '_ {
        self.flags
            .iter()
            .enumerate()
            .filter_map(|(i, &f)| f.then_some(i))
    }
}

/// Human-readable explanation for a flagged point.
pub fn reason(method: &str, score: f64, value: f64, params: &Hyperparameters) -> String {
    match (method, params) {
        ("z-score", Hyperparameters::Deviation { k }) => format!(
            "value {value:.2} is {:.1} standard deviations from the mean",
            score * k * 2.0
        ),
        ("moving-average", _) => {
            format!("value {value:.2} diverges from the trailing moving average")
        }
        ("prophet", Hyperparameters::Interval { width }) => format!(
            "value {value:.2} falls outside the {:.0}% forecast interval",
            width * 100.0
        ),
        ("matrix-profile", _) => format!("subsequence around {value:.2} is a discord"),
        _ => format!("anomaly score {score:.3}"),
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use chrono::TimeZone;

    /// Series sampled once a minute starting at a fixed instant.
    pub fn minute_series(values: &[f64]) -> MetricSeries {
        let start = Utc.with_ymd_and_hms(2025, 12, 28, 22, 0, 0).unwrap();
        let points = values
            .iter()
            .enumerate()
            .map(|(i, &v)| MetricPoint::new(start + chrono::Duration::minutes(i as i64), v))
            .collect();
        MetricSeries::new("pod-web-001", "cpu", points)
    }
}
