//! Response shapes.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::detect::{DetectError, Sensitivity};
use crate::events::{AnomalyEvent, Priority};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorBody {
    pub kind: &'static str,
    pub message: String,
}

impl From<&DetectError> for ErrorBody {
    fn from(e: &DetectError) -> Self {
        Self {
            kind: e.kind(),
            message: e.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PointReport {
    pub timestamp: DateTime<Utc>,
    pub value: f64,
    pub score: f64,
    pub is_anomaly: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EventReport {
    pub id: Uuid,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub peak_score: f64,
    pub peak_time: DateTime<Utc>,
    pub peak_value: f64,
    pub average_score: f64,
    pub point_count: u32,
    pub priority: Priority,
    pub priority_score: f64,
}

impl From<&AnomalyEvent> for EventReport {
    fn from(ev: &AnomalyEvent) -> Self {
        Self {
            id: ev.id,
            start: ev.start_time,
            end: ev.end_time,
            peak_score: ev.peak_score,
            peak_time: ev.peak_time,
            peak_value: ev.peak_value,
            average_score: ev.average_score,
            point_count: ev.point_count,
            priority: ev.priority,
            priority_score: ev.priority_score,
        }
    }
}

/// Successful evaluation of one series. Events are ranked, most urgent first.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SeriesOutcome {
    pub resource_id: String,
    pub metric_name: String,
    pub method: String,
    pub total_points: usize,
    pub anomaly_count: usize,
    pub anomaly_percentage: f64,
    pub detection_time_ms: u64,
    pub late_points: usize,
    pub points: Vec<PointReport>,
    pub events: Vec<EventReport>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum SeriesReport {
    Ok(SeriesOutcome),
    Error {
        resource_id: String,
        metric_name: String,
        error: ErrorBody,
    },
    Timeout {
        resource_id: String,
        metric_name: String,
    },
}

impl SeriesReport {
    pub fn failed(resource_id: String, metric_name: String, e: &DetectError) -> Self {
        Self::Error {
            resource_id,
            metric_name,
            error: e.into(),
        }
    }

    pub fn resource_id(&self) -> &str {
        match self {
            Self::Ok(o) => &o.resource_id,
            Self::Error { resource_id, .. } | Self::Timeout { resource_id, .. } => resource_id,
        }
    }

    pub fn as_ok(&self) -> Option<&SeriesOutcome> {
        match self {
            Self::Ok(o) => Some(o),
            _ => None,
        }
    }

    pub fn error_kind(&self) -> Option<&'static str> {
        match self {
            Self::Error { error, .. } => Some(error.kind),
            _ => None,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DetectionResponse {
    pub method: String,
    pub sensitivity: Sensitivity,
    pub total_series: usize,
    pub total_anomalies: usize,
    pub total_events: usize,
    pub detection_time_ms: u64,
    /// One entry per submitted series, in submission order.
    pub results: Vec<SeriesReport>,
}

impl DetectionResponse {
    pub(super) fn assemble(
        method: &str,
        sensitivity: Sensitivity,
        results: Vec<SeriesReport>,
        elapsed: Duration,
    ) -> Self {
        let ok = results.iter().filter_map(SeriesReport::as_ok);
        let (total_anomalies, total_events) = ok.fold((0, 0), |(a, e), o| (a + o.anomaly_count, e + o.events.len()));
        Self {
            method: method.to_string(),
            sensitivity,
            total_series: results.len(),
            total_anomalies,
            total_events,
            detection_time_ms: elapsed.as_millis() as u64,
            results,
        }
    }
}

/// Share of `part` in `total` as a percentage with two decimals.
pub(super) fn percentage(part: usize, total: usize) -> f64 {
    if total == 0 {
        return 0.0;
    }
    (part as f64 / total as f64 * 10_000.0).round() / 100.0
}
