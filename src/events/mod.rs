//! Anomaly events: temporal clusters of flagged points for one stream.

pub mod grouper;
pub mod priority;
pub mod store;

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::detect::MetricSeries;

pub use grouper::{EventGrouper, FlaggedPoint, GroupOutcome};
pub use priority::{rank, PriorityInputs, PriorityScorer};
pub use store::{DetectionSummary, EventStore, MemoryEventStore, StreamLocks};

/// Namespace for deterministic event ids.
const EVENT_NAMESPACE: Uuid = Uuid::from_u128(0x6d657472_6963_7761_7463_686576656e74);

/// Unit of single-writer discipline.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StreamKey {
    pub resource_id: String,
    pub metric_name: String,
}

impl StreamKey {
    pub fn new(resource_id: impl Into<String>, metric_name: impl Into<String>) -> Self {
        Self {
            resource_id: resource_id.into(),
            metric_name: metric_name.into(),
        }
    }

    pub fn of(series: &MetricSeries) -> Self {
        Self::new(series.resource_id.clone(), series.metric_name.clone())
    }
}

impl fmt::Display for StreamKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.resource_id, self.metric_name)
    }
}

/// Urgency bucket, ordered `Low < Medium < High < Critical`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    Medium,
    High,
    Critical,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for Priority {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "low" => Ok(Self::Low),
            "medium" => Ok(Self::Medium),
            "high" => Ok(Self::High),
            "critical" => Ok(Self::Critical),
            other => anyhow::bail!("unknown priority '{other}'"),
        }
    }
}

/// A time-bounded cluster of anomalous points of one stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnomalyEvent {
    pub id: Uuid,
    pub resource_id: String,
    pub metric_name: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub peak_score: f64,
    pub peak_time: DateTime<Utc>,
    pub peak_value: f64,
    pub average_score: f64,
    pub point_count: u32,
    pub contributing_method: String,
    pub priority: Priority,
    pub priority_score: f64,
}

impl AnomalyEvent {
    /// Stable id for the event of `key` that starts at `start`.
    pub fn event_id(key: &StreamKey, start: DateTime<Utc>) -> Uuid {
        let name = format!(
            "{}\u{1f}{}\u{1f}{}",
            key.resource_id,
            key.metric_name,
            start.to_rfc3339_opts(SecondsFormat::Millis, true)
        );
        Uuid::new_v5(&EVENT_NAMESPACE, name.as_bytes())
    }

    /// Start a single-point event. Priority is filled in by the scorer.
    pub fn open(key: &StreamKey, method: &str, point: &FlaggedPoint) -> Self {
        Self {
            id: Self::event_id(key, point.timestamp),
            resource_id: key.resource_id.clone(),
            metric_name: key.metric_name.clone(),
            start_time: point.timestamp,
            end_time: point.timestamp,
            peak_score: point.score,
            peak_time: point.timestamp,
            peak_value: point.value,
            average_score: point.score,
            point_count: 1,
            contributing_method: method.to_string(),
            priority: Priority::Low,
            priority_score: 0.0,
        }
    }

    pub fn key(&self) -> StreamKey {
        StreamKey::new(self.resource_id.clone(), self.metric_name.clone())
    }

    pub fn duration(&self) -> chrono::Duration {
        self.end_time - self.start_time
    }

    pub fn covers(&self, ts: DateTime<Utc>) -> bool {
        self.start_time <= ts && ts <= self.end_time
    }

    /// Append a later point.
    pub fn extend(&mut self, point: &FlaggedPoint) {
        let n = f64::from(self.point_count);
        self.average_score = (self.average_score * n + point.score) / (n + 1.0);
        self.point_count += 1;
        if point.timestamp > self.end_time {
            self.end_time = point.timestamp;
        }
        self.raise_peak(point);
    }

    /// Fold in a point already inside the event's range without counting it
    /// again. Returns whether the peak moved.
    pub fn absorb(&mut self, point: &FlaggedPoint) -> bool {
        self.raise_peak(point)
    }

    fn raise_peak(&mut self, point: &FlaggedPoint) -> bool {
        if point.score > self.peak_score {
            self.peak_score = point.score;
            self.peak_time = point.timestamp;
            self.peak_value = point.value;
            true
        } else {
            false
        }
    }
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;

    #[test]
    fn test_event_id_is_stable() {
        let a = AnomalyEvent::event_id(&key(), at(3));
        let b = AnomalyEvent::event_id(&key(), at(3));
        assert_eq!(a, b);
        assert_ne!(a, AnomalyEvent::event_id(&key(), at(4)));
        assert_ne!(a, AnomalyEvent::event_id(&StreamKey::new("pod-web-002", "cpu"), at(3)));
    }

    #[test]
    fn test_extend_updates_stats() {
        let mut ev = AnomalyEvent::open(&key(), "z-score", &point(0, 0.6));
        ev.extend(&point(2, 0.9));
        ev.extend(&point(3, 0.6));
        assert_eq!(ev.point_count, 3);
        assert_eq!(ev.end_time, at(3));
        assert_eq!(ev.peak_time, at(2));
        assert!((ev.average_score - 0.7).abs() < 1e-12);
        assert_eq!(ev.duration(), chrono::Duration::minutes(3));
    }

    #[test]
    fn test_absorb_does_not_count() {
        let mut ev = AnomalyEvent::open(&key(), "z-score", &point(0, 0.6));
        ev.extend(&point(4, 0.7));
        assert!(ev.absorb(&point(2, 0.95)));
        assert!(!ev.absorb(&point(3, 0.5)));
        assert_eq!(ev.point_count, 2);
        assert_eq!(ev.peak_time, at(2));
    }

    #[test]
    fn test_priority_order() {
        assert!(Priority::Low < Priority::Medium);
        assert!(Priority::High < Priority::Critical);
        assert_eq!("critical".parse::<Priority>().unwrap(), Priority::Critical);
        assert_eq!(serde_json::to_string(&Priority::High).unwrap(), "\"high\"");
    }
}
