//! Composite priority scoring and ranking of events.
//!
//! ```text
//! base      = (w_peak * peak + w_count * count + w_duration * duration) / sum(w)
//! composite = clamp(base * support * criticality * history, 0, 1)
//! ```

use super::{AnomalyEvent, Priority};
use crate::config::PriorityConfig;

/// Per-event context the scorer cannot derive from the event itself.
#[derive(Debug, Clone, Copy)]
pub struct PriorityInputs {
    /// Score range of the contributing method.
    pub score_range: (f64, f64),
    pub criticality: f64,
    /// Stored events of the stream that ended before this one started.
    pub prior_events: usize,
}

impl Default for PriorityInputs {
    fn default() -> Self {
        Self {
            score_range: (0.0, 1.0),
            criticality: 1.0,
            prior_events: 0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PriorityScorer {
    cfg: PriorityConfig,
}

impl PriorityScorer {
    pub fn new(cfg: PriorityConfig) -> Self {
        Self { cfg }
    }

    /// Effective criticality: the request's value, else the configured
    /// per-resource value, else 1.0. Always within `[0, 2]`.
    pub fn criticality(&self, resource_id: &str, requested: Option<f64>) -> f64 {
        requested
            .unwrap_or_else(|| self.cfg.criticality_for(resource_id))
            .clamp(0.0, 2.0)
    }

    pub fn composite(&self, event: &AnomalyEvent, inputs: &PriorityInputs) -> f64 {
        let c = &self.cfg;
        let (lo, hi) = inputs.score_range;
        let peak = if hi > lo {
            ((event.peak_score - lo) / (hi - lo)).clamp(0.0, 1.0)
        } else {
            0.0
        };
        let count = (f64::from(event.point_count) / f64::from(c.count_saturation)).min(1.0);
        let secs = event.duration().num_milliseconds() as f64 / 1000.0;
        let duration = (secs / c.duration_saturation_secs as f64).clamp(0.0, 1.0);

        let weights = c.w_peak + c.w_count + c.w_duration;
        let base = (c.w_peak * peak + c.w_count * count + c.w_duration * duration) / weights;

        let support = if event.point_count < c.min_support {
            c.low_support_factor
        } else {
            1.0
        };
        let history = 1.0
            + c.history_weight * (inputs.prior_events as f64 / f64::from(c.history_saturation)).min(1.0);

        (base * support * inputs.criticality * history).clamp(0.0, 1.0)
    }

    pub fn bucket(&self, score: f64) -> Priority {
        if score >= self.cfg.critical {
            Priority::Critical
        } else if score >= self.cfg.high {
            Priority::High
        } else if score >= self.cfg.medium {
            Priority::Medium
        } else {
            Priority::Low
        }
    }

    /// Recompute the event's score and bucket.
    pub fn apply(&self, event: &mut AnomalyEvent, inputs: &PriorityInputs) {
        event.priority_score = self.composite(event, inputs);
        event.priority = self.bucket(event.priority_score);
    }
}

/// Most urgent first: composite, then peak, then duration (all descending),
/// then earliest start.
pub fn rank(events: &mut [AnomalyEvent]) {
    events.sort_by(|a, b| {
        b.priority_score
            .total_cmp(&a.priority_score)
            .then_with(|| b.peak_score.total_cmp(&a.peak_score))
            .then_with(|| b.duration().cmp(&a.duration()))
            .then_with(|| a.start_time.cmp(&b.start_time))
    });
}
