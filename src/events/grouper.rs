//! Temporal clustering of flagged points into events.
//!
//! Points are consumed in ascending time order. A point further than
//! `max_gap` from the end of the open event closes it and starts a new one;
//! otherwise the open event is extended. Points that were not flagged never
//! close an event.
//!
//! With cross-batch merging the latest stored event of the stream (the tail)
//! seeds the open event, so a series that arrives in several requests forms
//! the same events it would have formed in one. Flagged points older than
//! the tail land in the stored event covering them, extend the event just
//! before them, or open an event in the gap.

use std::collections::BTreeMap;

use anyhow::Result;
use chrono::{DateTime, Utc};
use tracing::{debug, info};
use uuid::Uuid;

use super::store::EventStore;
use super::{AnomalyEvent, StreamKey};
use crate::config::{GroupingConfig, MAX_GAP_SECS};
use crate::detect::{DetectionResult, MetricSeries};

fn gap_seconds(secs: u64) -> chrono::Duration {
    chrono::Duration::seconds(secs.min(MAX_GAP_SECS) as i64)
}

/// A point the detector flagged.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FlaggedPoint {
    pub timestamp: DateTime<Utc>,
    pub value: f64,
    pub score: f64,
}

impl FlaggedPoint {
    /// Flagged points of `result`, in series order.
    pub fn collect(series: &MetricSeries, result: &DetectionResult) -> Vec<Self> {
        result
            .flagged()
            .map(|i| Self {
                timestamp: series.points[i].timestamp,
                value: series.points[i].value,
                score: result.scores[i],
            })
            .collect()
    }
}

/// Events touched by one batch.
#[derive(Debug, Default)]
pub struct GroupOutcome {
    /// New, extended and absorbed-into events, ordered by start time.
    pub events: Vec<AnomalyEvent>,
    /// Flagged points at or before the stored tail that no stored event
    /// covered. They extend the preceding event or open one of their own.
    pub late_points: usize,
}

#[derive(Debug, Clone)]
pub struct EventGrouper {
    cfg: GroupingConfig,
}

impl EventGrouper {
    pub fn new(cfg: GroupingConfig) -> Self {
        Self { cfg }
    }

    /// Largest gap between consecutive points of one event for `series`.
    pub fn max_gap(&self, series: &MetricSeries) -> chrono::Duration {
        if let Some(secs) = self.cfg.max_gap_secs {
            return gap_seconds(secs);
        }
        let floor = gap_seconds(self.cfg.min_gap_secs);
        let derived = series
            .median_interval()
            .map(|step| {
                let ms = step
                    .num_milliseconds()
                    .saturating_mul(i64::from(self.cfg.gap_intervals));
                chrono::Duration::milliseconds(ms.min(MAX_GAP_SECS as i64 * 1000))
            })
            .unwrap_or(floor);
        derived.max(floor)
    }

    /// Cluster `points` (ascending) with no stored state.
    pub fn group(
        &self,
        key: &StreamKey,
        method: &str,
        points: &[FlaggedPoint],
        max_gap: chrono::Duration,
    ) -> Vec<AnomalyEvent> {
        cluster(key, method, points, max_gap, None)
    }

    /// Cluster `points` against the stream's stored events.
    ///
    /// Must run while holding the stream's lock; nothing is written here.
    pub fn merge(
        &self,
        store: &dyn EventStore,
        key: &StreamKey,
        method: &str,
        points: &[FlaggedPoint],
        max_gap: chrono::Duration,
    ) -> Result<GroupOutcome> {
        if !self.cfg.merge_across_batches || points.is_empty() {
            return Ok(GroupOutcome {
                events: self.group(key, method, points, max_gap),
                late_points: 0,
            });
        }

        let Some(tail) = store.latest(key)? else {
            return Ok(GroupOutcome {
                events: self.group(key, method, points, max_gap),
                late_points: 0,
            });
        };

        let split = points.partition_point(|p| p.timestamp <= tail.end_time);
        let (stale, fresh) = points.split_at(split);

        // Stale points are placed among the stored events. `touched` holds
        // every stored event changed here plus events opened in gaps.
        let mut touched: BTreeMap<Uuid, AnomalyEvent> = BTreeMap::new();
        let mut late_points = 0;
        for p in stale {
            if let Some(ev) = touched.values_mut().find(|ev| ev.covers(p.timestamp)) {
                ev.absorb(p);
                continue;
            }
            if let Some(mut ev) = store.covering(key, p.timestamp)? {
                ev.absorb(p);
                touched.insert(ev.id, ev);
                continue;
            }

            late_points += 1;
            match preceding(store, key, &touched, p.timestamp)? {
                Some(mut ev) if p.timestamp - ev.end_time <= max_gap => {
                    ev.extend(p);
                    touched.insert(ev.id, ev);
                }
                _ => {
                    let ev = AnomalyEvent::open(key, method, p);
                    touched.insert(ev.id, ev);
                }
            }
        }
        if late_points > 0 {
            info!(
                stream = %key,
                late_points,
                tail_end = %tail.end_time,
                "backfilled flagged points older than the stored tail"
            );
        }

        let tail_absorbed = touched.remove(&tail.id);
        let was_absorbed = tail_absorbed.is_some();
        let open = tail_absorbed.unwrap_or(tail);
        let before = open.clone();
        let mut events = cluster(key, method, fresh, max_gap, Some(open));
        if !was_absorbed && events.first() == Some(&before) {
            // Tail untouched: report only what changed.
            events.remove(0);
        }
        events.extend(touched.into_values());
        events.sort_by_key(|e| e.start_time);

        debug!(stream = %key, events = events.len(), "merged batch with stored events");
        Ok(GroupOutcome {
            events,
            late_points,
        })
    }
}

/// Event that ends last before `ts`, preferring this batch's copy of it.
fn preceding(
    store: &dyn EventStore,
    key: &StreamKey,
    touched: &BTreeMap<Uuid, AnomalyEvent>,
    ts: DateTime<Utc>,
) -> Result<Option<AnomalyEvent>> {
    let stored = store
        .preceding(key, ts)?
        .map(|ev| touched.get(&ev.id).cloned().unwrap_or(ev));
    let local = touched
        .values()
        .filter(|ev| ev.end_time < ts)
        .max_by_key(|ev| ev.end_time)
        .cloned();
    Ok(match (stored, local) {
        (Some(a), Some(b)) => Some(if b.end_time >= a.end_time { b } else { a }),
        (a, b) => a.or(b),
    })
}

/// Core gap rule. A seed, when given, is the initial open event and is always
/// the first event returned.
fn cluster(
    key: &StreamKey,
    method: &str,
    points: &[FlaggedPoint],
    max_gap: chrono::Duration,
    seed: Option<AnomalyEvent>,
) -> Vec<AnomalyEvent> {
    let mut events = Vec::new();
    let mut open = seed;

    for p in points {
        match open.as_mut() {
            Some(ev) if p.timestamp - ev.end_time <= max_gap => ev.extend(p),
            _ => {
                if let Some(done) = open.take() {
                    events.push(done);
                }
                open = Some(AnomalyEvent::open(key, method, p));
            }
        }
    }
    if let Some(done) = open {
        events.push(done);
    }
    events
}
