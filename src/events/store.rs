//! Event persistence seam and per-stream writer locks.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;

use super::{AnomalyEvent, StreamKey};
use crate::detect::Sensitivity;

/// One row of detection history.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DetectionSummary {
    pub resource_id: String,
    pub metric_name: String,
    pub method: String,
    pub sensitivity: Sensitivity,
    pub total_points: usize,
    pub anomaly_count: usize,
    pub event_count: usize,
    pub detection_time_ms: u64,
    pub detected_at: DateTime<Utc>,
}

/// Storage for anomaly events and detection history.
///
/// Calls are blocking; the pipeline issues them from worker threads while
/// holding the stream's lock.
pub trait EventStore: Send + Sync {
    /// Latest event of the stream (greatest end time).
    fn latest(&self, key: &StreamKey) -> Result<Option<AnomalyEvent>>;

    /// Stored event of the stream whose range contains `ts`.
    fn covering(&self, key: &StreamKey, ts: DateTime<Utc>) -> Result<Option<AnomalyEvent>>;

    /// Stored event of the stream that ends last strictly before `ts`.
    fn preceding(&self, key: &StreamKey, ts: DateTime<Utc>) -> Result<Option<AnomalyEvent>>;

    /// Insert or replace by id.
    fn upsert(&self, event: &AnomalyEvent) -> Result<()>;

    /// Number of stored events of the stream that ended before `before`.
    fn prior_count(&self, key: &StreamKey, before: DateTime<Utc>) -> Result<usize>;

    /// Most recent events, newest end time first, optionally for one stream.
    fn recent(&self, key: Option<&StreamKey>, limit: usize) -> Result<Vec<AnomalyEvent>>;

    fn record_detection(&self, summary: &DetectionSummary) -> Result<()>;

    /// Connectivity check for health reporting.
    fn ping(&self) -> Result<()> {
        Ok(())
    }
}

/// Process-local store. Events are kept sorted by start time per stream.
#[derive(Default)]
pub struct MemoryEventStore {
    events: Mutex<BTreeMap<StreamKey, Vec<AnomalyEvent>>>,
    history: Mutex<Vec<DetectionSummary>>,
}

fn poisoned<T>(_: T) -> anyhow::Error {
    anyhow!("event store lock poisoned")
}

impl MemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Recorded detection history, oldest first.
    pub fn detections(&self) -> Result<Vec<DetectionSummary>> {
        Ok(self.history.lock().map_err(poisoned)?.clone())
    }

    fn events(&self) -> Result<MutexGuard<'_, BTreeMap<StreamKey, Vec<AnomalyEvent>>>> {
        self.events.lock().map_err(poisoned)
    }
}

impl EventStore for MemoryEventStore {
    fn latest(&self, key: &StreamKey) -> Result<Option<AnomalyEvent>> {
        Ok(self
            .events()?
            .get(key)
            .and_then(|evs| evs.iter().max_by_key(|e| e.end_time))
            .cloned())
    }

    fn covering(&self, key: &StreamKey, ts: DateTime<Utc>) -> Result<Option<AnomalyEvent>> {
        Ok(self
            .events()?
            .get(key)
            .and_then(|evs| evs.iter().find(|e| e.covers(ts)))
            .cloned())
    }

    fn preceding(&self, key: &StreamKey, ts: DateTime<Utc>) -> Result<Option<AnomalyEvent>> {
        Ok(self
            .events()?
            .get(key)
            .and_then(|evs| evs.iter().filter(|e| e.end_time < ts).max_by_key(|e| e.end_time))
            .cloned())
    }

    fn upsert(&self, event: &AnomalyEvent) -> Result<()> {
        let mut events = self.events()?;
        let stream = events.entry(event.key()).or_default();
        match stream.iter_mut().find(|e| e.id == event.id) {
            Some(existing) => *existing = event.clone(),
            None => stream.push(event.clone()),
        }
        stream.sort_by_key(|e| e.start_time);
        Ok(())
    }

    fn prior_count(&self, key: &StreamKey, before: DateTime<Utc>) -> Result<usize> {
        Ok(self
            .events()?
            .get(key)
            .map_or(0, |evs| evs.iter().filter(|e| e.end_time < before).count()))
    }

    fn recent(&self, key: Option<&StreamKey>, limit: usize) -> Result<Vec<AnomalyEvent>> {
        let events = self.events()?;
        let mut out: Vec<AnomalyEvent> = match key {
            Some(k) => events.get(k).cloned().unwrap_or_default(),
            None => events.values().flatten().cloned().collect(),
        };
        out.sort_by(|a, b| b.end_time.cmp(&a.end_time).then_with(|| a.id.cmp(&b.id)));
        out.truncate(limit);
        Ok(out)
    }

    fn record_detection(&self, summary: &DetectionSummary) -> Result<()> {
        self.history.lock().map_err(poisoned)?.push(summary.clone());
        Ok(())
    }
}

/// Per-stream mutual exclusion for grouping and persistence.
#[derive(Default)]
pub struct StreamLocks {
    locks: Mutex<HashMap<StreamKey, Arc<Mutex<()>>>>,
}

impl StreamLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lock handle for `key`; the same handle for every caller.
    pub fn handle(&self, key: &StreamKey) -> Arc<Mutex<()>> {
        // A panic while the map is held cannot leave it inconsistent.
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        Arc::clone(locks.entry(key.clone()).or_default())
    }

    /// Forget `key`'s lock once no caller holds a handle to it.
    pub fn release(&self, key: &StreamKey) {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        if locks.get(key).is_some_and(|l| Arc::strong_count(l) == 1) {
            locks.remove(key);
        }
    }

    /// Streams with a live lock entry.
    pub fn len(&self) -> usize {
        self.locks.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
