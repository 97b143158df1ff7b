//! Request orchestration: validate, fan series out to the worker pool,
//! group and prioritize, persist, and assemble the ordered response.

mod report;

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::detect::{
    self, DetectError, Detector, DetectorRegistry, Hyperparameters, MetricPoint, MetricSeries, Sensitivity,
    SensitivityResolver,
};
use crate::events::{
    rank, AnomalyEvent, DetectionSummary, EventGrouper, EventStore, FlaggedPoint, PriorityInputs, PriorityScorer, StreamKey,
    StreamLocks,
};

pub use report::{DetectionResponse, ErrorBody, EventReport, PointReport, SeriesOutcome, SeriesReport};

pub const DEFAULT_METHOD: &str = "isolation-forest";

fn default_method() -> String {
    DEFAULT_METHOD.to_string()
}

/// One series as submitted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeriesInput {
    pub resource_id: String,
    pub metric_name: String,
    #[serde(default)]
    pub data: Vec<MetricPoint>,
    /// Business criticality multiplier for this series' events.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub criticality: Option<f64>,
}

impl SeriesInput {
    pub fn new(resource_id: impl Into<String>, metric_name: impl Into<String>, data: Vec<MetricPoint>) -> Self {
        Self {
            resource_id: resource_id.into(),
            metric_name: metric_name.into(),
            data,
            criticality: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectionRequest {
    pub series: Vec<SeriesInput>,
    #[serde(default = "default_method")]
    pub method: String,
    #[serde(default)]
    pub sensitivity: Sensitivity,
}

impl DetectionRequest {
    pub fn new(series: Vec<SeriesInput>, method: impl Into<String>, sensitivity: Sensitivity) -> Self {
        Self {
            series,
            method: method.into(),
            sensitivity,
        }
    }
}

/// Shared, read-only state handed to worker threads.
struct Inner {
    config: Arc<Config>,
    registry: Arc<DetectorRegistry>,
    resolver: SensitivityResolver,
    store: Arc<dyn EventStore>,
    locks: StreamLocks,
    grouper: EventGrouper,
    scorer: PriorityScorer,
    workers: Arc<Semaphore>,
}

/// Detection pipeline. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct Pipeline {
    inner: Arc<Inner>,
}

fn storage_error(e: anyhow::Error) -> DetectError {
    error!(error = %format!("{e:#}"), "event store failure");
    DetectError::Storage(format!("{e:#}"))
}

impl Pipeline {
    pub fn new(
        config: Arc<Config>,
        registry: Arc<DetectorRegistry>,
        store: Arc<dyn EventStore>,
    ) -> anyhow::Result<Self> {
        let resolver = SensitivityResolver::new(&config.sensitivity_table(), &registry)?;
        let inner = Inner {
            resolver,
            store,
            locks: StreamLocks::new(),
            grouper: EventGrouper::new(config.grouping.clone()),
            scorer: PriorityScorer::new(config.priority.clone()),
            workers: Arc::new(Semaphore::new(config.pipeline.workers.max(1))),
            registry,
            config,
        };
        Ok(Self { inner: Arc::new(inner) })
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub fn registry(&self) -> &DetectorRegistry {
        &self.inner.registry
    }

    pub fn store(&self) -> &Arc<dyn EventStore> {
        &self.inner.store
    }

    /// Evaluate every series of `request`.
    ///
    /// Envelope problems and unknown methods reject the whole request. Any
    /// other failure is confined to its series and reported in its slot.
    pub async fn run(&self, request: DetectionRequest) -> Result<DetectionResponse, DetectError> {
        let started = Instant::now();
        let inputs = self.inner.validate(request.series)?;
        let detector = self.inner.registry.get(&request.method)?;
        let method = detector.meta().id;
        let sensitivity = request.sensitivity;
        let params = self.inner.resolver.resolve(method, sensitivity)?;

        let timeout_ms = self.inner.config.pipeline.request_timeout_ms;
        let deadline = tokio::time::Instant::now() + Duration::from_millis(timeout_ms);
        let cancel = CancellationToken::new();

        let ids: Vec<(String, String)> = inputs
            .iter()
            .map(|(s, _)| (s.resource_id.clone(), s.metric_name.clone()))
            .collect();
        let mut slots: Vec<Option<SeriesReport>> = vec![None; inputs.len()];

        let mut tasks = JoinSet::new();
        for (idx, (series, criticality)) in inputs.into_iter().enumerate() {
            let inner = Arc::clone(&self.inner);
            let detector = Arc::clone(&detector);
            let cancel = cancel.clone();
            tasks.spawn(async move {
                let permit = tokio::select! {
                    _ = cancel.cancelled() => return (idx, None),
                    permit = Arc::clone(&inner.workers).acquire_owned() => permit,
                };
                let Ok(permit) = permit else {
                    return (idx, None);
                };

                let (resource_id, metric_name) = (series.resource_id.clone(), series.metric_name.clone());
                // The permit is held by the blocking job itself, so an aborted
                // task does not free a worker slot that is still busy.
                let joined = tokio::task::spawn_blocking(move || {
                    let _permit = permit;
                    inner.evaluate(&series, criticality, detector.as_ref(), sensitivity, &params, &cancel)
                })
                .await;
                let report = joined.unwrap_or_else(|e| {
                    error!(resource_id, metric_name, error = %e, "detector worker panicked");
                    SeriesReport::failed(
                        resource_id,
                        metric_name,
                        &DetectError::computation(method, "worker panicked"),
                    )
                });
                (idx, Some(report))
            });
        }

        let drained = tokio::time::timeout_at(deadline, async {
            while let Some(joined) = tasks.join_next().await {
                match joined {
                    Ok((idx, Some(report))) => slots[idx] = Some(report),
                    Ok((_, None)) => {}
                    Err(e) => error!(error = %e, "detection task failed"),
                }
            }
        })
        .await;
        if drained.is_err() {
            cancel.cancel();
            tasks.abort_all();
            warn!(
                timeout_ms,
                pending = slots.iter().filter(|s| s.is_none()).count(),
                "detection deadline exceeded"
            );
        }

        let results: Vec<SeriesReport> = slots
            .into_iter()
            .zip(ids)
            .map(|(slot, (resource_id, metric_name))| {
                slot.unwrap_or(SeriesReport::Timeout {
                    resource_id,
                    metric_name,
                })
            })
            .collect();

        let response = DetectionResponse::assemble(method, sensitivity, results, started.elapsed());
        info!(
            method,
            %sensitivity,
            series = response.total_series,
            anomalies = response.total_anomalies,
            events = response.total_events,
            elapsed_ms = response.detection_time_ms,
            "detection request completed"
        );
        Ok(response)
    }
}

impl Inner {
    /// Envelope checks; rejects the whole request.
    fn validate(&self, series: Vec<SeriesInput>) -> Result<Vec<(MetricSeries, Option<f64>)>, DetectError> {
        if series.is_empty() {
            return Err(DetectError::InvalidInput("at least one series is required".into()));
        }
        let max = self.config.pipeline.max_series_per_request;
        if series.len() > max {
            return Err(DetectError::InvalidInput(format!(
                "{} series submitted, at most {max} allowed per request",
                series.len()
            )));
        }
        let max_points = self.config.pipeline.max_points_per_series;
        series
            .into_iter()
            .map(|input| {
                if input.data.len() > max_points {
                    return Err(DetectError::InvalidInput(format!(
                        "{}/{}: {} points submitted, at most {max_points} allowed per series",
                        input.resource_id,
                        input.metric_name,
                        input.data.len()
                    )));
                }
                if let Some(c) = input.criticality.filter(|c| !c.is_finite()) {
                    return Err(DetectError::InvalidInput(format!(
                        "{}/{}: criticality must be finite, got {c}",
                        input.resource_id, input.metric_name
                    )));
                }
                let series = MetricSeries::new(input.resource_id, input.metric_name, input.data);
                series.validate()?;
                Ok((series, input.criticality))
            })
            .collect()
    }

    fn evaluate(
        &self,
        series: &MetricSeries,
        criticality: Option<f64>,
        detector: &dyn Detector,
        sensitivity: Sensitivity,
        params: &Hyperparameters,
        cancel: &CancellationToken,
    ) -> SeriesReport {
        let started = Instant::now();
        match self.process(series, criticality, detector, sensitivity, params, cancel, started) {
            Ok(Some(outcome)) => SeriesReport::Ok(outcome),
            Ok(None) => SeriesReport::Timeout {
                resource_id: series.resource_id.clone(),
                metric_name: series.metric_name.clone(),
            },
            Err(e) => {
                warn!(
                    resource_id = %series.resource_id,
                    metric_name = %series.metric_name,
                    kind = e.kind(),
                    error = %e,
                    "series detection failed"
                );
                SeriesReport::failed(series.resource_id.clone(), series.metric_name.clone(), &e)
            }
        }
    }

    /// `Ok(None)` when the request deadline passed before persistence.
    #[allow(clippy::too_many_arguments)]
    fn process(
        &self,
        series: &MetricSeries,
        criticality: Option<f64>,
        detector: &dyn Detector,
        sensitivity: Sensitivity,
        params: &Hyperparameters,
        cancel: &CancellationToken,
        started: Instant,
    ) -> Result<Option<SeriesOutcome>, DetectError> {
        let method = detector.meta().id;
        let result = match detector.detect_until(series, sensitivity, params, cancel) {
            Err(_) if cancel.is_cancelled() => return Ok(None),
            other => other?,
        };
        let flagged = FlaggedPoint::collect(series, &result);
        if cancel.is_cancelled() {
            return Ok(None);
        }

        let key = StreamKey::of(series);
        let max_gap = self.grouper.max_gap(series);
        let base_inputs = PriorityInputs {
            score_range: detector.score_range(),
            criticality: self.scorer.criticality(&series.resource_id, criticality),
            prior_events: 0,
        };

        let grouped = if self.config.grouping.merge_across_batches {
            let handle = self.locks.handle(&key);
            let grouped = self.merge_and_store(&key, method, &flagged, max_gap, &base_inputs, cancel, &handle);
            drop(handle);
            self.locks.release(&key);
            grouped?
        } else {
            let mut events = self.grouper.group(&key, method, &flagged, max_gap);
            for ev in &mut events {
                self.scorer.apply(ev, &base_inputs);
            }
            Some((events, 0))
        };
        let Some((mut events, late_points)) = grouped else {
            return Ok(None);
        };
        rank(&mut events);

        let elapsed_ms = started.elapsed().as_millis() as u64;
        let anomaly_count = result.anomaly_count();
        let summary = DetectionSummary {
            resource_id: series.resource_id.clone(),
            metric_name: series.metric_name.clone(),
            method: method.to_string(),
            sensitivity,
            total_points: series.len(),
            anomaly_count,
            event_count: events.len(),
            detection_time_ms: elapsed_ms,
            detected_at: Utc::now(),
        };
        if let Err(e) = self.store.record_detection(&summary) {
            error!(stream = %key, error = %format!("{e:#}"), "failed to record detection history");
        }

        let points = series
            .points
            .iter()
            .zip(result.scores.iter().zip(&result.flags))
            .map(|(p, (&score, &is_anomaly))| PointReport {
                timestamp: p.timestamp,
                value: p.value,
                score,
                is_anomaly,
                reason: is_anomaly.then(|| detect::reason(method, score, p.value, params)),
            })
            .collect();

        debug!(
            stream = %key,
            method,
            anomalies = anomaly_count,
            events = events.len(),
            late_points,
            elapsed_ms,
            "series evaluated"
        );

        Ok(Some(SeriesOutcome {
            resource_id: series.resource_id.clone(),
            metric_name: series.metric_name.clone(),
            method: method.to_string(),
            total_points: series.len(),
            anomaly_count,
            anomaly_percentage: report::percentage(anomaly_count, series.len()),
            detection_time_ms: elapsed_ms,
            late_points,
            points,
            events: events.iter().map(EventReport::from).collect(),
        }))
    }

    /// Continue the stored events of `key` under its stream lock, score them
    /// and write them back. `Ok(None)` when the deadline passed first.
    #[allow(clippy::too_many_arguments)]
    fn merge_and_store(
        &self,
        key: &StreamKey,
        method: &str,
        flagged: &[FlaggedPoint],
        max_gap: chrono::Duration,
        base_inputs: &PriorityInputs,
        cancel: &CancellationToken,
        handle: &Mutex<()>,
    ) -> Result<Option<(Vec<AnomalyEvent>, usize)>, DetectError> {
        // Nothing guarded by the mutex itself can be left half-written.
        let _guard = handle.lock().unwrap_or_else(|e| e.into_inner());
        let outcome = self
            .grouper
            .merge(self.store.as_ref(), key, method, flagged, max_gap)
            .map_err(storage_error)?;

        let mut events = outcome.events;
        for ev in &mut events {
            let prior_events = self.store.prior_count(key, ev.start_time).map_err(storage_error)?;
            self.scorer.apply(
                ev,
                &PriorityInputs {
                    prior_events,
                    ..*base_inputs
                },
            );
        }
        if cancel.is_cancelled() {
            return Ok(None);
        }
        for ev in &events {
            self.store.upsert(ev).map_err(storage_error)?;
        }
        Ok(Some((events, outcome.late_points)))
    }
}
